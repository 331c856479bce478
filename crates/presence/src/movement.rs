use shared::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Accepted(Position),
    /// Carries the unchanged position so the client can resynchronize.
    Rejected(Position),
}

impl MoveOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, MoveOutcome::Accepted(_))
    }

    pub fn position(&self) -> Position {
        match self {
            MoveOutcome::Accepted(p) | MoveOutcome::Rejected(p) => *p,
        }
    }
}

pub fn manhattan_distance(from: Position, to: Position) -> u64 {
    from.x.abs_diff(to.x).saturating_add(from.y.abs_diff(to.y))
}

/// Exactly one orthogonal step is legal. Standing still, diagonals and
/// multi-tile jumps are all rejected.
pub fn validate_move(current: Position, requested: Position) -> MoveOutcome {
    if manhattan_distance(current, requested) == 1 {
        MoveOutcome::Accepted(requested)
    } else {
        MoveOutcome::Rejected(current)
    }
}

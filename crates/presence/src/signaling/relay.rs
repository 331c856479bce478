use super::negotiator::{NegotiationError, NegotiatorFactory, PeerNegotiation};
use crate::registry::ConnectionRegistry;
use shared::{
    events, IceCandidatePayload, SdpPayload, ServerEnvelope, SessionId, SignalMessage,
};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("negotiation session not found for {0}")]
    NotFound(SessionId),
    #[error("invalid signaling payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    AwaitingAnswer,
    Established,
    Closed,
}

struct NegotiationState {
    peer: Arc<dyn PeerNegotiation>,
    phase: NegotiationPhase,
    /// Task relaying locally gathered candidates; aborted on shutdown.
    forwarder: Option<JoinHandle<()>>,
}

/// One negotiation context. Its own mutex serializes answer/candidate/close
/// for this session without touching the registry lock.
pub struct NegotiationSession {
    state: Mutex<NegotiationState>,
}

impl NegotiationSession {
    pub async fn phase(&self) -> NegotiationPhase {
        self.state.lock().await.phase
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.phase == NegotiationPhase::Closed {
            return;
        }
        state.phase = NegotiationPhase::Closed;
        if let Some(forwarder) = state.forwarder.take() {
            forwarder.abort();
        }
        if let Err(e) = state.peer.close().await {
            warn!(error = %e, "failed to close peer negotiation");
        }
    }
}

pub struct SignalingRelay {
    registry: Arc<ConnectionRegistry>,
    factory: Arc<dyn NegotiatorFactory>,
    sessions: RwLock<HashMap<SessionId, Arc<NegotiationSession>>>,
}

impl SignalingRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, factory: Arc<dyn NegotiatorFactory>) -> Self {
        Self {
            registry,
            factory,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Build an answer for the offer and send it to the offer's sender.
    /// Replaces any earlier context for `session_id` once setup succeeds.
    #[instrument(skip(self, message), fields(sender_id = %message.sender_id))]
    pub async fn handle_offer(
        &self,
        session_id: &str,
        message: SignalMessage,
    ) -> Result<(), SignalingError> {
        let offer: SdpPayload = serde_json::from_value(message.payload)?;
        let remote_party = message.sender_id;

        let peer = self.factory.create().await?;
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let answer = match Self::answer_offer(peer.as_ref(), offer, candidate_tx).await {
            Ok(answer) => answer,
            Err(e) => {
                if let Err(close_err) = peer.close().await {
                    warn!(error = %close_err, "failed to close aborted negotiation");
                }
                return Err(e);
            }
        };

        let negotiation = Arc::new(NegotiationSession {
            state: Mutex::new(NegotiationState {
                peer,
                phase: NegotiationPhase::AwaitingAnswer,
                forwarder: None,
            }),
        });
        let previous = self
            .sessions
            .write()
            .await
            .insert(session_id.to_string(), Arc::clone(&negotiation));
        if let Some(previous) = previous {
            debug!(session_id, "replacing previous negotiation");
            previous.shutdown().await;
        }

        let answer = serde_json::to_value(answer)?;
        self.forward(session_id, &remote_party, events::WEBRTC_ANSWER, "answer", answer)
            .await;

        // Candidates gathered before the answer went out are queued in the
        // channel, so the remote party always sees the answer first.
        let forwarder = tokio::spawn(forward_candidates(
            Arc::clone(&self.registry),
            session_id.to_string(),
            remote_party,
            candidate_rx,
        ));
        let mut state = negotiation.state.lock().await;
        if state.phase == NegotiationPhase::Closed {
            // Closed while the answer was going out.
            forwarder.abort();
        } else {
            state.forwarder = Some(forwarder);
        }
        drop(state);
        info!(session_id, "negotiation awaiting answer");
        Ok(())
    }

    async fn answer_offer(
        peer: &dyn PeerNegotiation,
        offer: SdpPayload,
        candidates: mpsc::UnboundedSender<IceCandidatePayload>,
    ) -> Result<SdpPayload, SignalingError> {
        peer.set_remote_description(offer).await?;
        let answer = peer.create_answer().await?;
        // Register before setting the local description; that is what starts gathering.
        peer.on_ice_candidate(Box::new(move |candidate| {
            let _ = candidates.send(candidate);
        }));
        peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    pub async fn handle_answer(
        &self,
        session_id: &str,
        message: SignalMessage,
    ) -> Result<(), SignalingError> {
        let answer: SdpPayload = serde_json::from_value(message.payload)?;
        let negotiation = self.active(session_id).await?;
        let mut state = negotiation.state.lock().await;
        if state.phase == NegotiationPhase::Closed {
            return Err(SignalingError::NotFound(session_id.to_string()));
        }
        state.peer.set_remote_description(answer).await?;
        state.phase = NegotiationPhase::Established;
        debug!(session_id, "negotiation established");
        Ok(())
    }

    pub async fn handle_ice_candidate(
        &self,
        session_id: &str,
        message: SignalMessage,
    ) -> Result<(), SignalingError> {
        let candidate: IceCandidatePayload = serde_json::from_value(message.payload)?;
        let negotiation = self.active(session_id).await?;
        let state = negotiation.state.lock().await;
        if state.phase == NegotiationPhase::Closed {
            return Err(SignalingError::NotFound(session_id.to_string()));
        }
        state.peer.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// Tear down the context for `session_id`, if any. Safe to call repeatedly.
    pub async fn close(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(negotiation) = removed {
            negotiation.shutdown().await;
            info!(session_id, "negotiation closed");
        }
    }

    pub async fn phase(&self, session_id: &str) -> Option<NegotiationPhase> {
        let negotiation = self.sessions.read().await.get(session_id).cloned()?;
        Some(negotiation.phase().await)
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn active(&self, session_id: &str) -> Result<Arc<NegotiationSession>, SignalingError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SignalingError::NotFound(session_id.to_string()))
    }

    async fn forward(&self, from: &str, to: &str, event_type: &str, kind: &str, payload: Value) {
        relay_to(&self.registry, from, to, event_type, kind, payload).await;
    }
}

async fn forward_candidates(
    registry: Arc<ConnectionRegistry>,
    from: SessionId,
    to: SessionId,
    mut candidates: mpsc::UnboundedReceiver<IceCandidatePayload>,
) {
    // Ends when the peer connection, and with it the callback, is dropped.
    while let Some(candidate) = candidates.recv().await {
        match serde_json::to_value(candidate) {
            Ok(payload) => {
                relay_to(&registry, &from, &to, events::WEBRTC_CANDIDATE, "candidate", payload)
                    .await;
            }
            Err(e) => warn!(error = %e, "failed to encode ICE candidate"),
        }
    }
    debug!(session_id = %from, "candidate forwarding finished");
}

/// Push a signaling envelope to `to`. An absent target is logged and dropped.
async fn relay_to(
    registry: &ConnectionRegistry,
    from: &str,
    to: &str,
    event_type: &str,
    kind: &str,
    payload: Value,
) -> bool {
    let Some(target) = registry.lookup(to).await else {
        warn!(sender_id = from, target_id = to, event_type, "signaling target not connected, dropping");
        return false;
    };
    let envelope = ServerEnvelope::ok(
        event_type,
        SignalMessage {
            kind: kind.to_string(),
            sender_id: from.to_string(),
            target_id: to.to_string(),
            payload,
        },
    );
    match target.send(&envelope) {
        Ok(()) => true,
        Err(e) => {
            warn!(sender_id = from, target_id = to, event_type, error = %e, "failed to relay signaling message");
            false
        }
    }
}

pub mod negotiator;
pub mod relay;

pub use negotiator::{NegotiatorFactory, PeerNegotiation, WebRtcNegotiatorFactory};
pub use relay::{NegotiationPhase, SignalingError, SignalingRelay};

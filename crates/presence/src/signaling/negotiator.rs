//! Seam between the relay and the peer-connection library.

use async_trait::async_trait;
use shared::{IceCandidatePayload, SdpPayload};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("unsupported sdp type: {0}")]
    UnsupportedSdpType(String),
}

/// Invoked for every locally gathered network candidate.
pub type CandidateCallback = Box<dyn Fn(IceCandidatePayload) + Send + Sync>;

#[async_trait]
pub trait PeerNegotiation: Send + Sync {
    async fn set_remote_description(&self, description: SdpPayload) -> Result<(), NegotiationError>;
    async fn create_answer(&self) -> Result<SdpPayload, NegotiationError>;
    async fn set_local_description(&self, description: SdpPayload) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), NegotiationError>;
    fn on_ice_candidate(&self, callback: CandidateCallback);
    async fn close(&self) -> Result<(), NegotiationError>;
}

#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerNegotiation>, NegotiationError>;
}

/// Builds `webrtc` peer connections configured with the given STUN servers.
pub struct WebRtcNegotiatorFactory {
    api: API,
    stun_urls: Vec<String>,
}

impl WebRtcNegotiatorFactory {
    pub fn new(stun_urls: Vec<String>) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, stun_urls })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_urls.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl NegotiatorFactory for WebRtcNegotiatorFactory {
    async fn create(&self) -> Result<Arc<dyn PeerNegotiation>, NegotiationError> {
        let peer_connection = self.api.new_peer_connection(self.configuration()).await?;
        Ok(Arc::new(WebRtcNegotiation {
            peer_connection: Arc::new(peer_connection),
        }))
    }
}

struct WebRtcNegotiation {
    peer_connection: Arc<RTCPeerConnection>,
}

fn to_rtc_description(description: SdpPayload) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match description.sdp_type.as_str() {
        "offer" => RTCSessionDescription::offer(description.sdp)?,
        "answer" => RTCSessionDescription::answer(description.sdp)?,
        "pranswer" => RTCSessionDescription::pranswer(description.sdp)?,
        other => return Err(NegotiationError::UnsupportedSdpType(other.to_string())),
    };
    Ok(parsed)
}

#[async_trait]
impl PeerNegotiation for WebRtcNegotiation {
    async fn set_remote_description(&self, description: SdpPayload) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)?;
        self.peer_connection.set_remote_description(description).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<SdpPayload, NegotiationError> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(SdpPayload {
            sdp_type: answer.sdp_type.to_string(),
            sdp: answer.sdp,
        })
    }

    async fn set_local_description(&self, description: SdpPayload) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)?;
        self.peer_connection.set_local_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), NegotiationError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    fn on_ice_candidate(&self, callback: CandidateCallback) {
        let callback = Arc::new(callback);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let callback = Arc::clone(&callback);
                Box::pin(async move {
                    // None marks the end of gathering.
                    let Some(candidate) = candidate else {
                        debug!("ICE gathering complete");
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => callback(IceCandidatePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                        Err(e) => warn!(error = %e, "failed to encode local ICE candidate"),
                    }
                })
            }));
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

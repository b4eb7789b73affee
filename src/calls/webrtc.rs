//! Transport sessions backed by `webrtc` peer connections.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::transport::{
    ConnectivityState, DescriptionKind, IceCandidate, SessionDescription, TransportEvent,
    TransportEvents, TransportFactory, TransportSession,
};
use super::types::SessionId;

/// Label of the data channel that gives the offer something to negotiate.
const DATA_CHANNEL_NAME: &str = "negotiation";

#[derive(Debug, Clone, Default)]
pub struct WebRtcTransportConfig {
    /// STUN/TURN urls.
    pub ice_servers: Vec<String>,
    /// Gather relay candidates only.
    pub force_turn: bool,
}

pub struct WebRtcTransportFactory {
    config: WebRtcTransportConfig,
}

impl WebRtcTransportFactory {
    pub fn new(config: WebRtcTransportConfig) -> Self {
        Self { config }
    }

    async fn create_api() -> anyhow::Result<webrtc::api::API> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_multicast_dns_mode(webrtc::ice::mdns::MulticastDnsMode::Disabled);

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        session: &SessionId,
        events: TransportEvents,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let api = Self::create_api().await?;
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ice_transport_policy: if self.config.force_turn {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);
        peer_connection
            .create_data_channel(DATA_CHANNEL_NAME, None)
            .await?;

        let candidate_events = events.clone();
        let label = session.to_string();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            let label = label.clone();
            Box::pin(async move {
                let candidate = match candidate.map(|c| c.to_json()).transpose() {
                    Ok(candidate) => candidate.map(from_candidate_init),
                    Err(e) => {
                        warn!(target: "Call/WebRtc", "{label}: unreadable local candidate: {e}");
                        return;
                    }
                };
                let _ = events.send(TransportEvent::LocalCandidate(candidate));
            })
        }));

        let label = session.to_string();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let events = events.clone();
                let label = label.clone();
                Box::pin(async move {
                    info!(target: "Call/WebRtc", "{label}: ICE connection state {state}");
                    let _ = events.send(TransportEvent::ConnectivityChanged(
                        connectivity_from(state),
                    ));
                })
            },
        ));

        debug!(target: "Call/WebRtc", "{session}: peer connection created");
        Ok(Arc::new(WebRtcSession { peer_connection }))
    }
}

pub struct WebRtcSession {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> anyhow::Result<()> {
        self.peer_connection
            .set_local_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> anyhow::Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await?;
        Ok(())
    }

    fn connectivity_state(&self) -> ConnectivityState {
        connectivity_from(self.peer_connection.ice_connection_state())
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            warn!(target: "Call/WebRtc", "failed to close peer connection: {e}");
        }
    }
}

fn to_rtc(description: &SessionDescription) -> anyhow::Result<RTCSessionDescription> {
    let sdp = description.sdp.clone();
    Ok(match description.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(sdp)?,
        DescriptionKind::Answer => RTCSessionDescription::answer(sdp)?,
    })
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn connectivity_from(state: RTCIceConnectionState) -> ConnectivityState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => ConnectivityState::New,
        RTCIceConnectionState::Checking => ConnectivityState::Checking,
        RTCIceConnectionState::Connected => ConnectivityState::Connected,
        RTCIceConnectionState::Completed => ConnectivityState::Completed,
        RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCIceConnectionState::Failed => ConnectivityState::Failed,
        RTCIceConnectionState::Closed => ConnectivityState::Closed,
    }
}

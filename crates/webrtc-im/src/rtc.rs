//! Real WebRTC peer connection factory
//!
//! Wraps the webrtc crate to implement [`PeerConnectionFactory`] for
//! production use. Callbacks from the underlying connection are forwarded
//! into the session's [`EventSink`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::connection::{
    EventSink, NegotiationError, PeerConnection, PeerConnectionFactory, PrimitiveEvent,
    PrimitiveState,
};
use crate::protocol::ChannelFrame;
use crate::types::{
    IceCandidate, IceServer, SdpKind, SessionDescription, DATA_CHANNEL_LABEL, MAX_RETRANSMITS,
};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

fn map_state(s: RTCPeerConnectionState) -> PrimitiveState {
    match s {
        RTCPeerConnectionState::Connecting => PrimitiveState::Connecting,
        RTCPeerConnectionState::Connected => PrimitiveState::Connected,
        RTCPeerConnectionState::Disconnected => PrimitiveState::Disconnected,
        RTCPeerConnectionState::Failed => PrimitiveState::Failed,
        RTCPeerConnectionState::Closed => PrimitiveState::Closed,
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PrimitiveState::New,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
}

fn to_rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

/// Peer connection backed by the webrtc crate
pub struct RtcPeerConnection {
    connection: Arc<RTCPeerConnection>,
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    sink: EventSink,
}

impl RtcPeerConnection {
    /// Wire the data channel callbacks into the sink
    fn attach_channel(dc: &Arc<RTCDataChannel>, sink: &EventSink) {
        let open_sink = sink.clone();
        dc.on_open(Box::new(move || {
            let sink = open_sink.clone();
            Box::pin(async move {
                sink.emit(PrimitiveEvent::ChannelOpen);
            })
        }));

        let close_sink = sink.clone();
        dc.on_close(Box::new(move || {
            let sink = close_sink.clone();
            Box::pin(async move {
                sink.emit(PrimitiveEvent::ChannelClose);
            })
        }));

        let message_sink = sink.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = message_sink.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    ChannelFrame::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    ChannelFrame::Binary(msg.data)
                };
                sink.emit(PrimitiveEvent::Message(frame));
            })
        }));
    }

    fn setup_handlers(&self) {
        let sink = self.sink.clone();
        self.connection
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    debug!("Connection state (epoch {}): {:?}", sink.epoch(), s);
                    sink.emit(PrimitiveEvent::StateChange(map_state(s)));
                })
            }));

        let sink = self.sink.clone();
        self.connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(json) => {
                            sink.emit(PrimitiveEvent::LocalCandidate(IceCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_m_line_index: json.sdp_mline_index,
                                username_fragment: json.username_fragment,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        // Answerer side: the offerer's channel arrives here
        let sink = self.sink.clone();
        let data_channel = self.data_channel.clone();
        self.connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = sink.clone();
            let data_channel = data_channel.clone();
            Box::pin(async move {
                if dc.label() != DATA_CHANNEL_LABEL {
                    debug!("Ignoring data channel {}", dc.label());
                    return;
                }
                Self::attach_channel(&dc, &sink);
                *data_channel.write().await = Some(dc);
            })
        }));
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.data_channel.read().await.is_none() {
            let dc_init = RTCDataChannelInit {
                ordered: Some(true),
                max_retransmits: Some(MAX_RETRANSMITS),
                ..Default::default()
            };
            let dc = self
                .connection
                .create_data_channel(DATA_CHANNEL_LABEL, Some(dc_init))
                .await?;
            Self::attach_channel(&dc, &self.sink);
            *self.data_channel.write().await = Some(dc);
        }

        let offer = self.connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)?;
        self.connection.set_local_description(description).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)?;
        self.connection
            .set_remote_description(description)
            .await
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.connection.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))
    }

    fn state(&self) -> PrimitiveState {
        map_state(self.connection.connection_state())
    }

    async fn send(&self, frame: ChannelFrame) -> Result<(), NegotiationError> {
        let dc = self
            .data_channel
            .read()
            .await
            .clone()
            .ok_or(NegotiationError::ChannelNotOpen)?;
        match frame {
            ChannelFrame::Text(text) => dc.send_text(text).await?,
            ChannelFrame::Binary(data) => dc.send(&data).await?,
        };
        Ok(())
    }

    async fn close(&self) {
        if let Some(dc) = self.data_channel.write().await.take() {
            let _ = dc.close().await;
        }
        if let Err(e) = self.connection.close().await {
            debug!("Error closing peer connection: {}", e);
        }
    }
}

/// Real WebRTC peer connection factory
///
/// Creates actual WebRTC connections using the webrtc crate.
#[derive(Debug, Default, Clone)]
pub struct RtcPeerConnectionFactory;

impl RtcPeerConnectionFactory {
    pub fn new() -> Self {
        Self
    }

    async fn create_connection(
        ice_servers: &[IceServer],
    ) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        Ok(Arc::new(api.new_peer_connection(config).await?))
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(
        &self,
        sink: EventSink,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let connection = Self::create_connection(ice_servers).await?;
        let peer = RtcPeerConnection {
            connection,
            data_channel: Arc::new(RwLock::new(None)),
            sink,
        };
        peer.setup_handlers();
        Ok(Arc::new(peer))
    }
}

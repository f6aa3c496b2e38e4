//! Negotiation primitive seam
//!
//! The controller drives an ICE/SCTP primitive through [`PeerConnection`].
//! Primitives report asynchronous happenings (local candidates, state
//! changes, channel open/close, messages) into an [`EventSink`] tagged with
//! the epoch of the session that created them, so callbacks from a
//! superseded primitive can be recognised and dropped.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::ChannelFrame;
use crate::types::{IceCandidate, IceServer, SessionDescription};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),
    #[error("Invalid description: {0}")]
    InvalidDescription(String),
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("Data channel not open")]
    ChannelNotOpen,
    #[error("Connection closed")]
    Closed,
}

impl From<webrtc::Error> for NegotiationError {
    fn from(e: webrtc::Error) -> Self {
        NegotiationError::WebRTC(e.to_string())
    }
}

/// Connection state as reported by the primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PrimitiveState {
    /// States in which an incoming offer replaces the session
    pub fn is_replaceable(&self) -> bool {
        matches!(
            self,
            PrimitiveState::New
                | PrimitiveState::Disconnected
                | PrimitiveState::Failed
                | PrimitiveState::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveEvent {
    LocalCandidate(IceCandidate),
    StateChange(PrimitiveState),
    ChannelOpen,
    ChannelClose,
    Message(ChannelFrame),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub epoch: u64,
    pub event: PrimitiveEvent,
}

/// Where a primitive reports its events
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false once the controller is gone
    pub fn emit(&self, event: PrimitiveEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// One negotiation primitive; never reused across sessions
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    fn state(&self) -> PrimitiveState;

    /// Send over the data channel
    async fn send(&self, frame: ChannelFrame) -> Result<(), NegotiationError>;

    async fn close(&self);
}

/// Creates fresh primitives bound to an event sink
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        sink: EventSink,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

#[async_trait]
impl<T: PeerConnectionFactory + ?Sized> PeerConnectionFactory for Arc<T> {
    async fn create(
        &self,
        sink: EventSink,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        (**self).create(sink, ice_servers).await
    }
}

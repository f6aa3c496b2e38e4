//! Signaling carrier abstraction
//!
//! Defines the contract shared by the broadcast and relay carriers so the
//! negotiation logic never depends on a concrete carrier.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::bus::Subscription;
use crate::types::{CarrierKind, IceCandidate, IceServer, PeerId, SessionDescription, SignalingEnvelope};

/// Errors from carrier operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Rejected by carrier (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("Timeout")]
    Timeout,
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Disconnected")]
    Disconnected,
    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

/// Raw presence snapshot: participant key to its tracked metas
pub type PresenceState = HashMap<String, Vec<serde_json::Value>>;

/// Something a carrier received on our behalf
#[derive(Debug, Clone)]
pub enum CarrierEvent {
    /// Envelope addressed to the local endpoint
    Envelope(SignalingEnvelope),
    /// Carrier-level text message, used by fallback mode
    Text { from: PeerId, text: String },
    /// Full presence resync
    PresenceSync(PresenceState),
}

/// Out-of-band channel that relays negotiation messages
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    fn kind(&self) -> CarrierKind;

    fn local_id(&self) -> &PeerId;

    /// Whether the carrier can currently submit messages
    fn is_available(&self) -> bool;

    /// Submit an envelope; resolves once the carrier accepted it
    async fn send_envelope(&self, envelope: SignalingEnvelope) -> Result<(), TransportError>;

    /// Carrier-native message primitive
    async fn send_text(&self, to: &PeerId, text: &str) -> Result<(), TransportError>;

    /// Received envelopes (already filtered to us), text and presence
    fn subscribe(&self) -> Subscription<CarrierEvent>;

    async fn close(&self);

    async fn send_offer(
        &self,
        to: &PeerId,
        description: SessionDescription,
        ice_servers: Option<Vec<IceServer>>,
    ) -> Result<(), TransportError> {
        self.send_envelope(SignalingEnvelope::Offer {
            from: self.local_id().clone(),
            to: to.clone(),
            description,
            ice_servers,
        })
        .await
    }

    async fn send_answer(
        &self,
        to: &PeerId,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.send_envelope(SignalingEnvelope::Answer {
            from: self.local_id().clone(),
            to: to.clone(),
            description,
        })
        .await
    }

    async fn send_candidate(
        &self,
        to: &PeerId,
        candidate: IceCandidate,
    ) -> Result<(), TransportError> {
        self.send_envelope(SignalingEnvelope::Candidate {
            from: self.local_id().clone(),
            to: to.clone(),
            candidate,
        })
        .await
    }
}

/// Boundary check applied by every carrier before an envelope is surfaced
pub(crate) fn accept_inbound(local_id: &PeerId, envelope: &SignalingEnvelope) -> bool {
    if !envelope.is_for(local_id) {
        // Not for us
        debug!(
            "Dropping {} from {} addressed to {}",
            envelope.kind(),
            envelope.from(),
            envelope.to()
        );
        return false;
    }
    if envelope.from() == local_id {
        debug!("Dropping {} echoed from ourselves", envelope.kind());
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_inbound_filters_recipient() {
        let me = PeerId::from("me");
        let for_me = SignalingEnvelope::Candidate {
            from: "other".into(),
            to: "me".into(),
            candidate: IceCandidate::new("candidate:1"),
        };
        let for_someone_else = SignalingEnvelope::Candidate {
            from: "other".into(),
            to: "third".into(),
            candidate: IceCandidate::new("candidate:1"),
        };
        assert!(accept_inbound(&me, &for_me));
        assert!(!accept_inbound(&me, &for_someone_else));
    }

    #[test]
    fn test_accept_inbound_drops_echo() {
        let me = PeerId::from("me");
        let echo = SignalingEnvelope::Answer {
            from: "me".into(),
            to: "me".into(),
            description: SessionDescription::answer("v=0"),
        };
        assert!(!accept_inbound(&me, &echo));
    }
}

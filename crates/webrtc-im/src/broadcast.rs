//! Presence-based broadcast carrier
//!
//! Runs negotiation over a hosted pub/sub channel with presence. The hosted
//! service stays behind [`PresenceChannel`]; this module only knows the
//! event names and payload shapes.
//!
//! Wire events:
//! - `SEND_OFFER`  `{from, to, sdp, ice?}`
//! - `SEND_ANSWER` `{from, to, sdp}`
//! - `SEND_ICE`    `{from, to, ice}`
//! - `TEXT`        `{from, to, data}`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{EventBus, Subscription};
use crate::config::deserialize_ice_servers;
use crate::transport::{accept_inbound, CarrierEvent, PresenceState, SignalingTransport, TransportError};
use crate::types::{
    CarrierKind, IceCandidate, IceServer, PeerId, PresenceAnnouncement, SessionDescription,
    SignalingEnvelope,
};

pub const EVENT_OFFER: &str = "SEND_OFFER";
pub const EVENT_ANSWER: &str = "SEND_ANSWER";
pub const EVENT_ICE: &str = "SEND_ICE";
pub const EVENT_TEXT: &str = "TEXT";

/// Item delivered by a presence channel
#[derive(Debug, Clone)]
pub enum ChannelFeed {
    Broadcast { event: String, payload: Value },
    PresenceSync(PresenceState),
}

/// Hosted pub/sub channel with presence tracking
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Publish to every other participant; no delivery guarantee
    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Track (or replace) our presence meta under `key`
    async fn track(&self, key: &str, meta: Value) -> Result<(), TransportError>;

    /// Untrack and stop receiving
    async fn leave(&self);

    fn subscribe(&self) -> Subscription<ChannelFeed>;

    fn is_joined(&self) -> bool;
}

#[derive(Debug, Serialize, Deserialize)]
struct SdpPayload {
    from: PeerId,
    to: PeerId,
    sdp: SessionDescription,
    #[serde(
        default,
        deserialize_with = "deserialize_ice_servers",
        skip_serializing_if = "Option::is_none"
    )]
    ice: Option<Vec<IceServer>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IcePayload {
    from: PeerId,
    to: PeerId,
    ice: IceCandidate,
}

#[derive(Debug, Serialize, Deserialize)]
struct TextPayload {
    from: PeerId,
    to: PeerId,
    data: String,
}

fn encode_envelope(envelope: SignalingEnvelope) -> Result<(&'static str, Value), TransportError> {
    let encoded = match envelope {
        SignalingEnvelope::Offer {
            from,
            to,
            description,
            ice_servers,
        } => (
            EVENT_OFFER,
            serde_json::to_value(SdpPayload {
                from,
                to,
                sdp: description,
                ice: ice_servers,
            })?,
        ),
        SignalingEnvelope::Answer {
            from,
            to,
            description,
        } => (
            EVENT_ANSWER,
            serde_json::to_value(SdpPayload {
                from,
                to,
                sdp: description,
                ice: None,
            })?,
        ),
        SignalingEnvelope::Candidate {
            from,
            to,
            candidate,
        } => (
            EVENT_ICE,
            serde_json::to_value(IcePayload {
                from,
                to,
                ice: candidate,
            })?,
        ),
    };
    Ok(encoded)
}

/// Decode one broadcast; `Ok(None)` for events not meant for us
fn decode_broadcast(
    local_id: &PeerId,
    event: &str,
    payload: Value,
) -> Result<Option<CarrierEvent>, serde_json::Error> {
    let envelope = match event {
        EVENT_OFFER => {
            let p: SdpPayload = serde_json::from_value(payload)?;
            SignalingEnvelope::Offer {
                from: p.from,
                to: p.to,
                description: p.sdp,
                ice_servers: p.ice,
            }
        }
        EVENT_ANSWER => {
            let p: SdpPayload = serde_json::from_value(payload)?;
            SignalingEnvelope::Answer {
                from: p.from,
                to: p.to,
                description: p.sdp,
            }
        }
        EVENT_ICE => {
            let p: IcePayload = serde_json::from_value(payload)?;
            SignalingEnvelope::Candidate {
                from: p.from,
                to: p.to,
                candidate: p.ice,
            }
        }
        EVENT_TEXT => {
            let p: TextPayload = serde_json::from_value(payload)?;
            if &p.to != local_id || &p.from == local_id {
                return Ok(None);
            }
            return Ok(Some(CarrierEvent::Text {
                from: p.from,
                text: p.data,
            }));
        }
        other => {
            debug!("Ignoring broadcast event {}", other);
            return Ok(None);
        }
    };

    if accept_inbound(local_id, &envelope) {
        Ok(Some(CarrierEvent::Envelope(envelope)))
    } else {
        Ok(None)
    }
}

/// Carrier for near peers over a presence channel
pub struct BroadcastCarrier {
    channel: Arc<dyn PresenceChannel>,
    local_id: PeerId,
    events: EventBus<CarrierEvent>,
    closed: AtomicBool,
    pump: JoinHandle<()>,
}

impl BroadcastCarrier {
    /// Start consuming the channel feed; must run inside a tokio runtime
    pub fn start(channel: Arc<dyn PresenceChannel>, local_id: PeerId) -> Self {
        let events = EventBus::new();
        let feed = channel.subscribe();
        let pump = tokio::spawn(Self::pump(feed, local_id.clone(), events.clone()));
        Self {
            channel,
            local_id,
            events,
            closed: AtomicBool::new(false),
            pump,
        }
    }

    async fn pump(
        mut feed: Subscription<ChannelFeed>,
        local_id: PeerId,
        events: EventBus<CarrierEvent>,
    ) {
        while let Some(item) = feed.recv().await {
            match item {
                ChannelFeed::Broadcast { event, payload } => {
                    match decode_broadcast(&local_id, &event, payload) {
                        Ok(Some(decoded)) => {
                            events.emit(decoded);
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Malformed {} broadcast: {}", event, e),
                    }
                }
                ChannelFeed::PresenceSync(state) => {
                    debug!("Presence sync with {} participants", state.len());
                    events.emit(CarrierEvent::PresenceSync(state));
                }
            }
        }
        debug!("Presence channel feed ended");
    }

    /// Track our presence so other participants can discover us
    pub async fn announce(&self, presence: &PresenceAnnouncement) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        let meta = serde_json::to_value(presence)?;
        self.channel.track(self.local_id.as_str(), meta).await
    }
}

#[async_trait]
impl SignalingTransport for BroadcastCarrier {
    fn kind(&self) -> CarrierKind {
        CarrierKind::Broadcast
    }

    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    fn is_available(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.channel.is_joined()
    }

    async fn send_envelope(&self, envelope: SignalingEnvelope) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotConnected);
        }
        debug!("Broadcasting {} to {}", envelope.kind(), envelope.to());
        let (event, payload) = encode_envelope(envelope)?;
        self.channel.broadcast(event, payload).await
    }

    async fn send_text(&self, to: &PeerId, text: &str) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotConnected);
        }
        let payload = serde_json::to_value(TextPayload {
            from: self.local_id.clone(),
            to: to.clone(),
            data: text.to_string(),
        })?;
        self.channel.broadcast(EVENT_TEXT, payload).await
    }

    fn subscribe(&self) -> Subscription<CarrierEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pump.abort();
        self.channel.leave().await;
        self.events.clear();
    }
}

impl Drop for BroadcastCarrier {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

//! WebSocket forwarding relay carrier
//!
//! Talks to a forwarding server over an authenticated WebSocket. Every
//! request carries a sequence number and is answered by an `ACK` frame with
//! a status code; `0` means the relay accepted it.
//!
//! Frames are JSON `{event, seq?, payload}`:
//! - client: `JOIN_ROOM`, `SEND_WEBRTC_OFFER|ANSWER|ICE`, `SEND_MESSAGE`
//! - server: `ACK`, `FORWARD_WEBRTC_OFFER|ANSWER|ICE`, `FORWARD_MESSAGE`,
//!   `JOINED_MEMBER`, `LEFT_ROOM`

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::config::{deserialize_ice_servers, RelayConfig};
use crate::transport::{accept_inbound, CarrierEvent, SignalingTransport, TransportError};
use crate::types::{
    CarrierKind, DeviceClass, IceCandidate, IceServer, PeerId, SessionDescription,
    SignalingEnvelope,
};

pub const EVENT_ACK: &str = "ACK";
pub const EVENT_JOIN_ROOM: &str = "JOIN_ROOM";
pub const EVENT_SEND_OFFER: &str = "SEND_WEBRTC_OFFER";
pub const EVENT_SEND_ANSWER: &str = "SEND_WEBRTC_ANSWER";
pub const EVENT_SEND_ICE: &str = "SEND_WEBRTC_ICE";
pub const EVENT_SEND_MESSAGE: &str = "SEND_MESSAGE";
pub const EVENT_FORWARD_OFFER: &str = "FORWARD_WEBRTC_OFFER";
pub const EVENT_FORWARD_ANSWER: &str = "FORWARD_WEBRTC_ANSWER";
pub const EVENT_FORWARD_ICE: &str = "FORWARD_WEBRTC_ICE";
pub const EVENT_FORWARD_MESSAGE: &str = "FORWARD_MESSAGE";
pub const EVENT_JOINED_MEMBER: &str = "JOINED_MEMBER";
pub const EVENT_LEFT_ROOM: &str = "LEFT_ROOM";

/// One frame on the relay socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

/// Relay acknowledgment payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OfferPayload {
    origin: PeerId,
    target: PeerId,
    offer: SessionDescription,
    #[serde(
        default,
        deserialize_with = "deserialize_ice_servers",
        skip_serializing_if = "Option::is_none"
    )]
    ice: Option<Vec<IceServer>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnswerPayload {
    origin: PeerId,
    target: PeerId,
    answer: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
struct CandidatePayload {
    origin: PeerId,
    target: PeerId,
    candidate: IceCandidate,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessagePayload {
    origin: PeerId,
    target: PeerId,
    message: String,
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Ack>>>>;

fn lock_pending(pending: &PendingAcks) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Ack>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn encode_envelope(envelope: SignalingEnvelope) -> Result<(&'static str, Value), TransportError> {
    let encoded = match envelope {
        SignalingEnvelope::Offer {
            from,
            to,
            description,
            ice_servers,
        } => (
            EVENT_SEND_OFFER,
            serde_json::to_value(OfferPayload {
                origin: from,
                target: to,
                offer: description,
                ice: ice_servers,
            })?,
        ),
        SignalingEnvelope::Answer {
            from,
            to,
            description,
        } => (
            EVENT_SEND_ANSWER,
            serde_json::to_value(AnswerPayload {
                origin: from,
                target: to,
                answer: description,
            })?,
        ),
        SignalingEnvelope::Candidate {
            from,
            to,
            candidate,
        } => (
            EVENT_SEND_ICE,
            serde_json::to_value(CandidatePayload {
                origin: from,
                target: to,
                candidate,
            })?,
        ),
    };
    Ok(encoded)
}

/// Decode a server push; `Ok(None)` for frames that carry nothing for us
fn decode_forward(
    local_id: &PeerId,
    frame: RelayFrame,
) -> Result<Option<CarrierEvent>, serde_json::Error> {
    let envelope = match frame.event.as_str() {
        EVENT_FORWARD_OFFER => {
            let p: OfferPayload = serde_json::from_value(frame.payload)?;
            SignalingEnvelope::Offer {
                from: p.origin,
                to: p.target,
                description: p.offer,
                ice_servers: p.ice,
            }
        }
        EVENT_FORWARD_ANSWER => {
            let p: AnswerPayload = serde_json::from_value(frame.payload)?;
            SignalingEnvelope::Answer {
                from: p.origin,
                to: p.target,
                description: p.answer,
            }
        }
        EVENT_FORWARD_ICE => {
            let p: CandidatePayload = serde_json::from_value(frame.payload)?;
            SignalingEnvelope::Candidate {
                from: p.origin,
                to: p.target,
                candidate: p.candidate,
            }
        }
        EVENT_FORWARD_MESSAGE => {
            let p: MessagePayload = serde_json::from_value(frame.payload)?;
            if &p.target != local_id {
                return Ok(None);
            }
            return Ok(Some(CarrierEvent::Text {
                from: p.origin,
                text: p.message,
            }));
        }
        EVENT_JOINED_MEMBER | EVENT_LEFT_ROOM => {
            debug!("Relay room event {}: {}", frame.event, frame.payload);
            return Ok(None);
        }
        other => {
            debug!("Ignoring relay event {}", other);
            return Ok(None);
        }
    };

    if accept_inbound(local_id, &envelope) {
        Ok(Some(CarrierEvent::Envelope(envelope)))
    } else {
        Ok(None)
    }
}

/// Carrier for far peers over the forwarding relay
pub struct RelayCarrier {
    local_id: PeerId,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingAcks,
    next_seq: AtomicU64,
    connected: Arc<AtomicBool>,
    events: EventBus<CarrierEvent>,
    ack_timeout: Duration,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RelayCarrier {
    /// Open the socket, authenticate, and join the room
    pub async fn connect(
        config: &RelayConfig,
        local_id: PeerId,
        device: DeviceClass,
    ) -> Result<Self, TransportError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| TransportError::ConnectionFailed("relay url not configured".to_string()))?;

        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        info!("Connecting to relay: {}", url);
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let events = EventBus::new();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = {
            let pending = pending.clone();
            let connected = connected.clone();
            let events = events.clone();
            let local_id = local_id.clone();
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            Self::handle_text(&text, &local_id, &pending, &events)
                        }
                        Ok(Message::Close(_)) => {
                            info!("Relay closed the connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Relay socket error: {}", e);
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::Release);
                // Dropping the senders fails every waiter with Disconnected
                lock_pending(&pending).clear();
                events.clear();
            })
        };

        let carrier = Self {
            local_id,
            outgoing,
            pending,
            next_seq: AtomicU64::new(1),
            connected,
            events,
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            writer,
            reader,
        };

        let join = json!({ "id": carrier.local_id, "device": device });
        carrier.request(EVENT_JOIN_ROOM, join).await?;
        info!("Joined relay room as {}", carrier.local_id);
        Ok(carrier)
    }

    fn handle_text(
        text: &str,
        local_id: &PeerId,
        pending: &PendingAcks,
        events: &EventBus<CarrierEvent>,
    ) {
        let frame: RelayFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed relay frame: {}", e);
                return;
            }
        };

        if frame.event == EVENT_ACK {
            let Some(seq) = frame.seq else {
                debug!("ACK without seq");
                return;
            };
            let ack = serde_json::from_value::<Ack>(frame.payload).unwrap_or_else(|e| Ack {
                code: -1,
                message: Some(format!("malformed ack: {}", e)),
            });
            match lock_pending(pending).remove(&seq) {
                Some(waiter) => {
                    let _ = waiter.send(ack);
                }
                None => debug!("ACK for unknown seq {}", seq),
            }
            return;
        }

        let event = frame.event.clone();
        match decode_forward(local_id, frame) {
            Ok(Some(decoded)) => {
                events.emit(decoded);
            }
            Ok(None) => {}
            Err(e) => warn!("Malformed {} frame: {}", event, e),
        }
    }

    /// Send one request and wait for its acknowledgment
    async fn request(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotConnected);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let frame = RelayFrame {
            event: event.to_string(),
            seq: Some(seq),
            payload,
        };
        let text = serde_json::to_string(&frame)?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(seq, tx);

        if self.outgoing.send(Message::Text(text.into())).is_err() {
            lock_pending(&self.pending).remove(&seq);
            return Err(TransportError::Disconnected);
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) if ack.code == 0 => Ok(()),
            Ok(Ok(ack)) => Err(TransportError::Rejected {
                code: ack.code,
                message: ack.message.unwrap_or_default(),
            }),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                lock_pending(&self.pending).remove(&seq);
                Err(TransportError::Timeout)
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for RelayCarrier {
    fn kind(&self) -> CarrierKind {
        CarrierKind::Relay
    }

    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    fn is_available(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn send_envelope(&self, envelope: SignalingEnvelope) -> Result<(), TransportError> {
        debug!("Relaying {} to {}", envelope.kind(), envelope.to());
        let (event, payload) = encode_envelope(envelope)?;
        self.request(event, payload).await
    }

    async fn send_text(&self, to: &PeerId, text: &str) -> Result<(), TransportError> {
        let payload = serde_json::to_value(MessagePayload {
            origin: self.local_id.clone(),
            target: to.clone(),
            message: text.to_string(),
        })?;
        self.request(EVENT_SEND_MESSAGE, payload).await
    }

    fn subscribe(&self) -> Subscription<CarrierEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.outgoing.send(Message::Close(None));
        self.reader.abort();
        lock_pending(&self.pending).clear();
        self.events.clear();
    }
}

impl Drop for RelayCarrier {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

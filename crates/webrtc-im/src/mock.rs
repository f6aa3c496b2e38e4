//! Mock implementations for testing and simulation
//!
//! Provides an in-memory presence channel and a peer connection factory that
//! link endpoints through shared in-process state instead of a hosted relay
//! and real WebRTC.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::broadcast::{ChannelFeed, PresenceChannel};
use crate::bus::{EventBus, Subscription};
use crate::connection::{
    EventSink, NegotiationError, PeerConnection, PeerConnectionFactory, PrimitiveEvent,
    PrimitiveState,
};
use crate::protocol::ChannelFrame;
use crate::transport::{PresenceState, TransportError};
use crate::types::{IceCandidate, IceServer, SdpKind, SessionDescription};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Memory Presence Hub
// ============================================================================

#[derive(Default)]
struct HubState {
    next_client: u64,
    clients: HashMap<u64, EventBus<ChannelFeed>>,
    /// client -> (presence key, meta)
    presence: BTreeMap<u64, (String, Value)>,
}

impl HubState {
    fn snapshot(&self) -> PresenceState {
        let mut state = PresenceState::new();
        for (key, meta) in self.presence.values() {
            state.entry(key.clone()).or_default().push(meta.clone());
        }
        state
    }

    fn sync_all(&self) {
        let snapshot = self.snapshot();
        for bus in self.clients.values() {
            bus.emit(ChannelFeed::PresenceSync(snapshot.clone()));
        }
    }
}

/// In-memory stand-in for the hosted presence/broadcast service
#[derive(Default)]
pub struct MemoryPresenceHub {
    state: Mutex<HubState>,
}

impl MemoryPresenceHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the channel as a new participant
    pub fn join(self: &Arc<Self>) -> MemoryPresenceChannel {
        let bus = EventBus::new();
        let mut state = lock(&self.state);
        let client = state.next_client;
        state.next_client += 1;
        state.clients.insert(client, bus.clone());
        MemoryPresenceChannel {
            hub: self.clone(),
            client,
            bus,
            joined: AtomicBool::new(true),
        }
    }

    /// Deliver a raw broadcast to every participant
    pub fn inject(&self, event: &str, payload: Value) {
        let state = lock(&self.state);
        for bus in state.clients.values() {
            bus.emit(ChannelFeed::Broadcast {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
    }

    pub fn presence_state(&self) -> PresenceState {
        lock(&self.state).snapshot()
    }

    pub fn participant_count(&self) -> usize {
        lock(&self.state).clients.len()
    }
}

/// One participant's handle on a [`MemoryPresenceHub`]
pub struct MemoryPresenceChannel {
    hub: Arc<MemoryPresenceHub>,
    client: u64,
    bus: EventBus<ChannelFeed>,
    joined: AtomicBool,
}

#[async_trait]
impl PresenceChannel for MemoryPresenceChannel {
    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.is_joined() {
            return Err(TransportError::NotConnected);
        }
        let state = lock(&self.hub.state);
        for (client, bus) in &state.clients {
            if *client != self.client {
                bus.emit(ChannelFeed::Broadcast {
                    event: event.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn track(&self, key: &str, meta: Value) -> Result<(), TransportError> {
        if !self.is_joined() {
            return Err(TransportError::NotConnected);
        }
        let mut state = lock(&self.hub.state);
        state.presence.insert(self.client, (key.to_string(), meta));
        state.sync_all();
        Ok(())
    }

    async fn leave(&self) {
        if !self.joined.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut state = lock(&self.hub.state);
        state.clients.remove(&self.client);
        state.presence.remove(&self.client);
        state.sync_all();
        self.bus.clear();
    }

    fn subscribe(&self) -> Subscription<ChannelFeed> {
        self.bus.subscribe()
    }

    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }
}

// ============================================================================
// Mock Peer Connections
// ============================================================================

const MOCK_SDP_PREFIX: &str = "v=0 mock-endpoint:";

#[derive(Default)]
struct NetworkState {
    next_endpoint: u64,
    endpoints: HashMap<u64, Arc<MockPeerConnection>>,
    created: Vec<Arc<MockPeerConnection>>,
}

/// Shared in-process "network" linking mock primitives
///
/// Endpoints discover each other through the SDP they exchange: each
/// description names its endpoint, and applying an answer links both sides.
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
    auto_connect: Arc<AtomicBool>,
}

impl MockNetwork {
    pub fn new() -> Self {
        let network = Self::default();
        network.auto_connect.store(true, Ordering::Release);
        network
    }

    /// When disabled, linked endpoints stay connecting until [`MockNetwork::connect_all`]
    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::Release);
    }

    pub fn factory(&self) -> MockPeerConnectionFactory {
        MockPeerConnectionFactory {
            network: self.clone(),
        }
    }

    /// Every primitive created so far, oldest first
    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        lock(&self.state).created.clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state)
            .endpoints
            .values()
            .filter(|c| c.state() != PrimitiveState::Closed)
            .count()
    }

    /// Bring every linked, still-connecting pair up
    pub fn connect_all(&self) {
        let endpoints: Vec<_> = lock(&self.state).endpoints.values().cloned().collect();
        for endpoint in endpoints {
            if endpoint.remote_endpoint().is_some() && endpoint.state() == PrimitiveState::Connecting
            {
                endpoint.bring_up();
            }
        }
    }

    fn endpoint(&self, id: u64) -> Option<Arc<MockPeerConnection>> {
        lock(&self.state).endpoints.get(&id).cloned()
    }

    fn link(&self, a: &Arc<MockPeerConnection>, b: &Arc<MockPeerConnection>) {
        a.set_remote_endpoint(b.id);
        b.set_remote_endpoint(a.id);
        a.set_state(PrimitiveState::Connecting);
        b.set_state(PrimitiveState::Connecting);
        if self.auto_connect.load(Ordering::Acquire) {
            a.bring_up();
            b.bring_up();
        }
    }
}

struct MockConnState {
    primitive: PrimitiveState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_endpoint: Option<u64>,
    candidates: Vec<IceCandidate>,
    channel_open: bool,
    sent: Vec<ChannelFrame>,
}

/// In-memory negotiation primitive
pub struct MockPeerConnection {
    id: u64,
    network: MockNetwork,
    sink: EventSink,
    ice_servers: Vec<IceServer>,
    state: Mutex<MockConnState>,
}

impl MockPeerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn epoch(&self) -> u64 {
        self.sink.epoch()
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Remote candidates applied to this primitive, in order
    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).candidates.clone()
    }

    pub fn sent_frames(&self) -> Vec<ChannelFrame> {
        lock(&self.state).sent.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PrimitiveState::Closed
    }

    /// Simulate the transport failing underneath the session
    pub fn fail(&self) {
        self.set_state(PrimitiveState::Failed);
        self.sink
            .emit(PrimitiveEvent::StateChange(PrimitiveState::Failed));
    }

    fn remote_endpoint(&self) -> Option<u64> {
        lock(&self.state).remote_endpoint
    }

    fn set_remote_endpoint(&self, id: u64) {
        lock(&self.state).remote_endpoint = Some(id);
    }

    fn set_state(&self, primitive: PrimitiveState) {
        lock(&self.state).primitive = primitive;
    }

    fn bring_up(&self) {
        {
            let mut state = lock(&self.state);
            state.primitive = PrimitiveState::Connected;
            state.channel_open = true;
        }
        self.sink
            .emit(PrimitiveEvent::StateChange(PrimitiveState::Connected));
        self.sink.emit(PrimitiveEvent::ChannelOpen);
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("{}{}", MOCK_SDP_PREFIX, self.id),
        }
    }

    fn deliver(&self, frame: ChannelFrame) {
        self.sink.emit(PrimitiveEvent::Message(frame));
    }

    fn remote_closed(&self) {
        let was_open = {
            let mut state = lock(&self.state);
            if state.primitive == PrimitiveState::Closed {
                return;
            }
            let was_open = state.channel_open;
            state.channel_open = false;
            state.primitive = PrimitiveState::Disconnected;
            was_open
        };
        if was_open {
            self.sink.emit(PrimitiveEvent::ChannelClose);
        }
    }
}

fn parse_endpoint(sdp: &str) -> Result<u64, NegotiationError> {
    sdp.strip_prefix(MOCK_SDP_PREFIX)
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| NegotiationError::InvalidDescription(format!("not a mock sdp: {}", sdp)))
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = lock(&self.state);
        if state.primitive == PrimitiveState::Closed {
            return Err(NegotiationError::Closed);
        }
        if state.remote.is_none() {
            return Err(NegotiationError::InvalidDescription(
                "no remote offer".to_string(),
            ));
        }
        drop(state);
        Ok(self.description(SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        {
            let mut state = lock(&self.state);
            if state.primitive == PrimitiveState::Closed {
                return Err(NegotiationError::Closed);
            }
            state.local = Some(description);
        }
        // Trickle one host candidate per primitive
        self.sink.emit(PrimitiveEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
            self.id,
            50_000 + self.id
        ))));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let remote_id = parse_endpoint(&description.sdp)?;
        let kind = description.kind;
        {
            let mut state = lock(&self.state);
            if state.primitive == PrimitiveState::Closed {
                return Err(NegotiationError::Closed);
            }
            state.remote = Some(description);
        }

        if kind == SdpKind::Answer {
            let me = self
                .network
                .endpoint(self.id)
                .ok_or(NegotiationError::Closed)?;
            match self.network.endpoint(remote_id) {
                Some(remote) if !remote.is_closed() => self.network.link(&me, &remote),
                _ => return Err(NegotiationError::WebRTC("remote endpoint gone".to_string())),
            }
        }
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        lock(&self.state).remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if candidate.candidate.is_empty() {
            return Err(NegotiationError::InvalidCandidate("empty".to_string()));
        }
        let mut state = lock(&self.state);
        if state.remote.is_none() {
            return Err(NegotiationError::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn state(&self) -> PrimitiveState {
        lock(&self.state).primitive
    }

    async fn send(&self, frame: ChannelFrame) -> Result<(), NegotiationError> {
        let remote_id = {
            let mut state = lock(&self.state);
            if !state.channel_open {
                return Err(NegotiationError::ChannelNotOpen);
            }
            state.sent.push(frame.clone());
            state.remote_endpoint
        };
        let remote = remote_id
            .and_then(|id| self.network.endpoint(id))
            .ok_or(NegotiationError::ChannelNotOpen)?;
        remote.deliver(frame);
        Ok(())
    }

    async fn close(&self) {
        let remote_id = {
            let mut state = lock(&self.state);
            if state.primitive == PrimitiveState::Closed {
                return;
            }
            state.primitive = PrimitiveState::Closed;
            state.channel_open = false;
            state.remote_endpoint
        };
        if let Some(remote) = remote_id.and_then(|id| self.network.endpoint(id)) {
            remote.remote_closed();
        }
    }
}

/// Factory producing [`MockPeerConnection`]s on a shared [`MockNetwork`]
#[derive(Clone)]
pub struct MockPeerConnectionFactory {
    network: MockNetwork,
}

#[async_trait]
impl PeerConnectionFactory for MockPeerConnectionFactory {
    async fn create(
        &self,
        sink: EventSink,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let mut state = lock(&self.network.state);
        let id = state.next_endpoint;
        state.next_endpoint += 1;
        let connection = Arc::new(MockPeerConnection {
            id,
            network: self.network.clone(),
            sink,
            ice_servers: ice_servers.to_vec(),
            state: Mutex::new(MockConnState {
                primitive: PrimitiveState::New,
                local: None,
                remote: None,
                remote_endpoint: None,
                candidates: Vec::new(),
                channel_open: false,
                sent: Vec::new(),
            }),
        });
        state.endpoints.insert(id, connection.clone());
        state.created.push(connection.clone());
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TaggedEvent;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TaggedEvent>) -> Vec<PrimitiveEvent> {
        let mut events = Vec::new();
        while let Ok(tagged) = rx.try_recv() {
            events.push(tagged.event);
        }
        events
    }

    #[tokio::test]
    async fn test_offer_answer_links_endpoints() {
        let network = MockNetwork::new();
        let factory = network.factory();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let a = factory.create(EventSink::new(1, tx_a), &[]).await.unwrap();
        let b = factory.create(EventSink::new(1, tx_b), &[]).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.state(), PrimitiveState::Connected);
        assert!(drain(&mut rx_a).contains(&PrimitiveEvent::ChannelOpen));
        assert!(drain(&mut rx_b).contains(&PrimitiveEvent::ChannelOpen));

        a.send(ChannelFrame::Text("hello".to_string())).await.unwrap();
        assert_eq!(
            drain(&mut rx_b),
            vec![PrimitiveEvent::Message(ChannelFrame::Text("hello".to_string()))]
        );

        a.close().await;
        assert!(drain(&mut rx_b).contains(&PrimitiveEvent::ChannelClose));
        assert_eq!(network.open_count(), 1);
    }

    #[tokio::test]
    async fn test_both_sides_closing_stay_closed() {
        let network = MockNetwork::new();
        let factory = network.factory();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        let a = factory.create(EventSink::new(1, tx_a), &[]).await.unwrap();
        let b = factory.create(EventSink::new(1, tx_b), &[]).await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        assert_eq!(network.open_count(), 2);

        a.close().await;
        drain(&mut rx_a);
        b.close().await;

        assert_eq!(a.state(), PrimitiveState::Closed);
        assert_eq!(b.state(), PrimitiveState::Closed);
        assert_eq!(network.open_count(), 0);
        assert!(!drain(&mut rx_a).contains(&PrimitiveEvent::ChannelClose));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let network = MockNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = network.factory().create(EventSink::new(0, tx), &[]).await.unwrap();
        let result = a.send(ChannelFrame::Text("x".to_string())).await;
        assert_eq!(result, Err(NegotiationError::ChannelNotOpen));
    }

    #[tokio::test]
    async fn test_presence_hub_sync_and_leave() {
        let hub = MemoryPresenceHub::new();
        let a = hub.join();
        let b = hub.join();
        let mut b_feed = b.subscribe();

        a.track("a", serde_json::json!({"id": "a"})).await.unwrap();
        match b_feed.try_recv() {
            Some(ChannelFeed::PresenceSync(state)) => assert!(state.contains_key("a")),
            other => panic!("unexpected {:?}", other),
        }

        a.leave().await;
        match b_feed.try_recv() {
            Some(ChannelFeed::PresenceSync(state)) => assert!(state.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hub.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let hub = MemoryPresenceHub::new();
        let a = hub.join();
        let b = hub.join();
        let mut a_feed = a.subscribe();
        let mut b_feed = b.subscribe();

        a.broadcast("TEXT", serde_json::json!({})).await.unwrap();
        assert!(a_feed.try_recv().is_none());
        assert!(matches!(b_feed.try_recv(), Some(ChannelFeed::Broadcast { .. })));
    }
}

//! Peer connection negotiation
//!
//! [`PeerConnectionController`] owns at most one negotiation session and
//! drives the offer/answer/candidate exchange against a fresh primitive per
//! session. Primitive callbacks are delivered back through
//! [`PeerConnectionController::handle_event`], tagged with the epoch of the
//! session that produced them.
//!
//! Glare policy: an incoming offer always preempts a local attempt that has
//! not connected, and a local `initiate` always replaces the current session.

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::connection::{
    EventSink, NegotiationError, PeerConnection, PeerConnectionFactory, PrimitiveEvent,
    PrimitiveState, TaggedEvent,
};
use crate::protocol::{decode_frame, encode_payload, ChannelPayload, FrameError};
use crate::transport::{SignalingTransport, TransportError};
use crate::types::{
    CarrierKind, ConnectionMode, IceCandidate, IceServer, NegotiationState, PeerId, SdpKind,
    SessionDescription, SignalingEnvelope,
};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("No active session")]
    NoActiveSession,
    #[error("Peer not ready")]
    NotReady,
}

/// Events surfaced to the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        peer: PeerId,
        state: NegotiationState,
    },
    Message {
        from: PeerId,
        payload: ChannelPayload,
    },
    /// A peer we have no relationship with tried to negotiate
    IncomingRequest { from: PeerId },
    ModeSelected {
        peer: PeerId,
        mode: ConnectionMode,
    },
    Closed { peer: PeerId },
}

/// Awaitable view of "a data channel is open"
#[derive(Debug, Clone)]
pub struct ReadyHandle {
    rx: watch::Receiver<bool>,
}

impl ReadyHandle {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until a data channel opens
    pub async fn wait(&mut self) -> Result<(), PeerError> {
        self.rx
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| PeerError::NoActiveSession)
    }
}

struct NegotiationSession {
    epoch: u64,
    peer: PeerId,
    transport: Arc<dyn SignalingTransport>,
    connection: Arc<dyn PeerConnection>,
    state: NegotiationState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: Vec<IceCandidate>,
    channel_open: bool,
}

impl NegotiationSession {
    fn new(
        epoch: u64,
        peer: PeerId,
        transport: Arc<dyn SignalingTransport>,
        connection: Arc<dyn PeerConnection>,
    ) -> Self {
        Self {
            epoch,
            peer,
            transport,
            connection,
            state: NegotiationState::Connecting,
            local_description: None,
            remote_description: None,
            pending_candidates: Vec::new(),
            channel_open: false,
        }
    }
}

/// Receiver for primitive callbacks; feed each into `handle_event`
pub type PrimitiveEvents = mpsc::UnboundedReceiver<TaggedEvent>;

pub struct PeerConnectionController {
    factory: Arc<dyn PeerConnectionFactory>,
    ice_servers: Vec<IceServer>,
    session: Option<NegotiationSession>,
    next_epoch: u64,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    ready: watch::Sender<bool>,
    bus: EventBus<ConnectionEvent>,
    /// Peers we have negotiated with or been told about
    known_peers: HashSet<PeerId>,
}

impl PeerConnectionController {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        ice_servers: Vec<IceServer>,
    ) -> (Self, PrimitiveEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(false);
        let controller = Self {
            factory,
            ice_servers,
            session: None,
            next_epoch: 1,
            events_tx,
            ready,
            bus: EventBus::new(),
            known_peers: HashSet::new(),
        };
        (controller, events_rx)
    }

    pub fn bus(&self) -> &EventBus<ConnectionEvent> {
        &self.bus
    }

    pub fn subscribe(&self) -> Subscription<ConnectionEvent> {
        self.bus.subscribe()
    }

    pub fn state(&self) -> NegotiationState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(NegotiationState::Ready)
    }

    pub fn current_peer(&self) -> Option<&PeerId> {
        self.session.as_ref().map(|s| &s.peer)
    }

    /// Carrier the current session negotiates over
    pub fn current_carrier(&self) -> Option<CarrierKind> {
        self.session.as_ref().map(|s| s.transport.kind())
    }

    pub fn current_epoch(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.epoch)
    }

    pub fn has_remote_description(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.remote_description.is_some())
    }

    pub fn has_local_description(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.local_description.is_some())
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.session
            .as_ref()
            .map(|s| s.pending_candidates.len())
            .unwrap_or(0)
    }

    pub fn ready_handle(&self) -> ReadyHandle {
        ReadyHandle {
            rx: self.ready.subscribe(),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Start negotiating with `peer`, replacing any current session
    pub async fn initiate(
        &mut self,
        peer: PeerId,
        transport: Arc<dyn SignalingTransport>,
    ) -> Result<(), PeerError> {
        self.teardown("superseded by local connect").await;

        let ice_servers = self.ice_servers.clone();
        let connection = self.open_session(peer.clone(), transport.clone(), &ice_servers).await?;
        info!("Initiating session with {} via {:?}", peer, transport.kind());

        let offer = match Self::local_offer(connection.as_ref()).await {
            Ok(offer) => offer,
            Err(e) => {
                self.teardown("offer failed").await;
                return Err(e.into());
            }
        };
        if let Some(session) = self.session.as_mut() {
            session.local_description = Some(offer.clone());
        }

        transport
            .send_offer(&peer, offer, Some(ice_servers))
            .await?;
        Ok(())
    }

    /// Dispatch an inbound envelope to the matching handler
    pub async fn handle_envelope(
        &mut self,
        envelope: SignalingEnvelope,
        transport: Arc<dyn SignalingTransport>,
    ) -> Result<(), PeerError> {
        match envelope {
            SignalingEnvelope::Offer {
                from,
                description,
                ice_servers,
                ..
            } => self.on_offer(from, description, ice_servers, transport).await,
            SignalingEnvelope::Answer {
                from, description, ..
            } => self.on_answer(from, description).await,
            SignalingEnvelope::Candidate {
                from, candidate, ..
            } => self.on_candidate(from, candidate).await,
        }
    }

    pub async fn on_offer(
        &mut self,
        from: PeerId,
        description: SessionDescription,
        ice_servers: Option<Vec<IceServer>>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Result<(), PeerError> {
        if description.kind != SdpKind::Offer {
            return Err(NegotiationError::InvalidDescription(
                "offer envelope carries an answer".to_string(),
            )
            .into());
        }

        if let Some(session) = &self.session {
            if session.peer == from && !session.connection.state().is_replaceable() {
                debug!("Ignoring duplicate offer from {}", from);
                return Ok(());
            }
        }

        self.teardown("replaced by incoming offer").await;

        let ice_servers = ice_servers
            .filter(|servers| !servers.is_empty())
            .unwrap_or_else(|| self.ice_servers.clone());
        let connection = self.open_session(from.clone(), transport.clone(), &ice_servers).await?;
        info!("Accepting offer from {} via {:?}", from, transport.kind());

        if let Err(e) = connection.set_remote_description(description.clone()).await {
            self.teardown("remote offer rejected").await;
            return Err(e.into());
        }
        if let Some(session) = self.session.as_mut() {
            session.remote_description = Some(description);
        }
        self.flush_candidates().await;

        let answer = match Self::local_answer(connection.as_ref()).await {
            Ok(answer) => answer,
            Err(e) => {
                self.teardown("answer failed").await;
                return Err(e.into());
            }
        };
        if let Some(session) = self.session.as_mut() {
            session.local_description = Some(answer.clone());
        }

        transport.send_answer(&from, answer).await?;
        Ok(())
    }

    pub async fn on_answer(
        &mut self,
        from: PeerId,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let Some(session) = self.session.as_mut().filter(|s| s.peer == from) else {
            self.unsolicited(&from, "answer");
            return Ok(());
        };
        if description.kind != SdpKind::Answer {
            return Err(NegotiationError::InvalidDescription(
                "answer envelope carries an offer".to_string(),
            )
            .into());
        }
        if session.remote_description.is_some() {
            debug!("Ignoring answer from {}, remote description already set", from);
            return Ok(());
        }

        session
            .connection
            .set_remote_description(description.clone())
            .await?;
        session.remote_description = Some(description);
        debug!("Applied answer from {}", from);
        self.flush_candidates().await;
        Ok(())
    }

    pub async fn on_candidate(
        &mut self,
        from: PeerId,
        candidate: IceCandidate,
    ) -> Result<(), PeerError> {
        let Some(session) = self.session.as_mut().filter(|s| s.peer == from) else {
            self.unsolicited(&from, "candidate");
            return Ok(());
        };

        if session.remote_description.is_none() {
            debug!("Queueing candidate from {} (no remote description yet)", from);
            session.pending_candidates.push(candidate);
            return Ok(());
        }
        session.connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// Apply one primitive callback; stale epochs are dropped
    pub async fn handle_event(&mut self, tagged: TaggedEvent) {
        let Some(session) = self.session.as_mut() else {
            debug!("Dropping {:?} from epoch {}: no session", tagged.event, tagged.epoch);
            return;
        };
        if session.epoch != tagged.epoch {
            debug!(
                "Dropping {:?} from stale epoch {} (current {})",
                tagged.event, tagged.epoch, session.epoch
            );
            return;
        }

        match tagged.event {
            PrimitiveEvent::LocalCandidate(candidate) => {
                let transport = session.transport.clone();
                let peer = session.peer.clone();
                if let Err(e) = transport.send_candidate(&peer, candidate).await {
                    warn!("Failed to send candidate to {}: {}", peer, e);
                }
            }
            PrimitiveEvent::StateChange(state) => match state {
                PrimitiveState::Connected => self.set_state(NegotiationState::Connected),
                PrimitiveState::Connecting => self.set_state(NegotiationState::Connecting),
                PrimitiveState::New
                | PrimitiveState::Disconnected
                | PrimitiveState::Failed
                | PrimitiveState::Closed => {
                    self.teardown(&format!("connection {:?}", state)).await;
                }
            },
            PrimitiveEvent::ChannelOpen => {
                session.channel_open = true;
                info!("Data channel open with {}", session.peer);
                self.set_state(NegotiationState::Connected);
                self.ready.send_replace(true);
            }
            PrimitiveEvent::ChannelClose => {
                self.teardown("data channel closed").await;
            }
            PrimitiveEvent::Message(frame) => match decode_frame(frame) {
                Ok(payload) => {
                    self.bus.emit(ConnectionEvent::Message {
                        from: session.peer.clone(),
                        payload,
                    });
                }
                Err(e) => warn!("Dropping malformed frame from {}: {}", session.peer, e),
            },
        }
    }

    /// Send over the open data channel
    pub async fn send(&self, payload: &ChannelPayload) -> Result<(), PeerError> {
        let session = self.session.as_ref().ok_or(PeerError::NoActiveSession)?;
        if !session.channel_open {
            return Err(PeerError::NotReady);
        }
        let frame = encode_payload(payload)?;
        session.connection.send(frame).await?;
        Ok(())
    }

    /// Close the session from any state
    pub async fn disconnect(&mut self) {
        self.teardown("disconnect").await;
        self.ready.send_replace(false);
    }

    /// Disconnect and release every subscriber
    pub async fn shutdown(&mut self) {
        self.disconnect().await;
        self.known_peers.clear();
        self.bus.clear();
    }

    /// Create the primitive, then publish it as the current session
    async fn open_session(
        &mut self,
        peer: PeerId,
        transport: Arc<dyn SignalingTransport>,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let sink = EventSink::new(epoch, self.events_tx.clone());
        let connection = self.factory.create(sink, ice_servers).await?;

        self.session = Some(NegotiationSession::new(
            epoch,
            peer.clone(),
            transport,
            connection.clone(),
        ));
        self.known_peers.insert(peer.clone());
        self.bus.emit(ConnectionEvent::StateChanged {
            peer,
            state: NegotiationState::Connecting,
        });
        Ok(connection)
    }

    async fn local_offer(
        connection: &dyn PeerConnection,
    ) -> Result<SessionDescription, NegotiationError> {
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn local_answer(
        connection: &dyn PeerConnection,
    ) -> Result<SessionDescription, NegotiationError> {
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn flush_candidates(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let candidates = std::mem::take(&mut session.pending_candidates);
        if !candidates.is_empty() {
            debug!(
                "Adding {} pending candidates for {}",
                candidates.len(),
                session.peer
            );
        }
        for candidate in candidates {
            if let Err(e) = session.connection.add_ice_candidate(candidate).await {
                warn!("Dropping queued candidate from {}: {}", session.peer, e);
            }
        }
    }

    /// Answers or candidates without a matching session
    fn unsolicited(&mut self, from: &PeerId, kind: &str) {
        if self.known_peers.insert(from.clone()) {
            info!("Unsolicited {} from new peer {}", kind, from);
            self.bus.emit(ConnectionEvent::IncomingRequest { from: from.clone() });
        } else {
            debug!("Dropping stale {} from {}", kind, from);
        }
    }

    fn set_state(&mut self, state: NegotiationState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state == state {
            return;
        }
        session.state = state;
        self.bus.emit(ConnectionEvent::StateChanged {
            peer: session.peer.clone(),
            state,
        });
    }

    /// Drop the current session and close its primitive
    async fn teardown(&mut self, reason: &str) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.connection.close().await;
        self.ready.send_replace(false);
        info!("Session with {} closed: {}", session.peer, reason);
        self.bus.emit(ConnectionEvent::StateChanged {
            peer: session.peer.clone(),
            state: NegotiationState::Ready,
        });
        self.bus.emit(ConnectionEvent::Closed { peer: session.peer });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockNetwork, MockPeerConnection};
    use crate::protocol::ChannelFrame;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport that records what was sent
    struct RecordingTransport {
        local_id: PeerId,
        kind: CarrierKind,
        sent: Mutex<Vec<SignalingEnvelope>>,
        bus: EventBus<crate::transport::CarrierEvent>,
    }

    impl RecordingTransport {
        fn new(local_id: &str) -> Arc<Self> {
            Arc::new(Self {
                local_id: local_id.into(),
                kind: CarrierKind::Broadcast,
                sent: Mutex::new(Vec::new()),
                bus: EventBus::new(),
            })
        }

        fn sent(&self) -> Vec<SignalingEnvelope> {
            self.sent.lock().unwrap().clone()
        }

        fn count(&self, kind: &str) -> usize {
            self.sent().iter().filter(|e| e.kind() == kind).count()
        }
    }

    #[async_trait]
    impl SignalingTransport for RecordingTransport {
        fn kind(&self) -> CarrierKind {
            self.kind
        }

        fn local_id(&self) -> &PeerId {
            &self.local_id
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn send_envelope(&self, envelope: SignalingEnvelope) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }

        async fn send_text(&self, _to: &PeerId, _text: &str) -> Result<(), TransportError> {
            Ok(())
        }

        fn subscribe(&self) -> Subscription<crate::transport::CarrierEvent> {
            self.bus.subscribe()
        }

        async fn close(&self) {}
    }

    fn controller(network: &MockNetwork) -> (PeerConnectionController, PrimitiveEvents) {
        PeerConnectionController::new(Arc::new(network.factory()), vec![IceServer::default()])
    }

    async fn pump(ctrl: &mut PeerConnectionController, rx: &mut PrimitiveEvents) {
        while let Ok(event) = rx.try_recv() {
            ctrl.handle_event(event).await;
        }
    }

    /// Offer description produced by a separate mock endpoint
    async fn remote_offer(network: &MockNetwork) -> (Arc<dyn PeerConnection>, SessionDescription) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = network
            .factory()
            .create(EventSink::new(99, tx), &[])
            .await
            .unwrap();
        let offer = remote.create_offer().await.unwrap();
        remote.set_local_description(offer.clone()).await.unwrap();
        (remote, offer)
    }

    fn last_connection(network: &MockNetwork) -> Arc<MockPeerConnection> {
        network.connections().last().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_initiate_sends_offer_and_trickles() {
        let network = MockNetwork::new();
        let (mut ctrl, mut rx) = controller(&network);
        let transport = RecordingTransport::new("me");

        ctrl.initiate("p1".into(), transport.clone()).await.unwrap();
        assert_eq!(ctrl.state(), NegotiationState::Connecting);
        assert_eq!(ctrl.current_peer(), Some(&PeerId::from("p1")));
        assert!(ctrl.has_local_description());
        assert_eq!(transport.count("offer"), 1);

        pump(&mut ctrl, &mut rx).await;
        assert_eq!(transport.count("candidate"), 1);
        match &transport.sent()[0] {
            SignalingEnvelope::Offer { to, ice_servers, .. } => {
                assert_eq!(to.as_str(), "p1");
                assert_eq!(ice_servers.as_ref().map(Vec::len), Some(1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reinitiate_replaces_session() {
        let network = MockNetwork::new();
        let (mut ctrl, mut rx) = controller(&network);
        let transport = RecordingTransport::new("me");

        ctrl.initiate("p1".into(), transport.clone()).await.unwrap();
        let first = last_connection(&network);
        ctrl.initiate("p2".into(), transport.clone()).await.unwrap();
        pump(&mut ctrl, &mut rx).await;

        assert!(first.is_closed());
        assert_eq!(ctrl.current_peer(), Some(&PeerId::from("p2")));
        assert_eq!(network.open_count(), 1);

        // Only the live session trickles; p1's candidate is from a stale epoch
        let candidates_to: Vec<_> = transport
            .sent()
            .into_iter()
            .filter(|e| e.kind() == "candidate")
            .map(|e| e.to().clone())
            .collect();
        assert_eq!(candidates_to, vec![PeerId::from("p2")]);
    }

    #[tokio::test]
    async fn test_residual_answer_from_superseded_peer_ignored() {
        let network = MockNetwork::new();
        let (mut ctrl, _rx) = controller(&network);
        let transport = RecordingTransport::new("me");

        ctrl.initiate("p1".into(), transport.clone()).await.unwrap();
        ctrl.initiate("p2".into(), transport.clone()).await.unwrap();

        ctrl.on_answer("p1".into(), SessionDescription::answer("v=0 mock-endpoint:0"))
            .await
            .unwrap();
        ctrl.on_candidate("p1".into(), IceCandidate::new("candidate:late"))
            .await
            .unwrap();

        assert_eq!(ctrl.current_peer(), Some(&PeerId::from("p2")));
        assert!(!ctrl.has_remote_description());
        assert_eq!(ctrl.pending_candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_incoming_offer_preempts_local_attempt() {
        let network = MockNetwork::new();
        let (mut ctrl, _rx) = controller(&network);
        let transport = RecordingTransport::new("me");

        ctrl.initiate("a".into(), transport.clone()).await.unwrap();
        let local_attempt = last_connection(&network);

        let (_remote, offer) = remote_offer(&network).await;
        ctrl.on_offer("b".into(), offer, None, transport.clone())
            .await
            .unwrap();

        assert!(local_attempt.is_closed());
        assert_eq!(ctrl.current_peer(), Some(&PeerId::from("b")));
        assert!(ctrl.has_remote_description());
        assert_eq!(transport.count("answer"), 1);
    }

    #[tokio::test]
    async fn test_offer_uses_offered_ice_servers() {
        let network = MockNetwork::new();
        let (mut ctrl, _rx) = controller(&network);
        let transport = RecordingTransport::new("me");

        let (_remote, offer) = remote_offer(&network).await;
        let servers = vec![IceServer::url("turn:turn.example.org")];
        ctrl.on_offer("b".into(), offer, Some(servers.clone()), transport)
            .await
            .unwrap();

        assert_eq!(last_connection(&network).ice_servers(), servers.as_slice());
    }

    #[tokio::test]
    async fn test_duplicate_offer_during_negotiation_ignored() {
        let network = MockNetwork::new();
        network.set_auto_connect(false);
        let (mut ctrl, _rx) = controller(&network);
        let transport = RecordingTransport::new("me");

        ctrl.initiate("b".into(), transport.clone()).await.unwrap();
        let (remote, offer) = remote_offer(&network).await;
        // Applying b's answer links our primitive so it leaves the New state
        let ours = network.connections()[0].clone();
        remote
            .set_remote_description(SessionDescription::offer(format!(
                "v=0 mock-endpoint:{}",
                ours.id()
            )))
            .await
            .unwrap();
        let answer = remote.create_answer().await.unwrap();
        ctrl.on_answer("b".into(), answer).await.unwrap();
        assert_eq!(ours.state(), PrimitiveState::Connecting);
        let session_epoch = ctrl.current_epoch();

        ctrl.on_offer("b".into(), offer, None, transport.clone())
            .await
            .unwrap();
        assert_eq!(ctrl.current_epoch(), session_epoch);
        assert_eq!(transport.count("answer"), 0);
    }

    #[tokio::test]
    async fn test_answer_applied_once() {
        let network = MockNetwork::new();
        let (mut ctrl, mut rx) = controller(&network);
        let transport = RecordingTransport::new("me");

        ctrl.initiate("b".into(), transport.clone()).await.unwrap();
        let ours = last_connection(&network);

        let (tx, _remote_rx) = mpsc::unbounded_channel();
        let remote = network.factory().create(EventSink::new(50, tx), &[]).await.unwrap();
        remote
            .set_remote_description(SessionDescription::offer(format!(
                "v=0 mock-endpoint:{}",
                ours.id()
            )))
            .await
            .unwrap();
        let answer = remote.create_answer().await.unwrap();

        ctrl.on_answer("b".into(), answer.clone()).await.unwrap();
        pump(&mut ctrl, &mut rx).await;
        assert_eq!(ctrl.state(), NegotiationState::Connected);
        let epoch = ctrl.current_epoch();

        ctrl.on_answer("b".into(), answer).await.unwrap();
        assert_eq!(ctrl.state(), NegotiationState::Connected);
        assert_eq!(ctrl.current_epoch(), epoch);
        assert_eq!(network.open_count(), 2);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let network = MockNetwork::new();
        network.set_auto_connect(false);
        let (mut ctrl, _rx) = controller(&network);
        let transport = RecordingTransport::new("me");

        ctrl.initiate("b".into(), transport).await.unwrap();
        let ours = last_connection(&network);

        ctrl.on_candidate("b".into(), IceCandidate::new("candidate:1"))
            .await
            .unwrap();
        ctrl.on_candidate("b".into(), IceCandidate::new("candidate:2"))
            .await
            .unwrap();
        assert_eq!(ctrl.pending_candidate_count(), 2);
        assert!(ours.added_candidates().is_empty());

        let (_remote, remote_desc) = remote_offer(&network).await;
        let answer = SessionDescription::answer(remote_desc.sdp);
        ctrl.on_answer("b".into(), answer).await.unwrap();
        ctrl.on_candidate("b".into(), IceCandidate::new("candidate:3"))
            .await
            .unwrap();

        let applied: Vec<_> = ours
            .added_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:1", "candidate:2", "candidate:3"]);
        assert_eq!(ctrl.pending_candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_peer_answer_is_incoming_request() {
        let network = MockNetwork::new();
        let (mut ctrl, _rx) = controller(&network);
        let mut events = ctrl.subscribe();

        ctrl.on_candidate("stranger".into(), IceCandidate::new("candidate:1"))
            .await
            .unwrap();
        ctrl.on_candidate("stranger".into(), IceCandidate::new("candidate:2"))
            .await
            .unwrap();

        assert_eq!(
            events.try_recv(),
            Some(ConnectionEvent::IncomingRequest {
                from: "stranger".into()
            })
        );
        assert_eq!(events.try_recv(), None);
        assert_eq!(ctrl.state(), NegotiationState::Ready);
    }

    #[tokio::test]
    async fn test_failed_state_normalizes_to_ready() {
        let network = MockNetwork::new();
        let (mut ctrl, mut rx) = controller(&network);
        let transport = RecordingTransport::new("me");

        ctrl.initiate("b".into(), transport).await.unwrap();
        last_connection(&network).fail();
        pump(&mut ctrl, &mut rx).await;

        assert_eq!(ctrl.state(), NegotiationState::Ready);
        assert!(ctrl.current_peer().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_resets_ready_and_blocks_send() {
        let network = MockNetwork::new();
        let (mut ctrl, mut rx) = controller(&network);
        let transport = RecordingTransport::new("me");

        ctrl.initiate("b".into(), transport).await.unwrap();
        assert!(matches!(
            ctrl.send(&ChannelPayload::Text("early".into())).await,
            Err(PeerError::NotReady)
        ));

        // Pretend the channel opened
        let epoch = ctrl.current_epoch().unwrap();
        ctrl.handle_event(TaggedEvent {
            epoch,
            event: PrimitiveEvent::ChannelOpen,
        })
        .await;
        pump(&mut ctrl, &mut rx).await;
        assert!(ctrl.is_ready());
        let mut ready = ctrl.ready_handle();
        ready.wait().await.unwrap();

        ctrl.disconnect().await;
        assert!(!ctrl.is_ready());
        assert_eq!(ctrl.state(), NegotiationState::Ready);
        assert!(matches!(
            ctrl.send(&ChannelPayload::Text("late".into())).await,
            Err(PeerError::NoActiveSession)
        ));

        let mut ready = ctrl.ready_handle();
        let waited = tokio::time::timeout(Duration::from_millis(20), ready.wait()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_message_event_decoded() {
        let network = MockNetwork::new();
        let (mut ctrl, _rx) = controller(&network);
        let transport = RecordingTransport::new("me");
        let mut events = ctrl.subscribe();

        ctrl.initiate("b".into(), transport).await.unwrap();
        let epoch = ctrl.current_epoch().unwrap();
        ctrl.handle_event(TaggedEvent {
            epoch,
            event: PrimitiveEvent::Message(ChannelFrame::Text("hi".into())),
        })
        .await;

        let mut got = None;
        while let Some(event) = events.try_recv() {
            if let ConnectionEvent::Message { from, payload } = event {
                got = Some((from, payload));
            }
        }
        assert_eq!(
            got,
            Some((PeerId::from("b"), ChannelPayload::Text("hi".to_string())))
        );
    }
}

//! Connection manager
//!
//! Chooses how to reach a peer (WebRTC negotiated over the broadcast carrier,
//! WebRTC negotiated over the relay, or plain relay fallback) and routes
//! sends through whichever mode is active. A single pump task feeds carrier
//! envelopes, presence syncs, fallback text and primitive callbacks into the
//! controller under the same lock the public entry points take.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastCarrier;
use crate::bus::{EventBus, Subscription};
use crate::connection::PeerConnectionFactory;
use crate::locality::LocalityClassifier;
use crate::peer::{ConnectionEvent, PeerConnectionController, PeerError, PrimitiveEvents, ReadyHandle};
use crate::presence::PresenceDirectory;
use crate::protocol::{ChannelPayload, FilePayload, MAX_FRAME_SIZE};
use crate::transport::{CarrierEvent, SignalingTransport, TransportError};
use crate::types::{
    CarrierKind, ConnectionMode, DeviceClass, IceServer, Locality, NegotiationState,
    PeerDescriptor, PeerId, PresenceAnnouncement, SignalingEnvelope,
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Peer error: {0}")]
    Peer(PeerError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("No active session")]
    NoActiveSession,
    #[error("Peer not ready")]
    NotReady,
    #[error("No signaling carrier available")]
    NoCarrier,
    #[error("{mode} cannot carry this payload: {reason}")]
    Capability {
        mode: ConnectionMode,
        reason: String,
    },
}

impl From<PeerError> for ConnectionError {
    fn from(e: PeerError) -> Self {
        match e {
            PeerError::NoActiveSession => ConnectionError::NoActiveSession,
            PeerError::NotReady => ConnectionError::NotReady,
            PeerError::Transport(e) => ConnectionError::Transport(e),
            other => ConnectionError::Peer(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveTarget {
    peer: PeerId,
    mode: ConnectionMode,
}

struct ManagerState {
    controller: PeerConnectionController,
    active: Option<ActiveTarget>,
}

/// The carriers a manager may negotiate over
#[derive(Clone)]
struct Carriers {
    near: Option<Arc<BroadcastCarrier>>,
    far: Option<Arc<dyn SignalingTransport>>,
}

impl Carriers {
    fn near_available(&self) -> bool {
        self.near.as_ref().is_some_and(|c| c.is_available())
    }

    fn get(&self, kind: CarrierKind) -> Option<Arc<dyn SignalingTransport>> {
        match kind {
            CarrierKind::Broadcast => self
                .near
                .clone()
                .map(|c| c as Arc<dyn SignalingTransport>),
            CarrierKind::Relay => self.far.clone(),
        }
    }

    /// Carrier whose message primitive replaces the data channel
    fn fallback(&self) -> Option<Arc<dyn SignalingTransport>> {
        if self.near_available() {
            return self.get(CarrierKind::Broadcast);
        }
        self.far.clone()
    }
}

pub struct ConnectionManagerBuilder {
    local_id: PeerId,
    factory: Arc<dyn PeerConnectionFactory>,
    ice_servers: Vec<IceServer>,
    near: Option<Arc<BroadcastCarrier>>,
    far: Option<Arc<dyn SignalingTransport>>,
    classifier: Option<Arc<LocalityClassifier>>,
}

impl ConnectionManagerBuilder {
    pub fn ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Broadcast carrier used for near peers
    pub fn near(mut self, carrier: Arc<BroadcastCarrier>) -> Self {
        self.near = Some(carrier);
        self
    }

    /// Relay carrier used for far peers
    pub fn far(mut self, carrier: Arc<dyn SignalingTransport>) -> Self {
        self.far = Some(carrier);
        self
    }

    pub fn classifier(mut self, classifier: Arc<LocalityClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Spawn the event pump; must run inside a tokio runtime
    pub fn build(self) -> ConnectionManager {
        let (controller, primitive_rx) = PeerConnectionController::new(self.factory, self.ice_servers);
        let events = controller.bus().clone();
        let ready = controller.ready_handle();
        let state = Arc::new(Mutex::new(ManagerState {
            controller,
            active: None,
        }));
        let directory = Arc::new(PresenceDirectory::new(self.local_id.clone()));
        let carriers = Carriers {
            near: self.near,
            far: self.far,
        };
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(LocalityClassifier::with_default_resolvers()));

        // Subscribe before spawning so nothing emitted in between is lost
        let feeds = CarrierFeeds {
            near: carriers.get(CarrierKind::Broadcast).map(|c| {
                let sub = c.subscribe();
                (c, sub)
            }),
            far: carriers.get(CarrierKind::Relay).map(|c| {
                let sub = c.subscribe();
                (c, sub)
            }),
        };
        let pump = tokio::spawn(pump(
            state.clone(),
            feeds,
            directory.clone(),
            events.clone(),
            primitive_rx,
        ));

        ConnectionManager {
            local_id: self.local_id,
            state,
            carriers,
            directory,
            classifier,
            events,
            ready,
            pump,
        }
    }
}

pub struct ConnectionManager {
    local_id: PeerId,
    state: Arc<Mutex<ManagerState>>,
    carriers: Carriers,
    directory: Arc<PresenceDirectory>,
    classifier: Arc<LocalityClassifier>,
    events: EventBus<ConnectionEvent>,
    ready: ReadyHandle,
    pump: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn builder(
        local_id: PeerId,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            local_id,
            factory,
            ice_servers: vec![IceServer::default()],
            near: None,
            far: None,
            classifier: None,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn directory(&self) -> &Arc<PresenceDirectory> {
        &self.directory
    }

    pub fn classifier(&self) -> &Arc<LocalityClassifier> {
        &self.classifier
    }

    /// Connection events for the UI
    pub fn subscribe(&self) -> Subscription<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn peers(&self) -> Vec<PeerDescriptor> {
        self.directory.peers().await
    }

    pub async fn state(&self) -> NegotiationState {
        self.state.lock().await.controller.state()
    }

    pub async fn active_mode(&self) -> Option<ConnectionMode> {
        self.state.lock().await.active.as_ref().map(|a| a.mode)
    }

    /// Peer the active session or fallback targets
    pub async fn selected_peer(&self) -> Option<PeerId> {
        self.state.lock().await.active.as_ref().map(|a| a.peer.clone())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    /// Wait until a data channel opens
    pub async fn wait_ready(&self) -> Result<(), ConnectionError> {
        let mut ready = self.ready.clone();
        ready.wait().await?;
        Ok(())
    }

    /// Publish our presence on the broadcast carrier
    pub async fn announce(
        &self,
        name: Option<&str>,
        device: DeviceClass,
    ) -> Result<(), ConnectionError> {
        let near = self.carriers.near.as_ref().ok_or(ConnectionError::NoCarrier)?;
        let identity = self.classifier.resolve_self_identity().await;
        let mut presence = PresenceAnnouncement::new(self.local_id.clone(), device, identity);
        if let Some(name) = name {
            presence = presence.with_name(name);
        }
        near.announce(&presence).await?;
        Ok(())
    }

    pub async fn select_mode(&self, peer: &PeerId, hint: Locality) -> ConnectionMode {
        let state = self.state.lock().await;
        let mode = self.mode_for(&state, hint);
        debug!("Mode for {} ({:?}): {}", peer, hint, mode);
        mode
    }

    fn mode_for(&self, state: &ManagerState, hint: Locality) -> ConnectionMode {
        if state.controller.state() == NegotiationState::Connected {
            if let Some(kind) = state.controller.current_carrier() {
                return kind.webrtc_mode();
            }
        }
        match hint {
            Locality::Near if self.carriers.near_available() => ConnectionMode::NearWebrtc,
            Locality::Far if self.carriers.far.is_some() => ConnectionMode::FarWebrtc,
            _ => ConnectionMode::RelayFallback,
        }
    }

    /// Connect to `peer`, negotiating over the carrier implied by `hint`
    pub async fn connect(
        &self,
        peer: &PeerId,
        hint: Locality,
    ) -> Result<ConnectionMode, ConnectionError> {
        let mut state = self.state.lock().await;

        if state.controller.state() == NegotiationState::Connected
            && state.controller.current_peer() == Some(peer)
        {
            if let Some(kind) = state.controller.current_carrier() {
                debug!("Already connected to {}", peer);
                return Ok(kind.webrtc_mode());
            }
        }

        let mode = self.mode_for(&state, hint);
        match mode.negotiation_carrier() {
            Some(kind) => {
                let transport = self.carriers.get(kind).ok_or(ConnectionError::NoCarrier)?;
                state.controller.initiate(peer.clone(), transport).await?;
            }
            None => {
                self.carriers.fallback().ok_or(ConnectionError::NoCarrier)?;
                state.controller.disconnect().await;
            }
        }

        info!("Connecting to {} via {}", peer, mode);
        state.active = Some(ActiveTarget {
            peer: peer.clone(),
            mode,
        });
        self.events.emit(ConnectionEvent::ModeSelected {
            peer: peer.clone(),
            mode,
        });
        Ok(mode)
    }

    /// Classify the peer from presence, then connect
    pub async fn connect_auto(&self, peer: &PeerId) -> Result<ConnectionMode, ConnectionError> {
        let hint = match self.directory.get(peer).await {
            Some(descriptor) => {
                self.classifier
                    .classify_peer(&descriptor.network_identity)
                    .await
            }
            None => Locality::Far,
        };
        self.connect(peer, hint).await
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        let state = self.state.lock().await;
        if let Some(active) = state
            .active
            .as_ref()
            .filter(|a| a.mode == ConnectionMode::RelayFallback)
        {
            let carrier = self.carriers.fallback().ok_or(ConnectionError::NoCarrier)?;
            carrier.send_text(&active.peer, text).await?;
            return Ok(());
        }
        state
            .controller
            .send(&ChannelPayload::Text(text.to_string()))
            .await?;
        Ok(())
    }

    /// Send files over the data channel; all are checked before any is sent
    pub async fn send_files(&self, files: Vec<FilePayload>) -> Result<(), ConnectionError> {
        let state = self.state.lock().await;
        if let Some(active) = &state.active {
            if active.mode == ConnectionMode::RelayFallback {
                return Err(ConnectionError::Capability {
                    mode: active.mode,
                    reason: "file transfer needs a data channel".to_string(),
                });
            }
        }
        if state.controller.current_peer().is_none() {
            return Err(ConnectionError::NoActiveSession);
        }
        if !state.controller.is_ready() {
            return Err(ConnectionError::NotReady);
        }

        let mode = state
            .controller
            .current_carrier()
            .map(|kind| kind.webrtc_mode())
            .unwrap_or(ConnectionMode::NearWebrtc);
        if let Some(file) = files.iter().find(|f| f.frame_len() > MAX_FRAME_SIZE) {
            return Err(ConnectionError::Capability {
                mode,
                reason: format!(
                    "{} needs {} bytes, frame limit is {}",
                    file.name,
                    file.frame_len(),
                    MAX_FRAME_SIZE
                ),
            });
        }

        for file in files {
            state.controller.send(&ChannelPayload::File(file)).await?;
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.controller.disconnect().await;
        state.active = None;
    }

    /// Stop the pump, close the session and carriers, release subscribers
    pub async fn shutdown(&self) {
        self.pump.abort();
        {
            let mut state = self.state.lock().await;
            state.active = None;
            state.controller.shutdown().await;
        }
        self.directory.clear().await;
        if let Some(near) = &self.carriers.near {
            near.close().await;
        }
        if let Some(far) = &self.carriers.far {
            far.close().await;
        }
        info!("Connection manager for {} shut down", self.local_id);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Next event from an optional carrier; pending forever once it is gone
async fn next_event(subscription: &mut Option<Subscription<CarrierEvent>>) -> CarrierEvent {
    loop {
        match subscription {
            Some(sub) => match sub.recv().await {
                Some(event) => return event,
                None => *subscription = None,
            },
            None => return std::future::pending().await,
        }
    }
}

/// Carrier subscriptions taken before the pump starts
struct CarrierFeeds {
    near: Option<(Arc<dyn SignalingTransport>, Subscription<CarrierEvent>)>,
    far: Option<(Arc<dyn SignalingTransport>, Subscription<CarrierEvent>)>,
}

async fn pump(
    state: Arc<Mutex<ManagerState>>,
    feeds: CarrierFeeds,
    directory: Arc<PresenceDirectory>,
    events: EventBus<ConnectionEvent>,
    mut primitive_rx: PrimitiveEvents,
) {
    let (near, mut near_events) = match feeds.near {
        Some((carrier, sub)) => (Some(carrier), Some(sub)),
        None => (None, None),
    };
    let (far, mut far_events) = match feeds.far {
        Some((carrier, sub)) => (Some(carrier), Some(sub)),
        None => (None, None),
    };

    loop {
        tokio::select! {
            event = next_event(&mut near_events) => {
                if let Some(carrier) = &near {
                    on_carrier_event(&state, &directory, &events, event, carrier.clone()).await;
                }
            }
            event = next_event(&mut far_events) => {
                if let Some(carrier) = &far {
                    on_carrier_event(&state, &directory, &events, event, carrier.clone()).await;
                }
            }
            tagged = primitive_rx.recv() => match tagged {
                Some(tagged) => state.lock().await.controller.handle_event(tagged).await,
                None => break,
            },
        }
    }
    debug!("Connection manager pump stopped");
}

async fn on_carrier_event(
    state: &Mutex<ManagerState>,
    directory: &PresenceDirectory,
    events: &EventBus<ConnectionEvent>,
    event: CarrierEvent,
    carrier: Arc<dyn SignalingTransport>,
) {
    match event {
        CarrierEvent::Envelope(envelope) => {
            let kind = carrier.kind();
            let offer_from = match &envelope {
                SignalingEnvelope::Offer { from, .. } => Some(from.clone()),
                _ => None,
            };
            let mut state = state.lock().await;
            if let Err(e) = state.controller.handle_envelope(envelope, carrier).await {
                warn!("Failed to handle {:?} envelope: {}", kind, e);
                return;
            }

            // An accepted offer makes its sender the active target
            let Some(from) = offer_from else {
                return;
            };
            if state.controller.current_peer() != Some(&from)
                || state.controller.current_carrier() != Some(kind)
            {
                return;
            }
            let target = ActiveTarget {
                peer: from.clone(),
                mode: kind.webrtc_mode(),
            };
            if state.active.as_ref() != Some(&target) {
                state.active = Some(target);
                events.emit(ConnectionEvent::ModeSelected {
                    peer: from,
                    mode: kind.webrtc_mode(),
                });
            }
        }
        CarrierEvent::Text { from, text } => {
            let state = state.lock().await;
            let targeted = state
                .active
                .as_ref()
                .is_some_and(|a| a.mode == ConnectionMode::RelayFallback && a.peer == from);
            if targeted {
                events.emit(ConnectionEvent::Message {
                    from,
                    payload: ChannelPayload::Text(text),
                });
            } else {
                debug!("Dropping carrier text from {}", from);
            }
        }
        CarrierEvent::PresenceSync(presence) => {
            let peers = directory.apply_sync(&presence).await;
            debug!("Directory now holds {} peers", peers.len());
        }
    }
}

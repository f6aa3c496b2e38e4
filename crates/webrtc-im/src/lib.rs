//! Peer-to-peer negotiation core for webrtc-im
//!
//! Endpoints discover each other through presence on a broadcast channel,
//! decide whether a peer is on the same network, and negotiate a WebRTC
//! data channel over one of two signaling carriers. When neither WebRTC
//! mode is possible, text falls back to the carrier's own message primitive.
//!
//! # Overview
//!
//! - **Carriers**: [`BroadcastCarrier`] (presence pub/sub, near peers) and
//!   [`RelayCarrier`] (acknowledged WebSocket relay, far peers)
//! - **Negotiation**: [`PeerConnectionController`] runs offer/answer/trickle
//!   ICE against a fresh primitive per session
//! - **Routing**: [`ConnectionManager`] picks the mode and routes sends
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webrtc_im::{
//!     Config, ConnectionManager, DeviceClass, Locality, PeerId, RelayCarrier,
//!     RtcPeerConnectionFactory,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load()?;
//!     let local_id = PeerId::generate();
//!
//!     let relay = RelayCarrier::connect(&config.relay, local_id.clone(), DeviceClass::Desktop).await?;
//!     let manager = ConnectionManager::builder(local_id, Arc::new(RtcPeerConnectionFactory::new()))
//!         .ice_servers(config.ice.servers.clone())
//!         .far(Arc::new(relay))
//!         .build();
//!
//!     manager.connect(&PeerId::from("friend"), Locality::Far).await?;
//!     manager.wait_ready().await?;
//!     manager.send_text("hello").await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod bus;
pub mod config;
pub mod connection;
pub mod locality;
pub mod manager;
pub mod mock;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod rtc;
pub mod transport;
pub mod types;

pub use broadcast::{BroadcastCarrier, ChannelFeed, PresenceChannel};
pub use bus::{BusError, EventBus, Subscription};
pub use config::{parse_ice_servers, Config};
pub use connection::{
    EventSink, NegotiationError, PeerConnection, PeerConnectionFactory, PrimitiveEvent,
    PrimitiveState, TaggedEvent,
};
pub use locality::{
    classify, default_resolvers, http_resolvers, HttpIdentityResolver, IdentityResolver,
    LocalityClassifier, StaticIdentityResolver,
};
pub use manager::{ConnectionError, ConnectionManager, ConnectionManagerBuilder};
pub use mock::{MemoryPresenceHub, MockNetwork, MockPeerConnectionFactory};
pub use peer::{ConnectionEvent, PeerConnectionController, PeerError, ReadyHandle};
pub use presence::PresenceDirectory;
pub use protocol::{ChannelFrame, ChannelPayload, FilePayload, FrameError, MAX_FRAME_SIZE};
pub use relay::RelayCarrier;
pub use rtc::RtcPeerConnectionFactory;
pub use transport::{CarrierEvent, SignalingTransport, TransportError};
pub use types::*;

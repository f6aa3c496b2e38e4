//! Shared data model for peer negotiation
//!
//! Identifiers, presence descriptors, signaling envelopes and the
//! connection-level enums used across carriers and the controller.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Data channel label, shared with browser peers
pub const DATA_CHANNEL_LABEL: &str = "file-transfer";

/// Retransmit limit for the ordered data channel
pub const MAX_RETRANSMITS: u16 = 50;

/// Default STUN server used when no ICE servers are configured
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Wire sentinel for an unknown network identity
pub const UNKNOWN_IDENTITY: &str = "WAN";

/// Opaque identifier of one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for a new endpoint
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Device class advertised in presence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    #[default]
    #[serde(rename = "PC")]
    Desktop,
    #[serde(rename = "MOBILE")]
    Mobile,
}

impl DeviceClass {
    /// Lenient parse; anything but `MOBILE` is a desktop
    pub fn from_wire(s: &str) -> Self {
        if s.eq_ignore_ascii_case("MOBILE") {
            DeviceClass::Mobile
        } else {
            DeviceClass::Desktop
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            DeviceClass::Desktop => "PC",
            DeviceClass::Mobile => "MOBILE",
        }
    }
}

/// Externally observed address of an endpoint, or unknown
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum NetworkIdentity {
    Known(String),
    #[default]
    Unknown,
}

impl NetworkIdentity {
    pub fn from_wire(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s == UNKNOWN_IDENTITY {
            NetworkIdentity::Unknown
        } else {
            NetworkIdentity::Known(s.to_string())
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            NetworkIdentity::Known(s) => s,
            NetworkIdentity::Unknown => UNKNOWN_IDENTITY,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, NetworkIdentity::Unknown)
    }
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl Serialize for NetworkIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for NetworkIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| NetworkIdentity::from_wire(&s))
            .unwrap_or(NetworkIdentity::Unknown))
    }
}

/// A known remote endpoint, as seen through presence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub device_class: DeviceClass,
    pub network_identity: NetworkIdentity,
    pub display_name: Option<String>,
}

impl PeerDescriptor {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            device_class: DeviceClass::default(),
            network_identity: NetworkIdentity::Unknown,
            display_name: None,
        }
    }

    pub fn with_identity(mut self, identity: NetworkIdentity) -> Self {
        self.network_identity = identity;
        self
    }
}

/// Presence payload this endpoint tracks on the broadcast channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceAnnouncement {
    pub id: PeerId,
    pub device: DeviceClass,
    pub ip: NetworkIdentity,
    pub hash: NetworkIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PresenceAnnouncement {
    pub fn new(id: PeerId, device: DeviceClass, identity: NetworkIdentity) -> Self {
        Self {
            id,
            device,
            ip: identity.clone(),
            hash: identity,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP blob plus its role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for WebRTC connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }
}

/// One STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

impl Default for IceServer {
    fn default() -> Self {
        Self::url(DEFAULT_ICE_SERVER)
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    match Urls::deserialize(deserializer)? {
        Urls::One(url) => Ok(vec![url]),
        Urls::Many(urls) if !urls.is_empty() => Ok(urls),
        Urls::Many(_) => Err(de::Error::custom("ICE server needs at least one url")),
    }
}

/// Addressed negotiation message exchanged through a carrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingEnvelope {
    Offer {
        from: PeerId,
        to: PeerId,
        description: SessionDescription,
        #[serde(
            rename = "iceServers",
            default,
            deserialize_with = "crate::config::deserialize_ice_servers",
            skip_serializing_if = "Option::is_none"
        )]
        ice_servers: Option<Vec<IceServer>>,
    },
    Answer {
        from: PeerId,
        to: PeerId,
        description: SessionDescription,
    },
    Candidate {
        from: PeerId,
        to: PeerId,
        candidate: IceCandidate,
    },
}

impl SignalingEnvelope {
    pub fn from(&self) -> &PeerId {
        match self {
            SignalingEnvelope::Offer { from, .. }
            | SignalingEnvelope::Answer { from, .. }
            | SignalingEnvelope::Candidate { from, .. } => from,
        }
    }

    pub fn to(&self) -> &PeerId {
        match self {
            SignalingEnvelope::Offer { to, .. }
            | SignalingEnvelope::Answer { to, .. }
            | SignalingEnvelope::Candidate { to, .. } => to,
        }
    }

    /// Check if this envelope is addressed to `peer_id`
    pub fn is_for(&self, peer_id: &PeerId) -> bool {
        self.to() == peer_id
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEnvelope::Offer { .. } => "offer",
            SignalingEnvelope::Answer { .. } => "answer",
            SignalingEnvelope::Candidate { .. } => "candidate",
        }
    }
}

/// Negotiation state exposed to callers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NegotiationState {
    #[default]
    Ready,
    Connecting,
    Connected,
}

impl NegotiationState {
    pub fn is_active(&self) -> bool {
        !matches!(self, NegotiationState::Ready)
    }
}

/// Which signaling carrier a session runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CarrierKind {
    Broadcast,
    Relay,
}

impl CarrierKind {
    /// Mode a WebRTC session negotiated over this carrier runs in
    pub fn webrtc_mode(&self) -> ConnectionMode {
        match self {
            CarrierKind::Broadcast => ConnectionMode::NearWebrtc,
            CarrierKind::Relay => ConnectionMode::FarWebrtc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
    NearWebrtc,
    FarWebrtc,
    RelayFallback,
}

impl ConnectionMode {
    /// Carrier used to negotiate, None for fallback
    pub fn negotiation_carrier(&self) -> Option<CarrierKind> {
        match self {
            ConnectionMode::NearWebrtc => Some(CarrierKind::Broadcast),
            ConnectionMode::FarWebrtc => Some(CarrierKind::Relay),
            ConnectionMode::RelayFallback => None,
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionMode::NearWebrtc => "webrtc-lan",
            ConnectionMode::FarWebrtc => "webrtc-wan",
            ConnectionMode::RelayFallback => "relay-fallback",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    Near,
    Far,
}

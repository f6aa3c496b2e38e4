//! Directory of known peers derived from presence
//!
//! Owns the deduplicated, self-filtered peer set. Each instance belongs to
//! one endpoint; there is no process-wide peer list.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::bus::{EventBus, Subscription};
use crate::transport::PresenceState;
use crate::types::{DeviceClass, NetworkIdentity, PeerDescriptor, PeerId};

pub struct PresenceDirectory {
    local_id: PeerId,
    peers: RwLock<HashMap<PeerId, PeerDescriptor>>,
    changes: EventBus<Vec<PeerDescriptor>>,
}

/// Non-empty string field from a presence object
fn field<'a>(value: &'a Value, name: &str) -> Option<&'a str> {
    value
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Build a descriptor from one raw presence entry
///
/// Fields nested under `metas[0]` win over fields on the entry itself.
pub fn parse_presence_entry(key: &str, entry: &Value) -> PeerDescriptor {
    let member = entry
        .get("metas")
        .and_then(|m| m.get(0))
        .unwrap_or(&Value::Null);
    let pick = |name: &str| field(member, name).or_else(|| field(entry, name));

    let device_class = pick("device")
        .map(DeviceClass::from_wire)
        .unwrap_or_default();
    let network_identity = pick("hash")
        .map(NetworkIdentity::from_wire)
        .filter(|id| !id.is_unknown())
        .or_else(|| pick("ip").map(NetworkIdentity::from_wire))
        .unwrap_or_default();

    PeerDescriptor {
        id: PeerId::new(key),
        device_class,
        network_identity,
        display_name: pick("name").map(str::to_string),
    }
}

impl PresenceDirectory {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            peers: RwLock::new(HashMap::new()),
            changes: EventBus::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Replace the peer set with a full presence snapshot
    pub async fn apply_sync(&self, state: &PresenceState) -> Vec<PeerDescriptor> {
        let mut keys: Vec<&String> = state.keys().collect();
        keys.sort();

        let mut next = HashMap::new();
        for key in keys {
            for entry in &state[key] {
                let descriptor = parse_presence_entry(key, entry);
                if descriptor.id != self.local_id {
                    next.insert(descriptor.id.clone(), descriptor);
                }
            }
        }
        debug!("Presence sync: {} peers", next.len());

        *self.peers.write().await = next;
        self.publish().await
    }

    /// Merge one peer by id, last write wins
    pub async fn upsert(&self, descriptor: PeerDescriptor) -> bool {
        if descriptor.id == self.local_id {
            return false;
        }
        self.peers
            .write()
            .await
            .insert(descriptor.id.clone(), descriptor);
        self.publish().await;
        true
    }

    pub async fn remove(&self, id: &PeerId) -> Option<PeerDescriptor> {
        let removed = self.peers.write().await.remove(id);
        if removed.is_some() {
            self.publish().await;
        }
        removed
    }

    pub async fn get(&self, id: &PeerId) -> Option<PeerDescriptor> {
        self.peers.read().await.get(id).cloned()
    }

    /// Known peers sorted by id
    pub async fn peers(&self) -> Vec<PeerDescriptor> {
        let mut peers: Vec<_> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Teardown: forget every peer and release subscribers
    pub async fn clear(&self) {
        self.peers.write().await.clear();
        self.changes.emit(Vec::new());
        self.changes.clear();
    }

    pub fn subscribe(&self) -> Subscription<Vec<PeerDescriptor>> {
        self.changes.subscribe()
    }

    async fn publish(&self) -> Vec<PeerDescriptor> {
        let peers = self.peers().await;
        self.changes.emit(peers.clone());
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(entries: Vec<(&str, Value)>) -> PresenceState {
        let mut state = PresenceState::new();
        for (key, value) in entries {
            state.entry(key.to_string()).or_default().push(value);
        }
        state
    }

    #[test]
    fn test_raw_entry() {
        let d = parse_presence_entry(
            "u1",
            &json!({"id": "u1", "device": "MOBILE", "ip": "1.2.3.4", "hash": "1.2.3.4", "name": "phone"}),
        );
        assert_eq!(d.id.as_str(), "u1");
        assert_eq!(d.device_class, DeviceClass::Mobile);
        assert_eq!(d.network_identity, NetworkIdentity::from_wire("1.2.3.4"));
        assert_eq!(d.display_name.as_deref(), Some("phone"));
    }

    #[test]
    fn test_nested_meta_wins() {
        let d = parse_presence_entry(
            "u1",
            &json!({
                "ip": "9.9.9.9",
                "name": "raw",
                "metas": [{"ip": "1.2.3.4", "hash": "1.2.3.4", "name": "nested"}]
            }),
        );
        assert_eq!(d.network_identity, NetworkIdentity::from_wire("1.2.3.4"));
        assert_eq!(d.display_name.as_deref(), Some("nested"));
    }

    #[test]
    fn test_nested_falls_back_to_raw_per_field() {
        let d = parse_presence_entry(
            "u1",
            &json!({"device": "MOBILE", "metas": [{"name": "", "hash": "5.6.7.8"}], "name": "raw"}),
        );
        assert_eq!(d.device_class, DeviceClass::Mobile);
        assert_eq!(d.display_name.as_deref(), Some("raw"));
        assert_eq!(d.network_identity, NetworkIdentity::from_wire("5.6.7.8"));
    }

    #[test]
    fn test_defaults() {
        let d = parse_presence_entry("u1", &json!({}));
        assert_eq!(d.device_class, DeviceClass::Desktop);
        assert!(d.network_identity.is_unknown());
        assert!(d.display_name.is_none());
    }

    #[test]
    fn test_ip_used_when_hash_unknown() {
        let d = parse_presence_entry("u1", &json!({"hash": "WAN", "ip": "1.2.3.4"}));
        assert_eq!(d.network_identity, NetworkIdentity::from_wire("1.2.3.4"));
    }

    #[tokio::test]
    async fn test_sync_filters_self_and_dedups() {
        let dir = PresenceDirectory::new("me".into());
        let state = snapshot(vec![
            ("me", json!({"ip": "1.1.1.1"})),
            ("u1", json!({"ip": "1.1.1.1", "name": "first"})),
            ("u1", json!({"ip": "2.2.2.2", "name": "second"})),
            ("u2", json!({})),
        ]);

        let peers = dir.apply_sync(&state).await;
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].id.as_str(), "u1");
        assert_eq!(peers[0].display_name.as_deref(), Some("second"));
        assert!(dir.get(&"me".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_sync_is_full_rebuild() {
        let dir = PresenceDirectory::new("me".into());
        dir.apply_sync(&snapshot(vec![("u1", json!({})), ("u2", json!({}))]))
            .await;
        dir.apply_sync(&snapshot(vec![("u2", json!({}))])).await;

        let ids: Vec<_> = dir.peers().await.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PeerId::from("u2")]);
    }

    #[tokio::test]
    async fn test_upsert_remove_and_notifications() {
        let dir = PresenceDirectory::new("me".into());
        let mut changes = dir.subscribe();

        assert!(!dir.upsert(PeerDescriptor::new("me")).await);
        assert!(dir.upsert(PeerDescriptor::new("u1")).await);
        assert_eq!(changes.try_recv().map(|p| p.len()), Some(1));

        assert!(dir.remove(&"u1".into()).await.is_some());
        assert_eq!(changes.try_recv().map(|p| p.len()), Some(0));
        assert!(dir.remove(&"u1".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_releases_subscribers() {
        let dir = PresenceDirectory::new("me".into());
        let mut changes = dir.subscribe();
        dir.upsert(PeerDescriptor::new("u1")).await;
        dir.clear().await;

        assert!(dir.is_empty().await);
        assert_eq!(changes.recv().await.map(|p| p.len()), Some(1));
        assert_eq!(changes.recv().await.map(|p| p.len()), Some(0));
        assert_eq!(changes.recv().await, None);
    }
}

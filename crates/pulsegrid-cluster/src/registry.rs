//! Cluster registry — tracks peer nodes seen through heartbeats.
//!
//! Every node broadcasts a `NodeInfo` heartbeat periodically. The registry
//! keeps the latest one per peer and forgets peers that stay silent for
//! longer than a TTL. The local node is never stored.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use pulse_core::NodeId;
use pulsegrid_control::{NodeInfo, NodeMetrics};

/// Registry view of a peer node.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: NodeId,
    pub name: String,
    pub version: String,
    pub num_clients: u32,
    pub num_users: u32,
    pub num_channels: u32,
    pub num_subs: u32,
    /// Seconds the peer has been running, as reported.
    pub uptime: u64,
    pub metrics: Option<NodeMetrics>,
    pub data: Vec<u8>,
    pub last_seen: Instant,
}

impl PeerInfo {
    fn from_heartbeat(info: NodeInfo, now: Instant) -> Self {
        Self {
            id: info.uid,
            name: info.name,
            version: info.version,
            num_clients: info.num_clients,
            num_users: info.num_users,
            num_channels: info.num_channels,
            num_subs: info.num_subs,
            uptime: info.uptime,
            metrics: info.metrics,
            data: info.data,
            last_seen: now,
        }
    }
}

/// Peer table shared by every connection and control-message receipt.
///
/// Reads (snapshots, survey sizing) far outnumber writes (one heartbeat
/// per peer per interval), hence the `RwLock`.
pub struct ClusterRegistry {
    local_id: NodeId,
    peers: RwLock<HashMap<NodeId, PeerInfo>>,
}

impl ClusterRegistry {
    /// Create an empty registry for the node `local_id`.
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a peer from its heartbeat.
    ///
    /// Returns `true` if the peer was not known before. Heartbeats carrying
    /// the local node ID are ignored.
    pub fn apply_heartbeat(&self, info: NodeInfo, now: Instant) -> bool {
        if info.uid == self.local_id {
            debug!(node_id = %info.uid, "ignoring own heartbeat");
            return false;
        }
        if info.uid.is_empty() {
            warn!("ignoring heartbeat without node id");
            return false;
        }

        let peer = PeerInfo::from_heartbeat(info, now);
        let node_id = peer.id.clone();
        let mut peers = self.peers.write().expect("registry lock");
        let is_new = peers.insert(node_id.clone(), peer).is_none();
        if is_new {
            info!(%node_id, "peer joined cluster");
        } else {
            debug!(%node_id, "heartbeat received");
        }
        is_new
    }

    /// Remove peers not heard from within `ttl` of `now`.
    ///
    /// Returns the IDs that were removed. Calling it again with the same
    /// arguments removes nothing.
    pub fn sweep_expired(&self, now: Instant, ttl: Duration) -> Vec<NodeId> {
        let mut peers = self.peers.write().expect("registry lock");
        let expired: Vec<NodeId> = peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > ttl)
            .map(|p| p.id.clone())
            .collect();

        for node_id in &expired {
            peers.remove(node_id);
            warn!(%node_id, "peer expired");
        }
        expired
    }

    /// Remove a peer immediately, e.g. after its shutdown announcement.
    pub fn remove(&self, node_id: &str) -> bool {
        let mut peers = self.peers.write().expect("registry lock");
        let existed = peers.remove(node_id).is_some();
        if existed {
            info!(%node_id, "peer left cluster");
        }
        existed
    }

    /// Get a single peer by ID.
    pub fn get(&self, node_id: &str) -> Option<PeerInfo> {
        let peers = self.peers.read().expect("registry lock");
        peers.get(node_id).cloned()
    }

    /// Point-in-time list of peers ordered by node ID.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().expect("registry lock");
        let mut list: Vec<PeerInfo> = peers.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// IDs of all known peers.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        let peers = self.peers.read().expect("registry lock");
        peers.keys().cloned().collect()
    }

    /// Number of known peers (excluding the local node).
    pub fn len(&self) -> usize {
        let peers = self.peers.read().expect("registry lock");
        peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of nodes in the cluster including the local node.
    pub fn cluster_size(&self) -> usize {
        self.len() + 1
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(id: &str) -> NodeInfo {
        NodeInfo {
            uid: id.to_string(),
            name: format!("{id}-name"),
            version: "0.1.0".to_string(),
            num_clients: 3,
            ..Default::default()
        }
    }

    #[test]
    fn heartbeat_inserts_peer() {
        let registry = ClusterRegistry::new("node-1");
        let now = Instant::now();

        assert!(registry.apply_heartbeat(heartbeat("node-2"), now));
        let peer = registry.get("node-2").unwrap();
        assert_eq!(peer.name, "node-2-name");
        assert_eq!(peer.num_clients, 3);
        assert_eq!(registry.cluster_size(), 2);
    }

    #[test]
    fn heartbeat_replaces_peer() {
        let registry = ClusterRegistry::new("node-1");
        let now = Instant::now();
        registry.apply_heartbeat(heartbeat("node-2"), now);

        let mut updated = heartbeat("node-2");
        updated.num_clients = 10;
        assert!(!registry.apply_heartbeat(updated, now + Duration::from_secs(1)));

        let peer = registry.get("node-2").unwrap();
        assert_eq!(peer.num_clients, 10);
        assert_eq!(peer.last_seen, now + Duration::from_secs(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn own_heartbeat_is_ignored() {
        let registry = ClusterRegistry::new("node-1");
        assert!(!registry.apply_heartbeat(heartbeat("node-1"), Instant::now()));
        assert!(registry.is_empty());
    }

    #[test]
    fn sweep_before_ttl_retains_peer() {
        let registry = ClusterRegistry::new("node-1");
        let now = Instant::now();
        registry.apply_heartbeat(heartbeat("node-2"), now);

        let removed = registry.sweep_expired(now + Duration::from_secs(5), Duration::from_secs(10));
        assert!(removed.is_empty());
        assert_eq!(registry.snapshot()[0].id, "node-2");
    }

    #[test]
    fn sweep_after_ttl_removes_peer() {
        let registry = ClusterRegistry::new("node-1");
        let now = Instant::now();
        registry.apply_heartbeat(heartbeat("node-2"), now);

        let removed = registry.sweep_expired(now + Duration::from_secs(11), Duration::from_secs(10));
        assert_eq!(removed, vec!["node-2".to_string()]);
        assert!(registry.snapshot().is_empty());

        // Idempotent.
        let again = registry.sweep_expired(now + Duration::from_secs(11), Duration::from_secs(10));
        assert!(again.is_empty());
    }

    #[test]
    fn sweep_keeps_fresh_peers() {
        let registry = ClusterRegistry::new("node-1");
        let now = Instant::now();
        registry.apply_heartbeat(heartbeat("node-2"), now);
        registry.apply_heartbeat(heartbeat("node-3"), now + Duration::from_secs(8));

        let removed = registry.sweep_expired(now + Duration::from_secs(12), Duration::from_secs(10));
        assert_eq!(removed, vec!["node-2".to_string()]);
        assert!(registry.get("node-3").is_some());
    }

    #[test]
    fn snapshot_is_ordered() {
        let registry = ClusterRegistry::new("node-1");
        let now = Instant::now();
        registry.apply_heartbeat(heartbeat("node-c"), now);
        registry.apply_heartbeat(heartbeat("node-a"), now);
        registry.apply_heartbeat(heartbeat("node-b"), now);

        let ids: Vec<String> = registry.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["node-a", "node-b", "node-c"]);
    }

    #[test]
    fn remove_peer() {
        let registry = ClusterRegistry::new("node-1");
        registry.apply_heartbeat(heartbeat("node-2"), Instant::now());
        assert!(registry.remove("node-2"));
        assert!(!registry.remove("node-2"));
        assert!(registry.get("node-2").is_none());
    }
}

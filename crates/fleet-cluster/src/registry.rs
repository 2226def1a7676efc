//! Node registry — tracks configured peers and their snapshots.
//!
//! Peer state is fed by transport events (connect/disconnect) and cluster
//! broadcasts (snapshots), always through the control loop, so the registry
//! needs no locking. Snapshots are last-write-wins with no version check.

use std::collections::BTreeMap;

use fleet_core::types::{HostAndPort, NodeDescriptor, NodeId, NodeSnapshot};
use fleet_placement::Candidate;
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Disconnected,
    Connected,
}

/// A configured peer node.
#[derive(Debug, Clone)]
pub struct Peer {
    pub descriptor: NodeDescriptor,
    pub status: PeerStatus,
    /// Latest snapshot received while connected.
    pub snapshot: Option<NodeSnapshot>,
}

impl Peer {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn is_connected(&self) -> bool {
        self.status == PeerStatus::Connected
    }
}

pub struct NodeRegistry {
    local: NodeDescriptor,
    peers: BTreeMap<NodeId, Peer>,
    current: Option<NodeSnapshot>,
    previous: Option<NodeSnapshot>,
}

impl NodeRegistry {
    /// Create a registry for `local` with every configured peer disconnected.
    pub fn new(local: NodeDescriptor, peers: impl IntoIterator<Item = NodeDescriptor>) -> Self {
        let peers = peers
            .into_iter()
            .filter(|p| p.id != local.id)
            .map(|descriptor| {
                (
                    descriptor.id.clone(),
                    Peer {
                        descriptor,
                        status: PeerStatus::Disconnected,
                        snapshot: None,
                    },
                )
            })
            .collect();
        Self {
            local,
            peers,
            current: None,
            previous: None,
        }
    }

    pub fn local(&self) -> &NodeDescriptor {
        &self.local
    }

    pub fn local_id(&self) -> &str {
        &self.local.id
    }

    /// Every configured peer, ordered by id.
    pub fn list_peers(&self) -> Vec<&Peer> {
        self.peers.values().collect()
    }

    pub fn peer(&self, node_id: &str) -> Option<&Peer> {
        self.peers.get(node_id)
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.peers.get(node_id).is_some_and(Peer::is_connected)
    }

    pub fn connected_peer_ids(&self) -> Vec<NodeId> {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.descriptor.id.clone())
            .collect()
    }

    /// Latest snapshot of `node_id`; the local id yields the current local
    /// snapshot.
    pub fn snapshot_of(&self, node_id: &str) -> Option<&NodeSnapshot> {
        if node_id == self.local.id {
            return self.current.as_ref();
        }
        self.peers.get(node_id).and_then(|p| p.snapshot.as_ref())
    }

    pub fn local_snapshot(&self) -> Option<&NodeSnapshot> {
        self.current.as_ref()
    }

    pub fn previous_local_snapshot(&self) -> Option<&NodeSnapshot> {
        self.previous.as_ref()
    }

    /// The local snapshot followed by every peer snapshot held.
    pub fn all_snapshots(&self) -> Vec<NodeSnapshot> {
        self.current
            .iter()
            .chain(self.peers.values().filter_map(|p| p.snapshot.as_ref()))
            .cloned()
            .collect()
    }

    /// Returns false for an unknown node id.
    pub fn mark_connected(&mut self, node_id: &str) -> bool {
        match self.peers.get_mut(node_id) {
            Some(peer) => {
                peer.status = PeerStatus::Connected;
                info!(%node_id, "peer marked connected");
                true
            }
            None => {
                warn!(%node_id, "connect event for unknown peer");
                false
            }
        }
    }

    /// Mark a peer disconnected and drop its snapshot.
    pub fn mark_disconnected(&mut self, node_id: &str) -> bool {
        match self.peers.get_mut(node_id) {
            Some(peer) => {
                peer.status = PeerStatus::Disconnected;
                peer.snapshot = None;
                info!(%node_id, "peer marked disconnected");
                true
            }
            None => false,
        }
    }

    /// Store a peer snapshot, replacing any previous one.
    pub fn update_snapshot(&mut self, snapshot: NodeSnapshot) -> bool {
        let node_id = snapshot.node.id.clone();
        match self.peers.get_mut(&node_id) {
            Some(peer) => {
                debug!(
                    %node_id,
                    services = snapshot.service_count,
                    headroom = snapshot.headroom(),
                    "peer snapshot updated"
                );
                peer.snapshot = Some(snapshot);
                true
            }
            None => {
                warn!(%node_id, "snapshot from unknown node ignored");
                false
            }
        }
    }

    /// Make `snapshot` the current local snapshot; the old current becomes
    /// the previous one.
    pub fn roll_local_snapshot(&mut self, snapshot: NodeSnapshot) {
        self.previous = self.current.replace(snapshot);
    }

    /// Pick one of a peer's listeners uniformly at random.
    pub fn choose_listener<R: Rng + ?Sized>(
        &self,
        node_id: &str,
        rng: &mut R,
    ) -> Option<&HostAndPort> {
        self.peers
            .get(node_id)
            .and_then(|p| p.descriptor.listeners.choose(rng))
    }

    /// One random listener for every disconnected peer, for the startup
    /// connection round.
    pub fn connect_targets<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<(NodeId, HostAndPort)> {
        self.peers
            .values()
            .filter(|p| !p.is_connected())
            .filter_map(|p| {
                p.descriptor
                    .listeners
                    .choose(rng)
                    .map(|addr| (p.descriptor.id.clone(), addr.clone()))
            })
            .collect()
    }

    /// Placement view of every configured peer.
    pub fn candidates(&self) -> Vec<Candidate<'_>> {
        self.peers
            .values()
            .map(|p| Candidate {
                node_id: &p.descriptor.id,
                connected: p.is_connected(),
                snapshot: p.snapshot.as_ref(),
            })
            .collect()
    }
}

//! Placement rule — pick the node for a new instance of a task.

use fleet_core::types::{NodeSnapshot, ServiceTask};
use tracing::debug;

/// A peer as seen by placement: its id, whether it is connected, and its
/// latest snapshot if one has arrived.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub node_id: &'a str,
    pub connected: bool,
    pub snapshot: Option<&'a NodeSnapshot>,
}

/// Whether `candidate` strictly beats `best` on both headroom and load.
pub fn beats(candidate: &NodeSnapshot, best: &NodeSnapshot) -> bool {
    candidate.headroom() > best.headroom() && candidate.load() < best.load()
}

/// Peers that may take part in placing `task`: connected, not the local
/// node, and admitted by the task's node affinity.
fn eligible_peers<'a, 'b>(
    task: &'b ServiceTask,
    local_id: &'b str,
    candidates: &'b [Candidate<'a>],
) -> impl Iterator<Item = &'b Candidate<'a>> + 'b {
    candidates
        .iter()
        .filter(move |c| c.connected && c.node_id != local_id && task.admits(c.node_id))
}

/// Ids of every node that may host `task`: the local node (if admitted)
/// followed by the eligible peers.
pub fn eligible_nodes<'a>(
    task: &ServiceTask,
    local_id: &'a str,
    candidates: &[Candidate<'a>],
) -> Vec<&'a str> {
    let mut nodes = Vec::new();
    if task.admits(local_id) {
        nodes.push(local_id);
    }
    nodes.extend(eligible_peers(task, local_id, candidates).map(|c| c.node_id));
    nodes
}

/// Choose the snapshot of the node that should host a new instance.
///
/// Starts from the local snapshot and walks the eligible peers in order,
/// replacing the running best only when a peer beats it on both axes.
/// Peers without a snapshot are skipped.
pub fn select_node<'a>(
    task: &ServiceTask,
    local: &'a NodeSnapshot,
    candidates: &[Candidate<'a>],
) -> &'a NodeSnapshot {
    let mut best = local;
    for candidate in eligible_peers(task, local.node_id(), candidates) {
        if let Some(snapshot) = candidate.snapshot
            && beats(snapshot, best)
        {
            best = snapshot;
        }
    }
    debug!(task = %task.name, node = %best.node_id(), "placement selected node");
    best
}

/// Whether the local node should place an instance of `task` itself.
///
/// False when any eligible peer beats the local snapshot on both axes;
/// true otherwise, including when there are no eligible peers.
pub fn compete_with_cluster(
    task: &ServiceTask,
    local: &NodeSnapshot,
    candidates: &[Candidate<'_>],
) -> bool {
    let deferred_to = eligible_peers(task, local.node_id(), candidates)
        .find(|c| c.snapshot.is_some_and(|s| beats(s, local)));
    match deferred_to {
        Some(peer) => {
            debug!(task = %task.name, peer = %peer.node_id, "deferring placement to peer");
            false
        }
        None => true,
    }
}

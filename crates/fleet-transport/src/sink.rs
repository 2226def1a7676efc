//! Outbound packet sink used by the orchestration layers.
//!
//! Service and state replication only ever push packets out; they do so
//! through [`PacketSender`] so they can run against a [`Transport`] or a
//! [`RecordingSender`].

use std::sync::{Mutex, PoisonError};

use fleet_core::types::NodeId;
use serde::de::DeserializeOwned;

use crate::packet::Packet;
use crate::transport::Transport;

pub trait PacketSender: Send + Sync {
    /// Queue a packet for one peer. Returns false if it is not connected.
    fn send_to(&self, node_id: &str, packet: Packet) -> bool;

    /// Queue a packet for every peer and every local worker.
    fn broadcast(&self, packet: Packet);

    /// Queue a packet for every peer only.
    fn broadcast_peers(&self, packet: Packet);
}

impl PacketSender for Transport {
    fn send_to(&self, node_id: &str, packet: Packet) -> bool {
        self.send(node_id, packet)
    }

    fn broadcast(&self, packet: Packet) {
        Transport::broadcast(self, packet);
    }

    fn broadcast_peers(&self, packet: Packet) {
        Transport::broadcast_peers(self, packet);
    }
}

/// Where a recorded packet was addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(NodeId),
    All,
    Peers,
}

/// Sink that keeps every packet in memory.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(Target, Packet)>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, target: Target, packet: Packet) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target, packet));
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<(Target, Packet)> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decoded payloads of every recorded packet on `channel`, in order.
    pub fn decoded<T: DeserializeOwned>(&self, channel: &str) -> Vec<T> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, p)| p.channel == channel)
            .filter_map(|(_, p)| p.decode().ok())
            .collect()
    }
}

impl PacketSender for RecordingSender {
    fn send_to(&self, node_id: &str, packet: Packet) -> bool {
        self.record(Target::Node(node_id.to_string()), packet);
        true
    }

    fn broadcast(&self, packet: Packet) {
        self.record(Target::All, packet);
    }

    fn broadcast_peers(&self, packet: Packet) {
        self.record(Target::Peers, packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn recording_sender_keeps_order_and_targets() {
        let sink = RecordingSender::new();
        sink.broadcast(Packet::json("a", &1).unwrap());
        assert!(sink.send_to("node-2", Packet::json("b", &2).unwrap()));
        sink.broadcast_peers(Packet::json("a", &3).unwrap());

        assert_eq!(sink.decoded::<i32>("a"), vec![1, 3]);

        let sent = sink.take();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].0, Target::Node("node-2".into()));
        assert_eq!(sent[2].0, Target::Peers);
        assert!(sink.is_empty());
    }

    #[test]
    fn decoded_skips_foreign_payloads() {
        let sink = RecordingSender::new();
        sink.broadcast(Packet::new("a", Bytes::from_static(b"not json")));
        sink.broadcast(Packet::json("a", &7).unwrap());
        assert_eq!(sink.decoded::<i32>("a"), vec![7]);
    }
}

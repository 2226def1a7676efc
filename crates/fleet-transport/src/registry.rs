//! Channel handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use fleet_core::types::NodeId;

use crate::packet::Packet;
use crate::transport::Transport;

/// Boxed future returned by channel handlers.
pub type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Callback invoked for every inbound packet on a channel.
///
/// Each invocation runs on its own task; an error or panic is logged for
/// that packet and never affects the connection or other handlers.
pub type PacketHandler = Arc<dyn Fn(ChannelContext, Packet) -> BoxFuture + Send + Sync>;

/// Wrap an async closure as a [`PacketHandler`].
pub fn handler<F, Fut>(f: F) -> PacketHandler
where
    F: Fn(ChannelContext, Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, packet| Box::pin(f(ctx, packet)))
}

/// The authenticated party on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    Peer(NodeId),
    Service(Uuid),
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Peer(id) => write!(f, "node {id}"),
            Origin::Service(id) => write!(f, "service {id}"),
        }
    }
}

/// Where a packet came from, and a way to answer it.
#[derive(Clone)]
pub struct ChannelContext {
    pub transport: Transport,
    pub origin: Origin,
}

impl ChannelContext {
    /// Send `packet` back to the origin. Returns false if it is gone.
    pub fn reply(&self, packet: Packet) -> bool {
        self.transport.send_to_origin(&self.origin, packet)
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<PacketHandler>>>,
}

impl HandlerRegistry {
    pub fn register(&self, channel: impl Into<String>, handler: PacketHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.into())
            .or_default()
            .push(handler);
    }

    /// Every handler registered for `channel`, in registration order.
    pub fn handlers_for(&self, channel: &str) -> Vec<PacketHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        channels.sort();
        channels
    }
}

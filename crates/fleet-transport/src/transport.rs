//! Transport — authenticated, multiplexed connections between nodes and
//! between a node and its worker processes.
//!
//! Every connection runs two tasks: a writer draining an unbounded packet
//! queue (so sends never block the caller) and a reader decoding frames and
//! dispatching them. A packet whose id matches a pending `send_and_await`
//! completes that waiter; anything else goes to every handler registered
//! for its channel, each on its own task.
//!
//! At most one connection per peer is kept. When two nodes dial each other
//! at the same time, both keep the connection dialed by the node with the
//! smaller id.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fleet_core::protocol::{AuthRequest, AuthResponse, channels};
use fleet_core::types::{HostAndPort, NodeDescriptor, NodeId, ServiceId};
use tokio::io::{AsyncWriteExt, ReadHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::connection::{BoxedIo, accept_stream, exchange_auth, open_stream, read_auth_frame};
use crate::error::{TransportError, TransportResult};
use crate::packet::{Packet, PacketCodec};
use crate::registry::{ChannelContext, HandlerRegistry, Origin, PacketHandler};
use crate::tls::TlsSettings;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerConnected { node_id: NodeId },
    PeerDisconnected { node_id: NodeId },
    ServiceConnected { service_id: ServiceId },
    ServiceDisconnected { service_id: ServiceId },
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Identity presented to every peer.
    pub local: NodeDescriptor,
    /// Shared secret checked during the handshake.
    pub secret: String,
    /// Node ids allowed to connect as peers.
    pub peers: HashSet<NodeId>,
    pub tls: Option<TlsSettings>,
    /// Limit for dialing, TLS setup and the auth exchange.
    pub handshake_timeout: Duration,
}

impl TransportConfig {
    pub fn new(local: NodeDescriptor, secret: impl Into<String>) -> Self {
        Self {
            local,
            secret: secret.into(),
            peers: HashSet::new(),
            tls: None,
            handshake_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_peers(mut self, peers: impl IntoIterator<Item = NodeId>) -> Self {
        self.peers = peers.into_iter().collect();
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// One live connection: the writer queue plus a handle on the reader.
struct Link {
    conn_id: u64,
    /// Whether the local node dialed this connection.
    dialed: bool,
    tx: mpsc::UnboundedSender<Packet>,
    reader: AbortHandle,
}

impl Link {
    fn send(&self, packet: Packet) -> bool {
        self.tx.send(packet).is_ok()
    }

    fn close(self) {
        // Dropping `tx` ends the writer, which shuts down the write half.
        self.reader.abort();
    }
}

struct ServiceLink {
    service_id: ServiceId,
    link: Link,
}

struct Inner {
    config: TransportConfig,
    registry: HandlerRegistry,
    peers: Mutex<HashMap<NodeId, Link>>,
    services: Mutex<HashMap<Uuid, ServiceLink>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Packet>>>,
    events: broadcast::Sender<TransportEvent>,
    shutdown: watch::Sender<bool>,
    next_conn_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheaply cloneable handle on the node's connections.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                registry: HandlerRegistry::default(),
                peers: Mutex::new(HashMap::new()),
                services: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                events,
                shutdown,
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn local(&self) -> &NodeDescriptor {
        &self.inner.config.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    pub fn register_handler(&self, channel: impl Into<String>, handler: PacketHandler) {
        self.inner.registry.register(channel, handler);
    }

    // ── Inbound ────────────────────────────────────────────────────

    /// Bind `address` and accept connections until [`Transport::shutdown`].
    ///
    /// Returns the bound socket address (useful with port 0).
    pub async fn listen(&self, address: &HostAndPort) -> TransportResult<SocketAddr> {
        let listener = TcpListener::bind((address.host.as_str(), address.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, tls = self.inner.config.tls.is_some(), "transport listening");

        let transport = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let transport = transport.clone();
                            tokio::spawn(async move {
                                if let Err(e) = transport.accept(stream).await {
                                    warn!(%remote, error = %e, "inbound handshake failed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    },
                    _ = shutdown.changed() => {
                        debug!(%local_addr, "listener stopped");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    async fn accept(&self, stream: TcpStream) -> TransportResult<()> {
        let limit = self.inner.config.handshake_timeout;
        let mut io = accept_stream(stream, self.inner.config.tls.as_ref(), limit).await?;

        let first = read_auth_frame(&mut io, limit).await?;
        let request: AuthRequest = first.decode()?;
        let verdict = self.verify(&request);
        let response = AuthResponse {
            accepted: verdict.is_ok(),
            node: verdict.is_ok().then(|| self.inner.config.local.clone()),
        };
        PacketCodec::write_frame(&mut io, &first.reply(&response)?).await?;
        verdict?;

        match request {
            AuthRequest::Node { node, .. } => self.attach_peer(node.id, io, false),
            AuthRequest::Service { service_id, .. } => self.attach_service(service_id, io),
        }
        Ok(())
    }

    fn verify(&self, request: &AuthRequest) -> TransportResult<()> {
        if request.secret() != self.inner.config.secret {
            return Err(TransportError::Handshake("cluster secret mismatch".into()));
        }
        if let AuthRequest::Node { node, .. } = request {
            if node.id == self.inner.config.local.id {
                return Err(TransportError::Handshake(format!(
                    "node '{}' has the local node id",
                    node.id
                )));
            }
            if !self.inner.config.peers.contains(&node.id) {
                return Err(TransportError::Handshake(format!(
                    "node '{}' is not a configured peer",
                    node.id
                )));
            }
        }
        Ok(())
    }

    // ── Outbound ───────────────────────────────────────────────────

    /// Connect to the node listening on `address`.
    ///
    /// Best effort: failures are logged and reported as `false`; there is
    /// no retry.
    pub async fn connect(&self, address: &HostAndPort) -> bool {
        match self.dial(address).await {
            Ok(node_id) => {
                debug!(%address, %node_id, "connected to node");
                true
            }
            Err(e) => {
                warn!(%address, error = %e, "failed to connect to node");
                false
            }
        }
    }

    async fn dial(&self, address: &HostAndPort) -> TransportResult<NodeId> {
        let config = &self.inner.config;
        let limit = config.handshake_timeout;
        let mut io = open_stream(address, config.tls.as_ref(), limit).await?;

        let request = Packet::request(
            channels::AUTH,
            &AuthRequest::Node {
                node: config.local.clone(),
                secret: config.secret.clone(),
            },
        )?;
        let response = exchange_auth(&mut io, &request, limit).await?;
        let node = response
            .node
            .ok_or_else(|| TransportError::Handshake("remote did not identify itself".into()))?;
        if !config.peers.contains(&node.id) {
            return Err(TransportError::Handshake(format!(
                "'{}' is not a configured peer",
                node.id
            )));
        }

        self.attach_peer(node.id.clone(), io, true);
        Ok(node.id)
    }

    // ── Connection bookkeeping ─────────────────────────────────────

    /// Start the writer and (gated) reader tasks for an authenticated stream.
    ///
    /// The reader waits on the returned sender so it cannot report a close
    /// before the link is registered.
    fn spawn_link(&self, origin: Origin, io: BoxedIo, dialed: bool) -> (Link, oneshot::Sender<()>) {
        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, mut write_half) = tokio::io::split(io);
        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();

        let writer_origin = origin.clone();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = PacketCodec::write_frame(&mut write_half, &packet).await {
                    debug!(origin = %writer_origin, error = %e, "connection write failed");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let transport = self.clone();
        let reader = tokio::spawn(async move {
            if ready_rx.await.is_err() {
                return;
            }
            transport.read_loop(conn_id, origin, read_half).await;
        })
        .abort_handle();

        (
            Link {
                conn_id,
                dialed,
                tx,
                reader,
            },
            ready_tx,
        )
    }

    /// Whether a connection in the given direction wins a duplicate.
    fn preferred(&self, node_id: &str, dialed: bool) -> bool {
        let local_is_smaller = self.inner.config.local.id.as_str() < node_id;
        dialed == local_is_smaller
    }

    fn attach_peer(&self, node_id: NodeId, io: BoxedIo, dialed: bool) {
        let (link, ready) = self.spawn_link(Origin::Peer(node_id.clone()), io, dialed);
        let mut peers = lock(&self.inner.peers);
        match peers.remove(&node_id) {
            None => {
                peers.insert(node_id.clone(), link);
                drop(peers);
                let _ = ready.send(());
                info!(%node_id, dialed, "peer connected");
                self.emit(TransportEvent::PeerConnected { node_id });
            }
            Some(existing) => {
                if self.preferred(&node_id, existing.dialed) && !self.preferred(&node_id, dialed) {
                    peers.insert(node_id.clone(), existing);
                    drop(peers);
                    link.close();
                    debug!(%node_id, dialed, "dropped duplicate peer connection");
                } else {
                    peers.insert(node_id.clone(), link);
                    drop(peers);
                    existing.close();
                    let _ = ready.send(());
                    debug!(%node_id, dialed, "replaced peer connection");
                }
            }
        }
    }

    fn attach_service(&self, service_id: ServiceId, io: BoxedIo) {
        let unique_id = service_id.unique_id;
        let (link, ready) = self.spawn_link(Origin::Service(unique_id), io, false);
        let previous = lock(&self.inner.services).insert(
            unique_id,
            ServiceLink {
                service_id: service_id.clone(),
                link,
            },
        );
        let _ = ready.send(());
        match previous {
            Some(old) => {
                old.link.close();
                debug!(service = %service_id.name(), "replaced service connection");
            }
            None => {
                info!(service = %service_id.name(), %unique_id, "service connected");
                self.emit(TransportEvent::ServiceConnected { service_id });
            }
        }
    }

    async fn read_loop(&self, conn_id: u64, origin: Origin, mut reader: ReadHalf<BoxedIo>) {
        loop {
            match PacketCodec::read_frame(&mut reader).await {
                Ok(Some(packet)) => self.dispatch(&origin, packet),
                Ok(None) => break,
                Err(e) => {
                    warn!(%origin, error = %e, "connection read failed");
                    break;
                }
            }
        }
        self.detach(conn_id, &origin);
    }

    /// Forget a closed connection if it is still the registered one.
    fn detach(&self, conn_id: u64, origin: &Origin) {
        match origin {
            Origin::Peer(node_id) => {
                let mut peers = lock(&self.inner.peers);
                if peers.get(node_id).is_some_and(|l| l.conn_id == conn_id) {
                    peers.remove(node_id);
                    drop(peers);
                    info!(%node_id, "peer disconnected");
                    self.emit(TransportEvent::PeerDisconnected {
                        node_id: node_id.clone(),
                    });
                }
            }
            Origin::Service(unique_id) => {
                let mut services = lock(&self.inner.services);
                if services
                    .get(unique_id)
                    .is_some_and(|s| s.link.conn_id == conn_id)
                {
                    let removed = services.remove(unique_id);
                    drop(services);
                    if let Some(removed) = removed {
                        info!(service = %removed.service_id.name(), "service disconnected");
                        self.emit(TransportEvent::ServiceDisconnected {
                            service_id: removed.service_id,
                        });
                    }
                }
            }
        }
    }

    fn dispatch(&self, origin: &Origin, packet: Packet) {
        if let Some(id) = packet.id {
            let waiter = lock(&self.inner.pending).remove(&id);
            if let Some(waiter) = waiter {
                let _ = waiter.send(packet);
                return;
            }
        }

        let handlers = self.inner.registry.handlers_for(&packet.channel);
        if handlers.is_empty() {
            trace!(channel = %packet.channel, %origin, "no handler registered");
            return;
        }

        for handler in handlers {
            let ctx = ChannelContext {
                transport: self.clone(),
                origin: origin.clone(),
            };
            let channel = packet.channel.clone();
            let source = origin.clone();
            let packet = packet.clone();
            let task = tokio::spawn(async move { handler(ctx, packet).await });
            tokio::spawn(async move {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(%channel, origin = %source, error = %e, "channel handler failed"),
                    Err(e) if e.is_panic() => {
                        warn!(%channel, origin = %source, "channel handler panicked")
                    }
                    Err(_) => {}
                }
            });
        }
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    // ── Sending ────────────────────────────────────────────────────

    /// Queue `packet` for a connected peer. Returns false if not connected.
    pub fn send(&self, node_id: &str, packet: Packet) -> bool {
        lock(&self.inner.peers)
            .get(node_id)
            .is_some_and(|link| link.send(packet))
    }

    pub fn send_to_service(&self, unique_id: Uuid, packet: Packet) -> bool {
        lock(&self.inner.services)
            .get(&unique_id)
            .is_some_and(|s| s.link.send(packet))
    }

    pub fn send_to_origin(&self, origin: &Origin, packet: Packet) -> bool {
        match origin {
            Origin::Peer(node_id) => self.send(node_id, packet),
            Origin::Service(unique_id) => self.send_to_service(*unique_id, packet),
        }
    }

    /// Queue `packet` for every connected peer and every connected worker.
    pub fn broadcast(&self, packet: Packet) {
        self.broadcast_peers(packet.clone());
        self.broadcast_services(packet);
    }

    pub fn broadcast_peers(&self, packet: Packet) {
        for link in lock(&self.inner.peers).values() {
            link.send(packet.clone());
        }
    }

    pub fn broadcast_services(&self, packet: Packet) {
        for service in lock(&self.inner.services).values() {
            service.link.send(packet.clone());
        }
    }

    /// Send a request to a peer and wait for the packet carrying the same id.
    pub async fn send_and_await(
        &self,
        node_id: &str,
        mut packet: Packet,
        limit: Duration,
    ) -> TransportResult<Packet> {
        let id = *packet.id.get_or_insert_with(Uuid::new_v4);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);

        if !self.send(node_id, packet) {
            lock(&self.inner.pending).remove(&id);
            return Err(TransportError::NotConnected(node_id.to_string()));
        }

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                debug!(%node_id, %id, "request timed out");
                Err(TransportError::Timeout)
            }
        }
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn is_connected(&self, node_id: &str) -> bool {
        lock(&self.inner.peers).contains_key(node_id)
    }

    /// Ids of connected peers, sorted.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = lock(&self.inner.peers).keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn connected_services(&self) -> Vec<ServiceId> {
        lock(&self.inner.services)
            .values()
            .map(|s| s.service_id.clone())
            .collect()
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Close the connection to a peer. Returns true if one existed.
    pub fn disconnect(&self, node_id: &str) -> bool {
        let removed = lock(&self.inner.peers).remove(node_id);
        match removed {
            Some(link) => {
                link.close();
                info!(%node_id, "peer disconnected");
                self.emit(TransportEvent::PeerDisconnected {
                    node_id: node_id.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Stop every listener and close every connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let peers: Vec<Link> = lock(&self.inner.peers).drain().map(|(_, l)| l).collect();
        let services: Vec<ServiceLink> =
            lock(&self.inner.services).drain().map(|(_, s)| s).collect();
        let count = peers.len() + services.len();
        for link in peers {
            link.close();
        }
        for service in services {
            service.link.close();
        }
        lock(&self.inner.pending).clear();
        info!(connections = count, "transport shut down");
    }
}

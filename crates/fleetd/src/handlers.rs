//! Transport wiring: inbound channel handlers and the event pump.
//!
//! Handlers run on transport tasks. Anything touching orchestrator state
//! is queued onto the control loop; only the RPC handler waits for the
//! result so it can reply.

use fleet_core::protocol::{ClusterMessage, RpcRequest, RpcResponse, ServiceUpdate, channels};
use fleet_transport::{Origin, Transport, TransportEvent, handler};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::handle::NodeHandle;

/// Register the cluster, service and RPC channel handlers.
pub fn install(transport: &Transport, node: &NodeHandle) {
    let handle = node.clone();
    transport.register_handler(
        channels::CLUSTER,
        handler(move |ctx, packet| {
            let handle = handle.clone();
            async move {
                let Origin::Peer(from) = ctx.origin.clone() else {
                    debug!(origin = %ctx.origin, "cluster message from a non-peer dropped");
                    return Ok(());
                };
                let message: ClusterMessage = packet.decode()?;
                handle.enqueue(move |node| node.handle_cluster_message(&from, message));
                Ok(())
            }
        }),
    );

    let handle = node.clone();
    transport.register_handler(
        channels::SERVICES,
        handler(move |ctx, packet| {
            let handle = handle.clone();
            async move {
                let Origin::Peer(from) = ctx.origin else {
                    return Ok(());
                };
                let update: ServiceUpdate = packet.decode()?;
                handle.enqueue(move |node| node.handle_service_update(&from, update));
                Ok(())
            }
        }),
    );

    let handle = node.clone();
    transport.register_handler(
        channels::RPC,
        handler(move |ctx, packet| {
            let handle = handle.clone();
            async move {
                // Replies to our own requests are consumed by the transport;
                // anything else without an id cannot be answered.
                if packet.id.is_none() {
                    return Ok(());
                }
                let request: RpcRequest = match packet.decode() {
                    Ok(request) => request,
                    Err(e) => {
                        debug!(origin = %ctx.origin, error = %e, "undecodable rpc request skipped");
                        return Ok(());
                    }
                };
                let response = handle
                    .call(move |node| node.services_mut().execute_rpc(request))
                    .await
                    .unwrap_or_else(|| RpcResponse::Error {
                        message: "node is shutting down".to_string(),
                    });
                if !ctx.reply(packet.reply(&response)?) {
                    warn!(origin = %ctx.origin, "rpc caller went away before the reply");
                }
                Ok(())
            }
        }),
    );
}

/// Forward transport connection events to the control loop until the
/// transport shuts down.
pub fn spawn_event_pump(transport: &Transport, node: NodeHandle) -> JoinHandle<()> {
    let mut events = transport.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "transport events lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                TransportEvent::PeerConnected { node_id } => {
                    node.enqueue(move |n| n.on_peer_connected(&node_id));
                }
                TransportEvent::PeerDisconnected { node_id } => {
                    node.enqueue(move |n| n.on_peer_disconnected(&node_id));
                }
                TransportEvent::ServiceConnected { service_id } => {
                    node.enqueue(move |n| n.on_service_connected(&service_id.unique_id, true));
                }
                TransportEvent::ServiceDisconnected { service_id } => {
                    node.enqueue(move |n| n.on_service_connected(&service_id.unique_id, false));
                }
            }
        }
        debug!("transport event pump stopped");
    })
}

//! Handle used by everything outside the control thread.

use std::time::Duration;

use fleet_core::protocol::{RpcResponse, channels};
use fleet_service::Dispatch;
use fleet_transport::{Packet, Transport};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::node::{Node, Work};

/// Cloneable entry point into a running node.
///
/// Every call is queued for the control thread and answered through a
/// oneshot channel. Remote forwarding happens on the caller's task, so the
/// control thread never waits on the network.
#[derive(Clone)]
pub struct NodeHandle {
    queue: mpsc::UnboundedSender<Work>,
    transport: Transport,
    rpc_timeout: Duration,
}

impl NodeHandle {
    pub fn new(queue: mpsc::UnboundedSender<Work>, transport: Transport, rpc_timeout: Duration) -> Self {
        Self {
            queue,
            transport,
            rpc_timeout,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Queue `work` and return a receiver for its result. The receiver
    /// errors if the control loop is gone.
    pub fn submit<T, F>(&self, work: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Node) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = self.queue.send(Box::new(move |node: &mut Node| {
            let _ = tx.send(work(node));
        }));
        if queued.is_err() {
            debug!("control loop has stopped; work dropped");
        }
        rx
    }

    /// Queue `work` without waiting for it.
    pub fn enqueue<F>(&self, work: F)
    where
        F: FnOnce(&mut Node) + Send + 'static,
    {
        if self.queue.send(Box::new(work)).is_err() {
            debug!("control loop has stopped; work dropped");
        }
    }

    /// Queue `work` and wait for its result. `None` if the control loop
    /// stopped before running it.
    pub async fn call<T, F>(&self, work: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Node) -> T + Send + 'static,
    {
        self.submit(work).await.ok()
    }

    /// Finish a dispatch decision: return a local answer, or send the
    /// request to the owning peer and wait for its reply.
    pub(crate) async fn resolve(&self, dispatch: Option<Dispatch<RpcResponse>>) -> Option<RpcResponse> {
        match dispatch? {
            Dispatch::Handled(response) => response,
            Dispatch::Forward { node_id, request } => {
                let packet = match Packet::request(channels::RPC, &request) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!(error = %e, "failed to encode forwarded request");
                        return None;
                    }
                };
                let reply = match self
                    .transport
                    .send_and_await(&node_id, packet, self.rpc_timeout)
                    .await
                {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(%node_id, error = %e, "forwarded request failed");
                        return None;
                    }
                };
                match reply.decode::<RpcResponse>() {
                    Ok(RpcResponse::Error { message }) => {
                        warn!(%node_id, %message, "peer rejected forwarded request");
                        None
                    }
                    Ok(response) => Some(response),
                    Err(e) => {
                        warn!(%node_id, error = %e, "malformed reply to forwarded request");
                        None
                    }
                }
            }
        }
    }
}

//! Worker-side connection to the owning node.
//!
//! A worker process authenticates with its [`ServiceId`] and the cluster
//! secret, then exchanges packets with its node. Packets the node
//! broadcasts to workers arrive through [`ServiceClient::recv`].

use std::time::Duration;

use fleet_core::protocol::{AuthRequest, channels};
use fleet_core::types::{HostAndPort, NodeDescriptor, ServiceId};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::{exchange_auth, open_stream};
use crate::error::{TransportError, TransportResult};
use crate::packet::{Packet, PacketCodec};
use crate::tls::TlsSettings;

pub struct ServiceClient {
    node: NodeDescriptor,
    outbound: mpsc::UnboundedSender<Packet>,
    inbound: mpsc::UnboundedReceiver<Packet>,
}

impl ServiceClient {
    pub async fn connect(
        address: &HostAndPort,
        service_id: ServiceId,
        secret: &str,
        tls: Option<&TlsSettings>,
        limit: Duration,
    ) -> TransportResult<Self> {
        let mut io = open_stream(address, tls, limit).await?;
        let request = Packet::request(
            channels::AUTH,
            &AuthRequest::Service {
                service_id: service_id.clone(),
                secret: secret.to_string(),
            },
        )?;
        let response = exchange_auth(&mut io, &request, limit).await?;
        let node = response
            .node
            .ok_or_else(|| TransportError::Handshake("node did not identify itself".into()))?;

        let (mut read_half, mut write_half) = tokio::io::split(io);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Packet>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Packet>();

        tokio::spawn(async move {
            while let Some(packet) = outbound_rx.recv().await {
                if PacketCodec::write_frame(&mut write_half, &packet).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let name = service_id.name();
        tokio::spawn(async move {
            loop {
                match PacketCodec::read_frame(&mut read_half).await {
                    Ok(Some(packet)) => {
                        if inbound_tx.send(packet).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(service = %name, error = %e, "service connection read failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            node,
            outbound,
            inbound,
        })
    }

    /// The node this worker is attached to.
    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    pub fn send(&self, packet: Packet) -> bool {
        self.outbound.send(packet).is_ok()
    }

    /// Next packet from the node, or `None` once the connection closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.inbound.recv().await
    }
}

//! Start-up and shutdown of a manager node.

use std::sync::Arc;

use anyhow::Context;
use fleet_core::NodeConfig;
use fleet_service::OsLauncher;
use fleet_state::StateStore;
use fleet_transport::{TlsSettings, Transport, TransportConfig};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::control_loop::ControlLoop;
use crate::handle::NodeHandle;
use crate::handlers;
use crate::node::Node;
use crate::probe::SysinfoProbe;

pub const STATE_FILE: &str = "fleet.redb";

/// Build the transport described by `config`.
pub fn build_transport(config: &NodeConfig) -> anyhow::Result<Transport> {
    let mut transport_config = TransportConfig::new(config.local_descriptor(), &config.cluster.secret)
        .with_peers(config.cluster.nodes.iter().map(|n| n.id.clone()));
    if config.tls.enabled {
        let (Some(cert), Some(key), Some(ca)) = (&config.tls.cert, &config.tls.key, &config.tls.ca)
        else {
            anyhow::bail!("tls.enabled requires tls.cert, tls.key and tls.ca");
        };
        let tls = TlsSettings::from_pem_files(cert, key, ca).context("failed to load TLS material")?;
        transport_config = transport_config.with_tls(tls);
    }
    Ok(Transport::new(transport_config))
}

/// Run a node until `shutdown` flips to true.
///
/// Opens the state store, binds every listener, dials the configured
/// peers once and then hands the node to the control loop. On shutdown
/// the loop deletes all local workers before the transport closes.
pub async fn run(config: NodeConfig, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;
    let state_path = config.data_dir.join(STATE_FILE);
    let store = StateStore::open(&state_path)
        .with_context(|| format!("failed to open state store {}", state_path.display()))?;

    let transport = build_transport(&config)?;
    let node = Node::new(
        &config,
        store,
        Arc::new(transport.clone()),
        Arc::new(OsLauncher),
        Box::new(SysinfoProbe::new()),
    )
    .context("failed to load replicated state")?;

    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let handle = NodeHandle::new(queue_tx, transport.clone(), config.rpc_timeout());
    handlers::install(&transport, &handle);
    let pump = handlers::spawn_event_pump(&transport, handle.clone());

    for listener in &config.identity.listeners {
        let bound = transport
            .listen(listener)
            .await
            .with_context(|| format!("failed to listen on {listener}"))?;
        info!(address = %bound, "listening");
    }

    let control = ControlLoop::new(node, queue_rx, config.tps)
        .spawn(Handle::current(), shutdown.clone())
        .context("failed to spawn control thread")?;

    let targets = handle
        .call(|node| node.connect_targets())
        .await
        .unwrap_or_default();
    for (node_id, address) in targets {
        if !transport.connect(&address).await {
            warn!(%node_id, %address, "initial connection to peer failed");
        }
    }
    info!(node_id = %config.identity.id, "node started");

    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    info!("shutting down");
    match tokio::task::spawn_blocking(move || control.join()).await {
        Ok(Ok(_node)) => {}
        Ok(Err(_)) => warn!("control thread panicked"),
        Err(e) => warn!(error = %e, "failed to join control thread"),
    }
    transport.shutdown();
    pump.abort();
    info!("node stopped");
    Ok(())
}

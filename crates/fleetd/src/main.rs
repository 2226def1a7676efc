//! fleetd — the Fleet manager node.
//!
//! # Usage
//!
//! ```text
//! fleetd init --config fleet.toml --id node-1
//! fleetd certs --out certs --node node-1=10.0.0.1 --node node-2=10.0.0.2,node-2.internal
//! fleetd run --config fleet.toml
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleet_core::NodeConfig;
use fleet_transport::{CertKeyPair, CertificateAuthority};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,fleetd=debug,fleet=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet manager node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a manager node until Ctrl-C.
    Run {
        /// Node configuration file.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Write a single-node configuration to start from.
    Init {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Node id to put in the scaffold.
        #[arg(long)]
        id: String,
    },
    /// Generate a cluster CA and one certificate per node.
    Certs {
        /// Output directory.
        #[arg(long)]
        out: PathBuf,

        /// `<id>=<addr>[,<addr>...]`; repeat once per node.
        #[arg(long = "node", value_parser = parse_node_spec, required = true)]
        nodes: Vec<(String, Vec<String>)>,
    },
}

fn parse_node_spec(spec: &str) -> Result<(String, Vec<String>), String> {
    let (id, addresses) = spec
        .split_once('=')
        .ok_or_else(|| format!("expected <id>=<addr>[,<addr>...], got '{spec}'"))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("missing node id in '{spec}'"));
    }
    let addresses: Vec<String> = addresses
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();
    if addresses.is_empty() {
        return Err(format!("node '{id}' needs at least one address"));
    }
    Ok((id.to_string(), addresses))
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_json } => {
            init_tracing(log_json);
            run(&config).await
        }
        Command::Init { config, id } => {
            init_tracing(false);
            init(&config, &id)
        }
        Command::Certs { out, nodes } => {
            init_tracing(false);
            certs(&out, &nodes)
        }
    }
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = NodeConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    info!(node_id = %config.identity.id, config = %path.display(), "Fleet node starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            return;
        }
        info!("shutdown signal received");
        shutdown_tx.send_replace(true);
    });

    fleetd::daemon::run(config, shutdown_rx).await
}

fn init(path: &Path, id: &str) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let config = NodeConfig::scaffold(id);
    config.validate()?;
    std::fs::write(path, config.to_toml_string()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), node_id = %id, "configuration written");
    Ok(())
}

fn certs(out: &Path, nodes: &[(String, Vec<String>)]) -> anyhow::Result<()> {
    std::fs::create_dir_all(out)
        .with_context(|| format!("failed to create {}", out.display()))?;

    let ca = CertificateAuthority::generate()?;
    write_pair(out, "ca", &ca.pair())?;
    for (id, addresses) in nodes {
        let pair = ca.issue(id, addresses)?;
        write_pair(out, id, &pair)?;
    }
    info!(out = %out.display(), nodes = nodes.len(), "certificates written");
    Ok(())
}

fn write_pair(dir: &Path, name: &str, pair: &CertKeyPair) -> anyhow::Result<()> {
    let cert = dir.join(format!("{name}.pem"));
    let key = dir.join(format!("{name}.key"));
    std::fs::write(&cert, &pair.cert_pem)
        .with_context(|| format!("failed to write {}", cert.display()))?;
    std::fs::write(&key, &pair.key_pem)
        .with_context(|| format!("failed to write {}", key.display()))?;
    Ok(())
}

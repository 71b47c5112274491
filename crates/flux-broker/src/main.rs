//! The Flux overlay broker binary.
//!
//! Wires [`flux_overlay::bootstrap::ConfigFileBootstrap`] to a real `tmq`
//! ROUTER/DEALER socket pair and runs [`flux_overlay::run`] until a signal
//! or the shutdown broadcast fires. Bootstrap, socket construction, and ZAP
//! are all async/blocking glue; the actual routing and handshake logic
//! lives entirely in `flux-overlay` and is exercised there without a
//! binary in the loop.
//!
//! Configuration is loaded from (in order, later wins):
//! 1. Compiled defaults
//! 2. `/etc/flux/flux.toml`
//! 3. `~/.config/flux/flux.toml`
//! 4. `./flux.toml` (or `--config` path)
//! 5. `FLUX_TBON_*` environment overrides
//!
//! The rank/size/topology/parent URI themselves are not `tbon.*` settings;
//! they come from `--hosts` (a static hostname-to-rank map) plus this
//! broker's own `--hostname`, per `ConfigFileBootstrap` (§4.4.2).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use flux_config::{AttrFlags, AttrStore, FluxConfig};
use flux_overlay::bootstrap::{publish_derived_attrs, BootstrapProvider, ConfigFileBootstrap, HostEntry};
use flux_overlay::socket_config::{create_dealer_and_connect, create_router_and_bind, SocketOptions};
use flux_overlay::zap::{self, Allowlist};
use flux_overlay::{run, LocalChannel};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Flux overlay broker", long_about = None)]
struct Cli {
    /// Path to the `[tbon]` TOML config (overrides `./flux.toml`).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON file listing every broker in rank order: `[{"hostname": "...",
    /// "bind_uri": "tcp://..." | null}, ...]`. Rank is each entry's index.
    #[arg(long)]
    hosts: PathBuf,

    /// Shared CURVE cert every broker in the instance loads (§4.1). All
    /// ranks trust each other under this one keypair.
    #[arg(long)]
    cert: PathBuf,

    /// This broker's own hostname, used to find its rank in `--hosts`.
    #[arg(long)]
    hostname: String,

    /// Print the resolved configuration and exit without bootstrapping.
    #[arg(long)]
    show_config: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_hosts(path: &PathBuf) -> Result<Vec<HostEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read hosts file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse hosts file {}", path.display()))
}

fn socket_options_from(settings: &flux_config::TbonSettings) -> SocketOptions {
    SocketOptions {
        enable_ipv6: settings.enable_ipv6,
        child_rcvhwm: settings.child_rcvhwm as i32,
        tcp_user_timeout_ms: settings.tcp_user_timeout.map(|d| d.as_millis() as i32),
        connect_timeout_ms: settings.connect_timeout.map(|d| d.as_millis() as i32),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let (config, sources) =
        FluxConfig::load_with_sources_from(cli.config.as_deref()).context("failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {var}");
            }
        }
        println!();
        println!("{config:#?}");
        return Ok(());
    }

    info!("configuration loaded from {} file(s)", sources.files.len());
    for path in &sources.files {
        info!(path = %path.display(), "config file");
    }

    let hosts = load_hosts(&cli.hosts)?;
    let mut bootstrap = ConfigFileBootstrap::new(hosts, cli.cert.clone(), cli.hostname.clone());
    let bootstrapped = bootstrap
        .bootstrap(&config.tbon)
        .await
        .context("bootstrap failed")?;

    let rank = bootstrapped.rank;
    let uuid = uuid::Uuid::new_v4().to_string();
    info!(rank, uuid = %uuid, size = bootstrapped.size, "bootstrap resolved");

    let mut attrs = AttrStore::new();
    attrs.add("broker.uuid", uuid.clone(), AttrFlags::IMMUTABLE | AttrFlags::READONLY)?;
    attrs.add(
        "broker.boot-method",
        "config".to_string(),
        AttrFlags::IMMUTABLE,
    )?;
    publish_derived_attrs(&mut attrs, &bootstrapped)?;
    for (name, value, _) in attrs.iter() {
        info!(name, value, "attribute");
    }

    let bind_uri = bootstrapped.bind_uri.clone();
    let parent_uri = bootstrapped.parent_uri.clone();
    let parent_public_key = bootstrapped.parent_public_key.clone();
    let child_public_keys = bootstrapped.child_public_keys.clone();
    let cert = bootstrapped.cert.clone();

    let overlay = bootstrapped.into_overlay(uuid.clone(), config.tbon.clone());
    let socket_opts = socket_options_from(&config.tbon);

    let ctx = flux_overlay::socket_config::ZmqContext::new();

    let allowlist = Allowlist::new();
    for (child_rank, key) in &child_public_keys {
        info!(child_rank, "authorizing child public key");
        allowlist.authorize(key.clone());
    }
    let _zap_thread = zap::spawn(&ctx, allowlist).context("failed to start ZAP handler")?;

    // Leaves have no bind URI; the run loop still needs a ROUTER handle to
    // poll alongside the dealer, so a leaf binds an unreachable inproc
    // endpoint that no peer will ever dial (see DESIGN.md).
    let router_endpoint = bind_uri
        .clone()
        .unwrap_or_else(|| format!("inproc://flux-leaf-{uuid}"));
    let router = create_router_and_bind(&ctx, &router_endpoint, &cert, &socket_opts)
        .context("failed to bind overlay router socket")?;
    if let Some(uri) = &bind_uri {
        info!(uri, "bound overlay router socket for children");
    }

    let dealer = match (&parent_uri, &parent_public_key) {
        (Some(uri), Some(key)) => {
            info!(uri, "connecting overlay dealer socket to parent");
            Some(
                create_dealer_and_connect(&ctx, uri, &cert, key, &uuid, &socket_opts)
                    .context("failed to connect overlay dealer socket")?,
            )
        }
        _ => {
            info!("rank 0 (or no resolvable parent): running without a dealer socket");
            None
        }
    };

    // The broker-wide local message bus (state machine, KVS, job manager,
    // ...) is out of scope (§1); this binary stands in for it with a
    // channel pair that simply logs whatever the overlay would otherwise
    // deliver to the rest of the broker.
    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(256);
    // Held for the life of the process: nothing upstream of the overlay
    // injects local traffic yet, but the sender must stay alive so
    // `inbound_rx.recv()` parks instead of resolving immediately on a
    // closed channel (which would spin the run loop's select!).
    let _inbound_tx = inbound_tx;
    let local = LocalChannel {
        inbound: inbound_rx,
        outbound: outbound_tx,
    };

    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            info!(kind = ?msg.kind, topic = %msg.topic, "delivered to local channel stand-in");
        }
    });

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    info!(rank, "overlay broker running");
    if let Err(e) = run(overlay, router, dealer, local, shutdown_rx).await {
        warn!(error = %e, "overlay run loop exited with an error");
        return Err(e.into());
    }

    info!(rank, "overlay broker shut down cleanly");
    Ok(())
}

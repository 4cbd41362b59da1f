// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SONAR Relay Daemon
//!
//! Standalone unicast relay for pub/sub discovery on networks where
//! multicast is unavailable:
//! - Cloud/Kubernetes deployments
//! - Corporate networks with multicast disabled
//! - WAN deployments
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port (7400)
//! sonar-relayd
//!
//! # Custom port and config
//! sonar-relayd --port 7500 --config relayd.json
//!
//! # Shorter client leases
//! sonar-relayd --client-timeout 5
//! ```

use clap::Parser;
use sonar::protocol::ClientInfo;
use sonar::relay::{RelayDaemon, RelayListener, UdpSocketFactory};
use sonar::transport::UdpEndpoint;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

pub use config::RelaydConfig;

/// SONAR relay daemon - unicast discovery relay for non-multicast networks
#[derive(Parser, Debug)]
#[command(name = "sonar-relayd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long)]
    bind: Option<Ipv4Addr>,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Client lease duration in seconds
    #[arg(long)]
    client_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Mirrors client lifecycle into the daemon log.
struct LogListener;

impl RelayListener for LogListener {
    fn on_client_added(&self, info: &ClientInfo) {
        info!(client = info.client_id, target = %info.target, "client registered");
    }

    fn on_client_removed(&self, info: &ClientInfo) {
        info!(client = info.client_id, target = %info.target, "client lease expired");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // File config first, CLI overrides on top.
    let mut config = match &args.config {
        Some(path) => RelaydConfig::load(path)?,
        None => RelaydConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(secs) = args.client_timeout {
        config.client_timeout_secs = secs;
    }
    config.validate()?;

    let bind = SocketAddrV4::new(config.bind_address, config.port);
    let endpoint = UdpEndpoint::unicast(bind, config.poll_timeout())?;
    info!(
        addr = %bind,
        lease_secs = config.client_timeout_secs,
        "relay daemon listening"
    );

    let daemon = RelayDaemon::spawn(
        config.relay_config(),
        Box::new(endpoint),
        Box::new(UdpSocketFactory),
    );
    daemon.add_listener(std::sync::Arc::new(LogListener));

    // Block until Ctrl-C, then drain the in-flight tick and exit.
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;
    let _ = stop_rx.recv();
    info!("shutdown signal received");

    let stats = daemon.stats();
    daemon.shutdown();
    if stats.relay_errors > 0 {
        warn!(errors = stats.relay_errors, "relay completed with send errors");
    }
    info!(
        relayed = stats.messages_relayed,
        bytes = stats.bytes_relayed,
        clients_added = stats.clients_added,
        clients_expired = stats.clients_expired,
        "relay daemon stopped"
    );
    Ok(())
}

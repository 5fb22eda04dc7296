// peerchat: rendezvous discovery, one stream per peer, broadcast chat in the terminal.

mod beacon;
mod bus;
mod config;
mod discovery;
mod pumps;
mod registry;
mod terminal;
#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;
mod transport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use peerchat_core::PeerId;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::beacon::BeaconDiscovery;
use crate::registry::{RegistryOptions, StreamRegistry};
use crate::transport::{AddressBook, TcpTransport};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    config: Option<PathBuf>,
    user: Option<String>,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args {
        config: None,
        user: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("peerchat {}", VERSION);
                return Ok(None);
            }
            "--config" => args.config = Some(it.next().context("--config needs a path")?.into()),
            "--user" => args.user = Some(it.next().context("--user needs a name")?),
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(Some(args))
}

/// Initialize tracing from PEERCHAT_LOG; defaults to "warn" to keep the chat readable.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("PEERCHAT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };
    init_tracing();

    let mut cfg = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    if args.user.is_some() {
        cfg.username = args.user;
    }

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cfg));
    // The presenter may still be parked on a blocking stdin read.
    rt.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let local_id = PeerId::random();
    let (net, presentation) = bus::channel();
    let addresses: AddressBook = Arc::new(Mutex::new(HashMap::new()));

    let transport = Arc::new(TcpTransport::new(
        local_id,
        cfg.protocol_id.clone(),
        addresses.clone(),
    ));
    let registry = StreamRegistry::new(
        transport,
        net.events.clone(),
        net.outgoing,
        net.shutdown.clone(),
        RegistryOptions {
            max_line_len: cfg.max_line_len,
            ignore_ttl: cfg.ignore_ttl(),
            ..RegistryOptions::default()
        },
    );

    let listener = TcpListener::bind((cfg.listen_address.as_str(), cfg.transport_port))
        .await
        .with_context(|| {
            format!(
                "binding stream listener on {}:{}",
                cfg.listen_address, cfg.transport_port
            )
        })?;
    info!(peer = %local_id, addr = ?listener.local_addr().ok(), "host created");
    tokio::spawn(transport::run_listener(
        listener,
        local_id,
        cfg.protocol_id.clone(),
        Arc::new(registry.clone()),
        net.shutdown.clone(),
    ));

    let discovery = BeaconDiscovery::start(
        local_id,
        cfg.discovery_port,
        cfg.transport_port,
        cfg.bootstrap_peers.clone(),
        addresses,
        net.shutdown.clone(),
    )
    .await
    .with_context(|| format!("binding discovery socket on port {}", cfg.discovery_port))?;
    tokio::spawn(discovery::run_discovery(
        Arc::new(discovery),
        registry.clone(),
        cfg.rendezvous.clone(),
        cfg.search_window(),
        net.events.clone(),
        net.shutdown.clone(),
    ));

    let trigger = net.trigger.clone();
    tokio::spawn(async move {
        if shutdown_signal().await.is_ok() {
            trigger.trigger();
        }
    });

    tokio::spawn(terminal::run_terminal(cfg.username.clone(), presentation));

    let mut shutdown = net.shutdown.clone();
    shutdown.triggered().await;
    info!(peers = registry.peers().await.len(), "shutting down");
    registry.close_all().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

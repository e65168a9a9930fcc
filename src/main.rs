use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tunscope::device;
use tunscope::protect;
use tunscope::{Engine, EngineConfig, LogSink, NoAttribution};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = if args.len() > 1 { &args[1] } else { "config.json" };

    let config = EngineConfig::load(config_path).unwrap_or_else(|e| {
        warn!("Failed to load {}: {:#}, using defaults", config_path, e);
        EngineConfig::default()
    });

    info!("=================================================");
    info!("tunscope {}", env!("CARGO_PKG_VERSION"));
    info!("=================================================");
    info!("Configuration: {}", config_path);
    info!("Exclusion: {:?}", config.exclusion.mode);
    if config.interception.enabled {
        info!(
            "Interception: ports {:?} decrypted, {:?} tunnelled",
            config.interception.intercept_ports, config.interception.tunnel_ports
        );
    } else {
        info!("Interception: disabled");
    }
    info!("=================================================");

    if let Some(addr) = config.metrics_listen {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("starting metrics exporter on {}", addr))?;
        info!("Metrics on http://{}/metrics", addr);
    }

    let fd = config
        .tun_fd
        .context("no tun_fd configured; the binary needs an inherited TUN descriptor")?;
    // SAFETY: the descriptor is handed to this process by its launcher and
    // owned by nothing else here.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let (iface, bridge) = device::attach_fd(fd, config.mtu, config.channel_capacity)
        .context("attaching the TUN descriptor")?;

    let protector = protect::from_config(&config.exclusion);
    let engine = Engine::start(
        config,
        iface,
        protector,
        Arc::new(NoAttribution),
        Arc::new(LogSink),
    )
    .await
    .context("starting engine")?;
    if let Some(pem) = engine.ca_cert_pem() {
        info!("Install this CA to inspect TLS traffic:\n{}", pem);
    }
    info!("Ready");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT, initiating graceful shutdown..."),
        Err(e) => error!("Failed to listen for SIGINT: {}", e),
    }

    engine.stop().await;
    bridge.shutdown();
    Ok(())
}

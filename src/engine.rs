// src/engine.rs - wires the pump, the relay and the sweeper together
use std::net::SocketAddrV4;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::ca::{CertificateAuthority, LeafIssuer};
use crate::config::EngineConfig;
use crate::device::VirtualInterface;
use crate::error::{Error, Result};
use crate::event::{AppAttributor, EventPipeline, EventSink};
use crate::graceful::{sweep_loop, GracefulShutdown};
use crate::protect::SocketProtector;
use crate::proxy::{upstream_client_config, InterceptionRelay};
use crate::pump::{FlowContext, PacketPump};
use crate::state::FlowManager;

pub struct Engine;

impl Engine {
    /// Boots every loop over `iface`. CA bootstrap failure is fatal here;
    /// nothing is spawned in that case.
    pub async fn start(
        config: EngineConfig,
        iface: VirtualInterface,
        protector: Arc<dyn SocketProtector>,
        attributor: Arc<dyn AppAttributor>,
        sink: Arc<dyn EventSink>,
    ) -> Result<EngineHandle> {
        config.validate().map_err(|e| Error::Config(e.to_string()))?;

        let shutdown = GracefulShutdown::new();
        let flows = Arc::new(FlowManager::new());
        let events = Arc::new(EventPipeline::new(sink, attributor));

        let mut authority = None;
        let mut relay = None;
        if config.interception.enabled {
            let dir = config.interception.ca_dir.clone();
            let ca = tokio::task::spawn_blocking(move || CertificateAuthority::load_or_create(&dir))
                .await
                .map_err(|e| Error::certificate(format!("CA bootstrap aborted: {}", e)))?
                .map_err(|e| {
                    error!("CA bootstrap failed: {}", e);
                    e
                })?;
            let ca = Arc::new(ca);
            let issuer = Arc::new(LeafIssuer::new(ca.clone())?);
            let upstream = upstream_client_config(&config.interception.extra_root_pems)?;
            let bound = InterceptionRelay::bind(
                config.interception.relay_bind,
                flows.clone(),
                events.clone(),
                protector.clone(),
                issuer,
                upstream,
            )
            .await?;
            info!("CA certificate at {}", ca.ca_cert_path().display());
            authority = Some(ca);
            relay = Some(bound);
        }

        let relay_addr = relay.as_ref().map(|r| r.local_addr()).transpose()?;
        let (inbound, writer) = iface.into_parts();
        let ctx = Arc::new(FlowContext {
            config,
            flows,
            events,
            protector,
            writer,
            relay_addr,
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(PacketPump::new(ctx.clone()).run(inbound, shutdown.clone())));
        if let Some(relay) = relay {
            tasks.push(tokio::spawn(relay.run(shutdown.clone())));
        }
        let sweeper = ctx.clone();
        tasks.push(tokio::spawn(sweep_loop(
            shutdown.clone(),
            ctx.config.sweep_interval(),
            move || sweeper.sweep_idle(),
        )));

        info!(
            "Engine started (mtu {}, relay {:?}, idle timeout {:?})",
            ctx.config.mtu,
            relay_addr,
            ctx.config.idle_timeout()
        );
        Ok(EngineHandle {
            shutdown,
            ctx,
            authority,
            tasks,
        })
    }
}

/// A running engine. Dropping it without `stop` leaves the loops running
/// until the interface closes.
pub struct EngineHandle {
    shutdown: GracefulShutdown,
    ctx: Arc<FlowContext>,
    authority: Option<Arc<CertificateAuthority>>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// PEM of the interception root, for installing into the host trust
    /// store.
    pub fn ca_cert_pem(&self) -> Option<&str> {
        self.authority.as_deref().map(|ca| ca.ca_cert_pem())
    }

    pub fn relay_addr(&self) -> Option<SocketAddrV4> {
        self.ctx.relay_addr
    }

    pub fn flows(&self) -> &Arc<FlowManager> {
        &self.ctx.flows
    }

    pub async fn stop(self) {
        info!("Stopping engine");
        self.shutdown.initiate_shutdown();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }
        self.ctx.drain();
        info!("Engine stopped");
    }
}

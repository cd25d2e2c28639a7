use super::pidfile::PidFile;
use crate::cache::Cache;
use crate::config::{Overrides, Settings, TransportKind};
use crate::dispatch::Dispatcher;
use crate::error::{AgentError, Result};
use crate::registry::HandlerRegistry;
use crate::transport::{BusTransport, SocketTransport, Status, Transport, XenStore};
use std::future::Future;
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, error, info, warn};

/// Long-running agent: one transport, one registry, requests handled in
/// arrival order.
pub struct DaemonServer {
    overrides: Overrides,
    settings: Settings,
}

impl DaemonServer {
    pub fn new(overrides: Overrides, settings: Settings) -> Self {
        Self {
            overrides,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Take the pidfile, open the configured transport and serve until
    /// SIGTERM or SIGINT.
    pub async fn run(self) -> Result<()> {
        info!("guestlink daemon starting...");

        let _pidfile = PidFile::acquire(&self.settings.pidfile)?;

        let kind = self.settings.transport_kind();
        let transport: Box<dyn Transport> = match kind {
            TransportKind::Bus => Box::new(
                BusTransport::open(
                    XenStore,
                    self.settings.bus.clone(),
                    &self.settings.sysfs_net,
                )
                .await?,
            ),
            TransportKind::Socket | TransportKind::Auto => Box::new(SocketTransport::open(
                &self.settings.socket,
                &self.settings.sysfs_net,
            )?),
        };
        info!(transport = %kind, "Transport open");

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let shutdown = async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        };

        self.serve(transport, shutdown).await
    }

    /// Serve requests from `transport` until `shutdown` resolves. SIGHUP
    /// reloads settings and handlers without abandoning the pending receive.
    pub async fn serve(
        mut self,
        mut transport: Box<dyn Transport>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let mut registry = HandlerRegistry::build(&self.settings).await;
        let mut sighup = signal(SignalKind::hangup())?;
        tokio::pin!(shutdown);

        info!(
            handlers = registry.len(),
            functions = ?self.settings.functions,
            "guestlink daemon ready"
        );

        let mut outcome = Ok(());
        loop {
            let received = {
                let receive = transport.receive();
                tokio::pin!(receive);
                loop {
                    tokio::select! {
                        result = &mut receive => break Some(result),
                        _ = sighup.recv() => self.reload(&mut registry).await,
                        _ = &mut shutdown => {
                            info!("Shutdown signal received");
                            break None;
                        }
                    }
                }
            };

            let Some(result) = received else {
                break;
            };

            match result {
                Ok(inbound) => {
                    let cache = Cache::new(&self.settings.cache);
                    let report = Dispatcher::new(&cache)
                        .backup(self.settings.backup)
                        .dispatch(&mut registry, &inbound.record, &self.settings.functions)
                        .await;
                    debug!(
                        identifier = %inbound.identifier,
                        ran = ?report.ran,
                        applied = ?report.applied,
                        "Request handled"
                    );
                    transport
                        .send(&inbound.identifier, &report.reply, Status::Ok)
                        .await;
                }
                Err(e @ AgentError::Transport(_)) => {
                    error!("Transport failed: {}", e);
                    outcome = Err(e);
                    break;
                }
                Err(e) => warn!("Dropping request: {}", e),
            }
        }

        if let Err(e) = transport.close().await {
            warn!("Failed to close transport: {}", e);
        }
        info!("guestlink daemon stopped");
        outcome
    }

    /// Re-read configuration and rebuild the handler registry. A bad file
    /// leaves the running settings in place.
    async fn reload(&mut self, registry: &mut HandlerRegistry) {
        info!("Received SIGHUP, reloading");
        match Settings::load(&self.overrides) {
            Ok(settings) => {
                if settings.transport != self.settings.transport
                    || settings.socket != self.settings.socket
                    || settings.bus != self.settings.bus
                {
                    warn!("Transport settings changed; they apply after a restart");
                }
                self.settings = settings;
            }
            Err(e) => {
                error!(
                    "Failed to reload {}: {}; keeping previous settings",
                    self.settings.configuration.display(),
                    e
                );
            }
        }
        *registry = HandlerRegistry::build(&self.settings).await;
    }
}

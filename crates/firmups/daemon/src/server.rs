//! Server setup and lifecycle management

use crate::config::DaemonConfig;
use crate::controller::{FleetReconciliationController, PassReport};
use crate::error::{DaemonError, DaemonResult};
use crate::inventory::{Inventory, InventorySummary};
use crate::simulation::{SimulatedDeviceLink, SimulatedKeyIssuer};
use crate::storage::InMemoryStorage;
use firmups_keys::KeyIssuer;
use firmups_rollout::DeviceLink;
use firmups_types::{EventSeverity, FleetEventEnvelope};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Firmups daemon
pub struct Server {
    config: DaemonConfig,
    storage: Arc<InMemoryStorage>,
    controller: Arc<FleetReconciliationController>,
    reconcile_rx: mpsc::Receiver<()>,
    issuer: Arc<dyn KeyIssuer>,
    event_tx: broadcast::Sender<FleetEventEnvelope>,
}

impl Server {
    /// Create a server talking to simulated devices
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let link = Arc::new(SimulatedDeviceLink::new(config.simulation.clone()));
        let issuer = Arc::new(SimulatedKeyIssuer::new());
        Ok(Self::with_collaborators(config, link, issuer))
    }

    /// Create a server with explicit device link and key issuer
    pub fn with_collaborators(
        config: DaemonConfig,
        link: Arc<dyn DeviceLink>,
        issuer: Arc<dyn KeyIssuer>,
    ) -> Self {
        // Create storage
        let storage = Arc::new(InMemoryStorage::new());

        // Create event channel
        let (event_tx, _) = broadcast::channel(1000);

        // Create controller
        let (controller, reconcile_rx) = FleetReconciliationController::new(
            config.reconciler.clone(),
            config.keys.clone(),
            storage.clone(),
            link,
            issuer.clone(),
            event_tx.clone(),
        );

        Self {
            config,
            storage,
            controller,
            reconcile_rx,
            issuer,
            event_tx,
        }
    }

    pub fn storage(&self) -> &Arc<InMemoryStorage> {
        &self.storage
    }

    pub fn controller(&self) -> &Arc<FleetReconciliationController> {
        &self.controller
    }

    /// Load a seed inventory into storage
    pub async fn seed(&self, inventory: &Inventory) -> DaemonResult<InventorySummary> {
        inventory
            .apply(
                &self.storage,
                self.controller.keys(),
                self.issuer.as_ref(),
                &self.config.keys.issue_policy(),
            )
            .await
    }

    /// Run a single reconciliation pass
    pub async fn run_once(&self) -> PassReport {
        self.controller.run_pass().await
    }

    /// Run until interrupted
    pub async fn run(self) -> DaemonResult<()> {
        let mut events = self.event_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(envelope) => log_event(&envelope),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event logger lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Start controller in background
        let controller = self.controller.clone();
        let handle = tokio::spawn(controller.run(self.reconcile_rx));

        tracing::info!(
            interval_secs = self.config.reconciler.interval_secs,
            "Firmups daemon running"
        );

        shutdown_signal().await;

        tracing::info!("Firmups daemon shutting down");

        // Stop controller; devices already in progress finish their step
        self.controller.shutdown();
        handle
            .await
            .map_err(|e| DaemonError::Config(format!("controller task failed: {}", e)))?;

        Ok(())
    }
}

fn log_event(envelope: &FleetEventEnvelope) {
    let pass_id = envelope.pass_id.map(|id| id.to_string()).unwrap_or_default();
    match envelope.severity {
        EventSeverity::Error => {
            tracing::error!(pass_id = %pass_id, source = ?envelope.source, event = ?envelope.event, "Fleet event")
        }
        EventSeverity::Warning => {
            tracing::warn!(pass_id = %pass_id, source = ?envelope.source, event = ?envelope.event, "Fleet event")
        }
        EventSeverity::Info => {
            tracing::info!(pass_id = %pass_id, source = ?envelope.source, event = ?envelope.event, "Fleet event")
        }
        EventSeverity::Debug => {
            tracing::debug!(pass_id = %pass_id, source = ?envelope.source, event = ?envelope.event, "Fleet event")
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

//! Periodic expiry sweep.
//!
//! Runs [`CreditLedger::expire_grants`] on an interval until shutdown is
//! requested, and optionally prunes old applied-event records.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};

use super::engine::{CreditLedger, ExpirySummary};
use super::store::LedgerStore;
use crate::config::{LedgerConfig, SweeperConfig};
use crate::error::Result;
use crate::reconciler::AppliedEventStore;

/// Background worker that expires lapsed grants.
pub struct ExpirySweeper<S: LedgerStore + 'static> {
    ledger: CreditLedger<S>,
    interval: Duration,
    applied_events: Option<(Arc<dyn AppliedEventStore>, u32)>,
    shutdown_tx: mpsc::Sender<()>,
}

impl<S: LedgerStore + 'static> ExpirySweeper<S> {
    /// Create a sweeper and the receiver its run loop listens on.
    pub fn new(ledger: CreditLedger<S>, config: &SweeperConfig) -> (Self, mpsc::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Self {
                ledger,
                interval: Duration::from_secs(config.interval_seconds),
                applied_events: None,
                shutdown_tx,
            },
            shutdown_rx,
        )
    }

    /// Also delete applied-event records past the retention window on every pass.
    #[must_use]
    pub fn with_event_cleanup(
        mut self,
        store: Arc<dyn AppliedEventStore>,
        config: &LedgerConfig,
    ) -> Self {
        self.applied_events = Some((store, config.event_retention_days));
        self
    }

    /// Run one sweep pass.
    pub async fn run_once(&self) -> Result<ExpirySummary> {
        let summary = self.ledger.expire_grants(Utc::now()).await?;

        if let Some((store, retention_days)) = &self.applied_events {
            let removed = store.cleanup_older_than(*retention_days).await?;
            if removed > 0 {
                tracing::info!(
                    target: "ledgerlink::sweeper",
                    removed = removed,
                    retention_days = *retention_days,
                    "Pruned applied-event records"
                );
            }
        }

        Ok(summary)
    }

    /// Sweep on the configured interval until shutdown is requested.
    pub async fn start(self, mut shutdown_rx: mpsc::Receiver<()>) {
        tracing::info!(
            target: "ledgerlink::sweeper",
            interval_seconds = self.interval.as_secs(),
            "Expiry sweeper started"
        );

        loop {
            if let Err(e) = self.run_once().await {
                tracing::error!(target: "ledgerlink::sweeper", error = %e, "Expiry sweep failed");
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = sleep(self.interval) => {}
            }
        }

        tracing::info!(target: "ledgerlink::sweeper", "Expiry sweeper stopped");
    }

    /// Spawn the run loop onto the runtime.
    pub fn spawn(self, shutdown_rx: mpsc::Receiver<()>) -> SweeperHandle {
        let shutdown_tx = self.shutdown_tx.clone();
        let handle = tokio::spawn(async move {
            self.start(shutdown_rx).await;
        });
        SweeperHandle {
            handle,
            shutdown_tx,
        }
    }
}

/// Handle to a spawned [`ExpirySweeper`].
pub struct SweeperHandle {
    handle: tokio::task::JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl SweeperHandle {
    /// Stop the sweeper after its current pass and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

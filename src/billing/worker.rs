//! Background driver for scheduled billing.
//!
//! The worker runs the billing tick on a fixed interval inside a tokio
//! task, with graceful shutdown over an mpsc channel. Deployments that
//! drive billing externally (cron hitting an admin endpoint) can skip the
//! worker and call `process_billing_cycle` directly.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::BillingConfig;

use super::audit::{BillingAuditLogger, NoOpAuditLogger};
use super::gateway::PaymentGateway;
use super::scheduler::BillingScheduler;
use super::storage::SubscriptionStore;

/// A worker that runs the billing cycle on an interval.
pub struct BillingWorker<
    S: SubscriptionStore,
    G: PaymentGateway,
    A: BillingAuditLogger = NoOpAuditLogger,
> {
    scheduler: Arc<BillingScheduler<S, G, A>>,
    config: BillingConfig,
    shutdown_tx: mpsc::Sender<()>,
}

impl<S, G, A> BillingWorker<S, G, A>
where
    S: SubscriptionStore,
    G: PaymentGateway,
    A: BillingAuditLogger,
{
    /// Create a new billing worker around a scheduler.
    ///
    /// Returns the worker together with the shutdown receiver to pass to
    /// [`start`](Self::start). Spawning is left to the caller:
    ///
    /// ```ignore
    /// let (worker, shutdown_rx) = BillingWorker::new(scheduler, config);
    /// let shutdown_tx = worker.shutdown_sender();
    /// let task = tokio::spawn(worker.start(shutdown_rx));
    /// let handle = BillingWorkerHandle::new(task, shutdown_tx);
    /// ```
    pub fn new(
        scheduler: Arc<BillingScheduler<S, G, A>>,
        config: BillingConfig,
    ) -> (Self, mpsc::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Self {
                scheduler,
                config,
                shutdown_tx,
            },
            shutdown_rx,
        )
    }

    /// A sender that can stop the worker once it has been started.
    pub fn shutdown_sender(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run billing ticks until shutdown is requested.
    ///
    /// The first tick fires immediately, so charges that came due while
    /// the process was down are caught up without waiting out a full
    /// interval.
    pub async fn start(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.worker_interval());

        tracing::info!(
            target: "rebill::worker",
            interval_secs = self.config.worker_interval_secs,
            "Billing worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!(
                        target: "rebill::worker",
                        "Shutdown signal received, finishing current tick..."
                    );
                    break;
                }
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
            }
        }

        tracing::info!(target: "rebill::worker", "Billing worker stopped");
    }

    /// Request shutdown of this worker.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn run_tick(&self) {
        match self.scheduler.process_billing_cycle().await {
            Ok(summary) => {
                // The scheduler already logs the summary at info.
                tracing::debug!(
                    target: "rebill::worker",
                    processed = summary.processed,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    demoted = summary.demoted,
                    "Billing tick completed"
                );
            }
            Err(e) => {
                // Due rows stay due; the next interval picks them up again.
                tracing::error!(
                    target: "rebill::worker",
                    error = %e,
                    "Billing tick failed"
                );
            }
        }

        match self.scheduler.cleanup_processed_events().await {
            Ok(0) => {}
            Ok(removed) => {
                tracing::debug!(
                    target: "rebill::worker",
                    removed,
                    "Expired processed-event ids removed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    target: "rebill::worker",
                    error = %e,
                    "Processed-event cleanup failed"
                );
            }
        }
    }
}

/// Handle to a spawned billing worker task.
pub struct BillingWorkerHandle {
    task: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl BillingWorkerHandle {
    /// Wrap a spawned worker task and its shutdown sender.
    #[must_use]
    pub fn new(task: JoinHandle<()>, shutdown_tx: mpsc::Sender<()>) -> Self {
        Self { task, shutdown_tx }
    }

    /// Stop the worker and wait for its loop to exit.
    ///
    /// A tick already in flight finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

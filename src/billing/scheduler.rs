//! Scheduled billing and the charge retry state machine.
//!
//! Each tick selects ACTIVE subscriptions at or past their
//! `next_billing_date` and charges them through the gateway. A capture
//! resets the retry budget and advances the billing date by one period; a
//! declined or errored charge burns one attempt, and the attempt that
//! exhausts the budget moves the row to DELINQUENT, where the scheduler
//! never touches it again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::Result;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::error::BillingError;
use super::gateway::{ChargeOutcome, PaymentGateway};
use super::storage::{StoredSubscription, SubscriptionStatus, SubscriptionStore};

/// Get current Unix timestamp in seconds.
fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Counters returned by one billing tick.
///
/// A row that fails its final attempt counts under both `failed` and
/// `demoted`; a row demoted without a charge (already over budget) counts
/// only under `demoted`. Rows skipped on a write conflict count under
/// `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BillingCycleSummary {
    /// Due subscriptions examined this tick.
    pub processed: usize,
    /// Charges captured.
    pub succeeded: usize,
    /// Charges declined or errored, plus rows skipped on conflicts.
    pub failed: usize,
    /// Rows that left the tick DELINQUENT.
    pub demoted: usize,
}

/// Per-row outcome of one due subscription.
enum TickOutcome {
    /// Charge captured, billing date advanced.
    Charged,
    /// Charge failed, attempt burned, still ACTIVE.
    Retrying,
    /// Charge failed and the budget ran out.
    Demoted,
    /// Already over budget; demoted without a charge attempt.
    PreDemoted,
    /// Lost a write race or went stale, untouched this tick.
    Skipped,
}

/// Scheduled billing engine.
///
/// Generic over the store, gateway, and audit sinks so tests can script
/// every collaborator.
pub struct BillingScheduler<
    S: SubscriptionStore,
    G: PaymentGateway,
    A: BillingAuditLogger = NoOpAuditLogger,
> {
    store: S,
    gateway: G,
    audit: A,
    config: BillingConfig,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl<S: SubscriptionStore, G: PaymentGateway> BillingScheduler<S, G> {
    /// Create a scheduler without audit logging.
    #[must_use]
    pub fn new(store: S, gateway: G, config: BillingConfig) -> Self {
        Self::with_audit(store, gateway, NoOpAuditLogger, config)
    }
}

impl<S: SubscriptionStore, G: PaymentGateway, A: BillingAuditLogger> BillingScheduler<S, G, A> {
    /// Create a scheduler that reports money movement to an audit sink.
    #[must_use]
    pub fn with_audit(store: S, gateway: G, audit: A, config: BillingConfig) -> Self {
        Self {
            store,
            gateway,
            audit,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run one billing tick.
    ///
    /// Every due subscription is processed independently: a gateway error or
    /// store conflict on one row is logged and counted under `failed`, and
    /// the loop moves on. The tick itself only fails when the due listing
    /// cannot be read at all.
    pub async fn process_billing_cycle(&self) -> Result<BillingCycleSummary> {
        let now = current_timestamp();
        let due = self.store.list_due(now).await?;
        let mut summary = BillingCycleSummary::default();

        tracing::info!(
            target: "rebill::scheduler",
            due = due.len(),
            "Billing cycle started"
        );

        for row in due {
            summary.processed += 1;
            let subscription_id = row.id;
            match self.process_subscription(subscription_id, now).await {
                Ok(TickOutcome::Charged) => summary.succeeded += 1,
                Ok(TickOutcome::Retrying) => summary.failed += 1,
                Ok(TickOutcome::Demoted) => {
                    summary.failed += 1;
                    summary.demoted += 1;
                }
                Ok(TickOutcome::PreDemoted) => summary.demoted += 1,
                Ok(TickOutcome::Skipped) => summary.failed += 1,
                Err(err) => {
                    summary.failed += 1;
                    tracing::error!(
                        target: "rebill::scheduler",
                        subscription_id = %subscription_id,
                        error = %err,
                        "Billing tick row failed"
                    );
                }
            }
        }

        self.prune_locks().await;

        tracing::info!(
            target: "rebill::scheduler",
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            demoted = summary.demoted,
            "Billing cycle finished"
        );

        Ok(summary)
    }

    /// Drive one subscription through the state machine, serialized per row.
    async fn process_subscription(&self, subscription_id: Uuid, now: u64) -> Result<TickOutcome> {
        let lock = self.subscription_lock(subscription_id).await;
        let _guard = lock.lock().await;

        // Re-read under the lock; the due listing is a snapshot and another
        // writer may have gotten here first.
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound { subscription_id })?;

        if !subscription.is_due(now) {
            tracing::debug!(
                target: "rebill::scheduler",
                subscription_id = %subscription_id,
                "No longer due, skipping"
            );
            return Ok(TickOutcome::Skipped);
        }

        let original_version = subscription.version;

        // A row already over budget but still ACTIVE (an earlier tick stopped
        // partway) is demoted without burning another charge.
        if subscription.attempt_count >= self.config.retry_limit {
            let mut updated = subscription.clone();
            updated.status = SubscriptionStatus::Delinquent;
            updated.touch(now);

            if !self.store.compare_and_save(&updated, original_version).await? {
                tracing::warn!(
                    target: "rebill::scheduler",
                    subscription_id = %subscription_id,
                    "Concurrent write during demotion, skipping"
                );
                return Ok(TickOutcome::Skipped);
            }

            tracing::warn!(
                target: "rebill::scheduler",
                subscription_id = %subscription_id,
                attempt_count = updated.attempt_count,
                "Subscription over retry budget, demoted without charge"
            );
            self.audit
                .log(BillingAuditEvent::SubscriptionDemoted {
                    subscription_id,
                    attempt_count: updated.attempt_count,
                })
                .await;
            return Ok(TickOutcome::PreDemoted);
        }

        match self.attempt_charge(&subscription).await {
            Ok(ChargeOutcome::Approved) => {
                self.after_captured_charge(subscription, original_version, now)
                    .await
            }
            Ok(ChargeOutcome::Declined) => {
                tracing::warn!(
                    target: "rebill::scheduler",
                    subscription_id = %subscription_id,
                    attempt_count = subscription.attempt_count,
                    "Charge declined"
                );
                self.after_failed_charge(subscription, original_version, now)
                    .await
            }
            Err(err) => {
                tracing::error!(
                    target: "rebill::scheduler",
                    subscription_id = %subscription_id,
                    error = %err,
                    "Charge attempt errored, treating as declined"
                );
                self.after_failed_charge(subscription, original_version, now)
                    .await
            }
        }
    }

    /// Call the gateway under the configured timeout.
    ///
    /// An elapsed timeout comes back as `GatewayUnavailable`; the caller
    /// treats any error as a declined charge.
    async fn attempt_charge(&self, subscription: &StoredSubscription) -> Result<ChargeOutcome> {
        let customer_ref = subscription
            .customer_id
            .clone()
            .unwrap_or_else(|| subscription.user_id.to_string());

        match tokio::time::timeout(
            self.config.gateway_timeout(),
            self.gateway.charge(&customer_ref, subscription.amount_cents),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BillingError::GatewayUnavailable {
                operation: "charge".to_string(),
                message: format!(
                    "charge timed out after {}s",
                    self.config.gateway_timeout_secs
                ),
            }
            .into()),
        }
    }

    async fn after_captured_charge(
        &self,
        subscription: StoredSubscription,
        original_version: u64,
        now: u64,
    ) -> Result<TickOutcome> {
        let subscription_id = subscription.id;
        let mut updated = subscription.clone();
        updated.attempt_count = 0;
        updated.last_attempt = Some(now);
        updated.next_billing_date =
            subscription.next_billing_date + self.config.billing_period_secs();
        updated.touch(now);

        // The money already moved. If the save loses a race we must not
        // charge again; flag the row for reconciliation instead.
        if !self.store.compare_and_save(&updated, original_version).await? {
            tracing::error!(
                target: "rebill::scheduler",
                subscription_id = %subscription_id,
                "Charge captured but state save lost a write race"
            );
            return Ok(TickOutcome::Skipped);
        }

        tracing::info!(
            target: "rebill::scheduler",
            subscription_id = %subscription_id,
            amount_cents = subscription.amount_cents,
            next_billing_date = updated.next_billing_date,
            "Charge captured"
        );
        self.audit
            .log(BillingAuditEvent::ChargeSucceeded {
                subscription_id,
                amount_cents: subscription.amount_cents,
                next_billing_date: updated.next_billing_date,
            })
            .await;

        Ok(TickOutcome::Charged)
    }

    async fn after_failed_charge(
        &self,
        subscription: StoredSubscription,
        original_version: u64,
        now: u64,
    ) -> Result<TickOutcome> {
        let subscription_id = subscription.id;
        let mut updated = subscription.clone();
        updated.attempt_count = subscription.attempt_count + 1;
        updated.last_attempt = Some(now);

        let demoted = updated.attempt_count >= self.config.retry_limit;
        if demoted {
            updated.status = SubscriptionStatus::Delinquent;
        }
        updated.touch(now);

        if !self.store.compare_and_save(&updated, original_version).await? {
            tracing::warn!(
                target: "rebill::scheduler",
                subscription_id = %subscription_id,
                "Concurrent write after failed charge, skipping"
            );
            return Ok(TickOutcome::Skipped);
        }

        self.audit
            .log(BillingAuditEvent::ChargeFailed {
                subscription_id,
                amount_cents: subscription.amount_cents,
                attempt_count: updated.attempt_count,
            })
            .await;

        if demoted {
            tracing::warn!(
                target: "rebill::scheduler",
                subscription_id = %subscription_id,
                attempt_count = updated.attempt_count,
                "Retry budget exhausted, subscription demoted"
            );
            self.audit
                .log(BillingAuditEvent::SubscriptionDemoted {
                    subscription_id,
                    attempt_count: updated.attempt_count,
                })
                .await;
            return Ok(TickOutcome::Demoted);
        }

        Ok(TickOutcome::Retrying)
    }

    /// Housekeeping run alongside the billing tick: drop processed webhook
    /// event ids older than the configured retention.
    pub async fn cleanup_processed_events(&self) -> Result<usize> {
        self.store
            .cleanup_old_events(self.config.processed_event_retention_days)
            .await
    }

    /// Per-subscription guard so overlapping ticks in this process serialize
    /// on the same row.
    async fn subscription_lock(&self, subscription_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(subscription_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Evict registry entries nobody holds anymore.
    ///
    /// Entries whose only reference is the registry itself belong to rows
    /// this tick has finished with (or rows gone terminal); without eviction
    /// the map grows by one `Arc` per subscription ever processed. A guard
    /// still held by an overlapping tick keeps its entry alive.
    async fn prune_locks(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

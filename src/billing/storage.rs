//! Storage traits for subscription data.
//!
//! Implement [`SubscriptionStore`] to persist subscription state to your
//! database. An in-memory implementation is provided for testing.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plans::PlanTier;

/// Trait for storing subscription records.
///
/// Implement this trait to persist subscription state to your database.
/// Records are keyed by subscription `id`; a user may hold several records
/// over time, and the store tolerates more than one ACTIVE row (readers
/// resolve ambiguity by recency).
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    // Subscription records

    /// Save/update a subscription record, keyed by its `id`.
    async fn save_subscription(&self, subscription: &StoredSubscription) -> Result<()>;

    /// Get a subscription by ID.
    async fn get_subscription(&self, id: Uuid) -> Result<Option<StoredSubscription>>;

    /// All subscriptions for a user, most recently created first.
    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<StoredSubscription>>;

    /// ACTIVE subscriptions for a user, most recently created first
    /// (`created_at` descending, `start_date` as tie-break).
    async fn list_active_by_user(&self, user_id: Uuid) -> Result<Vec<StoredSubscription>>;

    /// ACTIVE subscriptions whose `next_billing_date` is at or before `now`,
    /// oldest due first.
    async fn list_due(&self, now: u64) -> Result<Vec<StoredSubscription>>;

    /// Save a subscription only if the stored record still carries
    /// `expected_version`.
    ///
    /// This is used for optimistic locking: the retry scheduler and the
    /// cancellation engine re-check the version at write time so a concurrent
    /// writer is never silently overwritten. Returns `Ok(true)` if the save
    /// succeeded, `Ok(false)` if the version didn't match.
    ///
    /// # Important: Production Implementations MUST Override This
    ///
    /// The default implementation has a **time-of-check to time-of-use (TOCTOU)
    /// race condition** and is only suitable for single-threaded development
    /// scenarios. Production implementations MUST override this method with an
    /// atomic compare-and-swap operation. Examples:
    ///
    /// - **PostgreSQL**: Use `UPDATE ... WHERE version = $expected_version`
    /// - **Redis**: Use `WATCH`/`MULTI`/`EXEC` transactions
    /// - **DynamoDB**: Use conditional writes with `ConditionExpression`
    ///
    /// # Example (PostgreSQL)
    ///
    /// ```sql
    /// UPDATE subscriptions
    /// SET ..., version = version + 1, updated_at = $now
    /// WHERE id = $1 AND version = $2
    /// RETURNING id
    /// ```
    ///
    /// If the query returns a row, the update succeeded. If not, version mismatch.
    async fn compare_and_save(
        &self,
        subscription: &StoredSubscription,
        expected_version: u64,
    ) -> Result<bool> {
        // WARNING: This default implementation is NOT atomic and has a TOCTOU race condition.
        // It exists only for simple development scenarios. Production code MUST override
        // this method with an atomic implementation.
        #[cfg(debug_assertions)]
        {
            static WARNED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
            if !WARNED.swap(true, std::sync::atomic::Ordering::Relaxed) {
                tracing::warn!(
                    target: "rebill::store",
                    "Using default non-atomic compare_and_save implementation. \
                     This is NOT safe for production use with concurrent writers. \
                     Override this method with an atomic compare-and-swap operation."
                );
            }
        }

        if let Some(current) = self.get_subscription(subscription.id).await? {
            if current.version != expected_version {
                return Ok(false);
            }
        }
        self.save_subscription(subscription).await?;
        Ok(true)
    }

    // Refund / reconciliation queries

    /// Find the subscription holding a gateway payment intent reference.
    async fn find_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<StoredSubscription>>;

    /// Subscriptions currently in the given refund state.
    async fn list_by_refund_state(&self, state: RefundState) -> Result<Vec<StoredSubscription>>;

    /// Subscriptions cancelled with `from <= cancelled_at < to`.
    async fn list_cancelled_between(&self, from: u64, to: u64) -> Result<Vec<StoredSubscription>>;

    // Checkout event idempotency

    /// Check if a checkout event has already been processed.
    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    /// Mark a checkout event as processed.
    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;

    // Optional: cleanup old events

    /// Clean up old processed events (default: no-op).
    async fn cleanup_old_events(&self, _older_than_days: u64) -> Result<usize> {
        Ok(0)
    }
}

/// A stored subscription record.
///
/// The single core entity of the billing engine. Timestamps are Unix seconds,
/// monetary values are centavos. Every write path stamps `updated_at` and
/// bumps `version` through [`StoredSubscription::touch`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredSubscription {
    /// Subscription ID (store-owned).
    pub id: Uuid,
    /// Owning user in the external user directory.
    pub user_id: Uuid,
    /// Plan tier.
    pub plan: PlanTier,
    /// Amount charged per billing period, in centavos.
    pub amount_cents: i64,
    /// Lifecycle status.
    pub status: SubscriptionStatus,
    /// When the subscription started.
    pub start_date: u64,
    /// When the subscription ended. Set on cancellation or expiry.
    pub end_date: Option<u64>,
    /// Next scheduled charge. Lifetime plans carry a far-future sentinel.
    pub next_billing_date: u64,
    /// Consecutive failed charge attempts. Reset to 0 on success.
    pub attempt_count: u32,
    /// When the last charge attempt ran.
    pub last_attempt: Option<u64>,
    /// Gateway payment intent from the original checkout.
    pub payment_intent_id: Option<String>,
    /// Gateway customer reference.
    pub customer_id: Option<String>,
    /// Gateway-side subscription reference.
    pub gateway_subscription_id: Option<String>,
    /// Gateway refund reference, once a refund has been requested.
    pub refund_id: Option<String>,
    /// Refund progress.
    pub refund_status: RefundState,
    /// Refunded amount in centavos.
    pub refund_amount_cents: Option<i64>,
    /// Why the refund was issued.
    pub refund_reason: Option<String>,
    /// When the refund request was recorded.
    pub refund_processed_at: Option<u64>,
    /// User-supplied cancellation reason.
    pub cancellation_reason: Option<String>,
    /// When the subscription was cancelled.
    pub cancelled_at: Option<u64>,
    /// Who triggered the cancellation.
    pub cancelled_by: Option<CancelledBy>,
    /// Record creation timestamp.
    pub created_at: u64,
    /// Last modification timestamp. Stamped explicitly by every write path.
    pub updated_at: u64,
    /// Optimistic concurrency token for `compare_and_save`.
    pub version: u64,
}

impl StoredSubscription {
    /// Create a fresh ACTIVE record for a user on a plan.
    ///
    /// `amount_cents` is taken from the tier's price; gateway linkage and
    /// audit fields start empty.
    #[must_use]
    pub fn new(user_id: Uuid, plan: PlanTier, now: u64, next_billing_date: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            plan,
            amount_cents: plan.price_cents(),
            status: SubscriptionStatus::Active,
            start_date: now,
            end_date: None,
            next_billing_date,
            attempt_count: 0,
            last_attempt: None,
            payment_intent_id: None,
            customer_id: None,
            gateway_subscription_id: None,
            refund_id: None,
            refund_status: RefundState::None,
            refund_amount_cents: None,
            refund_reason: None,
            refund_processed_at: None,
            cancellation_reason: None,
            cancelled_at: None,
            cancelled_by: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Check if the subscription is ACTIVE.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Check if the subscription is ACTIVE and not past its end date.
    #[must_use]
    pub fn is_current(&self, now: u64) -> bool {
        self.is_active() && self.end_date.is_none_or(|end| end > now)
    }

    /// Check if the subscription is due for a scheduled charge.
    #[must_use]
    pub fn is_due(&self, now: u64) -> bool {
        self.is_active() && self.next_billing_date <= now
    }

    /// Stamp `updated_at` and bump the version. Call before every save.
    pub fn touch(&mut self, now: u64) {
        self.updated_at = now;
        self.version += 1;
    }
}

/// Subscription lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    /// In good standing; eligible for scheduled charges.
    Active,
    /// Retry budget exhausted; excluded from automatic billing until a
    /// human or a successful payment intervenes.
    Delinquent,
    /// Terminated by user or admin. Terminal.
    Cancelled,
    /// Ran past its end date. Terminal.
    Expired,
}

impl SubscriptionStatus {
    /// Parse a stored or administrative status string.
    ///
    /// Case-insensitive; accepts the single-L spelling of CANCELLED.
    /// Returns `None` for anything outside the enumerated set.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "ACTIVE" => Some(Self::Active),
            "DELINQUENT" => Some(Self::Delinquent),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Convert to the canonical stored string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Delinquent => "DELINQUENT",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Terminal statuses never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Refund progress for a cancelled subscription.
///
/// Populated only after a refund has actually been requested from the
/// gateway; `None` is the resting state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundState {
    /// No refund requested.
    #[default]
    None,
    /// Requested from the gateway; settlement pending.
    Pending,
    /// Confirmed settled by the gateway.
    Succeeded,
    /// The gateway refused, or the request errored out.
    Failed,
    /// Withdrawn before settlement.
    Canceled,
}

impl RefundState {
    /// Convert to the canonical stored string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Pending => "PENDING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for RefundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who triggered a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelledBy {
    /// The subscriber themselves.
    User,
    /// Support or back-office staff.
    Admin,
    /// Automated policy.
    System,
}

impl CancelledBy {
    /// Convert to the canonical stored string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Admin => "ADMIN",
            Self::System => "SYSTEM",
        }
    }
}

impl std::fmt::Display for CancelledBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// In-memory subscription store for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    /// In-memory subscription store for testing and local development.
    ///
    /// Wraps data in Arc for cheap cloning. Unlike the trait's default,
    /// `compare_and_save` here is genuinely atomic (single write lock).
    #[derive(Default, Clone)]
    pub struct InMemorySubscriptionStore {
        inner: Arc<InMemorySubscriptionStoreInner>,
    }

    #[derive(Default)]
    struct InMemorySubscriptionStoreInner {
        subscriptions: RwLock<HashMap<Uuid, StoredSubscription>>,
        processed_events: RwLock<HashMap<String, u64>>,
    }

    impl InMemorySubscriptionStore {
        /// Create a new in-memory store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed subscriptions for testing.
        pub fn seed(&self, subscriptions: Vec<StoredSubscription>) {
            let mut store = self.inner.subscriptions.write().unwrap();
            for sub in subscriptions {
                store.insert(sub.id, sub);
            }
        }

        /// Get all subscriptions (for testing).
        pub fn all_subscriptions(&self) -> Vec<StoredSubscription> {
            self.inner
                .subscriptions
                .read()
                .unwrap()
                .values()
                .cloned()
                .collect()
        }

        /// Get all processed event IDs (for testing).
        pub fn processed_event_ids(&self) -> Vec<String> {
            self.inner
                .processed_events
                .read()
                .unwrap()
                .keys()
                .cloned()
                .collect()
        }
    }

    fn recency(a: &StoredSubscription, b: &StoredSubscription) -> std::cmp::Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then(b.start_date.cmp(&a.start_date))
    }

    #[async_trait]
    impl SubscriptionStore for InMemorySubscriptionStore {
        async fn save_subscription(&self, subscription: &StoredSubscription) -> Result<()> {
            self.inner
                .subscriptions
                .write()
                .unwrap()
                .insert(subscription.id, subscription.clone());
            Ok(())
        }

        async fn get_subscription(&self, id: Uuid) -> Result<Option<StoredSubscription>> {
            Ok(self.inner.subscriptions.read().unwrap().get(&id).cloned())
        }

        async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<StoredSubscription>> {
            let subs = self.inner.subscriptions.read().unwrap();
            let mut rows: Vec<StoredSubscription> = subs
                .values()
                .filter(|s| s.user_id == user_id)
                .cloned()
                .collect();
            rows.sort_by(recency);
            Ok(rows)
        }

        async fn list_active_by_user(&self, user_id: Uuid) -> Result<Vec<StoredSubscription>> {
            let subs = self.inner.subscriptions.read().unwrap();
            let mut rows: Vec<StoredSubscription> = subs
                .values()
                .filter(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
                .cloned()
                .collect();
            rows.sort_by(recency);
            Ok(rows)
        }

        async fn list_due(&self, now: u64) -> Result<Vec<StoredSubscription>> {
            let subs = self.inner.subscriptions.read().unwrap();
            let mut rows: Vec<StoredSubscription> = subs
                .values()
                .filter(|s| s.is_due(now))
                .cloned()
                .collect();
            rows.sort_by_key(|s| s.next_billing_date);
            Ok(rows)
        }

        async fn compare_and_save(
            &self,
            subscription: &StoredSubscription,
            expected_version: u64,
        ) -> Result<bool> {
            let mut subs = self.inner.subscriptions.write().unwrap();

            // Check-and-insert under a single write lock, so this is atomic.
            if let Some(current) = subs.get(&subscription.id) {
                if current.version != expected_version {
                    return Ok(false);
                }
            }

            subs.insert(subscription.id, subscription.clone());
            Ok(true)
        }

        async fn find_by_payment_intent(
            &self,
            payment_intent_id: &str,
        ) -> Result<Option<StoredSubscription>> {
            let subs = self.inner.subscriptions.read().unwrap();
            Ok(subs
                .values()
                .find(|s| s.payment_intent_id.as_deref() == Some(payment_intent_id))
                .cloned())
        }

        async fn list_by_refund_state(
            &self,
            state: RefundState,
        ) -> Result<Vec<StoredSubscription>> {
            let subs = self.inner.subscriptions.read().unwrap();
            let mut rows: Vec<StoredSubscription> = subs
                .values()
                .filter(|s| s.refund_status == state)
                .cloned()
                .collect();
            rows.sort_by_key(|s| s.refund_processed_at);
            Ok(rows)
        }

        async fn list_cancelled_between(
            &self,
            from: u64,
            to: u64,
        ) -> Result<Vec<StoredSubscription>> {
            let subs = self.inner.subscriptions.read().unwrap();
            let mut rows: Vec<StoredSubscription> = subs
                .values()
                .filter(|s| s.cancelled_at.is_some_and(|at| at >= from && at < to))
                .cloned()
                .collect();
            rows.sort_by_key(|s| s.cancelled_at);
            Ok(rows)
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            Ok(self
                .inner
                .processed_events
                .read()
                .unwrap()
                .contains_key(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);

            self.inner
                .processed_events
                .write()
                .unwrap()
                .insert(event_id.to_string(), now);
            Ok(())
        }

        async fn cleanup_old_events(&self, older_than_days: u64) -> Result<usize> {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);

            let cutoff = now.saturating_sub(older_than_days * 86400);
            let mut events = self.inner.processed_events.write().unwrap();
            let initial_len = events.len();
            events.retain(|_, &mut timestamp| timestamp >= cutoff);
            Ok(initial_len - events.len())
        }
    }
}

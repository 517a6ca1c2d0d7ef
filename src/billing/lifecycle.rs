//! Subscription lifecycle management.
//!
//! Handles creation, validity checks, lookups, administrative status
//! transitions, and gateway linkage for subscription records. Scheduled
//! retries live in the scheduler and cancellation in its own engine; this
//! manager never moves money.

use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::Result;

use super::error::BillingError;
use super::plans::PlanTier;
use super::storage::{StoredSubscription, SubscriptionStatus, SubscriptionStore};

/// Get current Unix timestamp in seconds.
fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Subscription lifecycle operations.
pub struct SubscriptionManager<S: SubscriptionStore> {
    store: S,
    config: BillingConfig,
}

impl<S: SubscriptionStore> SubscriptionManager<S> {
    /// Create a new subscription manager.
    #[must_use]
    pub fn new(store: S, config: BillingConfig) -> Self {
        Self { store, config }
    }

    /// Create an ACTIVE subscription for a user on the named plan.
    ///
    /// The plan arrives as a string, the way checkout metadata delivers it,
    /// and is parsed against the tier catalog; unknown plans fail with
    /// `InvalidPlan` before anything is persisted.
    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        plan: &str,
    ) -> Result<StoredSubscription> {
        let tier = PlanTier::parse(plan).ok_or_else(|| BillingError::InvalidPlan {
            plan: plan.to_string(),
        })?;
        self.create_subscription_for_tier(user_id, tier).await
    }

    /// Create an ACTIVE subscription for a caller that already holds a tier.
    ///
    /// Monthly tiers get `next_billing_date = now + billing_period`; lifetime
    /// tiers a far-future sentinel the scheduler never reaches.
    pub async fn create_subscription_for_tier(
        &self,
        user_id: Uuid,
        tier: PlanTier,
    ) -> Result<StoredSubscription> {
        let now = current_timestamp();
        let next_billing = tier.next_billing_from(now, self.config.billing_period_secs());
        let subscription = StoredSubscription::new(user_id, tier, now, next_billing);
        self.store.save_subscription(&subscription).await?;

        tracing::info!(
            target: "rebill::lifecycle",
            subscription_id = %subscription.id,
            user_id = %user_id,
            plan = %tier,
            amount_cents = subscription.amount_cents,
            "Subscription created"
        );

        Ok(subscription)
    }

    /// Check if the user holds at least one usable subscription: status
    /// ACTIVE and no end date in the past.
    pub async fn is_valid(&self, user_id: Uuid) -> Result<bool> {
        let now = current_timestamp();
        let active = self.store.list_active_by_user(user_id).await?;
        Ok(active.iter().any(|sub| sub.is_current(now)))
    }

    /// The user's current ACTIVE subscription, if any.
    ///
    /// When several rows are simultaneously ACTIVE, which the store
    /// tolerates, the most recently created one wins.
    pub async fn find_active(&self, user_id: Uuid) -> Result<Option<StoredSubscription>> {
        let active = self.store.list_active_by_user(user_id).await?;
        Ok(active.into_iter().next())
    }

    /// The user's most recent subscription regardless of status.
    pub async fn find_most_recent(&self, user_id: Uuid) -> Result<Option<StoredSubscription>> {
        let all = self.store.list_by_user(user_id).await?;
        Ok(all.into_iter().next())
    }

    /// Administrative status change.
    ///
    /// The status arrives as a string and is parsed against the enumerated
    /// set. This rewrites the status directly without running the retry
    /// machine or the cancellation flow; moving to a terminal status stamps
    /// `end_date` if it was never set.
    pub async fn update_status(
        &self,
        subscription_id: Uuid,
        new_status: &str,
    ) -> Result<StoredSubscription> {
        let status =
            SubscriptionStatus::parse(new_status).ok_or_else(|| BillingError::InvalidStatus {
                status: new_status.to_string(),
            })?;

        let mut subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound { subscription_id })?;

        let now = current_timestamp();
        subscription.status = status;
        if status.is_terminal() && subscription.end_date.is_none() {
            subscription.end_date = Some(now);
        }
        subscription.touch(now);
        self.store.save_subscription(&subscription).await?;

        tracing::info!(
            target: "rebill::lifecycle",
            subscription_id = %subscription_id,
            status = %status,
            "Subscription status updated"
        );

        Ok(subscription)
    }

    /// Record gateway linkage after checkout settles.
    ///
    /// Fields passed as `None` keep their stored value, so partial updates
    /// from separate provider events merge instead of erasing each other.
    pub async fn update_payment_info(
        &self,
        subscription_id: Uuid,
        payment_intent_id: Option<String>,
        customer_id: Option<String>,
        gateway_subscription_id: Option<String>,
    ) -> Result<StoredSubscription> {
        let mut subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound { subscription_id })?;

        if payment_intent_id.is_some() {
            subscription.payment_intent_id = payment_intent_id;
        }
        if customer_id.is_some() {
            subscription.customer_id = customer_id;
        }
        if gateway_subscription_id.is_some() {
            subscription.gateway_subscription_id = gateway_subscription_id;
        }
        subscription.touch(current_timestamp());
        self.store.save_subscription(&subscription).await?;

        Ok(subscription)
    }

    /// Find the subscription holding a gateway payment intent reference.
    ///
    /// Used by refund reconciliation tooling.
    pub async fn find_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<StoredSubscription>> {
        self.store.find_by_payment_intent(payment_intent_id).await
    }
}

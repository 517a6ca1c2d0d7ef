//! Cancellation and the refund decision.
//!
//! A cancellation takes effect immediately: the record moves to CANCELLED
//! in the same write that stamps the reason and the actor. The refund is a
//! function of timing. Inside the cooling-off window the full plan price
//! goes back automatically; outside it, money moves only on request and
//! covers unused days. A failed refund never rolls back the cancellation;
//! it is recorded on the row for reconciliation.

use uuid::Uuid;

use serde::{Deserialize, Serialize};

use crate::config::BillingConfig;
use crate::error::Result;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::error::BillingError;
use super::gateway::{GatewayRefund, PaymentGateway};
use super::storage::{
    CancelledBy, RefundState, StoredSubscription, SubscriptionStatus, SubscriptionStore,
};

/// Bounds on the user-supplied cancellation reason, in characters.
const MIN_REASON_CHARS: usize = 10;
const MAX_REASON_CHARS: usize = 500;

const SECS_PER_DAY: u64 = 86_400;

/// Get current Unix timestamp in seconds.
fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Parameters of a cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelSubscriptionRequest {
    /// Why the subscriber is leaving. 10-500 characters.
    pub reason: String,
    /// Ask for a prorated refund of unused time. Inside the cooling-off
    /// window the full refund goes out regardless of this flag.
    pub request_refund: bool,
    /// Who triggered the cancellation.
    pub cancelled_by: CancelledBy,
}

impl CancelSubscriptionRequest {
    /// A user-initiated cancellation with no refund request.
    #[must_use]
    pub fn by_user(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            request_refund: false,
            cancelled_by: CancelledBy::User,
        }
    }

    /// Ask for a refund of unused time.
    #[must_use]
    pub fn with_refund(mut self) -> Self {
        self.request_refund = true;
        self
    }
}

/// Which refund rule applied to a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundKind {
    /// Full plan price back, inside the cooling-off window.
    Full,
    /// Unused days back, on request outside the window.
    Prorated,
    /// No money moved.
    None,
}

impl RefundKind {
    /// Convert to the canonical stored string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Prorated => "prorated",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for RefundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a completed cancellation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancellationOutcome {
    /// The cancelled subscription.
    pub subscription_id: Uuid,
    /// Final status, always CANCELLED.
    pub status: SubscriptionStatus,
    /// The reason that was recorded.
    pub reason: String,
    /// When the cancellation took effect.
    pub cancelled_at: u64,
    /// End of service, same instant as `cancelled_at`.
    pub end_date: Option<u64>,
    /// Whether the cooling-off window still applied.
    pub within_cooling_off: bool,
    /// Whether a refund was owed and attempted.
    pub refund_requested: bool,
    /// Which refund rule applied.
    pub refund_kind: RefundKind,
    /// Amount sent to the gateway, if any.
    pub refund_amount_cents: Option<i64>,
    /// Refund progress as recorded on the row.
    pub refund_status: RefundState,
    /// Gateway refund reference, if the request was acknowledged.
    pub refund_id: Option<String>,
}

/// Cancellation and refund engine.
///
/// Generic over the store, gateway, and audit sinks so tests can script
/// every collaborator.
pub struct CancellationManager<
    S: SubscriptionStore,
    G: PaymentGateway,
    A: BillingAuditLogger = NoOpAuditLogger,
> {
    store: S,
    gateway: G,
    audit: A,
    config: BillingConfig,
}

impl<S: SubscriptionStore, G: PaymentGateway> CancellationManager<S, G> {
    /// Create a cancellation engine without audit logging.
    #[must_use]
    pub fn new(store: S, gateway: G, config: BillingConfig) -> Self {
        Self::with_audit(store, gateway, NoOpAuditLogger, config)
    }
}

impl<S: SubscriptionStore, G: PaymentGateway, A: BillingAuditLogger> CancellationManager<S, G, A> {
    /// Create a cancellation engine that reports money movement to an
    /// audit sink.
    #[must_use]
    pub fn with_audit(store: S, gateway: G, audit: A, config: BillingConfig) -> Self {
        Self {
            store,
            gateway,
            audit,
            config,
        }
    }

    /// Cancel a subscription and settle the refund question.
    ///
    /// Only ACTIVE subscriptions can be cancelled; a repeat cancellation
    /// comes back as a conflict carrying the prior timestamp. The
    /// cancellation write goes through `compare_and_save`, so a concurrent
    /// writer surfaces as [`BillingError::ConcurrentModification`] and the
    /// caller retries against fresh state.
    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        request: CancelSubscriptionRequest,
    ) -> Result<CancellationOutcome> {
        // Reason bounds are checked before the store is touched, so a
        // malformed request cannot probe which ids exist.
        let reason_chars = request.reason.chars().count();
        if !(MIN_REASON_CHARS..=MAX_REASON_CHARS).contains(&reason_chars) {
            return Err(BillingError::InvalidCancellationReason {
                length: reason_chars,
            }
            .into());
        }

        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound { subscription_id })?;

        match subscription.status {
            SubscriptionStatus::Active => {}
            SubscriptionStatus::Cancelled => {
                return Err(BillingError::AlreadyCancelled {
                    subscription_id,
                    cancelled_at: subscription.cancelled_at.unwrap_or_default(),
                }
                .into());
            }
            status => {
                return Err(BillingError::NotCancellable {
                    subscription_id,
                    status,
                }
                .into());
            }
        }

        let now = current_timestamp();
        let inside_window = within_cooling_off(
            subscription.start_date,
            now,
            self.config.cooling_off_secs(),
        );

        let (refund_kind, refund_amount_cents) = if inside_window {
            (RefundKind::Full, subscription.amount_cents)
        } else if request.request_refund {
            (
                RefundKind::Prorated,
                prorated_refund_cents(&subscription, now, self.config.billing_period_days),
            )
        } else {
            (RefundKind::None, 0)
        };
        // A zero-amount refund (free tier, nothing unused) moves no money.
        let refund_owed = refund_amount_cents > 0;
        let refund_kind = if refund_owed {
            refund_kind
        } else {
            RefundKind::None
        };

        let original_version = subscription.version;
        let mut updated = subscription;
        updated.status = SubscriptionStatus::Cancelled;
        updated.end_date = Some(now);
        updated.cancellation_reason = Some(request.reason.clone());
        updated.cancelled_at = Some(now);
        updated.cancelled_by = Some(request.cancelled_by);
        updated.touch(now);

        if !self
            .store
            .compare_and_save(&updated, original_version)
            .await?
        {
            return Err(BillingError::ConcurrentModification { subscription_id }.into());
        }

        tracing::info!(
            target: "rebill::cancellation",
            subscription_id = %subscription_id,
            cancelled_by = %request.cancelled_by,
            within_cooling_off = inside_window,
            refund_kind = %refund_kind,
            "Subscription cancelled"
        );
        self.audit
            .log(BillingAuditEvent::SubscriptionCancelled {
                subscription_id,
                user_id: updated.user_id,
                cancelled_by: request.cancelled_by.as_str().to_string(),
            })
            .await;

        let updated = if refund_owed {
            self.execute_refund(updated, refund_amount_cents, refund_kind, now)
                .await?
        } else {
            updated
        };

        Ok(CancellationOutcome {
            subscription_id,
            status: updated.status,
            reason: request.reason,
            cancelled_at: now,
            end_date: updated.end_date,
            within_cooling_off: inside_window,
            refund_requested: refund_owed,
            refund_kind,
            refund_amount_cents: updated.refund_amount_cents,
            refund_status: updated.refund_status,
            refund_id: updated.refund_id,
        })
    }

    /// Request the refund from the gateway and record the outcome.
    ///
    /// Failures land as `RefundState::Failed` on the row; the cancellation
    /// itself stands either way.
    async fn execute_refund(
        &self,
        subscription: StoredSubscription,
        amount_cents: i64,
        kind: RefundKind,
        now: u64,
    ) -> Result<StoredSubscription> {
        let subscription_id = subscription.id;
        let expected_version = subscription.version;
        let mut updated = subscription;
        updated.refund_amount_cents = Some(amount_cents);
        updated.refund_reason = Some(refund_reason(kind).to_string());
        updated.refund_processed_at = Some(now);

        match updated.payment_intent_id.clone() {
            Some(payment_intent_id) => {
                match self.attempt_refund(&payment_intent_id, amount_cents).await {
                    Ok(refund) => {
                        updated.refund_id = Some(refund.refund_id.clone());
                        updated.refund_status = refund.status;
                        tracing::info!(
                            target: "rebill::cancellation",
                            subscription_id = %subscription_id,
                            refund_id = %refund.refund_id,
                            amount_cents,
                            kind = %kind,
                            "Refund requested"
                        );
                        self.audit
                            .log(BillingAuditEvent::RefundRequested {
                                subscription_id,
                                refund_id: refund.refund_id,
                                amount_cents,
                            })
                            .await;
                    }
                    Err(err) => {
                        updated.refund_status = RefundState::Failed;
                        tracing::error!(
                            target: "rebill::cancellation",
                            subscription_id = %subscription_id,
                            amount_cents,
                            error = %err,
                            "Refund request failed, cancellation stands"
                        );
                        self.audit
                            .log(BillingAuditEvent::RefundFailed {
                                subscription_id,
                                amount_cents,
                                message: err.to_string(),
                            })
                            .await;
                    }
                }
            }
            None => {
                updated.refund_status = RefundState::Failed;
                tracing::warn!(
                    target: "rebill::cancellation",
                    subscription_id = %subscription_id,
                    amount_cents,
                    "Refund owed but no payment intent on file, flagged for reconciliation"
                );
                self.audit
                    .log(BillingAuditEvent::RefundFailed {
                        subscription_id,
                        amount_cents,
                        message: "no payment intent on file".to_string(),
                    })
                    .await;
            }
        }

        updated.touch(now);
        if self
            .store
            .compare_and_save(&updated, expected_version)
            .await?
        {
            return Ok(updated);
        }

        // Another writer took the row between the cancellation write and
        // this one. The gateway call already went out, so the refund fields
        // must land: re-read, stamp them onto the winner's copy, and retry
        // once. Only the refund fields are carried over; whatever else the
        // winner changed stays.
        if let Some(mut current) = self.store.get_subscription(subscription_id).await? {
            let current_version = current.version;
            current.refund_id = updated.refund_id.clone();
            current.refund_status = updated.refund_status;
            current.refund_amount_cents = updated.refund_amount_cents;
            current.refund_reason = updated.refund_reason.clone();
            current.refund_processed_at = updated.refund_processed_at;
            current.touch(now);

            if self
                .store
                .compare_and_save(&current, current_version)
                .await?
            {
                tracing::warn!(
                    target: "rebill::cancellation",
                    subscription_id = %subscription_id,
                    "Refund state recorded on retry after concurrent write"
                );
                return Ok(current);
            }
        }

        // Two lost races in a row (or the row vanished); the audit log is
        // the remaining record of the refund.
        tracing::error!(
            target: "rebill::cancellation",
            subscription_id = %subscription_id,
            "Concurrent write while recording refund state"
        );

        Ok(updated)
    }

    /// Call the gateway under the configured timeout.
    async fn attempt_refund(
        &self,
        payment_intent_id: &str,
        amount_cents: i64,
    ) -> Result<GatewayRefund> {
        match tokio::time::timeout(
            self.config.gateway_timeout(),
            self.gateway.refund(payment_intent_id, amount_cents),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BillingError::GatewayUnavailable {
                operation: "refund".to_string(),
                message: format!(
                    "refund timed out after {}s",
                    self.config.gateway_timeout_secs
                ),
            }
            .into()),
        }
    }
}

/// Inclusive check of the statutory withdrawal window.
fn within_cooling_off(start_date: u64, now: u64, window_secs: u64) -> bool {
    now.saturating_sub(start_date) <= window_secs
}

/// Prorated refund for the unused remainder of the current period.
///
/// Whole unused days from `now` to `next_billing_date`, valued at the
/// per-period price. Capped at the period price, which keeps the far-future
/// billing date on lifetime plans from inflating the claim.
fn prorated_refund_cents(subscription: &StoredSubscription, now: u64, period_days: u64) -> i64 {
    if period_days == 0 || subscription.next_billing_date <= now {
        return 0;
    }
    let unused_days = (subscription.next_billing_date - now) / SECS_PER_DAY;
    let prorated = subscription.amount_cents * unused_days as i64 / period_days as i64;
    prorated.min(subscription.amount_cents)
}

/// Reason string persisted with the refund.
fn refund_reason(kind: RefundKind) -> &'static str {
    match kind {
        RefundKind::Full => "cooling_off_withdrawal",
        RefundKind::Prorated => "prorated_unused_time",
        RefundKind::None => "none",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::billing::audit::test::TestAuditLogger;
    use crate::billing::gateway::test::MockPaymentGateway;
    use crate::billing::plans::{PlanTier, LIFETIME_HORIZON_SECS};
    use crate::billing::storage::test::InMemorySubscriptionStore;
    use crate::error::RebillError;

    const REASON: &str = "No longer needed, switching tools.";

    fn manager(
        store: InMemorySubscriptionStore,
        gateway: MockPaymentGateway,
    ) -> CancellationManager<InMemorySubscriptionStore, MockPaymentGateway> {
        CancellationManager::new(store, gateway, BillingConfig::default())
    }

    /// ACTIVE Pessoal row that started `started_secs_ago` seconds back,
    /// with a payment intent on file and a full period ahead of it.
    fn active_subscription(started_secs_ago: u64) -> StoredSubscription {
        let now = current_timestamp();
        let start = now.saturating_sub(started_secs_ago);
        // The hour of slack keeps whole-day proration math stable while
        // the test runs.
        let mut sub = StoredSubscription::new(
            Uuid::new_v4(),
            PlanTier::Pessoal,
            start,
            now + 30 * SECS_PER_DAY + 3_600,
        );
        sub.payment_intent_id = Some(format!("pi_{}", sub.id));
        sub
    }

    #[test]
    fn test_cooling_off_boundary_is_inclusive() {
        let window = 7 * SECS_PER_DAY;
        assert!(within_cooling_off(1_000, 1_000 + window, window));
        assert!(!within_cooling_off(1_000, 1_000 + window + 1, window));
        // Clock skew putting now before start still counts as within.
        assert!(within_cooling_off(1_000, 500, window));
    }

    #[test]
    fn test_prorated_math_rounds_down_whole_days() {
        let now = 1_000_000;
        let mut sub = StoredSubscription::new(Uuid::new_v4(), PlanTier::Pessoal, 0, 0);
        sub.amount_cents = 3_000;

        sub.next_billing_date = now + 10 * SECS_PER_DAY;
        assert_eq!(prorated_refund_cents(&sub, now, 30), 1_000);

        // Due now or overdue leaves nothing unused.
        sub.next_billing_date = now;
        assert_eq!(prorated_refund_cents(&sub, now, 30), 0);

        // A partial day does not count.
        sub.next_billing_date = now + SECS_PER_DAY - 1;
        assert_eq!(prorated_refund_cents(&sub, now, 30), 0);
    }

    #[test]
    fn test_prorated_refund_capped_at_period_price() {
        let now = 1_000_000;
        let sub = StoredSubscription::new(
            Uuid::new_v4(),
            PlanTier::ProfissionalVitalicio,
            0,
            now + LIFETIME_HORIZON_SECS,
        );
        assert_eq!(prorated_refund_cents(&sub, now, 30), 49_990);
    }

    #[tokio::test]
    async fn test_short_reason_rejected_before_lookup() {
        let engine = manager(InMemorySubscriptionStore::new(), MockPaymentGateway::new());

        // Nonexistent id: a bad reason must fail before the lookup would.
        let err = engine
            .cancel_subscription(Uuid::new_v4(), CancelSubscriptionRequest::by_user("Ruim."))
            .await
            .unwrap_err();

        assert!(matches!(err, RebillError::BadRequest(_)));
        assert!(err.to_string().contains("10 and 500"));
    }

    #[tokio::test]
    async fn test_reason_bounds_count_chars_not_bytes() {
        let store = InMemorySubscriptionStore::new();
        let sub = active_subscription(60 * SECS_PER_DAY);
        store.seed(vec![sub.clone()]);
        let engine = manager(store, MockPaymentGateway::new());

        // Nine characters but eighteen bytes: still too short.
        let err = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user("ããããããããã"))
            .await
            .unwrap_err();
        assert!(matches!(err, RebillError::BadRequest(_)));

        // Ten characters exactly is accepted.
        let outcome = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user("maçã verde"))
            .await
            .unwrap();
        assert_eq!(outcome.status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_reason_upper_bound_inclusive() {
        let store = InMemorySubscriptionStore::new();
        let sub = active_subscription(60 * SECS_PER_DAY);
        store.seed(vec![sub.clone()]);
        let engine = manager(store, MockPaymentGateway::new());

        let err = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user("x".repeat(501)))
            .await
            .unwrap_err();
        assert!(matches!(err, RebillError::BadRequest(_)));

        let outcome = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user("x".repeat(500)))
            .await
            .unwrap();
        assert_eq!(outcome.status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_full_refund_within_cooling_off() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockPaymentGateway::new();
        let sub = active_subscription(2 * SECS_PER_DAY);
        store.seed(vec![sub.clone()]);
        let engine = manager(store.clone(), gateway.clone());

        let outcome = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap();

        assert_eq!(outcome.status, SubscriptionStatus::Cancelled);
        assert!(outcome.within_cooling_off);
        assert!(outcome.refund_requested);
        assert_eq!(outcome.refund_kind, RefundKind::Full);
        assert_eq!(outcome.refund_amount_cents, Some(2_990));
        assert_eq!(outcome.refund_status, RefundState::Pending);
        assert_eq!(outcome.refund_id.as_deref(), Some("re_mock_0"));

        let calls = gateway.refund_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].amount_cents, 2_990);
        assert_eq!(
            Some(calls[0].payment_intent_ref.clone()),
            sub.payment_intent_id
        );

        let stored = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert_eq!(stored.cancellation_reason.as_deref(), Some(REASON));
        assert_eq!(stored.cancelled_by, Some(CancelledBy::User));
        assert_eq!(stored.refund_status, RefundState::Pending);
        assert_eq!(stored.refund_reason.as_deref(), Some("cooling_off_withdrawal"));
        assert_eq!(stored.end_date, stored.cancelled_at);
    }

    #[tokio::test]
    async fn test_full_refund_ignores_request_flag() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockPaymentGateway::new();
        let sub = active_subscription(SECS_PER_DAY);
        store.seed(vec![sub.clone()]);
        let engine = manager(store, gateway.clone());

        // request_refund is false; the window makes the refund automatic.
        let outcome = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap();

        assert_eq!(outcome.refund_kind, RefundKind::Full);
        assert_eq!(gateway.refund_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_prorated_refund_outside_window() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockPaymentGateway::new();
        // Started 45 days ago, 15 unused days ahead of a 30-day period.
        let mut sub = active_subscription(45 * SECS_PER_DAY);
        sub.next_billing_date = current_timestamp() + 15 * SECS_PER_DAY + 3_600;
        store.seed(vec![sub.clone()]);
        let engine = manager(store.clone(), gateway.clone());

        let outcome = engine
            .cancel_subscription(
                sub.id,
                CancelSubscriptionRequest::by_user(REASON).with_refund(),
            )
            .await
            .unwrap();

        assert!(!outcome.within_cooling_off);
        assert_eq!(outcome.refund_kind, RefundKind::Prorated);
        assert_eq!(outcome.refund_amount_cents, Some(1_495));
        assert_eq!(outcome.refund_status, RefundState::Pending);

        let stored = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.refund_reason.as_deref(), Some("prorated_unused_time"));
        assert_eq!(gateway.refund_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_no_refund_without_request_outside_window() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockPaymentGateway::new();
        let sub = active_subscription(60 * SECS_PER_DAY);
        store.seed(vec![sub.clone()]);
        let engine = manager(store.clone(), gateway.clone());

        let outcome = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap();

        assert!(!outcome.within_cooling_off);
        assert!(!outcome.refund_requested);
        assert_eq!(outcome.refund_kind, RefundKind::None);
        assert_eq!(outcome.refund_amount_cents, None);
        assert_eq!(outcome.refund_status, RefundState::None);
        assert_eq!(outcome.refund_id, None);
        assert!(gateway.refund_calls().is_empty());

        let stored = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert_eq!(stored.refund_status, RefundState::None);
        assert_eq!(stored.refund_amount_cents, None);
    }

    #[tokio::test]
    async fn test_free_tier_moves_no_money() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockPaymentGateway::new();
        let now = current_timestamp();
        // Gratis row inside the window; a full refund of zero is no refund.
        let sub = StoredSubscription::new(
            Uuid::new_v4(),
            PlanTier::Gratis,
            now.saturating_sub(3_600),
            now + 30 * SECS_PER_DAY,
        );
        store.seed(vec![sub.clone()]);
        let engine = manager(store, gateway.clone());

        let outcome = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap();

        assert!(outcome.within_cooling_off);
        assert!(!outcome.refund_requested);
        assert_eq!(outcome.refund_kind, RefundKind::None);
        assert!(gateway.refund_calls().is_empty());
    }

    #[tokio::test]
    async fn test_refund_failure_leaves_cancellation_standing() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockPaymentGateway::new();
        gateway.fail_refunds();
        let audit = TestAuditLogger::new();
        let sub = active_subscription(2 * SECS_PER_DAY);
        store.seed(vec![sub.clone()]);
        let engine = CancellationManager::with_audit(
            store.clone(),
            gateway.clone(),
            audit.clone(),
            BillingConfig::default(),
        );

        let outcome = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap();

        assert_eq!(outcome.status, SubscriptionStatus::Cancelled);
        assert_eq!(outcome.refund_kind, RefundKind::Full);
        assert_eq!(outcome.refund_status, RefundState::Failed);
        assert_eq!(outcome.refund_id, None);

        let stored = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert_eq!(stored.refund_status, RefundState::Failed);
        assert_eq!(stored.refund_amount_cents, Some(2_990));

        let events = audit.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            BillingAuditEvent::SubscriptionCancelled { .. }
        ));
        assert!(matches!(
            events[1],
            BillingAuditEvent::RefundFailed {
                amount_cents: 2_990,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_refund_without_payment_intent_flagged_for_reconciliation() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockPaymentGateway::new();
        let audit = TestAuditLogger::new();
        let mut sub = active_subscription(2 * SECS_PER_DAY);
        sub.payment_intent_id = None;
        store.seed(vec![sub.clone()]);
        let engine = CancellationManager::with_audit(
            store.clone(),
            gateway.clone(),
            audit.clone(),
            BillingConfig::default(),
        );

        let outcome = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap();

        assert_eq!(outcome.status, SubscriptionStatus::Cancelled);
        assert_eq!(outcome.refund_status, RefundState::Failed);
        assert!(gateway.refund_calls().is_empty());

        let stored = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.refund_status, RefundState::Failed);
        assert_eq!(stored.refund_amount_cents, Some(2_990));

        let events = audit.events();
        assert!(matches!(
            &events[1],
            BillingAuditEvent::RefundFailed { message, .. }
                if message == "no payment intent on file"
        ));
    }

    #[tokio::test]
    async fn test_repeat_cancellation_is_conflict() {
        let store = InMemorySubscriptionStore::new();
        let sub = active_subscription(60 * SECS_PER_DAY);
        store.seed(vec![sub.clone()]);
        let engine = manager(store, MockPaymentGateway::new());

        engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap();

        let err = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap_err();

        assert!(matches!(err, RebillError::Conflict(_)));
        assert!(err.to_string().contains("already cancelled"));
    }

    #[tokio::test]
    async fn test_delinquent_row_not_cancellable() {
        let store = InMemorySubscriptionStore::new();
        let mut sub = active_subscription(60 * SECS_PER_DAY);
        sub.status = SubscriptionStatus::Delinquent;
        store.seed(vec![sub.clone()]);
        let engine = manager(store, MockPaymentGateway::new());

        let err = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap_err();

        assert!(matches!(err, RebillError::Conflict(_)));
        assert!(err.to_string().contains("cannot be cancelled"));
    }

    #[tokio::test]
    async fn test_unknown_subscription_not_found() {
        let engine = manager(InMemorySubscriptionStore::new(), MockPaymentGateway::new());

        let err = engine
            .cancel_subscription(Uuid::new_v4(), CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap_err();

        assert!(matches!(err, RebillError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_admin_actor_recorded() {
        let store = InMemorySubscriptionStore::new();
        let sub = active_subscription(60 * SECS_PER_DAY);
        store.seed(vec![sub.clone()]);
        let engine = manager(store.clone(), MockPaymentGateway::new());

        let request = CancelSubscriptionRequest {
            reason: REASON.to_string(),
            request_refund: false,
            cancelled_by: CancelledBy::Admin,
        };
        engine.cancel_subscription(sub.id, request).await.unwrap();

        let stored = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.cancelled_by, Some(CancelledBy::Admin));
    }

    #[tokio::test]
    async fn test_lifetime_prorated_refund_capped_end_to_end() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockPaymentGateway::new();
        let now = current_timestamp();
        let start = now.saturating_sub(30 * SECS_PER_DAY);
        let mut sub = StoredSubscription::new(
            Uuid::new_v4(),
            PlanTier::ProfissionalVitalicio,
            start,
            start + LIFETIME_HORIZON_SECS,
        );
        sub.payment_intent_id = Some("pi_lifetime".to_string());
        store.seed(vec![sub.clone()]);
        let engine = manager(store, gateway.clone());

        let outcome = engine
            .cancel_subscription(
                sub.id,
                CancelSubscriptionRequest::by_user(REASON).with_refund(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.refund_kind, RefundKind::Prorated);
        assert_eq!(outcome.refund_amount_cents, Some(49_990));
        assert_eq!(gateway.refund_calls()[0].amount_cents, 49_990);
    }

    #[tokio::test]
    async fn test_audit_trail_for_full_refund() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockPaymentGateway::new();
        let audit = TestAuditLogger::new();
        let sub = active_subscription(2 * SECS_PER_DAY);
        store.seed(vec![sub.clone()]);
        let engine = CancellationManager::with_audit(
            store,
            gateway,
            audit.clone(),
            BillingConfig::default(),
        );

        engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap();

        let events = audit.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            BillingAuditEvent::SubscriptionCancelled { cancelled_by, .. }
                if cancelled_by == "USER"
        ));
        assert!(matches!(
            &events[1],
            BillingAuditEvent::RefundRequested {
                amount_cents: 2_990,
                ..
            }
        ));
    }

    /// Store wrapper whose compare_and_save always reports a conflict.
    #[derive(Clone)]
    struct ContestedStore {
        inner: InMemorySubscriptionStore,
    }

    #[async_trait]
    impl SubscriptionStore for ContestedStore {
        async fn save_subscription(&self, subscription: &StoredSubscription) -> Result<()> {
            self.inner.save_subscription(subscription).await
        }

        async fn get_subscription(&self, id: Uuid) -> Result<Option<StoredSubscription>> {
            self.inner.get_subscription(id).await
        }

        async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<StoredSubscription>> {
            self.inner.list_by_user(user_id).await
        }

        async fn list_active_by_user(&self, user_id: Uuid) -> Result<Vec<StoredSubscription>> {
            self.inner.list_active_by_user(user_id).await
        }

        async fn list_due(&self, now: u64) -> Result<Vec<StoredSubscription>> {
            self.inner.list_due(now).await
        }

        async fn compare_and_save(
            &self,
            _subscription: &StoredSubscription,
            _expected_version: u64,
        ) -> Result<bool> {
            Ok(false)
        }

        async fn find_by_payment_intent(
            &self,
            payment_intent_id: &str,
        ) -> Result<Option<StoredSubscription>> {
            self.inner.find_by_payment_intent(payment_intent_id).await
        }

        async fn list_by_refund_state(
            &self,
            state: RefundState,
        ) -> Result<Vec<StoredSubscription>> {
            self.inner.list_by_refund_state(state).await
        }

        async fn list_cancelled_between(
            &self,
            from: u64,
            to: u64,
        ) -> Result<Vec<StoredSubscription>> {
            self.inner.list_cancelled_between(from, to).await
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            self.inner.is_event_processed(event_id).await
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            self.inner.mark_event_processed(event_id).await
        }
    }

    #[tokio::test]
    async fn test_write_conflict_surfaces_as_retryable() {
        let inner = InMemorySubscriptionStore::new();
        let sub = active_subscription(60 * SECS_PER_DAY);
        inner.seed(vec![sub.clone()]);
        let store = ContestedStore { inner: inner.clone() };
        let engine =
            CancellationManager::new(store, MockPaymentGateway::new(), BillingConfig::default());

        let err = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap_err();

        assert!(matches!(err, RebillError::Conflict(_)));
        assert!(err.to_string().contains("retry"));

        // The loser wrote nothing.
        let untouched = inner.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, SubscriptionStatus::Active);
        assert_eq!(untouched.version, sub.version);
    }

    /// Store wrapper that reports a conflict on one chosen
    /// `compare_and_save` call (1-indexed) and delegates otherwise.
    #[derive(Clone)]
    struct RefundRaceStore {
        inner: InMemorySubscriptionStore,
        cas_calls: Arc<AtomicU32>,
        fail_on_call: u32,
    }

    #[async_trait]
    impl SubscriptionStore for RefundRaceStore {
        async fn save_subscription(&self, subscription: &StoredSubscription) -> Result<()> {
            self.inner.save_subscription(subscription).await
        }

        async fn get_subscription(&self, id: Uuid) -> Result<Option<StoredSubscription>> {
            self.inner.get_subscription(id).await
        }

        async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<StoredSubscription>> {
            self.inner.list_by_user(user_id).await
        }

        async fn list_active_by_user(&self, user_id: Uuid) -> Result<Vec<StoredSubscription>> {
            self.inner.list_active_by_user(user_id).await
        }

        async fn list_due(&self, now: u64) -> Result<Vec<StoredSubscription>> {
            self.inner.list_due(now).await
        }

        async fn compare_and_save(
            &self,
            subscription: &StoredSubscription,
            expected_version: u64,
        ) -> Result<bool> {
            let call = self.cas_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on_call {
                return Ok(false);
            }
            self.inner.compare_and_save(subscription, expected_version).await
        }

        async fn find_by_payment_intent(
            &self,
            payment_intent_id: &str,
        ) -> Result<Option<StoredSubscription>> {
            self.inner.find_by_payment_intent(payment_intent_id).await
        }

        async fn list_by_refund_state(
            &self,
            state: RefundState,
        ) -> Result<Vec<StoredSubscription>> {
            self.inner.list_by_refund_state(state).await
        }

        async fn list_cancelled_between(
            &self,
            from: u64,
            to: u64,
        ) -> Result<Vec<StoredSubscription>> {
            self.inner.list_cancelled_between(from, to).await
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            self.inner.is_event_processed(event_id).await
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            self.inner.mark_event_processed(event_id).await
        }
    }

    #[tokio::test]
    async fn test_refund_fields_survive_lost_write_race() {
        let inner = InMemorySubscriptionStore::new();
        let sub = active_subscription(2 * SECS_PER_DAY);
        inner.seed(vec![sub.clone()]);

        // The cancellation write (call 1) lands; the refund-fields write
        // (call 2) loses its race and must land on the retry (call 3).
        let store = RefundRaceStore {
            inner: inner.clone(),
            cas_calls: Arc::new(AtomicU32::new(0)),
            fail_on_call: 2,
        };
        let engine =
            CancellationManager::new(store, MockPaymentGateway::new(), BillingConfig::default());

        let outcome = engine
            .cancel_subscription(sub.id, CancelSubscriptionRequest::by_user(REASON))
            .await
            .unwrap();

        assert_eq!(outcome.refund_kind, RefundKind::Full);
        assert_eq!(outcome.refund_id.as_deref(), Some("re_mock_0"));
        assert_eq!(outcome.refund_status, RefundState::Pending);

        // The gateway executed the refund, so the row must say so even
        // though the first recording attempt lost.
        let stored = inner.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert_eq!(stored.refund_id.as_deref(), Some("re_mock_0"));
        assert_eq!(stored.refund_status, RefundState::Pending);
        assert_eq!(stored.refund_amount_cents, Some(2_990));
        assert_eq!(stored.version, sub.version + 2, "retry wrote over the cancellation write");
    }
}

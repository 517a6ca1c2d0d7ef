//! Audit logging for billing operations.
//!
//! Provides a trait-based audit logging system for tracking billing events.
//! This is useful for compliance, debugging, and reconciling money movement
//! against the payment provider.

use std::fmt;

use uuid::Uuid;

/// Audit event types for billing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingAuditEvent {
    /// Subscription created.
    SubscriptionCreated {
        subscription_id: Uuid,
        user_id: Uuid,
        plan: String,
    },
    /// Scheduled charge captured.
    ChargeSucceeded {
        subscription_id: Uuid,
        amount_cents: i64,
        next_billing_date: u64,
    },
    /// Scheduled charge declined or errored.
    ChargeFailed {
        subscription_id: Uuid,
        amount_cents: i64,
        attempt_count: u32,
    },
    /// Retry budget exhausted; subscription moved to DELINQUENT.
    SubscriptionDemoted {
        subscription_id: Uuid,
        attempt_count: u32,
    },
    /// Subscription cancelled.
    SubscriptionCancelled {
        subscription_id: Uuid,
        user_id: Uuid,
        cancelled_by: String,
    },
    /// Refund requested from the gateway.
    RefundRequested {
        subscription_id: Uuid,
        refund_id: String,
        amount_cents: i64,
    },
    /// Refund request failed; the cancellation stands.
    RefundFailed {
        subscription_id: Uuid,
        amount_cents: i64,
        message: String,
    },
    /// Checkout webhook received.
    WebhookReceived { event_id: String, event_type: String },
    /// Checkout webhook processed.
    WebhookProcessed {
        event_id: String,
        event_type: String,
        outcome: String,
    },
}

impl fmt::Display for BillingAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubscriptionCreated { subscription_id, user_id, plan } => {
                write!(f, "Subscription created: sub={}, user={}, plan={}", subscription_id, user_id, plan)
            }
            Self::ChargeSucceeded { subscription_id, amount_cents, next_billing_date } => {
                write!(f, "Charge succeeded: sub={}, amount={}, next_billing={}", subscription_id, amount_cents, next_billing_date)
            }
            Self::ChargeFailed { subscription_id, amount_cents, attempt_count } => {
                write!(f, "Charge failed: sub={}, amount={}, attempts={}", subscription_id, amount_cents, attempt_count)
            }
            Self::SubscriptionDemoted { subscription_id, attempt_count } => {
                write!(f, "Subscription demoted: sub={}, attempts={}", subscription_id, attempt_count)
            }
            Self::SubscriptionCancelled { subscription_id, user_id, cancelled_by } => {
                write!(f, "Subscription cancelled: sub={}, user={}, by={}", subscription_id, user_id, cancelled_by)
            }
            Self::RefundRequested { subscription_id, refund_id, amount_cents } => {
                write!(f, "Refund requested: sub={}, refund={}, amount={}", subscription_id, refund_id, amount_cents)
            }
            Self::RefundFailed { subscription_id, amount_cents, message } => {
                write!(f, "Refund failed: sub={}, amount={}, message={}", subscription_id, amount_cents, message)
            }
            Self::WebhookReceived { event_id, event_type } => {
                write!(f, "Webhook received: event={}, type={}", event_id, event_type)
            }
            Self::WebhookProcessed { event_id, event_type, outcome } => {
                write!(f, "Webhook processed: event={}, type={}, outcome={}", event_id, event_type, outcome)
            }
        }
    }
}

/// Trait for audit logging backends.
///
/// Implement this trait to integrate with your logging system (e.g., database,
/// external service, file-based logging).
#[allow(async_fn_in_trait)]
pub trait BillingAuditLogger: Send + Sync {
    /// Log a billing audit event.
    ///
    /// Implementations should handle failures gracefully (e.g., log to stderr)
    /// to avoid disrupting billing operations.
    async fn log(&self, event: BillingAuditEvent);
}

/// No-op audit logger that does nothing.
///
/// Use this when audit logging is not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

impl BillingAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: BillingAuditEvent) {
        // No-op
    }
}

/// Tracing-based audit logger.
///
/// Logs audit events using the `tracing` crate at INFO level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

impl BillingAuditLogger for TracingAuditLogger {
    async fn log(&self, event: BillingAuditEvent) {
        tracing::info!(
            target: "rebill::audit",
            event_type = %event_kind(&event),
            "{}", event
        );
    }
}

/// Get the event kind as a string for structured logging.
fn event_kind(event: &BillingAuditEvent) -> &'static str {
    match event {
        BillingAuditEvent::SubscriptionCreated { .. } => "subscription_created",
        BillingAuditEvent::ChargeSucceeded { .. } => "charge_succeeded",
        BillingAuditEvent::ChargeFailed { .. } => "charge_failed",
        BillingAuditEvent::SubscriptionDemoted { .. } => "subscription_demoted",
        BillingAuditEvent::SubscriptionCancelled { .. } => "subscription_cancelled",
        BillingAuditEvent::RefundRequested { .. } => "refund_requested",
        BillingAuditEvent::RefundFailed { .. } => "refund_failed",
        BillingAuditEvent::WebhookReceived { .. } => "webhook_received",
        BillingAuditEvent::WebhookProcessed { .. } => "webhook_processed",
    }
}

/// Capturing audit logger for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Audit logger that captures events for assertions.
    #[derive(Default, Clone)]
    pub struct TestAuditLogger {
        events: Arc<Mutex<Vec<BillingAuditEvent>>>,
    }

    impl TestAuditLogger {
        /// Create a new capturing logger.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All events logged so far.
        pub fn events(&self) -> Vec<BillingAuditEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl BillingAuditLogger for TestAuditLogger {
        async fn log(&self, event: BillingAuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}

//! Payment gateway client seam.
//!
//! The billing engine talks to the payment provider through
//! [`PaymentGateway`]. Implementations wrap the provider API; a scripted
//! mock is provided for tests.

use crate::error::Result;

use super::storage::RefundState;

/// Business outcome of a charge attempt.
///
/// A declined card is a normal outcome and drives the retry state machine;
/// it is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// The gateway captured the payment.
    Approved,
    /// The gateway refused the payment.
    Declined,
}

impl ChargeOutcome {
    /// Check if the charge was captured.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// A refund acknowledged by the gateway.
///
/// Settlement is asynchronous on the provider side, so the returned status
/// is normally [`RefundState::Pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRefund {
    /// Provider-side refund reference.
    pub refund_id: String,
    /// Status reported by the gateway at request time.
    pub status: RefundState,
}

/// Trait for payment gateway operations.
///
/// `Err` from either method means the gateway could not be reached or
/// answered out of protocol; a refused payment comes back as
/// `Ok(ChargeOutcome::Declined)`.
#[allow(async_fn_in_trait)]
pub trait PaymentGateway: Send + Sync {
    /// Charge a customer the given amount in centavos.
    async fn charge(&self, customer_ref: &str, amount_cents: i64) -> Result<ChargeOutcome>;

    /// Refund a previously captured payment intent, in full or in part.
    async fn refund(&self, payment_intent_ref: &str, amount_cents: i64) -> Result<GatewayRefund>;
}

/// Mock payment gateway for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    /// Scripted outcome for one charge attempt.
    #[derive(Debug, Clone, Copy)]
    pub enum ScriptedCharge {
        /// Approve the charge.
        Approve,
        /// Decline the charge.
        Decline,
        /// Fail with a gateway error.
        Error,
        /// Never answer; pairs with `tokio::time::timeout` in callers.
        Hang,
    }

    /// A recorded charge attempt.
    #[derive(Debug, Clone)]
    pub struct ChargeCall {
        /// Customer reference passed to the gateway.
        pub customer_ref: String,
        /// Amount in centavos.
        pub amount_cents: i64,
    }

    /// A recorded refund request.
    #[derive(Debug, Clone)]
    pub struct RefundCall {
        /// Payment intent reference passed to the gateway.
        pub payment_intent_ref: String,
        /// Amount in centavos.
        pub amount_cents: i64,
    }

    /// Mock payment gateway with scripted outcomes and call recording.
    ///
    /// Approves every charge and acknowledges every refund unless told
    /// otherwise. Scripted outcomes are consumed in order, then behavior
    /// falls back to the configured default. Wraps state in Arc for cheap
    /// cloning.
    #[derive(Default, Clone)]
    pub struct MockPaymentGateway {
        inner: Arc<MockPaymentGatewayInner>,
    }

    #[derive(Default)]
    struct MockPaymentGatewayInner {
        charge_script: Mutex<VecDeque<ScriptedCharge>>,
        decline_by_default: AtomicBool,
        fail_charges: AtomicBool,
        fail_refunds: AtomicBool,
        charges: Mutex<Vec<ChargeCall>>,
        refunds: Mutex<Vec<RefundCall>>,
        refund_counter: AtomicU64,
    }

    impl MockPaymentGateway {
        /// Create a new mock gateway that approves everything.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Decline every charge not covered by a script entry.
        pub fn decline_charges(&self) {
            self.inner.decline_by_default.store(true, Ordering::SeqCst);
        }

        /// Error every charge not covered by a script entry.
        pub fn fail_charges(&self) {
            self.inner.fail_charges.store(true, Ordering::SeqCst);
        }

        /// Error every refund request.
        pub fn fail_refunds(&self) {
            self.inner.fail_refunds.store(true, Ordering::SeqCst);
        }

        /// Queue scripted outcomes, consumed one per charge attempt.
        pub fn script_charges(&self, outcomes: impl IntoIterator<Item = ScriptedCharge>) {
            self.inner
                .charge_script
                .lock()
                .unwrap()
                .extend(outcomes);
        }

        /// All charge attempts recorded so far.
        pub fn charge_calls(&self) -> Vec<ChargeCall> {
            self.inner.charges.lock().unwrap().clone()
        }

        /// All refund requests recorded so far.
        pub fn refund_calls(&self) -> Vec<RefundCall> {
            self.inner.refunds.lock().unwrap().clone()
        }
    }

    impl PaymentGateway for MockPaymentGateway {
        async fn charge(&self, customer_ref: &str, amount_cents: i64) -> Result<ChargeOutcome> {
            self.inner.charges.lock().unwrap().push(ChargeCall {
                customer_ref: customer_ref.to_string(),
                amount_cents,
            });

            let scripted = self.inner.charge_script.lock().unwrap().pop_front();
            match scripted {
                Some(ScriptedCharge::Approve) => Ok(ChargeOutcome::Approved),
                Some(ScriptedCharge::Decline) => Ok(ChargeOutcome::Declined),
                Some(ScriptedCharge::Error) => Err(BillingError::GatewayUnavailable {
                    operation: "charge".to_string(),
                    message: "scripted gateway failure".to_string(),
                }
                .into()),
                Some(ScriptedCharge::Hang) => {
                    std::future::pending::<()>().await;
                    unreachable!("pending future never resolves")
                }
                None if self.inner.fail_charges.load(Ordering::SeqCst) => {
                    Err(BillingError::GatewayUnavailable {
                        operation: "charge".to_string(),
                        message: "scripted gateway failure".to_string(),
                    }
                    .into())
                }
                None if self.inner.decline_by_default.load(Ordering::SeqCst) => {
                    Ok(ChargeOutcome::Declined)
                }
                None => Ok(ChargeOutcome::Approved),
            }
        }

        async fn refund(
            &self,
            payment_intent_ref: &str,
            amount_cents: i64,
        ) -> Result<GatewayRefund> {
            self.inner.refunds.lock().unwrap().push(RefundCall {
                payment_intent_ref: payment_intent_ref.to_string(),
                amount_cents,
            });

            if self.inner.fail_refunds.load(Ordering::SeqCst) {
                return Err(BillingError::GatewayUnavailable {
                    operation: "refund".to_string(),
                    message: "scripted gateway failure".to_string(),
                }
                .into());
            }

            let id = format!(
                "re_mock_{}",
                self.inner.refund_counter.fetch_add(1, Ordering::SeqCst)
            );
            Ok(GatewayRefund {
                refund_id: id,
                status: RefundState::Pending,
            })
        }
    }
}

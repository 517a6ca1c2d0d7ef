//! Billing-specific error types.
//!
//! Provides granular error types for billing operations, enabling better
//! error handling and more informative error messages for API consumers.

use std::fmt;
use uuid::Uuid;

use super::storage::SubscriptionStatus;

/// Billing-specific errors.
///
/// These errors provide more context than generic errors and can be
/// converted to `RebillError` for caller-facing responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Validation errors
    /// The plan string does not name a known tier.
    InvalidPlan { plan: String },
    /// The status string does not name a known subscription status.
    InvalidStatus { status: String },
    /// The cancellation reason is missing or outside the 10-500 character bounds.
    InvalidCancellationReason { length: usize },

    // Not-found errors
    /// No subscription exists with this id.
    SubscriptionNotFound { subscription_id: Uuid },
    /// No user exists with this id or email.
    UserNotFound { user_ref: String },

    // Conflict errors
    /// The subscription was already cancelled; carries the prior timestamp.
    AlreadyCancelled { subscription_id: Uuid, cancelled_at: u64 },
    /// The subscription is in a non-active state that cannot be cancelled.
    NotCancellable { subscription_id: Uuid, status: SubscriptionStatus },
    /// Concurrent modification detected, retry the operation.
    ConcurrentModification { subscription_id: Uuid },

    // Gateway errors
    /// The payment gateway call failed or timed out.
    GatewayUnavailable { operation: String, message: String },

    // Webhook errors
    /// Webhook signature is invalid.
    InvalidSignature,
    /// Webhook timestamp is too old (replay attack protection).
    SignatureExpired { age_seconds: i64 },
    /// Webhook payload is missing a required field.
    MissingEventField { field: String },
    /// Webhook payload could not be parsed by either the structured or the
    /// raw fallback path.
    UnparseableEvent { message: String },

    // General errors
    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPlan { plan } => {
                write!(f, "Unknown plan tier: {}", plan)
            }
            Self::InvalidStatus { status } => {
                write!(f, "Unknown subscription status: {}", status)
            }
            Self::InvalidCancellationReason { length } => {
                write!(
                    f,
                    "Cancellation reason must be between 10 and 500 characters (got {})",
                    length
                )
            }
            Self::SubscriptionNotFound { subscription_id } => {
                write!(f, "Subscription not found: {}", subscription_id)
            }
            Self::UserNotFound { user_ref } => {
                write!(f, "User not found: {}", user_ref)
            }
            Self::AlreadyCancelled { subscription_id, cancelled_at } => {
                write!(
                    f,
                    "Subscription {} was already cancelled at {}",
                    subscription_id, cancelled_at
                )
            }
            Self::NotCancellable { subscription_id, status } => {
                write!(
                    f,
                    "Subscription {} cannot be cancelled from status {}",
                    subscription_id, status
                )
            }
            Self::ConcurrentModification { subscription_id } => {
                write!(
                    f,
                    "Concurrent modification detected for subscription {}, please retry",
                    subscription_id
                )
            }
            Self::GatewayUnavailable { operation, message } => {
                write!(f, "Payment gateway error during '{}': {}", operation, message)
            }
            Self::InvalidSignature => {
                write!(f, "Invalid webhook signature")
            }
            Self::SignatureExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::MissingEventField { field } => {
                write!(f, "Webhook payload is missing required field '{}'", field)
            }
            Self::UnparseableEvent { message } => {
                write!(f, "Unparseable webhook payload: {}", message)
            }
            Self::Internal { message } => {
                write!(f, "Internal billing error: {}", message)
            }
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for crate::error::RebillError {
    fn from(err: BillingError) -> Self {
        match &err {
            // Map to NotFound
            BillingError::SubscriptionNotFound { .. } | BillingError::UserNotFound { .. } => {
                crate::error::RebillError::NotFound(err.to_string())
            }

            // Map to Conflict (state conflicts and optimistic-lock misses)
            BillingError::AlreadyCancelled { .. }
            | BillingError::NotCancellable { .. }
            | BillingError::ConcurrentModification { .. } => {
                crate::error::RebillError::Conflict(err.to_string())
            }

            // Map to BadRequest (client errors; webhook rejections answer 400)
            BillingError::InvalidPlan { .. }
            | BillingError::InvalidStatus { .. }
            | BillingError::InvalidCancellationReason { .. }
            | BillingError::InvalidSignature
            | BillingError::SignatureExpired { .. }
            | BillingError::MissingEventField { .. }
            | BillingError::UnparseableEvent { .. } => {
                crate::error::RebillError::BadRequest(err.to_string())
            }

            // Map to ServiceUnavailable (collaborator failures)
            BillingError::GatewayUnavailable { .. } => {
                crate::error::RebillError::ServiceUnavailable(err.to_string())
            }

            // Map to Internal
            BillingError::Internal { .. } => {
                crate::error::RebillError::Internal(err.to_string())
            }
        }
    }
}

impl BillingError {
    /// Check if this error was caused by the caller's input or the
    /// subscription's current state.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPlan { .. }
                | Self::InvalidStatus { .. }
                | Self::InvalidCancellationReason { .. }
                | Self::SubscriptionNotFound { .. }
                | Self::UserNotFound { .. }
                | Self::AlreadyCancelled { .. }
                | Self::NotCancellable { .. }
                | Self::InvalidSignature
                | Self::SignatureExpired { .. }
                | Self::MissingEventField { .. }
                | Self::UnparseableEvent { .. }
        )
    }

    /// Check if this error originated in the engine or a collaborator.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. }
                | Self::GatewayUnavailable { .. }
                | Self::Internal { .. }
        )
    }

    /// Check if retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::GatewayUnavailable { .. }
        )
    }
}

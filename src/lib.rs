//! Rebill - subscription lifecycle and billing retry engine
//!
//! Rebill keeps subscription records through their whole life: provisioned
//! from a signed checkout webhook, charged on schedule with a bounded retry
//! budget, demoted to DELINQUENT when the budget runs out, and cancelled
//! with cooling-off or prorated refunds.
//!
//! # Features
//!
//! - **Lifecycle**: subscription creation and plan tier management
//! - **Retry engine**: scheduled charges, per-row retry budget, delinquency
//!   demotion
//! - **Webhook ingestion**: HMAC-verified checkout events, idempotent
//!   provisioning
//! - **Cancellation**: immediate cancellation with full refunds inside the
//!   cooling-off window and prorated refunds on request outside it
//! - **Trait seams**: persistence, payment gateway, user directory, and
//!   session issuance are all pluggable
//! - **Test support**: in-memory store and scripted mocks behind the
//!   `test-support` feature
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use rebill::{BillingConfig, BillingScheduler, CheckoutWebhookHandler};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize logging
//!     rebill::init_tracing();
//!
//!     let config = BillingConfig::from_env();
//!
//!     // Wire your store, gateway, directory, and registrar implementations.
//!     let webhook = CheckoutWebhookHandler::new(
//!         store.clone(),
//!         directory,
//!         registrar,
//!         webhook_secret,
//!         config.clone(),
//!     );
//!
//!     // One billing tick; resident processes drive this from BillingWorker.
//!     let scheduler = BillingScheduler::new(store, gateway, config);
//!     let summary = scheduler.process_billing_cycle().await.unwrap();
//!     println!("charged {} of {} due", summary.succeeded, summary.processed);
//! }
//! ```

pub mod billing;
pub mod config;
pub mod error;
pub mod utils;

// Re-exports for public API
pub use billing::{
    BillingAuditEvent, BillingAuditLogger, BillingCycleSummary, BillingError, BillingScheduler,
    BillingWorker, BillingWorkerHandle, CancelSubscriptionRequest, CancellationManager,
    CancellationOutcome, CancelledBy, ChargeOutcome, CheckoutWebhookHandler, DirectoryUser,
    GatewayRefund, NoOpAuditLogger, PaymentGateway, PlanCadence, PlanTier, RefundKind, RefundState,
    SessionRegistrar, StoredSubscription, SubscriptionManager, SubscriptionStatus,
    SubscriptionStore, TracingAuditLogger, UserDirectory, WebhookOutcome,
};
pub use config::BillingConfig;
pub use error::{RebillError, Result};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main()
/// before wiring the billing engine.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "rebill=debug")
/// - `REBILL_LOG_JSON`: Set to "true" for JSON formatted logs
///
/// # Example
///
/// ```rust,no_run
/// use rebill;
///
/// #[tokio::main]
/// async fn main() {
///     rebill::init_tracing();
///     // ... rest of your app
/// }
/// ```
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("REBILL_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

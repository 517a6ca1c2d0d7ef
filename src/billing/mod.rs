//! Subscription lifecycle and billing retry engine.
//!
//! Provides subscription creation, scheduled charges with a bounded retry
//! budget, checkout webhook ingestion, and cancellation with cooling-off
//! refunds. Persistence, the payment provider, the user directory, and
//! session issuance all sit behind traits; in-memory and mock
//! implementations ship under the `test-support` feature.
//!
//! # Example
//!
//! ```rust,ignore
//! use rebill::billing::{
//!     BillingScheduler, BillingWorker, BillingWorkerHandle,
//!     CancelSubscriptionRequest, CancellationManager, SubscriptionManager,
//! };
//! use rebill::config::BillingConfig;
//!
//! let config = BillingConfig::from_env();
//!
//! // Provision a subscription (normally done by the checkout webhook).
//! let manager = SubscriptionManager::new(store.clone(), config.clone());
//! let subscription = manager.create_subscription(user_id, "PROFISSIONAL").await?;
//!
//! // Drive scheduled charges from a background task.
//! let scheduler = Arc::new(BillingScheduler::new(store.clone(), gateway.clone(), config.clone()));
//! let (worker, shutdown_rx) = BillingWorker::new(scheduler, config.clone());
//! let shutdown_tx = worker.shutdown_sender();
//! let task = tokio::spawn(worker.start(shutdown_rx));
//! let handle = BillingWorkerHandle::new(task, shutdown_tx);
//!
//! // Cancel inside the cooling-off window; the refund is automatic.
//! let cancellations = CancellationManager::new(store, gateway, config);
//! let outcome = cancellations
//!     .cancel_subscription(subscription.id, CancelSubscriptionRequest::by_user(
//!         "Assinei por engano, quero o estorno.",
//!     ))
//!     .await?;
//!
//! handle.shutdown().await;
//! ```

pub mod audit;
pub mod cancellation;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod plans;
pub mod scheduler;
pub mod storage;
pub mod webhook;
pub mod worker;

// Plan exports
pub use plans::{LIFETIME_HORIZON_SECS, PlanCadence, PlanTier};

// Storage exports
pub use storage::{
    CancelledBy, RefundState, StoredSubscription, SubscriptionStatus, SubscriptionStore,
};

// Lifecycle exports
pub use lifecycle::SubscriptionManager;

// Scheduler exports
pub use scheduler::{BillingCycleSummary, BillingScheduler};

// Worker exports
pub use worker::{BillingWorker, BillingWorkerHandle};

// Cancellation exports
pub use cancellation::{
    CancelSubscriptionRequest, CancellationManager, CancellationOutcome, RefundKind,
};

// Webhook exports
pub use webhook::{CheckoutWebhookHandler, NormalizedCheckout, ParsedEvent, WebhookOutcome};

// Directory exports
pub use directory::{DirectoryUser, SessionRegistrar, UserDirectory, display_name_from_email};

// Gateway exports
pub use gateway::{ChargeOutcome, GatewayRefund, PaymentGateway};

// Audit exports
pub use audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger, TracingAuditLogger};

// Error exports
pub use error::BillingError;

// Test exports
#[cfg(any(test, feature = "test-support"))]
pub use storage::test::InMemorySubscriptionStore;

#[cfg(any(test, feature = "test-support"))]
pub use gateway::test::{MockPaymentGateway, ScriptedCharge};

#[cfg(any(test, feature = "test-support"))]
pub use directory::test::{MockSessionRegistrar, MockUserDirectory};

#[cfg(any(test, feature = "test-support"))]
pub use audit::test::TestAuditLogger;

#[cfg(any(test, feature = "test-support"))]
pub use webhook::test::sign_payload;

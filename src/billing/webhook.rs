//! Checkout webhook ingestion.
//!
//! Consumes checkout-completed events from the payment provider: verifies
//! the HMAC signature, dedups on the provider session id, provisions the
//! buyer's account and subscription, and hands them a logged-in session.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::BillingConfig;
use crate::error::Result;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::directory::{SessionRegistrar, UserDirectory};
use super::error::BillingError;
use super::lifecycle::SubscriptionManager;
use super::plans::PlanTier;
use super::storage::SubscriptionStore;

/// The only provider event type that drives the pipeline.
const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

/// Get current Unix timestamp in seconds.
fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Webhook handler for checkout events.
///
/// Generic over the subscription store, the user directory, the session
/// registrar, and the audit sink. The webhook secret is held as a
/// [`SecretString`] so it never shows up in logs or debug output.
pub struct CheckoutWebhookHandler<
    S: SubscriptionStore,
    U: UserDirectory,
    R: SessionRegistrar,
    A: BillingAuditLogger = NoOpAuditLogger,
> {
    store: S,
    directory: U,
    registrar: R,
    audit: A,
    webhook_secret: SecretString,
    config: BillingConfig,
}

impl<S, U, R> CheckoutWebhookHandler<S, U, R>
where
    S: SubscriptionStore + Clone,
    U: UserDirectory,
    R: SessionRegistrar,
{
    /// Create a handler without audit logging.
    #[must_use]
    pub fn new(
        store: S,
        directory: U,
        registrar: R,
        webhook_secret: impl Into<SecretString>,
        config: BillingConfig,
    ) -> Self {
        Self::with_audit(store, directory, registrar, NoOpAuditLogger, webhook_secret, config)
    }
}

impl<S, U, R, A> CheckoutWebhookHandler<S, U, R, A>
where
    S: SubscriptionStore + Clone,
    U: UserDirectory,
    R: SessionRegistrar,
    A: BillingAuditLogger,
{
    /// Create a handler that reports ingestion to an audit sink.
    #[must_use]
    pub fn with_audit(
        store: S,
        directory: U,
        registrar: R,
        audit: A,
        webhook_secret: impl Into<SecretString>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            directory,
            registrar,
            audit,
            webhook_secret: webhook_secret.into(),
            config,
        }
    }

    /// Ingest one webhook delivery.
    ///
    /// Verifies the signature before anything is parsed, then runs the
    /// checkout pipeline. Redeliveries of an already-processed session come
    /// back as [`WebhookOutcome::AlreadyProcessed`] without creating
    /// anything; event types other than checkout completion are
    /// [`WebhookOutcome::Ignored`].
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookOutcome> {
        self.verify_signature(payload, signature_header)?;

        let checkout = ParsedEvent::parse(payload)?.normalize()?;

        self.audit
            .log(BillingAuditEvent::WebhookReceived {
                event_id: checkout.session_id.clone(),
                event_type: checkout.event_type.clone(),
            })
            .await;

        if checkout.event_type != CHECKOUT_COMPLETED {
            tracing::debug!(
                target: "rebill::webhook",
                event_type = %checkout.event_type,
                "Unhandled event type, ignoring"
            );
            return self.record_outcome(&checkout, WebhookOutcome::Ignored).await;
        }

        if self.store.is_event_processed(&checkout.session_id).await? {
            tracing::info!(
                target: "rebill::webhook",
                session_id = %checkout.session_id,
                "Checkout session already processed, skipping"
            );
            return self
                .record_outcome(&checkout, WebhookOutcome::AlreadyProcessed)
                .await;
        }

        self.process_checkout(&checkout).await?;
        self.store.mark_event_processed(&checkout.session_id).await?;

        self.record_outcome(&checkout, WebhookOutcome::Processed).await
    }

    /// Verify the provider signature over the raw payload.
    ///
    /// The header carries `t=<unix seconds>,v1=<hex hmac>`; the signed
    /// string is `"{timestamp}.{payload}"`. Comparison is constant-time,
    /// and timestamps outside the configured tolerance are rejected before
    /// any HMAC work.
    fn verify_signature(&self, payload: &[u8], signature_header: &str) -> Result<()> {
        let parts = parse_signature_header(signature_header)?;

        let now = current_timestamp() as i64;
        let age = now - parts.timestamp;
        if age.abs() > self.config.webhook_tolerance_secs as i64 {
            return Err(BillingError::SignatureExpired { age_seconds: age }.into());
        }

        let signed_payload = format!("{}.{}", parts.timestamp, String::from_utf8_lossy(payload));
        let expected =
            compute_signature(self.webhook_secret.expose_secret(), signed_payload.as_bytes())?;

        let expected_bytes = hex::decode(&expected).map_err(|_| BillingError::Internal {
            message: "signature hex round-trip failed".to_string(),
        })?;
        let provided_bytes =
            hex::decode(&parts.signature).map_err(|_| BillingError::InvalidSignature)?;

        if expected_bytes.ct_eq(&provided_bytes).unwrap_u8() != 1 {
            return Err(BillingError::InvalidSignature.into());
        }

        Ok(())
    }

    /// Run the checkout pipeline for a verified, deduped event.
    async fn process_checkout(&self, checkout: &NormalizedCheckout) -> Result<()> {
        let email = checkout
            .customer_email
            .as_deref()
            .ok_or_else(|| BillingError::MissingEventField {
                field: "customer_email".to_string(),
            })?;

        let plan = match checkout.plan_metadata.as_deref() {
            Some(raw) => PlanTier::parse(raw).ok_or_else(|| BillingError::InvalidPlan {
                plan: raw.to_string(),
            })?,
            None => {
                tracing::warn!(
                    target: "rebill::webhook",
                    session_id = %checkout.session_id,
                    default_plan = %self.config.default_plan,
                    "Checkout metadata carries no plan, using default"
                );
                self.config.default_plan
            }
        };

        let user = self.directory.find_or_create(email, plan).await?;
        // Existing accounts buying again get the purchased plan stamped.
        self.directory.assign_plan(user.id, plan).await?;

        let manager = SubscriptionManager::new(self.store.clone(), self.config.clone());
        let subscription = manager.create_subscription_for_tier(user.id, plan).await?;

        self.audit
            .log(BillingAuditEvent::SubscriptionCreated {
                subscription_id: subscription.id,
                user_id: user.id,
                plan: plan.as_str().to_string(),
            })
            .await;

        if checkout.payment_intent_id.is_some() || checkout.customer_id.is_some() {
            manager
                .update_payment_info(
                    subscription.id,
                    checkout.payment_intent_id.clone(),
                    checkout.customer_id.clone(),
                    None,
                )
                .await?;
        }

        // The subscription exists either way; a session the buyer has to
        // open manually is not worth failing the webhook over.
        match self.registrar.issue_token(&user.email).await {
            Ok(token) => {
                if let Err(err) = self
                    .registrar
                    .register_active_token(&user.email, &token)
                    .await
                {
                    tracing::warn!(
                        target: "rebill::webhook",
                        user_id = %user.id,
                        error = %err,
                        "Session registration failed after checkout"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "rebill::webhook",
                    user_id = %user.id,
                    error = %err,
                    "Token issuance failed after checkout"
                );
            }
        }

        tracing::info!(
            target: "rebill::webhook",
            session_id = %checkout.session_id,
            user_id = %user.id,
            subscription_id = %subscription.id,
            plan = %plan,
            "Checkout processed"
        );

        Ok(())
    }

    async fn record_outcome(
        &self,
        checkout: &NormalizedCheckout,
        outcome: WebhookOutcome,
    ) -> Result<WebhookOutcome> {
        self.audit
            .log(BillingAuditEvent::WebhookProcessed {
                event_id: checkout.session_id.clone(),
                event_type: checkout.event_type.clone(),
                outcome: outcome.as_str().to_string(),
            })
            .await;
        Ok(outcome)
    }
}

/// Typed provider event envelope.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CheckoutEvent {
    /// Provider event id (`evt_...`).
    pub id: String,
    /// Event type (e.g. "checkout.session.completed").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: CheckoutEventData,
}

/// Event data wrapper.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CheckoutEventData {
    /// The checkout session that completed.
    pub object: CheckoutSession,
}

/// The checkout session object inside a completed-checkout event.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CheckoutSession {
    /// Provider session id (`cs_...`). The idempotency key.
    pub id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub metadata: Option<SessionMetadata>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
}

/// Buyer details block; newer API versions put the email here.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

/// Metadata stamped on the session at checkout creation.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SessionMetadata {
    /// Purchased plan, under the key the storefront uses.
    #[serde(default)]
    pub plano: Option<String>,
}

/// A parsed provider payload.
///
/// The typed envelope covers well-formed deliveries; payloads it cannot
/// absorb (older API versions, partial relays) are kept as raw JSON and
/// mined by path. [`ParsedEvent::normalize`] produces the same view from
/// either variant.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    /// Deserialized into the typed envelope.
    Structured(CheckoutEvent),
    /// Raw JSON, navigated field by field.
    RawFallback(serde_json::Value),
}

impl ParsedEvent {
    /// Parse a payload, trying the typed envelope first.
    ///
    /// # Errors
    /// Returns `UnparseableEvent` only when the payload is not JSON at all.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<CheckoutEvent>(payload) {
            Ok(event) => Ok(Self::Structured(event)),
            Err(typed_err) => {
                let value: serde_json::Value =
                    serde_json::from_slice(payload).map_err(|err| {
                        tracing::warn!(
                            target: "rebill::webhook",
                            error = %err,
                            "Webhook payload is not JSON"
                        );
                        BillingError::UnparseableEvent {
                            message: "malformed JSON payload".to_string(),
                        }
                    })?;

                tracing::warn!(
                    target: "rebill::webhook",
                    error = %typed_err,
                    "Typed event parse failed, using raw fallback"
                );
                Ok(Self::RawFallback(value))
            }
        }
    }

    /// Extract the fields the pipeline runs on, from either variant.
    ///
    /// Event type and session id are required; email, plan metadata, and
    /// gateway references stay optional here; the pipeline decides which
    /// of those are fatal to be missing.
    pub fn normalize(&self) -> Result<NormalizedCheckout> {
        match self {
            Self::Structured(event) => {
                let session = &event.data.object;
                Ok(NormalizedCheckout {
                    event_type: event.event_type.clone(),
                    session_id: session.id.clone(),
                    customer_email: session.customer_email.clone().or_else(|| {
                        session
                            .customer_details
                            .as_ref()
                            .and_then(|details| details.email.clone())
                    }),
                    plan_metadata: session
                        .metadata
                        .as_ref()
                        .and_then(|metadata| metadata.plano.clone()),
                    payment_intent_id: session.payment_intent.clone(),
                    customer_id: session.customer.clone(),
                })
            }
            Self::RawFallback(value) => {
                let event_type = value
                    .get("type")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| BillingError::MissingEventField {
                        field: "type".to_string(),
                    })?
                    .to_string();

                let object = value.get("data").and_then(|data| data.get("object"));

                let session_id = object
                    .and_then(|obj| obj.get("id"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| BillingError::MissingEventField {
                        field: "data.object.id".to_string(),
                    })?
                    .to_string();

                let customer_email = object
                    .and_then(|obj| obj.get("customer_email"))
                    .and_then(|v| v.as_str())
                    .or_else(|| {
                        object
                            .and_then(|obj| obj.get("customer_details"))
                            .and_then(|details| details.get("email"))
                            .and_then(|v| v.as_str())
                    })
                    .map(String::from);

                let plan_metadata = object
                    .and_then(|obj| obj.get("metadata"))
                    .and_then(|metadata| metadata.get("plano"))
                    .and_then(|v| v.as_str())
                    .map(String::from);

                let payment_intent_id = object
                    .and_then(|obj| obj.get("payment_intent"))
                    .and_then(|v| v.as_str())
                    .map(String::from);

                let customer_id = object
                    .and_then(|obj| obj.get("customer"))
                    .and_then(|v| v.as_str())
                    .map(String::from);

                Ok(NormalizedCheckout {
                    event_type,
                    session_id,
                    customer_email,
                    plan_metadata,
                    payment_intent_id,
                    customer_id,
                })
            }
        }
    }
}

/// The fields the checkout pipeline runs on, parse path erased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedCheckout {
    pub event_type: String,
    /// Provider session id; the idempotency key.
    pub session_id: String,
    pub customer_email: Option<String>,
    pub plan_metadata: Option<String>,
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
}

/// Outcome of webhook processing.
///
/// All three map to a 2xx at the transport; only errors become 4xx.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event was processed and recorded.
    Processed,
    /// Event type is not handled; nothing recorded.
    Ignored,
    /// Session id seen before; nothing created.
    AlreadyProcessed,
}

impl WebhookOutcome {
    /// Canonical string form, as written to the audit trail.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Ignored => "ignored",
            Self::AlreadyProcessed => "already_processed",
        }
    }
}

impl std::fmt::Display for WebhookOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: i64,
    signature: String,
}

/// Parse the provider signature header (`t=...,v1=...`).
fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or(BillingError::InvalidSignature)?;

        match key.trim() {
            "t" => timestamp = value.parse().ok(),
            "v1" => signature = Some(value.to_string()),
            _ => {} // Ignore other signature versions
        }
    }

    match (timestamp, signature) {
        (Some(timestamp), Some(signature)) => Ok(SignatureParts { timestamp, signature }),
        _ => Err(BillingError::InvalidSignature.into()),
    }
}

/// Compute the hex HMAC-SHA256 of a payload.
fn compute_signature(secret: &str, payload: &[u8]) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| BillingError::Internal {
            message: "HMAC key setup failed".to_string(),
        })?;
    mac.update(payload);

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Signing helper for driving the handler from tests.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::compute_signature;

    /// Build a `t=...,v1=...` header over `payload`, signed the way the
    /// provider signs deliveries.
    #[must_use]
    pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
        let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
        let signature = compute_signature(secret, signed_payload.as_bytes())
            .expect("HMAC accepts keys of any length");
        format!("t={},v1={}", timestamp, signature)
    }
}

//! Configuration for the billing engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::billing::PlanTier;
use crate::utils::get_env_with_prefix;

/// Configuration for the billing engine.
///
/// All values have production defaults; `from_env()` overrides them from
/// `REBILL_`-prefixed environment variables (with unprefixed fallback).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BillingConfig {
    /// Consecutive failed charge attempts before a subscription is demoted
    /// to delinquent.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Length of one billing period in days.
    #[serde(default = "default_billing_period_days")]
    pub billing_period_days: u64,

    /// Statutory withdrawal window in days; cancellations inside it get a
    /// full refund regardless of the request flag.
    #[serde(default = "default_cooling_off_days")]
    pub cooling_off_days: u64,

    /// Plan tier assigned when checkout metadata carries no plan.
    #[serde(default = "default_plan")]
    pub default_plan: PlanTier,

    /// Upper bound on a single gateway charge/refund call, in seconds.
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,

    /// Maximum age of a webhook signature timestamp, in seconds.
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,

    /// Interval between automatic billing ticks, in seconds.
    #[serde(default = "default_worker_interval_secs")]
    pub worker_interval_secs: u64,

    /// How long processed webhook event ids are retained for dedup, in days.
    #[serde(default = "default_processed_event_retention_days")]
    pub processed_event_retention_days: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            billing_period_days: default_billing_period_days(),
            cooling_off_days: default_cooling_off_days(),
            default_plan: default_plan(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            worker_interval_secs: default_worker_interval_secs(),
            processed_event_retention_days: default_processed_event_retention_days(),
        }
    }
}

impl BillingConfig {
    /// Load billing configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(limit) = get_env_with_prefix("RETRY_LIMIT") {
            if let Ok(l) = limit.parse() {
                config.retry_limit = l;
            }
        }

        if let Some(days) = get_env_with_prefix("BILLING_PERIOD_DAYS") {
            if let Ok(d) = days.parse() {
                config.billing_period_days = d;
            }
        }

        if let Some(days) = get_env_with_prefix("COOLING_OFF_DAYS") {
            if let Ok(d) = days.parse() {
                config.cooling_off_days = d;
            }
        }

        if let Some(plan) = get_env_with_prefix("DEFAULT_PLAN") {
            if let Some(tier) = PlanTier::parse(&plan) {
                config.default_plan = tier;
            }
        }

        if let Some(secs) = get_env_with_prefix("GATEWAY_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse() {
                config.gateway_timeout_secs = s;
            }
        }

        if let Some(secs) = get_env_with_prefix("WEBHOOK_TOLERANCE_SECS") {
            if let Ok(s) = secs.parse() {
                config.webhook_tolerance_secs = s;
            }
        }

        if let Some(secs) = get_env_with_prefix("WORKER_INTERVAL_SECS") {
            if let Ok(s) = secs.parse() {
                config.worker_interval_secs = s;
            }
        }

        if let Some(days) = get_env_with_prefix("PROCESSED_EVENT_RETENTION_DAYS") {
            if let Ok(d) = days.parse() {
                config.processed_event_retention_days = d;
            }
        }

        config
    }

    /// One billing period in seconds.
    #[must_use]
    pub fn billing_period_secs(&self) -> u64 {
        self.billing_period_days * 24 * 60 * 60
    }

    /// Cooling-off window in seconds.
    #[must_use]
    pub fn cooling_off_secs(&self) -> u64 {
        self.cooling_off_days * 24 * 60 * 60
    }

    /// Gateway call timeout as a `Duration`.
    #[must_use]
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    /// Worker tick interval as a `Duration`.
    #[must_use]
    pub fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval_secs)
    }

    /// Processed-event retention in seconds.
    #[must_use]
    pub fn processed_event_retention_secs(&self) -> u64 {
        self.processed_event_retention_days * 24 * 60 * 60
    }
}

fn default_retry_limit() -> u32 {
    3
}

fn default_billing_period_days() -> u64 {
    30
}

fn default_cooling_off_days() -> u64 {
    7
}

fn default_plan() -> PlanTier {
    PlanTier::Pessoal
}

fn default_gateway_timeout_secs() -> u64 {
    10
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_worker_interval_secs() -> u64 {
    3600
}

fn default_processed_event_retention_days() -> u64 {
    30
}

//! Plan tiers and pricing.
//!
//! The product sells a closed set of plan tiers. Each tier carries its
//! monthly price in centavos (minor units) and a billing cadence; lifetime
//! tiers are charged once and never re-billed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Next-billing horizon for lifetime tiers, far enough out that the
/// scheduler never selects them (100 years in seconds).
pub const LIFETIME_HORIZON_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Enumerated subscription plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanTier {
    Gratis,
    Pessoal,
    ProfissionalMensal,
    ProfissionalVitalicio,
    Empresarial,
}

/// How a tier is billed over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanCadence {
    /// Recurring charge every billing period.
    Monthly,
    /// Single charge at purchase; never re-billed.
    Lifetime,
}

impl PlanTier {
    /// Parse a plan string as it appears in checkout metadata.
    ///
    /// Matching is case-insensitive. Returns `None` for unrecognized
    /// strings; callers decide whether that is an error (subscription
    /// creation) or triggers a default (webhook metadata fallback).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "GRATIS" => Some(Self::Gratis),
            "PESSOAL" => Some(Self::Pessoal),
            // "PROFISSIONAL" is the legacy spelling still present in older
            // checkout metadata.
            "PROFISSIONAL" | "PROFISSIONAL_MENSAL" => Some(Self::ProfissionalMensal),
            "PROFISSIONAL_VITALICIO" => Some(Self::ProfissionalVitalicio),
            "EMPRESARIAL" => Some(Self::Empresarial),
            _ => None,
        }
    }

    /// Canonical string form, as stored and as sent in provider metadata.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gratis => "GRATIS",
            Self::Pessoal => "PESSOAL",
            Self::ProfissionalMensal => "PROFISSIONAL_MENSAL",
            Self::ProfissionalVitalicio => "PROFISSIONAL_VITALICIO",
            Self::Empresarial => "EMPRESARIAL",
        }
    }

    /// Price in centavos charged per billing period (or once, for lifetime
    /// tiers).
    #[must_use]
    pub fn price_cents(&self) -> i64 {
        match self {
            Self::Gratis => 0,
            Self::Pessoal => 2990,
            Self::ProfissionalMensal => 4990,
            Self::ProfissionalVitalicio => 49990,
            Self::Empresarial => 9990,
        }
    }

    #[must_use]
    pub fn cadence(&self) -> PlanCadence {
        match self {
            Self::ProfissionalVitalicio => PlanCadence::Lifetime,
            _ => PlanCadence::Monthly,
        }
    }

    /// Compute the first/next billing date for this tier.
    ///
    /// Monthly tiers bill one period after `from`; lifetime tiers get a
    /// horizon date the scheduler will never reach.
    #[must_use]
    pub fn next_billing_from(&self, from: u64, period_secs: u64) -> u64 {
        match self.cadence() {
            PlanCadence::Monthly => from + period_secs,
            PlanCadence::Lifetime => from + LIFETIME_HORIZON_SECS,
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//! Tier identifiers and billing cycles.
//!
//! `TierId` is a closed set: every variant must have an entry in the
//! [`TierCatalog`](super::TierCatalog), which is checked at startup. Strings
//! from requests or webhooks only become tiers through `FromStr`.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::errors::BillingError;
use crate::domain::foundation::Timestamp;

/// Membership tier identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierId {
    /// No paid entitlement. Quotas fall back to the free allowance.
    Free,
    /// Entry paid tier.
    Starter,
    /// Mid tier.
    Professional,
    /// Top tier, unlimited leads.
    Elite,
}

impl TierId {
    /// Every tier, in rank order.
    pub const ALL: [TierId; 4] = [
        TierId::Free,
        TierId::Starter,
        TierId::Professional,
        TierId::Elite,
    ];

    /// Returns true if this tier is a paid tier.
    pub fn is_paid(&self) -> bool {
        !matches!(self, TierId::Free)
    }

    /// Stable lowercase identifier used in storage and provider metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            TierId::Free => "free",
            TierId::Starter => "starter",
            TierId::Professional => "professional",
            TierId::Elite => "elite",
        }
    }

    /// Returns the numeric rank of this tier for comparison.
    ///
    /// Higher rank = more entitlements. Decides upgrade vs downgrade.
    pub fn rank(&self) -> u8 {
        match self {
            TierId::Free => 0,
            TierId::Starter => 1,
            TierId::Professional => 2,
            TierId::Elite => 3,
        }
    }

    /// True if moving from `self` to `target` is an upgrade.
    pub fn is_upgrade_to(&self, target: TierId) -> bool {
        target.rank() > self.rank()
    }
}

impl FromStr for TierId {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(TierId::Free),
            "starter" => Ok(TierId::Starter),
            "professional" => Ok(TierId::Professional),
            "elite" => Ok(TierId::Elite),
            other => Err(BillingError::unknown_tier(other)),
        }
    }
}

impl std::fmt::Display for TierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How often a paid subscription renews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    #[default]
    Monthly,
    Annual,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Annual => "annual",
        }
    }

    /// End of a period of this cycle starting at `start`.
    ///
    /// Calendar arithmetic: monthly adds one month, annual one year.
    pub fn advance(&self, start: Timestamp) -> Timestamp {
        match self {
            BillingCycle::Monthly => start.add_months(1),
            BillingCycle::Annual => start.add_years(1),
        }
    }
}

impl FromStr for BillingCycle {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Ok(BillingCycle::Monthly),
            "annual" | "year" | "yearly" => Ok(BillingCycle::Annual),
            other => Err(BillingError::validation(
                "billing_cycle",
                format!("unsupported billing cycle '{}'", other),
            )),
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_free_is_unpaid() {
        assert!(!TierId::Free.is_paid());
        assert!(TierId::Starter.is_paid());
        assert!(TierId::Professional.is_paid());
        assert!(TierId::Elite.is_paid());
    }

    #[test]
    fn ranks_follow_declaration_order() {
        let ranks: Vec<u8> = TierId::ALL.iter().map(|t| t.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
        assert!(TierId::Starter.is_upgrade_to(TierId::Elite));
        assert!(!TierId::Elite.is_upgrade_to(TierId::Professional));
    }

    #[test]
    fn parses_known_tiers_case_insensitively() {
        assert_eq!("PROFESSIONAL".parse::<TierId>().unwrap(), TierId::Professional);
        assert_eq!(" elite ".parse::<TierId>().unwrap(), TierId::Elite);
    }

    #[test]
    fn unknown_tier_string_is_rejected() {
        let err = "platinum".parse::<TierId>().unwrap_err();
        assert!(matches!(err, BillingError::UnknownTier(ref t) if t == "platinum"));
    }

    #[test]
    fn tier_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TierId::Elite).unwrap(), "\"elite\"");
    }

    #[test]
    fn billing_cycle_accepts_provider_interval_names() {
        assert_eq!("year".parse::<BillingCycle>().unwrap(), BillingCycle::Annual);
        assert_eq!("month".parse::<BillingCycle>().unwrap(), BillingCycle::Monthly);
        assert!("weekly".parse::<BillingCycle>().is_err());
    }

    #[test]
    fn annual_cycle_advances_one_calendar_year() {
        let start = Timestamp::from_unix_secs(1_735_689_600).unwrap(); // 2025-01-01
        let end = BillingCycle::Annual.advance(start);
        assert_eq!(end, start.add_years(1));
        assert_eq!(end.as_unix_secs(), 1_767_225_600); // 2026-01-01
    }
}

//! Tier catalog: quotas, prices and provider price ids per tier.
//!
//! Built once at startup and never mutated. Construction validates that the
//! catalog covers exactly the closed set of [`TierId`] variants, so later
//! lookups by `TierId` cannot miss.
//!
//! # Standard quotas
//!
//! | Tier | Leads / period | Articles | Events |
//! |------|----------------|----------|--------|
//! | Free | 0 | 1 | 0 |
//! | Starter | 2 | 4 | 1 |
//! | Professional | 5 | 12 | 4 |
//! | Elite | Unlimited | Unlimited | Unlimited |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use super::errors::BillingError;
use super::tier::{BillingCycle, TierId};

/// Lead allocation per billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LeadQuota {
    Limited(u32),
    Unlimited,
}

impl LeadQuota {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, LeadQuota::Unlimited)
    }

    /// The numeric cap, or `None` when unlimited.
    pub fn cap(&self) -> Option<u32> {
        match self {
            LeadQuota::Limited(n) => Some(*n),
            LeadQuota::Unlimited => None,
        }
    }
}

/// Provider price ids for each billing cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceIds {
    pub monthly: Option<String>,
    pub annual: Option<String>,
}

impl PriceIds {
    pub fn new(monthly: impl Into<String>, annual: impl Into<String>) -> Self {
        Self {
            monthly: Some(monthly.into()),
            annual: Some(annual.into()),
        }
    }

    pub fn for_cycle(&self, cycle: BillingCycle) -> Option<&str> {
        match cycle {
            BillingCycle::Monthly => self.monthly.as_deref(),
            BillingCycle::Annual => self.annual.as_deref(),
        }
    }
}

/// Immutable configuration of one membership tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub id: TierId,
    pub name: String,
    /// Price in minor currency units.
    pub monthly_price_cents: u32,
    pub annual_price_cents: u32,
    pub lead_quota: LeadQuota,
    /// `None` means unlimited.
    pub article_quota: Option<u32>,
    /// `None` means unlimited.
    pub event_quota: Option<u32>,
    pub price_ids: PriceIds,
}

impl TierConfig {
    pub fn is_paid(&self) -> bool {
        self.id.is_paid()
    }

    pub fn price_id(&self, cycle: BillingCycle) -> Option<&str> {
        self.price_ids.for_cycle(cycle)
    }

    pub fn price_cents(&self, cycle: BillingCycle) -> u32 {
        match cycle {
            BillingCycle::Monthly => self.monthly_price_cents,
            BillingCycle::Annual => self.annual_price_cents,
        }
    }
}

/// Startup validation failures for the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("Tier '{0}' is missing from the catalog")]
    MissingTier(TierId),

    #[error("Tier '{0}' is configured more than once")]
    DuplicateTier(TierId),

    #[error("Paid tier '{tier}' has no {cycle} price id")]
    MissingPriceId { tier: TierId, cycle: BillingCycle },

    #[error("Free tier must not carry a price or price ids")]
    PricedFreeTier,

    #[error("Price id '{0}' is assigned to more than one tier/cycle")]
    DuplicatePriceId(String),
}

/// Read-only registry of tier configurations.
#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: HashMap<TierId, TierConfig>,
    prices: HashMap<String, (TierId, BillingCycle)>,
}

impl TierCatalog {
    /// Builds and validates a catalog.
    pub fn new(configs: Vec<TierConfig>) -> Result<Self, CatalogError> {
        let mut tiers = HashMap::new();
        for config in configs {
            let id = config.id;
            if tiers.insert(id, config).is_some() {
                return Err(CatalogError::DuplicateTier(id));
            }
        }

        let mut prices = HashMap::new();
        for id in TierId::ALL {
            let config = tiers.get(&id).ok_or(CatalogError::MissingTier(id))?;

            if !id.is_paid() {
                let has_price = config.monthly_price_cents > 0 || config.annual_price_cents > 0;
                let has_ids = config.price_ids.monthly.is_some() || config.price_ids.annual.is_some();
                if has_price || has_ids {
                    return Err(CatalogError::PricedFreeTier);
                }
                continue;
            }

            for cycle in [BillingCycle::Monthly, BillingCycle::Annual] {
                let price_id = config
                    .price_id(cycle)
                    .filter(|p| !p.is_empty())
                    .ok_or(CatalogError::MissingPriceId { tier: id, cycle })?;
                if prices.insert(price_id.to_string(), (id, cycle)).is_some() {
                    return Err(CatalogError::DuplicatePriceId(price_id.to_string()));
                }
            }
        }

        Ok(Self { tiers, prices })
    }

    /// Standard tier table wired to the given provider price ids.
    pub fn standard(
        starter: PriceIds,
        professional: PriceIds,
        elite: PriceIds,
    ) -> Result<Self, CatalogError> {
        Self::new(vec![
            TierConfig {
                id: TierId::Free,
                name: "Free".to_string(),
                monthly_price_cents: 0,
                annual_price_cents: 0,
                lead_quota: LeadQuota::Limited(0),
                article_quota: Some(1),
                event_quota: Some(0),
                price_ids: PriceIds::default(),
            },
            TierConfig {
                id: TierId::Starter,
                name: "Starter".to_string(),
                monthly_price_cents: 2_900,
                annual_price_cents: 29_000,
                lead_quota: LeadQuota::Limited(2),
                article_quota: Some(4),
                event_quota: Some(1),
                price_ids: starter,
            },
            TierConfig {
                id: TierId::Professional,
                name: "Professional".to_string(),
                monthly_price_cents: 7_900,
                annual_price_cents: 79_000,
                lead_quota: LeadQuota::Limited(5),
                article_quota: Some(12),
                event_quota: Some(4),
                price_ids: professional,
            },
            TierConfig {
                id: TierId::Elite,
                name: "Elite".to_string(),
                monthly_price_cents: 19_900,
                annual_price_cents: 199_000,
                lead_quota: LeadQuota::Unlimited,
                article_quota: None,
                event_quota: None,
                price_ids: elite,
            },
        ])
    }

    /// Looks up a tier's configuration.
    ///
    /// # Errors
    ///
    /// `UnknownTier` if the tier is absent. A validated catalog contains
    /// every variant, so this only fires for catalogs built in tests.
    pub fn lookup(&self, tier: TierId) -> Result<&TierConfig, BillingError> {
        self.tiers
            .get(&tier)
            .ok_or_else(|| BillingError::unknown_tier(tier.as_str()))
    }

    /// Parses an untrusted tier string and looks it up.
    pub fn lookup_str(&self, tier: &str) -> Result<&TierConfig, BillingError> {
        let id: TierId = tier.parse()?;
        self.lookup(id)
    }

    /// The free tier, used when no paid entitlement applies.
    pub fn free_tier(&self) -> Result<&TierConfig, BillingError> {
        self.lookup(TierId::Free)
    }

    /// Maps a provider price id back to its tier and cycle.
    pub fn resolve_price(&self, price_id: &str) -> Option<(TierId, BillingCycle)> {
        self.prices.get(price_id).copied()
    }

    /// All tiers in rank order.
    pub fn tiers(&self) -> Vec<&TierConfig> {
        TierId::ALL
            .iter()
            .filter_map(|id| self.tiers.get(id))
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn test_catalog() -> TierCatalog {
    TierCatalog::standard(
        PriceIds::new("price_starter_m", "price_starter_y"),
        PriceIds::new("price_pro_m", "price_pro_y"),
        PriceIds::new("price_elite_m", "price_elite_y"),
    )
    .expect("standard test catalog is valid")
}

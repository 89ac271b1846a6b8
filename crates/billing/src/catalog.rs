//! Plan catalog
//!
//! Static mapping from provider price ids to internal plans, billing intervals
//! and entitlement limits. Lookups are pure.
//!
//! Catalog limits use `-1` for "unlimited". Persisted workspace limits use
//! `NULL` instead; [`PlanLimits::to_persisted`] is the only place that
//! converts between the two.

use std::collections::HashMap;

use brandbase_shared::BillingInterval;
use serde::Serialize;

use crate::config::PriceIds;
use crate::error::{BillingError, BillingResult};

/// Catalog sentinel for "no limit"
pub const UNLIMITED: i64 = -1;

const GIB: i64 = 1024 * 1024 * 1024;

/// The tier unknown prices degrade to
pub const FALLBACK_PLAN_ID: &str = "starter";

/// Entitlement limits as defined in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    pub max_brands: i64,
    pub max_api_calls: i64,
    pub max_ai_credits: i64,
    pub max_insights_queries: i64,
    pub max_team_members: i64,
    pub max_storage_bytes: i64,
}

impl PlanLimits {
    pub fn unlimited() -> Self {
        Self {
            max_brands: UNLIMITED,
            max_api_calls: UNLIMITED,
            max_ai_credits: UNLIMITED,
            max_insights_queries: UNLIMITED,
            max_team_members: UNLIMITED,
            max_storage_bytes: UNLIMITED,
        }
    }

    /// Translate to the persisted representation (`-1` becomes `None`)
    pub fn to_persisted(&self) -> PersistedLimits {
        PersistedLimits {
            brands: persisted_limit(self.max_brands),
            api_calls_per_month: persisted_limit(self.max_api_calls),
            ai_credits_per_month: persisted_limit(self.max_ai_credits),
            insights_queries_per_month: persisted_limit(self.max_insights_queries),
            team_members: persisted_limit(self.max_team_members),
            storage_bytes: persisted_limit(self.max_storage_bytes),
        }
    }

    fn values(&self) -> [i64; 6] {
        [
            self.max_brands,
            self.max_api_calls,
            self.max_ai_credits,
            self.max_insights_queries,
            self.max_team_members,
            self.max_storage_bytes,
        ]
    }
}

/// Convert one catalog limit to its column value
pub fn persisted_limit(value: i64) -> Option<i64> {
    if value == UNLIMITED {
        None
    } else {
        Some(value)
    }
}

/// Limits as written to the workspace row. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistedLimits {
    pub brands: Option<i64>,
    pub api_calls_per_month: Option<i64>,
    pub ai_credits_per_month: Option<i64>,
    pub insights_queries_per_month: Option<i64>,
    pub team_members: Option<i64>,
    pub storage_bytes: Option<i64>,
}

/// A subscription plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub limits: PlanLimits,
}

impl Plan {
    pub fn starter() -> Self {
        Self {
            id: "starter".to_string(),
            name: "Starter".to_string(),
            limits: PlanLimits {
                max_brands: 1,
                max_api_calls: 10_000,
                max_ai_credits: 500,
                max_insights_queries: 100,
                max_team_members: 2,
                max_storage_bytes: GIB,
            },
        }
    }

    pub fn growth() -> Self {
        Self {
            id: "growth".to_string(),
            name: "Growth".to_string(),
            limits: PlanLimits {
                max_brands: 5,
                max_api_calls: 100_000,
                max_ai_credits: 5_000,
                max_insights_queries: 1_000,
                max_team_members: 10,
                max_storage_bytes: 10 * GIB,
            },
        }
    }

    pub fn scale() -> Self {
        Self {
            id: "scale".to_string(),
            name: "Scale".to_string(),
            limits: PlanLimits {
                max_brands: 25,
                max_api_calls: 1_000_000,
                max_ai_credits: 25_000,
                max_insights_queries: 10_000,
                max_team_members: 50,
                max_storage_bytes: 100 * GIB,
            },
        }
    }

    pub fn enterprise() -> Self {
        Self {
            id: "enterprise".to_string(),
            name: "Enterprise".to_string(),
            limits: PlanLimits::unlimited(),
        }
    }
}

/// One provider price in the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceEntry {
    pub price_id: String,
    pub plan_id: String,
    pub interval: BillingInterval,
}

impl PriceEntry {
    pub fn new(price_id: impl Into<String>, plan_id: &str, interval: BillingInterval) -> Self {
        Self {
            price_id: price_id.into(),
            plan_id: plan_id.to_string(),
            interval,
        }
    }
}

/// Result of a price lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub plan_id: String,
    pub plan_name: String,
    pub interval: BillingInterval,
    pub limits: PlanLimits,
    /// False when the price was unknown and the fallback tier was used
    pub matched: bool,
}

#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
    prices: HashMap<String, (usize, BillingInterval)>,
    fallback: usize,
}

impl PlanCatalog {
    /// Build a catalog, validating limits and price uniqueness
    pub fn new(plans: Vec<Plan>, prices: Vec<PriceEntry>, fallback_plan_id: &str) -> BillingResult<Self> {
        for plan in &plans {
            if let Some(bad) = plan.limits.values().into_iter().find(|v| *v < UNLIMITED) {
                return Err(BillingError::Catalog(format!(
                    "plan {} has invalid limit {}",
                    plan.id, bad
                )));
            }
        }

        let index_of = |plan_id: &str| plans.iter().position(|p| p.id == plan_id);

        let fallback = index_of(fallback_plan_id).ok_or_else(|| {
            BillingError::Catalog(format!("fallback plan {} is not in the catalog", fallback_plan_id))
        })?;

        let mut by_price = HashMap::with_capacity(prices.len());
        for entry in prices {
            let idx = index_of(&entry.plan_id).ok_or_else(|| {
                BillingError::Catalog(format!(
                    "price {} references unknown plan {}",
                    entry.price_id, entry.plan_id
                ))
            })?;
            if by_price
                .insert(entry.price_id.clone(), (idx, entry.interval))
                .is_some()
            {
                return Err(BillingError::Catalog(format!(
                    "price {} is mapped more than once",
                    entry.price_id
                )));
            }
        }

        Ok(Self {
            plans,
            prices: by_price,
            fallback,
        })
    }

    /// The built-in tiers priced with the given provider price ids
    pub fn from_price_ids(price_ids: &PriceIds) -> BillingResult<Self> {
        Self::new(builtin_plans(), builtin_prices(price_ids), FALLBACK_PLAN_ID)
    }

    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    pub fn fallback_plan(&self) -> &Plan {
        &self.plans[self.fallback]
    }

    /// Resolve a provider price id. Unknown prices resolve to the fallback
    /// tier on a monthly interval with `matched = false`.
    pub fn resolve_plan(&self, price_id: &str) -> ResolvedPlan {
        match self.prices.get(price_id) {
            Some((idx, interval)) => Self::resolved(&self.plans[*idx], *interval, true),
            None => Self::resolved(self.fallback_plan(), BillingInterval::Month, false),
        }
    }

    fn resolved(plan: &Plan, interval: BillingInterval, matched: bool) -> ResolvedPlan {
        ResolvedPlan {
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            interval,
            limits: plan.limits,
            matched,
        }
    }
}

impl Default for PlanCatalog {
    /// The built-in tiers with the default price ids
    fn default() -> Self {
        match Self::from_price_ids(&PriceIds::default()) {
            Ok(catalog) => catalog,
            Err(e) => unreachable!("built-in plan catalog is invalid: {e}"),
        }
    }
}

fn builtin_plans() -> Vec<Plan> {
    vec![Plan::starter(), Plan::growth(), Plan::scale(), Plan::enterprise()]
}

/// Monthly and yearly price of every built-in tier
fn builtin_prices(price_ids: &PriceIds) -> Vec<PriceEntry> {
    use BillingInterval::{Month, Year};

    vec![
        PriceEntry::new(&price_ids.starter_monthly, "starter", Month),
        PriceEntry::new(&price_ids.starter_yearly, "starter", Year),
        PriceEntry::new(&price_ids.growth_monthly, "growth", Month),
        PriceEntry::new(&price_ids.growth_yearly, "growth", Year),
        PriceEntry::new(&price_ids.scale_monthly, "scale", Month),
        PriceEntry::new(&price_ids.scale_yearly, "scale", Year),
        PriceEntry::new(&price_ids.enterprise_monthly, "enterprise", Month),
        PriceEntry::new(&price_ids.enterprise_yearly, "enterprise", Year),
    ]
}

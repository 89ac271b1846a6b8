//! Engine configuration loaded from the environment

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider price ids for every catalog tier.
///
/// Defaults follow the `price_<plan>_<interval>` naming used by the seeded
/// provider account; each can be overridden with
/// `STRIPE_PRICE_<PLAN>_<MONTHLY|YEARLY>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceIds {
    pub starter_monthly: String,
    pub starter_yearly: String,
    pub growth_monthly: String,
    pub growth_yearly: String,
    pub scale_monthly: String,
    pub scale_yearly: String,
    pub enterprise_monthly: String,
    pub enterprise_yearly: String,
}

impl Default for PriceIds {
    fn default() -> Self {
        Self {
            starter_monthly: "price_starter_month".to_string(),
            starter_yearly: "price_starter_year".to_string(),
            growth_monthly: "price_growth_month".to_string(),
            growth_yearly: "price_growth_year".to_string(),
            scale_monthly: "price_scale_month".to_string(),
            scale_yearly: "price_scale_year".to_string(),
            enterprise_monthly: "price_enterprise_month".to_string(),
            enterprise_yearly: "price_enterprise_year".to_string(),
        }
    }
}

impl PriceIds {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            starter_monthly: env_or("STRIPE_PRICE_STARTER_MONTHLY", defaults.starter_monthly),
            starter_yearly: env_or("STRIPE_PRICE_STARTER_YEARLY", defaults.starter_yearly),
            growth_monthly: env_or("STRIPE_PRICE_GROWTH_MONTHLY", defaults.growth_monthly),
            growth_yearly: env_or("STRIPE_PRICE_GROWTH_YEARLY", defaults.growth_yearly),
            scale_monthly: env_or("STRIPE_PRICE_SCALE_MONTHLY", defaults.scale_monthly),
            scale_yearly: env_or("STRIPE_PRICE_SCALE_YEARLY", defaults.scale_yearly),
            enterprise_monthly: env_or(
                "STRIPE_PRICE_ENTERPRISE_MONTHLY",
                defaults.enterprise_monthly,
            ),
            enterprise_yearly: env_or("STRIPE_PRICE_ENTERPRISE_YEARLY", defaults.enterprise_yearly),
        }
    }
}

/// Configuration for the reconciliation engine
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Upper bound for any single Tenant Store operation
    pub store_timeout: Duration,
    /// Provider API secret; only needed for checkout lookups and replay
    pub stripe_secret_key: Option<String>,
    pub price_ids: PriceIds,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            stripe_secret_key: None,
            price_ids: PriceIds::default(),
        }
    }
}

impl ReconcileConfig {
    /// Load from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let store_timeout = match std::env::var("BILLING_STORE_TIMEOUT_MS") {
            Ok(raw) => {
                let ms: u64 = raw.trim().parse().map_err(|_| {
                    BillingError::Config(format!("BILLING_STORE_TIMEOUT_MS is not a number: {raw}"))
                })?;
                if ms == 0 {
                    return Err(BillingError::Config(
                        "BILLING_STORE_TIMEOUT_MS must be greater than zero".to_string(),
                    ));
                }
                Duration::from_millis(ms)
            }
            Err(_) => DEFAULT_STORE_TIMEOUT,
        };

        let stripe_secret_key = std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());

        Ok(Self {
            store_timeout,
            stripe_secret_key,
            price_ids: PriceIds::from_env(),
        })
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn require_stripe_secret_key(&self) -> BillingResult<&str> {
        self.stripe_secret_key
            .as_deref()
            .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY not configured".to_string()))
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "BILLING_STORE_TIMEOUT_MS",
            "STRIPE_SECRET_KEY",
            "STRIPE_PRICE_GROWTH_MONTHLY",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = ReconcileConfig::from_env().unwrap();
        assert_eq!(config.store_timeout, DEFAULT_STORE_TIMEOUT);
        assert!(config.stripe_secret_key.is_none());
        assert_eq!(config.price_ids, PriceIds::default());
        assert!(config.require_stripe_secret_key().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("BILLING_STORE_TIMEOUT_MS", "250");
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        std::env::set_var("STRIPE_PRICE_GROWTH_MONTHLY", "price_1Growth");

        let config = ReconcileConfig::from_env().unwrap();
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.require_stripe_secret_key().unwrap(), "sk_test_123");
        assert_eq!(config.price_ids.growth_monthly, "price_1Growth");
        assert_eq!(config.price_ids.growth_yearly, "price_growth_year");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_timeout() {
        clear_env();
        std::env::set_var("BILLING_STORE_TIMEOUT_MS", "soon");
        assert!(matches!(
            ReconcileConfig::from_env(),
            Err(BillingError::Config(_))
        ));
        std::env::set_var("BILLING_STORE_TIMEOUT_MS", "0");
        assert!(ReconcileConfig::from_env().is_err());
        clear_env();
    }
}

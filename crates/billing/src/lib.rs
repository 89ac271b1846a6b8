// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries event ids and provider messages
#![allow(clippy::too_many_arguments)] // Subscription sync threads the full event context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Brandbase Billing Module
//!
//! Reconciles subscription and customer events from the payment provider
//! into each workspace's plan, status, limits and usage counters.
//!
//! ## Features
//!
//! - **Normalization**: Provider events become one of five internal events
//! - **Reconciliation**: Idempotent, period-ordered writes under a per-workspace lock
//! - **Usage Reset**: Monthly counters zeroed exactly once per period rollover
//! - **Plan Catalog**: Price ids map to plan tiers and limits
//! - **Invariants**: Runnable consistency checks over the tenant tables

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod invariants;
pub mod normalizer;
pub mod provider;
pub mod reconcile;
pub mod reconciler;
pub mod status;
pub mod store;
pub mod usage;

#[cfg(test)]
mod testing;

// Catalog
pub use catalog::{Plan, PlanCatalog, PlanLimits, PersistedLimits, ResolvedPlan, UNLIMITED};

// Client
pub use client::{ProviderClient, StripeClient};

// Config
pub use config::{PriceIds, ReconcileConfig};

// Error
pub use error::{BillingError, BillingResult, Disposition};

// Events
pub use events::{NormalizedEvent, SubscriptionSnapshot};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Normalizer
pub use normalizer::EventNormalizer;

// Provider payloads
pub use provider::ProviderEvent;

// Reconciliation
pub use reconcile::{ApplyOutcome, NoOpReason, ReconciliationEngine};
pub use reconciler::BillingReconciler;

// Store
pub use store::{InMemoryTenantStore, PgTenantStore, TenantStore, WorkspaceTx};

use sqlx::PgPool;

/// Reconciler backed by PostgreSQL and the Stripe API
pub type PgBillingReconciler = BillingReconciler<PgTenantStore, StripeClient>;

impl PgBillingReconciler {
    /// Create a reconciler from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = ReconcileConfig::from_env()?;
        Self::from_config(pool, &config)
    }

    /// Create a reconciler with explicit config
    pub fn from_config(pool: PgPool, config: &ReconcileConfig) -> BillingResult<Self> {
        let client = StripeClient::from_config(config)?;
        let catalog = PlanCatalog::from_price_ids(&config.price_ids)?;

        Ok(BillingReconciler::new(
            PgTenantStore::new(pool),
            client,
            catalog,
            config,
        ))
    }
}

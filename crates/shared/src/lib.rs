#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Brandbase shared types
//!
//! Tenant and subscription records shared by the billing engine and the
//! background worker.

pub mod types;

pub use types::{
    BillingInterval, Subscription, UsageCounters, Workspace, WorkspaceId, WorkspaceStatus,
};

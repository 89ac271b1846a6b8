//! Tenant store
//!
//! Persistent storage for workspaces and their subscription mirror. Reads
//! used for event resolution go through [`TenantStore`] directly; every write
//! goes through a [`WorkspaceTx`], a unit of work that holds the workspace's
//! lock from the first read to commit. Dropping a unit of work without
//! committing discards all of its writes.

use async_trait::async_trait;
use time::OffsetDateTime;

use brandbase_shared::{BillingInterval, Subscription, Workspace, WorkspaceId, WorkspaceStatus};

use crate::catalog::PersistedLimits;
use crate::error::BillingResult;
use crate::usage::UsageReset;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryTenantStore;
pub use postgres::PgTenantStore;

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    async fn get_workspace(&self, id: WorkspaceId) -> BillingResult<Option<Workspace>>;

    async fn find_workspace_by_customer_id(
        &self,
        provider_customer_id: &str,
    ) -> BillingResult<Option<Workspace>>;

    /// Open a unit of work on one workspace, waiting for its lock.
    ///
    /// Fails with `WorkspaceNotFound` when the workspace does not exist.
    async fn begin(&self, workspace_id: WorkspaceId) -> BillingResult<Box<dyn WorkspaceTx>>;
}

/// A locked unit of work on a single workspace
#[async_trait]
pub trait WorkspaceTx: Send {
    /// The workspace as read when the unit of work began
    fn workspace(&self) -> &Workspace;

    /// The workspace's subscription row, if any
    async fn subscription(&mut self) -> BillingResult<Option<Subscription>>;

    async fn upsert_subscription_and_workspace(
        &mut self,
        subscription: &Subscription,
        fields: &WorkspaceFields,
    ) -> BillingResult<()>;

    async fn reset_usage(&mut self, reset: &UsageReset) -> BillingResult<()>;

    /// Remove the subscription row and mark the workspace canceled. The
    /// workspace keeps its provider subscription id for audit.
    async fn delete_subscription_and_cancel_workspace(&mut self) -> BillingResult<()>;

    async fn mirror_customer(&mut self, fields: &CustomerFields) -> BillingResult<()>;

    async fn commit(&mut self) -> BillingResult<()>;
}

/// Workspace columns mirrored from the subscription on every accepted event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceFields {
    /// `None` keeps the stored customer id
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub billing_interval: BillingInterval,
    pub status: WorkspaceStatus,
    pub price_amount: Option<i64>,
    pub currency: Option<String>,
    pub trial_starts_at: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub period_starts_at: OffsetDateTime,
    pub period_ends_at: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub limits: PersistedLimits,
}

impl WorkspaceFields {
    pub fn apply_to(&self, workspace: &mut Workspace) {
        if let Some(customer_id) = &self.provider_customer_id {
            workspace.provider_customer_id = Some(customer_id.clone());
        }
        workspace.provider_subscription_id = Some(self.provider_subscription_id.clone());
        workspace.plan_id = Some(self.plan_id.clone());
        workspace.plan_name = Some(self.plan_name.clone());
        workspace.billing_interval = Some(self.billing_interval);
        workspace.status = self.status;
        workspace.price_amount = self.price_amount;
        workspace.currency = self.currency.clone();
        workspace.trial_starts_at = self.trial_starts_at;
        workspace.trial_ends_at = self.trial_ends_at;
        workspace.period_starts_at = Some(self.period_starts_at);
        workspace.period_ends_at = Some(self.period_ends_at);
        workspace.cancel_at_period_end = self.cancel_at_period_end;
        workspace.limit_brands = self.limits.brands;
        workspace.limit_api_calls_per_month = self.limits.api_calls_per_month;
        workspace.limit_ai_credits_per_month = self.limits.ai_credits_per_month;
        workspace.limit_insights_queries_per_month = self.limits.insights_queries_per_month;
        workspace.limit_team_members = self.limits.team_members;
        workspace.limit_storage_bytes = self.limits.storage_bytes;
    }
}

/// Customer columns mirrored from customer events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerFields {
    pub provider_customer_id: Option<String>,
    pub billing_email: Option<String>,
    pub synced_at: OffsetDateTime,
}

impl CustomerFields {
    pub fn apply_to(&self, workspace: &mut Workspace) {
        workspace.provider_customer_id = self.provider_customer_id.clone();
        workspace.billing_email = self.billing_email.clone();
        workspace.customer_synced_at = Some(self.synced_at);
    }
}

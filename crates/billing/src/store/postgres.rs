//! PostgreSQL tenant store
//!
//! A unit of work is a database transaction that opens with
//! `SELECT ... FOR UPDATE` on the workspace row. Concurrent events for the
//! same workspace queue on that row lock until the holder commits or rolls
//! back; dropping the transaction rolls it back.

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use brandbase_shared::{Subscription, Workspace, WorkspaceId, WorkspaceStatus};

use super::{CustomerFields, TenantStore, WorkspaceFields, WorkspaceTx};
use crate::error::{BillingError, BillingResult};
use crate::usage::UsageReset;

const WORKSPACE_COLUMNS: &str = r#"
    id, provider_customer_id, provider_subscription_id, billing_email,
    plan_id, plan_name, billing_interval, status, price_amount, currency,
    trial_starts_at, trial_ends_at, period_starts_at, period_ends_at, cancel_at_period_end,
    limit_brands, limit_api_calls_per_month, limit_ai_credits_per_month,
    limit_insights_queries_per_month, limit_team_members, limit_storage_bytes,
    usage_api_calls_count, usage_ai_credits_used, usage_insights_queries_count,
    usage_storage_bytes, usage_reset_at, customer_synced_at
"#;

const SUBSCRIPTION_COLUMNS: &str = r#"
    provider_subscription_id, workspace_id, provider_customer_id, price_id, plan_id,
    billing_interval, status, is_active, price_amount, currency,
    period_starts_at, period_ends_at, trial_starts_at, trial_ends_at,
    cancel_at_period_end, canceled_at, last_event_at
"#;

#[derive(Clone)]
pub struct PgTenantStore {
    pool: PgPool,
}

impl PgTenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TenantStore for PgTenantStore {
    async fn get_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE provider_subscription_id = $1");
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(provider_subscription_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))
    }

    async fn get_workspace(&self, id: WorkspaceId) -> BillingResult<Option<Workspace>> {
        let sql = format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = $1");
        sqlx::query_as::<_, Workspace>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))
    }

    async fn find_workspace_by_customer_id(
        &self,
        provider_customer_id: &str,
    ) -> BillingResult<Option<Workspace>> {
        // Customer ids are not unique in the schema; prefer the most recently synced row
        let sql = format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE provider_customer_id = $1 \
             ORDER BY customer_synced_at DESC NULLS LAST LIMIT 1"
        );
        sqlx::query_as::<_, Workspace>(&sql)
            .bind(provider_customer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))
    }

    async fn begin(&self, workspace_id: WorkspaceId) -> BillingResult<Box<dyn WorkspaceTx>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let sql = format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = $1 FOR UPDATE");
        let workspace = sqlx::query_as::<_, Workspace>(&sql)
            .bind(workspace_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?
            .ok_or(BillingError::WorkspaceNotFound(workspace_id))?;

        Ok(Box::new(PgWorkspaceTx {
            tx: Some(tx),
            workspace,
        }))
    }
}

struct PgWorkspaceTx {
    /// `None` once committed
    tx: Option<Transaction<'static, Postgres>>,
    workspace: Workspace,
}

impl PgWorkspaceTx {
    fn conn(&mut self) -> BillingResult<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| BillingError::Database("unit of work already committed".to_string()))
    }
}

#[async_trait]
impl WorkspaceTx for PgWorkspaceTx {
    fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    async fn subscription(&mut self) -> BillingResult<Option<Subscription>> {
        let workspace_id = self.workspace.id;
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE workspace_id = $1");
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(workspace_id)
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))
    }

    async fn upsert_subscription_and_workspace(
        &mut self,
        subscription: &Subscription,
        fields: &WorkspaceFields,
    ) -> BillingResult<()> {
        let workspace_id = self.workspace.id;

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                provider_subscription_id, workspace_id, provider_customer_id, price_id, plan_id,
                billing_interval, status, is_active, price_amount, currency,
                period_starts_at, period_ends_at, trial_starts_at, trial_ends_at,
                cancel_at_period_end, canceled_at, last_event_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, NOW(), NOW())
            ON CONFLICT (workspace_id) DO UPDATE SET
                provider_subscription_id = EXCLUDED.provider_subscription_id,
                provider_customer_id = COALESCE(EXCLUDED.provider_customer_id, subscriptions.provider_customer_id),
                price_id = EXCLUDED.price_id,
                plan_id = EXCLUDED.plan_id,
                billing_interval = EXCLUDED.billing_interval,
                status = EXCLUDED.status,
                is_active = EXCLUDED.is_active,
                price_amount = EXCLUDED.price_amount,
                currency = EXCLUDED.currency,
                period_starts_at = EXCLUDED.period_starts_at,
                period_ends_at = EXCLUDED.period_ends_at,
                trial_starts_at = EXCLUDED.trial_starts_at,
                trial_ends_at = EXCLUDED.trial_ends_at,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            "#,
        )
        .bind(&subscription.provider_subscription_id)
        .bind(workspace_id)
        .bind(&subscription.provider_customer_id)
        .bind(&subscription.price_id)
        .bind(&subscription.plan_id)
        .bind(subscription.billing_interval)
        .bind(subscription.status)
        .bind(subscription.is_active)
        .bind(subscription.price_amount)
        .bind(&subscription.currency)
        .bind(subscription.period_starts_at)
        .bind(subscription.period_ends_at)
        .bind(subscription.trial_starts_at)
        .bind(subscription.trial_ends_at)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.canceled_at)
        .bind(subscription.last_event_at)
        .execute(self.conn()?)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE workspaces SET
                provider_customer_id = COALESCE($2, provider_customer_id),
                provider_subscription_id = $3,
                plan_id = $4,
                plan_name = $5,
                billing_interval = $6,
                status = $7,
                price_amount = $8,
                currency = $9,
                trial_starts_at = $10,
                trial_ends_at = $11,
                period_starts_at = $12,
                period_ends_at = $13,
                cancel_at_period_end = $14,
                limit_brands = $15,
                limit_api_calls_per_month = $16,
                limit_ai_credits_per_month = $17,
                limit_insights_queries_per_month = $18,
                limit_team_members = $19,
                limit_storage_bytes = $20,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(workspace_id)
        .bind(&fields.provider_customer_id)
        .bind(&fields.provider_subscription_id)
        .bind(&fields.plan_id)
        .bind(&fields.plan_name)
        .bind(fields.billing_interval)
        .bind(fields.status)
        .bind(fields.price_amount)
        .bind(&fields.currency)
        .bind(fields.trial_starts_at)
        .bind(fields.trial_ends_at)
        .bind(fields.period_starts_at)
        .bind(fields.period_ends_at)
        .bind(fields.cancel_at_period_end)
        .bind(fields.limits.brands)
        .bind(fields.limits.api_calls_per_month)
        .bind(fields.limits.ai_credits_per_month)
        .bind(fields.limits.insights_queries_per_month)
        .bind(fields.limits.team_members)
        .bind(fields.limits.storage_bytes)
        .execute(self.conn()?)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        fields.apply_to(&mut self.workspace);
        Ok(())
    }

    async fn reset_usage(&mut self, reset: &UsageReset) -> BillingResult<()> {
        let workspace_id = self.workspace.id;

        sqlx::query(
            r#"
            UPDATE workspaces SET
                usage_api_calls_count = 0,
                usage_ai_credits_used = 0,
                usage_insights_queries_count = 0,
                usage_reset_at = $2,
                period_starts_at = $3,
                period_ends_at = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(workspace_id)
        .bind(reset.reset_at)
        .bind(reset.period_starts_at)
        .bind(reset.period_ends_at)
        .execute(self.conn()?)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        reset.apply_to(&mut self.workspace);
        Ok(())
    }

    async fn delete_subscription_and_cancel_workspace(&mut self) -> BillingResult<()> {
        let workspace_id = self.workspace.id;

        sqlx::query("DELETE FROM subscriptions WHERE workspace_id = $1")
            .bind(workspace_id)
            .execute(self.conn()?)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        sqlx::query("UPDATE workspaces SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(workspace_id)
            .bind(WorkspaceStatus::Canceled)
            .execute(self.conn()?)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        self.workspace.status = WorkspaceStatus::Canceled;
        Ok(())
    }

    async fn mirror_customer(&mut self, fields: &CustomerFields) -> BillingResult<()> {
        let workspace_id = self.workspace.id;

        sqlx::query(
            r#"
            UPDATE workspaces SET
                provider_customer_id = $2,
                billing_email = $3,
                customer_synced_at = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(workspace_id)
        .bind(&fields.provider_customer_id)
        .bind(&fields.billing_email)
        .bind(fields.synced_at)
        .execute(self.conn()?)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        fields.apply_to(&mut self.workspace);
        Ok(())
    }

    async fn commit(&mut self) -> BillingResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| BillingError::Database("unit of work already committed".to_string()))?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))
    }
}

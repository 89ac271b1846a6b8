//! Billing invariants
//!
//! Runnable consistency checks over the workspace and subscription tables.
//! They can be run after a replay or on a schedule to confirm that the
//! reconciliation engine left the store in a valid state.
//!
//! Checks only read. Each violation names the affected workspaces and
//! carries enough context to debug it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use brandbase_shared::WorkspaceId;

use crate::error::BillingResult;

const CHECKS: [&str; 6] = [
    "single_subscription_per_workspace",
    "unique_subscription_link",
    "active_subscription_on_canceled_workspace",
    "no_negative_limits",
    "is_active_matches_status",
    "subscription_link_matches",
];

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub workspace_ids: Vec<WorkspaceId>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlements or billing are wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    /// Summarize the violations found by `checks_run` checks
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    workspace_id: WorkspaceId,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct SharedLinkRow {
    provider_subscription_id: String,
    workspace_ids: Vec<uuid::Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct ActiveOnCanceledRow {
    workspace_id: WorkspaceId,
    provider_subscription_id: String,
    subscription_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeLimitRow {
    id: WorkspaceId,
    plan_id: Option<String>,
    limit_brands: Option<i64>,
    limit_api_calls_per_month: Option<i64>,
    limit_ai_credits_per_month: Option<i64>,
    limit_insights_queries_per_month: Option<i64>,
    limit_team_members: Option<i64>,
    limit_storage_bytes: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct ActiveFlagRow {
    workspace_id: WorkspaceId,
    provider_subscription_id: String,
    status: String,
    is_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct LinkMismatchRow {
    workspace_id: WorkspaceId,
    subscription_id: String,
    workspace_link: Option<String>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        Ok(InvariantCheckSummary::from_violations(now, CHECKS.len(), violations))
    }

    /// Invariant 1: at most one subscription row per workspace
    async fn check_single_subscription_per_workspace(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT workspace_id, COUNT(*) as sub_count
            FROM subscriptions
            GROUP BY workspace_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_subscription_per_workspace".to_string(),
                workspace_ids: vec![row.workspace_id],
                description: format!("Workspace has {} subscription rows (expected 1)", row.sub_count),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: a provider subscription is linked to at most one workspace
    async fn check_unique_subscription_link(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SharedLinkRow> = sqlx::query_as(
            r#"
            SELECT provider_subscription_id, ARRAY_AGG(id) as workspace_ids
            FROM workspaces
            WHERE provider_subscription_id IS NOT NULL
            GROUP BY provider_subscription_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unique_subscription_link".to_string(),
                workspace_ids: row.workspace_ids.iter().copied().map(WorkspaceId::from).collect(),
                description: format!(
                    "Subscription {} is linked to {} workspaces",
                    row.provider_subscription_id,
                    row.workspace_ids.len()
                ),
                context: serde_json::json!({
                    "provider_subscription_id": row.provider_subscription_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: a canceled workspace has no active subscription row
    ///
    /// Deletion removes the row and cancels the workspace together, so an
    /// active row under a canceled workspace means a partial write.
    async fn check_active_subscription_on_canceled_workspace(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ActiveOnCanceledRow> = sqlx::query_as(
            r#"
            SELECT
                s.workspace_id,
                s.provider_subscription_id,
                s.status as subscription_status
            FROM subscriptions s
            JOIN workspaces w ON w.id = s.workspace_id
            WHERE w.status = 'canceled'
              AND s.is_active = true
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_subscription_on_canceled_workspace".to_string(),
                workspace_ids: vec![row.workspace_id],
                description: format!(
                    "Workspace is canceled but subscription {} is {}",
                    row.provider_subscription_id, row.subscription_status
                ),
                context: serde_json::json!({
                    "provider_subscription_id": row.provider_subscription_id,
                    "subscription_status": row.subscription_status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: the unlimited sentinel never reaches storage
    async fn check_no_negative_limits(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeLimitRow> = sqlx::query_as(
            r#"
            SELECT
                id, plan_id,
                limit_brands, limit_api_calls_per_month, limit_ai_credits_per_month,
                limit_insights_queries_per_month, limit_team_members, limit_storage_bytes
            FROM workspaces
            WHERE limit_brands < 0
               OR limit_api_calls_per_month < 0
               OR limit_ai_credits_per_month < 0
               OR limit_insights_queries_per_month < 0
               OR limit_team_members < 0
               OR limit_storage_bytes < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_negative_limits".to_string(),
                workspace_ids: vec![row.id],
                description: format!(
                    "Workspace on plan '{}' stores a negative limit",
                    row.plan_id.as_deref().unwrap_or("(none)")
                ),
                context: serde_json::json!({
                    "limit_brands": row.limit_brands,
                    "limit_api_calls_per_month": row.limit_api_calls_per_month,
                    "limit_ai_credits_per_month": row.limit_ai_credits_per_month,
                    "limit_insights_queries_per_month": row.limit_insights_queries_per_month,
                    "limit_team_members": row.limit_team_members,
                    "limit_storage_bytes": row.limit_storage_bytes,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: `is_active` is true exactly for active and trialing rows
    async fn check_is_active_matches_status(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ActiveFlagRow> = sqlx::query_as(
            r#"
            SELECT workspace_id, provider_subscription_id, status, is_active
            FROM subscriptions
            WHERE is_active <> (status IN ('active', 'trialing'))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "is_active_matches_status".to_string(),
                workspace_ids: vec![row.workspace_id],
                description: format!(
                    "Subscription {} has status '{}' but is_active = {}",
                    row.provider_subscription_id, row.status, row.is_active
                ),
                context: serde_json::json!({
                    "provider_subscription_id": row.provider_subscription_id,
                    "status": row.status,
                    "is_active": row.is_active,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: the workspace points at the subscription that points at it
    async fn check_subscription_link_matches(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<LinkMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                s.workspace_id,
                s.provider_subscription_id as subscription_id,
                w.provider_subscription_id as workspace_link
            FROM subscriptions s
            JOIN workspaces w ON w.id = s.workspace_id
            WHERE w.provider_subscription_id IS DISTINCT FROM s.provider_subscription_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_link_matches".to_string(),
                workspace_ids: vec![row.workspace_id],
                description: format!(
                    "Subscription row {} but workspace links {}",
                    row.subscription_id,
                    row.workspace_link.as_deref().unwrap_or("(none)")
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "workspace_link": row.workspace_link,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name. Unknown names report nothing.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_subscription_per_workspace" => self.check_single_subscription_per_workspace().await,
            "unique_subscription_link" => self.check_unique_subscription_link().await,
            "active_subscription_on_canceled_workspace" => {
                self.check_active_subscription_on_canceled_workspace().await
            }
            "no_negative_limits" => self.check_no_negative_limits().await,
            "is_active_matches_status" => self.check_is_active_matches_status().await,
            "subscription_link_matches" => self.check_subscription_link_matches().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            workspace_ids: vec![WorkspaceId::new()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"unique_subscription_link"));
        assert!(checks.contains(&"no_negative_limits"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let now = OffsetDateTime::now_utc();
        let summary = InvariantCheckSummary::from_violations(
            now,
            6,
            vec![
                violation("no_negative_limits"),
                violation("no_negative_limits"),
                violation("is_active_matches_status"),
            ],
        );

        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 4);
        assert!(!summary.healthy);
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let summary = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), 6, vec![]);
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, 6);
    }
}

//! Common types used across Brandbase billing

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Workspace (tenant) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct WorkspaceId(pub Uuid);

impl WorkspaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a workspace reference supplied by a client (checkout reference,
    /// provider metadata). Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl Default for WorkspaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WorkspaceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Billing status of a workspace, mirrored from the provider subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    /// Provisioned but never subscribed
    Inactive,
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Paused,
}

impl Default for WorkspaceStatus {
    fn default() -> Self {
        Self::Inactive
    }
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
        }
    }

    /// Whether a subscription in this status grants plan entitlements
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing interval of a plan price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
}

impl Default for BillingInterval {
    fn default() -> Self {
        Self::Month
    }
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// Map a provider recurring interval. Intervals the product does not sell
    /// (day, week) have no mapping.
    pub fn from_provider(interval: &str) -> Option<Self> {
        match interval {
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Records
// =============================================================================

/// A tenant and its billing state.
///
/// `limit_*` fields are `None` when the plan imposes no limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub billing_email: Option<String>,
    pub plan_id: Option<String>,
    pub plan_name: Option<String>,
    pub billing_interval: Option<BillingInterval>,
    pub status: WorkspaceStatus,
    /// Price in the currency's minor unit
    pub price_amount: Option<i64>,
    pub currency: Option<String>,
    pub trial_starts_at: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub period_starts_at: Option<OffsetDateTime>,
    pub period_ends_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,

    pub limit_brands: Option<i64>,
    pub limit_api_calls_per_month: Option<i64>,
    pub limit_ai_credits_per_month: Option<i64>,
    pub limit_insights_queries_per_month: Option<i64>,
    pub limit_team_members: Option<i64>,
    pub limit_storage_bytes: Option<i64>,

    pub usage_api_calls_count: i64,
    pub usage_ai_credits_used: i64,
    pub usage_insights_queries_count: i64,
    pub usage_storage_bytes: i64,
    pub usage_reset_at: Option<OffsetDateTime>,

    /// Provider timestamp of the last applied customer event
    pub customer_synced_at: Option<OffsetDateTime>,
}

impl Workspace {
    /// A freshly provisioned workspace with no billing history
    pub fn provisioned(id: WorkspaceId) -> Self {
        Self {
            id,
            provider_customer_id: None,
            provider_subscription_id: None,
            billing_email: None,
            plan_id: None,
            plan_name: None,
            billing_interval: None,
            status: WorkspaceStatus::Inactive,
            price_amount: None,
            currency: None,
            trial_starts_at: None,
            trial_ends_at: None,
            period_starts_at: None,
            period_ends_at: None,
            cancel_at_period_end: false,
            limit_brands: None,
            limit_api_calls_per_month: None,
            limit_ai_credits_per_month: None,
            limit_insights_queries_per_month: None,
            limit_team_members: None,
            limit_storage_bytes: None,
            usage_api_calls_count: 0,
            usage_ai_credits_used: 0,
            usage_insights_queries_count: 0,
            usage_storage_bytes: 0,
            usage_reset_at: None,
            customer_synced_at: None,
        }
    }

    /// Snapshot of the usage counters
    pub fn usage(&self) -> UsageCounters {
        UsageCounters {
            api_calls: self.usage_api_calls_count,
            ai_credits: self.usage_ai_credits_used,
            insights_queries: self.usage_insights_queries_count,
            storage_bytes: self.usage_storage_bytes,
        }
    }
}

/// Usage counters of a workspace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub api_calls: i64,
    pub ai_credits: i64,
    pub insights_queries: i64,
    /// Current storage level; not a monthly counter
    pub storage_bytes: i64,
}

impl UsageCounters {
    /// True when every monthly counter is zero
    pub fn monthly_is_zero(&self) -> bool {
        self.api_calls == 0 && self.ai_credits == 0 && self.insights_queries == 0
    }
}

/// The engine's mirror of a provider subscription.
///
/// At most one row exists per workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub provider_subscription_id: String,
    pub workspace_id: WorkspaceId,
    pub provider_customer_id: Option<String>,
    pub price_id: Option<String>,
    pub plan_id: String,
    pub billing_interval: BillingInterval,
    pub status: WorkspaceStatus,
    pub is_active: bool,
    pub price_amount: Option<i64>,
    pub currency: Option<String>,
    pub period_starts_at: OffsetDateTime,
    pub period_ends_at: OffsetDateTime,
    pub trial_starts_at: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    /// Provider timestamp of the last applied event
    pub last_event_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_status_active_set() {
        assert!(WorkspaceStatus::Active.is_active());
        assert!(WorkspaceStatus::Trialing.is_active());
        assert!(!WorkspaceStatus::PastDue.is_active());
        assert!(!WorkspaceStatus::Canceled.is_active());
        assert!(!WorkspaceStatus::Inactive.is_active());
    }

    #[test]
    fn test_workspace_status_serializes_snake_case() {
        let json = serde_json::to_string(&WorkspaceStatus::PastDue).unwrap();
        assert_eq!(json, "\"past_due\"");
        assert_eq!(WorkspaceStatus::PastDue.to_string(), "past_due");
    }

    #[test]
    fn test_billing_interval_from_provider() {
        assert_eq!(BillingInterval::from_provider("month"), Some(BillingInterval::Month));
        assert_eq!(BillingInterval::from_provider("year"), Some(BillingInterval::Year));
        assert_eq!(BillingInterval::from_provider("week"), None);
    }

    #[test]
    fn test_workspace_id_parse() {
        let id = WorkspaceId::new();
        assert_eq!(WorkspaceId::parse(&format!(" {} ", id)), Some(id));
        assert_eq!(WorkspaceId::parse("not-a-uuid"), None);
    }

    #[test]
    fn test_provisioned_workspace_is_blank() {
        let ws = Workspace::provisioned(WorkspaceId::new());
        assert_eq!(ws.status, WorkspaceStatus::Inactive);
        assert!(ws.plan_id.is_none());
        assert!(ws.usage().monthly_is_zero());
    }
}

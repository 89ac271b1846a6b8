//! Billing error types

use brandbase_shared::WorkspaceId;

/// What the caller should do with an event that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient failure; ask the provider to redeliver
    Retry,
    /// The event can never succeed as delivered; log and drop it
    Drop,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Unsupported event type: {0}")]
    UnsupportedEventType(String),

    #[error("Malformed {event_type} payload: {reason}")]
    MalformedPayload { event_type: String, reason: String },

    #[error("Checkout event {event_id} carries no workspace reference")]
    MissingTenantReference { event_id: String },

    #[error("No workspace resolved for subscription {provider_subscription_id} (event {event_id})")]
    UnresolvedWorkspace {
        event_id: String,
        provider_subscription_id: String,
    },

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(WorkspaceId),

    #[error("Subscription {provider_subscription_id} already belongs to workspace {owner}")]
    SubscriptionOwnershipConflict {
        provider_subscription_id: String,
        owner: WorkspaceId,
    },

    #[error("Store operation `{operation}` timed out after {timeout_ms}ms")]
    StoreTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Provider API error: {0}")]
    ProviderApi(String),

    #[error("Invalid plan catalog: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Transient failures are safe to retry: every write path is idempotent
    /// or guarded by the period ordering check.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::StoreTimeout { .. }
                | BillingError::Database(_)
                | BillingError::ProviderApi(_)
        )
    }

    pub fn disposition(&self) -> Disposition {
        if self.is_retryable() {
            Disposition::Retry
        } else {
            Disposition::Drop
        }
    }

    pub(crate) fn malformed(event_type: &str, reason: impl Into<String>) -> Self {
        BillingError::MalformedPayload {
            event_type: event_type.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::ProviderApi(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::malformed("payload", err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

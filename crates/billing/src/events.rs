//! Provider-agnostic billing events
//!
//! The normalizer turns every supported provider event into one of these;
//! the reconciliation engine only ever sees this shape.

use brandbase_shared::{BillingInterval, WorkspaceId};
use time::OffsetDateTime;

/// Internal billing event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionUpdated(SubscriptionUpdated),
    SubscriptionDeleted(SubscriptionDeleted),
    CustomerUpserted(CustomerUpserted),
    CustomerDeleted(CustomerDeleted),
}

impl NormalizedEvent {
    pub fn event_id(&self) -> &str {
        match self {
            NormalizedEvent::CheckoutCompleted(e) => &e.event_id,
            NormalizedEvent::SubscriptionUpdated(e) => &e.event_id,
            NormalizedEvent::SubscriptionDeleted(e) => &e.event_id,
            NormalizedEvent::CustomerUpserted(e) => &e.event_id,
            NormalizedEvent::CustomerDeleted(e) => &e.event_id,
        }
    }

    /// Provider timestamp of the event
    pub fn occurred_at(&self) -> OffsetDateTime {
        match self {
            NormalizedEvent::CheckoutCompleted(e) => e.occurred_at,
            NormalizedEvent::SubscriptionUpdated(e) => e.occurred_at,
            NormalizedEvent::SubscriptionDeleted(e) => e.occurred_at,
            NormalizedEvent::CustomerUpserted(e) => e.occurred_at,
            NormalizedEvent::CustomerDeleted(e) => e.occurred_at,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedEvent::CheckoutCompleted(_) => "checkout_completed",
            NormalizedEvent::SubscriptionUpdated(_) => "subscription_updated",
            NormalizedEvent::SubscriptionDeleted(_) => "subscription_deleted",
            NormalizedEvent::CustomerUpserted(_) => "customer_upserted",
            NormalizedEvent::CustomerDeleted(_) => "customer_deleted",
        }
    }
}

/// State of a provider subscription as reported by one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub provider_subscription_id: String,
    pub provider_customer_id: Option<String>,
    pub price_id: Option<String>,
    pub price_amount: Option<i64>,
    pub currency: Option<String>,
    /// Recurring interval reported by the provider, if any
    pub interval: Option<BillingInterval>,
    /// Raw provider status string
    pub status: String,
    /// False once the provider reports the subscription as ended
    pub provider_active: bool,
    pub period_starts_at: OffsetDateTime,
    pub period_ends_at: OffsetDateTime,
    pub trial_starts_at: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    /// Workspace named in the subscription's metadata. Only a fallback;
    /// the subscription row is authoritative.
    pub tenant_hint: Option<WorkspaceId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompleted {
    pub event_id: String,
    pub occurred_at: OffsetDateTime,
    pub explicit_tenant_id: Option<WorkspaceId>,
    pub provider_customer_id: Option<String>,
    pub subscription: SubscriptionSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdated {
    pub event_id: String,
    pub occurred_at: OffsetDateTime,
    pub subscription: SubscriptionSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDeleted {
    pub event_id: String,
    pub occurred_at: OffsetDateTime,
    pub provider_subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerUpserted {
    pub event_id: String,
    pub occurred_at: OffsetDateTime,
    pub provider_customer_id: String,
    pub email: Option<String>,
    pub tenant_hint: Option<WorkspaceId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerDeleted {
    pub event_id: String,
    pub occurred_at: OffsetDateTime,
    pub provider_customer_id: String,
}

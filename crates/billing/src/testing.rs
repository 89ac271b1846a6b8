//! Test fixtures shared by the unit and scenario tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use time::OffsetDateTime;

use brandbase_shared::{BillingInterval, Subscription, WorkspaceId, WorkspaceStatus};

use crate::catalog::PlanCatalog;
use crate::client::ProviderClient;
use crate::config::ReconcileConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutCompleted, CustomerDeleted, CustomerUpserted, NormalizedEvent, SubscriptionDeleted,
    SubscriptionSnapshot, SubscriptionUpdated,
};
use crate::provider::{ProviderEvent, ProviderSubscription};
use crate::reconcile::ReconciliationEngine;
use crate::store::{InMemoryTenantStore, WorkspaceFields};

/// 2025-01-01T00:00:00Z
pub const T0: i64 = 1_735_689_600;
pub const DAY: i64 = 86_400;

pub fn ts(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap()
}

fn interval_of(price_id: &str) -> &'static str {
    if price_id.ends_with("_year") {
        "year"
    } else {
        "month"
    }
}

/// Provider subscription object with one item, active, 30-day period
pub fn subscription_json(id: &str, price_id: &str, period_start: i64) -> Value {
    json!({
        "id": id,
        "object": "subscription",
        "customer": "cus_1",
        "status": "active",
        "cancel_at_period_end": false,
        "current_period_start": period_start,
        "current_period_end": period_start + 30 * DAY,
        "metadata": {},
        "items": {
            "object": "list",
            "data": [{
                "id": format!("si_{id}"),
                "price": {
                    "id": price_id,
                    "unit_amount": 4900,
                    "currency": "usd",
                    "recurring": { "interval": interval_of(price_id) },
                },
            }],
        },
    })
}

pub fn provider_event(id: &str, event_type: &str, created: i64, object: Value) -> ProviderEvent {
    serde_json::from_value(json!({
        "id": id,
        "type": event_type,
        "created": created,
        "data": { "object": object },
    }))
    .unwrap()
}

/// Provider client answering from a fixed set of subscriptions
#[derive(Default)]
pub struct StaticProviderClient {
    subscriptions: HashMap<String, Value>,
    events: HashMap<String, ProviderEvent>,
    lookups: AtomicUsize,
}

impl StaticProviderClient {
    pub fn with_subscription(mut self, subscription: Value) -> Self {
        let id = subscription["id"].as_str().unwrap().to_string();
        self.subscriptions.insert(id, subscription);
        self
    }

    pub fn with_event(mut self, event: ProviderEvent) -> Self {
        self.events.insert(event.id.clone(), event);
        self
    }

    pub fn subscription_lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for StaticProviderClient {
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<ProviderSubscription> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let value = self
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::ProviderApi(format!("No such subscription: {subscription_id}")))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn retrieve_event(&self, event_id: &str) -> BillingResult<ProviderEvent> {
        self.events
            .get(event_id)
            .cloned()
            .ok_or_else(|| BillingError::ProviderApi(format!("No such event: {event_id}")))
    }
}

/// Normalized snapshot matching [`subscription_json`]
pub fn snapshot(id: &str, price_id: &str, period_start: i64) -> SubscriptionSnapshot {
    SubscriptionSnapshot {
        provider_subscription_id: id.to_string(),
        provider_customer_id: Some("cus_1".to_string()),
        price_id: Some(price_id.to_string()),
        price_amount: Some(4900),
        currency: Some("usd".to_string()),
        interval: BillingInterval::from_provider(interval_of(price_id)),
        status: "active".to_string(),
        provider_active: true,
        period_starts_at: ts(period_start),
        period_ends_at: ts(period_start + 30 * DAY),
        trial_starts_at: None,
        trial_ends_at: None,
        cancel_at_period_end: false,
        canceled_at: None,
        tenant_hint: None,
    }
}

pub fn checkout_completed(
    event_id: &str,
    workspace_id: WorkspaceId,
    subscription: SubscriptionSnapshot,
    occurred_at: i64,
) -> CheckoutCompleted {
    CheckoutCompleted {
        event_id: event_id.to_string(),
        occurred_at: ts(occurred_at),
        explicit_tenant_id: Some(workspace_id),
        provider_customer_id: subscription.provider_customer_id.clone(),
        subscription,
    }
}

pub fn checkout(
    event_id: &str,
    workspace_id: WorkspaceId,
    subscription: SubscriptionSnapshot,
    occurred_at: i64,
) -> NormalizedEvent {
    NormalizedEvent::CheckoutCompleted(checkout_completed(event_id, workspace_id, subscription, occurred_at))
}

pub fn updated(event_id: &str, subscription: SubscriptionSnapshot, occurred_at: i64) -> NormalizedEvent {
    NormalizedEvent::SubscriptionUpdated(SubscriptionUpdated {
        event_id: event_id.to_string(),
        occurred_at: ts(occurred_at),
        subscription,
    })
}

pub fn deleted(event_id: &str, provider_subscription_id: &str, occurred_at: i64) -> NormalizedEvent {
    NormalizedEvent::SubscriptionDeleted(SubscriptionDeleted {
        event_id: event_id.to_string(),
        occurred_at: ts(occurred_at),
        provider_subscription_id: provider_subscription_id.to_string(),
    })
}

pub fn customer_upserted(
    event_id: &str,
    provider_customer_id: &str,
    email: Option<&str>,
    tenant_hint: Option<WorkspaceId>,
    occurred_at: i64,
) -> NormalizedEvent {
    NormalizedEvent::CustomerUpserted(CustomerUpserted {
        event_id: event_id.to_string(),
        occurred_at: ts(occurred_at),
        provider_customer_id: provider_customer_id.to_string(),
        email: email.map(str::to_string),
        tenant_hint,
    })
}

pub fn customer_deleted(event_id: &str, provider_customer_id: &str, occurred_at: i64) -> NormalizedEvent {
    NormalizedEvent::CustomerDeleted(CustomerDeleted {
        event_id: event_id.to_string(),
        occurred_at: ts(occurred_at),
        provider_customer_id: provider_customer_id.to_string(),
    })
}

/// A growth-tier subscription row as the engine would have stored it
pub fn stored_subscription(workspace_id: WorkspaceId, id: &str, period_start: i64) -> Subscription {
    Subscription {
        provider_subscription_id: id.to_string(),
        workspace_id,
        provider_customer_id: Some("cus_1".to_string()),
        price_id: Some("price_growth_month".to_string()),
        plan_id: "growth".to_string(),
        billing_interval: BillingInterval::Month,
        status: WorkspaceStatus::Active,
        is_active: true,
        price_amount: Some(4900),
        currency: Some("usd".to_string()),
        period_starts_at: ts(period_start),
        period_ends_at: ts(period_start + 30 * DAY),
        trial_starts_at: None,
        trial_ends_at: None,
        cancel_at_period_end: false,
        canceled_at: None,
        last_event_at: ts(period_start),
    }
}

/// Workspace mirror fields for a stored subscription
pub fn workspace_fields(subscription: &Subscription) -> WorkspaceFields {
    let plan = PlanCatalog::default().resolve_plan(subscription.price_id.as_deref().unwrap_or_default());
    WorkspaceFields {
        provider_customer_id: subscription.provider_customer_id.clone(),
        provider_subscription_id: subscription.provider_subscription_id.clone(),
        plan_id: plan.plan_id,
        plan_name: plan.plan_name,
        billing_interval: subscription.billing_interval,
        status: subscription.status,
        price_amount: subscription.price_amount,
        currency: subscription.currency.clone(),
        trial_starts_at: subscription.trial_starts_at,
        trial_ends_at: subscription.trial_ends_at,
        period_starts_at: subscription.period_starts_at,
        period_ends_at: subscription.period_ends_at,
        cancel_at_period_end: subscription.cancel_at_period_end,
        limits: plan.limits.to_persisted(),
    }
}

/// Engine over an in-memory store with the built-in catalog and defaults
pub fn engine(store: InMemoryTenantStore) -> ReconciliationEngine<InMemoryTenantStore> {
    ReconciliationEngine::new(store, PlanCatalog::default(), &ReconcileConfig::default())
}

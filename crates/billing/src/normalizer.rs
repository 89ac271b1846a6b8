//! Event normalizer
//!
//! Converts verified provider events into [`NormalizedEvent`]s. Each provider
//! event yields exactly one internal event or an error; event types the
//! engine does not reconcile fail with `UnsupportedEventType`.

use serde::de::DeserializeOwned;
use time::OffsetDateTime;

use brandbase_shared::{BillingInterval, WorkspaceId};

use crate::client::ProviderClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutCompleted, CustomerDeleted, CustomerUpserted, NormalizedEvent, SubscriptionDeleted,
    SubscriptionSnapshot, SubscriptionUpdated,
};
use crate::provider::{
    Expandable, ObjectRef, ProviderCheckoutSession, ProviderCustomer, ProviderEvent,
    ProviderSubscription,
};

/// Metadata key carrying the workspace id on provider objects
pub const WORKSPACE_METADATA_KEY: &str = "workspace_id";

pub struct EventNormalizer<C> {
    client: C,
}

impl<C: ProviderClient> EventNormalizer<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub async fn normalize(&self, event: &ProviderEvent) -> BillingResult<NormalizedEvent> {
        let event_type = event.event_type.as_str();
        let occurred_at = timestamp(event_type, "created", event.created)?;
        let event_id = event.id.clone();

        match event_type {
            "checkout.session.completed" => {
                let session: ProviderCheckoutSession = parse_object(event)?;
                self.checkout_completed(event_id, occurred_at, session).await
            }
            "customer.subscription.created" | "customer.subscription.updated" => {
                let subscription: ProviderSubscription = parse_object(event)?;
                Ok(NormalizedEvent::SubscriptionUpdated(SubscriptionUpdated {
                    event_id,
                    occurred_at,
                    subscription: snapshot(event_type, &subscription)?,
                }))
            }
            "customer.subscription.deleted" => {
                let subscription: ObjectRef = parse_object(event)?;
                Ok(NormalizedEvent::SubscriptionDeleted(SubscriptionDeleted {
                    event_id,
                    occurred_at,
                    provider_subscription_id: subscription.id,
                }))
            }
            "customer.created" | "customer.updated" => {
                let customer: ProviderCustomer = parse_object(event)?;
                Ok(NormalizedEvent::CustomerUpserted(CustomerUpserted {
                    event_id,
                    occurred_at,
                    tenant_hint: tenant_from_metadata(&customer.metadata),
                    provider_customer_id: customer.id,
                    email: customer.email,
                }))
            }
            "customer.deleted" => {
                let customer: ObjectRef = parse_object(event)?;
                Ok(NormalizedEvent::CustomerDeleted(CustomerDeleted {
                    event_id,
                    occurred_at,
                    provider_customer_id: customer.id,
                }))
            }
            other => Err(BillingError::UnsupportedEventType(other.to_string())),
        }
    }

    async fn checkout_completed(
        &self,
        event_id: String,
        occurred_at: OffsetDateTime,
        session: ProviderCheckoutSession,
    ) -> BillingResult<NormalizedEvent> {
        const EVENT_TYPE: &str = "checkout.session.completed";

        let explicit_tenant_id = checkout_tenant_reference(&event_id, &session);

        let subscription = match session.subscription {
            Some(Expandable::Object(subscription)) => *subscription,
            Some(Expandable::Id(subscription_id)) => {
                self.client.retrieve_subscription(&subscription_id).await?
            }
            None => {
                // One-time payment checkout; nothing to reconcile
                return Err(BillingError::UnsupportedEventType(format!(
                    "{EVENT_TYPE} without subscription"
                )));
            }
        };

        let subscription = snapshot(EVENT_TYPE, &subscription)?;
        let provider_customer_id = session
            .customer
            .as_ref()
            .map(|c| c.id().to_string())
            .or_else(|| subscription.provider_customer_id.clone());

        Ok(NormalizedEvent::CheckoutCompleted(CheckoutCompleted {
            event_id,
            occurred_at,
            explicit_tenant_id,
            provider_customer_id,
            subscription,
        }))
    }
}

/// The client reference wins over session metadata. An unparseable reference
/// counts as absent.
fn checkout_tenant_reference(event_id: &str, session: &ProviderCheckoutSession) -> Option<WorkspaceId> {
    let raw = session.client_reference_id.as_deref().or_else(|| {
        session
            .metadata
            .as_ref()
            .and_then(|m| m.get(WORKSPACE_METADATA_KEY))
            .map(String::as_str)
    })?;

    let parsed = WorkspaceId::parse(raw);
    if parsed.is_none() {
        tracing::warn!(
            event_id = %event_id,
            session_id = %session.id,
            reference = %raw,
            "Checkout session carries an unparseable workspace reference"
        );
    }
    parsed
}

fn tenant_from_metadata(metadata: &std::collections::HashMap<String, String>) -> Option<WorkspaceId> {
    metadata
        .get(WORKSPACE_METADATA_KEY)
        .and_then(|raw| WorkspaceId::parse(raw))
}

fn snapshot(event_type: &str, sub: &ProviderSubscription) -> BillingResult<SubscriptionSnapshot> {
    let first_item = sub.items.data.first();
    let price = first_item.and_then(|item| item.price.as_ref());

    let period_start = sub
        .current_period_start
        .or_else(|| first_item.and_then(|item| item.current_period_start))
        .ok_or_else(|| BillingError::malformed(event_type, "missing current_period_start"))?;
    let period_end = sub
        .current_period_end
        .or_else(|| first_item.and_then(|item| item.current_period_end))
        .ok_or_else(|| BillingError::malformed(event_type, "missing current_period_end"))?;

    Ok(SubscriptionSnapshot {
        provider_subscription_id: sub.id.clone(),
        provider_customer_id: sub.customer.as_ref().map(|c| c.id().to_string()),
        price_id: price.map(|p| p.id.clone()),
        price_amount: price.and_then(|p| p.unit_amount),
        currency: price
            .and_then(|p| p.currency.clone())
            .or_else(|| sub.currency.clone()),
        interval: price
            .and_then(|p| p.recurring.as_ref())
            .and_then(|r| BillingInterval::from_provider(&r.interval)),
        status: sub.status.clone(),
        provider_active: sub.ended_at.is_none(),
        period_starts_at: timestamp(event_type, "current_period_start", period_start)?,
        period_ends_at: timestamp(event_type, "current_period_end", period_end)?,
        trial_starts_at: optional_timestamp(event_type, "trial_start", sub.trial_start)?,
        trial_ends_at: optional_timestamp(event_type, "trial_end", sub.trial_end)?,
        cancel_at_period_end: sub.cancel_at_period_end,
        canceled_at: optional_timestamp(event_type, "canceled_at", sub.canceled_at)?,
        tenant_hint: tenant_from_metadata(&sub.metadata),
    })
}

fn parse_object<T: DeserializeOwned>(event: &ProviderEvent) -> BillingResult<T> {
    serde_json::from_value(event.data.object.clone())
        .map_err(|e| BillingError::malformed(&event.event_type, e.to_string()))
}

fn timestamp(event_type: &str, field: &str, secs: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|_| BillingError::malformed(event_type, format!("{field} out of range: {secs}")))
}

fn optional_timestamp(
    event_type: &str,
    field: &str,
    secs: Option<i64>,
) -> BillingResult<Option<OffsetDateTime>> {
    secs.map(|s| timestamp(event_type, field, s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{provider_event, subscription_json, ts, StaticProviderClient, DAY, T0};
    use serde_json::json;

    fn normalizer() -> EventNormalizer<StaticProviderClient> {
        EventNormalizer::new(StaticProviderClient::default())
    }

    #[tokio::test]
    async fn test_subscription_updated_snapshot() {
        let ws = WorkspaceId::new();
        let mut object = subscription_json("sub_1", "price_growth_month", T0);
        object["metadata"] = json!({ "workspace_id": ws.to_string() });
        object["trial_start"] = json!(T0);
        object["trial_end"] = json!(T0 + 14 * DAY);
        object["cancel_at_period_end"] = json!(true);

        let event = provider_event("evt_1", "customer.subscription.updated", T0 + 5, object);
        let normalized = normalizer().normalize(&event).await.unwrap();

        let NormalizedEvent::SubscriptionUpdated(update) = normalized else {
            panic!("expected SubscriptionUpdated");
        };
        assert_eq!(update.event_id, "evt_1");
        assert_eq!(update.occurred_at, ts(T0 + 5));
        let snap = update.subscription;
        assert_eq!(snap.provider_subscription_id, "sub_1");
        assert_eq!(snap.provider_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(snap.price_id.as_deref(), Some("price_growth_month"));
        assert_eq!(snap.price_amount, Some(4900));
        assert_eq!(snap.currency.as_deref(), Some("usd"));
        assert_eq!(snap.interval, Some(BillingInterval::Month));
        assert_eq!(snap.status, "active");
        assert!(snap.provider_active);
        assert_eq!(snap.period_starts_at, ts(T0));
        assert_eq!(snap.period_ends_at, ts(T0 + 30 * DAY));
        assert_eq!(snap.trial_ends_at, Some(ts(T0 + 14 * DAY)));
        assert!(snap.cancel_at_period_end);
        assert_eq!(snap.tenant_hint, Some(ws));
    }

    #[tokio::test]
    async fn test_subscription_created_maps_to_updated() {
        let object = subscription_json("sub_1", "price_growth_month", T0);
        let event = provider_event("evt_c", "customer.subscription.created", T0, object);
        let normalized = normalizer().normalize(&event).await.unwrap();
        assert_eq!(normalized.kind(), "subscription_updated");
    }

    #[tokio::test]
    async fn test_item_level_period_is_used_when_top_level_missing() {
        let mut object = subscription_json("sub_1", "price_growth_month", T0);
        object.as_object_mut().unwrap().remove("current_period_start");
        object.as_object_mut().unwrap().remove("current_period_end");
        object["items"]["data"][0]["current_period_start"] = json!(T0 + DAY);
        object["items"]["data"][0]["current_period_end"] = json!(T0 + 31 * DAY);

        let event = provider_event("evt_1", "customer.subscription.updated", T0, object);
        let NormalizedEvent::SubscriptionUpdated(update) = normalizer().normalize(&event).await.unwrap() else {
            panic!("expected SubscriptionUpdated");
        };
        assert_eq!(update.subscription.period_starts_at, ts(T0 + DAY));
        assert_eq!(update.subscription.period_ends_at, ts(T0 + 31 * DAY));
    }

    #[tokio::test]
    async fn test_missing_period_is_malformed() {
        let mut object = subscription_json("sub_1", "price_growth_month", T0);
        object.as_object_mut().unwrap().remove("current_period_start");

        let event = provider_event("evt_1", "customer.subscription.updated", T0, object);
        let err = normalizer().normalize(&event).await.unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_ended_subscription_is_not_provider_active() {
        let mut object = subscription_json("sub_1", "price_growth_month", T0);
        object["ended_at"] = json!(T0 + DAY);

        let event = provider_event("evt_1", "customer.subscription.updated", T0, object);
        let NormalizedEvent::SubscriptionUpdated(update) = normalizer().normalize(&event).await.unwrap() else {
            panic!("expected SubscriptionUpdated");
        };
        assert!(!update.subscription.provider_active);
    }

    #[tokio::test]
    async fn test_checkout_with_expanded_subscription() {
        let ws = WorkspaceId::new();
        let session = json!({
            "id": "cs_1",
            "object": "checkout.session",
            "client_reference_id": ws.to_string(),
            "customer": "cus_1",
            "subscription": subscription_json("sub_1", "price_growth_month", T0),
        });
        let normalizer = normalizer();
        let event = provider_event("evt_1", "checkout.session.completed", T0, session);

        let NormalizedEvent::CheckoutCompleted(checkout) = normalizer.normalize(&event).await.unwrap() else {
            panic!("expected CheckoutCompleted");
        };
        assert_eq!(checkout.explicit_tenant_id, Some(ws));
        assert_eq!(checkout.provider_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(checkout.subscription.provider_subscription_id, "sub_1");
        assert_eq!(normalizer.client().subscription_lookups(), 0);
    }

    #[tokio::test]
    async fn test_checkout_fetches_unexpanded_subscription() {
        let ws = WorkspaceId::new();
        let client = StaticProviderClient::default()
            .with_subscription(subscription_json("sub_9", "price_scale_year", T0));
        let normalizer = EventNormalizer::new(client);
        let session = json!({
            "id": "cs_1",
            "metadata": { "workspace_id": ws.to_string() },
            "subscription": "sub_9",
        });
        let event = provider_event("evt_1", "checkout.session.completed", T0, session);

        let NormalizedEvent::CheckoutCompleted(checkout) = normalizer.normalize(&event).await.unwrap() else {
            panic!("expected CheckoutCompleted");
        };
        assert_eq!(checkout.explicit_tenant_id, Some(ws));
        assert_eq!(checkout.subscription.price_id.as_deref(), Some("price_scale_year"));
        assert_eq!(checkout.subscription.interval, Some(BillingInterval::Year));
        // Falls back to the subscription's customer
        assert_eq!(checkout.provider_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(normalizer.client().subscription_lookups(), 1);
    }

    #[tokio::test]
    async fn test_checkout_with_bad_reference_has_no_tenant() {
        let session = json!({
            "id": "cs_1",
            "client_reference_id": "workspace-42",
            "subscription": subscription_json("sub_1", "price_growth_month", T0),
        });
        let event = provider_event("evt_1", "checkout.session.completed", T0, session);
        let NormalizedEvent::CheckoutCompleted(checkout) = normalizer().normalize(&event).await.unwrap() else {
            panic!("expected CheckoutCompleted");
        };
        assert_eq!(checkout.explicit_tenant_id, None);
    }

    #[tokio::test]
    async fn test_one_time_checkout_is_unsupported() {
        let session = json!({ "id": "cs_1", "mode": "payment" });
        let event = provider_event("evt_1", "checkout.session.completed", T0, session);
        let err = normalizer().normalize(&event).await.unwrap_err();
        assert!(matches!(err, BillingError::UnsupportedEventType(_)));
    }

    #[tokio::test]
    async fn test_provider_failure_during_checkout_is_retryable() {
        let session = json!({ "id": "cs_1", "subscription": "sub_missing" });
        let event = provider_event("evt_1", "checkout.session.completed", T0, session);
        let err = normalizer().normalize(&event).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_subscription_deleted_needs_only_id() {
        let event = provider_event(
            "evt_1",
            "customer.subscription.deleted",
            T0,
            json!({ "id": "sub_1", "status": "canceled" }),
        );
        let normalized = normalizer().normalize(&event).await.unwrap();
        assert_eq!(
            normalized,
            NormalizedEvent::SubscriptionDeleted(SubscriptionDeleted {
                event_id: "evt_1".to_string(),
                occurred_at: ts(T0),
                provider_subscription_id: "sub_1".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_customer_events() {
        let ws = WorkspaceId::new();
        let created = provider_event(
            "evt_1",
            "customer.created",
            T0,
            json!({
                "id": "cus_1",
                "email": "billing@acme.test",
                "metadata": { "workspace_id": ws.to_string() },
            }),
        );
        let NormalizedEvent::CustomerUpserted(upsert) = normalizer().normalize(&created).await.unwrap() else {
            panic!("expected CustomerUpserted");
        };
        assert_eq!(upsert.provider_customer_id, "cus_1");
        assert_eq!(upsert.email.as_deref(), Some("billing@acme.test"));
        assert_eq!(upsert.tenant_hint, Some(ws));

        let deleted = provider_event(
            "evt_2",
            "customer.deleted",
            T0 + 1,
            json!({ "id": "cus_1", "deleted": true }),
        );
        let normalized = normalizer().normalize(&deleted).await.unwrap();
        assert_eq!(normalized.kind(), "customer_deleted");
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_unsupported() {
        let event = provider_event("evt_1", "invoice.paid", T0, json!({ "id": "in_1" }));
        match normalizer().normalize(&event).await {
            Err(BillingError::UnsupportedEventType(t)) => assert_eq!(t, "invoice.paid"),
            other => panic!("expected UnsupportedEventType, got {other:?}"),
        }
    }
}

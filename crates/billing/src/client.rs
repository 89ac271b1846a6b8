//! Provider API client
//!
//! The engine only needs two reads from the provider: the subscription behind
//! a completed checkout session, and a past event for replay. The client is
//! constructed once and injected; there is no process-wide instance.

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::ReconcileConfig;
use crate::error::{BillingError, BillingResult};
use crate::provider::{ProviderEvent, ProviderSubscription};

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<ProviderSubscription>;

    async fn retrieve_event(&self, event_id: &str) -> BillingResult<ProviderEvent>;
}

/// Stripe-backed provider client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
}

impl StripeClient {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            inner: stripe::Client::new(secret_key),
        }
    }

    pub fn from_config(config: &ReconcileConfig) -> BillingResult<Self> {
        Ok(Self::new(config.require_stripe_secret_key()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }
}

#[async_trait]
impl ProviderClient for StripeClient {
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<ProviderSubscription> {
        let id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::malformed("subscription", format!("invalid id {subscription_id}: {e}")))?;

        let subscription = stripe::Subscription::retrieve(&self.inner, &id, &[]).await?;

        tracing::debug!(
            provider_subscription_id = %subscription_id,
            "Retrieved subscription from provider"
        );

        reshape("subscription", &subscription)
    }

    async fn retrieve_event(&self, event_id: &str) -> BillingResult<ProviderEvent> {
        let id = event_id
            .parse::<stripe::EventId>()
            .map_err(|e| BillingError::malformed("event", format!("invalid id {event_id}: {e}")))?;

        let event = stripe::Event::retrieve(&self.inner, &id, &[]).await?;

        reshape("event", &event)
    }
}

/// Re-read an SDK object through its JSON form into the engine's payload type
fn reshape<T, U>(kind: &str, value: &T) -> BillingResult<U>
where
    T: serde::Serialize,
    U: DeserializeOwned,
{
    let json = serde_json::to_value(value).map_err(|e| BillingError::malformed(kind, e.to_string()))?;
    serde_json::from_value(json).map_err(|e| BillingError::malformed(kind, e.to_string()))
}

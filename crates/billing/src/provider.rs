//! Provider (Stripe) event payloads
//!
//! These mirror the subset of the provider's JSON the engine reads. Payloads
//! arrive already signature-verified; unknown fields are ignored.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};

/// A provider event as delivered to the webhook endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix timestamp when the provider created the event
    pub created: i64,
    pub data: ProviderEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEventData {
    pub object: serde_json::Value,
}

/// Treat an explicit `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A reference that is either a bare id or the expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

/// Minimal shape of any expandable object: only its id is read
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectRef {
    pub id: String,
}

impl Expandable<ObjectRef> {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object(obj) => &obj.id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for ProviderList<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Expandable<ObjectRef>>,
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_start: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: ProviderList<ProviderSubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscriptionItem {
    #[serde(default)]
    pub price: Option<ProviderPrice>,
    /// Newer API versions report the period on the item instead of the
    /// subscription
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderPrice {
    pub id: String,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub recurring: Option<ProviderRecurring>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRecurring {
    pub interval: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCheckoutSession {
    pub id: String,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub customer: Option<Expandable<ObjectRef>>,
    #[serde(default)]
    pub subscription: Option<Expandable<ProviderSubscription>>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
}

//! Event entry point
//!
//! [`BillingReconciler`] runs one verified provider event through the
//! normalizer and the reconciliation engine and reports what the caller
//! should do with it. Transport and signature verification happen upstream.

use crate::catalog::PlanCatalog;
use crate::client::ProviderClient;
use crate::config::ReconcileConfig;
use crate::error::{BillingError, BillingResult};
use crate::normalizer::EventNormalizer;
use crate::provider::ProviderEvent;
use crate::reconcile::{ApplyOutcome, ReconciliationEngine};
use crate::store::TenantStore;

pub struct BillingReconciler<S, C> {
    normalizer: EventNormalizer<C>,
    engine: ReconciliationEngine<S>,
}

impl<S: TenantStore, C: ProviderClient> BillingReconciler<S, C> {
    pub fn new(store: S, client: C, catalog: PlanCatalog, config: &ReconcileConfig) -> Self {
        Self {
            normalizer: EventNormalizer::new(client),
            engine: ReconciliationEngine::new(store, catalog, config),
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine<S> {
        &self.engine
    }

    pub fn normalizer(&self) -> &EventNormalizer<C> {
        &self.normalizer
    }

    /// Normalize and apply one provider event.
    ///
    /// Errors are returned unchanged; use [`BillingError::disposition`] to
    /// decide between redelivery and dropping the event.
    pub async fn handle(&self, event: &ProviderEvent) -> BillingResult<ApplyOutcome> {
        let result = match self.normalizer.normalize(event).await {
            Ok(normalized) => self.engine.apply(&normalized).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(outcome) => {
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = ?outcome,
                    "Billing event handled"
                );
            }
            Err(BillingError::UnsupportedEventType(_)) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Unhandled event type, ignoring"
                );
            }
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Billing event failed, will be retried"
                );
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Billing event cannot be applied, dropping event"
                );
            }
        }

        result
    }

    /// Fetch a past event from the provider and handle it again
    pub async fn replay(&self, event_id: &str) -> BillingResult<ApplyOutcome> {
        let event = self.normalizer.client().retrieve_event(event_id).await?;
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Replaying billing event"
        );
        self.handle(&event).await
    }
}

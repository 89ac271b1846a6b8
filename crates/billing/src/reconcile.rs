//! Reconciliation core
//!
//! Applies normalized billing events to the tenant store. Every write happens
//! inside a per-workspace unit of work, so the ordering check, the usage
//! reset and the mirror update observe and produce one consistent state.
//!
//! Ordering is decided by the subscription's period start: an event whose
//! period starts before the stored one is stale. Within one period the
//! provider timestamp breaks ties, and an exact replay re-applies the same
//! values.

use std::future::Future;
use std::time::Duration;

use time::OffsetDateTime;

use brandbase_shared::{BillingInterval, Subscription, WorkspaceId, WorkspaceStatus};

use crate::catalog::{PlanCatalog, ResolvedPlan};
use crate::config::ReconcileConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutCompleted, CustomerDeleted, CustomerUpserted, NormalizedEvent, SubscriptionDeleted,
    SubscriptionSnapshot, SubscriptionUpdated,
};
use crate::status::{map_provider_status, StatusMapping};
use crate::store::{CustomerFields, TenantStore, WorkspaceFields, WorkspaceTx};
use crate::usage::rollover_reset;

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        workspace_id: WorkspaceId,
        usage_reset: bool,
    },
    /// The event is older than the stored state and was discarded
    Stale { workspace_id: WorkspaceId },
    NoOp(NoOpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// Deletion of a subscription with no row
    SubscriptionAbsent,
    /// Customer event that maps to no workspace
    UnknownCustomer,
    /// Customer event older than the last one applied
    CustomerEventSuperseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncSource {
    Checkout,
    Update,
}

pub struct ReconciliationEngine<S> {
    store: S,
    catalog: PlanCatalog,
    store_timeout: Duration,
}

impl<S: TenantStore> ReconciliationEngine<S> {
    pub fn new(store: S, catalog: PlanCatalog, config: &ReconcileConfig) -> Self {
        Self {
            store,
            catalog,
            store_timeout: config.store_timeout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Apply one normalized event
    pub async fn apply(&self, event: &NormalizedEvent) -> BillingResult<ApplyOutcome> {
        match event {
            NormalizedEvent::CheckoutCompleted(e) => self.apply_checkout(e).await,
            NormalizedEvent::SubscriptionUpdated(e) => self.apply_subscription_updated(e).await,
            NormalizedEvent::SubscriptionDeleted(e) => self.apply_subscription_deleted(e).await,
            NormalizedEvent::CustomerUpserted(e) => self.apply_customer_upserted(e).await,
            NormalizedEvent::CustomerDeleted(e) => self.apply_customer_deleted(e).await,
        }
    }

    async fn apply_checkout(&self, event: &CheckoutCompleted) -> BillingResult<ApplyOutcome> {
        let workspace_id = event
            .explicit_tenant_id
            .ok_or_else(|| BillingError::MissingTenantReference {
                event_id: event.event_id.clone(),
            })?;

        let provider_subscription_id = &event.subscription.provider_subscription_id;
        let existing = self
            .bounded(
                "get_subscription_by_provider_id",
                self.store.get_subscription_by_provider_id(provider_subscription_id),
            )
            .await?;

        if let Some(existing) = existing {
            if existing.workspace_id != workspace_id {
                return Err(BillingError::SubscriptionOwnershipConflict {
                    provider_subscription_id: provider_subscription_id.clone(),
                    owner: existing.workspace_id,
                });
            }
        }

        self.sync_subscription(
            SyncSource::Checkout,
            workspace_id,
            &event.event_id,
            event.occurred_at,
            &event.subscription,
            event.provider_customer_id.as_deref(),
        )
        .await
    }

    async fn apply_subscription_updated(&self, event: &SubscriptionUpdated) -> BillingResult<ApplyOutcome> {
        let snapshot = &event.subscription;
        let existing = self
            .bounded(
                "get_subscription_by_provider_id",
                self.store
                    .get_subscription_by_provider_id(&snapshot.provider_subscription_id),
            )
            .await?;

        let workspace_id = match (existing, snapshot.tenant_hint) {
            (Some(row), _) => row.workspace_id,
            (None, Some(hint)) => {
                tracing::info!(
                    event_id = %event.event_id,
                    provider_subscription_id = %snapshot.provider_subscription_id,
                    workspace_id = %hint,
                    "No subscription row; resolving workspace from metadata"
                );
                hint
            }
            (None, None) => {
                return Err(BillingError::UnresolvedWorkspace {
                    event_id: event.event_id.clone(),
                    provider_subscription_id: snapshot.provider_subscription_id.clone(),
                })
            }
        };

        self.sync_subscription(
            SyncSource::Update,
            workspace_id,
            &event.event_id,
            event.occurred_at,
            snapshot,
            None,
        )
        .await
    }

    /// Upsert the subscription mirror for `workspace_id` under its lock
    async fn sync_subscription(
        &self,
        source: SyncSource,
        workspace_id: WorkspaceId,
        event_id: &str,
        occurred_at: OffsetDateTime,
        snapshot: &SubscriptionSnapshot,
        checkout_customer_id: Option<&str>,
    ) -> BillingResult<ApplyOutcome> {
        let mut tx = self.bounded("begin", self.store.begin(workspace_id)).await?;
        let current = self.bounded("load_subscription", tx.subscription()).await?;

        if let Some(stored) = &current {
            if is_stale(stored, snapshot, occurred_at) {
                tracing::warn!(
                    event_id = %event_id,
                    workspace_id = %workspace_id,
                    provider_subscription_id = %snapshot.provider_subscription_id,
                    stored_subscription_id = %stored.provider_subscription_id,
                    event_period_start = %snapshot.period_starts_at,
                    stored_period_start = %stored.period_starts_at,
                    "Discarding stale subscription event"
                );
                return Ok(ApplyOutcome::Stale { workspace_id });
            }
        } else if is_tombstoned(&*tx, snapshot) {
            tracing::warn!(
                event_id = %event_id,
                workspace_id = %workspace_id,
                provider_subscription_id = %snapshot.provider_subscription_id,
                "Discarding event for a deleted subscription"
            );
            return Ok(ApplyOutcome::Stale { workspace_id });
        }

        let plan = self.resolve_plan(event_id, snapshot);
        let interval = if plan.matched {
            plan.interval
        } else {
            snapshot.interval.unwrap_or(BillingInterval::Month)
        };

        let (status, mapping) = map_provider_status(&snapshot.status, snapshot.provider_active);
        if mapping == StatusMapping::Fallback {
            tracing::warn!(
                event_id = %event_id,
                workspace_id = %workspace_id,
                provider_status = %snapshot.status,
                provider_active = snapshot.provider_active,
                "Unrecognized provider status, falling back to active"
            );
        }

        let provider_customer_id = checkout_customer_id
            .map(str::to_string)
            .or_else(|| snapshot.provider_customer_id.clone());

        let subscription = Subscription {
            provider_subscription_id: snapshot.provider_subscription_id.clone(),
            workspace_id,
            provider_customer_id: provider_customer_id.clone(),
            price_id: snapshot.price_id.clone(),
            plan_id: plan.plan_id.clone(),
            billing_interval: interval,
            status,
            is_active: status.is_active(),
            price_amount: snapshot.price_amount,
            currency: snapshot.currency.clone(),
            period_starts_at: snapshot.period_starts_at,
            period_ends_at: snapshot.period_ends_at,
            trial_starts_at: snapshot.trial_starts_at,
            trial_ends_at: snapshot.trial_ends_at,
            cancel_at_period_end: snapshot.cancel_at_period_end,
            canceled_at: snapshot.canceled_at,
            last_event_at: occurred_at,
        };

        let fields = WorkspaceFields {
            provider_customer_id,
            provider_subscription_id: snapshot.provider_subscription_id.clone(),
            plan_id: plan.plan_id.clone(),
            plan_name: plan.plan_name.clone(),
            billing_interval: interval,
            status,
            price_amount: snapshot.price_amount,
            currency: snapshot.currency.clone(),
            trial_starts_at: snapshot.trial_starts_at,
            trial_ends_at: snapshot.trial_ends_at,
            period_starts_at: snapshot.period_starts_at,
            period_ends_at: snapshot.period_ends_at,
            cancel_at_period_end: snapshot.cancel_at_period_end,
            limits: plan.limits.to_persisted(),
        };

        self.bounded(
            "upsert_subscription_and_workspace",
            tx.upsert_subscription_and_workspace(&subscription, &fields),
        )
        .await?;

        let reset = match source {
            SyncSource::Update => rollover_reset(
                current
                    .as_ref()
                    .filter(|stored| stored.provider_subscription_id == snapshot.provider_subscription_id),
                snapshot.period_starts_at,
                snapshot.period_ends_at,
                OffsetDateTime::now_utc(),
            ),
            SyncSource::Checkout => None,
        };
        if let Some(reset) = &reset {
            self.bounded("reset_usage", tx.reset_usage(reset)).await?;
        }

        self.bounded("commit", tx.commit()).await?;

        tracing::info!(
            event_id = %event_id,
            workspace_id = %workspace_id,
            provider_subscription_id = %snapshot.provider_subscription_id,
            plan_id = %plan.plan_id,
            status = %status,
            usage_reset = reset.is_some(),
            "Applied subscription state"
        );

        Ok(ApplyOutcome::Applied {
            workspace_id,
            usage_reset: reset.is_some(),
        })
    }

    async fn apply_subscription_deleted(&self, event: &SubscriptionDeleted) -> BillingResult<ApplyOutcome> {
        let existing = self
            .bounded(
                "get_subscription_by_provider_id",
                self.store
                    .get_subscription_by_provider_id(&event.provider_subscription_id),
            )
            .await?;

        let Some(existing) = existing else {
            tracing::info!(
                event_id = %event.event_id,
                provider_subscription_id = %event.provider_subscription_id,
                "Subscription already absent, nothing to delete"
            );
            return Ok(ApplyOutcome::NoOp(NoOpReason::SubscriptionAbsent));
        };

        let workspace_id = existing.workspace_id;
        let mut tx = self.bounded("begin", self.store.begin(workspace_id)).await?;
        let current = self.bounded("load_subscription", tx.subscription()).await?;

        // Re-check under the lock; a concurrent delete or replacement wins
        let still_owned = current
            .as_ref()
            .is_some_and(|row| row.provider_subscription_id == event.provider_subscription_id);
        if !still_owned {
            return Ok(ApplyOutcome::NoOp(NoOpReason::SubscriptionAbsent));
        }

        self.bounded(
            "delete_subscription_and_cancel_workspace",
            tx.delete_subscription_and_cancel_workspace(),
        )
        .await?;
        self.bounded("commit", tx.commit()).await?;

        tracing::info!(
            event_id = %event.event_id,
            workspace_id = %workspace_id,
            provider_subscription_id = %event.provider_subscription_id,
            "Subscription deleted, workspace canceled"
        );

        Ok(ApplyOutcome::Applied {
            workspace_id,
            usage_reset: false,
        })
    }

    async fn apply_customer_upserted(&self, event: &CustomerUpserted) -> BillingResult<ApplyOutcome> {
        let by_customer = self
            .bounded(
                "find_workspace_by_customer_id",
                self.store.find_workspace_by_customer_id(&event.provider_customer_id),
            )
            .await?;

        let workspace_id = match (by_customer, event.tenant_hint) {
            (Some(ws), _) => ws.id,
            (None, Some(hint)) => hint,
            (None, None) => return Ok(self.unknown_customer(&event.event_id, &event.provider_customer_id)),
        };

        let mut tx = match self.bounded("begin", self.store.begin(workspace_id)).await {
            Ok(tx) => tx,
            Err(BillingError::WorkspaceNotFound(_)) => {
                return Ok(self.unknown_customer(&event.event_id, &event.provider_customer_id))
            }
            Err(e) => return Err(e),
        };

        if let Some(outcome) = superseded(&*tx, &event.event_id, event.occurred_at) {
            return Ok(outcome);
        }

        let fields = CustomerFields {
            provider_customer_id: Some(event.provider_customer_id.clone()),
            billing_email: event.email.clone(),
            synced_at: event.occurred_at,
        };
        self.bounded("mirror_customer", tx.mirror_customer(&fields)).await?;
        self.bounded("commit", tx.commit()).await?;

        tracing::info!(
            event_id = %event.event_id,
            workspace_id = %workspace_id,
            provider_customer_id = %event.provider_customer_id,
            "Mirrored customer"
        );

        Ok(ApplyOutcome::Applied {
            workspace_id,
            usage_reset: false,
        })
    }

    async fn apply_customer_deleted(&self, event: &CustomerDeleted) -> BillingResult<ApplyOutcome> {
        let by_customer = self
            .bounded(
                "find_workspace_by_customer_id",
                self.store.find_workspace_by_customer_id(&event.provider_customer_id),
            )
            .await?;

        let Some(workspace) = by_customer else {
            return Ok(self.unknown_customer(&event.event_id, &event.provider_customer_id));
        };

        let workspace_id = workspace.id;
        let mut tx = self.bounded("begin", self.store.begin(workspace_id)).await?;

        if let Some(outcome) = superseded(&*tx, &event.event_id, event.occurred_at) {
            return Ok(outcome);
        }
        if tx.workspace().provider_customer_id.as_deref() != Some(event.provider_customer_id.as_str()) {
            return Ok(self.unknown_customer(&event.event_id, &event.provider_customer_id));
        }

        let fields = CustomerFields {
            provider_customer_id: None,
            billing_email: None,
            synced_at: event.occurred_at,
        };
        self.bounded("mirror_customer", tx.mirror_customer(&fields)).await?;
        self.bounded("commit", tx.commit()).await?;

        tracing::info!(
            event_id = %event.event_id,
            workspace_id = %workspace_id,
            provider_customer_id = %event.provider_customer_id,
            "Cleared deleted customer"
        );

        Ok(ApplyOutcome::Applied {
            workspace_id,
            usage_reset: false,
        })
    }

    fn resolve_plan(&self, event_id: &str, snapshot: &SubscriptionSnapshot) -> ResolvedPlan {
        let price_id = snapshot.price_id.as_deref().unwrap_or_default();
        let plan = self.catalog.resolve_plan(price_id);
        if !plan.matched {
            tracing::warn!(
                event_id = %event_id,
                provider_subscription_id = %snapshot.provider_subscription_id,
                price_id = %price_id,
                fallback_plan = %plan.plan_id,
                "Unknown price, falling back to lowest tier"
            );
        }
        plan
    }

    fn unknown_customer(&self, event_id: &str, provider_customer_id: &str) -> ApplyOutcome {
        tracing::debug!(
            event_id = %event_id,
            provider_customer_id = %provider_customer_id,
            "Customer event for unknown workspace ignored"
        );
        ApplyOutcome::NoOp(NoOpReason::UnknownCustomer)
    }

    /// Bound one store call by the configured timeout
    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> BillingResult<T>
    where
        F: Future<Output = BillingResult<T>>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = u64::try_from(self.store_timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::error!(operation, timeout_ms, "Tenant store call timed out");
                Err(BillingError::StoreTimeout { operation, timeout_ms })
            }
        }
    }
}

/// An event is stale when its period started before the stored one, or when
/// it is older than the last applied event within the same period.
///
/// Periods of different provider subscriptions are unrelated, so an event for
/// a subscription other than the stored one only replaces it when it is
/// strictly newer than the last applied event.
fn is_stale(stored: &Subscription, snapshot: &SubscriptionSnapshot, occurred_at: OffsetDateTime) -> bool {
    if stored.provider_subscription_id != snapshot.provider_subscription_id {
        return occurred_at <= stored.last_event_at;
    }
    snapshot.period_starts_at < stored.period_starts_at
        || (snapshot.period_starts_at == stored.period_starts_at && occurred_at < stored.last_event_at)
}

/// A canceled workspace still linked to this subscription id means the
/// subscription was deleted; late events for it must not resurrect the row.
fn is_tombstoned(tx: &dyn WorkspaceTx, snapshot: &SubscriptionSnapshot) -> bool {
    let workspace = tx.workspace();
    workspace.status == WorkspaceStatus::Canceled
        && workspace.provider_subscription_id.as_deref() == Some(snapshot.provider_subscription_id.as_str())
}

/// Last-write-wins guard for customer events
fn superseded(tx: &dyn WorkspaceTx, event_id: &str, occurred_at: OffsetDateTime) -> Option<ApplyOutcome> {
    let workspace = tx.workspace();
    let synced_at = workspace.customer_synced_at?;
    if occurred_at < synced_at {
        tracing::warn!(
            event_id = %event_id,
            workspace_id = %workspace.id,
            "Customer event older than last sync, ignoring"
        );
        return Some(ApplyOutcome::NoOp(NoOpReason::CustomerEventSuperseded));
    }
    None
}

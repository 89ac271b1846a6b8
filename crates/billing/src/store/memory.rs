//! In-memory tenant store
//!
//! Used by tests and local tooling. Each workspace has its own async lock;
//! a unit of work edits private copies of the workspace and subscription and
//! publishes them on commit, so an uncommitted unit of work leaves no trace.
//! Commit enforces the same uniqueness rules as the database schema.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use brandbase_shared::{Subscription, Workspace, WorkspaceId, WorkspaceStatus};

use super::{CustomerFields, TenantStore, WorkspaceFields, WorkspaceTx};
use crate::error::{BillingError, BillingResult};
use crate::usage::UsageReset;

#[derive(Debug, Default)]
struct Tables {
    workspaces: HashMap<WorkspaceId, Workspace>,
    /// Keyed by owning workspace; at most one subscription per workspace
    subscriptions: HashMap<WorkspaceId, Subscription>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_commits: usize,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: Mutex<Tables>,
    locks: Mutex<HashMap<WorkspaceId, Arc<tokio::sync::Mutex<()>>>>,
    faults: Mutex<Faults>,
    commits: AtomicUsize,
    usage_resets: AtomicUsize,
}

/// Shared, cloneable in-memory store
#[derive(Debug, Clone, Default)]
pub struct InMemoryTenantStore {
    inner: Arc<Inner>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a workspace row
    pub fn insert_workspace(&self, workspace: Workspace) {
        locked(&self.inner.tables).workspaces.insert(workspace.id, workspace);
    }

    /// Insert a freshly provisioned workspace and return its id
    pub fn provision_workspace(&self) -> WorkspaceId {
        let id = WorkspaceId::new();
        self.insert_workspace(Workspace::provisioned(id));
        id
    }

    /// Insert or replace a subscription row, bypassing the unit of work
    pub fn insert_subscription(&self, subscription: Subscription) {
        locked(&self.inner.tables)
            .subscriptions
            .insert(subscription.workspace_id, subscription);
    }

    pub fn workspace(&self, id: WorkspaceId) -> Option<Workspace> {
        locked(&self.inner.tables).workspaces.get(&id).cloned()
    }

    pub fn subscription_for(&self, id: WorkspaceId) -> Option<Subscription> {
        locked(&self.inner.tables).subscriptions.get(&id).cloned()
    }

    pub fn subscription_count(&self) -> usize {
        locked(&self.inner.tables).subscriptions.len()
    }

    /// Overwrite the monthly usage counters of a workspace
    pub fn set_usage(&self, id: WorkspaceId, api_calls: i64, ai_credits: i64, insights_queries: i64) {
        if let Some(ws) = locked(&self.inner.tables).workspaces.get_mut(&id) {
            ws.usage_api_calls_count = api_calls;
            ws.usage_ai_credits_used = ai_credits;
            ws.usage_insights_queries_count = insights_queries;
        }
    }

    /// Make the next `count` commits fail with a database error
    pub fn fail_next_commits(&self, count: usize) {
        locked(&self.inner.faults).failing_commits = count;
    }

    /// Delay every store operation by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        locked(&self.inner.faults).latency = latency;
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Number of usage resets that were committed
    pub fn usage_reset_count(&self) -> usize {
        self.inner.usage_resets.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = locked(&self.inner.faults).latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn workspace_lock(&self, id: WorkspaceId) -> Arc<tokio::sync::Mutex<()>> {
        locked(&self.inner.locks).entry(id).or_default().clone()
    }

    fn take_commit_fault(&self) -> bool {
        let mut faults = locked(&self.inner.faults);
        if faults.failing_commits > 0 {
            faults.failing_commits -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn get_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        self.simulate_latency().await;
        Ok(locked(&self.inner.tables)
            .subscriptions
            .values()
            .find(|s| s.provider_subscription_id == provider_subscription_id)
            .cloned())
    }

    async fn get_workspace(&self, id: WorkspaceId) -> BillingResult<Option<Workspace>> {
        self.simulate_latency().await;
        Ok(self.workspace(id))
    }

    async fn find_workspace_by_customer_id(
        &self,
        provider_customer_id: &str,
    ) -> BillingResult<Option<Workspace>> {
        self.simulate_latency().await;
        Ok(locked(&self.inner.tables)
            .workspaces
            .values()
            .find(|w| w.provider_customer_id.as_deref() == Some(provider_customer_id))
            .cloned())
    }

    async fn begin(&self, workspace_id: WorkspaceId) -> BillingResult<Box<dyn WorkspaceTx>> {
        self.simulate_latency().await;

        let guard = self.workspace_lock(workspace_id).lock_owned().await;

        let (workspace, subscription) = {
            let tables = locked(&self.inner.tables);
            let workspace = tables
                .workspaces
                .get(&workspace_id)
                .cloned()
                .ok_or(BillingError::WorkspaceNotFound(workspace_id))?;
            (workspace, tables.subscriptions.get(&workspace_id).cloned())
        };

        Ok(Box::new(InMemoryWorkspaceTx {
            store: self.clone(),
            _guard: guard,
            snapshot: workspace.clone(),
            workspace,
            subscription,
            resets: 0,
            committed: false,
        }))
    }
}

struct InMemoryWorkspaceTx {
    store: InMemoryTenantStore,
    _guard: OwnedMutexGuard<()>,
    /// Workspace as read at begin
    snapshot: Workspace,
    workspace: Workspace,
    subscription: Option<Subscription>,
    resets: usize,
    committed: bool,
}

impl InMemoryWorkspaceTx {
    fn ensure_open(&self) -> BillingResult<()> {
        if self.committed {
            return Err(BillingError::Database("unit of work already committed".into()));
        }
        Ok(())
    }

    fn check_unique(&self, tables: &Tables) -> BillingResult<()> {
        let id = self.workspace.id;

        if let Some(sub) = &self.subscription {
            let taken = tables
                .subscriptions
                .values()
                .any(|s| s.workspace_id != id && s.provider_subscription_id == sub.provider_subscription_id);
            if taken {
                return Err(BillingError::Database(format!(
                    "duplicate key value violates unique constraint: subscriptions.provider_subscription_id = {}",
                    sub.provider_subscription_id
                )));
            }
        }

        if let Some(provider_id) = &self.workspace.provider_subscription_id {
            let taken = tables
                .workspaces
                .values()
                .any(|w| w.id != id && w.provider_subscription_id.as_ref() == Some(provider_id));
            if taken {
                return Err(BillingError::Database(format!(
                    "duplicate key value violates unique constraint: workspaces.provider_subscription_id = {provider_id}"
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl WorkspaceTx for InMemoryWorkspaceTx {
    fn workspace(&self) -> &Workspace {
        &self.snapshot
    }

    async fn subscription(&mut self) -> BillingResult<Option<Subscription>> {
        self.ensure_open()?;
        self.store.simulate_latency().await;
        Ok(self.subscription.clone())
    }

    async fn upsert_subscription_and_workspace(
        &mut self,
        subscription: &Subscription,
        fields: &WorkspaceFields,
    ) -> BillingResult<()> {
        self.ensure_open()?;
        self.store.simulate_latency().await;
        self.subscription = Some(subscription.clone());
        fields.apply_to(&mut self.workspace);
        Ok(())
    }

    async fn reset_usage(&mut self, reset: &UsageReset) -> BillingResult<()> {
        self.ensure_open()?;
        self.store.simulate_latency().await;
        reset.apply_to(&mut self.workspace);
        self.resets += 1;
        Ok(())
    }

    async fn delete_subscription_and_cancel_workspace(&mut self) -> BillingResult<()> {
        self.ensure_open()?;
        self.store.simulate_latency().await;
        self.subscription = None;
        self.workspace.status = WorkspaceStatus::Canceled;
        Ok(())
    }

    async fn mirror_customer(&mut self, fields: &CustomerFields) -> BillingResult<()> {
        self.ensure_open()?;
        self.store.simulate_latency().await;
        fields.apply_to(&mut self.workspace);
        Ok(())
    }

    async fn commit(&mut self) -> BillingResult<()> {
        self.ensure_open()?;
        self.store.simulate_latency().await;

        if self.store.take_commit_fault() {
            return Err(BillingError::Database("connection reset during commit".into()));
        }

        let mut tables = locked(&self.store.inner.tables);
        self.check_unique(&tables)?;

        let id = self.workspace.id;
        tables.workspaces.insert(id, self.workspace.clone());
        match &self.subscription {
            Some(sub) => {
                tables.subscriptions.insert(id, sub.clone());
            }
            None => {
                tables.subscriptions.remove(&id);
            }
        }
        drop(tables);

        self.committed = true;
        self.store.inner.commits.fetch_add(1, Ordering::SeqCst);
        self.store.inner.usage_resets.fetch_add(self.resets, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{stored_subscription, ts, T0};
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_begin_unknown_workspace() {
        let store = InMemoryTenantStore::new();
        let missing = WorkspaceId::new();

        let result = store.begin(missing).await;

        assert!(matches!(result, Err(BillingError::WorkspaceNotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn test_dropped_unit_of_work_leaves_no_trace() {
        let store = InMemoryTenantStore::new();
        let ws = store.provision_workspace();

        {
            let mut tx = store.begin(ws).await.unwrap();
            tx.delete_subscription_and_cancel_workspace().await.unwrap();
        }

        assert_eq!(store.workspace(ws).unwrap().status, WorkspaceStatus::Inactive);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = InMemoryTenantStore::new();
        let ws = store.provision_workspace();
        let sub = stored_subscription(ws, "sub_1", T0);

        let mut tx = store.begin(ws).await.unwrap();
        tx.mirror_customer(&CustomerFields {
            provider_customer_id: Some("cus_1".into()),
            billing_email: Some("owner@example.com".into()),
            synced_at: ts(T0),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
        drop(tx);

        store.insert_subscription(sub.clone());

        let found = store.find_workspace_by_customer_id("cus_1").await.unwrap().unwrap();
        assert_eq!(found.id, ws);
        assert_eq!(found.billing_email.as_deref(), Some("owner@example.com"));
        assert_eq!(store.get_subscription_by_provider_id("sub_1").await.unwrap(), Some(sub));
    }

    #[tokio::test]
    async fn test_commit_rejects_duplicate_provider_subscription() {
        let store = InMemoryTenantStore::new();
        let owner = store.provision_workspace();
        let other = store.provision_workspace();
        store.insert_subscription(stored_subscription(owner, "sub_1", T0));

        let mut tx = store.begin(other).await.unwrap();
        let duplicate = stored_subscription(other, "sub_1", T0);
        tx.upsert_subscription_and_workspace(&duplicate, &crate::testing::workspace_fields(&duplicate))
            .await
            .unwrap();

        let result = tx.commit().await;

        assert!(matches!(result, Err(BillingError::Database(_))));
        assert!(store.subscription_for(other).is_none());
    }

    #[tokio::test]
    async fn test_injected_commit_failure() {
        let store = InMemoryTenantStore::new();
        let ws = store.provision_workspace();
        store.fail_next_commits(1);

        let mut tx = store.begin(ws).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_retryable());
        drop(tx);

        let mut tx = store.begin(ws).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_begin_waits_for_workspace_lock() {
        let store = InMemoryTenantStore::new();
        let ws = store.provision_workspace();
        let entered = Arc::new(AtomicBool::new(false));

        let first = store.begin(ws).await.unwrap();

        let waiter = {
            let store = store.clone();
            let entered = entered.clone();
            tokio::spawn(async move {
                let _tx = store.begin(ws).await.unwrap();
                entered.store(true, Ordering::SeqCst);
            })
        };

        tokio::task::yield_now().await;
        assert!(!entered.load(Ordering::SeqCst));

        drop(first);
        waiter.await.unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_other_workspaces_do_not_block() {
        let store = InMemoryTenantStore::new();
        let a = store.provision_workspace();
        let b = store.provision_workspace();

        let _held = store.begin(a).await.unwrap();
        let mut tx = store.begin(b).await.unwrap();
        tx.commit().await.unwrap();
    }
}

//! Steward reconcile: the generic Observe→(Create|Update|Delete) loop.
//!
//! Every resource kind plugs the same state machine through
//! [`ExternalClient`]; the engine owns condition management, status
//! persistence, the idempotency contract around asynchronous operations,
//! and deletion-policy handling. Re-entrancy is the rule: any step may be
//! repeated on the next poll, so state is always re-derived from the
//! external system rather than trusted from local cache.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use steward_client::api::OperationStatus;
use steward_client::ApiError;
use steward_core::{
    ConditionStatus, ConditionType, DeletionPolicy, ManagedResource, ResourceKey,
};
use steward_resolve::ResolveError;
use steward_store::{Store, StoreError};
use steward_track::TrackedOperation;
use tracing::{debug, info, warn};

pub mod kinds;
pub mod scheduler;

pub use scheduler::{Scheduler, SchedulerOptions};

/// What Observe learned about the external object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub resource_exists: bool,
    pub resource_up_to_date: bool,
}

impl Observation {
    pub fn missing() -> Self {
        Self { resource_exists: false, resource_up_to_date: false }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("operation {id} ended with status {status:?}")]
    OperationFailed { id: String, status: OperationStatus },
    #[error("invalid spec: {0}")]
    Invariant(String),
    #[error("reconcile deadline exceeded")]
    Timeout,
}

impl ReconcileError {
    /// Whether the host scheduler should expect a retry to make progress.
    /// Invariant violations need user intervention and are reported, not
    /// retried productively.
    pub fn retryable(&self) -> bool {
        !matches!(self, ReconcileError::Invariant(_))
    }
}

/// The per-kind plug-in surface. `update` may be a no-op for create-once
/// kinds whose external API offers no in-place mutation.
#[async_trait::async_trait]
pub trait ExternalClient<S: Send + Sync + 'static>: Send + Sync {
    async fn observe(&self, cr: &mut ManagedResource<S>) -> Result<Observation, ReconcileError>;

    async fn create(&self, cr: &mut ManagedResource<S>) -> Result<(), ReconcileError>;

    async fn update(&self, cr: &mut ManagedResource<S>) -> Result<(), ReconcileError>;

    /// Must treat "already gone" as success.
    async fn delete(&self, cr: &mut ManagedResource<S>) -> Result<(), ReconcileError>;

    /// Kinds with asynchronous mutations override this to consult the
    /// operation tracker; the default covers synchronous kinds.
    async fn poll_operation(
        &self,
        _cr: &ManagedResource<S>,
    ) -> Result<Option<TrackedOperation>, ReconcileError> {
        Ok(None)
    }
}

/// Failure and lifecycle notifications surfaced to users.
pub trait EventRecorder: Send + Sync {
    fn normal(&self, key: &ResourceKey, reason: &str, message: &str);
    fn warning(&self, key: &ResourceKey, reason: &str, message: &str);
}

/// Default recorder: structured log lines.
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn normal(&self, key: &ResourceKey, reason: &str, message: &str) {
        info!(key = %key, reason, "{}", message);
    }

    fn warning(&self, key: &ResourceKey, reason: &str, message: &str) {
        warn!(key = %key, reason, "{}", message);
    }
}

/// Result of one reconcile pass over a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Record vanished from the store before we got to it.
    Gone,
    InSync,
    Created,
    Updated,
    Deleted,
    Orphaned,
    /// An asynchronous external operation is still in flight.
    AwaitingOperation,
}

/// The parameterized convergence engine. One instance per resource kind.
pub struct Reconciler<S: Clone + Send + Sync + 'static> {
    kind: &'static str,
    store: Arc<dyn Store<S>>,
    external: Arc<dyn ExternalClient<S>>,
    recorder: Arc<dyn EventRecorder>,
}

impl<S: Clone + Send + Sync + 'static> Reconciler<S> {
    pub fn new(
        kind: &'static str,
        store: Arc<dyn Store<S>>,
        external: Arc<dyn ExternalClient<S>>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self { kind, store, external, recorder }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn store(&self) -> &Arc<dyn Store<S>> {
        &self.store
    }

    /// One full pass: poll any in-flight operation, observe, then converge.
    pub async fn reconcile(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Outcome, ReconcileError> {
        counter!("reconcile_attempts", 1u64, "kind" => self.kind);
        let Some(mut cr) = self.store.get(namespace, name).await? else {
            return Ok(Outcome::Gone);
        };
        let key = cr.key();

        if cr.marked_for_deletion() {
            return self.finalize(&mut cr, &key).await;
        }

        // Gate on an in-flight asynchronous operation before anything else.
        if let Some(op) = self.external.poll_operation(&cr).await? {
            match op.status {
                s if !s.is_terminal() => {
                    debug!(key = %key, operation = %op.id, status = ?s, "operation still in flight");
                    // A confirmed object means the pending operation is a
                    // mutation, not the initial create.
                    let reason = if cr.status.external_id.is_some() { "Updating" } else { "Creating" };
                    cr.status.set_condition(ConditionType::Ready, ConditionStatus::False, reason);
                    self.store.update_status(&cr).await?;
                    return Ok(Outcome::AwaitingOperation);
                }
                OperationStatus::Succeeded => {
                    // Clear the handle before proceeding; if this write fails
                    // the next poll re-observes the terminal status and
                    // re-attempts the clear.
                    steward_track::clear(&mut cr);
                    self.store.update_status(&cr).await?;
                }
                status => {
                    steward_track::clear(&mut cr);
                    cr.status.set_condition(
                        ConditionType::Ready,
                        ConditionStatus::False,
                        "ReconcileError",
                    );
                    self.store.update_status(&cr).await?;
                    let detail = op.detail.unwrap_or_default();
                    self.recorder.warning(
                        &key,
                        "OperationFailed",
                        &format!("operation {} ended {:?}: {}", op.id, status, detail),
                    );
                    counter!("reconcile_operation_failures", 1u64, "kind" => self.kind);
                    return Err(ReconcileError::OperationFailed { id: op.id, status });
                }
            }
        }

        let obs = self.external.observe(&mut cr).await?;

        if obs.resource_exists {
            cr.status.set_condition(ConditionType::Ready, ConditionStatus::True, "Available");
            cr.status.set_condition(
                ConditionType::Synced,
                if obs.resource_up_to_date { ConditionStatus::True } else { ConditionStatus::False },
                if obs.resource_up_to_date { "InSync" } else { "OutOfSync" },
            );
            // Persist what Observe learned before mutating anything else.
            self.store.update_status(&cr).await?;
        }

        if !obs.resource_exists {
            // A handle left behind by a create whose response was lost means
            // the object may still materialize; never issue a second create.
            if steward_track::handle(&cr).is_some() {
                debug!(key = %key, "create already in flight; skipping");
                self.store.update_status(&cr).await?;
                return Ok(Outcome::AwaitingOperation);
            }
            // Append Creating before issuing the call so a crash mid-call is
            // observable on the next poll.
            cr.status.set_condition(ConditionType::Ready, ConditionStatus::False, "Creating");
            self.store.update_status(&cr).await?;
            self.external.create(&mut cr).await?;
            self.store.update_status(&cr).await?;
            self.recorder.normal(&key, "CreateIssued", "external create requested");
            counter!("reconcile_creates", 1u64, "kind" => self.kind);
            return Ok(Outcome::Created);
        }

        if !obs.resource_up_to_date {
            self.external.update(&mut cr).await?;
            self.store.update_status(&cr).await?;
            self.recorder.normal(&key, "Updated", "external object updated");
            counter!("reconcile_updates", 1u64, "kind" => self.kind);
            return Ok(Outcome::Updated);
        }

        Ok(Outcome::InSync)
    }

    async fn finalize(
        &self,
        cr: &mut ManagedResource<S>,
        key: &ResourceKey,
    ) -> Result<Outcome, ReconcileError> {
        let namespace = cr.meta.namespace.clone();
        let name = cr.meta.name.clone();
        if cr.deletion_policy == DeletionPolicy::Orphan {
            self.store.remove(namespace.as_deref(), &name).await?;
            self.recorder.normal(key, "Orphaned", "external object left in place");
            counter!("reconcile_orphans", 1u64, "kind" => self.kind);
            return Ok(Outcome::Orphaned);
        }
        cr.status.set_condition(ConditionType::Ready, ConditionStatus::False, "Deleting");
        self.store.update_status(cr).await?;
        self.external.delete(cr).await?;
        self.store.remove(namespace.as_deref(), &name).await?;
        self.recorder.normal(key, "Deleted", "external object deleted");
        counter!("reconcile_deletes", 1u64, "kind" => self.kind);
        Ok(Outcome::Deleted)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use steward_store::MemoryStore;
    use testutil::CapturingRecorder;

    #[derive(Debug, Clone, PartialEq)]
    struct WidgetSpec {
        name: String,
    }

    /// Scripted external client: each reconcile consumes the next observe
    /// result; mutations are counted.
    #[derive(Default)]
    struct ScriptedExternal {
        observations: Mutex<Vec<Observation>>,
        creates: Mutex<usize>,
        updates: Mutex<usize>,
        deletes: Mutex<usize>,
        delete_result: Mutex<Option<ReconcileError>>,
    }

    #[async_trait::async_trait]
    impl ExternalClient<WidgetSpec> for ScriptedExternal {
        async fn observe(
            &self,
            cr: &mut ManagedResource<WidgetSpec>,
        ) -> Result<Observation, ReconcileError> {
            let obs = self.observations.lock().unwrap().remove(0);
            if obs.resource_exists {
                cr.status.external_id = Some("ext-1".to_string());
            }
            Ok(obs)
        }

        async fn create(
            &self,
            _cr: &mut ManagedResource<WidgetSpec>,
        ) -> Result<(), ReconcileError> {
            *self.creates.lock().unwrap() += 1;
            Ok(())
        }

        async fn update(
            &self,
            _cr: &mut ManagedResource<WidgetSpec>,
        ) -> Result<(), ReconcileError> {
            *self.updates.lock().unwrap() += 1;
            Ok(())
        }

        async fn delete(
            &self,
            _cr: &mut ManagedResource<WidgetSpec>,
        ) -> Result<(), ReconcileError> {
            *self.deletes.lock().unwrap() += 1;
            match self.delete_result.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn engine(
        observations: Vec<Observation>,
    ) -> (Reconciler<WidgetSpec>, std::sync::Arc<MemoryStore<WidgetSpec>>, Arc<ScriptedExternal>)
    {
        let store = MemoryStore::new();
        let external = Arc::new(ScriptedExternal {
            observations: Mutex::new(observations),
            ..ScriptedExternal::default()
        });
        let rec = Reconciler::new(
            "widget",
            store.clone() as Arc<dyn Store<WidgetSpec>>,
            external.clone() as Arc<dyn ExternalClient<WidgetSpec>>,
            Arc::new(CapturingRecorder::default()),
        );
        (rec, store, external)
    }

    fn widget(name: &str) -> ManagedResource<WidgetSpec> {
        ManagedResource::new(None, name, WidgetSpec { name: name.to_string() })
    }

    #[tokio::test]
    async fn missing_record_is_gone_not_an_error() {
        let (rec, _store, _) = engine(vec![]);
        assert_eq!(rec.reconcile(None, "nope").await.unwrap(), Outcome::Gone);
    }

    #[tokio::test]
    async fn missing_external_object_drives_create() {
        let (rec, store, external) = engine(vec![Observation::missing()]);
        store.apply(widget("w")).await;
        assert_eq!(rec.reconcile(None, "w").await.unwrap(), Outcome::Created);
        assert_eq!(*external.creates.lock().unwrap(), 1);
        let cr = store.get(None, "w").await.unwrap().unwrap();
        let ready = cr.status.condition(ConditionType::Ready).unwrap();
        assert_eq!(ready.reason, "Creating");
        assert_eq!(ready.status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn observe_reflects_external_truth_across_polls() {
        // External side creates the object between two polls; no Create in
        // between, existence flips on its own.
        let (rec, store, external) = engine(vec![
            Observation::missing(),
            Observation { resource_exists: true, resource_up_to_date: true },
        ]);
        store.apply(widget("w")).await;
        assert_eq!(rec.reconcile(None, "w").await.unwrap(), Outcome::Created);
        assert_eq!(rec.reconcile(None, "w").await.unwrap(), Outcome::InSync);
        assert_eq!(*external.creates.lock().unwrap(), 1);
        let cr = store.get(None, "w").await.unwrap().unwrap();
        assert_eq!(cr.status.external_id.as_deref(), Some("ext-1"));
        let ready = cr.status.condition(ConditionType::Ready).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, "Available");
        assert_eq!(
            cr.status.condition(ConditionType::Synced).unwrap().status,
            ConditionStatus::True
        );
    }

    #[tokio::test]
    async fn out_of_sync_object_drives_update() {
        let (rec, store, external) =
            engine(vec![Observation { resource_exists: true, resource_up_to_date: false }]);
        store.apply(widget("w")).await;
        assert_eq!(rec.reconcile(None, "w").await.unwrap(), Outcome::Updated);
        assert_eq!(*external.updates.lock().unwrap(), 1);
        assert_eq!(*external.creates.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_operation_handle_suppresses_second_create() {
        // Simulates a create whose response was lost: the handle is on the
        // record but observe still reports missing.
        let (rec, store, external) =
            engine(vec![Observation::missing(), Observation::missing()]);
        store.apply(widget("w")).await;
        let mut cr = store.get(None, "w").await.unwrap().unwrap();
        steward_track::start_tracking(&mut cr, "op-lost");
        store.update_status(&cr).await.unwrap();

        assert_eq!(rec.reconcile(None, "w").await.unwrap(), Outcome::AwaitingOperation);
        assert_eq!(rec.reconcile(None, "w").await.unwrap(), Outcome::AwaitingOperation);
        assert_eq!(*external.creates.lock().unwrap(), 0, "exactly zero new external creates");
    }

    #[tokio::test]
    async fn deletion_policy_orphan_skips_external_delete() {
        let (rec, store, external) = engine(vec![]);
        let mut cr = widget("w");
        cr.deletion_policy = DeletionPolicy::Orphan;
        store.apply(cr).await;
        store.mark_deleted(None, "w").await.unwrap();
        assert_eq!(rec.reconcile(None, "w").await.unwrap(), Outcome::Orphaned);
        assert_eq!(*external.deletes.lock().unwrap(), 0);
        assert!(store.get(None, "w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_record_after_external_delete() {
        let (rec, store, external) = engine(vec![]);
        store.apply(widget("w")).await;
        store.mark_deleted(None, "w").await.unwrap();
        assert_eq!(rec.reconcile(None, "w").await.unwrap(), Outcome::Deleted);
        assert_eq!(*external.deletes.lock().unwrap(), 1);
        assert!(store.get(None, "w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_external_delete_keeps_the_record_for_retry() {
        let (rec, store, external) = engine(vec![]);
        *external.delete_result.lock().unwrap() =
            Some(ReconcileError::Api(ApiError::Transport("reset".into())));
        store.apply(widget("w")).await;
        store.mark_deleted(None, "w").await.unwrap();
        let err = rec.reconcile(None, "w").await.unwrap_err();
        assert!(err.retryable());
        assert!(store.get(None, "w").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invariant_errors_are_not_retryable() {
        assert!(!ReconcileError::Invariant("two project refs".into()).retryable());
        assert!(ReconcileError::Timeout.retryable());
        assert!(ReconcileError::Api(ApiError::Transport("x".into())).retryable());
    }
}

//! Agent queue controller. Queues carry no mutable fields, so this is a
//! create-once kind: once the queue exists it is always up to date.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use steward_client::api::{self, AgentQueue};
use steward_client::{page, ApiClient};
use steward_core::{ManagedResource, Reference};
use steward_store::Store;
use tracing::warn;

use crate::kinds::project::ProjectSpec;
use crate::{ExternalClient, Observation, ReconcileError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub project_ref: Reference,
}

pub struct QueueController {
    client: Arc<dyn ApiClient>,
    projects: Arc<dyn Store<ProjectSpec>>,
}

impl QueueController {
    pub fn new(client: Arc<dyn ApiClient>, projects: Arc<dyn Store<ProjectSpec>>) -> Self {
        Self { client, projects }
    }

    async fn project_id(
        &self,
        cr: &ManagedResource<QueueSpec>,
    ) -> Result<String, ReconcileError> {
        Ok(steward_resolve::resolve_external_id(
            &*self.projects,
            &cr.spec.project_ref,
            cr.meta.namespace.as_deref(),
        )
        .await?)
    }
}

/// Queue identifiers are numeric on the wire but stored as strings like every
/// other external id. A stored id that does not parse is treated as absent.
fn parse_id(external_id: Option<&str>) -> Option<u64> {
    external_id.and_then(|s| s.parse().ok())
}

#[async_trait::async_trait]
impl ExternalClient<QueueSpec> for QueueController {
    async fn observe(
        &self,
        cr: &mut ManagedResource<QueueSpec>,
    ) -> Result<Observation, ReconcileError> {
        let project_id = self.project_id(cr).await?;
        let found = match parse_id(cr.status.external_id.as_deref()) {
            Some(id) => api::queues::get(&*self.client, &project_id, id).await?,
            None => None,
        };
        let found = match found {
            Some(q) => Some(q),
            None => {
                let client = &*self.client;
                let name = cr.spec.name.clone();
                let pid = project_id.clone();
                page::find_by(
                    move |cursor| {
                        let pid = pid.clone();
                        async move { api::queues::list(client, &pid, cursor).await }
                    },
                    |q: &AgentQueue| page::name_matches(&q.name, &name),
                )
                .await?
            }
        };
        match found {
            Some(q) => {
                cr.status.external_id = Some(q.id.to_string());
                cr.status.observed = serde_json::json!({ "id": q.id, "name": q.name });
                Ok(Observation { resource_exists: true, resource_up_to_date: true })
            }
            None => Ok(Observation::missing()),
        }
    }

    async fn create(&self, cr: &mut ManagedResource<QueueSpec>) -> Result<(), ReconcileError> {
        let project_id = self.project_id(cr).await?;
        let queue = api::queues::create(&*self.client, &project_id, &cr.spec.name).await?;
        cr.status.external_id = Some(queue.id.to_string());
        Ok(())
    }

    async fn update(&self, cr: &mut ManagedResource<QueueSpec>) -> Result<(), ReconcileError> {
        // Unreachable while observe reports existing queues as up to date.
        warn!(key = %cr.key(), "queue update requested but queues are immutable");
        Ok(())
    }

    async fn delete(&self, cr: &mut ManagedResource<QueueSpec>) -> Result<(), ReconcileError> {
        let Some(id) = parse_id(cr.status.external_id.as_deref()) else {
            return Ok(());
        };
        let project_id = match self.project_id(cr).await {
            Ok(p) => p,
            Err(ReconcileError::Resolve(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match api::queues::delete(&*self.client, &project_id, id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CapturingRecorder, FakeApi};
    use crate::{Outcome, Reconciler};
    use steward_client::{ApiError, ApiResponse, Method};
    use steward_store::MemoryStore;

    async fn provisioned_project_store() -> std::sync::Arc<MemoryStore<ProjectSpec>> {
        let store = MemoryStore::new();
        let mut cr = ManagedResource::new(
            Some("ns"),
            "platform",
            ProjectSpec { name: "Platform".into(), description: None },
        );
        store.apply(cr.clone()).await;
        cr.status.external_id = Some("proj-guid".into());
        store.update_status(&cr).await.unwrap();
        store
    }

    fn queue_record(name: &str) -> ManagedResource<QueueSpec> {
        ManagedResource::new(
            Some("ns"),
            name,
            QueueSpec {
                name: name.to_string(),
                project_ref: Reference { name: "platform".into(), namespace: None },
            },
        )
    }

    fn engine(
        api: Arc<FakeApi>,
        projects: Arc<dyn Store<ProjectSpec>>,
    ) -> (Reconciler<QueueSpec>, std::sync::Arc<MemoryStore<QueueSpec>>) {
        let store = MemoryStore::new();
        let controller = QueueController::new(api, projects);
        let rec = Reconciler::new(
            "queue",
            store.clone() as Arc<dyn Store<QueueSpec>>,
            Arc::new(controller) as Arc<dyn ExternalClient<QueueSpec>>,
            Arc::new(CapturingRecorder::default()),
        );
        (rec, store)
    }

    #[tokio::test]
    async fn create_stores_numeric_id_as_string() {
        let api = Arc::new(FakeApi::new(|req| match (req.method, req.path.as_str()) {
            (Method::Get, "proj-guid/_apis/distributedtask/queues") => {
                Ok(ApiResponse::ok(serde_json::json!({ "count": 0, "value": [] })))
            }
            (Method::Post, "proj-guid/_apis/distributedtask/queues") => {
                Ok(ApiResponse::ok(serde_json::json!({ "id": 42, "name": "builders" })))
            }
            _ => Err(ApiError::NotFound(req.path.clone())),
        }));
        let projects = provisioned_project_store().await;
        let (rec, store) = engine(api, projects as Arc<dyn Store<ProjectSpec>>);
        store.apply(queue_record("builders")).await;
        assert_eq!(rec.reconcile(Some("ns"), "builders").await.unwrap(), Outcome::Created);
        let cr = store.get(Some("ns"), "builders").await.unwrap().unwrap();
        assert_eq!(cr.status.external_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn existing_queue_is_always_in_sync() {
        let api = Arc::new(FakeApi::new(|req| match (req.method, req.path.as_str()) {
            (Method::Get, "proj-guid/_apis/distributedtask/queues/42") => {
                Ok(ApiResponse::ok(serde_json::json!({ "id": 42, "name": "builders" })))
            }
            _ => Err(ApiError::NotFound(req.path.clone())),
        }));
        let projects = provisioned_project_store().await;
        let (rec, store) = engine(api.clone(), projects as Arc<dyn Store<ProjectSpec>>);
        let mut cr = queue_record("builders");
        store.apply(cr.clone()).await;
        cr.status.external_id = Some("42".into());
        store.update_status(&cr).await.unwrap();
        assert_eq!(rec.reconcile(Some("ns"), "builders").await.unwrap(), Outcome::InSync);
        assert_eq!(api.calls(Method::Post, "proj-guid/_apis/distributedtask/queues"), 0);
    }

    #[tokio::test]
    async fn adopts_existing_queue_found_by_name() {
        let api = Arc::new(FakeApi::new(|req| match (req.method, req.path.as_str()) {
            (Method::Get, "proj-guid/_apis/distributedtask/queues") => {
                Ok(ApiResponse::ok(serde_json::json!({
                    "count": 2,
                    "value": [{"id": 7, "name": "other"}, {"id": 42, "name": "Builders"}]
                })))
            }
            _ => Err(ApiError::NotFound(req.path.clone())),
        }));
        let projects = provisioned_project_store().await;
        let (rec, store) = engine(api, projects as Arc<dyn Store<ProjectSpec>>);
        store.apply(queue_record("builders")).await;
        // Case-insensitive name match adopts the queue instead of creating.
        assert_eq!(rec.reconcile(Some("ns"), "builders").await.unwrap(), Outcome::InSync);
        let cr = store.get(Some("ns"), "builders").await.unwrap().unwrap();
        assert_eq!(cr.status.external_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn delete_of_missing_queue_succeeds() {
        let api = Arc::new(FakeApi::new(|req| Err(ApiError::NotFound(req.path.clone()))));
        let projects = provisioned_project_store().await;
        let (rec, store) = engine(api, projects as Arc<dyn Store<ProjectSpec>>);
        let mut cr = queue_record("builders");
        store.apply(cr.clone()).await;
        cr.status.external_id = Some("42".into());
        store.update_status(&cr).await.unwrap();
        store.mark_deleted(Some("ns"), "builders").await.unwrap();
        assert_eq!(rec.reconcile(Some("ns"), "builders").await.unwrap(), Outcome::Deleted);
        assert!(store.get(Some("ns"), "builders").await.unwrap().is_none());
    }
}

//! Repository controller: project-scoped, synchronous create/delete, rename
//! via update.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use steward_client::api::{self, Repository};
use steward_client::{page, ApiClient};
use steward_core::{ManagedResource, Reference};
use steward_store::Store;
use tracing::debug;

use crate::kinds::project::ProjectSpec;
use crate::{ExternalClient, Observation, ReconcileError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositorySpec {
    pub name: String,
    pub project_ref: Reference,
}

pub struct RepositoryController {
    client: Arc<dyn ApiClient>,
    projects: Arc<dyn Store<ProjectSpec>>,
}

impl RepositoryController {
    pub fn new(client: Arc<dyn ApiClient>, projects: Arc<dyn Store<ProjectSpec>>) -> Self {
        Self { client, projects }
    }

    /// The owning project's external identifier, re-resolved on every use.
    async fn project_id(
        &self,
        cr: &ManagedResource<RepositorySpec>,
    ) -> Result<String, ReconcileError> {
        Ok(steward_resolve::resolve_external_id(
            &*self.projects,
            &cr.spec.project_ref,
            cr.meta.namespace.as_deref(),
        )
        .await?)
    }
}

#[async_trait::async_trait]
impl ExternalClient<RepositorySpec> for RepositoryController {
    async fn observe(
        &self,
        cr: &mut ManagedResource<RepositorySpec>,
    ) -> Result<Observation, ReconcileError> {
        let project_id = self.project_id(cr).await?;
        let found = match &cr.status.external_id {
            Some(id) => api::repos::get(&*self.client, &project_id, id).await?,
            None => None,
        };
        let found = match found {
            Some(r) => Some(r),
            None => {
                let client = &*self.client;
                let name = cr.spec.name.clone();
                let pid = project_id.clone();
                page::find_by(
                    move |cursor| {
                        let pid = pid.clone();
                        async move { api::repos::list(client, &pid, cursor).await }
                    },
                    |r: &Repository| page::name_matches(&r.name, &name),
                )
                .await?
            }
        };
        match found {
            Some(r) => {
                // Exact-name compare: a case-only drift still means rename.
                let up_to_date = r.name == cr.spec.name;
                cr.status.external_id = Some(r.id.clone());
                cr.status.observed = serde_json::json!({
                    "name": r.name,
                    "defaultBranch": r.default_branch,
                });
                Ok(Observation { resource_exists: true, resource_up_to_date: up_to_date })
            }
            None => Ok(Observation::missing()),
        }
    }

    async fn create(
        &self,
        cr: &mut ManagedResource<RepositorySpec>,
    ) -> Result<(), ReconcileError> {
        let project_id = self.project_id(cr).await?;
        let repo = api::repos::create(&*self.client, &project_id, &cr.spec.name).await?;
        // Synchronous creation: the response itself confirms existence.
        cr.status.external_id = Some(repo.id);
        Ok(())
    }

    async fn update(
        &self,
        cr: &mut ManagedResource<RepositorySpec>,
    ) -> Result<(), ReconcileError> {
        let Some(id) = cr.status.external_id.clone() else {
            return Ok(());
        };
        let project_id = self.project_id(cr).await?;
        debug!(key = %cr.key(), "renaming repository");
        api::repos::rename(&*self.client, &project_id, &id, &cr.spec.name).await?;
        Ok(())
    }

    async fn delete(
        &self,
        cr: &mut ManagedResource<RepositorySpec>,
    ) -> Result<(), ReconcileError> {
        let Some(id) = cr.status.external_id.clone() else {
            return Ok(());
        };
        let project_id = match self.project_id(cr).await {
            Ok(p) => p,
            // The owning project record is already gone; the service removes
            // nested repositories with the project.
            Err(ReconcileError::Resolve(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match api::repos::delete(&*self.client, &project_id, &id).await {
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
    use steward_resolve::ResolveError;
    use steward_store::MemoryStore;

    async fn project_store(provisioned: bool) -> std::sync::Arc<MemoryStore<ProjectSpec>> {
        let store = MemoryStore::new();
        let mut cr = ManagedResource::new(
            Some("ns"),
            "platform",
            ProjectSpec { name: "Platform".into(), description: None },
        );
        store.apply(cr.clone()).await;
        if provisioned {
            cr.status.external_id = Some("proj-guid".into());
            store.update_status(&cr).await.unwrap();
        }
        store
    }

    fn repo_record(name: &str) -> ManagedResource<RepositorySpec> {
        ManagedResource::new(
            Some("ns"),
            name,
            RepositorySpec {
                name: name.to_string(),
                project_ref: Reference { name: "platform".into(), namespace: None },
            },
        )
    }

    fn engine(
        api: Arc<FakeApi>,
        projects: Arc<dyn Store<ProjectSpec>>,
    ) -> (Reconciler<RepositorySpec>, std::sync::Arc<MemoryStore<RepositorySpec>>) {
        let store = MemoryStore::new();
        let controller = RepositoryController::new(api, projects);
        let rec = Reconciler::new(
            "repository",
            store.clone() as Arc<dyn Store<RepositorySpec>>,
            Arc::new(controller) as Arc<dyn ExternalClient<RepositorySpec>>,
            Arc::new(CapturingRecorder::default()),
        );
        (rec, store)
    }

    #[tokio::test]
    async fn unresolved_project_reference_is_a_config_error_not_external_absence() {
        let api = Arc::new(FakeApi::new(|req| Err(ApiError::NotFound(req.path.clone()))));
        let projects = MemoryStore::<ProjectSpec>::new();
        let (rec, store) = engine(api, projects as Arc<dyn Store<ProjectSpec>>);
        store.apply(repo_record("app")).await;
        let err = rec.reconcile(Some("ns"), "app").await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Resolve(ResolveError::ReferenceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn waits_for_project_provisioning_before_creating() {
        let api = Arc::new(FakeApi::new(|req| Err(ApiError::NotFound(req.path.clone()))));
        let projects = project_store(false).await;
        let (rec, store) = engine(api.clone(), projects as Arc<dyn Store<ProjectSpec>>);
        store.apply(repo_record("app")).await;
        let err = rec.reconcile(Some("ns"), "app").await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Resolve(ResolveError::NotYetProvisioned(_))
        ));
        assert_eq!(api.calls(Method::Post, "proj-guid/_apis/git/repositories"), 0);
    }

    #[tokio::test]
    async fn create_confirms_existence_synchronously() {
        let api = Arc::new(FakeApi::new(|req| match (req.method, req.path.as_str()) {
            (Method::Get, "proj-guid/_apis/git/repositories") => {
                Ok(ApiResponse::ok(serde_json::json!({ "count": 0, "value": [] })))
            }
            (Method::Post, "proj-guid/_apis/git/repositories") => {
                Ok(ApiResponse::ok(serde_json::json!({ "id": "repo-guid", "name": "app" })))
            }
            _ => Err(ApiError::NotFound(req.path.clone())),
        }));
        let projects = project_store(true).await;
        let (rec, store) = engine(api, projects as Arc<dyn Store<ProjectSpec>>);
        store.apply(repo_record("app")).await;
        assert_eq!(rec.reconcile(Some("ns"), "app").await.unwrap(), Outcome::Created);
        let cr = store.get(Some("ns"), "app").await.unwrap().unwrap();
        assert_eq!(cr.status.external_id.as_deref(), Some("repo-guid"));
    }

    #[tokio::test]
    async fn name_drift_triggers_rename() {
        let api = Arc::new(FakeApi::new(|req| match (req.method, req.path.as_str()) {
            (Method::Get, "proj-guid/_apis/git/repositories") => {
                Ok(ApiResponse::ok(serde_json::json!({
                    "count": 1,
                    "value": [{"id": "repo-guid", "name": "APP"}]
                })))
            }
            (Method::Patch, "proj-guid/_apis/git/repositories/repo-guid") => {
                Ok(ApiResponse::ok(serde_json::json!({ "id": "repo-guid", "name": "app" })))
            }
            _ => Err(ApiError::NotFound(req.path.clone())),
        }));
        let projects = project_store(true).await;
        let (rec, store) = engine(api.clone(), projects as Arc<dyn Store<ProjectSpec>>);
        store.apply(repo_record("app")).await;
        assert_eq!(rec.reconcile(Some("ns"), "app").await.unwrap(), Outcome::Updated);
        assert_eq!(
            api.calls(Method::Patch, "proj-guid/_apis/git/repositories/repo-guid"),
            1
        );
    }

    #[tokio::test]
    async fn delete_with_gone_project_reference_succeeds() {
        let api = Arc::new(FakeApi::new(|req| Err(ApiError::NotFound(req.path.clone()))));
        let projects = MemoryStore::<ProjectSpec>::new();
        let (rec, store) = engine(api, projects as Arc<dyn Store<ProjectSpec>>);
        let mut cr = repo_record("app");
        store.apply(cr.clone()).await;
        cr.status.external_id = Some("repo-guid".into());
        store.update_status(&cr).await.unwrap();
        store.mark_deleted(Some("ns"), "app").await.unwrap();
        assert_eq!(rec.reconcile(Some("ns"), "app").await.unwrap(), Outcome::Deleted);
    }
}

//! Permission grant controller: one access-control entry for one subject on
//! one project's version-control token.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use steward_client::api::{self, VCS_NAMESPACE_ID};
use steward_client::ApiClient;
use steward_core::{perm, AccessControlEntry, ManagedResource, Reference};
use steward_resolve::ResolveError;
use steward_store::Store;
use tracing::debug;

use crate::kinds::group::GroupSpec;
use crate::kinds::project::ProjectSpec;
use crate::{ExternalClient, Observation, ReconcileError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSpec {
    /// Must name exactly one project; a list shape on the wire, a scalar in
    /// meaning.
    pub project_refs: Vec<Reference>,
    /// The group whose identity receives the grant.
    pub subject_ref: Reference,
    /// Named permissions resolved against the version-control bit table.
    pub permissions: Vec<String>,
    /// With merge, the grant is a floor: extra bits from other sources stay.
    /// Without it, the entry is replaced bit-exact.
    #[serde(default)]
    pub merge: bool,
}

/// Fully resolved coordinates of one grant.
struct Coordinates {
    token: String,
    descriptor: String,
}

pub struct PermissionController {
    client: Arc<dyn ApiClient>,
    projects: Arc<dyn Store<ProjectSpec>>,
    groups: Arc<dyn Store<GroupSpec>>,
}

impl PermissionController {
    pub fn new(
        client: Arc<dyn ApiClient>,
        projects: Arc<dyn Store<ProjectSpec>>,
        groups: Arc<dyn Store<GroupSpec>>,
    ) -> Self {
        Self { client, projects, groups }
    }

    async fn coordinates(
        &self,
        cr: &ManagedResource<PermissionSpec>,
    ) -> Result<Coordinates, ReconcileError> {
        let [project_ref] = cr.spec.project_refs.as_slice() else {
            return Err(ReconcileError::Invariant(format!(
                "permission {} must reference exactly one project, got {}",
                cr.key(),
                cr.spec.project_refs.len()
            )));
        };
        let ns = cr.meta.namespace.as_deref();
        let project_id =
            steward_resolve::resolve_external_id(&*self.projects, project_ref, ns).await?;
        let storage_key =
            steward_resolve::resolve_external_id(&*self.groups, &cr.spec.subject_ref, ns).await?;
        let descriptor = steward_resolve::resolve_descriptor(&*self.client, &storage_key).await?;
        Ok(Coordinates { token: format!("repoV2/{project_id}"), descriptor })
    }

    async fn apply_grant(
        &self,
        cr: &ManagedResource<PermissionSpec>,
    ) -> Result<(), ReconcileError> {
        let coords = self.coordinates(cr).await?;
        let entry = AccessControlEntry {
            descriptor: coords.descriptor,
            allow: perm::resolve(&cr.spec.permissions),
            deny: 0,
        };
        debug!(key = %cr.key(), token = %coords.token, allow = entry.allow, merge = cr.spec.merge, "applying grant");
        api::security::set(
            &*self.client,
            VCS_NAMESPACE_ID,
            &coords.token,
            std::slice::from_ref(&entry),
            cr.spec.merge,
        )
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ExternalClient<PermissionSpec> for PermissionController {
    async fn observe(
        &self,
        cr: &mut ManagedResource<PermissionSpec>,
    ) -> Result<Observation, ReconcileError> {
        let coords = self.coordinates(cr).await?;
        let entries =
            api::security::query(&*self.client, VCS_NAMESPACE_ID, &coords.token).await?;
        let current = entries.iter().find(|e| e.descriptor == coords.descriptor);
        let desired = perm::resolve(&cr.spec.permissions);
        cr.status.observed = serde_json::json!({
            "token": coords.token,
            "descriptor": coords.descriptor,
            "allow": current.map(|e| e.allow),
        });
        match current {
            Some(entry) => {
                // Only a confirmed entry earns an external id.
                cr.status.external_id = Some(coords.token.clone());
                Ok(Observation {
                    resource_exists: true,
                    resource_up_to_date: perm::in_sync(entry.allow, desired, cr.spec.merge),
                })
            }
            None => Ok(Observation::missing()),
        }
    }

    async fn create(
        &self,
        cr: &mut ManagedResource<PermissionSpec>,
    ) -> Result<(), ReconcileError> {
        self.apply_grant(cr).await
    }

    async fn update(
        &self,
        cr: &mut ManagedResource<PermissionSpec>,
    ) -> Result<(), ReconcileError> {
        self.apply_grant(cr).await
    }

    async fn delete(
        &self,
        cr: &mut ManagedResource<PermissionSpec>,
    ) -> Result<(), ReconcileError> {
        let coords = match self.coordinates(cr).await {
            Ok(c) => c,
            // A referent already torn down takes its grants with it.
            Err(ReconcileError::Resolve(
                ResolveError::ReferenceNotFound(_) | ResolveError::NotYetProvisioned(_),
            )) => return Ok(()),
            Err(e) => return Err(e),
        };
        match api::security::remove(
            &*self.client,
            VCS_NAMESPACE_ID,
            &coords.token,
            std::slice::from_ref(&coords.descriptor),
        )
        .await
        {
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
    use steward_client::{ApiError, ApiRequest, ApiResponse, Method};
    use steward_store::MemoryStore;

    fn permission_record(permissions: &[&str], merge: bool) -> ManagedResource<PermissionSpec> {
        ManagedResource::new(
            Some("ns"),
            "readers-grant",
            PermissionSpec {
                project_refs: vec![Reference { name: "platform".into(), namespace: None }],
                subject_ref: Reference { name: "readers".into(), namespace: None },
                permissions: permissions.iter().map(|p| p.to_string()).collect(),
                merge,
            },
        )
    }

    struct Env {
        rec: Reconciler<PermissionSpec>,
        store: Arc<MemoryStore<PermissionSpec>>,
        api: Arc<FakeApi>,
    }

    /// Wires a provisioned project "platform" (proj-guid) and group "readers"
    /// (storage key sk-r, descriptor vssgp.sk-r) around the given handler.
    async fn env(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    ) -> Env {
        let api = Arc::new(FakeApi::new(move |req: &ApiRequest| {
            if req.method == Method::Get && req.path == "_apis/graph/descriptors/sk-r" {
                return Ok(ApiResponse::ok(serde_json::json!({ "value": "vssgp.sk-r" })));
            }
            handler(req)
        }));

        let projects = MemoryStore::new();
        let mut proj = ManagedResource::new(
            Some("ns"),
            "platform",
            ProjectSpec { name: "Platform".into(), description: None },
        );
        projects.apply(proj.clone()).await;
        proj.status.external_id = Some("proj-guid".into());
        projects.update_status(&proj).await.unwrap();

        let groups = MemoryStore::new();
        let mut grp = ManagedResource::new(
            Some("ns"),
            "readers",
            GroupSpec {
                display_name: "Readers".into(),
                description: None,
                origin_id: None,
                members: Vec::new(),
            },
        );
        groups.apply(grp.clone()).await;
        grp.status.external_id = Some("sk-r".into());
        groups.update_status(&grp).await.unwrap();

        let store = MemoryStore::new();
        let controller = PermissionController::new(
            api.clone(),
            projects as Arc<dyn Store<ProjectSpec>>,
            groups as Arc<dyn Store<GroupSpec>>,
        );
        let rec = Reconciler::new(
            "permission",
            store.clone() as Arc<dyn Store<PermissionSpec>>,
            Arc::new(controller) as Arc<dyn ExternalClient<PermissionSpec>>,
            Arc::new(CapturingRecorder::default()),
        );
        Env { rec, store, api }
    }

    fn acl_response(allow: u64) -> ApiResponse {
        ApiResponse::ok(serde_json::json!({
            "count": 1,
            "value": [{
                "acesDictionary": {
                    "vssgp.sk-r": {"descriptor": "vssgp.sk-r", "allow": allow, "deny": 0}
                }
            }]
        }))
    }

    #[tokio::test]
    async fn merge_mode_accepts_extra_bits_from_other_sources() {
        // current = GenericRead | GenericContribute, desired = GenericRead
        let env = env(|req| match (req.method, req.path.as_str()) {
            (Method::Get, "_apis/accesscontrollists/2e9eb7ed-3c0a-47d4-87c1-0ffdd275fd87") => {
                Ok(acl_response(2 | 4))
            }
            _ => Err(ApiError::NotFound(req.path.clone())),
        })
        .await;
        env.store.apply(permission_record(&["GenericRead"], true)).await;
        assert_eq!(
            env.rec.reconcile(Some("ns"), "readers-grant").await.unwrap(),
            Outcome::InSync
        );
        assert_eq!(
            env.api.calls(Method::Post, "_apis/accesscontrolentries"),
            0
        );
    }

    #[tokio::test]
    async fn replace_mode_rewrites_the_entry_bit_exact() {
        let env = env(|req| match (req.method, req.path.as_str()) {
            (Method::Get, "_apis/accesscontrollists/2e9eb7ed-3c0a-47d4-87c1-0ffdd275fd87") => {
                Ok(acl_response(2 | 4))
            }
            (Method::Post, "_apis/accesscontrolentries/2e9eb7ed-3c0a-47d4-87c1-0ffdd275fd87") => {
                let body = req.body.as_ref().unwrap();
                assert_eq!(body["merge"], false);
                assert_eq!(body["token"], "repoV2/proj-guid");
                assert_eq!(body["accessControlEntries"][0]["allow"], 2);
                Ok(ApiResponse::ok(serde_json::Value::Null))
            }
            _ => Err(ApiError::NotFound(req.path.clone())),
        })
        .await;
        env.store.apply(permission_record(&["GenericRead"], false)).await;
        assert_eq!(
            env.rec.reconcile(Some("ns"), "readers-grant").await.unwrap(),
            Outcome::Updated
        );
        assert_eq!(
            env.api
                .calls(Method::Post, "_apis/accesscontrolentries"),
            1
        );
    }

    #[tokio::test]
    async fn absent_entry_is_created_with_merge_flag() {
        let env = env(|req| match (req.method, req.path.as_str()) {
            (Method::Get, "_apis/accesscontrollists/2e9eb7ed-3c0a-47d4-87c1-0ffdd275fd87") => {
                Ok(ApiResponse::ok(serde_json::json!({ "count": 0, "value": [] })))
            }
            (Method::Post, "_apis/accesscontrolentries/2e9eb7ed-3c0a-47d4-87c1-0ffdd275fd87") => {
                let body = req.body.as_ref().unwrap();
                assert_eq!(body["merge"], true);
                assert_eq!(body["accessControlEntries"][0]["allow"], 2 | 8);
                Ok(ApiResponse::ok(serde_json::Value::Null))
            }
            _ => Err(ApiError::NotFound(req.path.clone())),
        })
        .await;
        env.store
            .apply(permission_record(&["GenericRead", "ForcePush"], true))
            .await;
        assert_eq!(
            env.rec.reconcile(Some("ns"), "readers-grant").await.unwrap(),
            Outcome::Created
        );
        assert_eq!(
            env.api.calls(Method::Post, "_apis/accesscontrolentries"),
            1
        );
    }

    #[tokio::test]
    async fn unconfirmed_grant_never_gets_an_external_id() {
        // No ACE exists and the set call fails: the record must not claim an
        // external id for a grant that was never confirmed.
        let env = env(|req| match (req.method, req.path.as_str()) {
            (Method::Get, "_apis/accesscontrollists/2e9eb7ed-3c0a-47d4-87c1-0ffdd275fd87") => {
                Ok(ApiResponse::ok(serde_json::json!({ "count": 0, "value": [] })))
            }
            (Method::Post, "_apis/accesscontrolentries/2e9eb7ed-3c0a-47d4-87c1-0ffdd275fd87") => {
                Err(ApiError::Remote { status: 500, message: "splat".into() })
            }
            _ => Err(ApiError::NotFound(req.path.clone())),
        })
        .await;
        env.store.apply(permission_record(&["GenericRead"], true)).await;
        let err = env.rec.reconcile(Some("ns"), "readers-grant").await.unwrap_err();
        assert!(err.retryable());
        let cr = env.store.get(Some("ns"), "readers-grant").await.unwrap().unwrap();
        assert_eq!(cr.status.external_id, None);
    }

    #[tokio::test]
    async fn more_than_one_project_reference_is_a_non_retryable_error() {
        let env = env(|req| Err(ApiError::NotFound(req.path.clone()))).await;
        let mut cr = permission_record(&["GenericRead"], true);
        cr.spec
            .project_refs
            .push(Reference { name: "other".into(), namespace: None });
        env.store.apply(cr).await;
        let err = env.rec.reconcile(Some("ns"), "readers-grant").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Invariant(_)));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn delete_with_torn_down_referents_succeeds() {
        let api = Arc::new(FakeApi::new(|req| Err(ApiError::NotFound(req.path.clone()))));
        let store = MemoryStore::new();
        let controller = PermissionController::new(
            api,
            MemoryStore::<ProjectSpec>::new() as Arc<dyn Store<ProjectSpec>>,
            MemoryStore::<GroupSpec>::new() as Arc<dyn Store<GroupSpec>>,
        );
        let rec = Reconciler::new(
            "permission",
            store.clone() as Arc<dyn Store<PermissionSpec>>,
            Arc::new(controller) as Arc<dyn ExternalClient<PermissionSpec>>,
            Arc::new(CapturingRecorder::default()),
        );
        store.apply(permission_record(&["GenericRead"], true)).await;
        store.mark_deleted(Some("ns"), "readers-grant").await.unwrap();
        assert_eq!(
            rec.reconcile(Some("ns"), "readers-grant").await.unwrap(),
            Outcome::Deleted
        );
    }
}

//! Typed endpoint builders over [`ApiClient`].
//!
//! Each submodule wraps one collection of the external service. Lookups by
//! identifier map a 404 to `Ok(None)` so controllers can treat absence as a
//! state signal.

use serde::{Deserialize, Serialize};

use crate::page::Page;
use crate::{ApiClient, ApiError, ApiRequest};

/// Security namespace for version-control permissions.
pub const VCS_NAMESPACE_ID: &str = "2e9eb7ed-3c0a-47d4-87c1-0ffdd275fd87";

/// Status of a long-running operation as reported by the service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    NotSet,
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// Reference to a long-running operation, returned by async mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReference {
    pub id: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub result_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamProject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentQueue {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphGroup {
    /// Opaque identity string, organization-scoped; changes if the group is
    /// recreated. Distinct from the storage key below.
    pub descriptor: String,
    /// Stable storage key (GUID) used for descriptor lookups.
    #[serde(default)]
    pub origin_id: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Group creation payload shapes. The wire format discriminates by field
/// presence, so serialization is untagged; in-process dispatch is by variant.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged, rename_all = "camelCase")]
pub enum GroupCreatePayload {
    New {
        #[serde(rename = "displayName")]
        display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    FromOrigin {
        #[serde(rename = "originId")]
        origin_id: String,
    },
}

/// Body shape shared by list endpoints: `{ "count": n, "value": [...] }`.
#[derive(Debug, Deserialize)]
struct ListBody<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

async fn list_page<T: serde::de::DeserializeOwned>(
    client: &dyn ApiClient,
    mut req: ApiRequest,
    cursor: Option<String>,
) -> Result<Page<T>, ApiError> {
    if let Some(c) = cursor {
        req = req.with_query("continuationToken", c);
    }
    let resp = client.execute(req).await?;
    let continuation = resp.continuation.clone();
    let body: ListBody<T> = resp.decode()?;
    Ok(Page { items: body.value, continuation })
}

/// Map a not-found error on a by-identifier lookup to `Ok(None)`.
fn absent_ok<T>(res: Result<T, ApiError>) -> Result<Option<T>, ApiError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub mod projects {
    use super::*;

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProjectCreate {
        pub name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub description: Option<String>,
    }

    pub async fn get(client: &dyn ApiClient, id: &str) -> Result<Option<TeamProject>, ApiError> {
        let resp = client.execute(ApiRequest::get(format!("_apis/projects/{id}"))).await;
        absent_ok(resp.and_then(|r| r.decode()))
    }

    pub async fn list(
        client: &dyn ApiClient,
        cursor: Option<String>,
    ) -> Result<Page<TeamProject>, ApiError> {
        list_page(client, ApiRequest::get("_apis/projects"), cursor).await
    }

    /// Creation is asynchronous: the service answers with an operation
    /// reference, not the project.
    pub async fn create(
        client: &dyn ApiClient,
        body: &ProjectCreate,
    ) -> Result<OperationReference, ApiError> {
        let body = serde_json::to_value(body).map_err(|e| ApiError::Decode(e.to_string()))?;
        client.execute(ApiRequest::post("_apis/projects", body)).await?.decode()
    }

    pub async fn update(
        client: &dyn ApiClient,
        id: &str,
        description: Option<&str>,
    ) -> Result<OperationReference, ApiError> {
        let body = serde_json::json!({ "description": description });
        client
            .execute(ApiRequest::patch(format!("_apis/projects/{id}"), body))
            .await?
            .decode()
    }

    pub async fn delete(client: &dyn ApiClient, id: &str) -> Result<OperationReference, ApiError> {
        client.execute(ApiRequest::delete(format!("_apis/projects/{id}"))).await?.decode()
    }
}

pub mod operations {
    use super::*;

    pub async fn get(
        client: &dyn ApiClient,
        id: &str,
    ) -> Result<Option<OperationReference>, ApiError> {
        let resp = client.execute(ApiRequest::get(format!("_apis/operations/{id}"))).await;
        absent_ok(resp.and_then(|r| r.decode()))
    }
}

pub mod repos {
    use super::*;

    pub async fn get(
        client: &dyn ApiClient,
        project_id: &str,
        id: &str,
    ) -> Result<Option<Repository>, ApiError> {
        let resp = client
            .execute(ApiRequest::get(format!("{project_id}/_apis/git/repositories/{id}")))
            .await;
        absent_ok(resp.and_then(|r| r.decode()))
    }

    pub async fn list(
        client: &dyn ApiClient,
        project_id: &str,
        cursor: Option<String>,
    ) -> Result<Page<Repository>, ApiError> {
        list_page(
            client,
            ApiRequest::get(format!("{project_id}/_apis/git/repositories")),
            cursor,
        )
        .await
    }

    pub async fn create(
        client: &dyn ApiClient,
        project_id: &str,
        name: &str,
    ) -> Result<Repository, ApiError> {
        let body = serde_json::json!({ "name": name });
        client
            .execute(ApiRequest::post(format!("{project_id}/_apis/git/repositories"), body))
            .await?
            .decode()
    }

    pub async fn rename(
        client: &dyn ApiClient,
        project_id: &str,
        id: &str,
        name: &str,
    ) -> Result<Repository, ApiError> {
        let body = serde_json::json!({ "name": name });
        client
            .execute(ApiRequest::patch(
                format!("{project_id}/_apis/git/repositories/{id}"),
                body,
            ))
            .await?
            .decode()
    }

    pub async fn delete(client: &dyn ApiClient, project_id: &str, id: &str) -> Result<(), ApiError> {
        client
            .execute(ApiRequest::delete(format!("{project_id}/_apis/git/repositories/{id}")))
            .await
            .map(|_| ())
    }
}

pub mod queues {
    use super::*;

    pub async fn get(
        client: &dyn ApiClient,
        project_id: &str,
        id: u64,
    ) -> Result<Option<AgentQueue>, ApiError> {
        let resp = client
            .execute(ApiRequest::get(format!(
                "{project_id}/_apis/distributedtask/queues/{id}"
            )))
            .await;
        absent_ok(resp.and_then(|r| r.decode()))
    }

    pub async fn list(
        client: &dyn ApiClient,
        project_id: &str,
        cursor: Option<String>,
    ) -> Result<Page<AgentQueue>, ApiError> {
        list_page(
            client,
            ApiRequest::get(format!("{project_id}/_apis/distributedtask/queues")),
            cursor,
        )
        .await
    }

    pub async fn create(
        client: &dyn ApiClient,
        project_id: &str,
        name: &str,
    ) -> Result<AgentQueue, ApiError> {
        let body = serde_json::json!({ "name": name });
        client
            .execute(ApiRequest::post(
                format!("{project_id}/_apis/distributedtask/queues"),
                body,
            ))
            .await?
            .decode()
    }

    pub async fn delete(client: &dyn ApiClient, project_id: &str, id: u64) -> Result<(), ApiError> {
        client
            .execute(ApiRequest::delete(format!(
                "{project_id}/_apis/distributedtask/queues/{id}"
            )))
            .await
            .map(|_| ())
    }
}

pub mod graph {
    use super::*;

    pub async fn get_group(
        client: &dyn ApiClient,
        descriptor: &str,
    ) -> Result<Option<GraphGroup>, ApiError> {
        let resp = client
            .execute(ApiRequest::get(format!("_apis/graph/groups/{descriptor}")))
            .await;
        absent_ok(resp.and_then(|r| r.decode()))
    }

    pub async fn list_groups(
        client: &dyn ApiClient,
        cursor: Option<String>,
    ) -> Result<Page<GraphGroup>, ApiError> {
        list_page(client, ApiRequest::get("_apis/graph/groups"), cursor).await
    }

    pub async fn create_group(
        client: &dyn ApiClient,
        payload: &GroupCreatePayload,
    ) -> Result<GraphGroup, ApiError> {
        let body = serde_json::to_value(payload).map_err(|e| ApiError::Decode(e.to_string()))?;
        client.execute(ApiRequest::post("_apis/graph/groups", body)).await?.decode()
    }

    pub async fn update_group(
        client: &dyn ApiClient,
        descriptor: &str,
        description: Option<&str>,
    ) -> Result<GraphGroup, ApiError> {
        let body = serde_json::json!([
            { "op": "replace", "path": "/description", "value": description }
        ]);
        client
            .execute(ApiRequest::patch(format!("_apis/graph/groups/{descriptor}"), body))
            .await?
            .decode()
    }

    pub async fn delete_group(client: &dyn ApiClient, descriptor: &str) -> Result<(), ApiError> {
        client
            .execute(ApiRequest::delete(format!("_apis/graph/groups/{descriptor}")))
            .await
            .map(|_| ())
    }

    /// Resolve the opaque descriptor for a subject identified by its stable
    /// storage key.
    pub async fn descriptor(client: &dyn ApiClient, storage_key: &str) -> Result<String, ApiError> {
        #[derive(Deserialize)]
        struct DescriptorResult {
            value: String,
        }
        let d: DescriptorResult = client
            .execute(ApiRequest::get(format!("_apis/graph/descriptors/{storage_key}")))
            .await?
            .decode()?;
        Ok(d.value)
    }

    /// Subject descriptors currently in the container's membership set.
    pub async fn list_members(
        client: &dyn ApiClient,
        container: &str,
    ) -> Result<Vec<String>, ApiError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Membership {
            member_descriptor: String,
        }
        let resp = client
            .execute(
                ApiRequest::get(format!("_apis/graph/memberships/{container}"))
                    .with_query("direction", "down"),
            )
            .await?;
        let body: ListBody<Membership> = resp.decode()?;
        Ok(body.value.into_iter().map(|m| m.member_descriptor).collect())
    }

    pub async fn add_membership(
        client: &dyn ApiClient,
        subject: &str,
        container: &str,
    ) -> Result<(), ApiError> {
        client
            .execute(ApiRequest {
                method: crate::Method::Put,
                path: format!("_apis/graph/memberships/{subject}/{container}"),
                query: Vec::new(),
                body: None,
            })
            .await
            .map(|_| ())
    }

    pub async fn remove_membership(
        client: &dyn ApiClient,
        subject: &str,
        container: &str,
    ) -> Result<(), ApiError> {
        client
            .execute(ApiRequest::delete(format!(
                "_apis/graph/memberships/{subject}/{container}"
            )))
            .await
            .map(|_| ())
    }
}

pub mod security {
    use super::*;
    use steward_core::AccessControlEntry;

    /// Entries for one token within a namespace, or empty when no ACL exists.
    pub async fn query(
        client: &dyn ApiClient,
        namespace_id: &str,
        token: &str,
    ) -> Result<Vec<AccessControlEntry>, ApiError> {
        let resp = client
            .execute(
                ApiRequest::get(format!("_apis/accesscontrollists/{namespace_id}"))
                    .with_query("token", token),
            )
            .await;
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Acl {
            #[serde(default)]
            aces_dictionary: std::collections::HashMap<String, AccessControlEntry>,
        }
        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let list: ListBody<Acl> = resp.decode()?;
        let mut out = Vec::new();
        for acl in list.value {
            out.extend(acl.aces_dictionary.into_values());
        }
        Ok(out)
    }

    /// Set entries for a token. With `merge` the service ORs the new bits
    /// into existing entries; without it the entries are replaced outright.
    /// The two must never be conflated: replacing silently drops grants other
    /// identities contributed.
    pub async fn set(
        client: &dyn ApiClient,
        namespace_id: &str,
        token: &str,
        entries: &[AccessControlEntry],
        merge: bool,
    ) -> Result<(), ApiError> {
        let body = serde_json::json!({
            "token": token,
            "merge": merge,
            "accessControlEntries": entries,
        });
        client
            .execute(ApiRequest::post(
                format!("_apis/accesscontrolentries/{namespace_id}"),
                body,
            ))
            .await
            .map(|_| ())
    }

    pub async fn remove(
        client: &dyn ApiClient,
        namespace_id: &str,
        token: &str,
        descriptors: &[String],
    ) -> Result<(), ApiError> {
        client
            .execute(
                ApiRequest::delete(format!("_apis/accesscontrolentries/{namespace_id}"))
                    .with_query("token", token)
                    .with_query("descriptors", descriptors.join(",")),
            )
            .await
            .map(|_| ())
    }
}

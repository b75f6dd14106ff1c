//! Graph group controller: organization-scoped groups plus their membership
//! sets.
//!
//! The stable storage key is what goes into `status.external_id`; the opaque
//! descriptor is re-resolved from it on every pass because descriptors change
//! when the subject is recreated.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use steward_client::api::{self, GraphGroup, GroupCreatePayload};
use steward_client::{page, ApiClient};
use steward_core::{ManagedResource, Reference};
use steward_resolve::ResolveError;
use steward_store::Store;
use tracing::{debug, info};

use crate::{ExternalClient, Observation, ReconcileError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSpec {
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Import an existing identity instead of minting a new group.
    #[serde(default)]
    pub origin_id: Option<String>,
    /// Other group records whose identities belong in this group.
    #[serde(default)]
    pub members: Vec<Reference>,
}

pub struct GroupController {
    client: Arc<dyn ApiClient>,
    groups: Arc<dyn Store<GroupSpec>>,
}

impl GroupController {
    pub fn new(client: Arc<dyn ApiClient>, groups: Arc<dyn Store<GroupSpec>>) -> Self {
        Self { client, groups }
    }

    /// Storage key to descriptor, treating an unknown key as absence.
    async fn descriptor_of(&self, storage_key: &str) -> Result<Option<String>, ReconcileError> {
        match steward_resolve::resolve_descriptor(&*self.client, storage_key).await {
            Ok(d) => Ok(Some(d)),
            Err(ResolveError::Api(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Descriptors the membership set should contain. All-or-nothing: any
    /// unresolved member reference aborts before a single grant is computed.
    async fn desired_members(
        &self,
        cr: &ManagedResource<GroupSpec>,
    ) -> Result<BTreeSet<String>, ReconcileError> {
        let resolved = steward_resolve::resolve_many(
            &*self.groups,
            &*self.client,
            &cr.spec.members,
            cr.meta.namespace.as_deref(),
        )
        .await?;
        Ok(resolved.into_iter().collect())
    }

    async fn actual_members(&self, descriptor: &str) -> Result<BTreeSet<String>, ReconcileError> {
        let members = api::graph::list_members(&*self.client, descriptor).await?;
        Ok(members.into_iter().collect())
    }

    /// The group's storage key is mandatory once it exists externally.
    fn storage_key(group: &GraphGroup) -> Result<String, ReconcileError> {
        group.origin_id.clone().ok_or_else(|| {
            ReconcileError::Invariant(format!(
                "group {} has no storage key in the service response",
                group.display_name
            ))
        })
    }
}

#[async_trait::async_trait]
impl ExternalClient<GroupSpec> for GroupController {
    async fn observe(
        &self,
        cr: &mut ManagedResource<GroupSpec>,
    ) -> Result<Observation, ReconcileError> {
        let found = match &cr.status.external_id {
            Some(storage_key) => match self.descriptor_of(storage_key).await? {
                Some(descriptor) => api::graph::get_group(&*self.client, &descriptor).await?,
                None => None,
            },
            None => None,
        };
        let found = match found {
            Some(g) => Some(g),
            None => {
                let client = &*self.client;
                let name = cr.spec.display_name.clone();
                page::find_by(
                    move |cursor| async move { api::graph::list_groups(client, cursor).await },
                    |g: &GraphGroup| page::name_matches(&g.display_name, &name),
                )
                .await?
            }
        };
        let Some(group) = found else {
            return Ok(Observation::missing());
        };
        let description_ok = group.description == cr.spec.description;
        let desired = self.desired_members(cr).await?;
        let actual = self.actual_members(&group.descriptor).await?;
        cr.status.external_id = Some(Self::storage_key(&group)?);
        cr.status.observed = serde_json::json!({
            "descriptor": group.descriptor,
            "displayName": group.display_name,
            "members": actual.iter().collect::<Vec<_>>(),
        });
        Ok(Observation {
            resource_exists: true,
            resource_up_to_date: description_ok && desired == actual,
        })
    }

    async fn create(&self, cr: &mut ManagedResource<GroupSpec>) -> Result<(), ReconcileError> {
        let payload = match &cr.spec.origin_id {
            Some(origin) => GroupCreatePayload::FromOrigin { origin_id: origin.clone() },
            None => GroupCreatePayload::New {
                display_name: cr.spec.display_name.clone(),
                description: cr.spec.description.clone(),
            },
        };
        let group = api::graph::create_group(&*self.client, &payload).await?;
        cr.status.external_id = Some(Self::storage_key(&group)?);
        info!(key = %cr.key(), descriptor = %group.descriptor, "group created");
        Ok(())
    }

    async fn update(&self, cr: &mut ManagedResource<GroupSpec>) -> Result<(), ReconcileError> {
        let Some(storage_key) = cr.status.external_id.clone() else {
            return Ok(());
        };
        let Some(descriptor) = self.descriptor_of(&storage_key).await? else {
            // Vanished between observe and update; next pass recreates it.
            return Ok(());
        };
        api::graph::update_group(&*self.client, &descriptor, cr.spec.description.as_deref())
            .await?;
        let desired = self.desired_members(cr).await?;
        let actual = self.actual_members(&descriptor).await?;
        for subject in desired.difference(&actual) {
            debug!(key = %cr.key(), subject = %subject, "adding member");
            api::graph::add_membership(&*self.client, subject, &descriptor).await?;
        }
        for subject in actual.difference(&desired) {
            debug!(key = %cr.key(), subject = %subject, "removing member");
            api::graph::remove_membership(&*self.client, subject, &descriptor).await?;
        }
        Ok(())
    }

    async fn delete(&self, cr: &mut ManagedResource<GroupSpec>) -> Result<(), ReconcileError> {
        let Some(storage_key) = cr.status.external_id.clone() else {
            return Ok(());
        };
        let Some(descriptor) = self.descriptor_of(&storage_key).await? else {
            return Ok(());
        };
        match api::graph::delete_group(&*self.client, &descriptor).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

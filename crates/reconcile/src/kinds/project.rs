//! Project controller: asynchronous provisioning through operation handles.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use steward_client::api::{self, projects::ProjectCreate, TeamProject};
use steward_client::{page, ApiClient};
use steward_core::ManagedResource;
use steward_track::TrackedOperation;
use tracing::debug;

use crate::{ExternalClient, Observation, ReconcileError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub struct ProjectController {
    client: Arc<dyn ApiClient>,
}

impl ProjectController {
    pub fn new(client: Arc<dyn ApiClient>) -> Self {
        Self { client }
    }

    /// Locate the project: by stored identifier first, then by name across
    /// all pages of the (unordered, paged) project list.
    async fn lookup(
        &self,
        cr: &ManagedResource<ProjectSpec>,
    ) -> Result<Option<TeamProject>, ReconcileError> {
        if let Some(id) = &cr.status.external_id {
            if let Some(p) = api::projects::get(&*self.client, id).await? {
                return Ok(Some(p));
            }
            debug!(key = %cr.key(), id = %id, "stored id not found; falling back to name search");
        }
        let client = &*self.client;
        let name = cr.spec.name.clone();
        let found = page::find_by(
            |cursor| api::projects::list(client, cursor),
            |p: &TeamProject| page::name_matches(&p.name, &name),
        )
        .await?;
        Ok(found)
    }
}

#[async_trait::async_trait]
impl ExternalClient<ProjectSpec> for ProjectController {
    async fn observe(
        &self,
        cr: &mut ManagedResource<ProjectSpec>,
    ) -> Result<Observation, ReconcileError> {
        match self.lookup(cr).await? {
            Some(p) => {
                let up_to_date = p.description == cr.spec.description;
                cr.status.external_id = Some(p.id.clone());
                cr.status.observed = serde_json::json!({
                    "state": p.state,
                    "description": p.description,
                });
                Ok(Observation { resource_exists: true, resource_up_to_date: up_to_date })
            }
            None => Ok(Observation::missing()),
        }
    }

    async fn create(
        &self,
        cr: &mut ManagedResource<ProjectSpec>,
    ) -> Result<(), ReconcileError> {
        // The engine gates on the handle already; this guard keeps the
        // controller safe under direct invocation too.
        if steward_track::handle(cr).is_some() {
            return Ok(());
        }
        let body = ProjectCreate {
            name: cr.spec.name.clone(),
            description: cr.spec.description.clone(),
        };
        let op = api::projects::create(&*self.client, &body).await?;
        steward_track::start_tracking(cr, &op.id);
        Ok(())
    }

    async fn update(
        &self,
        cr: &mut ManagedResource<ProjectSpec>,
    ) -> Result<(), ReconcileError> {
        let Some(id) = cr.status.external_id.clone() else {
            return Ok(());
        };
        let op =
            api::projects::update(&*self.client, &id, cr.spec.description.as_deref()).await?;
        steward_track::start_tracking(cr, &op.id);
        Ok(())
    }

    async fn delete(
        &self,
        cr: &mut ManagedResource<ProjectSpec>,
    ) -> Result<(), ReconcileError> {
        // Never confirmed externally: nothing to tear down.
        let Some(id) = cr.status.external_id.clone() else {
            return Ok(());
        };
        match api::projects::delete(&*self.client, &id).await {
            Ok(_op) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn poll_operation(
        &self,
        cr: &ManagedResource<ProjectSpec>,
    ) -> Result<Option<TrackedOperation>, ReconcileError> {
        Ok(steward_track::poll(&*self.client, cr).await?)
    }
}

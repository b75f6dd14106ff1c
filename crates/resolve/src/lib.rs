//! Steward resolve: turn weak references into concrete external coordinates.
//!
//! A reference failing to resolve in the store is a configuration error,
//! kept distinct from "external object not found" so the state machine can
//! tell the two apart. Descriptors are re-resolved on every use: they are
//! organization-scoped and change if the referent is recreated.

#![forbid(unsafe_code)]

use steward_client::{api, ApiClient, ApiError};
use steward_core::{ManagedResource, Reference};
use steward_store::{Store, StoreError};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("reference not found in store: {0}")]
    ReferenceNotFound(String),
    #[error("referenced resource {0} has not been provisioned externally yet")]
    NotYetProvisioned(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Direct store lookup by name/namespace.
pub async fn resolve<S: Clone + Send + Sync + 'static>(
    store: &dyn Store<S>,
    reference: &Reference,
    fallback_ns: Option<&str>,
) -> Result<ManagedResource<S>, ResolveError> {
    let key = reference.to_key(fallback_ns);
    store
        .get(key.namespace.as_deref(), &key.name)
        .await?
        .ok_or_else(|| ResolveError::ReferenceNotFound(key.to_string()))
}

/// Resolve a reference and require its confirmed external identifier.
///
/// `NotYetProvisioned` is a transient condition: the referent exists in the
/// store but its own reconcile has not confirmed the external object yet.
pub async fn resolve_external_id<S: Clone + Send + Sync + 'static>(
    store: &dyn Store<S>,
    reference: &Reference,
    fallback_ns: Option<&str>,
) -> Result<String, ResolveError> {
    let cr = resolve(store, reference, fallback_ns).await?;
    cr.status
        .external_id
        .clone()
        .ok_or_else(|| ResolveError::NotYetProvisioned(cr.key().to_string()))
}

/// Descriptor lookup keyed by the referent's stable storage key. Never
/// cached.
pub async fn resolve_descriptor(
    client: &dyn ApiClient,
    storage_key: &str,
) -> Result<String, ResolveError> {
    let descriptor = api::graph::descriptor(client, storage_key).await?;
    debug!(storage_key = %storage_key, "descriptor resolved");
    Ok(descriptor)
}

/// Batch variant used when composing membership sets. All-or-nothing: one
/// bad reference aborts the whole call with no partial results, so
/// membership reconciliation can never apply a half-resolved grant set.
pub async fn resolve_many<S: Clone + Send + Sync + 'static>(
    store: &dyn Store<S>,
    client: &dyn ApiClient,
    references: &[Reference],
    fallback_ns: Option<&str>,
) -> Result<Vec<String>, ResolveError> {
    let mut out = Vec::with_capacity(references.len());
    for reference in references {
        let storage_key = resolve_external_id(store, reference, fallback_ns).await?;
        out.push(resolve_descriptor(client, &storage_key).await?);
    }
    Ok(out)
}

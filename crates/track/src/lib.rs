//! Steward track: correlate a record with a remote long-running operation.
//!
//! The operation ID lives in an annotation on the record, not in memory, so
//! a crash between issuing a create and observing its completion cannot lose
//! the correlation. Callers persist the record (via the store) immediately
//! after [`start_tracking`] and after [`clear`].

#![forbid(unsafe_code)]

use steward_client::api::{operations, OperationReference, OperationStatus};
use steward_client::{ApiClient, ApiError};
use steward_core::ManagedResource;
use tracing::{debug, warn};

/// Annotation key holding the in-flight operation ID.
pub const OPERATION_ANNOTATION: &str = "steward.io/operation-id";

/// The tracked operation's current state as seen by the external service.
#[derive(Debug, Clone)]
pub struct TrackedOperation {
    pub id: String,
    pub status: OperationStatus,
    pub detail: Option<String>,
}

/// The in-flight operation ID, if any.
pub fn handle<S>(cr: &ManagedResource<S>) -> Option<&str> {
    cr.meta.annotations.get(OPERATION_ANNOTATION).map(|s| s.as_str())
}

/// Record the operation ID on the resource. Must be persisted by the caller
/// before returning from Create/Update.
pub fn start_tracking<S>(cr: &mut ManagedResource<S>, operation_id: &str) {
    debug!(key = %cr.key(), operation = %operation_id, "tracking operation");
    cr.meta
        .annotations
        .insert(OPERATION_ANNOTATION.to_string(), operation_id.to_string());
}

/// Drop the handle. Returns whether one was present.
pub fn clear<S>(cr: &mut ManagedResource<S>) -> bool {
    cr.meta.annotations.remove(OPERATION_ANNOTATION).is_some()
}

/// Fetch the tracked operation's current status, if a handle exists.
///
/// An operation ID the service no longer knows (expired record) comes back
/// as a terminal `Cancelled` status: the caller clears the handle and the
/// next observe re-derives the truth from the external system, so a create
/// that actually succeeded is found rather than repeated.
pub async fn poll<S>(
    client: &dyn ApiClient,
    cr: &ManagedResource<S>,
) -> Result<Option<TrackedOperation>, ApiError> {
    let Some(id) = handle(cr) else {
        return Ok(None);
    };
    match operations::get(client, id).await? {
        Some(OperationReference { id, status, result_message }) => {
            Ok(Some(TrackedOperation { id, status, detail: result_message }))
        }
        None => {
            warn!(key = %cr.key(), operation = %id, "operation record no longer available");
            Ok(Some(TrackedOperation {
                id: id.to_string(),
                status: OperationStatus::Cancelled,
                detail: Some("operation record no longer available".to_string()),
            }))
        }
    }
}

//! Resource-kind controllers plugged into the reconciliation engine.

pub mod group;
pub mod permission;
pub mod project;
pub mod queue;
pub mod repository;

pub use group::{GroupController, GroupSpec};
pub use permission::{PermissionController, PermissionSpec};
pub use project::{ProjectController, ProjectSpec};
pub use queue::{QueueController, QueueSpec};
pub use repository::{RepositoryController, RepositorySpec};

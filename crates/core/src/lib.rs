//! Steward core types: the declarative record model shared by every controller.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod perm;

pub mod prelude {
    pub use super::{
        Condition, ConditionStatus, ConditionType, DeletionPolicy, ManagedResource, Meta,
        Reference, ResourceKey, ResourceStatus,
    };
}

/// Identity of a resource record inside the declarative store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Record metadata owned by the store, not by the external system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    pub name: String,
    pub namespace: Option<String>,
    /// Free-form annotations; the operation tracker persists its handle here
    /// so in-flight correlations survive a process restart.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Set by the store when a user requests deletion.
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Bumped by the store on every spec change.
    #[serde(default)]
    pub generation: u64,
}

/// Governs whether external deletion happens when the record is deleted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Orphan,
}

/// Well-known condition types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionType {
    Ready,
    Synced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Observed external state attached to a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Set iff the external object has been confirmed to exist at least once.
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub conditions: SmallVec<[Condition; 4]>,
    /// Raw observed fields from the last successful lookup.
    #[serde(default)]
    pub observed: serde_json::Value,
}

impl ResourceStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Replace the condition of the given type; at most one entry per type.
    /// The transition time only moves when the status actually flips.
    pub fn set_condition(&mut self, type_: ConditionType, status: ConditionStatus, reason: &str) {
        let now = Utc::now();
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_string();
            }
            None => self.conditions.push(Condition {
                type_,
                status,
                reason: reason.to_string(),
                last_transition_time: now,
            }),
        }
    }
}

/// A named, namespaced declarative record: desired spec plus observed status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedResource<S> {
    pub meta: Meta,
    pub spec: S,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

impl<S> ManagedResource<S> {
    pub fn new(namespace: Option<&str>, name: &str, spec: S) -> Self {
        Self {
            meta: Meta {
                name: name.to_string(),
                namespace: namespace.map(|s| s.to_string()),
                ..Meta::default()
            },
            spec,
            status: ResourceStatus::default(),
            deletion_policy: DeletionPolicy::default(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey { namespace: self.meta.namespace.clone(), name: self.meta.name.clone() }
    }

    pub fn marked_for_deletion(&self) -> bool {
        self.meta.deletion_timestamp.is_some()
    }
}

/// Weak pointer to another record; resolved at use time, never cached
/// across reconciles (the referent may itself change).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl Reference {
    pub fn to_key(&self, fallback_ns: Option<&str>) -> ResourceKey {
        ResourceKey {
            namespace: self.namespace.clone().or_else(|| fallback_ns.map(|s| s.to_string())),
            name: self.name.clone(),
        }
    }
}

/// One access-control entry: a subject plus allow/deny bit sets over the
/// fixed permission enumeration shared with the external system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlEntry {
    pub descriptor: String,
    pub allow: u64,
    pub deny: u64,
}

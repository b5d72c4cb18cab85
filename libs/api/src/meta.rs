//! Object metadata shared by every resource kind.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::KeyError;

// =============================================================================
// Resource
// =============================================================================

/// A stored object kind.
///
/// Everything the object store holds implements this so that stores, caches
/// and controllers can be written once over all kinds.
pub trait Resource: Clone + fmt::Debug + Send + Sync + 'static {
    /// Kind name, used in owner references and logs.
    const KIND: &'static str;

    /// Object metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Mutable object metadata.
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Namespace/name key of this object.
    fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.meta().namespace, &self.meta().name)
    }

    /// Returns true once deletion of this object has been requested.
    fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

// =============================================================================
// ObjectMeta
// =============================================================================

/// Identity, labels, ownership and version of a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    /// Empty for cluster-scoped objects such as nodes.
    #[serde(default)]
    pub namespace: String,

    /// Assigned by the store on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    /// Optimistic concurrency token. Bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Create metadata for a new object.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Builder-style label setter.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Returns the label value for `key`, if present.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Returns the controlling owner, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    /// Returns true if any owner reference points at `kind`/`name`.
    pub fn is_owned_by(&self, kind: &str, name: &str) -> bool {
        self.owner_references
            .iter()
            .any(|r| r.kind == kind && r.name == name)
    }
}

/// Reference from a dependent object to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,
    #[serde(default)]
    pub controller: bool,
}

impl OwnerReference {
    /// Controlling reference to `owner`.
    pub fn controlled_by<R: Resource>(owner: &R) -> Self {
        Self {
            kind: R::KIND.to_string(),
            name: owner.meta().name.clone(),
            uid: owner.meta().uid,
            controller: true,
        }
    }
}

// =============================================================================
// ObjectKey
// =============================================================================

/// Namespace/name pair identifying an object within its kind.
///
/// The string form `namespace/name` is what the work queues carry. A key for a
/// cluster-scoped object is just `name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(KeyError::Empty);
        }

        let mut parts = s.split('/');
        let key = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Self::new("", name),
            (Some(namespace), Some(name), None) => Self::new(namespace, name),
            _ => return Err(KeyError::Malformed(s.to_string())),
        };

        if key.name.is_empty() {
            return Err(KeyError::EmptyName(s.to_string()));
        }
        Ok(key)
    }
}

// =============================================================================
// LabelSelector
// =============================================================================

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector that matches every object.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring a single label.
    pub fn from_label(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and(key, value)
    }

    /// Add another required label.
    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Returns true if `labels` carries every required label.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

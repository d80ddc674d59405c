//! gatesync core types: resources, statuses, snapshots and the errors shared
//! by every backend.

#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

mod error;
mod hash;
mod opts;
mod snapshot;
mod status;

pub use error::{ClientError, ClientResult};
pub use hash::Fnv64;
pub use opts::{queue_cap, refresh_rate, DeleteOpts, ListOpts, ReadOpts, Selector, WatchOpts, WriteOpts};
pub use snapshot::Snapshot;
pub use status::{merge_status, ReporterStatus, State, Status};

/// Namespace used for writes that do not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

pub mod prelude {
    pub use super::{
        ClientError, ClientResult, DeleteOpts, Kind, ListOpts, Metadata, ReadOpts, Resource, ResourceList,
        ResourceRef, Snapshot, State, Status, WatchOpts, WriteOpts,
    };
}

/// Comparable tag naming a resource kind, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(Cow<'static, str>);

impl Kind {
    pub const UPSTREAM: Kind = Kind::from_static("Upstream");
    pub const VIRTUAL_SERVICE: Kind = Kind::from_static("VirtualService");
    pub const GATEWAY: Kind = Kind::from_static("Gateway");
    pub const PROXY: Kind = Kind::from_static("Proxy");
    pub const AUTH_CONFIG: Kind = Kind::from_static("AuthConfig");
    pub const SECRET: Kind = Kind::from_static("Secret");
    pub const ARTIFACT: Kind = Kind::from_static("Artifact");
    pub const SCHEMA: Kind = Kind::from_static("Schema");
    pub const RESOLVER_MAP: Kind = Kind::from_static("ResolverMap");

    pub const fn from_static(name: &'static str) -> Self { Kind(Cow::Borrowed(name)) }

    pub fn new(name: impl Into<String>) -> Self { Kind(Cow::Owned(name.into())) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    /// Opaque optimistic-concurrency token assigned by the backend on write.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), ..Default::default() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// A declarative configuration object of any kind.
///
/// `Clone` is the deep copy: every field is owned, so a clone never aliases
/// the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: Kind,
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

pub type ResourceList = Vec<Resource>;

impl Resource {
    pub fn new(kind: Kind, metadata: Metadata, spec: serde_json::Value) -> Self {
        Self { kind, metadata, spec, status: None }
    }

    /// Build a resource from a typed spec value.
    pub fn with_spec<T: Serialize>(kind: Kind, metadata: Metadata, spec: &T) -> ClientResult<Self> {
        let spec = serde_json::to_value(spec).map_err(|e| ClientError::Conversion {
            kind: kind.clone(),
            namespace: metadata.namespace.clone(),
            name: metadata.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(kind, metadata, spec))
    }

    /// Decode the spec into a typed view.
    pub fn decode_spec<T: DeserializeOwned>(&self) -> ClientResult<T> {
        T::deserialize(&self.spec).map_err(|e| ClientError::Conversion {
            kind: self.kind.clone(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
            reason: e.to_string(),
        })
    }

    pub fn namespace(&self) -> &str { &self.metadata.namespace }
    pub fn name(&self) -> &str { &self.metadata.name }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef { kind: self.kind.clone(), namespace: self.metadata.namespace.clone(), name: self.metadata.name.clone() }
    }

    /// Structural hash excluding `resource_version` and `status`.
    pub fn content_hash(&self) -> u64 {
        let mut h = Fnv64::new();
        self.hash_content(&mut h);
        h.finish()
    }

    /// Structural equality with the same exclusions as [`Resource::content_hash`].
    pub fn content_eq(&self, other: &Resource) -> bool {
        self.kind == other.kind
            && self.metadata.namespace == other.metadata.namespace
            && self.metadata.name == other.metadata.name
            && self.metadata.labels == other.metadata.labels
            && self.metadata.annotations == other.metadata.annotations
            && self.spec == other.spec
    }

    pub(crate) fn hash_content(&self, h: &mut Fnv64) {
        h.write_str(self.kind.as_str());
        h.write_str(&self.metadata.namespace);
        h.write_str(&self.metadata.name);
        h.write_map(&self.metadata.labels);
        h.write_map(&self.metadata.annotations);
        h.write_json(&self.spec);
    }
}

/// Identity of a resource across kinds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Sort by `(namespace, name)`, the order every backend delivers in.
pub fn sort_list(list: &mut ResourceList) {
    list.sort_by(|a, b| a.metadata.namespace.cmp(&b.metadata.namespace).then_with(|| a.metadata.name.cmp(&b.metadata.name)));
}

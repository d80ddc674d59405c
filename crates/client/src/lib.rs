//! gatesync resource clients: the per-kind CRUD + watch contract every
//! storage backend implements, plus the in-memory and flat-file backends.
//!
//! Watch contract:
//! - the first delivery is the complete current list, sent immediately;
//! - every later delivery is again a complete list for the namespace, never a delta;
//! - cancelling `WatchOpts::cancel` stops the watch and closes both channels.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use gatesync_core::prelude::*;
use gatesync_core::DEFAULT_NAMESPACE;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod file;
mod memory;
mod recording;

pub use file::FileResourceClient;
pub use memory::MemoryResourceClient;
pub use recording::{Op, RecordingClient};

/// Channels of a running watch.
pub struct Watch {
    pub lists: mpsc::Receiver<ResourceList>,
    pub errors: mpsc::Receiver<ClientError>,
}

/// CRUD + watch for a single resource kind.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    fn kind(&self) -> &Kind;

    async fn read(&self, namespace: &str, name: &str, opts: ReadOpts) -> ClientResult<Resource>;

    /// Create or update. Returns the stored resource carrying its new resource version.
    async fn write(&self, resource: Resource, opts: WriteOpts) -> ClientResult<Resource>;

    async fn delete(&self, namespace: &str, name: &str, opts: DeleteOpts) -> ClientResult<()>;

    /// An empty namespace lists every namespace.
    async fn list(&self, namespace: &str, opts: ListOpts) -> ClientResult<ResourceList>;

    async fn watch(&self, namespace: &str, opts: WatchOpts) -> ClientResult<Watch>;
}

/// Clients keyed by the kind they serve, built once at startup.
#[derive(Clone, Default)]
pub struct KindRegistry {
    clients: BTreeMap<Kind, Arc<dyn ResourceClient>>,
}

impl KindRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, client: Arc<dyn ResourceClient>) {
        self.clients.insert(client.kind().clone(), client);
    }

    pub fn with(mut self, client: Arc<dyn ResourceClient>) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, kind: &Kind) -> ClientResult<Arc<dyn ResourceClient>> {
        self.clients.get(kind).cloned().ok_or_else(|| ClientError::UnknownKind(kind.clone()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &Kind> { self.clients.keys() }

    pub fn len(&self) -> usize { self.clients.len() }
    pub fn is_empty(&self) -> bool { self.clients.is_empty() }
}

/// Fill defaults and reject resources this client cannot store.
pub fn normalize_for_write(kind: &Kind, resource: &mut Resource) -> ClientResult<()> {
    if resource.kind != *kind {
        return Err(ClientError::Backend(anyhow!(
            "{} client cannot write {} {}/{}",
            kind, resource.kind, resource.metadata.namespace, resource.metadata.name
        )));
    }
    if resource.metadata.name.is_empty() {
        return Err(ClientError::Backend(anyhow!("{} resource name must not be empty", kind)));
    }
    if resource.metadata.namespace.is_empty() {
        resource.metadata.namespace = DEFAULT_NAMESPACE.to_string();
    }
    Ok(())
}

/// Apply the create/overwrite and optimistic-concurrency rules against the
/// currently stored object, if any.
pub fn check_write(existing: Option<&Resource>, incoming: &Resource, opts: WriteOpts) -> ClientResult<()> {
    let Some(cur) = existing else { return Ok(()) };
    if !opts.overwrite_existing {
        return Err(ClientError::already_exists(&incoming.kind, incoming.namespace(), incoming.name()));
    }
    let given = &incoming.metadata.resource_version;
    if !given.is_empty() && *given != cur.metadata.resource_version {
        return Err(ClientError::VersionConflict {
            kind: incoming.kind.clone(),
            namespace: incoming.metadata.namespace.clone(),
            name: incoming.metadata.name.clone(),
            given: given.clone(),
            current: cur.metadata.resource_version.clone(),
        });
    }
    Ok(())
}

/// Filter used by list/watch: empty namespace matches all.
pub fn matches(resource: &Resource, namespace: &str, selector: &gatesync_core::Selector) -> bool {
    (namespace.is_empty() || resource.metadata.namespace == namespace) && selector.matches(&resource.metadata.labels)
}

/// Send unless the watch is cancelled first. Returns false when the watch should stop.
pub async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, value: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        res = tx.send(value) => res.is_ok(),
    }
}

//! Client wrapper that records mutating calls and can inject failures.
//! Used to assert how many writes a reconcile or report pass issued.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use gatesync_core::prelude::*;

use crate::{ResourceClient, Watch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Write { namespace: String, name: String, overwrite: bool },
    Delete { namespace: String, name: String },
}

#[derive(Clone)]
pub struct RecordingClient {
    inner: Arc<dyn ResourceClient>,
    ops: Arc<Mutex<Vec<Op>>>,
    failing: Arc<Mutex<BTreeSet<String>>>,
}

impl RecordingClient {
    pub fn new(inner: Arc<dyn ResourceClient>) -> Self {
        Self { inner, ops: Arc::default(), failing: Arc::default() }
    }

    pub fn ops(&self) -> Vec<Op> { self.ops.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    pub fn clear(&self) { self.ops.lock().unwrap_or_else(PoisonError::into_inner).clear(); }

    /// Make every write and delete of `name` fail with a backend error.
    pub fn fail_on(&self, name: &str) {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner).insert(name.to_string());
    }

    fn record(&self, op: Op) { self.ops.lock().unwrap_or_else(PoisonError::into_inner).push(op); }

    fn injected(&self, name: &str) -> ClientResult<()> {
        if self.failing.lock().unwrap_or_else(PoisonError::into_inner).contains(name) {
            return Err(ClientError::Backend(anyhow!("injected failure for {}", name)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceClient for RecordingClient {
    fn kind(&self) -> &Kind { self.inner.kind() }

    async fn read(&self, namespace: &str, name: &str, opts: ReadOpts) -> ClientResult<Resource> {
        self.inner.read(namespace, name, opts).await
    }

    async fn write(&self, resource: Resource, opts: WriteOpts) -> ClientResult<Resource> {
        self.record(Op::Write {
            namespace: resource.metadata.namespace.clone(),
            name: resource.metadata.name.clone(),
            overwrite: opts.overwrite_existing,
        });
        self.injected(&resource.metadata.name)?;
        self.inner.write(resource, opts).await
    }

    async fn delete(&self, namespace: &str, name: &str, opts: DeleteOpts) -> ClientResult<()> {
        self.record(Op::Delete { namespace: namespace.to_string(), name: name.to_string() });
        self.injected(name)?;
        self.inner.delete(namespace, name, opts).await
    }

    async fn list(&self, namespace: &str, opts: ListOpts) -> ClientResult<ResourceList> {
        self.inner.list(namespace, opts).await
    }

    async fn watch(&self, namespace: &str, opts: WatchOpts) -> ClientResult<Watch> {
        self.inner.watch(namespace, opts).await
    }
}

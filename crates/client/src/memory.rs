//! In-memory backend. Every write publishes the kind's full contents at
//! write time, so each watcher sees every change as a complete list even
//! when writes arrive faster than it drains them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use gatesync_core::prelude::*;
use gatesync_core::{queue_cap, sort_list};
use metrics::counter;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::{check_write, matches, normalize_for_write, send_or_cancel, ResourceClient, Watch};

type Key = (String, String);

struct Inner {
    items: BTreeMap<Key, Resource>,
    next_rv: u64,
}

struct Shared {
    state: Mutex<Inner>,
    changes: broadcast::Sender<Arc<ResourceList>>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn filtered(&self, namespace: &str, selector: &gatesync_core::Selector) -> ResourceList {
        let inner = self.lock();
        inner.items.values().filter(|r| matches(r, namespace, selector)).cloned().collect()
    }
}

/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct MemoryResourceClient {
    kind: Kind,
    shared: Arc<Shared>,
}

impl MemoryResourceClient {
    pub fn new(kind: Kind) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self { kind, shared: Arc::new(Shared { state: Mutex::new(Inner { items: BTreeMap::new(), next_rv: 1 }), changes }) }
    }

    fn publish(&self, inner: &Inner) {
        let all: ResourceList = inner.items.values().cloned().collect();
        // No receivers is fine; nobody is watching yet.
        let _ = self.shared.changes.send(Arc::new(all));
    }
}

#[async_trait::async_trait]
impl ResourceClient for MemoryResourceClient {
    fn kind(&self) -> &Kind { &self.kind }

    async fn read(&self, namespace: &str, name: &str, _opts: ReadOpts) -> ClientResult<Resource> {
        let inner = self.shared.lock();
        inner
            .items
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClientError::not_found(&self.kind, namespace, name))
    }

    async fn write(&self, mut resource: Resource, opts: WriteOpts) -> ClientResult<Resource> {
        normalize_for_write(&self.kind, &mut resource)?;
        let key = (resource.metadata.namespace.clone(), resource.metadata.name.clone());
        let mut inner = self.shared.lock();
        let existing = inner.items.get(&key);
        check_write(existing, &resource, opts)?;
        let updating = existing.is_some();
        resource.metadata.resource_version = inner.next_rv.to_string();
        inner.next_rv += 1;
        inner.items.insert(key, resource.clone());
        if updating {
            counter!("client_updates", 1u64, "kind" => self.kind.to_string());
        } else {
            counter!("client_creates", 1u64, "kind" => self.kind.to_string());
        }
        debug!(kind = %self.kind, ns = %resource.metadata.namespace, name = %resource.metadata.name, rv = %resource.metadata.resource_version, "memory: write");
        self.publish(&inner);
        Ok(resource)
    }

    async fn delete(&self, namespace: &str, name: &str, opts: DeleteOpts) -> ClientResult<()> {
        let mut inner = self.shared.lock();
        if inner.items.remove(&(namespace.to_string(), name.to_string())).is_none() {
            if opts.ignore_not_exist {
                return Ok(());
            }
            return Err(ClientError::not_found(&self.kind, namespace, name));
        }
        counter!("client_deletes", 1u64, "kind" => self.kind.to_string());
        debug!(kind = %self.kind, ns = %namespace, name = %name, "memory: delete");
        self.publish(&inner);
        Ok(())
    }

    async fn list(&self, namespace: &str, opts: ListOpts) -> ClientResult<ResourceList> {
        let mut list = self.shared.filtered(namespace, &opts.selector);
        sort_list(&mut list);
        Ok(list)
    }

    async fn watch(&self, namespace: &str, opts: WatchOpts) -> ClientResult<Watch> {
        // Subscribe before the initial list so no write falls in between.
        let mut changes = self.shared.changes.subscribe();
        let initial = self.list(namespace, opts.list_opts()).await?;
        let (list_tx, lists) = mpsc::channel(queue_cap());
        // Nothing in this backend fails after registration; the sender is
        // held so the error channel closes together with the list channel.
        let (err_tx, errors) = mpsc::channel::<ClientError>(1);
        let shared = Arc::clone(&self.shared);
        let kind = self.kind.clone();
        let namespace = namespace.to_string();

        tokio::spawn(async move {
            let _err_tx = err_tx;
            let cancel = opts.cancel;
            let mut last = initial.clone();
            if !send_or_cancel(&list_tx, initial, &cancel).await {
                return;
            }
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    msg = changes.recv() => match msg {
                        Ok(all) => {
                            let mut l: ResourceList = all.iter().filter(|r| matches(r, &namespace, &opts.selector)).cloned().collect();
                            sort_list(&mut l);
                            l
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(kind = %kind, ns = %namespace, skipped = n, "memory: watcher lagged; relisting");
                            let mut l = shared.filtered(&namespace, &opts.selector);
                            sort_list(&mut l);
                            l
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if next == last {
                    continue;
                }
                last = next.clone();
                if !send_or_cancel(&list_tx, next, &cancel).await {
                    break;
                }
            }
            debug!(kind = %kind, ns = %namespace, "memory: watch stopped");
        });

        Ok(Watch { lists, errors })
    }
}

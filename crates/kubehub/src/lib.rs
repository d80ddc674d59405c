//! gatesync kubehub: resources stored as Kubernetes custom resources.
//!
//! Each resource is one CR; `spec` and `status` live in the object body and
//! labels, annotations and resourceVersion in `ObjectMeta`. Watches fold kube
//! watch events into a local copy and relist on each refresh tick, so
//! subscribers always receive complete lists.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use gatesync_client::{check_write, send_or_cancel, KindRegistry, ResourceClient, Watch};
use gatesync_core::prelude::*;
use gatesync_core::{queue_cap, sort_list, Selector};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a served resource via API discovery; errors when the CRD is not installed.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Build a registry with one CRD client per `(kind, gvk key)` pair.
pub async fn registry_from_crds(client: Client, crds: &[(Kind, String)]) -> Result<KindRegistry> {
    let mut registry = KindRegistry::new();
    for (kind, key) in crds {
        let c = KubeResourceClient::discover(client.clone(), kind.clone(), key).await?;
        registry.register(std::sync::Arc::new(c));
    }
    Ok(registry)
}

#[derive(Clone)]
pub struct KubeResourceClient {
    kind: Kind,
    client: Client,
    ar: ApiResource,
}

impl KubeResourceClient {
    pub fn new(client: Client, kind: Kind, ar: ApiResource) -> Self { Self { kind, client, ar } }

    pub async fn discover(client: Client, kind: Kind, gvk_key: &str) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        if !namespaced {
            return Err(anyhow!("{} is cluster-scoped; gatesync kinds must be namespaced", gvk_key));
        }
        info!(kind = %kind, gvk = %gvk_key, plural = %ar.plural, "kube: client ready");
        Ok(Self::new(client, kind, ar))
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &self.ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &self.ar)
        }
    }
}

fn list_params(selector: &Selector) -> ListParams {
    if selector.is_empty() { ListParams::default() } else { ListParams::default().labels(&selector.to_label_selector()) }
}

fn some_map(m: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if m.is_empty() { None } else { Some(m.clone()) }
}

/// Domain resource -> custom resource.
pub fn to_dynamic(ar: &ApiResource, r: &Resource) -> Result<DynamicObject> {
    let mut obj = DynamicObject::new(&r.metadata.name, ar).within(&r.metadata.namespace);
    obj.metadata = ObjectMeta {
        name: Some(r.metadata.name.clone()),
        namespace: Some(r.metadata.namespace.clone()),
        labels: some_map(&r.metadata.labels),
        annotations: some_map(&r.metadata.annotations),
        resource_version: if r.metadata.resource_version.is_empty() { None } else { Some(r.metadata.resource_version.clone()) },
        ..Default::default()
    };
    let mut body = serde_json::Map::new();
    body.insert("spec".into(), r.spec.clone());
    if let Some(status) = &r.status {
        body.insert("status".into(), serde_json::to_value(status).context("encoding status")?);
    }
    obj.data = serde_json::Value::Object(body);
    Ok(obj)
}

/// Custom resource -> domain resource.
pub fn from_dynamic(kind: &Kind, obj: &DynamicObject) -> ClientResult<Resource> {
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let name = obj.metadata.name.clone().unwrap_or_default();
    let conversion = |reason: String| ClientError::Conversion { kind: kind.clone(), namespace: namespace.clone(), name: name.clone(), reason };
    if name.is_empty() {
        return Err(conversion("object missing metadata.name".into()));
    }
    let spec = obj.data.get("spec").cloned().unwrap_or(serde_json::Value::Null);
    let status = match obj.data.get("status") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => Some(serde_json::from_value::<Status>(v.clone()).map_err(|e| conversion(format!("status: {}", e)))?),
    };
    let metadata = Metadata {
        namespace: namespace.clone(),
        name: name.clone(),
        resource_version: obj.metadata.resource_version.clone().unwrap_or_default(),
        labels: obj.metadata.labels.clone().unwrap_or_default(),
        annotations: obj.metadata.annotations.clone().unwrap_or_default(),
    };
    Ok(Resource { kind: kind.clone(), metadata, spec, status })
}

/// Map API server failures onto the client error taxonomy.
pub fn map_kube_err(kind: &Kind, namespace: &str, name: &str, given_rv: &str, e: kube::Error) -> ClientError {
    if let kube::Error::Api(resp) = &e {
        match (resp.code, resp.reason.as_str()) {
            (404, _) => return ClientError::not_found(kind, namespace, name),
            (409, "AlreadyExists") => return ClientError::already_exists(kind, namespace, name),
            (409, _) => {
                return ClientError::VersionConflict {
                    kind: kind.clone(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    given: given_rv.to_string(),
                    current: String::new(),
                }
            }
            _ => {}
        }
    }
    ClientError::Backend(anyhow::Error::new(e).context(format!("{} {}/{}", kind, namespace, name)))
}

/// Objects seen by one watch, kept current from watcher events.
#[derive(Debug, Default)]
struct WatchState {
    items: BTreeMap<(String, String), Resource>,
}

impl WatchState {
    fn from_list(list: ResourceList) -> Self {
        let items = list.into_iter().map(|r| ((r.metadata.namespace.clone(), r.metadata.name.clone()), r)).collect();
        Self { items }
    }

    fn key(obj: &DynamicObject) -> (String, String) {
        (obj.metadata.namespace.clone().unwrap_or_default(), obj.metadata.name.clone().unwrap_or_default())
    }

    fn upsert(&mut self, kind: &Kind, obj: &DynamicObject) {
        match from_dynamic(kind, obj) {
            Ok(r) => {
                self.items.insert(Self::key(obj), r);
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "kube: object skipped");
                self.items.remove(&Self::key(obj));
            }
        }
    }

    fn apply(&mut self, kind: &Kind, event: watcher::Event<DynamicObject>) {
        match event {
            watcher::Event::Applied(obj) => self.upsert(kind, &obj),
            watcher::Event::Deleted(obj) => {
                self.items.remove(&Self::key(&obj));
            }
            watcher::Event::Restarted(objs) => {
                debug!(kind = %kind, count = objs.len(), "kube: watch restart");
                self.items.clear();
                for obj in objs.iter() {
                    self.upsert(kind, obj);
                }
            }
        }
    }

    /// Current contents, ordered by namespace then name.
    fn list(&self) -> ResourceList { self.items.values().cloned().collect() }
}

#[async_trait::async_trait]
impl ResourceClient for KubeResourceClient {
    fn kind(&self) -> &Kind { &self.kind }

    async fn read(&self, namespace: &str, name: &str, _opts: ReadOpts) -> ClientResult<Resource> {
        let obj = self
            .api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err(&self.kind, namespace, name, "", e))?
            .ok_or_else(|| ClientError::not_found(&self.kind, namespace, name))?;
        from_dynamic(&self.kind, &obj)
    }

    async fn write(&self, mut resource: Resource, opts: WriteOpts) -> ClientResult<Resource> {
        gatesync_client::normalize_for_write(&self.kind, &mut resource)?;
        let (ns, name) = (resource.metadata.namespace.clone(), resource.metadata.name.clone());
        let given_rv = resource.metadata.resource_version.clone();
        let api = self.api(&ns);
        let live = api.get_opt(&name).await.map_err(|e| map_kube_err(&self.kind, &ns, &name, &given_rv, e))?;
        let live_rv = live.as_ref().map(|o| o.metadata.resource_version.clone().unwrap_or_default());
        let existing = live_rv.as_ref().map(|rv| {
            let mut m = Metadata::new(ns.clone(), name.clone());
            m.resource_version = rv.clone();
            Resource::new(self.kind.clone(), m, serde_json::Value::Null)
        });
        check_write(existing.as_ref(), &resource, opts)?;

        let pp = PostParams::default();
        let stored = match live_rv {
            Some(rv) => {
                if given_rv.is_empty() {
                    resource.metadata.resource_version = rv;
                }
                let obj = to_dynamic(&self.ar, &resource)?;
                let out = api.replace(&name, &pp, &obj).await.map_err(|e| map_kube_err(&self.kind, &ns, &name, &given_rv, e))?;
                counter!("client_updates", 1u64, "kind" => self.kind.to_string());
                out
            }
            None => {
                resource.metadata.resource_version.clear();
                let obj = to_dynamic(&self.ar, &resource)?;
                let out = api.create(&pp, &obj).await.map_err(|e| map_kube_err(&self.kind, &ns, &name, &given_rv, e))?;
                counter!("client_creates", 1u64, "kind" => self.kind.to_string());
                out
            }
        };
        debug!(kind = %self.kind, ns = %ns, name = %name, rv = ?stored.metadata.resource_version, "kube: write");
        from_dynamic(&self.kind, &stored)
    }

    async fn delete(&self, namespace: &str, name: &str, opts: DeleteOpts) -> ClientResult<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                counter!("client_deletes", 1u64, "kind" => self.kind.to_string());
                debug!(kind = %self.kind, ns = %namespace, name = %name, "kube: delete");
                Ok(())
            }
            Err(e) => match map_kube_err(&self.kind, namespace, name, "", e) {
                ClientError::NotFound { .. } if opts.ignore_not_exist => Ok(()),
                err => Err(err),
            },
        }
    }

    async fn list(&self, namespace: &str, opts: ListOpts) -> ClientResult<ResourceList> {
        let objs = self
            .api(namespace)
            .list(&list_params(&opts.selector))
            .await
            .map_err(|e| ClientError::Backend(anyhow::Error::new(e).context(format!("listing {} in {:?}", self.kind, namespace))))?;
        let mut out = Vec::with_capacity(objs.items.len());
        for obj in objs.items.iter() {
            match from_dynamic(&self.kind, obj) {
                Ok(r) => out.push(r),
                Err(e) => warn!(kind = %self.kind, error = %e, "kube: object skipped"),
            }
        }
        sort_list(&mut out);
        Ok(out)
    }

    async fn watch(&self, namespace: &str, opts: WatchOpts) -> ClientResult<Watch> {
        let initial = self.list(namespace, opts.list_opts()).await.map_err(|e| ClientError::WatchInit {
            kind: self.kind.clone(),
            namespace: namespace.to_string(),
            reason: e.to_string(),
        })?;
        let (list_tx, lists) = mpsc::channel(queue_cap());
        let (err_tx, errors) = mpsc::channel(queue_cap());
        let me = self.clone();
        let namespace = namespace.to_string();
        let mut cfg = watcher::Config::default();
        if !opts.selector.is_empty() {
            cfg = cfg.labels(&opts.selector.to_label_selector());
        }
        let api = self.api(&namespace);
        info!(kind = %self.kind, ns = %namespace, "kube: watch started");

        tokio::spawn(async move {
            let cancel = opts.cancel.clone();
            let mut state = WatchState::from_list(initial.clone());
            let mut last = initial.clone();
            if !send_or_cancel(&list_tx, initial, &cancel).await {
                return;
            }
            let stream = watcher::watcher(api, cfg).default_backoff();
            futures::pin_mut!(stream);
            let mut ticker = tokio::time::interval(opts.refresh_rate);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    ev = stream.next() => match ev {
                        Some(Ok(ev)) => state.apply(&me.kind, ev),
                        Some(Err(e)) => {
                            let err = ClientError::Backend(anyhow::Error::new(e).context(format!("watching {} in {:?}", me.kind, namespace)));
                            if !send_or_cancel(&err_tx, err, &cancel).await { break; }
                            continue;
                        }
                        None => {
                            warn!(kind = %me.kind, ns = %namespace, "kube: watcher stream ended");
                            break;
                        }
                    },
                    _ = ticker.tick() => match me.list(&namespace, opts.list_opts()).await {
                        Ok(list) => state = WatchState::from_list(list),
                        Err(e) => {
                            if !send_or_cancel(&err_tx, e, &cancel).await { break; }
                            continue;
                        }
                    },
                }
                let next = state.list();
                if next == last {
                    continue;
                }
                last = next.clone();
                if !send_or_cancel(&list_tx, next, &cancel).await {
                    break;
                }
            }
            debug!(kind = %me.kind, ns = %namespace, "kube: watch stopped");
        });

        Ok(Watch { lists, errors })
    }
}

//! Flat-file backend: one YAML document per resource at
//! `<root>/<namespace>/<name>.yaml`. Watches poll at the refresh rate.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use gatesync_core::prelude::*;
use gatesync_core::{queue_cap, sort_list};
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{check_write, matches, normalize_for_write, send_or_cancel, ResourceClient, Watch};

pub struct FileResourceClient {
    kind: Kind,
    root: PathBuf,
    // Serialises read-check-write sequences within this process.
    write_lock: Mutex<()>,
}

impl FileResourceClient {
    pub fn new(kind: Kind, root: impl Into<PathBuf>) -> Self {
        Self { kind, root: root.into(), write_lock: Mutex::new(()) }
    }

    pub fn root(&self) -> &Path { &self.root }

    fn path_for(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{}.yaml", name))
    }

    async fn read_opt(&self, namespace: &str, name: &str) -> ClientResult<Option<Resource>> {
        let path = self.path_for(namespace, name);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ClientError::Backend(anyhow::Error::new(e).context(format!("reading {}", path.display())))),
        };
        decode(&self.kind, namespace, name, &text).map(Some)
    }

    async fn list_namespace(&self, namespace: &str, out: &mut ResourceList) -> ClientResult<()> {
        let dir = self.root.join(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ClientError::Backend(anyhow::Error::new(e).context(format!("listing {}", dir.display())))),
        };
        while let Some(entry) = entries.next_entry().await.with_context(|| format!("listing {}", dir.display()))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(|s| s.to_string()) else { continue };
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(kind = %self.kind, path = %path.display(), error = %e, "file: unreadable resource skipped");
                    continue;
                }
            };
            match decode(&self.kind, namespace, &name, &text) {
                Ok(r) => out.push(r),
                Err(e) => warn!(kind = %self.kind, path = %path.display(), error = %e, "file: resource skipped"),
            }
        }
        Ok(())
    }

    async fn namespaces(&self) -> ClientResult<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(ClientError::Backend(anyhow::Error::new(e).context(format!("listing {}", self.root.display())))),
        };
        while let Some(entry) = entries.next_entry().await.with_context(|| format!("listing {}", self.root.display()))? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if let (true, Some(ns)) = (is_dir, entry.file_name().to_str()) {
                out.push(ns.to_string());
            }
        }
        Ok(out)
    }
}

/// Decode a stored document; the path decides namespace and name.
fn decode(kind: &Kind, namespace: &str, name: &str, text: &str) -> ClientResult<Resource> {
    let mut r: Resource = serde_yaml::from_str(text).map_err(|e| ClientError::Conversion {
        kind: kind.clone(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    if r.kind != *kind {
        return Err(ClientError::Conversion {
            kind: kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: format!("document holds kind {}", r.kind),
        });
    }
    r.metadata.namespace = namespace.to_string();
    r.metadata.name = name.to_string();
    Ok(r)
}

fn next_version(current: Option<&Resource>) -> String {
    let cur = current.and_then(|r| r.metadata.resource_version.parse::<u64>().ok()).unwrap_or(0);
    (cur + 1).to_string()
}

#[async_trait::async_trait]
impl ResourceClient for FileResourceClient {
    fn kind(&self) -> &Kind { &self.kind }

    async fn read(&self, namespace: &str, name: &str, _opts: ReadOpts) -> ClientResult<Resource> {
        self.read_opt(namespace, name).await?.ok_or_else(|| ClientError::not_found(&self.kind, namespace, name))
    }

    async fn write(&self, mut resource: Resource, opts: WriteOpts) -> ClientResult<Resource> {
        normalize_for_write(&self.kind, &mut resource)?;
        let _guard = self.write_lock.lock().await;
        let (ns, name) = (resource.metadata.namespace.clone(), resource.metadata.name.clone());
        let existing = self.read_opt(&ns, &name).await?;
        check_write(existing.as_ref(), &resource, opts)?;
        resource.metadata.resource_version = next_version(existing.as_ref());

        let path = self.path_for(&ns, &name);
        let dir = self.root.join(&ns);
        tokio::fs::create_dir_all(&dir).await.with_context(|| format!("creating {}", dir.display()))?;
        let text = serde_yaml::to_string(&resource).context("encoding resource as YAML")?;
        // Write-then-rename so pollers never observe a half-written file.
        let tmp = dir.join(format!(".{}.yaml.tmp", name));
        tokio::fs::write(&tmp, text).await.with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path).await.with_context(|| format!("renaming into {}", path.display()))?;

        if existing.is_some() {
            counter!("client_updates", 1u64, "kind" => self.kind.to_string());
        } else {
            counter!("client_creates", 1u64, "kind" => self.kind.to_string());
        }
        debug!(kind = %self.kind, path = %path.display(), rv = %resource.metadata.resource_version, "file: write");
        Ok(resource)
    }

    async fn delete(&self, namespace: &str, name: &str, opts: DeleteOpts) -> ClientResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(namespace, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                counter!("client_deletes", 1u64, "kind" => self.kind.to_string());
                debug!(kind = %self.kind, path = %path.display(), "file: delete");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if opts.ignore_not_exist { Ok(()) } else { Err(ClientError::not_found(&self.kind, namespace, name)) }
            }
            Err(e) => Err(ClientError::Backend(anyhow::Error::new(e).context(format!("deleting {}", path.display())))),
        }
    }

    async fn list(&self, namespace: &str, opts: ListOpts) -> ClientResult<ResourceList> {
        let mut out = Vec::new();
        if namespace.is_empty() {
            for ns in self.namespaces().await? {
                self.list_namespace(&ns, &mut out).await?;
            }
        } else {
            self.list_namespace(namespace, &mut out).await?;
        }
        out.retain(|r| matches(r, namespace, &opts.selector));
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
        let poller = FileResourceClient::new(self.kind.clone(), self.root.clone());
        let namespace = namespace.to_string();
        info!(kind = %self.kind, ns = %namespace, root = %self.root.display(), every = ?opts.refresh_rate, "file: watch started");

        tokio::spawn(async move {
            let cancel = opts.cancel.clone();
            let mut last = initial.clone();
            if !send_or_cancel(&list_tx, initial, &cancel).await {
                return;
            }
            let mut ticker = tokio::time::interval(opts.refresh_rate);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match poller.list(&namespace, opts.list_opts()).await {
                    Ok(next) => {
                        if next == last {
                            continue;
                        }
                        last = next.clone();
                        if !send_or_cancel(&list_tx, next, &cancel).await {
                            break;
                        }
                    }
                    Err(e) => {
                        if !send_or_cancel(&err_tx, e, &cancel).await {
                            break;
                        }
                    }
                }
            }
            debug!(kind = %poller.kind, ns = %namespace, "file: watch stopped");
        });

        Ok(Watch { lists, errors })
    }
}

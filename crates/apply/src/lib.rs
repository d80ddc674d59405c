//! gatesync apply: converges the resources of one kind in one namespace
//! toward a desired list with the fewest writes.
//!
//! Matching is by `(namespace, name)`. Matched pairs are written only when
//! their content differs; unmatched desired resources are created; unmatched
//! actual resources are deleted. Operations are independent: a failure is
//! recorded and the remaining operations still run.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use gatesync_client::ResourceClient;
use gatesync_core::prelude::*;
use gatesync_core::{sort_list, DEFAULT_NAMESPACE};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

/// Hook run on every matched pair before comparison. It may copy fields
/// from the actual resource (first argument) into the desired one.
pub type Transition = Arc<dyn Fn(&Resource, &mut Resource) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ReconcileSummary {
    /// Number of writes and deletes issued successfully.
    pub fn changes(&self) -> usize { self.created + self.updated + self.deleted }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} created, {} updated, {} deleted, {} unchanged", self.created, self.updated, self.deleted, self.unchanged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    List,
    Transition,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::List => "list",
            Operation::Transition => "transition",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct OperationFailure {
    pub op: Operation,
    pub namespace: String,
    pub name: String,
    pub error: anyhow::Error,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}: {:#}", self.op, self.namespace, self.name, self.error)
    }
}

/// Some operations failed. `summary` counts the ones that succeeded and
/// stay applied.
#[derive(Debug, thiserror::Error)]
#[error("reconcile {kind} in {namespace:?}: {} failed ({summary}): {}", .failures.len(), join_failures(.failures))]
pub struct ReconcileError {
    pub kind: Kind,
    pub namespace: String,
    pub summary: ReconcileSummary,
    pub failures: Vec<OperationFailure>,
}

fn join_failures(failures: &[OperationFailure]) -> String {
    failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
}

pub struct Reconciler {
    client: Arc<dyn ResourceClient>,
    transition: Option<Transition>,
}

impl Reconciler {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self { Self { client, transition: None } }

    pub fn with_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, &mut Resource) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.transition = Some(Arc::new(f));
        self
    }

    pub fn kind(&self) -> &Kind { self.client.kind() }

    /// Converge `namespace` toward `desired`. An empty `namespace` spans all
    /// namespaces; desired resources without a namespace adopt `namespace`
    /// (or the default namespace when that is empty too).
    pub async fn reconcile(&self, namespace: &str, desired: ResourceList, opts: ListOpts) -> Result<ReconcileSummary, ReconcileError> {
        let kind = self.client.kind().clone();
        let mut summary = ReconcileSummary::default();
        let mut failures = Vec::new();

        let actual = match self.client.list(namespace, opts).await {
            Ok(list) => list,
            Err(e) => {
                counter!("reconcile_errors", 1u64, "kind" => kind.to_string());
                let failure = OperationFailure { op: Operation::List, namespace: namespace.to_string(), name: String::new(), error: e.into() };
                return Err(ReconcileError { kind, namespace: namespace.to_string(), summary, failures: vec![failure] });
            }
        };
        let mut existing: FxHashMap<(String, String), Resource> =
            actual.into_iter().map(|r| ((r.metadata.namespace.clone(), r.metadata.name.clone()), r)).collect();

        let mut seen: FxHashSet<(String, String)> = FxHashSet::default();
        let mut creates = Vec::new();
        let mut updates = Vec::new();
        for mut want in desired {
            if want.metadata.namespace.is_empty() {
                want.metadata.namespace = if namespace.is_empty() { DEFAULT_NAMESPACE } else { namespace }.to_string();
            }
            let key = (want.metadata.namespace.clone(), want.metadata.name.clone());
            let reject = if want.kind != kind {
                Some((Operation::Create, anyhow!("desired resource has kind {}, reconciler handles {}", want.kind, kind)))
            } else if !namespace.is_empty() && key.0 != namespace {
                Some((Operation::Create, anyhow!("desired resource is outside namespace {}", namespace)))
            } else if !seen.insert(key.clone()) {
                Some((Operation::Create, anyhow!("duplicate desired resource")))
            } else {
                None
            };
            if let Some((op, error)) = reject {
                // A rejected desired entry still claims its name; never delete the live object.
                existing.remove(&key);
                failures.push(OperationFailure { op, namespace: key.0, name: key.1, error });
                continue;
            }

            let Some(have) = existing.remove(&key) else {
                creates.push(want);
                continue;
            };
            want.metadata.resource_version = have.metadata.resource_version.clone();
            want.status = have.status.clone();
            if let Some(t) = &self.transition {
                if let Err(error) = t(&have, &mut want) {
                    failures.push(OperationFailure { op: Operation::Transition, namespace: key.0, name: key.1, error });
                    continue;
                }
            }
            if want.content_eq(&have) {
                summary.unchanged += 1;
                continue;
            }
            updates.push((have, want));
        }
        let mut deletes: Vec<Resource> = existing.into_values().collect();
        sort_list(&mut deletes);

        for want in creates {
            let (ns, name) = (want.metadata.namespace.clone(), want.metadata.name.clone());
            match self.client.write(want, WriteOpts::create()).await {
                Ok(_) => {
                    summary.created += 1;
                    counter!("reconcile_creates", 1u64, "kind" => kind.to_string());
                    debug!(kind = %kind, ns = %ns, name = %name, "reconcile: created");
                }
                // Another writer got there first; the next pass compares against it.
                Err(e) if e.is_already_exists() => {
                    debug!(kind = %kind, ns = %ns, name = %name, "reconcile: create raced, already exists");
                }
                Err(e) => failures.push(OperationFailure { op: Operation::Create, namespace: ns, name, error: e.into() }),
            }
        }

        for (have, want) in updates {
            let (ns, name) = (want.metadata.namespace.clone(), want.metadata.name.clone());
            let diff = diff_summary(&want.spec, &have.spec);
            match self.client.write(want, WriteOpts::overwrite()).await {
                Ok(_) => {
                    summary.updated += 1;
                    counter!("reconcile_updates", 1u64, "kind" => kind.to_string());
                    debug!(kind = %kind, ns = %ns, name = %name, adds = diff.adds, updates = diff.updates, removes = diff.removes, "reconcile: updated");
                }
                Err(e) => failures.push(OperationFailure { op: Operation::Update, namespace: ns, name, error: e.into() }),
            }
        }

        for gone in deletes {
            let (ns, name) = (gone.metadata.namespace, gone.metadata.name);
            match self.client.delete(&ns, &name, DeleteOpts { ignore_not_exist: true }).await {
                Ok(()) => {
                    summary.deleted += 1;
                    counter!("reconcile_deletes", 1u64, "kind" => kind.to_string());
                    debug!(kind = %kind, ns = %ns, name = %name, "reconcile: deleted");
                }
                Err(e) => failures.push(OperationFailure { op: Operation::Delete, namespace: ns, name, error: e.into() }),
            }
        }

        if failures.is_empty() {
            if summary.changes() > 0 {
                info!(kind = %kind, ns = %namespace, %summary, "reconciled");
            }
            return Ok(summary);
        }
        counter!("reconcile_errors", failures.len() as u64, "kind" => kind.to_string());
        warn!(kind = %kind, ns = %namespace, %summary, failed = failures.len(), "reconcile finished with errors");
        Err(ReconcileError { kind, namespace: namespace.to_string(), summary, failures })
    }
}

/// Field-level change counts between two specs, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, out: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, out),
                        None => out.adds += 1,
                    }
                }
                out.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                out.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                out.adds += aa.len().saturating_sub(bb.len());
                out.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    out.updates += 1;
                }
            }
        }
    }
    let mut out = DiffSummary::default();
    walk(target, base, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({
            "port": 80,
            "tls": { "sni": "a.com" },
            "hosts": ["a", "b", "c"]
        });
        let target = serde_json::json!({
            "port": 8080,
            "tls": { "sni": "a.com", "verify": true },
            "hosts": ["a", "x"],
            "healthChecks": []
        });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }

    #[test]
    fn diff_of_identical_specs_is_empty() {
        let v = serde_json::json!({ "routes": [{ "prefix": "/" }] });
        assert_eq!(diff_summary(&v, &v), DiffSummary::default());
    }

    #[test]
    fn error_message_lists_each_failure() {
        let err = ReconcileError {
            kind: Kind::UPSTREAM,
            namespace: "gloo".into(),
            summary: ReconcileSummary { created: 1, ..Default::default() },
            failures: vec![
                OperationFailure { op: Operation::Update, namespace: "gloo".into(), name: "a".into(), error: anyhow!("boom") },
                OperationFailure { op: Operation::Delete, namespace: "gloo".into(), name: "b".into(), error: anyhow!("gone wrong") },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 failed"), "{}", msg);
        assert!(msg.contains("update gloo/a: boom"));
        assert!(msg.contains("delete gloo/b: gone wrong"));
        assert!(msg.contains("1 created"));
    }
}

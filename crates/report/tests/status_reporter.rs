#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gatesync_client::{KindRegistry, MemoryResourceClient, Op, RecordingClient, ResourceClient, Watch};
use gatesync_core::prelude::*;
use gatesync_report::{ResourceReports, StatusReporter};

fn vs(name: &str) -> Resource {
    Resource::new(Kind::VIRTUAL_SERVICE, Metadata::new("gloo", name), serde_json::json!({ "domains": ["*"] }))
}

async fn setup(names: &[&str]) -> (MemoryResourceClient, RecordingClient, KindRegistry) {
    let store = MemoryResourceClient::new(Kind::VIRTUAL_SERVICE);
    for n in names {
        store.write(vs(n), WriteOpts::create()).await.unwrap();
    }
    let rec = RecordingClient::new(Arc::new(store.clone()));
    let registry = KindRegistry::new().with(Arc::new(rec.clone()));
    (store, rec, registry)
}

async fn status_of(store: &MemoryResourceClient, name: &str) -> Status {
    store.read("gloo", name, ReadOpts::default()).await.unwrap().status.expect("status written")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accepted_and_rejected() {
    let (store, _rec, registry) = setup(&["good", "bad"]).await;
    let mut reports = ResourceReports::new();
    reports.accept(&vs("good"));
    reports.add_error(&vs("bad"), "no upstream petstore");

    let summary = StatusReporter::new("gateway", registry).write_reports(&reports).await.unwrap();
    assert_eq!(summary.written, 2);

    let good = status_of(&store, "good").await;
    assert_eq!((good.state, good.reported_by.as_str()), (State::Accepted, "gateway"));
    let bad = status_of(&store, "bad").await;
    assert_eq!(bad.state, State::Rejected);
    assert_eq!(bad.reason, "no upstream petstore");
}

async fn report_in_order(first: (&str, bool), second: (&str, bool)) -> Status {
    let (store, _rec, registry) = setup(&["a"]).await;
    for (reporter, ok) in [first, second] {
        let mut reports = ResourceReports::new();
        if ok {
            reports.accept(&vs("a"));
        } else {
            reports.add_error(&vs("a"), format!("{} says no", reporter));
        }
        StatusReporter::new(reporter, registry.clone()).write_reports(&reports).await.unwrap();
    }
    status_of(&store, "a").await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejection_dominates_in_either_order() {
    let xy = report_in_order(("x", true), ("y", false)).await;
    let yx = report_in_order(("y", false), ("x", true)).await;
    assert_eq!(xy.state, State::Rejected);
    assert_eq!(xy, yx);
    assert_eq!(xy.reported_by, "y");
    assert_eq!(xy.reason, "y says no");
    assert_eq!(xy.reports.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reporter_replaces_only_its_own_entry() {
    let (store, _rec, registry) = setup(&["a"]).await;
    let gateway = StatusReporter::new("gateway", registry.clone());
    let gloo = StatusReporter::new("gloo", registry);

    let mut rejected = ResourceReports::new();
    rejected.add_error(&vs("a"), "conflicting domains");
    gateway.write_reports(&rejected).await.unwrap();
    let mut pending = ResourceReports::new();
    pending.mark_pending(&vs("a"), "proxy not yet translated");
    gloo.write_reports(&pending).await.unwrap();
    assert_eq!(status_of(&store, "a").await.state, State::Rejected);

    let mut fixed = ResourceReports::new();
    fixed.accept(&vs("a"));
    gateway.write_reports(&fixed).await.unwrap();
    let s = status_of(&store, "a").await;
    assert_eq!(s.state, State::Pending);
    assert_eq!(s.reported_by, "gloo");
    assert_eq!(s.reason, "proxy not yet translated");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unchanged_status_is_not_rewritten() {
    let (_store, rec, registry) = setup(&["a"]).await;
    let reporter = StatusReporter::new("gateway", registry);
    let mut reports = ResourceReports::new();
    reports.add_warning(&vs("a"), "deprecated field");

    reporter.write_reports(&reports).await.unwrap();
    rec.clear();
    let summary = reporter.write_reports(&reports).await.unwrap();
    assert_eq!((summary.written, summary.unchanged), (0, 1));
    assert!(rec.ops().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_resources_are_skipped() {
    let (_store, rec, registry) = setup(&["a"]).await;
    let mut reports = ResourceReports::new();
    reports.accept(&vs("a"));
    reports.accept(&vs("gone"));
    let summary = StatusReporter::new("gateway", registry).write_reports(&reports).await.unwrap();
    assert_eq!((summary.written, summary.missing), (1, 1));
    assert_eq!(rec.ops(), vec![Op::Write { namespace: "gloo".into(), name: "a".into(), overwrite: true }]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failures_are_aggregated() {
    let (store, rec, registry) = setup(&["a", "b"]).await;
    rec.fail_on("a");
    let mut reports = ResourceReports::new();
    reports.accept(&vs("a"));
    reports.accept(&vs("b"));
    reports.accept(&Resource::new(Kind::SECRET, Metadata::new("gloo", "tls"), serde_json::json!({})));

    let err = StatusReporter::new("gateway", registry).write_reports(&reports).await.unwrap_err();
    assert_eq!(err.summary.written, 1);
    assert_eq!(err.failures.len(), 2);
    assert!(err.failures.iter().any(|f| matches!(f.error, ClientError::UnknownKind(_))));
    assert_eq!(status_of(&store, "b").await.state, State::Accepted);
}

/// Bumps the stored version behind the reporter's back on the first writes.
struct Contended {
    inner: MemoryResourceClient,
    conflicts_left: AtomicUsize,
    writes: AtomicUsize,
}

#[async_trait::async_trait]
impl ResourceClient for Contended {
    fn kind(&self) -> &Kind { self.inner.kind() }

    async fn read(&self, ns: &str, name: &str, o: ReadOpts) -> ClientResult<Resource> { self.inner.read(ns, name, o).await }

    async fn write(&self, r: Resource, o: WriteOpts) -> ClientResult<Resource> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.conflicts_left.load(Ordering::SeqCst) > 0 {
            self.conflicts_left.fetch_sub(1, Ordering::SeqCst);
            let mut other = self.inner.read(r.namespace(), r.name(), ReadOpts::default()).await?;
            other.metadata.labels.insert("touched".into(), self.writes.load(Ordering::SeqCst).to_string());
            self.inner.write(other, WriteOpts::overwrite()).await?;
        }
        self.inner.write(r, o).await
    }

    async fn delete(&self, ns: &str, name: &str, o: DeleteOpts) -> ClientResult<()> { self.inner.delete(ns, name, o).await }

    async fn list(&self, ns: &str, o: ListOpts) -> ClientResult<ResourceList> { self.inner.list(ns, o).await }

    async fn watch(&self, ns: &str, o: WatchOpts) -> ClientResult<Watch> { self.inner.watch(ns, o).await }
}

async fn contended(conflicts: usize) -> (MemoryResourceClient, Arc<Contended>, StatusReporter) {
    let store = MemoryResourceClient::new(Kind::VIRTUAL_SERVICE);
    store.write(vs("a"), WriteOpts::create()).await.unwrap();
    let client = Arc::new(Contended { inner: store.clone(), conflicts_left: AtomicUsize::new(conflicts), writes: AtomicUsize::new(0) });
    let registry = KindRegistry::new().with(client.clone());
    (store, client, StatusReporter::new("gateway", registry))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn version_conflicts_are_retried() {
    let (store, client, reporter) = contended(2).await;
    let mut reports = ResourceReports::new();
    reports.accept(&vs("a"));
    reporter.write_reports(&reports).await.unwrap();
    assert_eq!(client.writes.load(Ordering::SeqCst), 3);
    let stored = store.read("gloo", "a", ReadOpts::default()).await.unwrap();
    assert_eq!(stored.status.map(|s| s.state), Some(State::Accepted));
    assert!(stored.metadata.labels.contains_key("touched"), "concurrent change was kept");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistent_conflicts_give_up() {
    let (_store, client, reporter) = contended(usize::MAX).await;
    let mut reports = ResourceReports::new();
    reports.accept(&vs("a"));
    let err = reporter.write_reports(&reports).await.unwrap_err();
    assert!(err.failures[0].error.is_version_conflict());
    assert_eq!(client.writes.load(Ordering::SeqCst), 3);
}

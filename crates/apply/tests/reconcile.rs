#![forbid(unsafe_code)]

use std::sync::Arc;

use gatesync_apply::{Operation, Reconciler};
use gatesync_client::{MemoryResourceClient, Op, RecordingClient, ResourceClient};
use gatesync_core::prelude::*;
use gatesync_core::Selector;

fn upstream(ns: &str, name: &str, version: &str) -> Resource {
    Resource::new(Kind::UPSTREAM, Metadata::new(ns, name), serde_json::json!({ "version": version }))
}

async fn seeded(items: &[Resource]) -> (MemoryResourceClient, RecordingClient) {
    let store = MemoryResourceClient::new(Kind::UPSTREAM);
    for r in items {
        store.write(r.clone(), WriteOpts::create()).await.unwrap();
    }
    let rec = RecordingClient::new(Arc::new(store.clone()));
    (store, rec)
}

async fn versions(store: &MemoryResourceClient, ns: &str) -> Vec<(String, String)> {
    store
        .list(ns, ListOpts::default())
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.metadata.name.clone(), r.spec["version"].as_str().unwrap_or_default().to_string()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn creates_updates_and_deletes_minimally() {
    let (store, rec) = seeded(&[upstream("ns", "a", "v1"), upstream("ns", "b", "v1")]).await;
    let before = store.read("ns", "a", ReadOpts::default()).await.unwrap();
    let reconciler = Reconciler::new(Arc::new(rec.clone()));

    let desired = vec![upstream("ns", "a", "v2"), upstream("ns", "c", "v1")];
    let summary = reconciler.reconcile("ns", desired, ListOpts::default()).await.unwrap();
    assert_eq!((summary.created, summary.updated, summary.deleted, summary.unchanged), (1, 1, 1, 0));

    let ops = rec.ops();
    assert_eq!(ops.len(), 3);
    assert!(ops.contains(&Op::Write { namespace: "ns".into(), name: "c".into(), overwrite: false }));
    assert!(ops.contains(&Op::Write { namespace: "ns".into(), name: "a".into(), overwrite: true }));
    assert!(ops.contains(&Op::Delete { namespace: "ns".into(), name: "b".into() }));

    assert_eq!(versions(&store, "ns").await, vec![("a".into(), "v2".into()), ("c".into(), "v1".into())]);
    let after = store.read("ns", "a", ReadOpts::default()).await.unwrap();
    assert_ne!(after.metadata.resource_version, before.metadata.resource_version);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_pass_is_a_no_op() {
    let (_store, rec) = seeded(&[upstream("ns", "a", "v1"), upstream("ns", "b", "v1")]).await;
    let reconciler = Reconciler::new(Arc::new(rec.clone()));
    let desired = vec![upstream("ns", "a", "v2"), upstream("ns", "c", "v1")];

    reconciler.reconcile("ns", desired.clone(), ListOpts::default()).await.unwrap();
    rec.clear();
    let summary = reconciler.reconcile("ns", desired, ListOpts::default()).await.unwrap();
    assert_eq!(summary.changes(), 0);
    assert_eq!(summary.unchanged, 2);
    assert!(rec.ops().is_empty(), "second pass issued {:?}", rec.ops());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_written_by_reporters_survives_reconcile() {
    let (store, rec) = seeded(&[upstream("ns", "a", "v1")]).await;
    let mut with_status = store.read("ns", "a", ReadOpts::default()).await.unwrap();
    with_status.status = Some(Status::rejected("bad port", "gloo"));
    store.write(with_status, WriteOpts::overwrite()).await.unwrap();

    let reconciler = Reconciler::new(Arc::new(rec.clone()));
    reconciler.reconcile("ns", vec![upstream("ns", "a", "v1")], ListOpts::default()).await.unwrap();
    assert!(rec.ops().is_empty());

    reconciler.reconcile("ns", vec![upstream("ns", "a", "v3")], ListOpts::default()).await.unwrap();
    let after = store.read("ns", "a", ReadOpts::default()).await.unwrap();
    assert_eq!(after.status.map(|s| s.state), Some(State::Rejected));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_failure_does_not_block_the_rest() {
    let (store, rec) = seeded(&[upstream("ns", "a", "v1"), upstream("ns", "b", "v1")]).await;
    rec.fail_on("a");
    let reconciler = Reconciler::new(Arc::new(rec.clone()));

    let desired = vec![upstream("ns", "a", "v2"), upstream("ns", "c", "v1")];
    let err = reconciler.reconcile("ns", desired, ListOpts::default()).await.unwrap_err();
    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].op, Operation::Update);
    assert_eq!(err.failures[0].name, "a");
    assert_eq!((err.summary.created, err.summary.deleted), (1, 1));
    assert_eq!(versions(&store, "ns").await, vec![("a".into(), "v1".into()), ("c".into(), "v1".into())]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transition_preserves_discovered_fields() {
    let mut discovered = upstream("ns", "petstore", "v1");
    discovered.spec["functions"] = serde_json::json!(["listPets", "addPet"]);
    let (store, rec) = seeded(&[discovered]).await;

    let reconciler = Reconciler::new(Arc::new(rec.clone())).with_transition(|have, want| {
        if let Some(f) = have.spec.get("functions") {
            want.spec["functions"] = f.clone();
        }
        Ok(())
    });
    let summary = reconciler.reconcile("ns", vec![upstream("ns", "petstore", "v1")], ListOpts::default()).await.unwrap();
    assert_eq!(summary.unchanged, 1);
    assert!(rec.ops().is_empty());

    reconciler.reconcile("ns", vec![upstream("ns", "petstore", "v2")], ListOpts::default()).await.unwrap();
    let after = store.read("ns", "petstore", ReadOpts::default()).await.unwrap();
    assert_eq!(after.spec["version"], "v2");
    assert_eq!(after.spec["functions"], serde_json::json!(["listPets", "addPet"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_transition_skips_only_that_resource() {
    let (store, rec) = seeded(&[upstream("ns", "a", "v1"), upstream("ns", "b", "v1")]).await;
    let reconciler = Reconciler::new(Arc::new(rec.clone())).with_transition(|have, _want| {
        if have.name() == "a" {
            anyhow::bail!("cannot merge {}", have.name());
        }
        Ok(())
    });
    let err = reconciler
        .reconcile("ns", vec![upstream("ns", "a", "v2"), upstream("ns", "b", "v2")], ListOpts::default())
        .await
        .unwrap_err();
    assert_eq!(err.failures[0].op, Operation::Transition);
    assert_eq!(err.summary.updated, 1);
    // "a" is neither updated nor deleted.
    assert_eq!(versions(&store, "ns").await, vec![("a".into(), "v1".into()), ("b".into(), "v2".into())]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_race_is_benign() {
    // Another writer stores "c" between our list and our create.
    struct Racer {
        inner: MemoryResourceClient,
    }

    #[async_trait::async_trait]
    impl ResourceClient for Racer {
        fn kind(&self) -> &Kind { self.inner.kind() }
        async fn read(&self, ns: &str, name: &str, o: ReadOpts) -> ClientResult<Resource> { self.inner.read(ns, name, o).await }
        async fn write(&self, r: Resource, o: WriteOpts) -> ClientResult<Resource> {
            let _ = self.inner.write(r.clone(), WriteOpts::create()).await;
            self.inner.write(r, o).await
        }
        async fn delete(&self, ns: &str, name: &str, o: DeleteOpts) -> ClientResult<()> {
            self.inner.delete(ns, name, DeleteOpts::default()).await?;
            // Gone already by the time a second delete lands.
            self.inner.delete(ns, name, o).await
        }
        async fn list(&self, ns: &str, o: ListOpts) -> ClientResult<ResourceList> { self.inner.list(ns, o).await }
        async fn watch(&self, ns: &str, o: WatchOpts) -> ClientResult<gatesync_client::Watch> { self.inner.watch(ns, o).await }
    }

    let (store, _rec) = seeded(&[upstream("ns", "b", "v1")]).await;
    let reconciler = Reconciler::new(Arc::new(Racer { inner: store.clone() }));
    let summary = reconciler.reconcile("ns", vec![upstream("ns", "c", "v1")], ListOpts::default()).await.unwrap();
    assert_eq!(summary.created, 0);
    assert_eq!(summary.deleted, 1);
    assert_eq!(versions(&store, "ns").await, vec![("c".into(), "v1".into())]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn desired_namespace_rules() {
    let (store, rec) = seeded(&[]).await;
    let reconciler = Reconciler::new(Arc::new(rec.clone()));
    let desired = vec![upstream("", "adopted", "v1"), upstream("elsewhere", "stray", "v1"), upstream("ns", "adopted", "v9")];
    let err = reconciler.reconcile("ns", desired, ListOpts::default()).await.unwrap_err();

    let reasons: Vec<String> = err.failures.iter().map(|f| f.to_string()).collect();
    assert_eq!(reasons.len(), 2, "{:?}", reasons);
    assert!(reasons[0].contains("elsewhere/stray") && reasons[0].contains("outside namespace ns"));
    assert!(reasons[1].contains("ns/adopted") && reasons[1].contains("duplicate"));
    assert_eq!(versions(&store, "ns").await, vec![("adopted".into(), "v1".into())]);
    assert!(store.list("elsewhere", ListOpts::default()).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_kind_desired_keeps_live_resource() {
    let (store, rec) = seeded(&[upstream("ns", "a", "v1"), upstream("ns", "b", "v1")]).await;
    let reconciler = Reconciler::new(Arc::new(rec.clone()));
    let desired = vec![Resource::new(Kind::SECRET, Metadata::new("ns", "a"), serde_json::json!({}))];
    let err = reconciler.reconcile("ns", desired, ListOpts::default()).await.unwrap_err();

    assert_eq!(err.failures.len(), 1);
    assert!(err.failures[0].to_string().contains("kind"), "{}", err.failures[0]);
    assert_eq!(err.summary.deleted, 1);
    assert_eq!(rec.ops(), vec![Op::Delete { namespace: "ns".into(), name: "b".into() }]);
    assert_eq!(versions(&store, "ns").await, vec![("a".into(), "v1".into())]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn selector_scopes_what_may_be_deleted() {
    let owned = Resource::new(Kind::UPSTREAM, Metadata::new("ns", "owned").with_label("discovered_by", "kube"), serde_json::json!({}));
    let (store, rec) = seeded(&[owned, upstream("ns", "manual", "v1")]).await;
    let reconciler = Reconciler::new(Arc::new(rec.clone()));
    let opts = ListOpts { selector: Selector::new().with("discovered_by", "kube") };
    let summary = reconciler.reconcile("ns", Vec::new(), opts).await.unwrap();
    assert_eq!(summary.deleted, 1);
    assert_eq!(versions(&store, "ns").await, vec![("manual".into(), "v1".into())]);
}

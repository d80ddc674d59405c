use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use gatesync_client::{KindRegistry, ResourceClient};
use gatesync_core::prelude::*;
use gatesync_core::{queue_cap, sort_list};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Multiplexer, Supervisor};

/// A watch failure for one `(kind, namespace)` pair. The emitter keeps running.
#[derive(Debug, thiserror::Error)]
#[error("watch {kind} in namespace {namespace:?}: {source}")]
pub struct EmitterError {
    pub kind: Kind,
    pub namespace: String,
    #[source]
    pub source: ClientError,
}

type WatchKey = (Kind, String);

/// Requests an emission of the current snapshot regardless of its hash.
#[derive(Clone)]
pub struct ForceEmit(mpsc::Sender<()>);

impl ForceEmit {
    /// Returns false if the emitter has stopped. Repeated triggers before the
    /// emitter gets to them collapse into one.
    pub fn trigger(&self) -> bool {
        match self.0.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

/// Read access to the last published snapshot for callers outside the pipeline.
#[derive(Clone)]
pub struct CurrentSnapshot {
    snap: Arc<ArcSwap<Snapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl CurrentSnapshot {
    pub fn load(&self) -> Arc<Snapshot> { self.snap.load_full() }

    /// Bumped once per published snapshot.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    pub fn epoch(&self) -> u64 { *self.epoch_rx.borrow() }
}

/// Channels of a running emitter. Both `snapshots` and `errors` close after
/// the watch's cancellation token fires, `snapshots` first.
pub struct SnapshotStream {
    pub snapshots: mpsc::Receiver<Snapshot>,
    pub errors: mpsc::Receiver<EmitterError>,
    pub resync: ForceEmit,
    pub current: CurrentSnapshot,
}

/// Merges the watches of several kinds across namespaces into one
/// deduplicated stream of snapshots.
#[derive(Clone)]
pub struct SnapshotEmitter {
    clients: Vec<Arc<dyn ResourceClient>>,
    resync_every: Option<Duration>,
}

impl SnapshotEmitter {
    /// Emitter over every kind in `registry`.
    pub fn new(registry: &KindRegistry) -> Self {
        let clients = registry.kinds().filter_map(|k| registry.get(k).ok()).collect();
        Self { clients, resync_every: None }
    }

    /// Emitter over a subset of the registered kinds.
    pub fn for_kinds(registry: &KindRegistry, kinds: &[Kind]) -> ClientResult<Self> {
        let clients = kinds.iter().map(|k| registry.get(k)).collect::<ClientResult<Vec<_>>>()?;
        Ok(Self { clients, resync_every: None })
    }

    /// Periodically emit the current snapshot even when nothing changed.
    pub fn with_resync_period(mut self, every: Duration) -> Self {
        self.resync_every = Some(every);
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = &Kind> { self.clients.iter().map(|c| c.kind()) }

    /// Start one watch per `(kind, namespace)` and the consumer task that
    /// owns the snapshot. An empty `namespaces` watches all namespaces.
    /// A watch that fails to start fails the whole call.
    pub async fn snapshots(&self, namespaces: &[String], opts: WatchOpts) -> ClientResult<SnapshotStream> {
        let namespaces: Vec<String> = if namespaces.is_empty() { vec![String::new()] } else { namespaces.to_vec() };
        let cap = queue_cap();
        let cancel = opts.cancel.clone();
        let (err_tx, errors) = mpsc::channel::<EmitterError>(cap);
        let mut supervisor = Supervisor::new(cancel.child_token(), err_tx);
        let mux = Multiplexer::<WatchKey, ResourceList>::new(cap);

        let child = supervisor.token().clone();
        for client in &self.clients {
            for ns in &namespaces {
                let kind = client.kind().clone();
                let child_opts = WatchOpts { cancel: child.clone(), ..opts.clone() };
                let w = match client.watch(ns, child_opts).await {
                    Ok(w) => w,
                    Err(e) => {
                        warn!(kind = %kind, ns = %ns, error = %e, "emitter: watch failed to start");
                        supervisor.shutdown().await;
                        return Err(e);
                    }
                };
                supervisor.spawn(mux.forward((kind.clone(), ns.clone()), w.lists, child.clone()));
                if let Some(tx) = supervisor.error_sender() {
                    supervisor.spawn(forward_errors(kind, ns.clone(), w.errors, tx, child.clone()));
                }
            }
        }
        let updates = mux.into_receiver();

        let (snap_tx, snapshots) = mpsc::channel::<Snapshot>(cap);
        let (force_tx, force_rx) = mpsc::channel::<()>(1);
        let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let current = CurrentSnapshot { snap: Arc::clone(&snap), epoch_rx };

        info!(kinds = self.clients.len(), namespaces = namespaces.len(), watches = supervisor.len() / 2, "emitter started");
        let consumer = Consumer { updates, force_rx, snap_tx, snap, epoch_tx, resync_every: self.resync_every };
        tokio::spawn(async move {
            consumer.run(&cancel).await;
            supervisor.shutdown().await;
            info!("emitter stopped");
        });

        Ok(SnapshotStream { snapshots, errors, resync: ForceEmit(force_tx), current })
    }
}

async fn forward_errors(
    kind: Kind,
    namespace: String,
    mut source: mpsc::Receiver<ClientError>,
    tx: mpsc::Sender<EmitterError>,
    cancel: CancellationToken,
) {
    loop {
        let e = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            e = source.recv() => match e {
                Some(e) => e,
                None => break,
            },
        };
        warn!(kind = %kind, ns = %namespace, error = %e, "emitter: watch error");
        let err = EmitterError { kind: kind.clone(), namespace: namespace.clone(), source: e };
        if !gatesync_client::send_or_cancel(&tx, err, &cancel).await {
            break;
        }
    }
}

/// Sole owner of the mutable snapshot.
struct Consumer {
    updates: mpsc::Receiver<(WatchKey, ResourceList)>,
    force_rx: mpsc::Receiver<()>,
    snap_tx: mpsc::Sender<Snapshot>,
    snap: Arc<ArcSwap<Snapshot>>,
    epoch_tx: watch::Sender<u64>,
    resync_every: Option<Duration>,
}

impl Consumer {
    async fn run(self, cancel: &CancellationToken) {
        let Consumer { mut updates, mut force_rx, snap_tx, snap, epoch_tx, resync_every } = self;
        let mut current = Snapshot::default();
        let mut last_hash: Option<u64> = None;
        let mut epoch = 0u64;
        let mut resync = resync_every.map(|every| {
            let mut t = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t
        });

        loop {
            let forced = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(()) = force_rx.recv() => true,
                _ = tick(&mut resync) => true,
                update = updates.recv() => {
                    let Some(((kind, ns), mut list)) = update else { break };
                    sort_list(&mut list);
                    counter!("emitter_updates", 1u64, "kind" => kind.to_string());
                    debug!(kind = %kind, ns = %ns, items = list.len(), "emitter: update");
                    current = current.with_entry(&kind, &ns, list);
                    false
                }
            };

            if forced && last_hash.is_none() {
                debug!("emitter: forced emit before first update, ignored");
                continue;
            }
            let hash = current.hash();
            if !forced && last_hash == Some(hash) {
                // Status and version changes still refresh what readers see.
                snap.store(Arc::new(current.clone()));
                counter!("emitter_dropped_noop", 1u64);
                continue;
            }
            last_hash = Some(hash);
            epoch += 1;
            snap.store(Arc::new(current.clone()));
            let _ = epoch_tx.send(epoch);
            counter!("emitter_snapshots", 1u64);
            debug!(epoch, hash, forced, items = current.len(), "emitter: snapshot");
            if !gatesync_client::send_or_cancel(&snap_tx, current.clone(), cancel).await {
                break;
            }
        }
        drop(force_rx);
        drop(snap_tx);
        drop(updates);
    }
}

async fn tick(t: &mut Option<tokio::time::Interval>) {
    match t {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

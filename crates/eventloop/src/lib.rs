//! gatesync event loop: binds one snapshot emitter to one syncer.
//!
//! The loop task is the only reader of the snapshot channel and awaits each
//! `sync` call before taking the next snapshot, so a syncer never runs
//! concurrently with itself. Cancellation is observed between calls; a call
//! in progress always runs to completion.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::anyhow;
use gatesync_client::send_or_cancel;
use gatesync_core::prelude::*;
use gatesync_core::queue_cap;
use gatesync_store::{CurrentSnapshot, EmitterError, ForceEmit, SnapshotEmitter, SnapshotStream};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Caller-supplied reaction to a new snapshot. Errors are reported, never fatal.
#[async_trait::async_trait]
pub trait Syncer: Send {
    async fn sync(&mut self, cancel: &CancellationToken, snapshot: &Snapshot) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl<S: Syncer + ?Sized> Syncer for Box<S> {
    async fn sync(&mut self, cancel: &CancellationToken, snapshot: &Snapshot) -> anyhow::Result<()> {
        (**self).sync(cancel, snapshot).await
    }
}

/// Runs several syncers in order on every snapshot. One failing does not
/// skip the rest.
#[derive(Default)]
pub struct Syncers {
    inner: Vec<Box<dyn Syncer>>,
}

impl Syncers {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, syncer: impl Syncer + 'static) -> Self {
        self.inner.push(Box::new(syncer));
        self
    }

    pub fn push(&mut self, syncer: Box<dyn Syncer>) { self.inner.push(syncer); }

    pub fn len(&self) -> usize { self.inner.len() }
    pub fn is_empty(&self) -> bool { self.inner.is_empty() }
}

#[async_trait::async_trait]
impl Syncer for Syncers {
    async fn sync(&mut self, cancel: &CancellationToken, snapshot: &Snapshot) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for (i, s) in self.inner.iter_mut().enumerate() {
            if let Err(e) = s.sync(cancel, snapshot).await {
                failures.push(format!("syncer {}: {:#}", i, e));
            }
        }
        match failures.len() {
            0 => Ok(()),
            1 => Err(anyhow!(failures.remove(0))),
            n => Err(anyhow!("{} syncers failed: {}", n, failures.join("; "))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error(transparent)]
    Emitter(#[from] EmitterError),
    #[error("sync failed: {0:#}")]
    Sync(anyhow::Error),
}

pub struct EventLoop<S> {
    emitter: SnapshotEmitter,
    syncer: S,
}

/// A running loop. `errors` closes once the loop has stopped and drained
/// the emitter's errors.
pub struct EventLoopHandle {
    pub errors: mpsc::Receiver<LoopError>,
    pub resync: ForceEmit,
    pub current: CurrentSnapshot,
    task: JoinHandle<()>,
}

impl EventLoopHandle {
    /// Wait for the loop task to finish.
    pub async fn join(self) -> anyhow::Result<()> {
        self.task.await.map_err(|e| anyhow!("event loop task failed: {}", e))
    }
}

impl<S: Syncer + 'static> EventLoop<S> {
    pub fn new(emitter: SnapshotEmitter, syncer: S) -> Self { Self { emitter, syncer } }

    /// Start the emitter and the loop. Fails only when a watch cannot start.
    pub async fn run(self, namespaces: &[String], opts: WatchOpts) -> ClientResult<EventLoopHandle> {
        let cancel = opts.cancel.clone();
        let SnapshotStream { snapshots, errors, resync, current } = self.emitter.snapshots(namespaces, opts).await?;
        let (err_tx, out) = mpsc::channel(queue_cap());
        let task = tokio::spawn(drive(self.syncer, snapshots, errors, err_tx, cancel));
        Ok(EventLoopHandle { errors: out, resync, current, task })
    }
}

async fn drive<S: Syncer>(
    mut syncer: S,
    mut snapshots: mpsc::Receiver<Snapshot>,
    mut emitter_errors: mpsc::Receiver<EmitterError>,
    out: mpsc::Sender<LoopError>,
    cancel: CancellationToken,
) {
    info!("event loop started");
    let mut errors_open = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            e = emitter_errors.recv(), if errors_open => match e {
                Some(e) => {
                    if !send_or_cancel(&out, LoopError::Emitter(e), &cancel).await {
                        break;
                    }
                }
                None => errors_open = false,
            },
            snap = snapshots.recv() => {
                let Some(snap) = snap else { break };
                let t0 = Instant::now();
                let res = syncer.sync(&cancel, &snap).await;
                histogram!("eventloop_sync_ms", t0.elapsed().as_secs_f64() * 1000.0);
                match res {
                    Ok(()) => {
                        counter!("eventloop_sync_ok", 1u64);
                        debug!(items = snap.len(), "event loop: sync ok");
                    }
                    Err(e) => {
                        counter!("eventloop_sync_err", 1u64);
                        warn!(error = %format!("{:#}", e), "event loop: sync failed");
                        if !send_or_cancel(&out, LoopError::Sync(e), &cancel).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    // The emitter closes its error channel once every watch has exited.
    drop(snapshots);
    while let Some(e) = emitter_errors.recv().await {
        if out.try_send(LoopError::Emitter(e)).is_err() {
            debug!("event loop: dropped emitter error during shutdown");
        }
    }
    info!("event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fails(&'static str);

    #[async_trait::async_trait]
    impl Syncer for Fails {
        async fn sync(&mut self, _: &CancellationToken, _: &Snapshot) -> anyhow::Result<()> {
            Err(anyhow!(self.0))
        }
    }

    struct Counts(usize);

    #[async_trait::async_trait]
    impl Syncer for Counts {
        async fn sync(&mut self, _: &CancellationToken, _: &Snapshot) -> anyhow::Result<()> {
            self.0 += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn syncers_run_all_and_aggregate() {
        let mut all = Syncers::new().with(Fails("bad upstream")).with(Counts(0)).with(Fails("bad route"));
        let err = all.sync(&CancellationToken::new(), &Snapshot::new()).await.unwrap_err().to_string();
        assert!(err.starts_with("2 syncers failed"), "{}", err);
        assert!(err.contains("syncer 0: bad upstream"));
        assert!(err.contains("syncer 2: bad route"));
    }

    #[tokio::test]
    async fn empty_syncers_succeed() {
        let mut none = Syncers::new();
        assert!(none.is_empty());
        none.sync(&CancellationToken::new(), &Snapshot::new()).await.unwrap();
    }
}

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Owns a group of child tasks and the error channel they report on.
///
/// The error channel closes only after every child has exited: children
/// hold clones of the sender, and the supervisor drops its own copy last,
/// in [`Supervisor::shutdown`].
pub struct Supervisor<E> {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    errors: Option<mpsc::Sender<E>>,
}

impl<E: Send + 'static> Supervisor<E> {
    pub fn new(cancel: CancellationToken, errors: mpsc::Sender<E>) -> Self {
        Self { cancel, tasks: JoinSet::new(), errors: Some(errors) }
    }

    pub fn token(&self) -> &CancellationToken { &self.cancel }

    /// Sender for a child to report errors on.
    pub fn error_sender(&self) -> Option<mpsc::Sender<E>> { self.errors.clone() }

    pub fn spawn<F>(&mut self, child: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(child);
    }

    pub fn len(&self) -> usize { self.tasks.len() }
    pub fn is_empty(&self) -> bool { self.tasks.is_empty() }

    /// Cancel the children, wait for all of them, then close the error channel.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    warn!(error = %e, "supervised task panicked");
                }
            }
        }
        drop(self.errors.take());
    }
}

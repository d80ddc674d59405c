use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Fans many sources into one keyed stream. Each source gets a forwarder
/// future; the merged receiver closes once every forwarder has exited and
/// the multiplexer itself has been consumed by [`Multiplexer::into_receiver`].
pub struct Multiplexer<K, T> {
    tx: mpsc::Sender<(K, T)>,
    rx: mpsc::Receiver<(K, T)>,
}

impl<K, T> Multiplexer<K, T>
where
    K: Clone + Send + 'static,
    T: Send + 'static,
{
    pub fn new(cap: usize) -> Self {
        let (tx, rx) = mpsc::channel(cap.max(1));
        Self { tx, rx }
    }

    /// Forward every item of `source` tagged with `key` until the source
    /// closes, the merged receiver is dropped, or `cancel` fires.
    pub fn forward(&self, key: K, mut source: mpsc::Receiver<T>, cancel: CancellationToken) -> impl Future<Output = ()> + Send + 'static {
        let tx = self.tx.clone();
        async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    item = source.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    res = tx.send((key.clone(), item)) => res.is_ok(),
                };
                if !sent {
                    break;
                }
            }
        }
    }

    pub fn into_receiver(self) -> mpsc::Receiver<(K, T)> { self.rx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merges_and_closes_when_sources_close() {
        let mux = Multiplexer::<&'static str, u32>::new(8);
        let cancel = CancellationToken::new();
        let (a_tx, a_rx) = mpsc::channel(4);
        let (b_tx, b_rx) = mpsc::channel(4);
        let fa = tokio::spawn(mux.forward("a", a_rx, cancel.clone()));
        let fb = tokio::spawn(mux.forward("b", b_rx, cancel.clone()));
        let mut merged = mux.into_receiver();

        a_tx.send(1).await.unwrap();
        b_tx.send(2).await.unwrap();
        a_tx.send(3).await.unwrap();
        drop(a_tx);
        drop(b_tx);

        let mut got = Vec::new();
        while let Some(item) = merged.recv().await {
            got.push(item);
        }
        fa.await.unwrap();
        fb.await.unwrap();
        got.sort_unstable();
        assert_eq!(got, vec![("a", 1), ("a", 3), ("b", 2)]);
    }

    #[tokio::test]
    async fn cancellation_stops_forwarders() {
        let mux = Multiplexer::<u8, u8>::new(1);
        let cancel = CancellationToken::new();
        let (_keep_open, rx) = mpsc::channel::<u8>(1);
        let f = tokio::spawn(mux.forward(0, rx, cancel.clone()));
        let mut merged = mux.into_receiver();
        cancel.cancel();
        f.await.unwrap();
        assert!(merged.recv().await.is_none());
    }
}

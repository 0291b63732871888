use std::time::Duration;

use futures::future::select_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A set of table watches registered inside a snapshot.
///
/// Waiting resolves once any watched table commits a change after registration.
/// Register, release the snapshot, then wait; build a new set for the next round.
#[derive(Default)]
pub struct WatchSet {
    receivers: Vec<watch::Receiver<u64>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn add(&mut self, rx: watch::Receiver<u64>) {
        self.receivers.push(rx);
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    /// Wait for a change. Never resolves for an empty set.
    pub async fn wait(&mut self) {
        if self.receivers.is_empty() {
            std::future::pending::<()>().await;
            return;
        }
        let changed = self
            .receivers
            .iter_mut()
            .map(|rx| Box::pin(rx.changed()));
        // An error means the table's sender is gone; treat it as a change.
        let _ = select_all(changed).await;
    }

    /// Wait for a change or cancellation. Returns false if cancelled first.
    pub async fn wait_cancellable(&mut self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = self.wait() => true,
        }
    }

    /// Wait for a change up to `timeout`. Returns false on timeout.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

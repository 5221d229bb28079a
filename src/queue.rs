//! Hand-off queue between the directory watcher and the tailer.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// FIFO of log files waiting to be tailed.
///
/// The watcher is the only writer and the tailer the only reader. `enqueue` never deduplicates;
/// the tailer decides what to do with each path.
#[derive(Debug, Default)]
pub struct PendingFileQueue {
    paths: Mutex<VecDeque<PathBuf>>,
    available: Notify,
}

impl PendingFileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, path: PathBuf) {
        self.lock().push_back(path);
        self.available.notify_one();
    }

    pub fn try_dequeue(&self) -> Option<PathBuf> {
        self.lock().pop_front()
    }

    /// Waits for the oldest path. Returns `None` once `cancel_token` fires.
    pub async fn dequeue(&self, cancel_token: &CancellationToken) -> Option<PathBuf> {
        loop {
            if let Some(path) = self.try_dequeue() {
                return Some(path);
            }
            // notify_one stores a permit, so an enqueue between the check and the await is not lost
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return None,
                _ = self.available.notified() => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PathBuf>> {
        // a poisoned guard still holds a valid deque; pushes and pops cannot half-apply
        self.paths
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//! Per-match background tasks.
//!
//! Each match has at most one driving task. Handles live here so that a
//! forfeit or shutdown can stop the task without racing its own cleanup.

use std::collections::BTreeMap;
use std::future::Future;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::network::session::MatchId;

/// Task handles keyed by match.
#[derive(Default)]
pub struct MatchTasks {
    handles: Mutex<BTreeMap<MatchId, JoinHandle<()>>>,
}

impl MatchTasks {
    /// Create an empty task table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the driving task for a match.
    ///
    /// The handle is stored before the lock is released, so a `release`
    /// issued by the task itself always finds it. A previous task for the
    /// same match is aborted.
    pub async fn spawn<F>(&self, id: MatchId, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles.lock().await;
        let handle = tokio::spawn(fut);
        if let Some(old) = handles.insert(id, handle) {
            old.abort();
        }
    }

    /// Abort a match's task and wait until it has stopped. Returns whether
    /// one was running.
    ///
    /// Once this returns the task sends nothing more. Must not be called from
    /// the task being cancelled.
    pub async fn cancel(&self, id: MatchId) -> bool {
        let handle = self.handles.lock().await.remove(&id);
        match handle {
            Some(handle) => {
                handle.abort();
                let _ = handle.await;
                debug!(match_id = %id, "match task cancelled");
                true
            }
            None => false,
        }
    }

    /// Forget a task's handle without aborting it.
    pub async fn release(&self, id: MatchId) {
        self.handles.lock().await.remove(&id);
    }

    /// Abort every running task and wait for all of them to stop.
    pub async fn cancel_all(&self) -> usize {
        let handles = std::mem::take(&mut *self.handles.lock().await);
        let count = handles.len();
        for handle in handles.values() {
            handle.abort();
        }
        for (_, handle) in handles {
            let _ = handle.await;
        }
        count
    }

    /// Number of tracked tasks.
    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_task() {
        let tasks = MatchTasks::new();
        let id = MatchId::new_v4();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        tasks
            .spawn(id, async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .await;

        assert!(tasks.cancel(id).await);
        assert!(!tasks.cancel(id).await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(tasks.len().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_waits_for_running_task() {
        let tasks = MatchTasks::new();
        let id = MatchId::new_v4();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel();

        tasks
            .spawn(id, async move {
                let _ = started_tx.send(());
                loop {
                    // Busy section with no await point.
                    std::thread::sleep(Duration::from_millis(20));
                    if out_tx.send(()).is_err() {
                        return;
                    }
                    tokio::task::yield_now().await;
                }
            })
            .await;

        started_rx.await.unwrap();
        assert!(tasks.cancel(id).await);

        // Drain whatever was sent before the task stopped; nothing follows.
        while out_rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            out_rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_task_releases_itself() {
        let tasks = Arc::new(MatchTasks::new());
        let id = MatchId::new_v4();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let own = tasks.clone();
        tasks
            .spawn(id, async move {
                own.release(id).await;
                let _ = done_tx.send(());
            })
            .await;

        done_rx.await.unwrap();
        assert_eq!(tasks.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let tasks = MatchTasks::new();
        for _ in 0..3 {
            tasks
                .spawn(MatchId::new_v4(), async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                })
                .await;
        }

        assert_eq!(tasks.cancel_all().await, 3);
        assert_eq!(tasks.len().await, 0);
    }
}

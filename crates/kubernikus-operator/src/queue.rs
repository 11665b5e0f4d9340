//! Rate-limited, deduplicating work queue feeding the reconcile loops.
//!
//! Keys are `namespace/name` strings. A key is queued at most once while
//! pending and never handed to two workers at the same time: re-adds that
//! arrive while the key is being processed are deferred until [`WorkQueue::done`].

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::Notify;

/// First retry delay for a failing key.
pub const BASE_DELAY: Duration = Duration::from_secs(5);
/// Upper bound for the exponential retry delay.
pub const MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    /// Keys wanting to be processed, queued or not.
    dirty: HashSet<String>,
    /// Keys currently handed out to a worker.
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutdown: bool,
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueues a key. Idempotent while the key is already pending.
    pub fn add(&self, key: &str) {
        let mut inner = self.lock();
        if inner.shutdown || inner.dirty.contains(key) {
            return;
        }
        inner.dirty.insert(key.to_owned());
        if inner.processing.contains(key) {
            // Deferred until done() releases the key.
            return;
        }
        inner.queue.push_back(key.to_owned());
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Blocking dequeue. Returns `None` once the queue has been shut down
    /// and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            // Register for wakeups before re-checking the queue, so an
            // add() racing the emptiness check cannot slip through
            // unobserved. notify_waiters() only reaches enabled waiters.
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks processing of a key as finished. A deferred re-add from
    /// [`WorkQueue::add`] becomes visible to workers here.
    pub fn done(&self, key: &str) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.to_owned());
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// Re-enqueues after the per-key exponential backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let attempt = {
            let mut inner = self.lock();
            let failures = inner.failures.entry(key.to_owned()).or_insert(0);
            *failures += 1;
            *failures
        };
        self.add_after(key, backoff(attempt));
    }

    /// Re-enqueues after a fixed delay without touching the failure counter.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Resets the failure counter. Call on success or when giving up.
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes all blocked getters. Queued keys are still drained.
    pub fn shut_down(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The inner mutex is never held across an await point.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    BASE_DELAY
        .saturating_mul(2u32.saturating_pow(exp))
        .min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn deduplicates_pending_keys() {
        let queue = WorkQueue::new();
        queue.add("qa/d-qa-1");
        queue.add("qa/d-qa-1");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn same_key_is_never_processed_twice_concurrently() {
        let queue = WorkQueue::new();
        queue.add("qa/d-qa-1");
        let key = queue.get().await.expect("queued key");

        // A re-add while processing must not become visible yet.
        queue.add(&key);
        assert!(timeout(Duration::from_millis(20), queue.get()).await.is_err());

        queue.done(&key);
        assert_eq!(queue.get().await.as_deref(), Some("qa/d-qa-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_rate_limited("qa/d-qa-1");
        assert_eq!(queue.num_requeues("qa/d-qa-1"), 1);

        // First backoff step is 5s, so nothing shows up within 2s.
        assert!(timeout(Duration::from_secs(2), queue.get()).await.is_err());
        let key = timeout(Duration::from_secs(10), queue.get())
            .await
            .expect("key after backoff");
        assert_eq!(key.as_deref(), Some("qa/d-qa-1"));
    }

    #[tokio::test]
    async fn forget_resets_the_failure_counter() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_rate_limited("qa/d-qa-1");
        queue.add_rate_limited("qa/d-qa-1");
        assert_eq!(queue.num_requeues("qa/d-qa-1"), 2);
        queue.forget("qa/d-qa-1");
        assert_eq!(queue.num_requeues("qa/d-qa-1"), 0);
    }

    #[tokio::test]
    async fn add_wakes_an_already_waiting_getter() {
        let queue = Arc::new(WorkQueue::new());
        let getter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        // Let the getter find the queue empty and park on the notifier.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        queue.add("qa/d-qa-1");
        let key = timeout(Duration::from_secs(1), getter)
            .await
            .expect("getter woken")
            .expect("join");
        assert_eq!(key.as_deref(), Some("qa/d-qa-1"));
    }

    #[tokio::test]
    async fn shutdown_unblocks_getters() {
        let queue = Arc::new(WorkQueue::new());
        let getter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        queue.shut_down();
        assert_eq!(getter.await.expect("join"), None);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff(1), Duration::from_secs(5));
        assert_eq!(backoff(2), Duration::from_secs(10));
        assert_eq!(backoff(5), Duration::from_secs(80));
        assert_eq!(backoff(12), MAX_DELAY);
    }
}

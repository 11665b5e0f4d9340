//! The shared reconcile-loop harness: a watch-fed, resynced [`WorkQueue`]
//! drained by a configurable number of workers, with the standard retry
//! policy (rate-limited backoff, dropped after five consecutive failures).

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{TryStreamExt, pin_mut};
use kube::{
    Api, Resource, ResourceExt,
    runtime::{
        WatchStreamExt, reflector,
        reflector::{Store, store::Writer},
        watcher,
    },
};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;

/// Failures tolerated per key before it is dropped from the queue.
pub const MAX_RETRIES: u32 = 5;
/// Delay for the "more work, come back soon" requeue. Deliberately short
/// and outside the failure backoff.
pub const REQUEUE_DELAY: Duration = Duration::from_millis(500);
/// Periodic full resync guaranteeing level-triggered self-healing.
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(300);

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// `requeue == Yes` with no error means "there is more work, come back
/// soon without penalty" and bypasses the failure backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    No,
    Yes,
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &str) -> Result<Requeue, BoxError>;
}

/// Queue key for any watched object: `namespace/name`, or just the name
/// for cluster-scoped resources.
pub fn key_for<K: ResourceExt>(obj: &K) -> String {
    match obj.namespace() {
        Some(namespace) => format!("{namespace}/{}", obj.name_any()),
        None => obj.name_any(),
    }
}

pub struct Runner<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    api: Api<K>,
    store: Store<K>,
    writer: Option<Writer<K>>,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconciler>,
    workers: usize,
    resync: Duration,
}

impl<K> Runner<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(api: Api<K>, reconciler: Arc<dyn Reconciler>, workers: usize) -> Self {
        let (store, writer) = reflector::store();
        Self {
            api,
            store,
            writer: Some(writer),
            queue: Arc::new(WorkQueue::new()),
            reconciler,
            workers,
            resync: DEFAULT_RESYNC,
        }
    }

    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    /// Read-only mirror of the watched objects.
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Handle for external event sources (node observatory, timers).
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Runs watch feeder, resync ticker and workers until the token fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let name = self.reconciler.name();
        info!(controller = name, workers = self.workers, "starting controller");

        let mut tasks = JoinSet::new();

        let Some(writer) = self.writer.take() else {
            return;
        };
        let api = self.api.clone();
        let queue = Arc::clone(&self.queue);
        let feed_cancel = cancel.clone();
        tasks.spawn(async move {
            let stream = reflector(writer, watcher(api, watcher::Config::default()).default_backoff())
                .touched_objects();
            pin_mut!(stream);
            loop {
                tokio::select! {
                    () = feed_cancel.cancelled() => break,
                    item = stream.try_next() => match item {
                        Ok(Some(obj)) => queue.add(&key_for(&obj)),
                        Ok(None) => break,
                        Err(err) => warn!(controller = name, error = %err, "watch stream hiccup"),
                    },
                }
            }
        });

        let store = self.store.clone();
        let queue = Arc::clone(&self.queue);
        let resync = self.resync;
        let tick_cancel = cancel.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(resync);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = tick_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for obj in store.state() {
                            queue.add(&key_for(obj.as_ref()));
                        }
                    }
                }
            }
        });

        for worker in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            tasks.spawn(async move {
                debug!(controller = name, worker, "worker started");
                while process_one(&queue, reconciler.as_ref()).await {}
                debug!(controller = name, worker, "worker stopped");
            });
        }

        cancel.cancelled().await;
        self.queue.shut_down();
        while tasks.join_next().await.is_some() {}
        info!(controller = name, "controller stopped");
    }
}

/// Pulls one key and applies the retry policy. Returns `false` once the
/// queue has shut down.
pub async fn process_one(queue: &Arc<WorkQueue>, reconciler: &dyn Reconciler) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };
    match reconciler.reconcile(&key).await {
        Ok(Requeue::No) => queue.forget(&key),
        Ok(Requeue::Yes) => {
            queue.forget(&key);
            queue.add_after(&key, REQUEUE_DELAY);
        }
        Err(err) => {
            if queue.num_requeues(&key) < MAX_RETRIES {
                warn!(
                    controller = reconciler.name(),
                    key,
                    error = %err,
                    retries = queue.num_requeues(&key),
                    "reconcile failed, requeueing"
                );
                queue.add_rate_limited(&key);
            } else {
                error!(
                    controller = reconciler.name(),
                    key,
                    error = %err,
                    "reconcile failed too often, dropping key"
                );
                queue.forget(&key);
            }
        }
    }
    queue.done(&key);
    true
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::timeout;

    use super::*;

    #[derive(Default)]
    struct FlakyReconciler {
        calls: AtomicU32,
        succeed_after: u32,
        requeue_once: bool,
    }

    #[async_trait]
    impl Reconciler for FlakyReconciler {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn reconcile(&self, _key: &str) -> Result<Requeue, BoxError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.succeed_after != 0 && call > self.succeed_after {
                return Ok(Requeue::No);
            }
            if self.requeue_once {
                return Ok(if call == 1 { Requeue::Yes } else { Requeue::No });
            }
            Err("cloud is on fire".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drops_a_key_after_five_consecutive_failures() {
        let queue = Arc::new(WorkQueue::new());
        let reconciler = FlakyReconciler::default();
        queue.add("qa/d-qa-1");

        // Initial attempt plus five rate-limited retries all fail; the key
        // is dropped on the sixth failure instead of being re-queued.
        for _ in 0..6 {
            assert!(process_one(&queue, &reconciler).await);
        }
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 6);
        assert_eq!(queue.num_requeues("qa/d-qa-1"), 0);

        // No retry timer is pending anymore, so nothing ever shows up again.
        assert!(
            timeout(Duration::from_secs(3600), queue.get()).await.is_err(),
            "dropped key must not reappear"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_signal_bypasses_the_failure_backoff() {
        let queue = Arc::new(WorkQueue::new());
        let reconciler = FlakyReconciler {
            requeue_once: true,
            ..FlakyReconciler::default()
        };
        queue.add("qa/d-qa-1");

        assert!(process_one(&queue, &reconciler).await);
        assert_eq!(queue.num_requeues("qa/d-qa-1"), 0);

        // The follow-up pass arrives well before the 5s failure backoff.
        assert!(
            timeout(Duration::from_secs(2), process_one(&queue, &reconciler))
                .await
                .expect("requeued key within the short delay")
        );
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_resets_the_failure_counter() {
        let queue = Arc::new(WorkQueue::new());
        let reconciler = FlakyReconciler {
            succeed_after: 2,
            ..FlakyReconciler::default()
        };
        queue.add("qa/d-qa-1");

        for _ in 0..3 {
            assert!(process_one(&queue, &reconciler).await);
        }
        assert_eq!(queue.num_requeues("qa/d-qa-1"), 0);
    }
}

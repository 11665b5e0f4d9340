//! Decorator chain around a [`PoolManager`]: metrics, events, logs. Each
//! wrapper implements the same trait and delegates, adding one concern.
//! Composition order (outer to inner): Instrumenting, Eventing, Logging.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    events::{Event, EventType, Recorder},
    reflector::ObjectRef,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    Result,
    pool_manager::{PoolManager, PoolStatus},
};
use crate::{kluster::Kluster, metrics::OperationMetrics};

pub fn decorate(
    concrete: impl PoolManager + 'static,
    kluster: String,
    pool: String,
    metrics: OperationMetrics,
    recorder: Recorder,
    object_ref: ObjectRef<Kluster>,
) -> Box<dyn PoolManager> {
    let logging = LoggingPoolManager {
        inner: concrete,
        kluster: kluster.clone(),
        pool: pool.clone(),
    };
    let eventing = EventingPoolManager {
        inner: logging,
        recorder,
        object_ref,
        pool,
    };
    Box::new(InstrumentedPoolManager {
        inner: eventing,
        metrics,
    })
}

pub struct LoggingPoolManager<M> {
    pub inner: M,
    pub kluster: String,
    pub pool: String,
}

macro_rules! logged {
    ($self:ident, $method:literal, $call:expr) => {{
        let started = Instant::now();
        let result = $call.await;
        debug!(
            kluster = %$self.kluster,
            pool = %$self.pool,
            method = $method,
            took = ?started.elapsed(),
            error = result.as_ref().err().map(tracing::field::display),
            concat!($method, " finished"),
        );
        result
    }};
}

#[async_trait]
impl<M: PoolManager> PoolManager for LoggingPoolManager<M> {
    async fn get_status(&self) -> Result<PoolStatus> {
        logged!(self, "get_status", self.inner.get_status())
    }

    async fn set_status(&self, status: &PoolStatus) -> Result<()> {
        logged!(self, "set_status", self.inner.set_status(status))
    }

    async fn create_node(&self) -> Result<String> {
        logged!(self, "create_node", self.inner.create_node())
    }

    async fn delete_node(&self, id: &str) -> Result<()> {
        logged!(self, "delete_node", self.inner.delete_node(id))
    }

    async fn delete_pool(&self) -> Result<()> {
        logged!(self, "delete_pool", self.inner.delete_pool())
    }
}

pub struct InstrumentedPoolManager<M> {
    pub inner: M,
    pub metrics: OperationMetrics,
}

macro_rules! instrumented {
    ($self:ident, $method:literal, $call:expr) => {{
        let started = Instant::now();
        let result = $call.await;
        $self
            .metrics
            .observe($method, started.elapsed(), result.is_err());
        result
    }};
}

#[async_trait]
impl<M: PoolManager> PoolManager for InstrumentedPoolManager<M> {
    async fn get_status(&self) -> Result<PoolStatus> {
        instrumented!(self, "get_status", self.inner.get_status())
    }

    async fn set_status(&self, status: &PoolStatus) -> Result<()> {
        instrumented!(self, "set_status", self.inner.set_status(status))
    }

    async fn create_node(&self) -> Result<String> {
        instrumented!(self, "create_node", self.inner.create_node())
    }

    async fn delete_node(&self, id: &str) -> Result<()> {
        instrumented!(self, "delete_node", self.inner.delete_node(id))
    }

    async fn delete_pool(&self) -> Result<()> {
        instrumented!(self, "delete_pool", self.inner.delete_pool())
    }
}

pub struct EventingPoolManager<M> {
    pub inner: M,
    pub recorder: Recorder,
    pub object_ref: ObjectRef<Kluster>,
    pub pool: String,
}

impl<M> EventingPoolManager<M> {
    /// Event emission never changes the operation's outcome.
    async fn emit(&self, action: &str, note: String, failed: bool) {
        let event = Event {
            type_: if failed { EventType::Warning } else { EventType::Normal },
            reason: format!("{}{action}", if failed { "Failed" } else { "Successful" }),
            note: Some(note),
            action: action.to_owned(),
            secondary: None,
        };
        let reference = ObjectReference::from(self.object_ref.clone());
        if let Err(err) = self.recorder.publish(&event, &reference).await {
            warn!(error = %err, "failed to publish event");
        }
    }
}

#[async_trait]
impl<M: PoolManager> PoolManager for EventingPoolManager<M> {
    async fn get_status(&self) -> Result<PoolStatus> {
        self.inner.get_status().await
    }

    async fn set_status(&self, status: &PoolStatus) -> Result<()> {
        self.inner.set_status(status).await
    }

    async fn create_node(&self) -> Result<String> {
        match self.inner.create_node().await {
            Ok(id) => {
                self.emit(
                    "CreateNode",
                    format!("created node {id} in pool {}", self.pool),
                    false,
                )
                .await;
                Ok(id)
            }
            Err(err) => {
                self.emit(
                    "CreateNode",
                    format!("creating a node in pool {} failed: {err}", self.pool),
                    true,
                )
                .await;
                Err(err)
            }
        }
    }

    async fn delete_node(&self, id: &str) -> Result<()> {
        match self.inner.delete_node(id).await {
            Ok(()) => {
                self.emit("DeleteNode", format!("deleted node {id}"), false).await;
                Ok(())
            }
            Err(err) => {
                self.emit("DeleteNode", format!("deleting node {id} failed: {err}"), true)
                    .await;
                Err(err)
            }
        }
    }

    async fn delete_pool(&self) -> Result<()> {
        match self.inner.delete_pool().await {
            Ok(()) => {
                self.emit("DeletePool", format!("deleted pool {}", self.pool), false)
                    .await;
                Ok(())
            }
            Err(err) => {
                self.emit(
                    "DeletePool",
                    format!("deleting pool {} failed: {err}", self.pool),
                    true,
                )
                .await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use prometheus::Registry;

    use super::*;

    #[derive(Default)]
    struct CountingPoolManager {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PoolManager for CountingPoolManager {
        async fn get_status(&self) -> Result<PoolStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PoolStatus::default())
        }

        async fn set_status(&self, _status: &PoolStatus) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn create_node(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("id".into())
        }

        async fn delete_node(&self, _id: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_pool(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn logging_decorator_delegates() {
        let manager = LoggingPoolManager {
            inner: CountingPoolManager::default(),
            kluster: "d-qa-1".into(),
            pool: "payload".into(),
        };
        manager.get_status().await.expect("delegated");
        manager.create_node().await.expect("delegated");
        assert_eq!(manager.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn instrumented_decorator_counts_calls_per_method() {
        let registry = Registry::new();
        let metrics = OperationMetrics::register("launch", &registry).expect("register");
        let manager = InstrumentedPoolManager {
            inner: CountingPoolManager::default(),
            metrics: metrics.clone(),
        };
        manager.get_status().await.expect("delegated");
        manager.get_status().await.expect("delegated");
        manager.delete_node("some-id").await.expect("delegated");

        assert_eq!(metrics.total.with_label_values(&["get_status"]).get(), 2);
        assert_eq!(metrics.total.with_label_values(&["delete_node"]).get(), 1);
        assert_eq!(metrics.failures.with_label_values(&["get_status"]).get(), 0);
    }
}

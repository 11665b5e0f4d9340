//! Decorator chain around a [`Deorbiter`]: metrics, events, logs.
//! Composition order (outer to inner): Instrumenting, Eventing, Logging.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    events::{Event, EventType, Recorder},
    reflector::ObjectRef,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Deorbiter, Result, SelfDestructReason};
use crate::{kluster::Kluster, metrics::OperationMetrics};

pub fn decorate(
    concrete: impl Deorbiter + 'static,
    kluster: String,
    metrics: OperationMetrics,
    recorder: Recorder,
    object_ref: ObjectRef<Kluster>,
) -> Box<dyn Deorbiter> {
    let logging = LoggingDeorbiter {
        inner: concrete,
        kluster,
    };
    let eventing = EventingDeorbiter {
        inner: logging,
        recorder,
        object_ref,
    };
    Box::new(InstrumentedDeorbiter {
        inner: eventing,
        metrics,
    })
}

pub struct LoggingDeorbiter<D> {
    pub inner: D,
    pub kluster: String,
}

macro_rules! logged {
    ($self:ident, $method:literal, $call:expr) => {{
        let started = Instant::now();
        let result = $call.await;
        debug!(
            kluster = %$self.kluster,
            method = $method,
            took = ?started.elapsed(),
            error = result.as_ref().err().map(tracing::field::display),
            concat!($method, " finished"),
        );
        result
    }};
}

#[async_trait]
impl<D: Deorbiter> Deorbiter for LoggingDeorbiter<D> {
    async fn delete_cinder_pvcs(&self) -> Result<Vec<String>> {
        logged!(self, "delete_cinder_pvcs", self.inner.delete_cinder_pvcs())
    }

    async fn delete_loadbalancer_services(&self) -> Result<Vec<String>> {
        logged!(
            self,
            "delete_loadbalancer_services",
            self.inner.delete_loadbalancer_services()
        )
    }

    async fn wait_for_pv_cleanup(
        &self,
        deleted: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        logged!(
            self,
            "wait_for_pv_cleanup",
            self.inner.wait_for_pv_cleanup(deleted, cancel)
        )
    }

    async fn wait_for_service_cleanup(
        &self,
        deleted: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        logged!(
            self,
            "wait_for_service_cleanup",
            self.inner.wait_for_service_cleanup(deleted, cancel)
        )
    }

    async fn self_destruct(&self, reason: SelfDestructReason) -> Result<()> {
        logged!(self, "self_destruct", self.inner.self_destruct(reason))
    }

    fn is_api_unavailable_timeout(&self) -> bool {
        self.inner.is_api_unavailable_timeout()
    }

    fn is_deorbit_hanging_timeout(&self) -> bool {
        self.inner.is_deorbit_hanging_timeout()
    }
}

pub struct InstrumentedDeorbiter<D> {
    pub inner: D,
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
impl<D: Deorbiter> Deorbiter for InstrumentedDeorbiter<D> {
    async fn delete_cinder_pvcs(&self) -> Result<Vec<String>> {
        instrumented!(self, "delete_cinder_pvcs", self.inner.delete_cinder_pvcs())
    }

    async fn delete_loadbalancer_services(&self) -> Result<Vec<String>> {
        instrumented!(
            self,
            "delete_loadbalancer_services",
            self.inner.delete_loadbalancer_services()
        )
    }

    async fn wait_for_pv_cleanup(
        &self,
        deleted: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        instrumented!(
            self,
            "wait_for_pv_cleanup",
            self.inner.wait_for_pv_cleanup(deleted, cancel)
        )
    }

    async fn wait_for_service_cleanup(
        &self,
        deleted: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        instrumented!(
            self,
            "wait_for_service_cleanup",
            self.inner.wait_for_service_cleanup(deleted, cancel)
        )
    }

    async fn self_destruct(&self, reason: SelfDestructReason) -> Result<()> {
        instrumented!(self, "self_destruct", self.inner.self_destruct(reason))
    }

    fn is_api_unavailable_timeout(&self) -> bool {
        self.inner.is_api_unavailable_timeout()
    }

    fn is_deorbit_hanging_timeout(&self) -> bool {
        self.inner.is_deorbit_hanging_timeout()
    }
}

pub struct EventingDeorbiter<D> {
    pub inner: D,
    pub recorder: Recorder,
    pub object_ref: ObjectRef<Kluster>,
}

impl<D> EventingDeorbiter<D> {
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
impl<D: Deorbiter> Deorbiter for EventingDeorbiter<D> {
    async fn delete_cinder_pvcs(&self) -> Result<Vec<String>> {
        match self.inner.delete_cinder_pvcs().await {
            Ok(deleted) => {
                for pvc in &deleted {
                    self.emit("DeorbitPVC", format!("deleted cinder-backed PVC {pvc}"), false)
                        .await;
                }
                Ok(deleted)
            }
            Err(err) => {
                self.emit("DeorbitPVC", format!("deleting cinder PVCs failed: {err}"), true)
                    .await;
                Err(err)
            }
        }
    }

    async fn delete_loadbalancer_services(&self) -> Result<Vec<String>> {
        match self.inner.delete_loadbalancer_services().await {
            Ok(deleted) => {
                for service in &deleted {
                    self.emit(
                        "DeorbitService",
                        format!("deleted load balancer service {service}"),
                        false,
                    )
                    .await;
                }
                Ok(deleted)
            }
            Err(err) => {
                self.emit(
                    "DeorbitService",
                    format!("deleting load balancer services failed: {err}"),
                    true,
                )
                .await;
                Err(err)
            }
        }
    }

    async fn wait_for_pv_cleanup(
        &self,
        deleted: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.wait_for_pv_cleanup(deleted, cancel).await
    }

    async fn wait_for_service_cleanup(
        &self,
        deleted: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.wait_for_service_cleanup(deleted, cancel).await
    }

    async fn self_destruct(&self, reason: SelfDestructReason) -> Result<()> {
        let result = self.inner.self_destruct(reason).await;
        self.emit(
            "SelfDestruct",
            format!("forcing deorbit to finish: {reason:?}"),
            result.is_err(),
        )
        .await;
        result
    }

    fn is_api_unavailable_timeout(&self) -> bool {
        self.inner.is_api_unavailable_timeout()
    }

    fn is_deorbit_hanging_timeout(&self) -> bool {
        self.inner.is_deorbit_hanging_timeout()
    }
}

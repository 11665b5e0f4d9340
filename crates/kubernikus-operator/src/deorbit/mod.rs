//! The deorbit controller: removes cloud-backed resources (Cinder volumes,
//! load balancers) from inside a terminating kluster before its control
//! plane is destroyed, with two timeout escape hatches guaranteeing that
//! every kluster eventually becomes deletable.

pub mod decorators;

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{PersistentVolume, PersistentVolumeClaim, Service},
    chrono::{DateTime, Utc},
};
use kube::{
    Api, Resource, ResourceExt,
    api::DeleteParams,
    runtime::{events::Recorder, reflector::ObjectRef},
};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    client::{self, Client, is_unexpected_server_error, split_key},
    controller::{BoxError, Reconciler, Requeue},
    kluster::{Kluster, KlusterPhase},
    metrics::OperationMetrics,
};
use decorators::decorate;

/// Blocks kluster deletion until in-cluster cloud resources are cleaned up.
pub const DEORBIT_FINALIZER: &str = "kubernikus.cloud.sap/deorbiter";

/// CSI driver name for Cinder volumes.
const CINDER_CSI_DRIVER: &str = "cinder.csi.openstack.org";

/// Poll interval while waiting for Cinder PVs to drain.
pub const PV_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// The load-balancer controller gives no completion signal; assume it is
/// done this long after deletion was requested.
pub const SERVICE_GRACE: Duration = Duration::from_secs(120);
/// Upper bound for one reconcile pass; an exceeded deadline surfaces as a
/// retryable error instead of starving the worker pool.
pub const RECONCILE_DEADLINE: Duration = Duration::from_secs(600);
/// Satellite API unreachable for this long after deletion counts as gone.
pub const API_UNAVAILABLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Hard upper bound after which a kluster is forced deletable, accepting
/// resource debris as the tradeoff.
pub const HANGING_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("satellite API request failed"))]
    Tenant { source: kube::Error },

    #[snafu(display("kubernetes operation failed"))]
    Client { source: client::Error },

    #[snafu(display("cleanup wait aborted by the reconcile deadline"))]
    Deadline,
}

impl Error {
    /// The "unexpected server error"/"server timeout" class feeding the
    /// APIUnavailable self-destruct check.
    pub fn is_unexpected_server_error(&self) -> bool {
        match self {
            Error::Tenant { source } => is_unexpected_server_error(source),
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelfDestructReason {
    /// The satellite API is gone and stays gone.
    ApiUnavailable,
    /// Cleanup has been stuck past the 24h hard bound.
    DeorbitHanging,
}

#[async_trait]
pub trait Deorbiter: Send + Sync {
    /// Deletes all PVCs bound to Cinder-backed PVs. Returns the deleted
    /// claim names.
    async fn delete_cinder_pvcs(&self) -> Result<Vec<String>>;

    /// Deletes all Services of type LoadBalancer. Returns the deleted
    /// service names.
    async fn delete_loadbalancer_services(&self) -> Result<Vec<String>>;

    /// Polls until no Cinder-backed PV remains. Immediate no-op when
    /// nothing was deleted.
    async fn wait_for_pv_cleanup(&self, deleted: &[String], cancel: &CancellationToken)
    -> Result<()>;

    /// Waits out the load-balancer grace period. Immediate no-op when
    /// nothing was deleted.
    async fn wait_for_service_cleanup(
        &self,
        deleted: &[String],
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Forces the kluster deletable. For [`SelfDestructReason::ApiUnavailable`]
    /// this is a recorded no-op beyond logging; the finalizer removal that
    /// follows is the actual effect. Accepted debt, do not extend silently.
    async fn self_destruct(&self, reason: SelfDestructReason) -> Result<()>;

    fn is_api_unavailable_timeout(&self) -> bool;

    fn is_deorbit_hanging_timeout(&self) -> bool;
}

/// The fixed cleanup sequence: delete PVCs, delete LB services, await PV
/// drain, await the service grace period. Every step runs even when its
/// input set is empty so a pass over an empty kluster is still a full pass.
pub async fn do_deorbit(deorbiter: &dyn Deorbiter, cancel: &CancellationToken) -> Result<()> {
    let pvcs = deorbiter.delete_cinder_pvcs().await?;
    let services = deorbiter.delete_loadbalancer_services().await?;
    deorbiter.wait_for_pv_cleanup(&pvcs, cancel).await?;
    deorbiter.wait_for_service_cleanup(&services, cancel).await?;
    Ok(())
}

/// Evaluates both self-destruct conditions after a deorbit pass. Returns
/// true when the finalizer may be removed despite (or without) an error.
pub async fn check_self_destruct(
    deorbiter: &dyn Deorbiter,
    outcome: &Result<()>,
) -> Result<bool> {
    let mut forced = false;
    if let Err(err) = outcome {
        if err.is_unexpected_server_error() && deorbiter.is_api_unavailable_timeout() {
            deorbiter.self_destruct(SelfDestructReason::ApiUnavailable).await?;
            forced = true;
        }
    }
    if deorbiter.is_deorbit_hanging_timeout() {
        deorbiter.self_destruct(SelfDestructReason::DeorbitHanging).await?;
        forced = true;
    }
    Ok(forced)
}

/// Concrete deorbiter working against one kluster's own API server.
pub struct KlusterDeorbiter {
    pub kluster: Kluster,
    pub tenant: kube::Client,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl KlusterDeorbiter {
    fn since_deletion(&self) -> Option<Duration> {
        let deleted_at = self.deleted_at?;
        (Utc::now() - deleted_at).to_std().ok()
    }

    async fn is_cinder_backed(&self, pvc: &PersistentVolumeClaim) -> Result<bool> {
        let bound = pvc
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Bound");
        if !bound {
            return Ok(false);
        }
        let Some(volume_name) = pvc.spec.as_ref().and_then(|s| s.volume_name.clone()) else {
            return Ok(false);
        };
        let pvs: Api<PersistentVolume> = Api::all(self.tenant.clone());
        let pv = pvs.get(&volume_name).await.context(TenantSnafu)?;
        Ok(pv_is_cinder(&pv))
    }
}

pub fn pv_is_cinder(pv: &PersistentVolume) -> bool {
    let Some(spec) = pv.spec.as_ref() else {
        return false;
    };
    spec.cinder.is_some()
        || spec
            .csi
            .as_ref()
            .is_some_and(|csi| csi.driver == CINDER_CSI_DRIVER)
}

#[async_trait]
impl Deorbiter for KlusterDeorbiter {
    async fn delete_cinder_pvcs(&self) -> Result<Vec<String>> {
        let pvcs: Api<PersistentVolumeClaim> = Api::all(self.tenant.clone());
        let mut deleted = Vec::new();
        for pvc in pvcs.list(&Default::default()).await.context(TenantSnafu)? {
            if !self.is_cinder_backed(&pvc).await? {
                continue;
            }
            let namespace = pvc.namespace().unwrap_or_default();
            let scoped: Api<PersistentVolumeClaim> =
                Api::namespaced(self.tenant.clone(), &namespace);
            scoped
                .delete(&pvc.name_any(), &DeleteParams::default())
                .await
                .context(TenantSnafu)?;
            deleted.push(format!("{namespace}/{}", pvc.name_any()));
        }
        Ok(deleted)
    }

    async fn delete_loadbalancer_services(&self) -> Result<Vec<String>> {
        let services: Api<Service> = Api::all(self.tenant.clone());
        let mut deleted = Vec::new();
        for service in services.list(&Default::default()).await.context(TenantSnafu)? {
            let is_lb = service
                .spec
                .as_ref()
                .and_then(|s| s.type_.as_deref())
                .is_some_and(|t| t == "LoadBalancer");
            if !is_lb {
                continue;
            }
            let namespace = service.namespace().unwrap_or_default();
            let scoped: Api<Service> = Api::namespaced(self.tenant.clone(), &namespace);
            scoped
                .delete(&service.name_any(), &DeleteParams::default())
                .await
                .context(TenantSnafu)?;
            deleted.push(format!("{namespace}/{}", service.name_any()));
        }
        Ok(deleted)
    }

    async fn wait_for_pv_cleanup(
        &self,
        deleted: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if deleted.is_empty() {
            return Ok(());
        }
        let pvs: Api<PersistentVolume> = Api::all(self.tenant.clone());
        loop {
            let remaining = pvs
                .list(&Default::default())
                .await
                .context(TenantSnafu)?
                .iter()
                .filter(|pv| pv_is_cinder(pv))
                .count();
            if remaining == 0 {
                return Ok(());
            }
            info!(kluster = %self.kluster.name_any(), remaining, "waiting for cinder volumes to drain");
            tokio::select! {
                () = cancel.cancelled() => return DeadlineSnafu.fail(),
                () = tokio::time::sleep(PV_POLL_INTERVAL) => {}
            }
        }
    }

    async fn wait_for_service_cleanup(
        &self,
        deleted: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if deleted.is_empty() {
            return Ok(());
        }
        let Some(elapsed) = self.since_deletion() else {
            return Ok(());
        };
        let Some(remaining) = SERVICE_GRACE.checked_sub(elapsed) else {
            return Ok(());
        };
        info!(kluster = %self.kluster.name_any(), ?remaining, "waiting out the load balancer grace period");
        tokio::select! {
            () = cancel.cancelled() => DeadlineSnafu.fail(),
            () = tokio::time::sleep(remaining) => Ok(()),
        }
    }

    async fn self_destruct(&self, reason: SelfDestructReason) -> Result<()> {
        warn!(
            kluster = %self.kluster.name_any(),
            ?reason,
            "forcing deorbit to finish, cloud debris may remain"
        );
        Ok(())
    }

    fn is_api_unavailable_timeout(&self) -> bool {
        self.since_deletion()
            .is_some_and(|elapsed| elapsed > API_UNAVAILABLE_TIMEOUT)
    }

    fn is_deorbit_hanging_timeout(&self) -> bool {
        self.since_deletion()
            .is_some_and(|elapsed| elapsed > HANGING_TIMEOUT)
    }
}

pub struct DeorbitReconciler {
    pub client: Client,
    pub recorder: Recorder,
    pub metrics: OperationMetrics,
    pub shutdown: CancellationToken,
}

#[async_trait]
impl Reconciler for DeorbitReconciler {
    fn name(&self) -> &'static str {
        "deorbit"
    }

    async fn reconcile(&self, key: &str) -> Result<Requeue, BoxError> {
        let Some((namespace, name)) = split_key(key) else {
            warn!(key, "ignoring malformed queue key");
            return Ok(Requeue::No);
        };
        let kluster = match self.client.get_kluster(namespace, name).await {
            Ok(kluster) => kluster,
            Err(client::Error::Kube { source: kube::Error::Api(response) })
                if response.code == 404 =>
            {
                return Ok(Requeue::No);
            }
            Err(err) => return Err(err.into()),
        };

        match kluster.phase() {
            KlusterPhase::Running => {
                self.client.add_finalizer(&kluster, DEORBIT_FINALIZER).await?;
                Ok(Requeue::No)
            }
            KlusterPhase::Terminating if kluster.has_finalizer(DEORBIT_FINALIZER) => {
                self.deorbit(&kluster).await
            }
            _ => Ok(Requeue::No),
        }
    }
}

impl DeorbitReconciler {
    async fn deorbit(&self, kluster: &Kluster) -> Result<Requeue, BoxError> {
        let tenant = self.client.tenant_client(kluster).await?;
        let deorbiter = decorate(
            KlusterDeorbiter {
                kluster: kluster.clone(),
                tenant,
                deleted_at: kluster.meta().deletion_timestamp.as_ref().map(|t| t.0),
            },
            kluster.name_any(),
            self.metrics.clone(),
            self.recorder.clone(),
            ObjectRef::from_obj(kluster),
        );

        // One bounded pass: the per-reconcile deadline is independent of
        // process shutdown so a stuck cleanup cannot starve the workers.
        let cancel = self.shutdown.child_token();
        let deadline = cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(RECONCILE_DEADLINE).await;
            deadline.cancel();
        });
        let outcome = do_deorbit(deorbiter.as_ref(), &cancel).await;
        timer.abort();

        let forced = check_self_destruct(deorbiter.as_ref(), &outcome).await?;
        if !forced {
            outcome?;
        }
        self.client.remove_finalizer(kluster, DEORBIT_FINALIZER).await?;
        info!(kluster = %kluster.name_any(), "deorbit finished, finalizer removed");
        Ok(Requeue::No)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct MockDeorbiter {
        pvcs: Vec<String>,
        services: Vec<String>,
        delete_fails: bool,
        server_error: bool,
        api_unavailable: bool,
        hanging: bool,
        called_delete_pvcs: AtomicBool,
        called_delete_services: AtomicBool,
        called_wait_pvs: AtomicBool,
        called_wait_services: AtomicBool,
        destructed: Mutex<Vec<SelfDestructReason>>,
        order: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Deorbiter for MockDeorbiter {
        async fn delete_cinder_pvcs(&self) -> Result<Vec<String>> {
            self.called_delete_pvcs.store(true, Ordering::SeqCst);
            self.order.lock().expect("lock").push("delete_pvcs");
            if self.delete_fails {
                if self.server_error {
                    return Err(Error::Tenant {
                        source: kube::Error::Api(kube::error::ErrorResponse {
                            status: "Failure".into(),
                            message: "timeout".into(),
                            reason: "ServerTimeout".into(),
                            code: 504,
                        }),
                    });
                }
                return DeadlineSnafu.fail();
            }
            Ok(self.pvcs.clone())
        }

        async fn delete_loadbalancer_services(&self) -> Result<Vec<String>> {
            self.called_delete_services.store(true, Ordering::SeqCst);
            self.order.lock().expect("lock").push("delete_services");
            Ok(self.services.clone())
        }

        async fn wait_for_pv_cleanup(
            &self,
            _deleted: &[String],
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.called_wait_pvs.store(true, Ordering::SeqCst);
            self.order.lock().expect("lock").push("wait_pvs");
            Ok(())
        }

        async fn wait_for_service_cleanup(
            &self,
            _deleted: &[String],
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.called_wait_services.store(true, Ordering::SeqCst);
            self.order.lock().expect("lock").push("wait_services");
            Ok(())
        }

        async fn self_destruct(&self, reason: SelfDestructReason) -> Result<()> {
            self.destructed.lock().expect("lock").push(reason);
            Ok(())
        }

        fn is_api_unavailable_timeout(&self) -> bool {
            self.api_unavailable
        }

        fn is_deorbit_hanging_timeout(&self) -> bool {
            self.hanging
        }
    }

    #[tokio::test]
    async fn deorbit_runs_all_four_steps_in_order() {
        let deorbiter = MockDeorbiter {
            pvcs: vec!["default/db-0".into(), "default/db-1".into(), "default/db-2".into()],
            services: vec!["default/web".into(), "default/api".into()],
            ..MockDeorbiter::default()
        };
        do_deorbit(&deorbiter, &CancellationToken::new()).await.expect("deorbit");
        assert_eq!(
            *deorbiter.order.lock().expect("lock"),
            vec!["delete_pvcs", "delete_services", "wait_pvs", "wait_services"]
        );
    }

    #[tokio::test]
    async fn empty_kluster_still_runs_every_step() {
        let deorbiter = MockDeorbiter::default();
        do_deorbit(&deorbiter, &CancellationToken::new()).await.expect("deorbit");
        assert!(deorbiter.called_delete_pvcs.load(Ordering::SeqCst));
        assert!(deorbiter.called_delete_services.load(Ordering::SeqCst));
        assert!(deorbiter.called_wait_pvs.load(Ordering::SeqCst));
        assert!(deorbiter.called_wait_services.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn api_unavailable_self_destruct_fires_on_server_errors() {
        let deorbiter = MockDeorbiter {
            delete_fails: true,
            server_error: true,
            api_unavailable: true,
            ..MockDeorbiter::default()
        };
        let outcome = do_deorbit(&deorbiter, &CancellationToken::new()).await;
        assert!(outcome.is_err());
        let forced = check_self_destruct(&deorbiter, &outcome).await.expect("check");
        assert!(forced);
        assert_eq!(
            *deorbiter.destructed.lock().expect("lock"),
            vec![SelfDestructReason::ApiUnavailable]
        );
    }

    #[tokio::test]
    async fn hanging_self_destruct_fires_even_without_an_error() {
        let deorbiter = MockDeorbiter {
            hanging: true,
            ..MockDeorbiter::default()
        };
        let outcome = do_deorbit(&deorbiter, &CancellationToken::new()).await;
        assert!(outcome.is_ok());
        let forced = check_self_destruct(&deorbiter, &outcome).await.expect("check");
        assert!(forced);
        assert_eq!(
            *deorbiter.destructed.lock().expect("lock"),
            vec![SelfDestructReason::DeorbitHanging]
        );
    }

    #[tokio::test]
    async fn non_server_errors_do_not_trigger_api_unavailable() {
        let deorbiter = MockDeorbiter {
            delete_fails: true,
            server_error: false,
            api_unavailable: true,
            ..MockDeorbiter::default()
        };
        let outcome = do_deorbit(&deorbiter, &CancellationToken::new()).await;
        let forced = check_self_destruct(&deorbiter, &outcome).await.expect("check");
        assert!(!forced);
        assert!(deorbiter.destructed.lock().expect("lock").is_empty());
    }

    #[test]
    fn cinder_detection_covers_in_tree_and_csi() {
        use k8s_openapi::api::core::v1::{
            CSIPersistentVolumeSource, CinderPersistentVolumeSource, PersistentVolumeSpec,
        };

        let in_tree = PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                cinder: Some(CinderPersistentVolumeSource::default()),
                ..PersistentVolumeSpec::default()
            }),
            ..PersistentVolume::default()
        };
        assert!(pv_is_cinder(&in_tree));

        let csi = PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: CINDER_CSI_DRIVER.into(),
                    ..CSIPersistentVolumeSource::default()
                }),
                ..PersistentVolumeSpec::default()
            }),
            ..PersistentVolume::default()
        };
        assert!(pv_is_cinder(&csi));

        assert!(!pv_is_cinder(&PersistentVolume::default()));
    }
}

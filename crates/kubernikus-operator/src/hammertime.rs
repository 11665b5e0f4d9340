//! Hammertime: a watchdog that stops the hosted kube-controller-manager
//! when every node of a kluster has stopped heartbeating. Without it a
//! dead fabric would make the controller-manager evict all pods at once;
//! parking the controller-manager freezes the kluster instead.

use std::time::Duration;

use k8s_openapi::{
    api::{apps::v1::Deployment, autoscaling::v1::Scale, core::v1::Node},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
    chrono::{DateTime, Utc},
};
use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
};
use rand::Rng;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    client::{self, Client},
    kluster::{Kluster, KlusterPhase},
    metrics::HammertimeMetrics,
};

/// Default heartbeat staleness threshold.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Default base poll period; each sleep is jittered to spread API load.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

/// Names for the hosted controller-manager deployment. The legacy name is
/// tried when the current one does not exist.
const CONTROLLER_MANAGER_SUFFIX: &str = "-controller-manager";
const LEGACY_CONTROLLER_MANAGER_SUFFIX: &str = "-cmanager";

/// Scale subresource support needs at least this server minor version.
const SCALE_SUBRESOURCE_MINOR: u32 = 9;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("kubernetes operation failed"))]
    Client { source: client::Error },

    #[snafu(display("kubernetes API request failed"))]
    Kube { source: kube::Error },

    #[snafu(display("controller-manager deployment for kluster {kluster:?} not found"))]
    NoControllerManager { kluster: String },
}

/// What to do with the hosted controller-manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Controller-manager runs at one replica, gauge 0.
    Enable,
    /// Controller-manager parked at zero replicas, gauge 1.
    Disable,
}

/// Age of the freshest Ready-condition heartbeat per node.
pub fn heartbeats(nodes: &[Node], now: DateTime<Utc>) -> Vec<Duration> {
    nodes
        .iter()
        .filter_map(|node| {
            node.status
                .as_ref()?
                .conditions
                .as_ref()?
                .iter()
                .find(|c| c.type_ == "Ready")?
                .last_heartbeat_time
                .as_ref()
                .map(|t| (now - t.0).to_std().unwrap_or_default())
        })
        .collect()
}

/// The verdict for one kluster. Pure so the thresholds are testable.
///
/// A kluster too small to matter (fewer than two desired or registered
/// nodes) always keeps its controller-manager: with a single node there
/// is no quorum of heartbeats to distinguish a dead fabric from a dead
/// node.
pub fn decide(
    phase: KlusterPhase,
    opted_out: bool,
    desired_nodes: u32,
    registered_nodes: usize,
    heartbeat_ages: &[Duration],
    timeout: Duration,
) -> Action {
    if opted_out {
        return Action::Enable;
    }
    if phase == KlusterPhase::Terminating {
        return Action::Disable;
    }
    if desired_nodes < 2 || registered_nodes < 2 || heartbeat_ages.is_empty() {
        return Action::Enable;
    }
    if heartbeat_ages.iter().all(|age| *age > timeout) {
        return Action::Disable;
    }
    Action::Enable
}

pub struct Hammertime {
    pub client: Client,
    pub metrics: HammertimeMetrics,
    pub timeout: Duration,
    pub period: Duration,
}

impl Hammertime {
    /// Periodically sweeps every kluster. Runs until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let jittered = self.period.mul_f64(rand::rng().random_range(1.0..1.5));
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(jittered) => {}
            }
            if let Err(err) = self.sweep().await {
                warn!(error = %snafu::Report::from_error(err), "hammertime sweep failed");
            }
        }
    }

    async fn sweep(&self) -> Result<()> {
        let klusters = self.client.list_klusters().await.context(ClientSnafu)?;
        for kluster in klusters {
            if kluster.disabled()
                || matches!(
                    kluster.phase(),
                    KlusterPhase::Pending | KlusterPhase::Creating
                )
            {
                continue;
            }
            if let Err(err) = self.check_kluster(&kluster).await {
                warn!(
                    kluster = %kluster.name_any(),
                    error = %snafu::Report::from_error(err),
                    "hammertime check failed"
                );
            }
        }
        Ok(())
    }

    async fn check_kluster(&self, kluster: &Kluster) -> Result<()> {
        let (registered, ages) = match self.client.tenant_client(kluster).await {
            Ok(tenant) => {
                let nodes: Api<Node> = Api::all(tenant);
                let nodes = nodes.list(&Default::default()).await.context(KubeSnafu)?;
                (nodes.items.len(), heartbeats(&nodes.items, Utc::now()))
            }
            // An unreachable satellite yields no heartbeats; the decision
            // falls back to leaving the controller-manager alone.
            Err(err) => {
                warn!(kluster = %kluster.name_any(), error = %err, "satellite API not reachable");
                (0, Vec::new())
            }
        };

        let action = decide(
            kluster.phase(),
            kluster.hammertime_disabled(),
            kluster.total_desired_size(),
            registered,
            &ages,
            self.timeout,
        );
        self.apply(kluster, action).await
    }

    async fn apply(&self, kluster: &Kluster, action: Action) -> Result<()> {
        let replicas = match action {
            Action::Enable => 1,
            Action::Disable => 0,
        };
        let namespace = kluster.namespace().unwrap_or_default();
        let deployments: Api<Deployment> =
            Api::namespaced(self.client.as_kube_client(), &namespace);
        let name = self.controller_manager_name(&deployments, kluster).await?;

        let current = deployments
            .get(&name)
            .await
            .context(KubeSnafu)?
            .spec
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        if current != replicas {
            info!(
                kluster = %kluster.name_any(),
                deployment = %name,
                replicas,
                "hammertime scaling controller-manager"
            );
            self.scale(&deployments, &name, replicas).await?;
        }
        self.metrics
            .active
            .with_label_values(&[&kluster.name_any()])
            .set(i64::from(action == Action::Disable));
        Ok(())
    }

    async fn controller_manager_name(
        &self,
        deployments: &Api<Deployment>,
        kluster: &Kluster,
    ) -> Result<String> {
        let name = format!("{}{CONTROLLER_MANAGER_SUFFIX}", kluster.name_any());
        match deployments.get_opt(&name).await.context(KubeSnafu)? {
            Some(_) => Ok(name),
            None => {
                let legacy = format!("{}{LEGACY_CONTROLLER_MANAGER_SUFFIX}", kluster.name_any());
                match deployments.get_opt(&legacy).await.context(KubeSnafu)? {
                    Some(_) => Ok(legacy),
                    None => NoControllerManagerSnafu {
                        kluster: kluster.name_any(),
                    }
                    .fail(),
                }
            }
        }
    }

    /// Old API servers lack the scale subresource on deployments; fall
    /// back to patching `spec.replicas` directly.
    async fn scale(&self, deployments: &Api<Deployment>, name: &str, replicas: i32) -> Result<()> {
        let minor = self.client.server_minor_version().await.context(ClientSnafu)?;
        if minor >= SCALE_SUBRESOURCE_MINOR {
            let scale = Scale {
                metadata: ObjectMeta {
                    name: Some(name.to_owned()),
                    ..ObjectMeta::default()
                },
                spec: Some(k8s_openapi::api::autoscaling::v1::ScaleSpec {
                    replicas: Some(replicas),
                }),
                ..Scale::default()
            };
            deployments
                .patch_scale(name, &PatchParams::default(), &Patch::Merge(&scale))
                .await
                .context(KubeSnafu)?;
        } else {
            let patch = serde_json::json!({ "spec": { "replicas": replicas } });
            deployments
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .context(KubeSnafu)?;
        }
        Ok(())
    }
}

//! The Kluster custom resource: the desired and observed state of one
//! managed Kubernetes cluster.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Annotation that takes a kluster out of all reconciliation.
pub const DISABLED_ANNOTATION: &str = "kubernikus.cloud.sap/disabled";
/// Annotation that opts a kluster out of the hammertime circuit breaker.
pub const NO_HAMMERTIME_ANNOTATION: &str = "kubernikus.cloud.sap/no-hammertime";

/// Prefix of the provider id carried by the Kubernetes-side Node object.
pub const PROVIDER_ID_PREFIX: &str = "openstack:///";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubernikus.cloud.sap",
    version = "v1",
    kind = "Kluster",
    plural = "klusters",
    status = "KlusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KlusterSpec {
    #[serde(default)]
    pub advertise_address: String,

    /// Pod CIDR of the kluster, used for route ownership and tunnel redirection.
    #[serde(default)]
    pub cluster_cidr: Option<String>,

    #[serde(default)]
    pub service_cidr: Option<String>,

    /// Klusters without cloud-backed nodes. The launch controller leaves these alone.
    #[serde(default)]
    pub no_cloud: bool,

    /// While set, a Terminating kluster stays stuck on purpose.
    #[serde(default)]
    pub termination_protection: bool,

    #[serde(default)]
    pub node_pools: Vec<NodePool>,

    #[serde(default)]
    pub openstack: OpenstackSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenstackSpec {
    #[serde(default)]
    pub router_id: String,
    #[serde(default)]
    pub network_id: String,
    #[serde(default)]
    pub security_group_name: String,
}

/// Desired state of one worker node pool.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    pub name: String,
    pub flavor: String,
    pub image: String,
    #[serde(default)]
    pub size: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KlusterStatus {
    #[serde(default)]
    pub phase: KlusterPhase,
    #[serde(default)]
    pub node_pools: Vec<NodePoolInfo>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, Display, PartialEq, Eq)]
pub enum KlusterPhase {
    #[default]
    Pending,
    Creating,
    Running,
    Terminating,
}

/// Observed state of one node pool, written by the pool manager.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolInfo {
    pub name: String,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub running: u32,
    #[serde(default)]
    pub healthy: u32,
    #[serde(default)]
    pub schedulable: u32,
}

impl Kluster {
    pub fn phase(&self) -> KlusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Klusters the launch machinery must not touch at all.
    pub fn disabled(&self) -> bool {
        self.spec.no_cloud
            || self
                .annotations()
                .get(DISABLED_ANNOTATION)
                .is_some_and(|v| v == "true")
    }

    pub fn hammertime_disabled(&self) -> bool {
        self.annotations()
            .get(NO_HAMMERTIME_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    pub fn pool_info(&self, pool: &str) -> Option<&NodePoolInfo> {
        self.status
            .as_ref()
            .and_then(|s| s.node_pools.iter().find(|i| i.name == pool))
    }

    /// Sum of the declared sizes over all node pools.
    pub fn total_desired_size(&self) -> u32 {
        self.spec.node_pools.iter().map(|p| p.size).sum()
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers().iter().any(|f| f == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kluster_json(spec: serde_json::Value) -> Kluster {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "kubernikus.cloud.sap/v1",
            "kind": "Kluster",
            "metadata": { "name": "d-qa-1", "namespace": "qa" },
            "spec": spec,
        }))
        .expect("valid kluster")
    }

    #[test]
    fn defaults_are_benign() {
        let kluster = kluster_json(serde_json::json!({}));
        assert_eq!(kluster.phase(), KlusterPhase::Pending);
        assert!(!kluster.disabled());
        assert!(!kluster.spec.termination_protection);
        assert_eq!(kluster.total_desired_size(), 0);
    }

    #[test]
    fn pool_sizes_sum_up() {
        let kluster = kluster_json(serde_json::json!({
            "nodePools": [
                { "name": "payload", "flavor": "m1.small", "image": "flatcar", "size": 3 },
                { "name": "storage", "flavor": "m1.large", "image": "flatcar", "size": 2 },
            ]
        }));
        assert_eq!(kluster.total_desired_size(), 5);
    }

    #[test]
    fn no_cloud_disables() {
        let kluster = kluster_json(serde_json::json!({ "noCloud": true }));
        assert!(kluster.disabled());
    }
}

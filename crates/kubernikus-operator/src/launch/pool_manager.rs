//! Reconciles one node pool of one kluster against its observed cloud
//! state.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use snafu::ResultExt;
use tracing::debug;

use super::{ClientSnafu, CloudSnafu, Error, Result, UserdataSnafu};
use crate::{
    client::Client,
    cloud::{CloudNode, CloudProvider, NodeState},
    kluster::{Kluster, NodePool, NodePoolInfo, PROVIDER_ID_PREFIX},
    launch::userdata,
    metrics::PoolMetrics,
};

/// What the kluster's own API server knows about a node. Gathered once per
/// reconcile pass and shared by all pools.
#[derive(Clone, Debug)]
pub struct KubeNodeView {
    pub provider_id: String,
    pub ready: bool,
    pub unschedulable: bool,
}

/// Ephemeral per-pass pool state. `nodes` is ordered by termination
/// priority: nodes unknown to Kubernetes first, then unschedulable ones,
/// then the rest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub nodes: Vec<String>,
    pub running: u32,
    pub starting: u32,
    pub stopping: u32,
    pub needed: u32,
    pub unneeded: u32,
}

impl PoolStatus {
    pub fn compute(desired: u32, cloud_nodes: &[CloudNode], views: &[KubeNodeView]) -> Self {
        let mut running = 0;
        let mut starting = 0;
        let mut stopping = 0;
        for node in cloud_nodes {
            match node.state {
                NodeState::Running => running += 1,
                NodeState::Starting => starting += 1,
                NodeState::Stopping => stopping += 1,
            }
        }

        let mut nodes: Vec<String> = cloud_nodes.iter().map(|n| n.id.clone()).collect();
        nodes.sort_by_key(|id| termination_rank(id, views));

        Self {
            nodes,
            running,
            starting,
            stopping,
            needed: desired.saturating_sub(running + starting),
            unneeded: (running + starting).saturating_sub(desired),
        }
    }

    pub fn to_info(&self, pool: &NodePool) -> NodePoolInfo {
        NodePoolInfo {
            name: pool.name.clone(),
            size: pool.size,
            running: self.running + self.starting,
            healthy: self.running,
            schedulable: self.running,
        }
    }
}

/// Lower ranks terminate first.
fn termination_rank(id: &str, views: &[KubeNodeView]) -> u8 {
    let view = views
        .iter()
        .find(|v| v.provider_id == format!("{PROVIDER_ID_PREFIX}{id}"));
    match view {
        None => 0,
        Some(view) if view.unschedulable => 1,
        Some(_) => 2,
    }
}

#[async_trait]
pub trait PoolManager: Send + Sync {
    async fn get_status(&self) -> Result<PoolStatus>;

    /// Persists the pool's observed state onto the kluster. No-op when the
    /// stored info already matches (write avoidance).
    async fn set_status(&self, status: &PoolStatus) -> Result<()>;

    /// Boots one node and returns its id.
    async fn create_node(&self) -> Result<String>;

    async fn delete_node(&self, id: &str) -> Result<()>;

    /// Removes the pool-level server group once all members are gone.
    async fn delete_pool(&self) -> Result<()>;
}

pub struct KlusterPoolManager {
    pub kluster: Kluster,
    pub pool: NodePool,
    pub views: Vec<KubeNodeView>,
    pub cloud: Arc<dyn CloudProvider>,
    pub client: Client,
    pub metrics: PoolMetrics,
}

#[async_trait]
impl PoolManager for KlusterPoolManager {
    async fn get_status(&self) -> Result<PoolStatus> {
        let cloud_nodes = self
            .cloud
            .get_nodes(&self.kluster, &self.pool.name)
            .await
            .context(CloudSnafu)?;
        Ok(PoolStatus::compute(self.pool.size, &cloud_nodes, &self.views))
    }

    async fn set_status(&self, status: &PoolStatus) -> Result<()> {
        let info = status.to_info(&self.pool);
        let kluster_name = self.kluster.name_any();
        self.metrics
            .desired
            .with_label_values(&[&kluster_name, &self.pool.name])
            .set(i64::from(info.size));
        self.metrics
            .running
            .with_label_values(&[&kluster_name, &self.pool.name])
            .set(i64::from(info.running));

        // Re-fetch the authoritative object before mutating; the cached
        // copy we reconciled from may be stale.
        let namespace = self.kluster.namespace().unwrap_or_default();
        let mut fresh = self
            .client
            .get_kluster(&namespace, &kluster_name)
            .await
            .context(ClientSnafu)?;
        if fresh.pool_info(&self.pool.name) == Some(&info) {
            debug!(kluster = %kluster_name, pool = %self.pool.name, "pool status unchanged");
            return Ok(());
        }
        let status_block = fresh.status.get_or_insert_with(Default::default);
        match status_block
            .node_pools
            .iter_mut()
            .find(|i| i.name == self.pool.name)
        {
            Some(existing) => *existing = info,
            None => status_block.node_pools.push(info),
        }
        self.client
            .update_kluster_status(&fresh)
            .await
            .context(ClientSnafu)?;
        Ok(())
    }

    async fn create_node(&self) -> Result<String> {
        let secret = self
            .client
            .kluster_secret(&self.kluster)
            .await
            .context(ClientSnafu)?;
        let userdata =
            userdata::render(&self.kluster, &self.pool, &secret).context(UserdataSnafu)?;
        self.cloud
            .create_node(&self.kluster, &self.pool.name, &userdata)
            .await
            .context(CloudSnafu)
    }

    async fn delete_node(&self, id: &str) -> Result<()> {
        self.cloud
            .delete_node(&self.kluster, id)
            .await
            .context(CloudSnafu)
    }

    async fn delete_pool(&self) -> Result<()> {
        self.cloud
            .delete_pool(&self.kluster, &self.pool.name)
            .await
            .context(CloudSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud_node(id: &str, state: NodeState) -> CloudNode {
        CloudNode {
            id: id.to_owned(),
            name: format!("payload-{id}"),
            state,
        }
    }

    fn view(id: &str, unschedulable: bool) -> KubeNodeView {
        KubeNodeView {
            provider_id: format!("{PROVIDER_ID_PREFIX}{id}"),
            ready: true,
            unschedulable,
        }
    }

    #[test]
    fn needed_floors_at_zero() {
        let nodes = [
            cloud_node("a", NodeState::Running),
            cloud_node("b", NodeState::Running),
            cloud_node("c", NodeState::Starting),
        ];
        let status = PoolStatus::compute(5, &nodes, &[]);
        assert_eq!(status.needed, 2);
        assert_eq!(status.unneeded, 0);
    }

    #[test]
    fn unneeded_floors_at_zero() {
        let nodes = [
            cloud_node("a", NodeState::Running),
            cloud_node("b", NodeState::Running),
            cloud_node("c", NodeState::Running),
            cloud_node("d", NodeState::Running),
        ];
        let status = PoolStatus::compute(2, &nodes, &[]);
        assert_eq!(status.needed, 0);
        assert_eq!(status.unneeded, 2);
    }

    #[test]
    fn termination_priority_orders_missing_then_unschedulable() {
        let nodes = [
            cloud_node("a", NodeState::Running),
            cloud_node("b", NodeState::Running),
            cloud_node("c", NodeState::Running),
        ];
        // a is a healthy kubernetes node, b never registered, c is cordoned.
        let views = [view("a", false), view("c", true)];
        let status = PoolStatus::compute(3, &nodes, &views);
        assert_eq!(status.nodes, vec!["b", "c", "a"]);
    }

    #[test]
    fn stopping_nodes_count_towards_neither_side() {
        let nodes = [
            cloud_node("a", NodeState::Running),
            cloud_node("b", NodeState::Stopping),
        ];
        let status = PoolStatus::compute(1, &nodes, &[]);
        assert_eq!(status.needed, 0);
        assert_eq!(status.unneeded, 0);
        assert_eq!(status.stopping, 1);
    }

    #[test]
    fn info_projection() {
        let pool = NodePool {
            name: "payload".into(),
            flavor: "m1.small".into(),
            image: "flatcar".into(),
            size: 3,
        };
        let status = PoolStatus {
            running: 2,
            starting: 1,
            ..PoolStatus::default()
        };
        let info = status.to_info(&pool);
        assert_eq!(info.running, 3);
        assert_eq!(info.healthy, 2);
        assert_eq!(info.schedulable, 2);
        assert_eq!(info.size, 3);
    }
}

//! The launch controller: drives the worker-node pools of every kluster
//! toward their declared size and drains them again on termination.

pub mod decorators;
pub mod pool_manager;
pub mod userdata;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, ResourceExt, runtime::events::Recorder, runtime::reflector::ObjectRef};
use snafu::{ResultExt, Snafu};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    client::{self, Client, split_key},
    cloud::{self, CloudProvider},
    controller::{BoxError, Reconciler, Requeue},
    kluster::{Kluster, KlusterPhase, NodePool},
    metrics::{OperationMetrics, PoolMetrics},
};
use decorators::decorate;
use pool_manager::{KlusterPoolManager, KubeNodeView, PoolManager, PoolStatus};

/// Blocks kluster deletion until every cloud node is gone.
pub const LAUNCH_FINALIZER: &str = "kubernikus.cloud.sap/launchctl";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cloud operation failed"))]
    Cloud { source: cloud::Error },

    #[snafu(display("kubernetes operation failed"))]
    Client { source: client::Error },

    #[snafu(display("failed to render node userdata"))]
    Userdata { source: userdata::Error },

    #[snafu(display("node id {id:?} is not a well-formed uuid"))]
    MalformedNodeId { id: String, source: uuid::Error },
}

pub struct LaunchReconciler {
    pub client: Client,
    pub cloud: Arc<dyn CloudProvider>,
    pub recorder: Recorder,
    pub metrics: OperationMetrics,
    pub pool_metrics: PoolMetrics,
}

#[async_trait]
impl Reconciler for LaunchReconciler {
    fn name(&self) -> &'static str {
        "launch"
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
        if kluster.disabled() || kluster.spec.no_cloud {
            return Ok(Requeue::No);
        }
        let requeue = match kluster.phase() {
            KlusterPhase::Pending => Requeue::No,
            // No nodes yet while the control plane is still coming up, but
            // the finalizer must be in place before anything is created.
            KlusterPhase::Creating => {
                self.client
                    .add_finalizer(&kluster, LAUNCH_FINALIZER)
                    .await
                    .context(ClientSnafu)?;
                Requeue::No
            }
            KlusterPhase::Running => self.reconcile_pools(&kluster).await?,
            KlusterPhase::Terminating => self.terminate(&kluster).await?,
        };
        Ok(requeue)
    }
}

impl LaunchReconciler {
    async fn reconcile_pools(&self, kluster: &Kluster) -> Result<Requeue, BoxError> {
        let kluster = self
            .client
            .add_finalizer(kluster, LAUNCH_FINALIZER)
            .await
            .context(ClientSnafu)?;
        let views = self.node_views(&kluster).await;
        let mut requeue = Requeue::No;
        for pool in &kluster.spec.node_pools {
            let manager = self.pool_manager(&kluster, pool, views.clone());
            if reconcile_pool(manager.as_ref()).await? == Requeue::Yes {
                requeue = Requeue::Yes;
            }
        }
        Ok(requeue)
    }

    async fn terminate(&self, kluster: &Kluster) -> Result<Requeue, BoxError> {
        if kluster.spec.termination_protection {
            info!(kluster = %kluster.name_any(), "termination protection is set, leaving kluster alone");
            return Ok(Requeue::No);
        }
        let mut any_nodes = false;
        for pool in &kluster.spec.node_pools {
            let manager = self.pool_manager(kluster, pool, Vec::new());
            let status = manager.get_status().await?;
            if status.nodes.is_empty() {
                manager.delete_pool().await?;
                manager.set_status(&PoolStatus::default()).await?;
            } else {
                any_nodes = true;
                for id in &status.nodes {
                    ensure_node_id(id)?;
                    manager.delete_node(id).await?;
                }
            }
        }
        if any_nodes {
            return Ok(Requeue::Yes);
        }
        self.cloud
            .delete_user(&format!("kubernikus-{}", kluster.name_any()), "kubernikus")
            .await
            .context(CloudSnafu)?;
        self.client
            .remove_finalizer(kluster, LAUNCH_FINALIZER)
            .await
            .context(ClientSnafu)?;
        Ok(Requeue::No)
    }

    fn pool_manager(
        &self,
        kluster: &Kluster,
        pool: &NodePool,
        views: Vec<KubeNodeView>,
    ) -> Box<dyn PoolManager> {
        let concrete = KlusterPoolManager {
            kluster: kluster.clone(),
            pool: pool.clone(),
            views,
            cloud: Arc::clone(&self.cloud),
            client: self.client.clone(),
            metrics: self.pool_metrics.clone(),
        };
        decorate(
            concrete,
            kluster.name_any(),
            pool.name.clone(),
            self.metrics.clone(),
            self.recorder.clone(),
            ObjectRef::from_obj(kluster),
        )
    }

    /// Kubernetes-side node state from the kluster's own API server. Best
    /// effort: a satellite that is still coming up simply yields no views.
    async fn node_views(&self, kluster: &Kluster) -> Vec<KubeNodeView> {
        let tenant = match self.client.tenant_client(kluster).await {
            Ok(tenant) => tenant,
            Err(err) => {
                warn!(kluster = %kluster.name_any(), error = %err, "satellite API not reachable yet");
                return Vec::new();
            }
        };
        let nodes: Api<Node> = Api::all(tenant);
        match nodes.list(&Default::default()).await {
            Ok(list) => list.items.iter().map(node_view).collect(),
            Err(err) => {
                warn!(kluster = %kluster.name_any(), error = %err, "cannot list satellite nodes");
                Vec::new()
            }
        }
    }
}

pub fn node_view(node: &Node) -> KubeNodeView {
    let spec = node.spec.as_ref();
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True");
    KubeNodeView {
        provider_id: spec.and_then(|s| s.provider_id.clone()).unwrap_or_default(),
        ready,
        unschedulable: spec.and_then(|s| s.unschedulable).unwrap_or(false),
    }
}

/// One pass over a single pool. At most one destructive action per pass:
/// scale-down deletes exactly one node, the head of the termination
/// priority order.
pub async fn reconcile_pool(manager: &dyn PoolManager) -> Result<Requeue> {
    let status = manager.get_status().await?;
    manager.set_status(&status).await?;

    if status.needed > 0 {
        for _ in 0..status.needed {
            manager.create_node().await?;
        }
        return Ok(Requeue::Yes);
    }
    if status.unneeded > 0 {
        let id = status.nodes.first().cloned().unwrap_or_default();
        ensure_node_id(&id)?;
        manager.delete_node(&id).await?;
        return Ok(Requeue::Yes);
    }
    if status.starting > 0 || status.stopping > 0 {
        // Wait for the cloud to settle.
        return Ok(Requeue::Yes);
    }
    Ok(Requeue::No)
}

fn ensure_node_id(id: &str) -> Result<()> {
    Uuid::parse_str(id)
        .map(|_| ())
        .context(MalformedNodeIdSnafu { id })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::cloud::{CloudNode, NodeState};
    use crate::kluster::PROVIDER_ID_PREFIX;

    /// Pool manager over a simulated cloud: created nodes appear in
    /// Starting state, deletes remove them immediately.
    struct SimPoolManager {
        desired: u32,
        nodes: Mutex<Vec<CloudNode>>,
        views: Vec<KubeNodeView>,
        created: Mutex<u32>,
        deleted: Mutex<Vec<String>>,
    }

    impl SimPoolManager {
        fn new(desired: u32, nodes: Vec<CloudNode>, views: Vec<KubeNodeView>) -> Self {
            Self {
                desired,
                nodes: Mutex::new(nodes),
                views,
                created: Mutex::new(0),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PoolManager for SimPoolManager {
        async fn get_status(&self) -> Result<PoolStatus> {
            let nodes = self.nodes.lock().expect("lock");
            Ok(PoolStatus::compute(self.desired, &nodes, &self.views))
        }

        async fn set_status(&self, _status: &PoolStatus) -> Result<()> {
            Ok(())
        }

        async fn create_node(&self) -> Result<String> {
            let id = Uuid::new_v4().to_string();
            self.nodes.lock().expect("lock").push(CloudNode {
                id: id.clone(),
                name: format!("payload-{id}"),
                state: NodeState::Starting,
            });
            *self.created.lock().expect("lock") += 1;
            Ok(id)
        }

        async fn delete_node(&self, id: &str) -> Result<()> {
            self.nodes.lock().expect("lock").retain(|n| n.id != id);
            self.deleted.lock().expect("lock").push(id.to_owned());
            Ok(())
        }

        async fn delete_pool(&self) -> Result<()> {
            Ok(())
        }
    }

    fn running(id: &str) -> CloudNode {
        CloudNode {
            id: id.to_owned(),
            name: format!("payload-{id}"),
            state: NodeState::Running,
        }
    }

    fn view(id: &str, unschedulable: bool) -> KubeNodeView {
        KubeNodeView {
            provider_id: format!("{PROVIDER_ID_PREFIX}{id}"),
            ready: true,
            unschedulable,
        }
    }

    #[tokio::test]
    async fn converged_pool_issues_no_further_calls() {
        let manager = SimPoolManager::new(3, Vec::new(), Vec::new());

        // First pass creates the three missing nodes.
        assert_eq!(reconcile_pool(&manager).await.expect("pass 1"), Requeue::Yes);
        assert_eq!(*manager.created.lock().expect("lock"), 3);

        // Second pass: nodes are Starting, nothing to create or delete.
        assert_eq!(reconcile_pool(&manager).await.expect("pass 2"), Requeue::Yes);
        assert_eq!(*manager.created.lock().expect("lock"), 3);
        assert!(manager.deleted.lock().expect("lock").is_empty());

        // Once everything runs, the pool settles and stops requeueing.
        for node in manager.nodes.lock().expect("lock").iter_mut() {
            node.state = NodeState::Running;
        }
        assert_eq!(reconcile_pool(&manager).await.expect("pass 3"), Requeue::No);
        assert_eq!(*manager.created.lock().expect("lock"), 3);
    }

    #[tokio::test]
    async fn scale_down_deletes_exactly_one_node_in_priority_order() {
        let a = Uuid::new_v4().to_string();
        let b = Uuid::new_v4().to_string();
        let c = Uuid::new_v4().to_string();
        // a is healthy, b never joined kubernetes, c is cordoned.
        let manager = SimPoolManager::new(
            1,
            vec![running(&a), running(&b), running(&c)],
            vec![view(&a, false), view(&c, true)],
        );

        assert_eq!(reconcile_pool(&manager).await.expect("pass 1"), Requeue::Yes);
        assert_eq!(*manager.deleted.lock().expect("lock"), vec![b.clone()]);

        assert_eq!(reconcile_pool(&manager).await.expect("pass 2"), Requeue::Yes);
        assert_eq!(
            *manager.deleted.lock().expect("lock"),
            vec![b.clone(), c.clone()]
        );

        assert_eq!(reconcile_pool(&manager).await.expect("pass 3"), Requeue::No);
        assert_eq!(manager.nodes.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn malformed_node_id_is_a_hard_error() {
        let manager = SimPoolManager::new(0, vec![running("not-a-uuid")], Vec::new());
        let err = reconcile_pool(&manager).await.expect_err("malformed id");
        assert!(matches!(err, Error::MalformedNodeId { .. }));
        assert!(manager.deleted.lock().expect("lock").is_empty());
    }
}

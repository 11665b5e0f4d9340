//! Tracks the cluster's nodes and keeps one tunnel plus one set of
//! redirect rules per node. Fed by the shared controller harness watching
//! Node objects.

use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Node;
use kube::Api;
use snafu::{ResultExt, Snafu};
use tokio_rustls::rustls::ClientConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kubernikus_operator::controller::{BoxError, Reconciler, Requeue};

use crate::{
    iptables::{self, Firewall, NodeRedirect},
    tunnel::{self, Tunnel},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("kubernetes API request failed"))]
    Kube { source: kube::Error },

    #[snafu(display("cannot open a tunnel"))]
    Tunnel { source: tunnel::Error },

    #[snafu(display("cannot apply redirect rules"))]
    Iptables { source: iptables::Error },
}

struct TunnelEntry {
    node_ip: Ipv4Addr,
    pod_cidr: Option<Ipv4Net>,
    tunnel: Tunnel,
}

pub struct TunnelController {
    nodes: Api<Node>,
    tls: Arc<ClientConfig>,
    service_cidr: Ipv4Net,
    tunnel_port: u16,
    firewall: Arc<dyn Firewall>,
    shutdown: CancellationToken,
    table: Mutex<BTreeMap<String, TunnelEntry>>,
}

impl TunnelController {
    pub fn new(
        nodes: Api<Node>,
        tls: Arc<ClientConfig>,
        service_cidr: Ipv4Net,
        tunnel_port: u16,
        firewall: Arc<dyn Firewall>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            nodes,
            tls,
            service_cidr,
            tunnel_port,
            firewall,
            shutdown,
            table: Mutex::new(BTreeMap::new()),
        }
    }

    /// Starts or replaces the tunnel for one node. A node without an
    /// internal address is dropped from the table until it reports one.
    pub async fn ensure_node(&self, name: &str, node: &Node) -> Result<()> {
        let Some(node_ip) = internal_ip(node) else {
            warn!(node = name, "node has no internal IPv4 address yet");
            return self.remove_node(name).await;
        };
        let pod_cidr = pod_cidr(node);

        if let Some(entry) = self.lock().get(name) {
            if entry.node_ip == node_ip && entry.pod_cidr == pod_cidr {
                return Ok(());
            }
            info!(node = name, %node_ip, "node address changed, replacing tunnel");
        }

        let remote = SocketAddr::from((node_ip, self.tunnel_port));
        let tunnel = Tunnel::open(
            Arc::clone(&self.tls),
            remote,
            self.shutdown.child_token(),
        )
        .await
        .context(TunnelSnafu)?;
        info!(node = name, %remote, port = tunnel.port, "tunnel client started");

        let previous = self.lock().insert(
            name.to_owned(),
            TunnelEntry {
                node_ip,
                pod_cidr,
                tunnel,
            },
        );
        if let Some(previous) = previous {
            previous.tunnel.stop();
        }
        self.resync().await
    }

    pub async fn remove_node(&self, name: &str) -> Result<()> {
        let Some(entry) = self.lock().remove(name) else {
            return Ok(());
        };
        entry.tunnel.stop();
        info!(node = name, "tunnel client stopped");
        self.resync().await
    }

    /// Regenerates the whole redirect chain from the route table.
    async fn resync(&self) -> Result<()> {
        let redirects: Vec<NodeRedirect> = self
            .lock()
            .values()
            .map(|entry| NodeRedirect {
                node_ip: entry.node_ip,
                pod_cidr: entry.pod_cidr,
                port: entry.tunnel.port,
            })
            .collect();
        let rules = iptables::render_rules(self.service_cidr, &redirects);
        self.firewall.apply(&rules).await.context(IptablesSnafu)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, TunnelEntry>> {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Reconciler for TunnelController {
    fn name(&self) -> &'static str {
        "wormhole"
    }

    async fn reconcile(&self, key: &str) -> Result<Requeue, BoxError> {
        match self.nodes.get_opt(key).await.context(KubeSnafu)? {
            Some(node) => self.ensure_node(key, &node).await?,
            None => self.remove_node(key).await?,
        }
        Ok(Requeue::No)
    }
}

fn internal_ip(node: &Node) -> Option<Ipv4Addr> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .and_then(|a| a.address.parse().ok())
}

fn pod_cidr(node: &Node) -> Option<Ipv4Net> {
    node.spec
        .as_ref()?
        .pod_cidr
        .as_ref()
        .and_then(|cidr| cidr.parse().ok())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{NodeAddress, NodeSpec, NodeStatus};
    use tokio_rustls::rustls::RootCertStore;

    use super::*;

    struct RecordingFirewall {
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Firewall for RecordingFirewall {
        async fn apply(&self, rules: &str) -> iptables::Result<()> {
            self.applied
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(rules.to_owned());
            Ok(())
        }
    }

    fn node(ip: &str, pod_cidr: &str) -> Node {
        Node {
            spec: Some(NodeSpec {
                pod_cidr: Some(pod_cidr.to_owned()),
                ..NodeSpec::default()
            }),
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".into(),
                    address: ip.to_owned(),
                }]),
                ..NodeStatus::default()
            }),
            ..Node::default()
        }
    }

    fn controller() -> (TunnelController, Arc<RecordingFirewall>) {
        let firewall = Arc::new(RecordingFirewall {
            applied: Mutex::new(Vec::new()),
        });
        let tls = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        let kube = kube::Client::try_from(
            kube::Config::new("http://127.0.0.1:8080".parse().expect("url")),
        )
        .expect("client");
        let controller = TunnelController::new(
            Api::all(kube),
            Arc::new(tls),
            "198.18.128.0/17".parse().expect("cidr"),
            9090,
            Arc::clone(&firewall) as Arc<dyn Firewall>,
            CancellationToken::new(),
        );
        (controller, firewall)
    }

    fn rules(firewall: &RecordingFirewall) -> Vec<String> {
        firewall
            .applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[tokio::test]
    async fn tracked_nodes_produce_three_rules_each() {
        let (controller, firewall) = controller();
        controller
            .ensure_node("node-1", &node("10.0.0.1", "100.100.1.0/24"))
            .await
            .expect("add node-1");
        controller
            .ensure_node("node-2", &node("10.0.0.2", "100.100.2.0/24"))
            .await
            .expect("add node-2");

        let applied = rules(&firewall);
        assert_eq!(applied.len(), 2);
        let last = applied.last().expect("rules");
        assert_eq!(last.lines().filter(|l| l.starts_with("-A")).count(), 6);
    }

    #[tokio::test]
    async fn unchanged_node_does_not_resync() {
        let (controller, firewall) = controller();
        let n = node("10.0.0.1", "100.100.1.0/24");
        controller.ensure_node("node-1", &n).await.expect("add");
        controller.ensure_node("node-1", &n).await.expect("re-add");
        assert_eq!(rules(&firewall).len(), 1);
    }

    #[tokio::test]
    async fn removing_a_node_drops_its_rules() {
        let (controller, firewall) = controller();
        controller
            .ensure_node("node-1", &node("10.0.0.1", "100.100.1.0/24"))
            .await
            .expect("add node-1");
        controller
            .ensure_node("node-2", &node("10.0.0.2", "100.100.2.0/24"))
            .await
            .expect("add node-2");
        controller.remove_node("node-1").await.expect("remove");

        let applied = rules(&firewall);
        let last = applied.last().expect("rules");
        assert_eq!(last.lines().filter(|l| l.starts_with("-A")).count(), 3);
        assert!(!last.contains("10.0.0.1"));
    }

    #[tokio::test]
    async fn removing_an_unknown_node_is_a_no_op() {
        let (controller, firewall) = controller();
        controller.remove_node("ghost").await.expect("remove");
        assert!(rules(&firewall).is_empty());
    }
}

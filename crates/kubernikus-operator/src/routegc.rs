//! Route garbage collection: prunes router routes that point pod traffic
//! at instances that no longer exist. Only routes the kluster owns are
//! touched so customer routes on a shared router survive.

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use ipnet::Ipv4Net;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    client::{self, Client},
    cloud::{self, CloudProvider, RouterRoute},
    kluster::{Kluster, KlusterPhase},
};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cloud operation failed"))]
    Cloud { source: cloud::Error },

    #[snafu(display("kubernetes operation failed"))]
    Client { source: client::Error },

    #[snafu(display("kluster {kluster:?} has an unparseable cluster CIDR {cidr:?}"))]
    BadClusterCidr {
        kluster: String,
        cidr: String,
        source: ipnet::AddrParseError,
    },
}

/// A route belongs to the kluster when both its network and broadcast
/// address fall inside the pod CIDR. Containment of the network address
/// alone would also claim wider routes that merely overlap.
pub fn owns_route(pod_cidr: Ipv4Net, destination: Ipv4Net) -> bool {
    pod_cidr.contains(&destination.network()) && pod_cidr.contains(&destination.broadcast())
}

/// Routes after garbage collection, or `None` when nothing needs to
/// change. Unowned routes pass through untouched.
pub fn gc_routes(
    routes: &[RouterRoute],
    pod_cidr: Ipv4Net,
    valid_nexthops: &[Ipv4Addr],
) -> Option<Vec<RouterRoute>> {
    let keep: Vec<RouterRoute> = routes
        .iter()
        .filter(|route| {
            !owns_route(pod_cidr, route.destination)
                || valid_nexthops.contains(&route.nexthop)
        })
        .cloned()
        .collect();
    (keep.len() != routes.len()).then_some(keep)
}

pub struct RouteGarbageCollector {
    pub client: Client,
    pub cloud: Arc<dyn CloudProvider>,
}

impl RouteGarbageCollector {
    /// Periodically sweeps the routers of all running klusters. Runs until
    /// cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }
            if let Err(err) = self.sweep().await {
                warn!(error = %snafu::Report::from_error(err), "route gc sweep failed");
            }
        }
    }

    async fn sweep(&self) -> Result<()> {
        let klusters = self.client.list_klusters().await.context(ClientSnafu)?;
        for kluster in klusters {
            if kluster.phase() != KlusterPhase::Running
                || kluster.disabled()
                || kluster.spec.no_cloud
            {
                continue;
            }
            if let Err(err) = self.sweep_kluster(&kluster).await {
                warn!(
                    kluster = %kluster.name_any(),
                    error = %snafu::Report::from_error(err),
                    "route gc failed"
                );
            }
        }
        Ok(())
    }

    async fn sweep_kluster(&self, kluster: &Kluster) -> Result<()> {
        let Some(cidr) = kluster.spec.cluster_cidr.as_deref() else {
            return Ok(());
        };
        let pod_cidr: Ipv4Net = cidr.parse().context(BadClusterCidrSnafu {
            kluster: kluster.name_any(),
            cidr,
        })?;
        let router_id = &kluster.spec.openstack.router_id;
        let routes = self
            .cloud
            .get_router_routes(router_id)
            .await
            .context(CloudSnafu)?;
        let nexthops = self
            .cloud
            .list_instance_ips(kluster)
            .await
            .context(CloudSnafu)?;

        if let Some(pruned) = gc_routes(&routes, pod_cidr, &nexthops) {
            info!(
                kluster = %kluster.name_any(),
                removed = routes.len() - pruned.len(),
                "pruning orphaned router routes"
            );
            self.cloud
                .set_router_routes(router_id, &pruned)
                .await
                .context(CloudSnafu)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(destination: &str, nexthop: &str) -> RouterRoute {
        RouterRoute {
            destination: destination.parse().expect("destination"),
            nexthop: nexthop.parse().expect("nexthop"),
        }
    }

    fn pod_cidr() -> Ipv4Net {
        "100.100.0.0/16".parse().expect("cidr")
    }

    #[test]
    fn orphaned_owned_routes_are_pruned() {
        let routes = [
            route("100.100.1.0/24", "10.0.0.1"),
            route("100.100.2.0/24", "10.0.0.2"),
        ];
        let valid = ["10.0.0.1".parse().expect("ip")];
        let pruned = gc_routes(&routes, pod_cidr(), &valid).expect("changed");
        assert_eq!(pruned, vec![route("100.100.1.0/24", "10.0.0.1")]);
    }

    #[test]
    fn unowned_routes_survive_even_with_dead_nexthops() {
        let routes = [
            // Customer route on the shared router, outside the pod range.
            route("192.168.0.0/24", "10.0.0.99"),
            // Wider than the pod range: network inside semantics would
            // misclassify this one.
            route("100.0.0.0/8", "10.0.0.99"),
        ];
        assert_eq!(gc_routes(&routes, pod_cidr(), &[]), None);
    }

    #[test]
    fn no_change_yields_no_write() {
        let routes = [route("100.100.1.0/24", "10.0.0.1")];
        let valid = ["10.0.0.1".parse().expect("ip")];
        assert_eq!(gc_routes(&routes, pod_cidr(), &valid), None);
    }

    #[test]
    fn ownership_requires_full_containment() {
        let pod = pod_cidr();
        assert!(owns_route(pod, "100.100.1.0/24".parse().expect("net")));
        assert!(owns_route(pod, "100.100.0.0/16".parse().expect("net")));
        assert!(!owns_route(pod, "100.0.0.0/8".parse().expect("net")));
        // Network inside, broadcast outside: straddles the upper boundary.
        assert!(!owns_route(pod, "100.100.0.0/15".parse().expect("net")));
    }
}

//! Façade over the OpenStack APIs. The reconcilers only ever see the
//! [`CloudProvider`] trait, so they can be tested against recording fakes.

pub mod openstack;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use snafu::Snafu;

use crate::kluster::Kluster;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("http request against the cloud API failed"))]
    Http { source: reqwest::Error },

    #[snafu(display("cloud API returned {status}: {message}"))]
    Api { status: u16, message: String },

    #[snafu(display("authentication against keystone failed: {message}"))]
    Auth { message: String },

    #[snafu(display("no {endpoint} endpoint in the service catalog"))]
    MissingEndpoint { endpoint: String },

    #[snafu(display("cloud returned a malformed {what}"))]
    MalformedResponse { what: String },
}

/// Lifecycle of a compute instance, collapsed to what the pool manager
/// cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    Running,
    Stopping,
}

#[derive(Clone, Debug)]
pub struct CloudNode {
    pub id: String,
    pub name: String,
    pub state: NodeState,
}

/// A static route on an OpenStack router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterRoute {
    pub destination: Ipv4Net,
    pub nexthop: Ipv4Addr,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Lists the instances belonging to one node pool of one kluster.
    async fn get_nodes(&self, kluster: &Kluster, pool: &str) -> Result<Vec<CloudNode>>;

    /// Boots one instance and returns its id. Nothing is recorded anywhere
    /// unless this succeeds.
    async fn create_node(&self, kluster: &Kluster, pool: &str, userdata: &[u8]) -> Result<String>;

    async fn delete_node(&self, kluster: &Kluster, id: &str) -> Result<()>;

    /// Deletes the pool-level server group once all members are gone.
    async fn delete_pool(&self, kluster: &Kluster, pool: &str) -> Result<()>;

    /// Removes the service user created for a kluster.
    async fn delete_user(&self, name: &str, domain: &str) -> Result<()>;

    /// All addresses attached to any of the kluster's instances. Used to
    /// decide which router routes still have a live next-hop.
    async fn list_instance_ips(&self, kluster: &Kluster) -> Result<Vec<Ipv4Addr>>;

    async fn get_router_routes(&self, router_id: &str) -> Result<Vec<RouterRoute>>;

    async fn set_router_routes(&self, router_id: &str, routes: &[RouterRoute]) -> Result<()>;
}

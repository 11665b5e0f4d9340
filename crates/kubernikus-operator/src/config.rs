//! Command line and environment configuration for groundcontrol.

use std::{net::SocketAddr, time::Duration};

use clap::{Parser, ValueEnum};

use crate::cloud::openstack::AuthOptions;

/// The controllers groundcontrol can run. The default set is all of them;
/// sharded deployments pick a subset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Controller {
    Launch,
    Deorbit,
    Hammertime,
    Routegc,
    Observatory,
}

#[derive(Debug, Parser)]
#[command(name = "groundcontrol", about = "Cluster lifecycle operator for OpenStack-backed Kubernetes clusters", version)]
pub struct Options {
    /// Controllers to run.
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = vec![
        Controller::Launch,
        Controller::Deorbit,
        Controller::Hammertime,
        Controller::Routegc,
        Controller::Observatory,
    ])]
    pub controllers: Vec<Controller>,

    /// Namespace to watch. All namespaces when omitted.
    #[arg(long, env = "KUBERNIKUS_NAMESPACE")]
    pub namespace: Option<String>,

    /// Listen address for the metrics and health endpoints.
    #[arg(long, default_value = "0.0.0.0:9091")]
    pub metrics_listen_address: SocketAddr,

    /// Workers draining the launch queue.
    #[arg(long, default_value_t = 10)]
    pub launch_workers: usize,

    /// Workers draining the deorbit queue.
    #[arg(long, default_value_t = 3)]
    pub deorbit_workers: usize,

    /// Full resync period for the watch-fed queues.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub resync_period: Duration,

    /// Node heartbeat staleness after which hammertime parks the
    /// controller-manager.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub hammertime_timeout: Duration,

    /// Base period between hammertime sweeps, jittered at runtime.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1m")]
    pub hammertime_period: Duration,

    #[command(flatten)]
    pub openstack: OpenstackOptions,
}

/// Keystone credentials, taken from the usual OS_* environment.
#[derive(Debug, Parser)]
pub struct OpenstackOptions {
    #[arg(long, env = "OS_AUTH_URL")]
    pub auth_url: String,

    #[arg(long, env = "OS_USERNAME")]
    pub username: String,

    #[arg(long, env = "OS_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(long, env = "OS_USER_DOMAIN_NAME", default_value = "Default")]
    pub user_domain: String,

    #[arg(long, env = "OS_PROJECT_ID")]
    pub project_id: String,
}

impl Options {
    pub fn runs(&self, controller: Controller) -> bool {
        self.controllers.contains(&controller)
    }

    pub fn auth_options(&self) -> AuthOptions {
        AuthOptions {
            auth_url: self.openstack.auth_url.clone(),
            username: self.openstack.username.clone(),
            password: self.openstack.password.clone(),
            user_domain: self.openstack.user_domain.clone(),
            project_id: self.openstack.project_id.clone(),
        }
    }
}

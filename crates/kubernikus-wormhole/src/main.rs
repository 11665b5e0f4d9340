//! wormhole: watches the cluster's nodes and maintains one tunnel plus
//! the NAT redirection rules per node.

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::api::core::v1::Node;
use kube::Api;
use snafu::{ResultExt, Snafu};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kubernikus_operator::controller::Runner;
use kubernikus_wormhole::{
    config::Options,
    controller::TunnelController,
    iptables::{self, Firewall, IptablesRestore},
    tunnel::{self, load_client_config},
};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("cannot construct the kubernetes client"))]
    KubeClient { source: kube::Error },

    #[snafu(display("cannot load the TLS material"))]
    Tls { source: tunnel::Error },

    #[snafu(display("cannot prepare the nat chain"))]
    Iptables { source: iptables::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = Options::parse();
    info!(service_cidr = %options.service_cidr, "wormhole starting");

    let tls = load_client_config(&options.tls_files()).context(TlsSnafu)?;
    let kube = kube::Client::try_default().await.context(KubeClientSnafu)?;
    let nodes: Api<Node> = Api::all(kube);

    let firewall = IptablesRestore::new();
    firewall.ensure_chain().await.context(IptablesSnafu)?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let controller = Arc::new(TunnelController::new(
        nodes.clone(),
        tls,
        options.service_cidr,
        options.tunnel_port,
        Arc::new(firewall) as Arc<dyn Firewall>,
        cancel.clone(),
    ));
    // Tunnels are lightweight to manage; one worker keeps the resyncs and
    // the rule regeneration naturally ordered.
    Runner::new(nodes, controller, 1)
        .with_resync(options.resync_period)
        .run(cancel)
        .await;

    info!("wormhole stopped");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(error = %err, "cannot install the SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
    }
    cancel.cancel();
}

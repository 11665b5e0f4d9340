//! groundcontrol: the composition root wiring every controller to one
//! shared kube client, metrics registry and shutdown token.

use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, routing::get};
use clap::Parser;
use kube::{
    Api,
    runtime::events::{Recorder, Reporter},
};
use prometheus::{Registry, TextEncoder};
use snafu::{ResultExt, Snafu};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kubernikus_operator::{
    client::Client,
    cloud::{CloudProvider, openstack::OpenStack},
    config::{Controller, Options},
    controller::Runner,
    deorbit::DeorbitReconciler,
    hammertime::Hammertime,
    kluster::Kluster,
    launch::LaunchReconciler,
    metrics::{self, HammertimeMetrics, OperationMetrics, PoolMetrics},
    observatory::Observatory,
    routegc::RouteGarbageCollector,
};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("cannot construct the kubernetes client"))]
    KubeClient { source: kube::Error },

    #[snafu(display("cannot register metrics"))]
    Metrics { source: metrics::Error },

    #[snafu(display("cannot bind the metrics listener"))]
    Bind { source: std::io::Error },

    #[snafu(display("the metrics server failed"))]
    Serve { source: std::io::Error },
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
    info!(controllers = ?options.controllers, "groundcontrol starting");

    let kube = kube::Client::try_default().await.context(KubeClientSnafu)?;
    let client = Client::new(kube.clone());
    let cloud: Arc<dyn CloudProvider> = Arc::new(OpenStack::new(options.auth_options()));
    let registry = Registry::new();
    let recorder = Recorder::new(
        kube.clone(),
        Reporter {
            controller: "kubernikus".into(),
            instance: None,
        },
    );

    let klusters: Api<Kluster> = match &options.namespace {
        Some(namespace) => Api::namespaced(kube.clone(), namespace),
        None => Api::all(kube.clone()),
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let mut tasks = JoinSet::new();
    let mut launch_queue = None;

    if options.runs(Controller::Launch) {
        let reconciler = Arc::new(LaunchReconciler {
            client: client.clone(),
            cloud: Arc::clone(&cloud),
            recorder: recorder.clone(),
            metrics: OperationMetrics::register("launch", &registry).context(MetricsSnafu)?,
            pool_metrics: PoolMetrics::register(&registry).context(MetricsSnafu)?,
        });
        let runner = Runner::new(klusters.clone(), reconciler, options.launch_workers)
            .with_resync(options.resync_period);
        launch_queue = Some(runner.queue());
        tasks.spawn(runner.run(cancel.clone()));
    }

    if options.runs(Controller::Deorbit) {
        let reconciler = Arc::new(DeorbitReconciler {
            client: client.clone(),
            recorder: recorder.clone(),
            metrics: OperationMetrics::register("deorbit", &registry).context(MetricsSnafu)?,
            shutdown: cancel.clone(),
        });
        let runner = Runner::new(klusters.clone(), reconciler, options.deorbit_workers)
            .with_resync(options.resync_period);
        tasks.spawn(runner.run(cancel.clone()));
    }

    if options.runs(Controller::Observatory) {
        // The observatory feeds the launch queue; without the launch
        // controller in this process there is nothing to feed.
        match &launch_queue {
            Some(queue) => {
                let observatory = Observatory {
                    client: client.clone(),
                    queue: Arc::clone(queue),
                };
                let cancel = cancel.clone();
                tasks.spawn(async move { observatory.run(cancel).await });
            }
            None => warn!("observatory requested without the launch controller, skipping"),
        }
    }

    if options.runs(Controller::Hammertime) {
        let hammertime = Hammertime {
            client: client.clone(),
            metrics: HammertimeMetrics::register(&registry).context(MetricsSnafu)?,
            timeout: options.hammertime_timeout,
            period: options.hammertime_period,
        };
        let cancel = cancel.clone();
        tasks.spawn(async move { hammertime.run(cancel).await });
    }

    if options.runs(Controller::Routegc) {
        let collector = RouteGarbageCollector {
            client: client.clone(),
            cloud: Arc::clone(&cloud),
        };
        let cancel = cancel.clone();
        tasks.spawn(async move { collector.run(cancel).await });
    }

    let app = Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(registry);
    let listener = TcpListener::bind(options.metrics_listen_address)
        .await
        .context(BindSnafu)?;
    info!(address = %options.metrics_listen_address, "serving metrics");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context(ServeSnafu)?;

    while tasks.join_next().await.is_some() {}
    info!("groundcontrol stopped");
    Ok(())
}

async fn serve_metrics(State(registry): State<Registry>) -> (StatusCode, String) {
    let mut buffer = String::new();
    match TextEncoder::new().encode_utf8(&registry.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
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

//! Per-component metric families. All of them are registered against an
//! explicitly constructed [`prometheus::Registry`] handed in by the
//! composition root; there is no ambient global state.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use snafu::{ResultExt, Snafu};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to register {component} metrics"))]
    Register {
        source: prometheus::Error,
        component: String,
    },
}

/// Method-labeled latency/outcome metrics shared by the decorator chains.
#[derive(Clone)]
pub struct OperationMetrics {
    pub latency: HistogramVec,
    pub total: IntCounterVec,
    pub failures: IntCounterVec,
}

impl OperationMetrics {
    pub fn register(component: &str, registry: &Registry) -> Result<Self> {
        let latency = HistogramVec::new(
            HistogramOpts::new(
                format!("kubernikus_{component}_operation_latency_seconds"),
                "Latency of one operation",
            ),
            &["method"],
        )
        .context(RegisterSnafu { component })?;
        let total = IntCounterVec::new(
            Opts::new(
                format!("kubernikus_{component}_operations_total"),
                "Number of operations",
            ),
            &["method"],
        )
        .context(RegisterSnafu { component })?;
        let failures = IntCounterVec::new(
            Opts::new(
                format!("kubernikus_{component}_operation_failures_total"),
                "Number of failed operations",
            ),
            &["method"],
        )
        .context(RegisterSnafu { component })?;
        for collector in [
            Box::new(latency.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(total.clone()),
            Box::new(failures.clone()),
        ] {
            registry.register(collector).context(RegisterSnafu { component })?;
        }
        Ok(Self {
            latency,
            total,
            failures,
        })
    }

    pub fn observe(&self, method: &str, elapsed: std::time::Duration, failed: bool) {
        self.latency
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
        self.total.with_label_values(&[method]).inc();
        if failed {
            self.failures.with_label_values(&[method]).inc();
        }
    }
}

#[derive(Clone)]
pub struct HammertimeMetrics {
    /// 1 while hammertime holds a kluster's controller-manager at zero.
    pub active: IntGaugeVec,
}

impl HammertimeMetrics {
    pub fn register(registry: &Registry) -> Result<Self> {
        let active = IntGaugeVec::new(
            Opts::new(
                "kubernikus_hammertime_status",
                "Whether hammertime is engaged for a kluster",
            ),
            &["kluster"],
        )
        .context(RegisterSnafu {
            component: "hammertime",
        })?;
        registry.register(Box::new(active.clone())).context(RegisterSnafu {
            component: "hammertime",
        })?;
        Ok(Self { active })
    }
}

#[derive(Clone)]
pub struct PoolMetrics {
    pub running: IntGaugeVec,
    pub desired: IntGaugeVec,
}

impl PoolMetrics {
    pub fn register(registry: &Registry) -> Result<Self> {
        let labels = ["kluster", "node_pool"];
        let running = IntGaugeVec::new(
            Opts::new("kubernikus_node_pool_running", "Observed running nodes"),
            &labels,
        )
        .context(RegisterSnafu { component: "pool" })?;
        let desired = IntGaugeVec::new(
            Opts::new("kubernikus_node_pool_desired", "Declared pool size"),
            &labels,
        )
        .context(RegisterSnafu { component: "pool" })?;
        for collector in [
            Box::new(running.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(desired.clone()),
        ] {
            registry.register(collector).context(RegisterSnafu { component: "pool" })?;
        }
        Ok(Self { running, desired })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_against_a_fresh_registry() {
        let registry = Registry::new();
        let metrics = OperationMetrics::register("launch", &registry).expect("register launch");
        HammertimeMetrics::register(&registry).expect("register hammertime");
        PoolMetrics::register(&registry).expect("register pool");

        // Vec families only show up in gather() once a child exists.
        metrics.total.with_label_values(&["create_node"]).inc();
        let families = registry.gather();
        assert!(
            families
                .iter()
                .any(|f| f.name() == "kubernikus_launch_operations_total")
        );
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        OperationMetrics::register("launch", &registry).expect("first registration");
        assert!(OperationMetrics::register("launch", &registry).is_err());
    }
}

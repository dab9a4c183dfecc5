//! Prometheus metrics for the admission controller.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

const QUEUE_STATES: [&str; 3] = ["Pending", "Active", "Terminating"];

/// All exported series, registered up front.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pending_workloads: IntGaugeVec,
    admitted_active_workloads: IntGaugeVec,
    admitted_workloads_total: IntCounterVec,
    cluster_queue_status: IntGaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let pending_workloads = IntGaugeVec::new(
            Opts::new(
                "gatehouse_pending_workloads",
                "Number of pending workloads per cluster queue",
            ),
            &["cluster_queue", "status"],
        )?;
        let admitted_active_workloads = IntGaugeVec::new(
            Opts::new(
                "gatehouse_admitted_active_workloads",
                "Number of admitted, unfinished workloads per cluster queue",
            ),
            &["cluster_queue"],
        )?;
        let admitted_workloads_total = IntCounterVec::new(
            Opts::new(
                "gatehouse_admitted_workloads_total",
                "Total number of workload admissions per cluster queue",
            ),
            &["cluster_queue"],
        )?;
        let cluster_queue_status = IntGaugeVec::new(
            Opts::new(
                "gatehouse_cluster_queue_status",
                "Lifecycle state of each cluster queue (1 on the active label)",
            ),
            &["cluster_queue", "status"],
        )?;

        registry.register(Box::new(pending_workloads.clone()))?;
        registry.register(Box::new(admitted_active_workloads.clone()))?;
        registry.register(Box::new(admitted_workloads_total.clone()))?;
        registry.register(Box::new(cluster_queue_status.clone()))?;

        Ok(Self {
            registry,
            pending_workloads,
            admitted_active_workloads,
            admitted_workloads_total,
            cluster_queue_status,
        })
    }

    pub fn gather(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    pub fn set_pending_workloads(&self, cluster_queue: &str, active: usize, inadmissible: usize) {
        self.pending_workloads
            .with_label_values(&[cluster_queue, "active"])
            .set(active as i64);
        self.pending_workloads
            .with_label_values(&[cluster_queue, "inadmissible"])
            .set(inadmissible as i64);
    }

    pub fn set_admitted_active_workloads(&self, cluster_queue: &str, count: i64) {
        self.admitted_active_workloads
            .with_label_values(&[cluster_queue])
            .set(count);
    }

    pub fn inc_admitted_workloads(&self, cluster_queue: &str) {
        self.admitted_workloads_total
            .with_label_values(&[cluster_queue])
            .inc();
    }

    pub fn set_cluster_queue_status(&self, cluster_queue: &str, state: &str) {
        for candidate in QUEUE_STATES {
            self.cluster_queue_status
                .with_label_values(&[cluster_queue, candidate])
                .set(i64::from(candidate == state));
        }
    }

    /// Drop all series of a deleted cluster queue.
    pub fn clear_cluster_queue(&self, cluster_queue: &str) {
        for status in ["active", "inadmissible"] {
            let _ = self
                .pending_workloads
                .remove_label_values(&[cluster_queue, status]);
        }
        let _ = self
            .admitted_active_workloads
            .remove_label_values(&[cluster_queue]);
        for state in QUEUE_STATES {
            let _ = self
                .cluster_queue_status
                .remove_label_values(&[cluster_queue, state]);
        }
    }
}

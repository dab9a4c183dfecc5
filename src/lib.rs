//! Quota-based admission controller for batch workloads.
//!
//! Tenants submit Workloads to namespaced LocalQueues bound to cluster-scoped
//! ClusterQueues that own per-flavor resource quotas; ClusterQueues grouped
//! in a cohort share their unused min quota. The controller decides when each
//! Workload is admitted and which resource flavor serves each request, then
//! stamps an Admission onto the Workload for a downstream job runner.
//!
//! Architecture:
//! - `store`: object store port (list/get/update/watch) + in-memory impl
//! - `cache`: authoritative usage model, snapshot source for cycles
//! - `queue`: per-ClusterQueue priority heaps of pending Workloads
//! - `assigner`: flavor selection under affinity, taints and quota
//! - `scheduler`: single-threaded admission cycles
//! - `controller`: reconcilers wiring store events to the core

pub mod api;
pub mod assigner;
pub mod cache;
pub mod config;
pub mod controller;
pub mod metrics;
pub mod quantity;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use api::{Admission, ClusterQueue, LocalQueue, Namespace, ResourceFlavor, Workload};
pub use cache::{Cache, Snapshot};
pub use config::ControllerConfig;
pub use controller::Controller;
pub use metrics::MetricsRegistry;
pub use quantity::Quantity;
pub use queue::QueueManager;
pub use scheduler::Scheduler;
pub use store::{InMemoryStore, ObjectStore, StoreError};

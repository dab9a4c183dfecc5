//! Authoritative in-memory model of the quota world.
//!
//! The cache ingests all five kinds in whatever order they arrive from the
//! store and keeps a consistent projection: per-ClusterQueue flavor limits,
//! usage accounted from admitted Workloads, cohort membership, and the
//! active/pending state derived from referenced flavors. Scheduling cycles
//! never read the live maps; they take a [`Snapshot`] cloned under the lock.
//!
//! A single logical writer (the reconcilers) mutates the cache; mutations are
//! synchronous under one coarse mutex. References to missing objects are
//! never errors: the dependent object is simply held in a pending state until
//! the referent shows up.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use tracing::debug;

use crate::api::{
    ClusterQueue, LabelSelector, LocalQueue, Namespace, QueueingStrategy, ResourceFlavor,
    UsedQuota, Workload, MAX_FLAVORS_PER_RESOURCE, MAX_RESOURCES,
};
use crate::quantity::Quantity;

/// Usage keyed by resource name, then flavor name.
pub type FlavorUsage = BTreeMap<String, BTreeMap<String, Quantity>>;

/// Lifecycle state of a ClusterQueue as reported in status and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterQueueState {
    Active,
    Pending,
    Terminating,
}

impl ClusterQueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterQueueState::Active => "Active",
            ClusterQueueState::Pending => "Pending",
            ClusterQueueState::Terminating => "Terminating",
        }
    }
}

/// Quota bounds of one flavor entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlavorLimits {
    pub name: String,
    pub min: Quantity,
    pub max: Option<Quantity>,
}

/// One resource with its ordered flavor list.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub name: String,
    pub flavors: Vec<FlavorLimits>,
}

#[derive(Debug)]
struct CachedClusterQueue {
    name: String,
    cohort: Option<String>,
    strategy: QueueingStrategy,
    namespace_selector: Option<LabelSelector>,
    resources: Vec<ResourceLimits>,
    usage: FlavorUsage,
    admitted_workloads: BTreeSet<String>,
    terminating: bool,
    spec_error: Option<String>,
    active: bool,
}

/// Usage footprint of one admitted Workload.
#[derive(Debug, Clone)]
struct AdmittedWorkload {
    cluster_queue: String,
    usage: FlavorUsage,
}

#[derive(Default)]
struct CacheState {
    flavors: HashMap<String, ResourceFlavor>,
    cluster_queues: HashMap<String, CachedClusterQueue>,
    cohorts: HashMap<String, BTreeSet<String>>,
    local_queues: HashMap<String, String>,
    namespaces: HashMap<String, BTreeMap<String, String>>,
    workloads: HashMap<String, AdmittedWorkload>,
}

/// Status-facing view of a ClusterQueue, derived from the cached records.
#[derive(Debug, Clone)]
pub struct ClusterQueueStatusView {
    pub state: ClusterQueueState,
    pub reason: String,
    pub admitted_workloads: i32,
    pub used_resources: BTreeMap<String, BTreeMap<String, UsedQuota>>,
}

/// Immutable copy of the quota world for one scheduling cycle.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub cluster_queues: HashMap<String, SnapshotClusterQueue>,
    pub cohorts: HashMap<String, CohortSnapshot>,
    pub flavors: HashMap<String, ResourceFlavor>,
    pub namespaces: HashMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct SnapshotClusterQueue {
    pub name: String,
    pub cohort: Option<String>,
    pub strategy: QueueingStrategy,
    pub namespace_selector: Option<LabelSelector>,
    pub active: bool,
    pub resources: Vec<ResourceLimits>,
    pub usage: FlavorUsage,
}

impl SnapshotClusterQueue {
    pub fn limits_for(&self, resource: &str) -> Option<&ResourceLimits> {
        self.resources.iter().find(|r| r.name == resource)
    }

    pub fn flavor_usage(&self, resource: &str, flavor: &str) -> Quantity {
        self.usage
            .get(resource)
            .and_then(|m| m.get(flavor))
            .copied()
            .unwrap_or_default()
    }

    /// Min quota declared for `(resource, flavor)`, zero when absent.
    pub fn flavor_min(&self, resource: &str, flavor: &str) -> Quantity {
        self.limits_for(resource)
            .and_then(|r| r.flavors.iter().find(|f| f.name == flavor))
            .map(|f| f.min)
            .unwrap_or_default()
    }
}

/// Cohort-wide aggregates per (resource, flavor).
#[derive(Debug, Clone, Default)]
pub struct CohortSnapshot {
    pub members: BTreeSet<String>,
    pub requestable: BTreeMap<(String, String), Quantity>,
    pub usage: BTreeMap<(String, String), Quantity>,
}

impl CohortSnapshot {
    pub fn requestable_for(&self, resource: &str, flavor: &str) -> Quantity {
        self.requestable
            .get(&(resource.to_string(), flavor.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn usage_for(&self, resource: &str, flavor: &str) -> Quantity {
        self.usage
            .get(&(resource.to_string(), flavor.to_string()))
            .copied()
            .unwrap_or_default()
    }
}

impl Snapshot {
    /// Provisionally account an admission inside the cycle. The snapshot is
    /// discarded at cycle end, so this never leaks into the cache.
    pub fn add_usage(&mut self, cluster_queue: &str, usage: &FlavorUsage) {
        let cohort = match self.cluster_queues.get_mut(cluster_queue) {
            Some(cq) => {
                for (resource, flavors) in usage {
                    for (flavor, qty) in flavors {
                        let entry = cq
                            .usage
                            .entry(resource.clone())
                            .or_default()
                            .entry(flavor.clone())
                            .or_default();
                        *entry = entry.saturating_add(*qty);
                    }
                }
                cq.cohort.clone()
            }
            None => return,
        };
        if let Some(cohort) = cohort.and_then(|c| self.cohorts.get_mut(&c)) {
            for (resource, flavors) in usage {
                for (flavor, qty) in flavors {
                    let entry = cohort
                        .usage
                        .entry((resource.clone(), flavor.clone()))
                        .or_default();
                    *entry = entry.saturating_add(*qty);
                }
            }
        }
    }
}

/// The cache itself; see the module docs for the ownership model.
#[derive(Default)]
pub struct Cache {
    state: Mutex<CacheState>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- ClusterQueues -------------------------------------------------

    pub fn add_cluster_queue(&self, cq: &ClusterQueue) {
        let mut state = self.state.lock().unwrap();
        let cached = build_cluster_queue(cq);
        if let Some(previous) = state.cluster_queues.insert(cq.meta.name.clone(), cached) {
            detach_from_cohort(&mut state.cohorts, &previous.cohort, &cq.meta.name);
        }
        attach_to_cohort(&mut state.cohorts, &cq.spec.cohort, &cq.meta.name);
        rebuild_usage(&mut state, &cq.meta.name);
        recompute_active(&mut state, &cq.meta.name);
        debug!(name = %cq.meta.name, "cluster queue cached");
    }

    pub fn update_cluster_queue(&self, cq: &ClusterQueue) {
        // Same resolution path as an add: rebuild limits, re-home the cohort
        // membership, re-derive usage from the admitted records.
        self.add_cluster_queue(cq);
    }

    pub fn delete_cluster_queue(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(previous) = state.cluster_queues.remove(name) {
            detach_from_cohort(&mut state.cohorts, &previous.cohort, name);
        }
    }

    /// Mark a ClusterQueue as being deleted; it turns inactive so its pending
    /// Workloads freeze while the finalizer is held.
    pub fn set_cluster_queue_terminating(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(cq) = state.cluster_queues.get_mut(name) {
            cq.terminating = true;
        }
        recompute_active(&mut state, name);
    }

    // ---- Flavors -------------------------------------------------------

    pub fn add_flavor(&self, flavor: &ResourceFlavor) {
        let mut state = self.state.lock().unwrap();
        state
            .flavors
            .insert(flavor.meta.name.clone(), flavor.clone());
        let affected = queues_referencing_flavor(&state, &flavor.meta.name);
        for name in affected {
            recompute_active(&mut state, &name);
        }
    }

    pub fn delete_flavor(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.flavors.remove(name);
        let affected = queues_referencing_flavor(&state, name);
        for cq in affected {
            recompute_active(&mut state, &cq);
        }
    }

    // ---- LocalQueues and Namespaces ------------------------------------

    pub fn add_local_queue(&self, lq: &LocalQueue) {
        let mut state = self.state.lock().unwrap();
        state
            .local_queues
            .insert(lq.meta.key(), lq.cluster_queue.clone());
    }

    pub fn delete_local_queue(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.local_queues.remove(&format!("{namespace}/{name}"));
    }

    pub fn add_namespace(&self, namespace: &Namespace) {
        let mut state = self.state.lock().unwrap();
        state
            .namespaces
            .insert(namespace.meta.name.clone(), namespace.meta.labels.clone());
    }

    pub fn delete_namespace(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.namespaces.remove(name);
    }

    // ---- Workloads -----------------------------------------------------

    /// Ingest a Workload. Admitted, unfinished Workloads are accounted
    /// against their ClusterQueue; anything else releases prior usage.
    pub fn add_or_update_workload(&self, workload: &Workload) {
        let mut state = self.state.lock().unwrap();
        let key = workload.meta.key();
        remove_workload_usage(&mut state, &key);

        if !workload.is_admitted() || workload.is_finished() {
            return;
        }
        let record = match admitted_usage(workload) {
            Some(record) => record,
            None => return,
        };
        apply_workload_usage(&mut state, &key, &record);
        state.workloads.insert(key, record);
    }

    pub fn delete_workload(&self, workload: &Workload) {
        let mut state = self.state.lock().unwrap();
        remove_workload_usage(&mut state, &workload.meta.key());
    }

    // ---- Queries -------------------------------------------------------

    pub fn cluster_queue_state(&self, name: &str) -> Option<ClusterQueueState> {
        let state = self.state.lock().unwrap();
        state.cluster_queues.get(name).map(cluster_queue_state)
    }

    pub fn is_cluster_queue_active(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .cluster_queues
            .get(name)
            .map(|cq| cq.active)
            .unwrap_or(false)
    }

    /// ClusterQueue bound to a LocalQueue, if both sides are known.
    pub fn cluster_queue_for_local_queue(&self, namespace: &str, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .local_queues
            .get(&format!("{namespace}/{name}"))
            .cloned()
    }

    pub fn cohort_members(&self, cohort: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .cohorts
            .get(cohort)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn cohort_of(&self, cluster_queue: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .cluster_queues
            .get(cluster_queue)
            .and_then(|cq| cq.cohort.clone())
    }

    /// Whether any admitted Workload still counts against the ClusterQueue.
    pub fn cluster_queue_in_use(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .cluster_queues
            .get(name)
            .map(|cq| !cq.admitted_workloads.is_empty())
            .unwrap_or_else(|| state.workloads.values().any(|w| w.cluster_queue == name))
    }

    /// Whether any ClusterQueue resource entry references the flavor.
    pub fn flavor_in_use(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        !queues_referencing_flavor(&state, name).is_empty()
    }

    pub fn cluster_queues_referencing_flavor(&self, name: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        queues_referencing_flavor(&state, name)
    }

    /// Status material for the ClusterQueue reconciler.
    pub fn cluster_queue_status(&self, name: &str) -> Option<ClusterQueueStatusView> {
        let state = self.state.lock().unwrap();
        let cq = state.cluster_queues.get(name)?;

        let mut used = BTreeMap::new();
        for resource in &cq.resources {
            let flavors: BTreeMap<String, UsedQuota> = resource
                .flavors
                .iter()
                .map(|f| {
                    let total = cq
                        .usage
                        .get(&resource.name)
                        .and_then(|m| m.get(&f.name))
                        .copied()
                        .unwrap_or_default();
                    let quota = UsedQuota {
                        total,
                        borrowing: total.saturating_sub(f.min),
                    };
                    (f.name.clone(), quota)
                })
                .collect();
            used.insert(resource.name.clone(), flavors);
        }

        let lifecycle = cluster_queue_state(cq);
        let reason = match lifecycle {
            ClusterQueueState::Terminating => "Terminating".to_string(),
            ClusterQueueState::Active => "Ready".to_string(),
            ClusterQueueState::Pending => cq
                .spec_error
                .clone()
                .unwrap_or_else(|| missing_flavors_message(&state, cq)),
        };

        Some(ClusterQueueStatusView {
            state: lifecycle,
            reason,
            admitted_workloads: cq.admitted_workloads.len() as i32,
            used_resources: used,
        })
    }

    /// Clone the scheduling-relevant sub-graph. No reference to live state
    /// survives the lock.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().unwrap();
        let mut snapshot = Snapshot {
            flavors: state.flavors.clone(),
            namespaces: state.namespaces.clone(),
            ..Default::default()
        };

        for (name, cq) in &state.cluster_queues {
            snapshot.cluster_queues.insert(
                name.clone(),
                SnapshotClusterQueue {
                    name: cq.name.clone(),
                    cohort: cq.cohort.clone(),
                    strategy: cq.strategy,
                    namespace_selector: cq.namespace_selector.clone(),
                    active: cq.active,
                    resources: cq.resources.clone(),
                    usage: cq.usage.clone(),
                },
            );
        }

        for (cohort, members) in &state.cohorts {
            let mut aggregate = CohortSnapshot {
                members: members.clone(),
                ..Default::default()
            };
            for member in members {
                let Some(cq) = state.cluster_queues.get(member) else {
                    continue;
                };
                for resource in &cq.resources {
                    for flavor in &resource.flavors {
                        let key = (resource.name.clone(), flavor.name.clone());
                        let entry = aggregate.requestable.entry(key).or_default();
                        *entry = entry.saturating_add(flavor.min);
                    }
                }
                for (resource, flavors) in &cq.usage {
                    for (flavor, qty) in flavors {
                        let key = (resource.clone(), flavor.clone());
                        let entry = aggregate.usage.entry(key).or_default();
                        *entry = entry.saturating_add(*qty);
                    }
                }
            }
            snapshot.cohorts.insert(cohort.clone(), aggregate);
        }

        snapshot
    }
}

fn cluster_queue_state(cq: &CachedClusterQueue) -> ClusterQueueState {
    if cq.terminating {
        ClusterQueueState::Terminating
    } else if cq.active {
        ClusterQueueState::Active
    } else {
        ClusterQueueState::Pending
    }
}

fn missing_flavors_message(state: &CacheState, cq: &CachedClusterQueue) -> String {
    let missing: Vec<&str> = cq
        .resources
        .iter()
        .flat_map(|r| r.flavors.iter())
        .filter(|f| !state.flavors.contains_key(&f.name))
        .map(|f| f.name.as_str())
        .collect();
    format!("missing resource flavors: {}", missing.join(", "))
}

/// Validate a ClusterQueue spec; `Some(message)` marks the queue Pending.
fn validate_spec(cq: &ClusterQueue) -> Option<String> {
    if cq.spec.resources.len() > MAX_RESOURCES {
        return Some(format!(
            "too many resources: {} > {MAX_RESOURCES}",
            cq.spec.resources.len()
        ));
    }
    for resource in &cq.spec.resources {
        if resource.flavors.is_empty() {
            return Some(format!("resource {} has no flavors", resource.name));
        }
        if resource.flavors.len() > MAX_FLAVORS_PER_RESOURCE {
            return Some(format!(
                "resource {} has too many flavors: {} > {MAX_FLAVORS_PER_RESOURCE}",
                resource.name,
                resource.flavors.len()
            ));
        }
        for flavor in &resource.flavors {
            if let Some(max) = flavor.max {
                if max < flavor.min {
                    return Some(format!(
                        "flavor {} of resource {} has min > max",
                        flavor.name, resource.name
                    ));
                }
            }
        }
    }

    // Codependent resources share an identical ordered flavor list;
    // any other overlap between lists is a violation.
    for (i, a) in cq.spec.resources.iter().enumerate() {
        for b in cq.spec.resources.iter().skip(i + 1) {
            let names_a: Vec<&str> = a.flavors.iter().map(|f| f.name.as_str()).collect();
            let names_b: Vec<&str> = b.flavors.iter().map(|f| f.name.as_str()).collect();
            if names_a == names_b {
                continue;
            }
            if names_a.iter().any(|n| names_b.contains(n)) {
                return Some(format!(
                    "resources {} and {} overlap in flavors without being codependent",
                    a.name, b.name
                ));
            }
        }
    }
    None
}

fn build_cluster_queue(cq: &ClusterQueue) -> CachedClusterQueue {
    let resources = cq
        .spec
        .resources
        .iter()
        .map(|r| ResourceLimits {
            name: r.name.clone(),
            flavors: r
                .flavors
                .iter()
                .map(|f| FlavorLimits {
                    name: f.name.clone(),
                    min: f.min,
                    max: f.max,
                })
                .collect(),
        })
        .collect();

    CachedClusterQueue {
        name: cq.meta.name.clone(),
        cohort: cq.spec.cohort.clone(),
        strategy: cq.spec.queueing_strategy,
        namespace_selector: cq.spec.namespace_selector.clone(),
        resources,
        usage: FlavorUsage::new(),
        admitted_workloads: BTreeSet::new(),
        terminating: cq.meta.is_terminating(),
        spec_error: validate_spec(cq),
        active: false,
    }
}

fn attach_to_cohort(
    cohorts: &mut HashMap<String, BTreeSet<String>>,
    cohort: &Option<String>,
    member: &str,
) {
    if let Some(cohort) = cohort {
        cohorts
            .entry(cohort.clone())
            .or_default()
            .insert(member.to_string());
    }
}

fn detach_from_cohort(
    cohorts: &mut HashMap<String, BTreeSet<String>>,
    cohort: &Option<String>,
    member: &str,
) {
    if let Some(cohort) = cohort {
        if let Some(members) = cohorts.get_mut(cohort) {
            members.remove(member);
            if members.is_empty() {
                cohorts.remove(cohort);
            }
        }
    }
}

fn queues_referencing_flavor(state: &CacheState, flavor: &str) -> Vec<String> {
    state
        .cluster_queues
        .values()
        .filter(|cq| {
            cq.resources
                .iter()
                .any(|r| r.flavors.iter().any(|f| f.name == flavor))
        })
        .map(|cq| cq.name.clone())
        .collect()
}

/// A ClusterQueue is active iff its spec is sound, every referenced flavor
/// exists and it is not being deleted.
fn recompute_active(state: &mut CacheState, name: &str) {
    let active = match state.cluster_queues.get(name) {
        Some(cq) => {
            !cq.terminating
                && cq.spec_error.is_none()
                && cq
                    .resources
                    .iter()
                    .flat_map(|r| r.flavors.iter())
                    .all(|f| state.flavors.contains_key(&f.name))
        }
        None => return,
    };
    if let Some(cq) = state.cluster_queues.get_mut(name) {
        cq.active = active;
    }
}

/// Per-(resource, flavor) usage of an admitted Workload, or `None` when the
/// admission carries no flavor assignments at all.
fn admitted_usage(workload: &Workload) -> Option<AdmittedWorkload> {
    let admission = workload.spec.admission.as_ref()?;
    let mut usage = FlavorUsage::new();
    for ps in &workload.spec.pod_sets {
        for (resource, qty) in &ps.spec.requests {
            let Some(flavor) = admission.flavor_for(&ps.name, resource) else {
                continue;
            };
            let entry = usage
                .entry(resource.clone())
                .or_default()
                .entry(flavor.to_string())
                .or_default();
            *entry = entry.saturating_add(qty.scale(ps.count));
        }
    }
    Some(AdmittedWorkload {
        cluster_queue: admission.cluster_queue.clone(),
        usage,
    })
}

fn apply_workload_usage(state: &mut CacheState, key: &str, record: &AdmittedWorkload) {
    if let Some(cq) = state.cluster_queues.get_mut(&record.cluster_queue) {
        cq.admitted_workloads.insert(key.to_string());
        for (resource, flavors) in &record.usage {
            for (flavor, qty) in flavors {
                let entry = cq
                    .usage
                    .entry(resource.clone())
                    .or_default()
                    .entry(flavor.clone())
                    .or_default();
                *entry = entry.saturating_add(*qty);
            }
        }
    }
}

fn remove_workload_usage(state: &mut CacheState, key: &str) {
    let Some(record) = state.workloads.remove(key) else {
        return;
    };
    if let Some(cq) = state.cluster_queues.get_mut(&record.cluster_queue) {
        cq.admitted_workloads.remove(key);
        for (resource, flavors) in &record.usage {
            for (flavor, qty) in flavors {
                if let Some(entry) = cq.usage.get_mut(resource).and_then(|m| m.get_mut(flavor)) {
                    *entry = entry.saturating_sub(*qty);
                }
            }
        }
    }
}

/// Re-derive a ClusterQueue's usage and admitted set from the workload
/// records. Run after the queue's limits are (re)built.
fn rebuild_usage(state: &mut CacheState, name: &str) {
    let records: Vec<(String, AdmittedWorkload)> = state
        .workloads
        .iter()
        .filter(|(_, w)| w.cluster_queue == name)
        .map(|(k, w)| (k.clone(), w.clone()))
        .collect();
    {
        let Some(cq) = state.cluster_queues.get_mut(name) else {
            return;
        };
        cq.usage.clear();
        cq.admitted_workloads.clear();
    }
    for (key, record) in &records {
        apply_workload_usage(state, key, record);
    }
}

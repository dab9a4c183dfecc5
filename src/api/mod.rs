//! Persisted object kinds and shared scheduling types.
//!
//! Four kinds flow through the object store: `ClusterQueue` and
//! `ResourceFlavor` are cluster-scoped, `LocalQueue` and `Workload` are
//! namespaced. A minimal `Namespace` record carries the labels that
//! ClusterQueue namespace selectors are evaluated against.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quantity::Quantity;

/// Finalizer held on ClusterQueues and ResourceFlavors while referenced.
pub const RESOURCE_IN_USE_FINALIZER: &str = "resource-in-use";

/// Condition type set on a Workload when its admission is written.
pub const CONDITION_ADMITTED: &str = "Admitted";

/// Condition type set on a pending Workload whose ClusterQueue is inadmissible.
pub const CONDITION_FROZEN: &str = "Frozen";

/// Hard cap on resources per ClusterQueue and flavors per resource.
pub const MAX_RESOURCES: usize = 16;
pub const MAX_FLAVORS_PER_RESOURCE: usize = 16;

/// Common object metadata.
///
/// `namespace` is empty for cluster-scoped kinds. `resource_version` is
/// bumped by the store on every write and guards optimistic concurrency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: Uuid,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// `namespace/name` for namespaced objects, `name` otherwise.
    pub fn key(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

/// Taint effects, mirroring node taint semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A taint carried by a resource flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TolerationOperator {
    Equal,
    Exists,
}

/// A toleration declared on a workload pod spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    #[serde(default)]
    pub key: String,
    #[serde(default = "Toleration::default_operator")]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    fn default_operator() -> TolerationOperator {
        TolerationOperator::Equal
    }

    /// Whether this toleration covers the given taint.
    ///
    /// An empty key with `Exists` tolerates everything; an unset effect
    /// matches any effect.
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match self.operator {
            TolerationOperator::Exists => self.key.is_empty() || self.key == taint.key,
            TolerationOperator::Equal => self.key == taint.key && self.value == taint.value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            LabelSelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            LabelSelectorOperator::NotIn => !value.is_some_and(|v| self.values.contains(v)),
            LabelSelectorOperator::Exists => value.is_some(),
            LabelSelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// A label selector. The empty selector matches every label set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|e| e.matches(labels))
    }
}

/// A status condition with the usual transition bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(condition_type: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Find a condition by type in a condition list.
pub fn find_condition<'a>(conditions: &'a [Condition], kind: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == kind)
}

/// Insert or replace a condition, keeping the previous transition time when
/// the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status && existing.reason == condition.reason {
                return false;
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// A named hardware class: node labels plus the taints guarding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceFlavor {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub node_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

/// Queueing policy of a ClusterQueue. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueueingStrategy {
    #[serde(rename = "StrictFIFO")]
    StrictFifo,
    #[default]
    #[serde(rename = "BestEffortFIFO")]
    BestEffortFifo,
}

/// Quota bounds for one flavor of one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavorQuota {
    pub name: String,
    pub min: Quantity,
    #[serde(default)]
    pub max: Option<Quantity>,
}

/// An ordered flavor list for a single resource name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedResource {
    pub name: String,
    pub flavors: Vec<FlavorQuota>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterQueueSpec {
    #[serde(default)]
    pub cohort: Option<String>,
    #[serde(default)]
    pub queueing_strategy: QueueingStrategy,
    /// `None` matches no namespace; the empty selector matches all.
    #[serde(default)]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default)]
    pub resources: Vec<QueuedResource>,
}

/// Usage reported per (resource, flavor) in ClusterQueue status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedQuota {
    pub total: Quantity,
    pub borrowing: Quantity,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterQueueStatus {
    #[serde(default)]
    pub pending_workloads: i32,
    #[serde(default)]
    pub admitted_workloads: i32,
    #[serde(default)]
    pub used_resources: BTreeMap<String, BTreeMap<String, UsedQuota>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Cluster-scoped quota container with ordered flavor lists per resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterQueue {
    pub meta: ObjectMeta,
    pub spec: ClusterQueueSpec,
    #[serde(default)]
    pub status: ClusterQueueStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalQueueStatus {
    #[serde(default)]
    pub pending_workloads: i32,
    #[serde(default)]
    pub admitted_workloads: i32,
}

/// Namespaced submission surface pointing at one ClusterQueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalQueue {
    pub meta: ObjectMeta,
    pub cluster_queue: String,
    #[serde(default)]
    pub status: LocalQueueStatus,
}

/// Pod-level scheduling constraints carried by a pod set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub requests: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub affinity: Option<NodeAffinity>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeAffinity {
    #[serde(default)]
    pub required: Vec<NodeSelectorTerm>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSelectorTerm {
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl PodSpec {
    /// Labels the pod pins to a single value, through either the node
    /// selector or a required affinity `In` expression with one value.
    pub fn pinned_node_labels(&self) -> BTreeMap<String, String> {
        let mut pinned = self.node_selector.clone();
        if let Some(affinity) = &self.affinity {
            for term in &affinity.required {
                for expr in &term.match_expressions {
                    if expr.operator == LabelSelectorOperator::In && expr.values.len() == 1 {
                        pinned.insert(expr.key.clone(), expr.values[0].clone());
                    }
                }
            }
        }
        pinned
    }

    /// Whether every taint in the slice is covered by some toleration.
    /// `PreferNoSchedule` taints never block.
    pub fn tolerates_all(&self, taints: &[Taint]) -> bool {
        taints
            .iter()
            .filter(|t| t.effect != TaintEffect::PreferNoSchedule)
            .all(|t| self.tolerations.iter().any(|tol| tol.tolerates(t)))
    }
}

/// A homogeneous group of pods inside a Workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSet {
    pub name: String,
    pub count: u32,
    pub spec: PodSpec,
}

/// Chosen flavors for one pod set, keyed by resource name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSetFlavors {
    pub name: String,
    pub flavors: BTreeMap<String, String>,
}

/// The admission record stamped onto a Workload by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub cluster_queue: String,
    pub pod_set_flavors: Vec<PodSetFlavors>,
}

impl Admission {
    /// Flavor assigned to `resource` in pod set `pod_set`, if any.
    pub fn flavor_for(&self, pod_set: &str, resource: &str) -> Option<&str> {
        self.pod_set_flavors
            .iter()
            .find(|ps| ps.name == pod_set)
            .and_then(|ps| ps.flavors.get(resource))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Name of a LocalQueue in the Workload's namespace.
    pub queue_name: String,
    #[serde(default)]
    pub pod_sets: Vec<PodSet>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub admission: Option<Admission>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadStatus {
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// An abstract batch job with resource requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub meta: ObjectMeta,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl Workload {
    pub fn is_admitted(&self) -> bool {
        self.spec.admission.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.status.finished
    }

    /// Total request per resource across pod sets, scaled by pod count.
    pub fn total_requests(&self) -> BTreeMap<String, Quantity> {
        let mut totals: BTreeMap<String, Quantity> = BTreeMap::new();
        for ps in &self.spec.pod_sets {
            for (resource, qty) in &ps.spec.requests {
                let entry = totals.entry(resource.clone()).or_default();
                *entry = entry.saturating_add(qty.scale(ps.count));
            }
        }
        totals
    }
}

/// Minimal namespace record: the labels namespace selectors match against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub meta: ObjectMeta,
}

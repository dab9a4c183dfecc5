//! Shared fixtures for the end-to-end scenarios: object builders and a
//! harness running the full controller plus scheduler against the in-memory
//! store.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use gatehouse::api::{
    find_condition, Admission, ClusterQueue, ClusterQueueSpec, FlavorQuota, LabelSelector,
    LocalQueue, LocalQueueStatus, Namespace, NodeAffinity, ObjectMeta, PodSet, PodSpec,
    QueuedResource, QueueingStrategy, ResourceFlavor, Taint, TaintEffect, Toleration,
    TolerationOperator, Workload, WorkloadSpec, WorkloadStatus, CONDITION_FROZEN,
};
use gatehouse::{
    Cache, Controller, ControllerConfig, InMemoryStore, MetricsRegistry, ObjectStore,
    QueueManager, Scheduler,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(3);
pub const SETTLE: Duration = Duration::from_millis(300);

pub async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {what}");
}

pub async fn consistently<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + SETTLE;
    while tokio::time::Instant::now() < deadline {
        assert!(check().await, "condition violated: {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The whole control plane on an in-memory store.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub cache: Arc<Cache>,
    pub queues: Arc<QueueManager>,
    handles: Vec<JoinHandle<()>>,
}

impl Harness {
    pub async fn start() -> Self {
        let config = ControllerConfig {
            workload_workers: 1,
            wake_interval: Duration::from_millis(5),
            commit_deadline: Duration::from_secs(2),
        };
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(Cache::new());
        let queues = Arc::new(QueueManager::new());
        let metrics = MetricsRegistry::new().expect("metrics registry");

        let controller = Controller::new(
            store.clone(),
            cache.clone(),
            queues.clone(),
            metrics.clone(),
            config.clone(),
        );
        let mut handles = controller.start().await.expect("controller start");
        let scheduler = Scheduler::new(
            store.clone(),
            cache.clone(),
            queues.clone(),
            metrics,
            config,
        );
        handles.push(tokio::spawn(scheduler.run()));

        let harness = Self {
            store,
            cache,
            queues,
            handles,
        };
        harness.create_namespace("default", &[]);
        harness
    }

    pub fn create_namespace(&self, name: &str, labels: &[(&str, &str)]) {
        let ns = Namespace {
            meta: ObjectMeta {
                name: name.into(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            },
        };
        self.store.create_namespace(ns).expect("create namespace");
    }

    pub async fn admission_of(&self, namespace: &str, name: &str) -> Option<Admission> {
        self.store
            .get_workload(namespace, name)
            .await
            .ok()
            .and_then(|wl| wl.spec.admission)
    }

    pub async fn expect_admitted(&self, namespace: &str, name: &str) -> Admission {
        eventually(&format!("{namespace}/{name} admitted"), || async {
            self.admission_of(namespace, name).await.is_some()
        })
        .await;
        self.admission_of(namespace, name)
            .await
            .expect("admission present")
    }

    pub async fn expect_admitted_with_flavor(
        &self,
        namespace: &str,
        name: &str,
        resource: &str,
        flavor: &str,
    ) {
        let admission = self.expect_admitted(namespace, name).await;
        let got = admission.pod_set_flavors[0]
            .flavors
            .get(resource)
            .cloned()
            .unwrap_or_default();
        assert_eq!(
            got, flavor,
            "{namespace}/{name}: expected {resource} on flavor {flavor}, got {got}"
        );
    }

    pub async fn expect_pending(&self, namespace: &str, name: &str) {
        consistently(&format!("{namespace}/{name} stays pending"), || async {
            self.admission_of(namespace, name).await.is_none()
        })
        .await;
    }

    pub async fn expect_frozen(&self, namespace: &str, name: &str, frozen: bool) {
        eventually(
            &format!("{namespace}/{name} frozen={frozen}"),
            || async {
                match self.store.get_workload(namespace, name).await {
                    Ok(wl) => find_condition(&wl.status.conditions, CONDITION_FROZEN)
                        .map(|c| c.status == frozen)
                        .unwrap_or(false),
                    Err(_) => false,
                }
            },
        )
        .await;
    }

    /// Replace a namespace's labels, retrying around concurrent writes.
    pub async fn update_namespace(&self, name: &str, labels: &[(&str, &str)]) {
        for _ in 0..50 {
            let mut ns = self
                .store
                .get_namespace(name)
                .await
                .expect("namespace exists");
            ns.meta.labels = labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            match self.store.update_namespace(&ns).await {
                Ok(_) => return,
                Err(err) if err.is_conflict() => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(err) => panic!("update namespace: {err}"),
            }
        }
        panic!("could not update namespace {name}");
    }

    /// Mark a workload finished, retrying around concurrent status writes.
    pub async fn finish_workload(&self, namespace: &str, name: &str) {
        for _ in 0..50 {
            let mut workload = self
                .store
                .get_workload(namespace, name)
                .await
                .expect("workload exists");
            workload.status.finished = true;
            match self.store.update_workload(&workload).await {
                Ok(_) => return,
                Err(err) if err.is_conflict() => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(err) => panic!("finish workload: {err}"),
            }
        }
        panic!("could not finish {namespace}/{name}");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

// ---- Builders -----------------------------------------------------------

pub struct FlavorBuilder {
    flavor: ResourceFlavor,
}

impl FlavorBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            flavor: ResourceFlavor {
                meta: ObjectMeta {
                    name: name.into(),
                    ..Default::default()
                },
                node_labels: Default::default(),
                taints: vec![],
            },
        }
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.flavor
            .node_labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn taint(mut self, key: &str, value: &str) -> Self {
        self.flavor.taints.push(Taint {
            key: key.into(),
            value: value.into(),
            effect: TaintEffect::NoSchedule,
        });
        self
    }

    pub fn build(self) -> ResourceFlavor {
        self.flavor
    }
}

pub struct ClusterQueueBuilder {
    cq: ClusterQueue,
}

impl ClusterQueueBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            cq: ClusterQueue {
                meta: ObjectMeta {
                    name: name.into(),
                    ..Default::default()
                },
                spec: ClusterQueueSpec {
                    cohort: None,
                    queueing_strategy: QueueingStrategy::BestEffortFifo,
                    // Matches every namespace unless narrowed.
                    namespace_selector: Some(LabelSelector::default()),
                    resources: vec![],
                },
                status: Default::default(),
            },
        }
    }

    pub fn cohort(mut self, cohort: &str) -> Self {
        self.cq.spec.cohort = Some(cohort.into());
        self
    }

    pub fn strict(mut self) -> Self {
        self.cq.spec.queueing_strategy = QueueingStrategy::StrictFifo;
        self
    }

    pub fn selector_labels(mut self, labels: &[(&str, &str)]) -> Self {
        self.cq.spec.namespace_selector = Some(LabelSelector {
            match_labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            match_expressions: vec![],
        });
        self
    }

    /// `(flavor, min, max)` entries in declared order.
    pub fn resource(mut self, name: &str, flavors: &[(&str, &str, Option<&str>)]) -> Self {
        self.cq.spec.resources.push(QueuedResource {
            name: name.into(),
            flavors: flavors
                .iter()
                .map(|(flavor, min, max)| FlavorQuota {
                    name: flavor.to_string(),
                    min: min.parse().expect("min quantity"),
                    max: max.map(|m| m.parse().expect("max quantity")),
                })
                .collect(),
        });
        self
    }

    pub fn build(self) -> ClusterQueue {
        self.cq
    }
}

pub fn local_queue(namespace: &str, name: &str, cluster_queue: &str) -> LocalQueue {
    LocalQueue {
        meta: ObjectMeta {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        },
        cluster_queue: cluster_queue.into(),
        status: LocalQueueStatus::default(),
    }
}

pub struct WorkloadBuilder {
    workload: Workload,
}

impl WorkloadBuilder {
    pub fn new(namespace: &str, name: &str, queue: &str) -> Self {
        Self {
            workload: Workload {
                meta: ObjectMeta {
                    name: name.into(),
                    namespace: namespace.into(),
                    ..Default::default()
                },
                spec: WorkloadSpec {
                    queue_name: queue.into(),
                    pod_sets: vec![PodSet {
                        name: "main".into(),
                        count: 1,
                        spec: PodSpec::default(),
                    }],
                    priority: 0,
                    admission: None,
                },
                status: WorkloadStatus::default(),
            },
        }
    }

    pub fn request(mut self, resource: &str, quantity: &str) -> Self {
        self.workload.spec.pod_sets[0]
            .spec
            .requests
            .insert(resource.into(), quantity.parse().expect("quantity"));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.workload.spec.priority = priority;
        self
    }

    pub fn toleration(mut self, key: &str, value: &str) -> Self {
        self.workload.spec.pod_sets[0].spec.tolerations.push(Toleration {
            key: key.into(),
            operator: TolerationOperator::Equal,
            value: value.into(),
            effect: Some(TaintEffect::NoSchedule),
        });
        self
    }

    pub fn node_selector(mut self, key: &str, value: &str) -> Self {
        self.workload.spec.pod_sets[0]
            .spec
            .node_selector
            .insert(key.into(), value.into());
        self
    }

    pub fn affinity_in(mut self, key: &str, values: &[&str]) -> Self {
        let affinity = self.workload.spec.pod_sets[0]
            .spec
            .affinity
            .get_or_insert_with(NodeAffinity::default);
        affinity.required.push(gatehouse::api::NodeSelectorTerm {
            match_expressions: vec![gatehouse::api::LabelSelectorRequirement {
                key: key.into(),
                operator: gatehouse::api::LabelSelectorOperator::In,
                values: values.iter().map(|v| v.to_string()).collect(),
            }],
        });
        self
    }

    pub fn pod_set(mut self, name: &str, count: u32, requests: &[(&str, &str)]) -> Self {
        self.workload.spec.pod_sets.push(PodSet {
            name: name.into(),
            count,
            spec: PodSpec {
                requests: requests
                    .iter()
                    .map(|(r, q)| (r.to_string(), q.parse().expect("quantity")))
                    .collect(),
                ..Default::default()
            },
        });
        self
    }

    pub fn build(self) -> Workload {
        self.workload
    }
}

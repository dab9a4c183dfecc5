//! Reconcilers: the glue between the object store and the core.
//!
//! A single router task consumes the store's watch stream and applies every
//! event to the cache and queue manager, so the cache has one logical writer.
//! Side effects that write back through the store (status counters,
//! finalizers, conditions) run on per-kind workqueues with key deduplication;
//! workloads can fan out over several workers, sharded by key so per-key
//! reconciliation stays serialized.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{
    find_condition, set_condition, ClusterQueue, Condition, LocalQueue, Namespace, ResourceFlavor,
    Workload, CONDITION_FROZEN, RESOURCE_IN_USE_FINALIZER,
};
use crate::cache::{Cache, ClusterQueueState};
use crate::config::ControllerConfig;
use crate::metrics::MetricsRegistry;
use crate::queue::QueueManager;
use crate::store::{EventType, ObjectStore, StoreError, StoreEvent, StoreObject};

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Condition type on a ClusterQueue reporting its lifecycle.
const CONDITION_ACTIVE: &str = "Active";

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Dedup work queue: a key is enqueued at most once until a worker picks it
/// up; enqueueing while the key is being processed queues it again.
struct WorkQueue {
    tx: mpsc::UnboundedSender<String>,
    queued: Mutex<HashSet<String>>,
}

impl WorkQueue {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                queued: Mutex::new(HashSet::new()),
            }),
            rx,
        )
    }

    fn enqueue(&self, key: &str) {
        let mut queued = self.queued.lock().unwrap();
        if queued.insert(key.to_string()) {
            let _ = self.tx.send(key.to_string());
        }
    }

    fn acknowledge(&self, key: &str) {
        self.queued.lock().unwrap().remove(key);
    }
}

struct ReconcileQueues {
    cluster_queues: Arc<WorkQueue>,
    local_queues: Arc<WorkQueue>,
    flavors: Arc<WorkQueue>,
    workloads: Vec<Arc<WorkQueue>>,
}

impl ReconcileQueues {
    fn enqueue_workload(&self, key: &str) {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = (hasher.finish() as usize) % self.workloads.len();
        self.workloads[shard].enqueue(key);
    }
}

/// Owner of the router and reconcile workers.
pub struct Controller {
    store: Arc<dyn ObjectStore>,
    cache: Arc<Cache>,
    queues: Arc<QueueManager>,
    metrics: MetricsRegistry,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: Arc<Cache>,
        queues: Arc<QueueManager>,
        metrics: MetricsRegistry,
        config: ControllerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache,
            queues,
            metrics,
            config,
        })
    }

    /// Subscribe to the store, replay the existing objects, then spawn the
    /// router and per-kind workers. A store that cannot be listed at start
    /// is fatal.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, ControllerError> {
        let mut events = self.store.watch();

        let workers = self.config.workload_workers.max(1);
        let (cq_queue, cq_rx) = WorkQueue::new();
        let (lq_queue, lq_rx) = WorkQueue::new();
        let (flavor_queue, flavor_rx) = WorkQueue::new();
        let mut workload_queues = Vec::with_capacity(workers);
        let mut workload_rxs = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (queue, rx) = WorkQueue::new();
            workload_queues.push(queue);
            workload_rxs.push(rx);
        }
        let queues = Arc::new(ReconcileQueues {
            cluster_queues: cq_queue,
            local_queues: lq_queue,
            flavors: flavor_queue,
            workloads: workload_queues,
        });

        self.initial_sync(&queues).await?;

        let mut handles = Vec::new();

        // Router: the cache's single writer.
        {
            let controller = self.clone();
            let queues = queues.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => controller.handle_event(&queues, event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            info!("event stream closed, router stopping");
                            return;
                        }
                    }
                }
            }));
        }

        handles.push(self.spawn_worker(cq_rx, queues.clone(), ReconcileKind::ClusterQueue));
        handles.push(self.spawn_worker(lq_rx, queues.clone(), ReconcileKind::LocalQueue));
        handles.push(self.spawn_worker(flavor_rx, queues.clone(), ReconcileKind::Flavor));
        for rx in workload_rxs {
            handles.push(self.spawn_worker(rx, queues.clone(), ReconcileKind::Workload));
        }

        info!(workload_workers = workers, "controllers started");
        Ok(handles)
    }

    /// Feed every object already in the store through the event path, in
    /// referent-first order so fewer passes are needed to settle.
    async fn initial_sync(self: &Arc<Self>, queues: &ReconcileQueues) -> Result<(), ControllerError> {
        for namespace in self.store.list_namespaces().await? {
            self.apply(queues, EventType::Added, StoreObject::Namespace(namespace));
        }
        for flavor in self.store.list_resource_flavors().await? {
            self.apply(queues, EventType::Added, StoreObject::ResourceFlavor(flavor));
        }
        for cq in self.store.list_cluster_queues().await? {
            self.apply(queues, EventType::Added, StoreObject::ClusterQueue(cq));
        }
        for lq in self.store.list_local_queues().await? {
            self.apply(queues, EventType::Added, StoreObject::LocalQueue(lq));
        }
        for workload in self.store.list_workloads().await? {
            self.apply(queues, EventType::Added, StoreObject::Workload(workload));
        }
        Ok(())
    }

    fn spawn_worker(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<String>,
        queues: Arc<ReconcileQueues>,
        kind: ReconcileKind,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            while let Some(key) = rx.recv().await {
                kind.queue(&queues, &key).acknowledge(&key);
                let result = match kind {
                    ReconcileKind::ClusterQueue => {
                        controller.reconcile_cluster_queue(&queues, &key).await
                    }
                    ReconcileKind::LocalQueue => controller.reconcile_local_queue(&key).await,
                    ReconcileKind::Flavor => controller.reconcile_flavor(&key).await,
                    ReconcileKind::Workload => controller.reconcile_workload(&key).await,
                };
                match result {
                    Ok(()) => {}
                    Err(ControllerError::Store(err)) if err.is_conflict() => {
                        // Re-read and retry right away.
                        debug!(%key, "reconcile conflicted, retrying");
                        kind.queue(&queues, &key).enqueue(&key);
                    }
                    Err(err) => {
                        warn!(%key, %err, "reconcile failed, backing off");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        kind.queue(&queues, &key).enqueue(&key);
                    }
                }
            }
        })
    }

    fn handle_event(self: &Arc<Self>, queues: &ReconcileQueues, event: StoreEvent) {
        self.apply(queues, event.event_type, event.object);
        // Any state change can unblock an admission.
        self.queues.notify();
    }

    fn apply(self: &Arc<Self>, queues: &ReconcileQueues, event_type: EventType, object: StoreObject) {
        match object {
            StoreObject::Namespace(namespace) => self.apply_namespace(event_type, namespace),
            StoreObject::ResourceFlavor(flavor) => self.apply_flavor(queues, event_type, flavor),
            StoreObject::ClusterQueue(cq) => self.apply_cluster_queue(queues, event_type, cq),
            StoreObject::LocalQueue(lq) => self.apply_local_queue(queues, event_type, lq),
            StoreObject::Workload(workload) => self.apply_workload(queues, event_type, workload),
        }
    }

    fn apply_namespace(&self, event_type: EventType, namespace: Namespace) {
        match event_type {
            EventType::Added | EventType::Modified => {
                self.cache.add_namespace(&namespace);
                // Labels may newly match a queue's selector; let parked
                // workloads in every matching queue try again.
                let snapshot = self.cache.snapshot();
                for (name, cq) in &snapshot.cluster_queues {
                    let matches = cq
                        .namespace_selector
                        .as_ref()
                        .is_some_and(|s| s.matches(&namespace.meta.labels));
                    if matches {
                        self.queues.requeue_all(name);
                    }
                }
            }
            EventType::Deleted => self.cache.delete_namespace(&namespace.meta.name),
        }
    }

    fn apply_flavor(
        self: &Arc<Self>,
        queues: &ReconcileQueues,
        event_type: EventType,
        flavor: ResourceFlavor,
    ) {
        let name = flavor.meta.name.clone();
        match event_type {
            EventType::Added | EventType::Modified => self.cache.add_flavor(&flavor),
            EventType::Deleted => self.cache.delete_flavor(&name),
        }
        // Referencing queues flip between Active and Pending.
        for cq in self.cache.cluster_queues_referencing_flavor(&name) {
            self.queues.requeue_all(&cq);
            queues.cluster_queues.enqueue(&cq);
        }
        queues.flavors.enqueue(&name);
    }

    fn apply_cluster_queue(
        self: &Arc<Self>,
        queues: &ReconcileQueues,
        event_type: EventType,
        cq: ClusterQueue,
    ) {
        let name = cq.meta.name.clone();
        let cohort = cq.spec.cohort.clone();
        match event_type {
            EventType::Added | EventType::Modified => {
                self.cache.update_cluster_queue(&cq);
                self.queues
                    .add_cluster_queue(&name, cq.spec.queueing_strategy);
                self.queues.requeue_all(&name);
                queues.cluster_queues.enqueue(&name);
            }
            EventType::Deleted => {
                self.cache.delete_cluster_queue(&name);
                self.queues.delete_cluster_queue(&name);
                self.metrics.clear_cluster_queue(&name);
            }
        }
        // Referenced flavors may gain or lose their last reference.
        for resource in &cq.spec.resources {
            for flavor in &resource.flavors {
                queues.flavors.enqueue(&flavor.name);
            }
        }
        // A spec change anywhere in the cohort can free borrowed quota.
        if let Some(cohort) = cohort {
            for sibling in self.cache.cohort_members(&cohort) {
                if sibling != name {
                    self.queues.requeue_all(&sibling);
                }
            }
        }
    }

    fn apply_local_queue(
        self: &Arc<Self>,
        queues: &ReconcileQueues,
        event_type: EventType,
        lq: LocalQueue,
    ) {
        match event_type {
            EventType::Added | EventType::Modified => {
                self.cache.add_local_queue(&lq);
                self.queues.add_local_queue(&lq);
                queues.local_queues.enqueue(&lq.meta.key());
                // Workloads that arrived before the queue can now be routed.
                self.route_workloads_of_local_queue(&lq);
            }
            EventType::Deleted => {
                self.cache.delete_local_queue(&lq.meta.namespace, &lq.meta.name);
                self.queues
                    .delete_local_queue(&lq.meta.namespace, &lq.meta.name);
            }
        }
    }

    fn apply_workload(
        self: &Arc<Self>,
        queues: &ReconcileQueues,
        event_type: EventType,
        workload: Workload,
    ) {
        let key = workload.meta.key();
        let admitted_to = workload
            .spec
            .admission
            .as_ref()
            .map(|a| a.cluster_queue.clone());

        match event_type {
            EventType::Added | EventType::Modified => {
                self.cache.add_or_update_workload(&workload);
                if workload.is_admitted() || workload.is_finished() {
                    self.queues
                        .delete(&workload.meta.namespace, &workload.meta.name);
                } else if let Err(err) = self.queues.push(&workload) {
                    // Retried when the missing queue shows up.
                    debug!(workload = %key, %err, "workload not yet routable");
                }
                if workload.is_finished() {
                    self.release_quota_of(admitted_to.as_deref());
                }
                queues.enqueue_workload(&key);
            }
            EventType::Deleted => {
                self.cache.delete_workload(&workload);
                self.queues
                    .delete(&workload.meta.namespace, &workload.meta.name);
                if admitted_to.is_some() {
                    self.release_quota_of(admitted_to.as_deref());
                }
            }
        }

        queues
            .local_queues
            .enqueue(&format!("{}/{}", workload.meta.namespace, workload.spec.queue_name));
        if let Some(cq) = admitted_to.or_else(|| {
            self.cache
                .cluster_queue_for_local_queue(&workload.meta.namespace, &workload.spec.queue_name)
        }) {
            queues.cluster_queues.enqueue(&cq);
        }
    }

    /// Freed quota re-opens admission for the queue and its whole cohort.
    fn release_quota_of(&self, cluster_queue: Option<&str>) {
        let Some(cluster_queue) = cluster_queue else {
            return;
        };
        self.queues.requeue_all(cluster_queue);
        if let Some(cohort) = self.cache.cohort_of(cluster_queue) {
            for sibling in self.cache.cohort_members(&cohort) {
                self.queues.requeue_all(&sibling);
            }
        }
        self.queues.notify();
    }

    fn route_workloads_of_local_queue(&self, lq: &LocalQueue) {
        let store = self.store.clone();
        let namespace = lq.meta.namespace.clone();
        let queue_name = lq.meta.name.clone();
        let qm = self.queues.clone();
        tokio::spawn(async move {
            let Ok(workloads) = store.list_workloads().await else {
                return;
            };
            for workload in workloads {
                if workload.meta.namespace == namespace
                    && workload.spec.queue_name == queue_name
                    && !workload.is_admitted()
                    && !workload.is_finished()
                {
                    if let Err(err) = qm.push(&workload) {
                        debug!(workload = %workload.meta.key(), %err, "workload still not routable");
                    }
                }
            }
            qm.notify();
        });
    }

    // ---- Reconcilers ---------------------------------------------------

    /// ClusterQueue: finalizer lifecycle, status counters, Active condition,
    /// and freeze/unfreeze propagation to its workloads.
    async fn reconcile_cluster_queue(
        &self,
        queues: &ReconcileQueues,
        name: &str,
    ) -> Result<(), ControllerError> {
        let mut cq = match self.store.get_cluster_queue(name).await {
            Ok(cq) => cq,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if cq.meta.is_terminating() {
            self.cache.set_cluster_queue_terminating(name);
            if !self.cache.cluster_queue_in_use(name)
                && cq.meta.has_finalizer(RESOURCE_IN_USE_FINALIZER)
            {
                cq.meta.finalizers.retain(|f| f != RESOURCE_IN_USE_FINALIZER);
                self.store.update_cluster_queue(&cq).await?;
                info!(cluster_queue = name, "finalizer released");
                return Ok(());
            }
        } else if !cq.meta.has_finalizer(RESOURCE_IN_USE_FINALIZER) {
            cq.meta
                .finalizers
                .push(RESOURCE_IN_USE_FINALIZER.to_string());
            cq = self.store.update_cluster_queue(&cq).await?;
        }

        let Some(view) = self.cache.cluster_queue_status(name) else {
            return Ok(());
        };
        let (pending_active, pending_inadmissible) = self.queues.pending_counts(name);

        self.metrics.set_cluster_queue_status(name, view.state.as_str());
        self.metrics
            .set_pending_workloads(name, pending_active, pending_inadmissible);
        self.metrics
            .set_admitted_active_workloads(name, view.admitted_workloads as i64);

        let mut status = cq.status.clone();
        status.pending_workloads = (pending_active + pending_inadmissible) as i32;
        status.admitted_workloads = view.admitted_workloads;
        status.used_resources = view.used_resources.clone();
        let transitioned = set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_ACTIVE,
                view.state == ClusterQueueState::Active,
                view.state.as_str(),
                &view.reason,
            ),
        );

        let changed = transitioned
            || status.pending_workloads != cq.status.pending_workloads
            || status.admitted_workloads != cq.status.admitted_workloads
            || status.used_resources != cq.status.used_resources;
        if changed {
            cq.status = status;
            self.store.update_cluster_queue(&cq).await?;
        }

        if transitioned {
            // Workload Frozen conditions follow the queue state.
            self.enqueue_workloads_of_cluster_queue(queues, name).await?;
            self.queues.requeue_all(name);
            self.queues.notify();
        }
        Ok(())
    }

    async fn enqueue_workloads_of_cluster_queue(
        &self,
        queues: &ReconcileQueues,
        name: &str,
    ) -> Result<(), ControllerError> {
        let local_queues: Vec<LocalQueue> = self
            .store
            .list_local_queues()
            .await?
            .into_iter()
            .filter(|lq| lq.cluster_queue == name)
            .collect();
        if local_queues.is_empty() {
            return Ok(());
        }
        for workload in self.store.list_workloads().await? {
            let routed = local_queues.iter().any(|lq| {
                lq.meta.namespace == workload.meta.namespace
                    && lq.meta.name == workload.spec.queue_name
            });
            if routed {
                queues.enqueue_workload(&workload.meta.key());
            }
        }
        Ok(())
    }

    /// LocalQueue: aggregate pending/admitted counters from its workloads.
    async fn reconcile_local_queue(&self, key: &str) -> Result<(), ControllerError> {
        let (namespace, name) = match key.split_once('/') {
            Some(parts) => parts,
            None => return Ok(()),
        };
        let mut lq = match self.store.get_local_queue(namespace, name).await {
            Ok(lq) => lq,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut pending = 0;
        let mut admitted = 0;
        for workload in self.store.list_workloads().await? {
            if workload.meta.namespace != namespace || workload.spec.queue_name != name {
                continue;
            }
            if workload.is_finished() {
                continue;
            }
            if workload.is_admitted() {
                admitted += 1;
            } else {
                pending += 1;
            }
        }

        if lq.status.pending_workloads != pending || lq.status.admitted_workloads != admitted {
            lq.status.pending_workloads = pending;
            lq.status.admitted_workloads = admitted;
            self.store.update_local_queue(&lq).await?;
        }
        Ok(())
    }

    /// ResourceFlavor: finalizer lifecycle only.
    async fn reconcile_flavor(&self, name: &str) -> Result<(), ControllerError> {
        let mut flavor = match self.store.get_resource_flavor(name).await {
            Ok(flavor) => flavor,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if flavor.meta.is_terminating() {
            if !self.cache.flavor_in_use(name)
                && flavor.meta.has_finalizer(RESOURCE_IN_USE_FINALIZER)
            {
                flavor
                    .meta
                    .finalizers
                    .retain(|f| f != RESOURCE_IN_USE_FINALIZER);
                self.store.update_resource_flavor(&flavor).await?;
                info!(flavor = name, "finalizer released");
            }
        } else if !flavor.meta.has_finalizer(RESOURCE_IN_USE_FINALIZER) {
            flavor
                .meta
                .finalizers
                .push(RESOURCE_IN_USE_FINALIZER.to_string());
            self.store.update_resource_flavor(&flavor).await?;
        }
        Ok(())
    }

    /// Workload: keep the Frozen condition in line with the owning queue.
    async fn reconcile_workload(&self, key: &str) -> Result<(), ControllerError> {
        let (namespace, name) = match key.split_once('/') {
            Some(parts) => parts,
            None => return Ok(()),
        };
        let mut workload = match self.store.get_workload(namespace, name).await {
            Ok(workload) => workload,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let frozen = if workload.is_admitted() || workload.is_finished() {
            false
        } else {
            // A pending workload may have arrived before its queues; route it
            // now that the chain may be complete.
            match self.queues.push(&workload) {
                Ok(()) => self.queues.notify(),
                Err(err) => debug!(workload = %key, %err, "workload not yet routable"),
            }
            match self
                .cache
                .cluster_queue_for_local_queue(namespace, &workload.spec.queue_name)
            {
                Some(cq) => !self.cache.is_cluster_queue_active(&cq),
                // Unknown routing is plain pending, not frozen.
                None => false,
            }
        };

        let currently_frozen =
            find_condition(&workload.status.conditions, CONDITION_FROZEN)
                .map(|c| c.status)
                .unwrap_or(false);
        if frozen == currently_frozen {
            return Ok(());
        }

        let condition = if frozen {
            Condition::new(
                CONDITION_FROZEN,
                true,
                "Inactive",
                "cluster queue is not active",
            )
        } else {
            Condition::new(CONDITION_FROZEN, false, "QueueActive", "")
        };
        if set_condition(&mut workload.status.conditions, condition) {
            self.store.update_workload(&workload).await?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum ReconcileKind {
    ClusterQueue,
    LocalQueue,
    Flavor,
    Workload,
}

impl ReconcileKind {
    fn queue<'a>(&self, queues: &'a ReconcileQueues, key: &str) -> &'a WorkQueue {
        match self {
            ReconcileKind::ClusterQueue => &queues.cluster_queues,
            ReconcileKind::LocalQueue => &queues.local_queues,
            ReconcileKind::Flavor => &queues.flavors,
            ReconcileKind::Workload => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                &queues.workloads[(hasher.finish() as usize) % queues.workloads.len()]
            }
        }
    }
}

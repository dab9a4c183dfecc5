//! Queue manager: pending Workloads per ClusterQueue.
//!
//! Each registered ClusterQueue owns a priority heap ordered by
//! `(priority desc, creation time asc, uid asc)` plus a parking area for
//! workloads found inadmissible in a scheduling cycle. The scheduler drains
//! heads with [`QueueManager::heads`], which waits until at least one pending
//! workload exists or the manager is signaled.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::api::{LocalQueue, QueueingStrategy, Workload};

/// Errors routing a workload into a queue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("local queue {queue} is not known in namespace {namespace}")]
    UnknownLocalQueue { namespace: String, queue: String },

    #[error("cluster queue {0} is not known")]
    UnknownClusterQueue(String),
}

/// A pending workload with its ordering key and a copy of the object as it
/// looked when enqueued.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub key: String,
    pub cluster_queue: String,
    pub priority: i32,
    pub created: DateTime<Utc>,
    pub uid: Uuid,
    pub workload: Workload,
}

impl QueueEntry {
    fn new(workload: &Workload, cluster_queue: &str) -> Self {
        Self {
            key: workload.meta.key(),
            cluster_queue: cluster_queue.to_string(),
            priority: workload.spec.priority,
            created: workload.meta.creation_timestamp,
            uid: workload.meta.uid,
            workload: workload.clone(),
        }
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.created == other.created && self.uid == other.uid
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then older, then smaller uid.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created.cmp(&self.created))
            .then_with(|| other.uid.cmp(&self.uid))
    }
}

struct QueuedClusterQueue {
    strategy: QueueingStrategy,
    heap: BinaryHeap<QueueEntry>,
    inadmissible: HashMap<String, QueueEntry>,
}

impl QueuedClusterQueue {
    fn new(strategy: QueueingStrategy) -> Self {
        Self {
            strategy,
            heap: BinaryHeap::new(),
            inadmissible: HashMap::new(),
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.inadmissible.remove(key).is_some() {
            return true;
        }
        if self.heap.iter().any(|e| e.key == key) {
            // BinaryHeap has no keyed removal; rebuild without the entry.
            let entries: Vec<QueueEntry> =
                self.heap.drain().filter(|e| e.key != key).collect();
            self.heap.extend(entries);
            return true;
        }
        false
    }

    fn pending(&self) -> (usize, usize) {
        (self.heap.len(), self.inadmissible.len())
    }
}

#[derive(Default)]
struct Inner {
    cluster_queues: HashMap<String, QueuedClusterQueue>,
    local_queues: HashMap<String, String>,
}

/// Process-wide pending-workload index. Single writer (the reconcilers),
/// single reader (the scheduler loop).
#[derive(Default)]
pub struct QueueManager {
    inner: Mutex<Inner>,
    added: Notify,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake a pending [`heads`](Self::heads) call without adding work.
    pub fn notify(&self) {
        self.added.notify_one();
    }

    /// Wait until workloads were pushed or [`notify`](Self::notify) ran.
    pub async fn wait_added(&self) {
        self.added.notified().await;
    }

    pub fn add_cluster_queue(&self, name: &str, strategy: QueueingStrategy) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .cluster_queues
            .entry(name.to_string())
            .or_insert_with(|| QueuedClusterQueue::new(strategy));
    }

    pub fn delete_cluster_queue(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.cluster_queues.remove(name);
    }

    pub fn add_local_queue(&self, lq: &LocalQueue) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .local_queues
            .insert(lq.meta.key(), lq.cluster_queue.clone());
    }

    /// Drop a LocalQueue and all pending workloads submitted through it.
    pub fn delete_local_queue(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.local_queues.remove(&format!("{namespace}/{name}"));
        for cq in inner.cluster_queues.values_mut() {
            let entries: Vec<QueueEntry> = cq
                .heap
                .drain()
                .filter(|e| {
                    e.workload.meta.namespace != namespace
                        || e.workload.spec.queue_name != name
                })
                .collect();
            cq.heap.extend(entries);
            cq.inadmissible.retain(|_, e| {
                e.workload.meta.namespace != namespace || e.workload.spec.queue_name != name
            });
        }
    }

    /// Route a pending workload into its ClusterQueue heap.
    pub fn push(&self, workload: &Workload) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let lq_key = format!(
            "{}/{}",
            workload.meta.namespace, workload.spec.queue_name
        );
        let cq_name = inner.local_queues.get(&lq_key).cloned().ok_or_else(|| {
            QueueError::UnknownLocalQueue {
                namespace: workload.meta.namespace.clone(),
                queue: workload.spec.queue_name.clone(),
            }
        })?;

        let key = workload.meta.key();
        // Re-keyed pushes replace any previous entry.
        for cq in inner.cluster_queues.values_mut() {
            cq.remove(&key);
        }
        let cq = inner
            .cluster_queues
            .get_mut(&cq_name)
            .ok_or_else(|| QueueError::UnknownClusterQueue(cq_name.clone()))?;
        cq.heap.push(QueueEntry::new(workload, &cq_name));
        debug!(workload = %key, cluster_queue = %cq_name, "workload enqueued");
        drop(inner);
        self.added.notify_one();
        Ok(())
    }

    /// Re-position a workload after a spec change (e.g. priority update).
    /// Inadmissible entries move back to the active heap since the update
    /// may have made them admissible.
    pub fn update(&self, workload: &Workload) -> Result<(), QueueError> {
        self.push(workload)
    }

    pub fn delete(&self, namespace: &str, name: &str) {
        let key = if namespace.is_empty() {
            name.to_string()
        } else {
            format!("{namespace}/{name}")
        };
        let mut inner = self.inner.lock().unwrap();
        for cq in inner.cluster_queues.values_mut() {
            if cq.remove(&key) {
                break;
            }
        }
    }

    /// Move every parked workload of the ClusterQueue back to the heap.
    pub fn requeue_all(&self, cluster_queue: &str) {
        let mut inner = self.inner.lock().unwrap();
        let mut moved = 0usize;
        if let Some(cq) = inner.cluster_queues.get_mut(cluster_queue) {
            for (_, entry) in cq.inadmissible.drain() {
                cq.heap.push(entry);
                moved += 1;
            }
        }
        drop(inner);
        if moved > 0 {
            debug!(cluster_queue, moved, "requeued inadmissible workloads");
            self.added.notify_one();
        }
    }

    /// Give a popped entry back: either to the active heap (it should be
    /// retried next cycle) or to the inadmissible parking area (it waits for
    /// a relevant event).
    pub fn requeue(&self, entry: QueueEntry, park: bool) {
        let mut inner = self.inner.lock().unwrap();
        let Some(cq) = inner.cluster_queues.get_mut(&entry.cluster_queue) else {
            return;
        };
        // A fresher copy may have been pushed while this one was in flight.
        if cq.inadmissible.contains_key(&entry.key) || cq.heap.iter().any(|e| e.key == entry.key)
        {
            return;
        }
        if park {
            cq.inadmissible.insert(entry.key.clone(), entry);
        } else {
            cq.heap.push(entry);
        }
    }

    /// Pop the current head of every ClusterQueue. Entries are owned by the
    /// caller until re-queued.
    pub fn take_heads(&self) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock().unwrap();
        let mut heads = Vec::new();
        for cq in inner.cluster_queues.values_mut() {
            if let Some(entry) = cq.heap.pop() {
                heads.push(entry);
            }
        }
        heads
    }

    /// Pop the next pending workload of one ClusterQueue (BestEffortFIFO
    /// in-cycle continuation).
    pub fn pop_next(&self, cluster_queue: &str) -> Option<QueueEntry> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .cluster_queues
            .get_mut(cluster_queue)
            .and_then(|cq| cq.heap.pop())
    }

    /// One head per ClusterQueue; waits until work or a signal arrives.
    pub async fn heads(&self) -> Vec<QueueEntry> {
        loop {
            let notified = self.added.notified();
            let heads = self.take_heads();
            if !heads.is_empty() {
                return heads;
            }
            notified.await;
        }
    }

    /// `(active, inadmissible)` pending counts for one ClusterQueue.
    pub fn pending_counts(&self, cluster_queue: &str) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        inner
            .cluster_queues
            .get(cluster_queue)
            .map(|cq| cq.pending())
            .unwrap_or((0, 0))
    }

    pub fn strategy(&self, cluster_queue: &str) -> Option<QueueingStrategy> {
        let inner = self.inner.lock().unwrap();
        inner.cluster_queues.get(cluster_queue).map(|cq| cq.strategy)
    }
}

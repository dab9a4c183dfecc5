//! Object store port and the in-memory implementation.
//!
//! The durable truth for all kinds lives behind the [`ObjectStore`] trait:
//! typed list/get/update primitives plus a watch stream of change events.
//! Updates use optimistic concurrency on `resource_version`; a stale write
//! returns [`StoreError::Conflict`] and the caller re-reconciles.
//!
//! [`InMemoryStore`] is the bundled implementation used by the binary and the
//! integration tests. It reproduces finalizer semantics: deleting an object
//! that still carries finalizers only marks it terminating, and the object is
//! released once the last finalizer is removed through an update.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::api::{ClusterQueue, LocalQueue, Namespace, ObjectMeta, ResourceFlavor, Workload};

/// Errors surfaced by the object store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("resource version conflict on {0}")]
    Conflict(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A typed object carried by a watch event.
#[derive(Debug, Clone)]
pub enum StoreObject {
    ClusterQueue(ClusterQueue),
    ResourceFlavor(ResourceFlavor),
    LocalQueue(LocalQueue),
    Workload(Workload),
    Namespace(Namespace),
}

#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub event_type: EventType,
    pub object: StoreObject,
}

/// Typed list/get/update primitives over the persisted kinds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_cluster_queues(&self) -> Result<Vec<ClusterQueue>, StoreError>;
    async fn list_resource_flavors(&self) -> Result<Vec<ResourceFlavor>, StoreError>;
    async fn list_local_queues(&self) -> Result<Vec<LocalQueue>, StoreError>;
    async fn list_workloads(&self) -> Result<Vec<Workload>, StoreError>;
    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError>;

    async fn get_cluster_queue(&self, name: &str) -> Result<ClusterQueue, StoreError>;
    async fn get_resource_flavor(&self, name: &str) -> Result<ResourceFlavor, StoreError>;
    async fn get_local_queue(&self, namespace: &str, name: &str)
        -> Result<LocalQueue, StoreError>;
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Workload, StoreError>;
    async fn get_namespace(&self, name: &str) -> Result<Namespace, StoreError>;

    async fn update_cluster_queue(&self, cq: &ClusterQueue) -> Result<ClusterQueue, StoreError>;
    async fn update_resource_flavor(
        &self,
        flavor: &ResourceFlavor,
    ) -> Result<ResourceFlavor, StoreError>;
    async fn update_local_queue(&self, lq: &LocalQueue) -> Result<LocalQueue, StoreError>;
    async fn update_workload(&self, workload: &Workload) -> Result<Workload, StoreError>;
    async fn update_namespace(&self, namespace: &Namespace) -> Result<Namespace, StoreError>;

    /// Subscribe to the change stream. Events observed after the returned
    /// receiver was created are guaranteed to be delivered in order.
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}

trait StoredObject: Clone {
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn into_event_object(self) -> StoreObject;
}

macro_rules! impl_stored_object {
    ($kind:ty, $variant:ident) => {
        impl StoredObject for $kind {
            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }
            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
            fn into_event_object(self) -> StoreObject {
                StoreObject::$variant(self)
            }
        }
    };
}

impl_stored_object!(ClusterQueue, ClusterQueue);
impl_stored_object!(ResourceFlavor, ResourceFlavor);
impl_stored_object!(LocalQueue, LocalQueue);
impl_stored_object!(Workload, Workload);
impl_stored_object!(Namespace, Namespace);

/// One kind's keyed collection with store semantics.
struct Collection<T> {
    objects: HashMap<String, T>,
}

impl<T: StoredObject> Collection<T> {
    fn new() -> Self {
        Self {
            objects: HashMap::new(),
        }
    }

    fn list(&self) -> Vec<T> {
        self.objects.values().cloned().collect()
    }

    fn get(&self, key: &str) -> Result<T, StoreError> {
        self.objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn create(&mut self, mut object: T) -> Result<(T, StoreEvent), StoreError> {
        let key = object.meta().key();
        if self.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        let meta = object.meta_mut();
        meta.uid = Uuid::new_v4();
        meta.resource_version = 1;
        meta.creation_timestamp = Utc::now();
        meta.deletion_timestamp = None;
        self.objects.insert(key, object.clone());
        let event = StoreEvent {
            event_type: EventType::Added,
            object: object.clone().into_event_object(),
        };
        Ok((object, event))
    }

    /// Optimistic-concurrency update. Removing the last finalizer from a
    /// terminating object releases it and yields a `Deleted` event.
    fn update(&mut self, incoming: &T) -> Result<(T, StoreEvent), StoreError> {
        let key = incoming.meta().key();
        let current = self
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if current.meta().resource_version != incoming.meta().resource_version {
            return Err(StoreError::Conflict(key));
        }

        let mut updated = incoming.clone();
        {
            let meta = updated.meta_mut();
            meta.resource_version += 1;
            meta.uid = current.meta().uid;
            meta.creation_timestamp = current.meta().creation_timestamp;
            // Deletion intent is owned by the store, not writers.
            meta.deletion_timestamp = current.meta().deletion_timestamp;
        }

        if updated.meta().is_terminating() && updated.meta().finalizers.is_empty() {
            self.objects.remove(&key);
            let event = StoreEvent {
                event_type: EventType::Deleted,
                object: updated.clone().into_event_object(),
            };
            return Ok((updated, event));
        }

        self.objects.insert(key, updated.clone());
        let event = StoreEvent {
            event_type: EventType::Modified,
            object: updated.clone().into_event_object(),
        };
        Ok((updated, event))
    }

    /// Delete by key. With finalizers present this only marks the object
    /// terminating; otherwise it is removed immediately.
    fn delete(&mut self, key: &str) -> Result<StoreEvent, StoreError> {
        let has_finalizers = self
            .objects
            .get(key)
            .map(|o| !o.meta().finalizers.is_empty())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if !has_finalizers {
            let removed = self
                .objects
                .remove(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            return Ok(StoreEvent {
                event_type: EventType::Deleted,
                object: removed.into_event_object(),
            });
        }
        let current = self
            .objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let meta = current.meta_mut();
        if meta.deletion_timestamp.is_none() {
            meta.deletion_timestamp = Some(Utc::now());
            meta.resource_version += 1;
        }
        Ok(StoreEvent {
            event_type: EventType::Modified,
            object: current.clone().into_event_object(),
        })
    }
}

struct StoreState {
    cluster_queues: Collection<ClusterQueue>,
    resource_flavors: Collection<ResourceFlavor>,
    local_queues: Collection<LocalQueue>,
    workloads: Collection<Workload>,
    namespaces: Collection<Namespace>,
}

/// In-memory [`ObjectStore`] with watch support.
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(StoreState {
                cluster_queues: Collection::new(),
                resource_flavors: Collection::new(),
                local_queues: Collection::new(),
                workloads: Collection::new(),
                namespaces: Collection::new(),
            }),
            events,
        }
    }

    fn publish(&self, event: StoreEvent) {
        // A send error only means nobody is watching yet.
        let _ = self.events.send(event);
    }

    pub fn create_cluster_queue(&self, cq: ClusterQueue) -> Result<ClusterQueue, StoreError> {
        let (stored, event) = self.state.lock().unwrap().cluster_queues.create(cq)?;
        debug!(name = %stored.meta.name, "created cluster queue");
        self.publish(event);
        Ok(stored)
    }

    pub fn create_resource_flavor(
        &self,
        flavor: ResourceFlavor,
    ) -> Result<ResourceFlavor, StoreError> {
        let (stored, event) = self.state.lock().unwrap().resource_flavors.create(flavor)?;
        debug!(name = %stored.meta.name, "created resource flavor");
        self.publish(event);
        Ok(stored)
    }

    pub fn create_local_queue(&self, lq: LocalQueue) -> Result<LocalQueue, StoreError> {
        let (stored, event) = self.state.lock().unwrap().local_queues.create(lq)?;
        debug!(key = %stored.meta.key(), "created local queue");
        self.publish(event);
        Ok(stored)
    }

    pub fn create_workload(&self, workload: Workload) -> Result<Workload, StoreError> {
        let (stored, event) = self.state.lock().unwrap().workloads.create(workload)?;
        debug!(key = %stored.meta.key(), "created workload");
        self.publish(event);
        Ok(stored)
    }

    pub fn create_namespace(&self, namespace: Namespace) -> Result<Namespace, StoreError> {
        let (stored, event) = self.state.lock().unwrap().namespaces.create(namespace)?;
        self.publish(event);
        Ok(stored)
    }

    pub fn delete_cluster_queue(&self, name: &str) -> Result<(), StoreError> {
        let event = self.state.lock().unwrap().cluster_queues.delete(name)?;
        self.publish(event);
        Ok(())
    }

    pub fn delete_resource_flavor(&self, name: &str) -> Result<(), StoreError> {
        let event = self.state.lock().unwrap().resource_flavors.delete(name)?;
        self.publish(event);
        Ok(())
    }

    pub fn delete_local_queue(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = format!("{namespace}/{name}");
        let event = self.state.lock().unwrap().local_queues.delete(&key)?;
        self.publish(event);
        Ok(())
    }

    pub fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = format!("{namespace}/{name}");
        let event = self.state.lock().unwrap().workloads.delete(&key)?;
        self.publish(event);
        Ok(())
    }

    pub fn delete_namespace(&self, name: &str) -> Result<(), StoreError> {
        let event = self.state.lock().unwrap().namespaces.delete(name)?;
        self.publish(event);
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn list_cluster_queues(&self) -> Result<Vec<ClusterQueue>, StoreError> {
        Ok(self.state.lock().unwrap().cluster_queues.list())
    }

    async fn list_resource_flavors(&self) -> Result<Vec<ResourceFlavor>, StoreError> {
        Ok(self.state.lock().unwrap().resource_flavors.list())
    }

    async fn list_local_queues(&self) -> Result<Vec<LocalQueue>, StoreError> {
        Ok(self.state.lock().unwrap().local_queues.list())
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>, StoreError> {
        Ok(self.state.lock().unwrap().workloads.list())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        Ok(self.state.lock().unwrap().namespaces.list())
    }

    async fn get_cluster_queue(&self, name: &str) -> Result<ClusterQueue, StoreError> {
        self.state.lock().unwrap().cluster_queues.get(name)
    }

    async fn get_resource_flavor(&self, name: &str) -> Result<ResourceFlavor, StoreError> {
        self.state.lock().unwrap().resource_flavors.get(name)
    }

    async fn get_local_queue(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<LocalQueue, StoreError> {
        let key = format!("{namespace}/{name}");
        self.state.lock().unwrap().local_queues.get(&key)
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Workload, StoreError> {
        let key = format!("{namespace}/{name}");
        self.state.lock().unwrap().workloads.get(&key)
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, StoreError> {
        self.state.lock().unwrap().namespaces.get(name)
    }

    async fn update_cluster_queue(&self, cq: &ClusterQueue) -> Result<ClusterQueue, StoreError> {
        let (stored, event) = self.state.lock().unwrap().cluster_queues.update(cq)?;
        self.publish(event);
        Ok(stored)
    }

    async fn update_resource_flavor(
        &self,
        flavor: &ResourceFlavor,
    ) -> Result<ResourceFlavor, StoreError> {
        let (stored, event) = self.state.lock().unwrap().resource_flavors.update(flavor)?;
        self.publish(event);
        Ok(stored)
    }

    async fn update_local_queue(&self, lq: &LocalQueue) -> Result<LocalQueue, StoreError> {
        let (stored, event) = self.state.lock().unwrap().local_queues.update(lq)?;
        self.publish(event);
        Ok(stored)
    }

    async fn update_workload(&self, workload: &Workload) -> Result<Workload, StoreError> {
        let (stored, event) = self.state.lock().unwrap().workloads.update(workload)?;
        self.publish(event);
        Ok(stored)
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<Namespace, StoreError> {
        let (stored, event) = self.state.lock().unwrap().namespaces.update(namespace)?;
        self.publish(event);
        Ok(stored)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

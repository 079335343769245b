//! In-memory store: the in-process source of truth with no durability.
//!
//! All objects live in a single map behind a mutex; the global version
//! counter and the event publish happen under the same lock, which is
//! what makes delivery order match commit order. Publishing is a
//! non-blocking broadcast send, so holding the lock across it never
//! stalls a writer on a slow watcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::bus::{EventBus, WatchHandle};
use super::{effective_namespace, ResourceEvent, Store, StoreError};
use crate::resources::{Gvk, Resource};

pub struct MemoryStore {
    inner: Mutex<Inner>,
    bus: Arc<EventBus>,
}

struct Inner {
    /// Keyed `group/version/kind[/namespace]/name`.
    objects: HashMap<String, Resource>,
    /// Global version counter; every mutation takes the next value.
    version: u64,
}

fn object_key(gvk: &Gvk, namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        format!("{}/{}/{}/{}", gvk.group, gvk.version, gvk.kind, name)
    } else {
        format!(
            "{}/{}/{}/{}/{}",
            gvk.group, gvk.version, gvk.kind, namespace, name
        )
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: HashMap::new(),
                version: 0,
            }),
            bus: Arc::new(EventBus::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a writer panicked mid-mutation; the map
        // itself is still structurally sound, so keep serving.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<Resource, StoreError> {
        let namespace = effective_namespace(gvk, namespace);
        let inner = self.lock();
        inner
            .objects
            .get(&object_key(gvk, namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found(gvk, namespace, name))
    }

    async fn list(&self, gvk: &Gvk, namespace: &str) -> Result<Vec<Resource>, StoreError> {
        let namespace = effective_namespace(gvk, namespace);
        let inner = self.lock();
        let mut results: Vec<Resource> = inner
            .objects
            .values()
            .filter(|r| r.gvk() == *gvk)
            .filter(|r| namespace.is_empty() || r.namespace() == namespace)
            .cloned()
            .collect();
        // Stable within a single call.
        results.sort_by(|a, b| {
            (a.namespace(), a.name()).cmp(&(b.namespace(), b.name()))
        });
        Ok(results)
    }

    async fn create(&self, gvk: &Gvk, mut resource: Resource) -> Result<Resource, StoreError> {
        if gvk.is_cluster_scoped() {
            resource.metadata_mut().namespace.clear();
        }
        let namespace = resource.namespace().to_string();
        let name = resource.name().to_string();
        let key = object_key(gvk, &namespace, &name);

        let mut inner = self.lock();

        if let Some(existing) = inner.objects.get(&key).cloned() {
            // Cluster-scoped Node re-create is an upsert so a restarting
            // node can re-announce itself.
            if !gvk.is_cluster_scoped() {
                return Err(StoreError::already_exists(gvk, &namespace, &name));
            }
            let version = inner.next_version();
            let meta = resource.metadata_mut();
            meta.uid = existing.metadata().uid.clone();
            meta.creation_timestamp = existing.metadata().creation_timestamp;
            meta.resource_version = version.clone();
            inner.objects.insert(key, resource.clone());
            self.bus
                .publish(ResourceEvent::modified(resource.clone(), existing, version));
            return Ok(resource);
        }

        let version = inner.next_version();
        let meta = resource.metadata_mut();
        meta.resource_version = version.clone();
        if meta.uid.is_empty() {
            meta.uid = Uuid::new_v4().to_string();
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Utc::now());
        }

        inner.objects.insert(key, resource.clone());
        self.bus
            .publish(ResourceEvent::added(resource.clone(), version));
        Ok(resource)
    }

    async fn update(&self, gvk: &Gvk, mut resource: Resource) -> Result<Resource, StoreError> {
        if gvk.is_cluster_scoped() {
            resource.metadata_mut().namespace.clear();
        }
        let namespace = resource.namespace().to_string();
        let name = resource.name().to_string();
        let key = object_key(gvk, &namespace, &name);

        let mut inner = self.lock();

        let old = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(gvk, &namespace, &name))?;

        let version = inner.next_version();
        let meta = resource.metadata_mut();
        // Identity fields survive whatever the caller supplied.
        meta.uid = old.metadata().uid.clone();
        meta.creation_timestamp = old.metadata().creation_timestamp;
        meta.resource_version = version.clone();

        inner.objects.insert(key, resource.clone());
        self.bus
            .publish(ResourceEvent::modified(resource.clone(), old, version));
        Ok(resource)
    }

    async fn delete(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<Resource, StoreError> {
        let namespace = effective_namespace(gvk, namespace);
        let key = object_key(gvk, namespace, name);

        let mut inner = self.lock();
        let removed = inner
            .objects
            .remove(&key)
            .ok_or_else(|| StoreError::not_found(gvk, namespace, name))?;

        let version = inner.next_version();
        self.bus
            .publish(ResourceEvent::deleted(removed.clone(), version));
        Ok(removed)
    }

    async fn watch(
        &self,
        gvk: &Gvk,
        namespace: &str,
        _since_version: &str,
    ) -> Result<WatchHandle, StoreError> {
        let namespace = effective_namespace(gvk, namespace);
        // Subscribe under the lock so no mutation slips between the
        // bookmark version and the live stream.
        let inner = self.lock();
        let bookmark = ResourceEvent::bookmark(gvk.clone(), inner.version.to_string());
        Ok(self.bus.subscribe(gvk, namespace, bookmark))
    }

    fn shutdown(&self) {
        self.bus.shutdown();
    }
}

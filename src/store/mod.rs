//! Resource store: a typed, event-emitting, single-writer-per-key
//! repository of GVK-addressed objects.
//!
//! Three backends implement one trait:
//! - [`MemoryStore`]: in-process source of truth, no durability.
//! - [`PostgresStore`]: table per Kind; watch events fan out from the
//!   mutating call in this process only.
//! - [`EtcdStore`]: objects under a key prefix; the native etcd watch
//!   feeds the event bus, so mutations from other processes are observed.
//!
//! Every mutation stamps a fresh, strictly monotonic `resourceVersion`
//! and publishes exactly one event. Subscribers own bounded queues; a
//! slow subscriber loses the oldest events rather than stalling writers.

pub mod bus;
pub mod etcd;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::codec::CodecError;
use crate::config::{StorageBackend, StorageConfig};
use crate::resources::{Gvk, Resource};

pub use bus::{EventBus, WatchHandle, WATCH_QUEUE_DEPTH};
pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Kind of change a [`ResourceEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "ADDED")]
    Added,
    #[serde(rename = "MODIFIED")]
    Modified,
    #[serde(rename = "DELETED")]
    Deleted,
    #[serde(rename = "BOOKMARK")]
    Bookmark,
}

/// A change event delivered to watchers.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub event_type: EventType,

    /// Kind the event belongs to.
    pub gvk: Gvk,

    /// Namespace of the affected object; empty for cluster-scoped kinds.
    pub namespace: String,

    /// Version stamped by the mutation (or the current version, for
    /// bookmarks).
    pub resource_version: String,

    /// New state for Added/Modified, last-known state for Deleted,
    /// absent for Bookmark.
    pub object: Option<Resource>,

    /// Prior state; only set for Modified.
    pub old_object: Option<Resource>,
}

impl ResourceEvent {
    pub fn added(resource: Resource, version: String) -> Self {
        Self {
            event_type: EventType::Added,
            gvk: resource.gvk(),
            namespace: resource.namespace().to_string(),
            resource_version: version,
            object: Some(resource),
            old_object: None,
        }
    }

    pub fn modified(resource: Resource, old: Resource, version: String) -> Self {
        Self {
            event_type: EventType::Modified,
            gvk: resource.gvk(),
            namespace: resource.namespace().to_string(),
            resource_version: version,
            object: Some(resource),
            old_object: Some(old),
        }
    }

    pub fn deleted(resource: Resource, version: String) -> Self {
        Self {
            event_type: EventType::Deleted,
            gvk: resource.gvk(),
            namespace: resource.namespace().to_string(),
            resource_version: version,
            object: Some(resource),
            old_object: None,
        }
    }

    pub fn bookmark(gvk: Gvk, version: String) -> Self {
        Self {
            event_type: EventType::Bookmark,
            gvk,
            namespace: String::new(),
            resource_version: version,
            object: None,
            old_object: None,
        }
    }
}

/// Errors raised by store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} \"{name}\" already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl StoreError {
    pub fn not_found(gvk: &Gvk, namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind: gvk.kind.clone(),
            name: qualified(namespace, name),
        }
    }

    pub fn already_exists(gvk: &Gvk, namespace: &str, name: &str) -> Self {
        Self::AlreadyExists {
            kind: gvk.kind.clone(),
            name: qualified(namespace, name),
        }
    }
}

fn qualified(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// The storage contract shared by every backend.
///
/// `create` and `update` return the object as stored, with the metadata
/// fields the store stamped or preserved. `delete` returns the last-known
/// state so the gateway can echo it back.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<Resource, StoreError>;

    /// Snapshot of all objects of a Kind. An empty namespace means every
    /// namespace (and, for cluster-scoped kinds, every object).
    async fn list(&self, gvk: &Gvk, namespace: &str) -> Result<Vec<Resource>, StoreError>;

    async fn create(&self, gvk: &Gvk, resource: Resource) -> Result<Resource, StoreError>;

    async fn update(&self, gvk: &Gvk, resource: Resource) -> Result<Resource, StoreError>;

    async fn delete(&self, gvk: &Gvk, namespace: &str, name: &str)
        -> Result<Resource, StoreError>;

    /// Subscribe to change events for a Kind, optionally scoped to one
    /// namespace. `since_version` is accepted but no backend keeps
    /// history; every subscription starts with a synthetic Bookmark
    /// carrying the current version.
    async fn watch(
        &self,
        gvk: &Gvk,
        namespace: &str,
        since_version: &str,
    ) -> Result<WatchHandle, StoreError>;

    /// Close every watch channel. Called once at process shutdown so
    /// open streams end instead of waiting out their timeouts.
    fn shutdown(&self);
}

/// Shared handle used throughout the gateway and controllers.
pub type SharedStore = Arc<dyn Store>;

/// Build a store from configuration.
pub async fn open_store(config: &StorageConfig) -> Result<SharedStore, StoreError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Postgres => {
            let store = PostgresStore::connect(&config.postgres).await?;
            Ok(Arc::new(store))
        }
        StorageBackend::Etcd => {
            let store = EtcdStore::connect(&config.etcd).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Effective storage namespace for an identity: cluster-scoped kinds
/// ignore any namespace the caller supplies.
pub(crate) fn effective_namespace<'a>(gvk: &Gvk, namespace: &'a str) -> &'a str {
    if gvk.is_cluster_scoped() {
        ""
    } else {
        namespace
    }
}

//! Coordinated KV backend: objects live as JSON values under
//! `/<root>/<group>/<version>/<kind>/[<namespace>/]<name>`.
//!
//! Unlike the relational backend, watch here is native: a single prefix
//! watch on the root translates etcd Put/Delete events into store events,
//! so mutations performed by other processes against the same cluster are
//! observed. Local mutations are *not* published directly; they come back
//! through the same watch, which keeps every process on one ordering.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use etcd_client::{Client, ConnectOptions, EventType as EtcdEventType, GetOptions, WatchOptions};
use tracing::{debug, warn};
use uuid::Uuid;

use super::bus::{EventBus, WatchHandle};
use super::{effective_namespace, ResourceEvent, Store, StoreError};
use crate::codec;
use crate::config::EtcdConfig;
use crate::resources::{Gvk, Resource};

pub struct EtcdStore {
    client: Client,
    bus: Arc<EventBus>,
    root: String,
}

impl EtcdStore {
    pub async fn connect(config: &EtcdConfig) -> Result<Self, StoreError> {
        let mut options =
            ConnectOptions::new().with_connect_timeout(Duration::from_secs(config.dial_timeout_secs));
        if !config.username.is_empty() {
            options = options.with_user(config.username.clone(), config.password.clone());
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(backend_error)?;

        let store = Self {
            client,
            bus: Arc::new(EventBus::new()),
            root: config.root.trim_matches('/').to_string(),
        };
        store.spawn_watch_forwarder().await?;
        Ok(store)
    }

    /// Start the background task that feeds the event bus from the native
    /// etcd watch.
    async fn spawn_watch_forwarder(&self) -> Result<(), StoreError> {
        let prefix = format!("/{}/", self.root);
        let mut client = self.client.clone();
        let bus = self.bus.clone();

        let (watcher, mut stream) = client
            .watch(
                prefix.clone(),
                Some(WatchOptions::new().with_prefix().with_prev_key()),
            )
            .await
            .map_err(backend_error)?;

        tokio::spawn(async move {
            // Holding the watcher keeps the subscription alive.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        for event in response.events() {
                            if let Some(store_event) = translate_event(event) {
                                bus.publish(store_event);
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("etcd watch stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!("etcd watch stream error: {}", e);
                        break;
                    }
                }
            }
            bus.shutdown();
        });

        Ok(())
    }

    fn object_key(&self, gvk: &Gvk, namespace: &str, name: &str) -> String {
        object_key(&self.root, gvk, namespace, name)
    }

    fn kind_prefix(&self, gvk: &Gvk) -> String {
        kind_prefix(&self.root, gvk)
    }

    async fn fetch(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Resource>, StoreError> {
        let mut client = self.client.clone();
        let response = client
            .get(self.object_key(gvk, namespace, name), None)
            .await
            .map_err(backend_error)?;

        match response.kvs().first() {
            Some(kv) => {
                let (resource, _) = codec::decode_yaml_or_json(kv.value())?;
                Ok(Some(resource))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, gvk: &Gvk, resource: &Resource) -> Result<(), StoreError> {
        let key = self.object_key(gvk, resource.namespace(), resource.name());
        let value = codec::encode_json(resource)?;
        let mut client = self.client.clone();
        client.put(key, value, None).await.map_err(backend_error)?;
        Ok(())
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn get(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<Resource, StoreError> {
        let namespace = effective_namespace(gvk, namespace);
        self.fetch(gvk, namespace, name)
            .await?
            .ok_or_else(|| StoreError::not_found(gvk, namespace, name))
    }

    async fn list(&self, gvk: &Gvk, namespace: &str) -> Result<Vec<Resource>, StoreError> {
        let namespace = effective_namespace(gvk, namespace);
        let mut client = self.client.clone();
        let response = client
            .get(
                self.kind_prefix(gvk),
                Some(GetOptions::new().with_prefix()),
            )
            .await
            .map_err(backend_error)?;

        let mut results = Vec::new();
        for kv in response.kvs() {
            let resource = match codec::decode_yaml_or_json(kv.value()) {
                Ok((resource, _)) => resource,
                Err(e) => {
                    warn!("skipping undecodable object at {:?}: {}", kv.key_str(), e);
                    continue;
                }
            };
            if namespace.is_empty() || resource.namespace() == namespace {
                results.push(resource);
            }
        }
        Ok(results)
    }

    async fn create(&self, gvk: &Gvk, mut resource: Resource) -> Result<Resource, StoreError> {
        if gvk.is_cluster_scoped() {
            resource.metadata_mut().namespace.clear();
        }
        let namespace = resource.namespace().to_string();
        let name = resource.name().to_string();

        if let Some(existing) = self.fetch(gvk, &namespace, &name).await? {
            if !gvk.is_cluster_scoped() {
                return Err(StoreError::already_exists(gvk, &namespace, &name));
            }
            // Node re-announce: overwrite, preserving identity fields.
            let meta = resource.metadata_mut();
            meta.uid = existing.metadata().uid.clone();
            meta.creation_timestamp = existing.metadata().creation_timestamp;
            meta.resource_version = nano_stamp();
            self.put(gvk, &resource).await?;
            return Ok(resource);
        }

        {
            let meta = resource.metadata_mut();
            meta.resource_version = nano_stamp();
            if meta.uid.is_empty() {
                meta.uid = Uuid::new_v4().to_string();
            }
            if meta.creation_timestamp.is_none() {
                meta.creation_timestamp = Some(Utc::now());
            }
        }

        self.put(gvk, &resource).await?;
        Ok(resource)
    }

    async fn update(&self, gvk: &Gvk, mut resource: Resource) -> Result<Resource, StoreError> {
        if gvk.is_cluster_scoped() {
            resource.metadata_mut().namespace.clear();
        }
        let namespace = resource.namespace().to_string();
        let name = resource.name().to_string();

        let old = self
            .fetch(gvk, &namespace, &name)
            .await?
            .ok_or_else(|| StoreError::not_found(gvk, &namespace, &name))?;

        let meta = resource.metadata_mut();
        meta.uid = old.metadata().uid.clone();
        meta.creation_timestamp = old.metadata().creation_timestamp;
        meta.resource_version = nano_stamp();

        self.put(gvk, &resource).await?;
        Ok(resource)
    }

    async fn delete(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<Resource, StoreError> {
        let namespace = effective_namespace(gvk, namespace);

        let existing = self
            .fetch(gvk, namespace, name)
            .await?
            .ok_or_else(|| StoreError::not_found(gvk, namespace, name))?;

        let mut client = self.client.clone();
        client
            .delete(self.object_key(gvk, namespace, name), None)
            .await
            .map_err(backend_error)?;
        Ok(existing)
    }

    async fn watch(
        &self,
        gvk: &Gvk,
        namespace: &str,
        _since_version: &str,
    ) -> Result<WatchHandle, StoreError> {
        let namespace = effective_namespace(gvk, namespace);
        let bookmark = ResourceEvent::bookmark(gvk.clone(), nano_stamp());
        Ok(self.bus.subscribe(gvk, namespace, bookmark))
    }

    fn shutdown(&self) {
        self.bus.shutdown();
    }
}

/// `/<root>/<group>/<version>/<kind>/[<namespace>/]<name>`
fn object_key(root: &str, gvk: &Gvk, namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        format!("/{}/{}/{}/{}/{}", root, gvk.group, gvk.version, gvk.kind, name)
    } else {
        format!(
            "/{}/{}/{}/{}/{}/{}",
            root, gvk.group, gvk.version, gvk.kind, namespace, name
        )
    }
}

fn kind_prefix(root: &str, gvk: &Gvk) -> String {
    format!("/{}/{}/{}/{}/", root, gvk.group, gvk.version, gvk.kind)
}

fn nano_stamp() -> String {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string()
}

fn backend_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Translate a native etcd event into a store event. Returns `None` for
/// values that do not decode as supported resources.
fn translate_event(event: &etcd_client::Event) -> Option<ResourceEvent> {
    match event.event_type() {
        EtcdEventType::Put => {
            let kv = event.kv()?;
            let (resource, _) = codec::decode_yaml_or_json(kv.value()).ok()?;
            let version = resource.metadata().resource_version.clone();
            if kv.create_revision() == kv.mod_revision() {
                Some(ResourceEvent::added(resource, version))
            } else {
                let old = event
                    .prev_kv()
                    .and_then(|prev| codec::decode_yaml_or_json(prev.value()).ok())
                    .map(|(resource, _)| resource);
                match old {
                    Some(old) => Some(ResourceEvent::modified(resource, old, version)),
                    None => Some(ResourceEvent::added(resource, version)),
                }
            }
        }
        EtcdEventType::Delete => {
            let prev = event.prev_kv()?;
            let (resource, _) = codec::decode_yaml_or_json(prev.value()).ok()?;
            Some(ResourceEvent::deleted(resource, nano_stamp()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_key_layout() {
        let key = object_key("kubernetes", &Gvk::pod(), "default", "web");
        assert_eq!(key, "/kubernetes//v1/Pod/default/web");
        assert!(key.starts_with(&kind_prefix("kubernetes", &Gvk::pod())));
    }

    #[test]
    fn test_cluster_scoped_key_layout() {
        let key = object_key("kubernetes", &Gvk::node(), "", "node-1");
        assert_eq!(key, "/kubernetes//v1/Node/node-1");
    }

    #[test]
    fn test_grouped_key_layout() {
        let key = object_key("kubernetes", &Gvk::deployment(), "prod", "web");
        assert_eq!(key, "/kubernetes/apps/v1/Deployment/prod/web");
    }

    #[test]
    fn test_prefixes_do_not_collide_across_kinds() {
        let pods = kind_prefix("kubernetes", &Gvk::pod());
        let nodes = kind_prefix("kubernetes", &Gvk::node());
        assert_ne!(pods, nodes);
        assert!(!object_key("kubernetes", &Gvk::node(), "", "x").starts_with(&pods));
    }
}

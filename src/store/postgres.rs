//! Relational backend: one table per Kind, created on first touch.
//!
//! Watch is synthetic here: events fan out from the mutating call, so
//! only mutations performed by this process are observed by watchers.
//! That limitation is the backend's contract, not a bug; use the etcd
//! backend when cross-process visibility matters.
//!
//! Base columns follow the shared layout (identity, version, labels and
//! annotations as JSON text, lifecycle timestamps); the kind-specific
//! payload lands in JSON `spec` / `status` columns. Owner references are
//! not persisted, which is why the deployment controller claims pods
//! primarily by selector labels.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::bus::{EventBus, WatchHandle};
use super::{effective_namespace, ResourceEvent, Store, StoreError};
use crate::codec;
use crate::config::PostgresConfig;
use crate::resources::{Gvk, Resource};

pub struct PostgresStore {
    pool: PgPool,
    bus: Arc<EventBus>,
    table_prefix: String,
    /// Kinds whose table has already been ensured this process.
    ready_tables: DashMap<String, ()>,
    /// Serializes mutations so event order matches commit order.
    write_lock: tokio::sync::Mutex<()>,
}

impl PostgresStore {
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(backend_error)?;

        Ok(Self {
            pool,
            bus: Arc::new(EventBus::new()),
            table_prefix: config.table_prefix.clone(),
            ready_tables: DashMap::new(),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn table(&self, gvk: &Gvk) -> String {
        table_name(&self.table_prefix, gvk)
    }

    async fn ensure_table(&self, gvk: &Gvk) -> Result<(), StoreError> {
        let table = self.table(gvk);
        if self.ready_tables.contains_key(&table) {
            return Ok(());
        }

        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                id BIGSERIAL PRIMARY KEY,\
                name TEXT NOT NULL,\
                namespace TEXT NOT NULL DEFAULT '',\
                uid TEXT NOT NULL,\
                resource_version TEXT NOT NULL,\
                labels_json TEXT NOT NULL DEFAULT '{{}}',\
                annotations_json TEXT NOT NULL DEFAULT '{{}}',\
                created_at TIMESTAMPTZ NOT NULL,\
                updated_at TIMESTAMPTZ NOT NULL,\
                deleted_at TIMESTAMPTZ,\
                spec TEXT,\
                status TEXT\
            )"
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;

        // One live object per identity; soft-deleted rows stay behind.
        let index = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {table}_live_identity \
             ON {table} (namespace, name) WHERE deleted_at IS NULL"
        );
        sqlx::query(&index)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;

        self.ready_tables.insert(table, ());
        Ok(())
    }

    async fn fetch_live(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StoredRow>, StoreError> {
        let query = format!(
            "SELECT name, namespace, uid, resource_version, labels_json, annotations_json, \
             created_at, spec, status FROM {} \
             WHERE namespace = $1 AND name = $2 AND deleted_at IS NULL",
            self.table(gvk)
        );
        let row = sqlx::query(&query)
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_error)?;

        row.map(|row| StoredRow::read(&row).map_err(backend_error))
            .transpose()
    }

    async fn write_update(
        &self,
        gvk: &Gvk,
        old: Resource,
        mut resource: Resource,
    ) -> Result<Resource, StoreError> {
        let version = nano_stamp();
        {
            let meta = resource.metadata_mut();
            meta.uid = old.metadata().uid.clone();
            meta.creation_timestamp = old.metadata().creation_timestamp;
            meta.resource_version = version.clone();
        }

        let (spec, status) = payload_columns(&resource)?;
        let meta = resource.metadata();
        let query = format!(
            "UPDATE {} SET uid = $1, resource_version = $2, labels_json = $3, \
             annotations_json = $4, updated_at = $5, spec = $6, status = $7 \
             WHERE namespace = $8 AND name = $9 AND deleted_at IS NULL",
            self.table(gvk)
        );
        let result = sqlx::query(&query)
            .bind(&meta.uid)
            .bind(&version)
            .bind(encode_map(&meta.labels))
            .bind(encode_map(&meta.annotations))
            .bind(Utc::now())
            .bind(&spec)
            .bind(&status)
            .bind(&meta.namespace)
            .bind(&meta.name)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(gvk, &meta.namespace, &meta.name));
        }

        self.bus
            .publish(ResourceEvent::modified(resource.clone(), old, version));
        Ok(resource)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn get(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<Resource, StoreError> {
        let namespace = effective_namespace(gvk, namespace);
        self.ensure_table(gvk).await?;
        let row = self
            .fetch_live(gvk, namespace, name)
            .await?
            .ok_or_else(|| StoreError::not_found(gvk, namespace, name))?;
        assemble(gvk, &row)
    }

    async fn list(&self, gvk: &Gvk, namespace: &str) -> Result<Vec<Resource>, StoreError> {
        let namespace = effective_namespace(gvk, namespace);
        self.ensure_table(gvk).await?;

        let mut query = format!(
            "SELECT name, namespace, uid, resource_version, labels_json, annotations_json, \
             created_at, spec, status FROM {} WHERE deleted_at IS NULL",
            self.table(gvk)
        );
        let rows = if namespace.is_empty() {
            query.push_str(" ORDER BY namespace, name");
            sqlx::query(&query).fetch_all(&self.pool).await
        } else {
            query.push_str(" AND namespace = $1 ORDER BY namespace, name");
            sqlx::query(&query)
                .bind(namespace)
                .fetch_all(&self.pool)
                .await
        }
        .map_err(backend_error)?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let stored = StoredRow::read(row).map_err(backend_error)?;
            results.push(assemble(gvk, &stored)?);
        }
        Ok(results)
    }

    async fn create(&self, gvk: &Gvk, mut resource: Resource) -> Result<Resource, StoreError> {
        if gvk.is_cluster_scoped() {
            resource.metadata_mut().namespace.clear();
        }
        self.ensure_table(gvk).await?;
        let _write = self.write_lock.lock().await;

        let namespace = resource.namespace().to_string();
        let name = resource.name().to_string();

        if let Some(existing) = self.fetch_live(gvk, &namespace, &name).await? {
            if !gvk.is_cluster_scoped() {
                return Err(StoreError::already_exists(gvk, &namespace, &name));
            }
            // Node re-announce: replace in place.
            let old = assemble(gvk, &existing)?;
            return self.write_update(gvk, old, resource).await;
        }

        let version = nano_stamp();
        {
            let meta = resource.metadata_mut();
            meta.resource_version = version.clone();
            if meta.uid.is_empty() {
                meta.uid = Uuid::new_v4().to_string();
            }
            if meta.creation_timestamp.is_none() {
                meta.creation_timestamp = Some(Utc::now());
            }
        }

        let (spec, status) = payload_columns(&resource)?;
        let meta = resource.metadata();
        let created_at = meta.creation_timestamp.unwrap_or_else(Utc::now);
        let query = format!(
            "INSERT INTO {} (name, namespace, uid, resource_version, labels_json, \
             annotations_json, created_at, updated_at, spec, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            self.table(gvk)
        );
        let result = sqlx::query(&query)
            .bind(&meta.name)
            .bind(&meta.namespace)
            .bind(&meta.uid)
            .bind(&version)
            .bind(encode_map(&meta.labels))
            .bind(encode_map(&meta.annotations))
            .bind(created_at)
            .bind(created_at)
            .bind(&spec)
            .bind(&status)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::already_exists(gvk, &namespace, &name));
            }
            Err(e) => return Err(backend_error(e)),
        }

        self.bus
            .publish(ResourceEvent::added(resource.clone(), version));
        Ok(resource)
    }

    async fn update(&self, gvk: &Gvk, mut resource: Resource) -> Result<Resource, StoreError> {
        if gvk.is_cluster_scoped() {
            resource.metadata_mut().namespace.clear();
        }
        self.ensure_table(gvk).await?;
        let _write = self.write_lock.lock().await;

        let namespace = resource.namespace().to_string();
        let name = resource.name().to_string();
        let existing = self
            .fetch_live(gvk, &namespace, &name)
            .await?
            .ok_or_else(|| StoreError::not_found(gvk, &namespace, &name))?;
        let old = assemble(gvk, &existing)?;

        self.write_update(gvk, old, resource).await
    }

    async fn delete(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<Resource, StoreError> {
        let namespace = effective_namespace(gvk, namespace);
        self.ensure_table(gvk).await?;
        let _write = self.write_lock.lock().await;

        let existing = self
            .fetch_live(gvk, namespace, name)
            .await?
            .ok_or_else(|| StoreError::not_found(gvk, namespace, name))?;
        let resource = assemble(gvk, &existing)?;

        let query = format!(
            "UPDATE {} SET deleted_at = $1 \
             WHERE namespace = $2 AND name = $3 AND deleted_at IS NULL",
            self.table(gvk)
        );
        let result = sqlx::query(&query)
            .bind(Utc::now())
            .bind(namespace)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(gvk, namespace, name));
        }

        self.bus
            .publish(ResourceEvent::deleted(resource.clone(), nano_stamp()));
        Ok(resource)
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

/// `<prefix>_<group>_<version>_<kind>`, group "core" for the core group,
/// dots flattened to underscores.
fn table_name(prefix: &str, gvk: &Gvk) -> String {
    let group = if gvk.group.is_empty() {
        "core".to_string()
    } else {
        gvk.group.replace('.', "_")
    };
    format!(
        "{}_{}_{}_{}",
        prefix,
        group,
        gvk.version,
        gvk.kind.to_lowercase()
    )
}

/// Nanosecond wall-clock version stamp.
fn nano_stamp() -> String {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string()
}

fn backend_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn encode_map(map: &std::collections::HashMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

/// Column values for one stored object, decoupled from the driver row so
/// reassembly stays a pure function.
struct StoredRow {
    name: String,
    namespace: String,
    uid: String,
    resource_version: String,
    labels_json: String,
    annotations_json: String,
    created_at: DateTime<Utc>,
    spec: Option<String>,
    status: Option<String>,
}

impl StoredRow {
    fn read(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            namespace: row.try_get("namespace")?,
            uid: row.try_get("uid")?,
            resource_version: row.try_get("resource_version")?,
            labels_json: row.try_get("labels_json")?,
            annotations_json: row.try_get("annotations_json")?,
            created_at: row.try_get("created_at")?,
            spec: row.try_get("spec")?,
            status: row.try_get("status")?,
        })
    }
}

/// Extract the kind-specific payload for the spec/status columns.
/// ConfigMap and Secret carry their payload at the top level, so it is
/// folded into the spec column.
fn payload_columns(resource: &Resource) -> Result<(String, String), StoreError> {
    let value = codec::to_value(resource)?;
    match resource {
        Resource::ConfigMap(_) | Resource::Secret(_) => {
            let mut payload = serde_json::Map::new();
            for key in ["data", "binaryData", "stringData", "type"] {
                if let Some(field) = value.get(key) {
                    payload.insert(key.to_string(), field.clone());
                }
            }
            Ok((
                serde_json::Value::Object(payload).to_string(),
                "null".to_string(),
            ))
        }
        _ => Ok((
            value
                .get("spec")
                .cloned()
                .unwrap_or(serde_json::Value::Null)
                .to_string(),
            value
                .get("status")
                .cloned()
                .unwrap_or(serde_json::Value::Null)
                .to_string(),
        )),
    }
}

/// Rebuild a typed resource from its columns.
fn assemble(gvk: &Gvk, row: &StoredRow) -> Result<Resource, StoreError> {
    let mut metadata = serde_json::Map::new();
    metadata.insert("name".to_string(), row.name.clone().into());
    if !row.namespace.is_empty() {
        metadata.insert("namespace".to_string(), row.namespace.clone().into());
    }
    metadata.insert("uid".to_string(), row.uid.clone().into());
    metadata.insert(
        "resourceVersion".to_string(),
        row.resource_version.clone().into(),
    );
    metadata.insert(
        "creationTimestamp".to_string(),
        row.created_at.to_rfc3339().into(),
    );
    if let Ok(labels) = serde_json::from_str::<serde_json::Value>(&row.labels_json) {
        if labels.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
            metadata.insert("labels".to_string(), labels);
        }
    }
    if let Ok(annotations) = serde_json::from_str::<serde_json::Value>(&row.annotations_json) {
        if annotations.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
            metadata.insert("annotations".to_string(), annotations);
        }
    }

    let mut object = serde_json::Map::new();
    object.insert("apiVersion".to_string(), gvk.api_version().into());
    object.insert("kind".to_string(), gvk.kind.clone().into());
    object.insert("metadata".to_string(), serde_json::Value::Object(metadata));

    let spec = decode_column(row.spec.as_deref());
    let status = decode_column(row.status.as_deref());

    match gvk.kind.as_str() {
        "ConfigMap" | "Secret" => {
            if let serde_json::Value::Object(fields) = spec {
                for (key, field) in fields {
                    object.insert(key, field);
                }
            }
        }
        _ => {
            if !spec.is_null() {
                object.insert("spec".to_string(), spec);
            }
            if !status.is_null() {
                object.insert("status".to_string(), status);
            }
        }
    }

    let (resource, _) = codec::decode_value(serde_json::Value::Object(object))?;
    Ok(resource)
}

fn decode_column(column: Option<&str>) -> serde_json::Value {
    column
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or(serde_json::Value::Null)
}

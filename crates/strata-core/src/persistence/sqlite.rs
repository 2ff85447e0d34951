// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed node store and persister.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::checkpoint::CheckpointBundle;
use crate::error::{Result, StoreError};
use crate::node::{
    DATA_NODE_PREFIX, Direction, Group, GroupId, Link, LinkType, Node, NodeFilter, NodeId, Pk,
};

use super::{LogRecord, NodeStore, Persister};
use crate::migrations;

#[derive(sqlx::FromRow)]
struct NodeRow {
    pk: i64,
    uuid: String,
    node_type: String,
    label: String,
    attributes: String,
    sealed: bool,
    ctime: DateTime<Utc>,
}

impl TryFrom<NodeRow> for Node {
    type Error = StoreError;

    fn try_from(row: NodeRow) -> Result<Self> {
        let uuid = Uuid::parse_str(&row.uuid)
            .map_err(|e| StoreError::Serialization(format!("invalid uuid '{}': {}", row.uuid, e)))?;
        let attributes: Map<String, Value> = serde_json::from_str(&row.attributes)?;
        Ok(Node {
            pk: Some(row.pk),
            uuid,
            node_type: row.node_type,
            label: row.label,
            attributes,
            sealed: row.sealed,
            ctime: row.ctime,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    source: i64,
    target: i64,
    link_type: String,
    label: String,
}

impl TryFrom<LinkRow> for Link {
    type Error = StoreError;

    fn try_from(row: LinkRow) -> Result<Self> {
        Ok(Link {
            source: row.source,
            target: row.target,
            link_type: row.link_type.parse()?,
            label: row.label,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    pk: i64,
    uuid: String,
    label: String,
}

impl TryFrom<GroupRow> for Group {
    type Error = StoreError;

    fn try_from(row: GroupRow) -> Result<Self> {
        let uuid = Uuid::parse_str(&row.uuid)
            .map_err(|e| StoreError::Serialization(format!("invalid uuid '{}': {}", row.uuid, e)))?;
        Ok(Group {
            pk: row.pk,
            uuid,
            label: row.label,
        })
    }
}

fn db_error(operation: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Database {
        operation: operation.to_string(),
        details: err.to_string(),
    }
}

fn attribute_path(key: &str) -> Result<String> {
    if key.is_empty() || key.contains('"') {
        return Err(StoreError::Validation {
            field: "attribute".to_string(),
            message: format!("invalid attribute key '{key}'"),
        });
    }
    Ok(format!("$.\"{key}\""))
}

/// SQLite-backed node store and persister.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    ///
    /// In-memory URLs get a single connection so that every query sees the
    /// same database.
    pub async fn connect(url: &str) -> Result<Self> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| db_error("connect", format!("Failed to connect to {url}: {e}")))?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| db_error("migrate", format!("Failed to run migrations: {e}")))?;

        Ok(Self { pool })
    }

    /// Fresh in-memory database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/strata.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                db_error(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_node(&self, pk: Pk) -> Result<Node> {
        let row = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT pk, uuid, node_type, label, attributes, sealed, ctime
            FROM nodes
            WHERE pk = ?
            "#,
        )
        .bind(pk)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| StoreError::node_not_found(pk))?.try_into()
    }

    /// Explain why an attribute update matched no row.
    async fn rejected_update(&self, pk: Pk) -> StoreError {
        match self.fetch_node(pk).await {
            Ok(node) => match node.ensure_mutable() {
                Err(err) => err,
                Ok(()) => db_error("update_attributes", format!("node {pk} was not updated")),
            },
            Err(err) => err,
        }
    }

    async fn ensure_group(&self, group: Pk) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT pk FROM node_groups WHERE pk = ?")
            .bind(group)
            .fetch_optional(&self.pool)
            .await?;
        exists.map(|_| ()).ok_or_else(|| StoreError::NotExistent {
            entity: "group",
            identifier: group.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl NodeStore for SqliteStore {
    async fn store_node(&self, node: &Node) -> Result<Node> {
        if node.pk.is_some() {
            return Err(StoreError::Validation {
                field: "pk".to_string(),
                message: format!("node {} is already stored", node.uuid),
            });
        }
        let attributes = serde_json::to_string(&node.attributes)?;

        let result = sqlx::query(
            r#"
            INSERT INTO nodes (uuid, node_type, label, attributes, sealed, ctime)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(node.uuid.to_string())
        .bind(&node.node_type)
        .bind(&node.label)
        .bind(attributes)
        .bind(node.sealed)
        .bind(node.ctime)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("store_node", e))?;

        let mut stored = node.clone();
        stored.pk = Some(result.last_insert_rowid());
        Ok(stored)
    }

    async fn load_node(&self, id: NodeId) -> Result<Node> {
        match id {
            NodeId::Pk(pk) => self.fetch_node(pk).await,
            NodeId::Uuid(uuid) => {
                let row = sqlx::query_as::<_, NodeRow>(
                    r#"
                    SELECT pk, uuid, node_type, label, attributes, sealed, ctime
                    FROM nodes
                    WHERE uuid = ?
                    "#,
                )
                .bind(uuid.to_string())
                .fetch_optional(&self.pool)
                .await?;

                row.ok_or_else(|| StoreError::node_not_found(uuid))?.try_into()
            }
        }
    }

    async fn set_attributes(&self, pk: Pk, attributes: Map<String, Value>) -> Result<()> {
        if attributes.is_empty() {
            return Ok(());
        }

        // Single statement merge, guarded against sealed and stored data nodes
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE nodes SET attributes = json_set(attributes");
        for (key, value) in &attributes {
            builder.push(", ");
            builder.push_bind(attribute_path(key)?);
            builder.push(", json(");
            builder.push_bind(serde_json::to_string(value)?);
            builder.push(")");
        }
        builder.push(") WHERE pk = ");
        builder.push_bind(pk);
        builder.push(" AND sealed = 0 AND node_type NOT LIKE ");
        builder.push_bind(format!("{DATA_NODE_PREFIX}%"));

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("set_attributes", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_update(pk).await);
        }
        Ok(())
    }

    async fn delete_attribute(&self, pk: Pk, key: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE nodes
            SET attributes = json_remove(attributes, ?)
            WHERE pk = ? AND sealed = 0 AND node_type NOT LIKE ?
            "#,
        )
        .bind(attribute_path(key)?)
        .bind(pk)
        .bind(format!("{DATA_NODE_PREFIX}%"))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("delete_attribute", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_update(pk).await);
        }
        Ok(())
    }

    async fn seal(&self, pk: Pk) -> Result<()> {
        let result = sqlx::query("UPDATE nodes SET sealed = 1 WHERE pk = ?")
            .bind(pk)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("seal", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::node_not_found(pk));
        }
        Ok(())
    }

    async fn add_link(&self, link: &Link) -> Result<()> {
        let source = self.fetch_node(link.source).await?;
        let target = self.fetch_node(link.target).await?;
        link.validate(&source, &target)?;

        sqlx::query(
            r#"
            INSERT INTO links (source, target, link_type, label)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(link.source)
        .bind(link.target)
        .bind(link.link_type.as_str())
        .bind(&link.label)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("add_link", e))?;

        Ok(())
    }

    async fn get_links(
        &self,
        pk: Pk,
        direction: Direction,
        link_type: Option<LinkType>,
    ) -> Result<Vec<Link>> {
        let sql = match direction {
            Direction::Outgoing => {
                r#"
                SELECT source, target, link_type, label
                FROM links
                WHERE source = ?1 AND (?2 IS NULL OR link_type = ?2)
                ORDER BY id
                "#
            }
            Direction::Incoming => {
                r#"
                SELECT source, target, link_type, label
                FROM links
                WHERE target = ?1 AND (?2 IS NULL OR link_type = ?2)
                ORDER BY id
                "#
            }
        };

        let rows = sqlx::query_as::<_, LinkRow>(sql)
            .bind(pk)
            .bind(link_type.map(|lt| lt.as_str()))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Link::try_from).collect()
    }

    async fn query(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT pk, uuid, node_type, label, attributes, sealed, ctime FROM nodes WHERE 1 = 1",
        );

        if let Some(prefix) = &filter.node_type_prefix {
            builder.push(" AND substr(node_type, 1, length(");
            builder.push_bind(prefix.clone());
            builder.push(")) = ");
            builder.push_bind(prefix.clone());
        }
        if let Some(label) = &filter.label {
            builder.push(" AND label = ");
            builder.push_bind(label.clone());
        }
        if let Some(prefix) = &filter.uuid_prefix {
            builder.push(" AND replace(uuid, '-', '') LIKE ");
            builder.push_bind(format!("{prefix}%"));
        }
        for (key, value) in &filter.attributes {
            builder.push(" AND json_extract(attributes, ");
            builder.push_bind(attribute_path(key)?);
            builder.push(") IS json_extract(");
            builder.push_bind(serde_json::to_string(value)?);
            builder.push(", '$')");
        }
        if let Some(sealed) = filter.sealed {
            builder.push(" AND sealed = ");
            builder.push_bind(sealed);
        }
        builder.push(" ORDER BY pk");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }

        let rows = builder
            .build_query_as::<NodeRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Node::try_from).collect()
    }

    async fn create_group(&self, label: &str) -> Result<Group> {
        let existing: Option<i64> = sqlx::query_scalar("SELECT pk FROM node_groups WHERE label = ?")
            .bind(label)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(StoreError::Validation {
                field: "label".to_string(),
                message: format!("group '{label}' already exists"),
            });
        }

        let uuid = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT INTO node_groups (uuid, label, ctime)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(uuid.to_string())
        .bind(label)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("create_group", e))?;

        Ok(Group {
            pk: result.last_insert_rowid(),
            uuid,
            label: label.to_string(),
        })
    }

    async fn load_group(&self, id: GroupId) -> Result<Group> {
        let query = match &id {
            GroupId::Pk(pk) => {
                sqlx::query_as::<_, GroupRow>("SELECT pk, uuid, label FROM node_groups WHERE pk = ?")
                    .bind(*pk)
            }
            GroupId::Uuid(uuid) => sqlx::query_as::<_, GroupRow>(
                "SELECT pk, uuid, label FROM node_groups WHERE uuid = ?",
            )
            .bind(uuid.to_string()),
            GroupId::Label(label) => sqlx::query_as::<_, GroupRow>(
                "SELECT pk, uuid, label FROM node_groups WHERE label = ?",
            )
            .bind(label.clone()),
        };

        let row = query.fetch_optional(&self.pool).await?;
        row.ok_or_else(|| StoreError::NotExistent {
            entity: "group",
            identifier: id.to_string(),
        })?
        .try_into()
    }

    async fn add_nodes_to_group(&self, group: Pk, nodes: &[Pk]) -> Result<()> {
        self.ensure_group(group).await?;

        let mut tx = self.pool.begin().await?;
        for pk in nodes {
            let exists: Option<i64> = sqlx::query_scalar("SELECT pk FROM nodes WHERE pk = ?")
                .bind(*pk)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(StoreError::node_not_found(pk));
            }
            sqlx::query("INSERT OR IGNORE INTO group_nodes (group_pk, node_pk) VALUES (?, ?)")
                .bind(group)
                .bind(*pk)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn group_members(&self, group: Pk) -> Result<Vec<Node>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT n.pk, n.uuid, n.node_type, n.label, n.attributes, n.sealed, n.ctime
            FROM nodes n
            JOIN group_nodes g ON g.node_pk = n.pk
            WHERE g.group_pk = ?
            ORDER BY n.pk
            "#,
        )
        .bind(group)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Node::try_from).collect()
    }

    async fn add_log(&self, pk: Pk, level: &str, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_logs (node_pk, level, message, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(pk)
        .bind(level)
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("add_log", e))?;

        Ok(())
    }

    async fn get_logs(&self, pk: Pk) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query_as::<_, LogRecord>(
            r#"
            SELECT id, node_pk, level, message, created_at
            FROM node_logs
            WHERE node_pk = ?
            ORDER BY id
            "#,
        )
        .bind(pk)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn acquire_lease(&self, pk: Pk, owner: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at_ms = now_ms.saturating_add(ttl_ms);

        let result = sqlx::query(
            r#"
            INSERT INTO process_leases (pid, owner, expires_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(pid) DO UPDATE
            SET owner = excluded.owner, expires_at_ms = excluded.expires_at_ms
            WHERE process_leases.owner = excluded.owner
               OR process_leases.expires_at_ms <= ?4
            "#,
        )
        .bind(pk)
        .bind(owner)
        .bind(expires_at_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("acquire_lease", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, pk: Pk, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM process_leases WHERE pid = ? AND owner = ?")
            .bind(pk)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("release_lease", e))?;

        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Persister for SqliteStore {
    async fn save_checkpoint(&self, bundle: &CheckpointBundle) -> Result<()> {
        let bytes = bundle.to_bytes()?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (pid, bundle, saved_at)
            VALUES (?, ?, ?)
            ON CONFLICT(pid) DO UPDATE
            SET bundle = excluded.bundle, saved_at = excluded.saved_at
            "#,
        )
        .bind(bundle.pid)
        .bind(bytes)
        .bind(bundle.saved_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("save_checkpoint", e))?;

        Ok(())
    }

    async fn load_checkpoint(&self, pid: Pk) -> Result<CheckpointBundle> {
        let bytes: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT bundle FROM checkpoints WHERE pid = ?")
                .bind(pid)
                .fetch_optional(&self.pool)
                .await?;

        let bytes = bytes.ok_or_else(|| StoreError::checkpoint_not_found(pid))?;
        CheckpointBundle::from_bytes(&bytes)
    }

    async fn delete_checkpoint(&self, pid: Pk) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE pid = ?")
            .bind(pid)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete_checkpoint", e))?;

        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Pk>> {
        let pids: Vec<i64> = sqlx::query_scalar("SELECT pid FROM checkpoints ORDER BY pid")
            .fetch_all(&self.pool)
            .await?;

        Ok(pids)
    }
}

//! SQLite storage implementation
//!
//! One backend serving the record store, graph store, blob store, and audit
//! sink contracts. Separate reader/writer connections behind mutexes give
//! interior mutability; all methods take `&self`, so the store is
//! `Send + Sync` and lives behind a plain `Arc`.
//!
//! Tenant isolation is enforced at this layer, not only above it: every
//! operation sets a session tenant marker on the connection before running
//! SQL, every statement carries the marker as its tenant predicate, and every
//! row handed back is re-checked against the marker. A connection found with
//! a lingering marker is considered poisoned and reopened.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::audit::{AuditEvent, AuditOutcome};
use crate::error::{CoreError, Result};
use crate::graph::{GraphCascade, GraphEdge, SemanticNode};
use crate::memory::{EmbeddingRecord, InfoClass, Layer, MemoryRecord, RecordUpdate};
use crate::search::{sanitize_fts5_query, vector_from_bytes, vector_to_bytes};
use crate::storage::{
    AuditStore, BlobStore, Capabilities, GraphStore, Page, RecordFilter, RecordStore,
};
use crate::tenant::{TenantContext, TenantId};

use super::migrations;

const RECORD_COLS: &str = "id, tenant, layer, content, tags, source, importance, usage_count, \
     created_at, last_accessed_at, last_decayed_at, info_class, content_hash, parents, staged, \
     reflection";

// ============================================================================
// CONNECTIONS & TENANT MARKER
// ============================================================================

struct MarkedConnection {
    conn: Connection,
    /// Session tenant marker; must be cleared before the connection returns
    /// to the pool. A lingering marker poisons the connection.
    marker: Option<String>,
}

/// RAII guard holding a connection with the tenant marker set. Dropping the
/// guard clears the marker.
struct TenantGuard<'a> {
    inner: MutexGuard<'a, MarkedConnection>,
}

impl TenantGuard<'_> {
    fn conn(&self) -> &Connection {
        &self.inner.conn
    }

    fn tenant(&self) -> &str {
        self.inner.marker.as_deref().unwrap_or_default()
    }
}

impl Drop for TenantGuard<'_> {
    fn drop(&mut self) {
        self.inner.marker = None;
    }
}

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed store. See module docs for the isolation model.
pub struct SqliteStore {
    writer: Mutex<MarkedConnection>,
    reader: Mutex<MarkedConnection>,
    path: PathBuf,
}

impl SqliteStore {
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the store at `db_path`, defaulting to the platform
    /// data directory.
    pub fn open(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("run", "rae", "core").ok_or_else(|| {
                    CoreError::Init("could not determine project directories".to_string())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("rae.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(MarkedConnection {
                conn: writer_conn,
                marker: None,
            }),
            reader: Mutex::new(MarkedConnection {
                conn: reader_conn,
                marker: None,
            }),
            path,
        })
    }

    /// Acquire a connection with the session tenant marker set.
    fn guard<'a>(
        &self,
        pool: &'a Mutex<MarkedConnection>,
        ctx: &TenantContext,
    ) -> Result<TenantGuard<'a>> {
        let mut inner = pool
            .lock()
            .map_err(|_| CoreError::Init("connection lock poisoned".into()))?;
        if inner.marker.is_some() {
            // Returned to the pool without clearing: poisoned, reopen.
            tracing::warn!("connection returned with tenant marker set; reopening");
            let fresh = Connection::open(&self.path)?;
            Self::configure_connection(&fresh)?;
            inner.conn = fresh;
            inner.marker = None;
        }
        inner.marker = Some(ctx.tenant().as_str().to_string());
        Ok(TenantGuard { inner })
    }

    fn read_guard(&self, ctx: &TenantContext) -> Result<TenantGuard<'_>> {
        self.guard(&self.reader, ctx)
    }

    fn write_guard(&self, ctx: &TenantContext) -> Result<TenantGuard<'_>> {
        self.guard(&self.writer, ctx)
    }

    fn base_capabilities() -> Capabilities {
        Capabilities {
            vector_search: false,
            full_text: true,
            transactions: true,
            session_tenant_marker: true,
            ttl: false,
            atomic_graph_traverse: false,
        }
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

struct RawRecord {
    id: String,
    tenant: String,
    layer: String,
    content: String,
    tags: String,
    source: Option<String>,
    importance: f64,
    usage_count: i64,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    last_decayed_at: Option<DateTime<Utc>>,
    info_class: String,
    content_hash: String,
    parents: String,
    staged: bool,
    reflection: Option<String>,
}

fn raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        tenant: row.get(1)?,
        layer: row.get(2)?,
        content: row.get(3)?,
        tags: row.get(4)?,
        source: row.get(5)?,
        importance: row.get(6)?,
        usage_count: row.get(7)?,
        created_at: row.get(8)?,
        last_accessed_at: row.get(9)?,
        last_decayed_at: row.get(10)?,
        info_class: row.get(11)?,
        content_hash: row.get(12)?,
        parents: row.get(13)?,
        staged: row.get(14)?,
        reflection: row.get(15)?,
    })
}

impl RawRecord {
    /// Convert the raw row, re-checking it against the session marker. A row
    /// of another tenant surfacing here is poisoned data, fatal for the
    /// request.
    fn into_record(self, marker: &str) -> Result<MemoryRecord> {
        if self.tenant != marker {
            return Err(CoreError::Poisoned(format!(
                "row {} belongs to another tenant",
                self.id
            )));
        }
        let record = MemoryRecord {
            id: self.id,
            tenant: TenantId::from(self.tenant),
            layer: Layer::parse_name(&self.layer)?,
            content: self.content,
            tags: serde_json::from_str(&self.tags)?,
            source: self.source,
            importance: self.importance,
            usage_count: self.usage_count,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            last_decayed_at: self.last_decayed_at,
            info_class: InfoClass::parse_name(&self.info_class)?,
            content_hash: self.content_hash,
            parents: serde_json::from_str(&self.parents)?,
            staged: self.staged,
            reflection: self
                .reflection
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        };
        record.validate()?;
        Ok(record)
    }
}

fn info_classes_at_most(max: InfoClass) -> Vec<&'static str> {
    [
        InfoClass::Public,
        InfoClass::Internal,
        InfoClass::Confidential,
        InfoClass::Restricted,
    ]
    .iter()
    .filter(|c| **c <= max)
    .map(|c| c.as_str())
    .collect()
}

fn parse_cursor(cursor: &str) -> Result<(DateTime<Utc>, String)> {
    let (ts, id) = cursor
        .split_once('|')
        .ok_or_else(|| CoreError::InvalidRecord("malformed cursor".into()))?;
    let ts = DateTime::parse_from_rfc3339(ts)
        .map_err(|_| CoreError::InvalidRecord("malformed cursor timestamp".into()))?
        .with_timezone(&Utc);
    Ok((ts, id.to_string()))
}

// ============================================================================
// RECORD STORE
// ============================================================================

impl RecordStore for SqliteStore {
    fn capabilities(&self) -> Capabilities {
        Self::base_capabilities()
    }

    fn put(&self, ctx: &TenantContext, record: &MemoryRecord) -> Result<()> {
        ctx.assert_owns(&record.tenant, "memory")?;
        record.validate().map_err(|_| {
            CoreError::InvalidRecord(format!("record {} fails numeric invariants", record.id))
        })?;
        let guard = self.write_guard(ctx)?;
        guard.conn().execute(
            "INSERT INTO memories (id, tenant, layer, content, tags, source, importance, \
                 usage_count, created_at, last_accessed_at, last_decayed_at, info_class, \
                 content_hash, parents, staged, reflection)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(tenant, id) DO UPDATE SET
                 layer = excluded.layer,
                 content = excluded.content,
                 tags = excluded.tags,
                 source = excluded.source,
                 importance = excluded.importance,
                 usage_count = excluded.usage_count,
                 last_accessed_at = excluded.last_accessed_at,
                 last_decayed_at = excluded.last_decayed_at,
                 info_class = excluded.info_class,
                 content_hash = excluded.content_hash,
                 parents = excluded.parents,
                 staged = excluded.staged,
                 reflection = excluded.reflection",
            params![
                record.id,
                guard.tenant(),
                record.layer.as_str(),
                record.content,
                serde_json::to_string(&record.tags)?,
                record.source,
                record.importance,
                record.usage_count,
                record.created_at,
                record.last_accessed_at,
                record.last_decayed_at,
                record.info_class.as_str(),
                record.content_hash,
                serde_json::to_string(&record.parents)?,
                record.staged,
                record
                    .reflection
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )?;
        Ok(())
    }

    fn get(&self, ctx: &TenantContext, id: &str) -> Result<Option<MemoryRecord>> {
        let guard = self.read_guard(ctx)?;
        let raw = guard
            .conn()
            .query_row(
                &format!("SELECT {RECORD_COLS} FROM memories WHERE tenant = ?1 AND id = ?2"),
                params![guard.tenant(), id],
                raw_record,
            )
            .optional()?;
        raw.map(|r| r.into_record(guard.tenant())).transpose()
    }

    fn delete(&self, ctx: &TenantContext, id: &str) -> Result<bool> {
        let guard = self.write_guard(ctx)?;
        let affected = guard.conn().execute(
            "DELETE FROM memories WHERE tenant = ?1 AND id = ?2",
            params![guard.tenant(), id],
        )?;
        Ok(affected > 0)
    }

    fn query(&self, ctx: &TenantContext, filter: &RecordFilter) -> Result<Page<MemoryRecord>> {
        let guard = self.read_guard(ctx)?;
        let mut sql = format!("SELECT {RECORD_COLS} FROM memories WHERE tenant = ?");
        let mut values: Vec<Value> = vec![Value::Text(guard.tenant().to_string())];

        if let Some(layers) = &filter.layers {
            if layers.is_empty() {
                return Ok(Page::empty());
            }
            let placeholders = vec!["?"; layers.len()].join(", ");
            sql.push_str(&format!(" AND layer IN ({placeholders})"));
            for layer in layers {
                values.push(Value::Text(layer.as_str().to_string()));
            }
        }
        if !filter.any_tags.is_empty() {
            let clauses = vec!["tags LIKE ?"; filter.any_tags.len()].join(" OR ");
            sql.push_str(&format!(" AND ({clauses})"));
            for tag in &filter.any_tags {
                values.push(Value::Text(format!("%\"{tag}\"%")));
            }
        }
        if let Some(min) = filter.min_importance {
            sql.push_str(" AND importance >= ?");
            values.push(Value::Real(min));
        }
        if let Some(max) = filter.max_importance {
            sql.push_str(" AND importance <= ?");
            values.push(Value::Real(max));
        }
        if let Some(after) = filter.created_after {
            sql.push_str(" AND created_at >= ?");
            values.push(Value::Text(after.to_rfc3339()));
        }
        if let Some(before) = filter.created_before {
            sql.push_str(" AND created_at <= ?");
            values.push(Value::Text(before.to_rfc3339()));
        }
        if let Some(max_class) = filter.info_class_at_most {
            let classes = info_classes_at_most(max_class);
            let placeholders = vec!["?"; classes.len()].join(", ");
            sql.push_str(&format!(" AND info_class IN ({placeholders})"));
            for class in classes {
                values.push(Value::Text(class.to_string()));
            }
        }
        if !filter.include_staged {
            sql.push_str(" AND staged = 0");
        }
        if let Some(cursor) = &filter.cursor {
            let (ts, id) = parse_cursor(cursor)?;
            sql.push_str(" AND (created_at < ? OR (created_at = ? AND id < ?))");
            values.push(Value::Text(ts.to_rfc3339()));
            values.push(Value::Text(ts.to_rfc3339()));
            values.push(Value::Text(id));
        }

        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        values.push(Value::Integer(limit as i64 + 1));

        let mut stmt = guard.conn().prepare(&sql)?;
        let raws: Vec<RawRecord> = stmt
            .query_map(params_from_iter(values), raw_record)?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let mut items = Vec::with_capacity(raws.len());
        for raw in raws {
            items.push(raw.into_record(guard.tenant())?);
        }
        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items
                .last()
                .map(|r| format!("{}|{}", r.created_at.to_rfc3339(), r.id))
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    fn lexical_search(
        &self,
        ctx: &TenantContext,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f64)>> {
        if top_k == 0 {
            return Ok(vec![]);
        }
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(vec![]);
        }
        // Parenthesized so the column filter covers the whole OR group, not
        // just the first phrase.
        let match_expr = format!("{{content tags}} : ({sanitized})");

        let guard = self.read_guard(ctx)?;
        let mut stmt = guard.conn().prepare(
            "SELECT memories_fts.id, bm25(memories_fts) AS rank
             FROM memories_fts
             JOIN memories m ON m.tenant = memories_fts.tenant AND m.id = memories_fts.id
             WHERE memories_fts MATCH ?1 AND memories_fts.tenant = ?2 AND m.staged = 0
             ORDER BY rank
             LIMIT ?3",
        )?;
        let rows: Vec<(String, f64)> = stmt
            .query_map(
                params![match_expr, guard.tenant(), top_k as i64],
                |row| {
                    let id: String = row.get(0)?;
                    let rank: f64 = row.get(1)?;
                    Ok((id, -rank))
                },
            )?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    fn apply_update(
        &self,
        ctx: &TenantContext,
        id: &str,
        update: &RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<MemoryRecord> {
        let guard = self.write_guard(ctx)?;
        let raw = guard
            .conn()
            .query_row(
                &format!("SELECT {RECORD_COLS} FROM memories WHERE tenant = ?1 AND id = ?2"),
                params![guard.tenant(), id],
                raw_record,
            )
            .optional()?
            .ok_or_else(|| CoreError::InvalidRecord(format!("unknown memory {id}")))?;
        let mut record = raw.into_record(guard.tenant())?;

        if let Some(tags) = &update.tags {
            record.tags = tags.clone();
        }
        if let Some(importance) = update.importance {
            record.importance = importance;
        }
        if let Some(class) = update.info_class {
            record.info_class = class;
        }
        if update.touch_usage {
            record.usage_count += 1;
            record.last_accessed_at = now;
        }

        guard.conn().execute(
            "UPDATE memories SET tags = ?1, importance = ?2, info_class = ?3, \
                 usage_count = ?4, last_accessed_at = ?5
             WHERE tenant = ?6 AND id = ?7",
            params![
                serde_json::to_string(&record.tags)?,
                record.importance,
                record.info_class.as_str(),
                record.usage_count,
                record.last_accessed_at,
                guard.tenant(),
                id,
            ],
        )?;
        Ok(record)
    }

    fn apply_decay(
        &self,
        ctx: &TenantContext,
        id: &str,
        importance: f64,
        decayed_at: DateTime<Utc>,
    ) -> Result<()> {
        let guard = self.write_guard(ctx)?;
        guard.conn().execute(
            "UPDATE memories SET importance = ?1, last_decayed_at = ?2
             WHERE tenant = ?3 AND id = ?4",
            params![importance.clamp(0.0, 1.0), decayed_at, guard.tenant(), id],
        )?;
        Ok(())
    }

    fn commit_staged(&self, ctx: &TenantContext, id: &str) -> Result<()> {
        let guard = self.write_guard(ctx)?;
        let affected = guard.conn().execute(
            "UPDATE memories SET staged = 0 WHERE tenant = ?1 AND id = ?2 AND staged = 1",
            params![guard.tenant(), id],
        )?;
        if affected == 0 {
            return Err(CoreError::InvalidRecord(format!(
                "no staged record {id} to commit"
            )));
        }
        Ok(())
    }

    fn prune_stale_staged(&self, ctx: &TenantContext, older_than: DateTime<Utc>) -> Result<usize> {
        let guard = self.write_guard(ctx)?;
        let affected = guard.conn().execute(
            "DELETE FROM memories WHERE tenant = ?1 AND staged = 1 AND created_at < ?2",
            params![guard.tenant(), older_than],
        )?;
        Ok(affected)
    }

    fn find_by_hash(
        &self,
        ctx: &TenantContext,
        content_hash: &str,
        source: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let guard = self.read_guard(ctx)?;
        let result = match source {
            Some(src) => guard
                .conn()
                .query_row(
                    "SELECT id FROM memories
                     WHERE tenant = ?1 AND content_hash = ?2 AND source = ?3
                       AND staged = 0 AND created_at >= ?4
                     ORDER BY created_at DESC LIMIT 1",
                    params![guard.tenant(), content_hash, src, since],
                    |row| row.get(0),
                )
                .optional()?,
            None => guard
                .conn()
                .query_row(
                    "SELECT id FROM memories
                     WHERE tenant = ?1 AND content_hash = ?2 AND source IS NULL
                       AND staged = 0 AND created_at >= ?3
                     ORDER BY created_at DESC LIMIT 1",
                    params![guard.tenant(), content_hash, since],
                    |row| row.get(0),
                )
                .optional()?,
        };
        Ok(result)
    }

    fn highwater(&self, ctx: &TenantContext) -> Result<Option<DateTime<Utc>>> {
        let guard = self.read_guard(ctx)?;
        let ts: Option<DateTime<Utc>> = guard.conn().query_row(
            "SELECT MAX(created_at) FROM memories WHERE tenant = ?1",
            params![guard.tenant()],
            |row| row.get(0),
        )?;
        Ok(ts)
    }

    fn put_embedding(&self, ctx: &TenantContext, embedding: &EmbeddingRecord) -> Result<()> {
        ctx.assert_owns(&embedding.tenant, "embedding")?;
        let guard = self.write_guard(ctx)?;
        guard.conn().execute(
            "INSERT OR REPLACE INTO memory_embeddings
                 (tenant, memory_id, model_name, dim, vector, content_hash, created_at, stale)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                guard.tenant(),
                embedding.memory_id,
                embedding.model,
                embedding.dim as i64,
                vector_to_bytes(&embedding.vector),
                embedding.content_hash,
                embedding.created_at,
                embedding.stale,
            ],
        )?;
        Ok(())
    }

    fn get_embedding(
        &self,
        ctx: &TenantContext,
        memory_id: &str,
        model: &str,
    ) -> Result<Option<EmbeddingRecord>> {
        let guard = self.read_guard(ctx)?;
        let row = guard
            .conn()
            .query_row(
                "SELECT dim, vector, content_hash, created_at, stale
                 FROM memory_embeddings
                 WHERE tenant = ?1 AND memory_id = ?2 AND model_name = ?3",
                params![guard.tenant(), memory_id, model],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(dim, bytes, content_hash, created_at, stale)| EmbeddingRecord {
            tenant: ctx.tenant().clone(),
            memory_id: memory_id.to_string(),
            model: model.to_string(),
            dim: dim as usize,
            vector: vector_from_bytes(&bytes),
            content_hash,
            created_at,
            stale,
        }))
    }

    fn embeddings_for(
        &self,
        ctx: &TenantContext,
        memory_id: &str,
    ) -> Result<Vec<EmbeddingRecord>> {
        let guard = self.read_guard(ctx)?;
        let mut stmt = guard.conn().prepare(
            "SELECT model_name, dim, vector, content_hash, created_at, stale
             FROM memory_embeddings WHERE tenant = ?1 AND memory_id = ?2",
        )?;
        let rows: Vec<EmbeddingRecord> = stmt
            .query_map(params![guard.tenant(), memory_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, DateTime<Utc>>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(
                |(model, dim, bytes, content_hash, created_at, stale)| EmbeddingRecord {
                    tenant: ctx.tenant().clone(),
                    memory_id: memory_id.to_string(),
                    model,
                    dim: dim as usize,
                    vector: vector_from_bytes(&bytes),
                    content_hash,
                    created_at,
                    stale,
                },
            )
            .collect();
        Ok(rows)
    }

    fn mark_embeddings_stale(&self, ctx: &TenantContext, memory_id: &str) -> Result<usize> {
        let guard = self.write_guard(ctx)?;
        let affected = guard.conn().execute(
            "UPDATE memory_embeddings SET stale = 1 WHERE tenant = ?1 AND memory_id = ?2",
            params![guard.tenant(), memory_id],
        )?;
        Ok(affected)
    }

    fn missing_embeddings(
        &self,
        ctx: &TenantContext,
        models: &[String],
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        let guard = self.read_guard(ctx)?;
        let mut pairs = Vec::new();
        for model in models {
            let mut stmt = guard.conn().prepare(
                "SELECT m.id FROM memories m
                 LEFT JOIN memory_embeddings e
                   ON e.tenant = m.tenant AND e.memory_id = m.id AND e.model_name = ?1
                 WHERE m.tenant = ?2 AND m.staged = 0
                   AND (e.memory_id IS NULL OR e.stale = 1 OR e.content_hash <> m.content_hash)
                 LIMIT ?3",
            )?;
            let ids: Vec<String> = stmt
                .query_map(params![model, guard.tenant(), limit as i64], |row| {
                    row.get(0)
                })?
                .collect::<rusqlite::Result<_>>()?;
            for id in ids {
                pairs.push((id, model.clone()));
            }
        }
        Ok(pairs)
    }
}

// ============================================================================
// GRAPH STORE
// ============================================================================

impl GraphStore for SqliteStore {
    fn capabilities(&self) -> Capabilities {
        Self::base_capabilities()
    }

    fn upsert_node(&self, ctx: &TenantContext, node: &SemanticNode) -> Result<()> {
        ctx.assert_owns(&node.tenant, "semantic node")?;
        let guard = self.write_guard(ctx)?;
        // The uniqueness constraint lives on lower(label), an expression
        // index, which upsert conflict targets cannot name; resolve manually.
        let existing: Option<String> = guard
            .conn()
            .query_row(
                "SELECT id FROM semantic_nodes WHERE tenant = ?1 AND lower(label) = lower(?2)",
                params![guard.tenant(), node.label],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                guard.conn().execute(
                    "UPDATE semantic_nodes SET node_type = ?1 WHERE tenant = ?2 AND id = ?3",
                    params![node.node_type, guard.tenant(), id],
                )?;
            }
            None => {
                guard.conn().execute(
                    "INSERT INTO semantic_nodes (tenant, id, label, node_type, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        guard.tenant(),
                        node.id,
                        node.label,
                        node.node_type,
                        node.created_at,
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn get_node(&self, ctx: &TenantContext, id: &str) -> Result<Option<SemanticNode>> {
        let guard = self.read_guard(ctx)?;
        let node = guard
            .conn()
            .query_row(
                "SELECT id, label, node_type, created_at FROM semantic_nodes
                 WHERE tenant = ?1 AND id = ?2",
                params![guard.tenant(), id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(node.map(|(id, label, node_type, created_at)| SemanticNode {
            id,
            tenant: ctx.tenant().clone(),
            label,
            node_type,
            created_at,
        }))
    }

    fn node_by_label(&self, ctx: &TenantContext, label: &str) -> Result<Option<SemanticNode>> {
        let guard = self.read_guard(ctx)?;
        let node = guard
            .conn()
            .query_row(
                "SELECT id, label, node_type, created_at FROM semantic_nodes
                 WHERE tenant = ?1 AND lower(label) = lower(?2)",
                params![guard.tenant(), label],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(node.map(|(id, label, node_type, created_at)| SemanticNode {
            id,
            tenant: ctx.tenant().clone(),
            label,
            node_type,
            created_at,
        }))
    }

    fn link_mention(&self, ctx: &TenantContext, node_id: &str, record_id: &str) -> Result<()> {
        let guard = self.write_guard(ctx)?;
        guard.conn().execute(
            "INSERT OR IGNORE INTO node_mentions (tenant, node_id, record_id) VALUES (?1, ?2, ?3)",
            params![guard.tenant(), node_id, record_id],
        )?;
        Ok(())
    }

    fn upsert_edge(&self, ctx: &TenantContext, edge: &GraphEdge) -> Result<()> {
        ctx.assert_owns(&edge.tenant, "graph edge")?;
        edge.validate()
            .map_err(|_| CoreError::InvalidRecord(format!("edge {} confidence out of range", edge.id)))?;
        let guard = self.write_guard(ctx)?;
        guard.conn().execute(
            "INSERT INTO graph_edges (tenant, id, src, predicate, dst, confidence, \
                 corroborations, provenance, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(tenant, src, predicate, dst) DO UPDATE SET
                 confidence = excluded.confidence,
                 corroborations = excluded.corroborations,
                 provenance = excluded.provenance,
                 updated_at = excluded.updated_at",
            params![
                guard.tenant(),
                edge.id,
                edge.src,
                edge.predicate,
                edge.dst,
                edge.confidence,
                edge.corroborations,
                serde_json::to_string(&edge.provenance)?,
                edge.created_at,
                edge.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_edge(
        &self,
        ctx: &TenantContext,
        src: &str,
        predicate: &str,
        dst: &str,
    ) -> Result<Option<GraphEdge>> {
        let guard = self.read_guard(ctx)?;
        let row = guard
            .conn()
            .query_row(
                "SELECT id, confidence, corroborations, provenance, created_at, updated_at
                 FROM graph_edges
                 WHERE tenant = ?1 AND src = ?2 AND predicate = ?3 AND dst = ?4",
                params![guard.tenant(), src, predicate, dst],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, DateTime<Utc>>(4)?,
                        row.get::<_, DateTime<Utc>>(5)?,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(id, confidence, corroborations, provenance, created_at, updated_at)| {
                let edge = GraphEdge {
                    id,
                    tenant: ctx.tenant().clone(),
                    src: src.to_string(),
                    predicate: predicate.to_string(),
                    dst: dst.to_string(),
                    confidence,
                    corroborations,
                    provenance: serde_json::from_str(&provenance)?,
                    created_at,
                    updated_at,
                };
                edge.validate()?;
                Ok(edge)
            },
        )
        .transpose()
    }

    fn edges_from(&self, ctx: &TenantContext, node_id: &str) -> Result<Vec<GraphEdge>> {
        let guard = self.read_guard(ctx)?;
        let mut stmt = guard.conn().prepare(
            "SELECT id, src, predicate, dst, confidence, corroborations, provenance, \
                 created_at, updated_at
             FROM graph_edges WHERE tenant = ?1 AND src = ?2",
        )?;
        let rows: Vec<(
            String,
            String,
            String,
            String,
            f64,
            i64,
            String,
            DateTime<Utc>,
            DateTime<Utc>,
        )> = stmt
            .query_map(params![guard.tenant(), node_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let mut edges = Vec::with_capacity(rows.len());
        for (id, src, predicate, dst, confidence, corroborations, provenance, created_at, updated_at) in
            rows
        {
            let edge = GraphEdge {
                id,
                tenant: ctx.tenant().clone(),
                src,
                predicate,
                dst,
                confidence,
                corroborations,
                provenance: serde_json::from_str(&provenance)?,
                created_at,
                updated_at,
            };
            edge.validate()?;
            edges.push(edge);
        }
        Ok(edges)
    }

    fn records_for_node(&self, ctx: &TenantContext, node_id: &str) -> Result<Vec<String>> {
        let guard = self.read_guard(ctx)?;
        let mut stmt = guard.conn().prepare(
            "SELECT record_id FROM node_mentions WHERE tenant = ?1 AND node_id = ?2",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![guard.tenant(), node_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    fn nodes_for_record(&self, ctx: &TenantContext, record_id: &str) -> Result<Vec<SemanticNode>> {
        let guard = self.read_guard(ctx)?;
        let mut stmt = guard.conn().prepare(
            "SELECT n.id, n.label, n.node_type, n.created_at
             FROM node_mentions m
             JOIN semantic_nodes n ON n.tenant = m.tenant AND n.id = m.node_id
             WHERE m.tenant = ?1 AND m.record_id = ?2",
        )?;
        let nodes: Vec<SemanticNode> = stmt
            .query_map(params![guard.tenant(), record_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, DateTime<Utc>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|(id, label, node_type, created_at)| SemanticNode {
                id,
                tenant: ctx.tenant().clone(),
                label,
                node_type,
                created_at,
            })
            .collect();
        Ok(nodes)
    }

    fn delete_node_cascade(&self, ctx: &TenantContext, node_id: &str) -> Result<()> {
        let guard = self.write_guard(ctx)?;
        guard.conn().execute(
            "DELETE FROM graph_edges WHERE tenant = ?1 AND (src = ?2 OR dst = ?2)",
            params![guard.tenant(), node_id],
        )?;
        guard.conn().execute(
            "DELETE FROM node_mentions WHERE tenant = ?1 AND node_id = ?2",
            params![guard.tenant(), node_id],
        )?;
        guard.conn().execute(
            "DELETE FROM semantic_nodes WHERE tenant = ?1 AND id = ?2",
            params![guard.tenant(), node_id],
        )?;
        Ok(())
    }

    fn prune_edges_below(&self, ctx: &TenantContext, floor: f64) -> Result<usize> {
        let guard = self.write_guard(ctx)?;
        let affected = guard.conn().execute(
            "DELETE FROM graph_edges WHERE tenant = ?1 AND confidence < ?2",
            params![guard.tenant(), floor],
        )?;
        Ok(affected)
    }

    fn remove_record_provenance(
        &self,
        ctx: &TenantContext,
        record_id: &str,
    ) -> Result<GraphCascade> {
        let mut cascade = GraphCascade::default();

        // Edges citing the record: detach or delete when it was sole provenance.
        let touched_edges: Vec<(String, String, String, String)> = {
            let guard = self.read_guard(ctx)?;
            let mut stmt = guard.conn().prepare(
                "SELECT src, predicate, dst, provenance FROM graph_edges
                 WHERE tenant = ?1 AND provenance LIKE ?2",
            )?;
            let rows = stmt
                .query_map(
                    params![guard.tenant(), format!("%\"{record_id}\"%")],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        {
            let guard = self.write_guard(ctx)?;
            for (src, predicate, dst, provenance_json) in touched_edges {
                let mut provenance: Vec<String> = serde_json::from_str(&provenance_json)?;
                let before = provenance.len();
                provenance.retain(|p| p != record_id);
                if provenance.len() == before {
                    continue;
                }
                if provenance.is_empty() {
                    guard.conn().execute(
                        "DELETE FROM graph_edges
                         WHERE tenant = ?1 AND src = ?2 AND predicate = ?3 AND dst = ?4",
                        params![guard.tenant(), src, predicate, dst],
                    )?;
                    cascade.edges_removed += 1;
                } else {
                    guard.conn().execute(
                        "UPDATE graph_edges SET provenance = ?1
                         WHERE tenant = ?2 AND src = ?3 AND predicate = ?4 AND dst = ?5",
                        params![
                            serde_json::to_string(&provenance)?,
                            guard.tenant(),
                            src,
                            predicate,
                            dst
                        ],
                    )?;
                    cascade.provenance_detached += 1;
                }
            }
        }

        // Mentions: unlink, then drop nodes left with no mentions and no edges.
        let affected_nodes: Vec<String> = {
            let guard = self.read_guard(ctx)?;
            let mut stmt = guard.conn().prepare(
                "SELECT node_id FROM node_mentions WHERE tenant = ?1 AND record_id = ?2",
            )?;
            let rows = stmt
                .query_map(params![guard.tenant(), record_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let guard = self.write_guard(ctx)?;
        guard.conn().execute(
            "DELETE FROM node_mentions WHERE tenant = ?1 AND record_id = ?2",
            params![guard.tenant(), record_id],
        )?;
        for node_id in affected_nodes {
            let mentions: i64 = guard.conn().query_row(
                "SELECT COUNT(*) FROM node_mentions WHERE tenant = ?1 AND node_id = ?2",
                params![guard.tenant(), node_id],
                |row| row.get(0),
            )?;
            let edges: i64 = guard.conn().query_row(
                "SELECT COUNT(*) FROM graph_edges WHERE tenant = ?1 AND (src = ?2 OR dst = ?2)",
                params![guard.tenant(), node_id],
                |row| row.get(0),
            )?;
            if mentions == 0 && edges == 0 {
                guard.conn().execute(
                    "DELETE FROM semantic_nodes WHERE tenant = ?1 AND id = ?2",
                    params![guard.tenant(), node_id],
                )?;
                cascade.nodes_removed += 1;
            }
        }
        Ok(cascade)
    }

    fn graph_counts(&self, ctx: &TenantContext) -> Result<(i64, i64)> {
        let guard = self.read_guard(ctx)?;
        let nodes: i64 = guard.conn().query_row(
            "SELECT COUNT(*) FROM semantic_nodes WHERE tenant = ?1",
            params![guard.tenant()],
            |row| row.get(0),
        )?;
        let edges: i64 = guard.conn().query_row(
            "SELECT COUNT(*) FROM graph_edges WHERE tenant = ?1",
            params![guard.tenant()],
            |row| row.get(0),
        )?;
        Ok((nodes, edges))
    }
}

// ============================================================================
// BLOB STORE
// ============================================================================

impl BlobStore for SqliteStore {
    fn put_blob(&self, ctx: &TenantContext, key: &str, bytes: &[u8]) -> Result<()> {
        let guard = self.write_guard(ctx)?;
        guard.conn().execute(
            "INSERT OR REPLACE INTO blobs (tenant, key, bytes, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![guard.tenant(), key, bytes, Utc::now()],
        )?;
        Ok(())
    }

    fn get_blob(&self, ctx: &TenantContext, key: &str) -> Result<Option<Vec<u8>>> {
        let guard = self.read_guard(ctx)?;
        let bytes = guard
            .conn()
            .query_row(
                "SELECT bytes FROM blobs WHERE tenant = ?1 AND key = ?2",
                params![guard.tenant(), key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes)
    }

    fn delete_blob(&self, ctx: &TenantContext, key: &str) -> Result<bool> {
        let guard = self.write_guard(ctx)?;
        let affected = guard.conn().execute(
            "DELETE FROM blobs WHERE tenant = ?1 AND key = ?2",
            params![guard.tenant(), key],
        )?;
        Ok(affected > 0)
    }
}

// ============================================================================
// AUDIT STORE
// ============================================================================

impl AuditStore for SqliteStore {
    fn append_event(&self, event: &AuditEvent) -> Result<()> {
        let inner = self
            .writer
            .lock()
            .map_err(|_| CoreError::Init("connection lock poisoned".into()))?;
        // Audit appends run outside any request tenant marker; the event
        // carries its tenant explicitly and rows are never updated.
        inner.conn.execute(
            "INSERT INTO audit_events (event_id, tenant, day, timestamp, actor, request_id, \
                 operation, info_class, outcome, latency_ms, cost_usd, detail, critical)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                event.event_id,
                event.tenant.as_str(),
                event.timestamp.format("%Y-%m-%d").to_string(),
                event.timestamp,
                event.actor,
                event.request_id,
                event.operation,
                event.info_class.map(|c| c.as_str()),
                event.outcome.as_str(),
                event.latency_ms.map(|v| v as i64),
                event.cost_usd,
                serde_json::to_string(&event.detail)?,
                event.critical,
            ],
        )?;
        Ok(())
    }

    fn events_for(
        &self,
        ctx: &TenantContext,
        operation: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        let guard = self.read_guard(ctx)?;
        let mut sql = String::from(
            "SELECT event_id, tenant, timestamp, actor, request_id, operation, info_class, \
                 outcome, latency_ms, cost_usd, detail, critical
             FROM audit_events WHERE tenant = ?",
        );
        let mut values: Vec<Value> = vec![Value::Text(guard.tenant().to_string())];
        if let Some(op) = operation {
            sql.push_str(" AND operation = ?");
            values.push(Value::Text(op.to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
        values.push(Value::Integer(limit as i64));

        let mut stmt = guard.conn().prepare(&sql)?;
        let rows: Vec<(
            String,
            String,
            DateTime<Utc>,
            String,
            String,
            String,
            Option<String>,
            String,
            Option<i64>,
            Option<f64>,
            Option<String>,
            bool,
        )> = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let mut events = Vec::with_capacity(rows.len());
        for (
            event_id,
            tenant,
            timestamp,
            actor,
            request_id,
            operation,
            info_class,
            outcome,
            latency_ms,
            cost_usd,
            detail,
            critical,
        ) in rows
        {
            events.push(AuditEvent {
                event_id,
                timestamp,
                tenant: TenantId::from(tenant),
                actor,
                request_id,
                operation,
                info_class: info_class.map(|c| InfoClass::parse_name(&c)).transpose()?,
                outcome: match outcome.as_str() {
                    "ok" => AuditOutcome::Ok,
                    "denied" => AuditOutcome::Denied,
                    "deferred" => AuditOutcome::Deferred,
                    "partial" => AuditOutcome::Partial,
                    _ => AuditOutcome::Error,
                },
                latency_ms: latency_ms.map(|v| v as u64),
                cost_usd,
                detail: detail
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?
                    .unwrap_or(serde_json::Value::Null),
                critical,
            });
        }
        Ok(events)
    }

    fn count_events(&self, ctx: &TenantContext, since: Option<DateTime<Utc>>) -> Result<i64> {
        let guard = self.read_guard(ctx)?;
        let count = match since {
            Some(since) => guard.conn().query_row(
                "SELECT COUNT(*) FROM audit_events WHERE tenant = ?1 AND timestamp >= ?2",
                params![guard.tenant(), since],
                |row| row.get(0),
            )?,
            None => guard.conn().query_row(
                "SELECT COUNT(*) FROM audit_events WHERE tenant = ?1",
                params![guard.tenant()],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecordDraft;
    use crate::tenant::TenantRegistry;
    use tempfile::TempDir;

    fn store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(Some(dir.path().join("test.db"))).unwrap();
        (dir, store)
    }

    fn ctx(tenant: &str) -> TenantContext {
        TenantRegistry::new().context(tenant, "tester")
    }

    fn record(ctx: &TenantContext, content: &str) -> MemoryRecord {
        RecordDraft::new(content)
            .into_record(ctx.tenant().clone(), Utc::now())
            .unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = store();
        let ctx = ctx("t1");
        let rec = record(&ctx, "postgres hot spare replication lag");
        store.put(&ctx, &rec).unwrap();

        let loaded = store.get(&ctx, &rec.id).unwrap().unwrap();
        assert_eq!(loaded.content, rec.content);
        assert_eq!(loaded.content_hash, rec.content_hash);
        assert_eq!(loaded.layer, rec.layer);
    }

    #[test]
    fn tenants_cannot_see_each_other() {
        let (_dir, store) = store();
        let ctx1 = ctx("t1");
        let ctx2 = ctx("t2");
        let rec = record(&ctx1, "alpha");
        store.put(&ctx1, &rec).unwrap();

        assert!(store.get(&ctx2, &rec.id).unwrap().is_none());
        assert!(
            store
                .lexical_search(&ctx2, "alpha", 10)
                .unwrap()
                .is_empty()
        );
        let page = store.query(&ctx2, &RecordFilter::default()).unwrap();
        assert!(page.items.is_empty());
    }

    #[test]
    fn put_rejects_foreign_tenant_record() {
        let (_dir, store) = store();
        let ctx1 = ctx("t1");
        let ctx2 = ctx("t2");
        let rec = record(&ctx1, "alpha");
        assert!(matches!(
            store.put(&ctx2, &rec),
            Err(CoreError::TenantMismatch { .. })
        ));
    }

    #[test]
    fn lexical_search_ranks_by_bm25() {
        let (_dir, store) = store();
        let ctx = ctx("t1");
        let r1 = record(&ctx, "postgres hot spare replication lag");
        let r2 = record(&ctx, "hot water pipe leak under the spare sink");
        let r3 = record(&ctx, "replication lag alert from monitoring");
        for r in [&r1, &r2, &r3] {
            store.put(&ctx, r).unwrap();
        }

        let hits = store.lexical_search(&ctx, "replication lag", 10).unwrap();
        assert!(hits.len() >= 2);
        let top2: Vec<&String> = hits.iter().take(2).map(|(id, _)| id).collect();
        assert!(top2.contains(&&r1.id));
        assert!(top2.contains(&&r3.id));
    }

    #[test]
    fn delete_cascades_embeddings() {
        let (_dir, store) = store();
        let ctx = ctx("t1");
        let rec = record(&ctx, "something worth embedding");
        store.put(&ctx, &rec).unwrap();
        store
            .put_embedding(
                &ctx,
                &EmbeddingRecord {
                    tenant: ctx.tenant().clone(),
                    memory_id: rec.id.clone(),
                    model: "m1".into(),
                    dim: 3,
                    vector: vec![0.1, 0.2, 0.3],
                    content_hash: rec.content_hash.clone(),
                    created_at: Utc::now(),
                    stale: false,
                },
            )
            .unwrap();
        assert!(store.get_embedding(&ctx, &rec.id, "m1").unwrap().is_some());

        assert!(store.delete(&ctx, &rec.id).unwrap());
        assert!(store.get(&ctx, &rec.id).unwrap().is_none());
        assert!(store.get_embedding(&ctx, &rec.id, "m1").unwrap().is_none());
    }

    #[test]
    fn query_filters_and_pages() {
        let (_dir, store) = store();
        let ctx = ctx("t1");
        for i in 0..5 {
            let mut rec = record(&ctx, &format!("note {i}"));
            rec.layer = Layer::Working;
            rec.tags = vec!["deploy".into()];
            rec.importance = 0.2 + 0.1 * i as f64;
            store.put(&ctx, &rec).unwrap();
        }

        let filter = RecordFilter {
            layers: Some(vec![Layer::Working]),
            any_tags: vec!["deploy".into()],
            min_importance: Some(0.4),
            limit: 2,
            ..Default::default()
        };
        let page1 = store.query(&ctx, &filter).unwrap();
        assert_eq!(page1.items.len(), 2);
        assert!(page1.next_cursor.is_some());

        let filter2 = RecordFilter {
            cursor: page1.next_cursor.clone(),
            ..filter
        };
        let page2 = store.query(&ctx, &filter2).unwrap();
        assert!(!page2.items.is_empty());
        for item in page1.items.iter().chain(page2.items.iter()) {
            assert!(item.importance >= 0.4);
        }
    }

    #[test]
    fn staged_records_hidden_until_commit() {
        let (_dir, store) = store();
        let ctx = ctx("t1");
        let mut rec = record(&ctx, "staged consolidation output");
        rec.staged = true;
        store.put(&ctx, &rec).unwrap();

        let page = store.query(&ctx, &RecordFilter::default()).unwrap();
        assert!(page.items.is_empty());

        store.commit_staged(&ctx, &rec.id).unwrap();
        let page = store.query(&ctx, &RecordFilter::default()).unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn missing_embeddings_reports_gaps() {
        let (_dir, store) = store();
        let ctx = ctx("t1");
        let rec = record(&ctx, "unembedded");
        store.put(&ctx, &rec).unwrap();

        let missing = store
            .missing_embeddings(&ctx, &["m1".to_string()], 10)
            .unwrap();
        assert_eq!(missing, vec![(rec.id.clone(), "m1".to_string())]);
    }

    #[test]
    fn graph_roundtrip_and_cascade() {
        let (_dir, store) = store();
        let ctx = ctx("t1");
        let rec = record(&ctx, "observed relation");
        store.put(&ctx, &rec).unwrap();

        let a = SemanticNode::new(ctx.tenant().clone(), "Postgres", "service");
        let b = SemanticNode::new(ctx.tenant().clone(), "Replica", "service");
        store.upsert_node(&ctx, &a).unwrap();
        store.upsert_node(&ctx, &b).unwrap();
        store.link_mention(&ctx, &a.id, &rec.id).unwrap();

        let edge = GraphEdge {
            id: "e1".into(),
            tenant: ctx.tenant().clone(),
            src: a.id.clone(),
            predicate: "replicates_to".into(),
            dst: b.id.clone(),
            confidence: 0.8,
            corroborations: 1,
            provenance: vec![rec.id.clone()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_edge(&ctx, &edge).unwrap();

        assert_eq!(store.records_for_node(&ctx, &a.id).unwrap(), vec![rec.id.clone()]);
        assert!(store.node_by_label(&ctx, "postgres").unwrap().is_some());

        let cascade = store.remove_record_provenance(&ctx, &rec.id).unwrap();
        assert_eq!(cascade.edges_removed, 1);
        // Node a lost its only mention and its only edge.
        assert!(store.get_node(&ctx, &a.id).unwrap().is_none());
    }

    #[test]
    fn audit_append_and_readback() {
        let (_dir, store) = store();
        let ctx = ctx("t1");
        let event = AuditEvent::of(&ctx, "store_memory").latency(2);
        store.append_event(&event).unwrap();

        let events = store.events_for(&ctx, Some("store_memory"), 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, "store_memory");
        assert_eq!(events[0].latency_ms, Some(2));
    }
}

//! Storage abstraction - backend contracts the core consumes
//!
//! Each backend is tenant-aware, returns typed errors, and publishes a
//! capability matrix. The engine consults capabilities at query-planning time
//! to choose strategies; business logic never branches on a concrete backend.

mod cache;
mod memory_store;
mod migrations;
mod sqlite;

pub use cache::{Cache, CacheKey, TenantCache};
pub use memory_store::InMemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditEvent;
use crate::error::Result;
use crate::graph::{GraphCascade, GraphEdge, SemanticNode};
use crate::memory::{EmbeddingRecord, InfoClass, Layer, MemoryRecord, RecordUpdate};
use crate::tenant::TenantContext;

// ============================================================================
// CAPABILITY MATRIX
// ============================================================================

/// Published per backend; consulted by the engine when planning queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Approximate-nearest-neighbor search available
    pub vector_search: bool,
    /// Backend-native full-text scoring (BM25 or similar)
    pub full_text: bool,
    /// Multi-statement transactions
    pub transactions: bool,
    /// Session-scoped tenant marker honored on every query
    pub session_tenant_marker: bool,
    /// Native TTL expiry
    pub ttl: bool,
    /// Bounded traversal runs inside the backend
    pub atomic_graph_traverse: bool,
}

// ============================================================================
// FILTERS & PAGING
// ============================================================================

/// Predicate for `RecordStore::query`. All clauses are conjunctive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordFilter {
    /// Restrict to these layers
    pub layers: Option<Vec<Layer>>,
    /// Match records carrying at least one of these tags
    pub any_tags: Vec<String>,
    /// Minimum importance, inclusive
    pub min_importance: Option<f64>,
    /// Maximum importance, inclusive
    pub max_importance: Option<f64>,
    /// Created at or after
    pub created_after: Option<DateTime<Utc>>,
    /// Created at or before
    pub created_before: Option<DateTime<Utc>>,
    /// Highest information class to return
    pub info_class_at_most: Option<InfoClass>,
    /// Include staged (uncommitted consolidation) records
    pub include_staged: bool,
    /// Page size
    pub limit: usize,
    /// Continuation cursor from a previous page
    pub cursor: Option<String>,
}

impl RecordFilter {
    /// Filter over one layer with a page size.
    pub fn layer(layer: Layer, limit: usize) -> Self {
        Self {
            layers: Some(vec![layer]),
            limit,
            ..Default::default()
        }
    }
}

/// One page of ordered results plus the continuation cursor.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The items, newest first
    pub items: Vec<T>,
    /// Cursor for the next page, `None` when exhausted
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// Empty page.
    pub fn empty() -> Self {
        Self {
            items: vec![],
            next_cursor: None,
        }
    }
}

// ============================================================================
// RECORD STORE
// ============================================================================

/// Persistence contract for memory records and their embedding projections.
///
/// Implementations must support a session-scoped current-tenant marker such
/// that queries without an explicit tenant predicate still return only the
/// current tenant's rows. Backends that cannot honor the marker must refuse
/// to register as tenant-capable.
pub trait RecordStore: Send + Sync {
    /// Capability matrix for this backend.
    fn capabilities(&self) -> Capabilities;

    /// Persist a record.
    fn put(&self, ctx: &TenantContext, record: &MemoryRecord) -> Result<()>;

    /// Fetch by id within the context tenant.
    fn get(&self, ctx: &TenantContext, id: &str) -> Result<Option<MemoryRecord>>;

    /// Delete by id; embeddings cascade. Returns whether a row existed.
    fn delete(&self, ctx: &TenantContext, id: &str) -> Result<bool>;

    /// Ordered, cursored query.
    fn query(&self, ctx: &TenantContext, filter: &RecordFilter) -> Result<Page<MemoryRecord>>;

    /// Backend-native full-text scoring. Only valid when `full_text` is
    /// published; the engine falls back to in-memory lexical scoring
    /// otherwise.
    fn lexical_search(
        &self,
        ctx: &TenantContext,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f64)>>;

    /// Apply a restricted-field mutation, returning the updated record.
    fn apply_update(
        &self,
        ctx: &TenantContext,
        id: &str,
        update: &RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<MemoryRecord>;

    /// Decay-cycle write: new importance plus the decay stamp.
    fn apply_decay(
        &self,
        ctx: &TenantContext,
        id: &str,
        importance: f64,
        decayed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Flip a staged consolidation output to committed.
    fn commit_staged(&self, ctx: &TenantContext, id: &str) -> Result<()>;

    /// Reconciliation sweep: drop staged records older than the horizon.
    fn prune_stale_staged(&self, ctx: &TenantContext, older_than: DateTime<Utc>) -> Result<usize>;

    /// Dedup probe: a live record with this content hash (and source, when
    /// given) created at or after `since`.
    fn find_by_hash(
        &self,
        ctx: &TenantContext,
        content_hash: &str,
        source: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<String>>;

    /// Newest created-at the tenant has written; writes older than this minus
    /// the skew tolerance are rejected upstream.
    fn highwater(&self, ctx: &TenantContext) -> Result<Option<DateTime<Utc>>>;

    // ---- embedding projections ----

    /// Store or replace the `(memory, model)` projection.
    fn put_embedding(&self, ctx: &TenantContext, embedding: &EmbeddingRecord) -> Result<()>;

    /// Fetch one projection.
    fn get_embedding(
        &self,
        ctx: &TenantContext,
        memory_id: &str,
        model: &str,
    ) -> Result<Option<EmbeddingRecord>>;

    /// All projections of one record.
    fn embeddings_for(&self, ctx: &TenantContext, memory_id: &str)
    -> Result<Vec<EmbeddingRecord>>;

    /// Mark every projection of a record stale.
    fn mark_embeddings_stale(&self, ctx: &TenantContext, memory_id: &str) -> Result<usize>;

    /// Records missing a live projection under any of `models`, for the
    /// reconciliation sweep. Returns `(memory_id, model)` pairs.
    fn missing_embeddings(
        &self,
        ctx: &TenantContext,
        models: &[String],
        limit: usize,
    ) -> Result<Vec<(String, String)>>;
}

// ============================================================================
// GRAPH STORE
// ============================================================================

/// Persistence contract for typed semantic nodes and directed edges.
pub trait GraphStore: Send + Sync {
    /// Capability matrix for this backend.
    fn capabilities(&self) -> Capabilities;

    /// Insert or update a node.
    fn upsert_node(&self, ctx: &TenantContext, node: &SemanticNode) -> Result<()>;

    /// Fetch a node by id.
    fn get_node(&self, ctx: &TenantContext, id: &str) -> Result<Option<SemanticNode>>;

    /// Look up a node by canonical label (case-insensitive).
    fn node_by_label(&self, ctx: &TenantContext, label: &str) -> Result<Option<SemanticNode>>;

    /// Attach a record mention to a node.
    fn link_mention(&self, ctx: &TenantContext, node_id: &str, record_id: &str) -> Result<()>;

    /// Insert or replace an edge (keyed by src, predicate, dst).
    fn upsert_edge(&self, ctx: &TenantContext, edge: &GraphEdge) -> Result<()>;

    /// Fetch an edge by its key.
    fn get_edge(
        &self,
        ctx: &TenantContext,
        src: &str,
        predicate: &str,
        dst: &str,
    ) -> Result<Option<GraphEdge>>;

    /// Outgoing edges of a node.
    fn edges_from(&self, ctx: &TenantContext, node_id: &str) -> Result<Vec<GraphEdge>>;

    /// Record ids that mention a node.
    fn records_for_node(&self, ctx: &TenantContext, node_id: &str) -> Result<Vec<String>>;

    /// Nodes mentioned by a record.
    fn nodes_for_record(&self, ctx: &TenantContext, record_id: &str) -> Result<Vec<SemanticNode>>;

    /// Delete a node together with its edges and mention links.
    fn delete_node_cascade(&self, ctx: &TenantContext, node_id: &str) -> Result<()>;

    /// Drop edges below the confidence floor. Returns how many went.
    fn prune_edges_below(&self, ctx: &TenantContext, floor: f64) -> Result<usize>;

    /// Remove a deleted record from all provenance lists, deleting edges and
    /// nodes whose sole provenance it was.
    fn remove_record_provenance(
        &self,
        ctx: &TenantContext,
        record_id: &str,
    ) -> Result<GraphCascade>;

    /// Node/edge totals for stats.
    fn graph_counts(&self, ctx: &TenantContext) -> Result<(i64, i64)>;
}

// ============================================================================
// BLOB STORE
// ============================================================================

/// Large artifacts produced by summarization and dreaming.
pub trait BlobStore: Send + Sync {
    /// Store a blob under a tenant-scoped key.
    fn put_blob(&self, ctx: &TenantContext, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch a blob.
    fn get_blob(&self, ctx: &TenantContext, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a blob. Returns whether it existed.
    fn delete_blob(&self, ctx: &TenantContext, key: &str) -> Result<bool>;
}

// ============================================================================
// AUDIT STORE
// ============================================================================

/// Append-only sink for audit events, partitioned by tenant and date.
pub trait AuditStore: Send + Sync {
    /// Append one event. Must never mutate existing rows.
    fn append_event(&self, event: &AuditEvent) -> Result<()>;

    /// Read back a tenant's events, optionally filtered by operation. Test
    /// and compliance surface; newest first.
    fn events_for(
        &self,
        ctx: &TenantContext,
        operation: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>>;

    /// Number of events recorded for the tenant, optionally since a cutoff.
    fn count_events(&self, ctx: &TenantContext, since: Option<DateTime<Utc>>) -> Result<i64>;
}

//! Memory record service
//!
//! The write path: policy classification and scrubbing, layer resolution,
//! timestamp monotonicity, content-hash deduplication, persistence,
//! asynchronous embedding fan-out, and graph extraction — each write audited.
//! Partial-write durability: a record is valid without its embeddings, and a
//! reconciliation sweep retries the gaps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditOutcome, AuditPipeline};
use crate::error::{CoreError, Result};
use crate::graph::GraphService;
use crate::layers::admits_working;
use crate::llm::LlmGateway;
use crate::memory::{
    EmbeddingRecord, InfoClass, Layer, MemoryRecord, RecordDraft, RecordUpdate, content_hash,
};
use crate::policy::{PolicyGuard, StoreDecision};
use crate::search::VectorCatalog;
use crate::storage::{Cache, CacheKey, Page, RecordFilter, RecordStore, TenantCache};
use crate::tenant::{DuplicatePolicy, TenantContext};

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Outcome of a store call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOutcome {
    /// Id of the stored (or deduplicated) record
    pub id: String,
    /// The call hit the deduplication window
    pub deduplicated: bool,
    /// Layer the record landed in
    pub layer: Layer,
    /// Final information class after policy
    pub info_class: InfoClass,
}

/// Report from the embedding reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingSweep {
    /// Gaps the sweep attempted
    pub attempted: usize,
    /// Successfully embedded
    pub embedded: usize,
    /// Failed (left for the next sweep)
    pub failed: usize,
}

/// Scope selector for `get_stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum StatsScope {
    /// Everything the tenant owns
    #[default]
    Tenant,
    /// Records carrying the project's tag
    Project(String),
}

/// Usage snapshot returned by `get_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    /// Total live records in scope
    pub total_records: i64,
    /// Records per layer
    pub by_layer: HashMap<String, i64>,
    /// Semantic node count (tenant-wide; graph artifacts carry no project)
    pub semantic_nodes: i64,
    /// Graph edge count (tenant-wide)
    pub graph_edges: i64,
    /// Records in scope with at least one live embedding projection
    pub records_with_embeddings: i64,
    /// Missing or stale `(record, model)` projections across the scope
    pub embedding_gaps: i64,
    /// Audit events recorded for the tenant (within the window, when set)
    pub audit_events: i64,
}

// ============================================================================
// SERVICE
// ============================================================================

/// Tenant-scoped record operations over the storage backends.
pub struct MemoryService {
    records: Arc<dyn RecordStore>,
    graph: Arc<GraphService>,
    vectors: Arc<VectorCatalog>,
    gateway: Arc<LlmGateway>,
    policy: Arc<PolicyGuard>,
    audit: Arc<AuditPipeline>,
    cache: Arc<TenantCache>,
}

impl MemoryService {
    /// Wire the service.
    pub fn new(
        records: Arc<dyn RecordStore>,
        graph: Arc<GraphService>,
        vectors: Arc<VectorCatalog>,
        gateway: Arc<LlmGateway>,
        policy: Arc<PolicyGuard>,
        audit: Arc<AuditPipeline>,
        cache: Arc<TenantCache>,
    ) -> Self {
        Self {
            records,
            graph,
            vectors,
            gateway,
            policy,
            audit,
            cache,
        }
    }

    /// The record backend (shared with the engine and workers).
    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    // ------------------------------------------------------------------
    // store
    // ------------------------------------------------------------------

    /// Store a new memory.
    pub async fn store(&self, ctx: &TenantContext, draft: RecordDraft) -> Result<StoreOutcome> {
        let started = Instant::now();
        ctx.check_deadline()?;
        let config = ctx.config();
        let now = Utc::now();

        if draft.layer == Some(Layer::Reflective) {
            return Err(CoreError::BadLayer(
                "reflective records are produced by the reflection engine".into(),
            ));
        }

        // Policy guard first: classify and scrub before anything persists.
        let asserted = draft.info_class.unwrap_or_default();
        let decision = self
            .policy
            .classify(&draft.content, asserted, &config.policy);
        let (class, content, extra_tags) = match decision {
            StoreDecision::Reject { class, rule } => {
                self.audit.emit(
                    AuditEvent::of(ctx, "policy_event")
                        .outcome(AuditOutcome::Denied)
                        .info_class(class)
                        .detail(serde_json::json!({
                            "event": "restricted_detected",
                            "rule": rule,
                        }))
                        .critical(),
                );
                return Err(CoreError::RestrictedContent);
            }
            StoreDecision::Allow {
                class,
                content,
                extra_tags,
                ..
            } => (class, content, extra_tags),
        };

        // Layer resolution: honor an explicit request, otherwise admit into
        // working or park in sensory.
        let layer = match draft.layer {
            Some(requested) => requested,
            None if class == InfoClass::Restricted => Layer::Working,
            None => {
                let probe = MemoryRecord {
                    importance: draft.importance.unwrap_or(0.5),
                    tags: draft.tags.clone(),
                    ..RecordDraft::new(content.clone())
                        .into_record(ctx.tenant().clone(), now)?
                };
                if admits_working(&probe, &config.layers) {
                    Layer::Working
                } else {
                    Layer::Sensory
                }
            }
        };
        self.policy
            .check_layer(class, layer, false, &config.policy)
            .inspect_err(|_| {
                self.audit.emit(
                    AuditEvent::of(ctx, "policy_event")
                        .outcome(AuditOutcome::Denied)
                        .info_class(class)
                        .detail(serde_json::json!({
                            "event": "restricted_detected",
                            "layer": layer.as_str(),
                        }))
                        .critical(),
                );
            })?;

        // Timestamp monotonicity within the tenant.
        if let Some(requested_at) = draft.created_at {
            let skew = Duration::seconds(config.timestamp_skew_secs as i64);
            if let Some(highwater) = self.records.highwater(ctx)?
                && requested_at < highwater - skew
            {
                return Err(CoreError::InvalidRecord(format!(
                    "timestamp {requested_at} trails the tenant highwater beyond tolerance"
                )));
            }
        }

        // Deduplication window on (content, source).
        let hash = content_hash(&content);
        let since = now - Duration::seconds(config.dedup_window_secs as i64);
        let mut parents = vec![];
        if let Some(existing) =
            self.records
                .find_by_hash(ctx, &hash, draft.source.as_deref(), since)?
        {
            match config.duplicate_policy {
                DuplicatePolicy::SameId => {
                    self.audit.emit(
                        AuditEvent::of(ctx, "store_memory")
                            .info_class(class)
                            .latency(started.elapsed().as_millis() as u64)
                            .detail(serde_json::json!({
                                "deduplicated": true,
                                "id": existing,
                            })),
                    );
                    return Ok(StoreOutcome {
                        id: existing,
                        deduplicated: true,
                        layer,
                        info_class: class,
                    });
                }
                DuplicatePolicy::Linked => parents.push(existing),
            }
        }

        let mut record = RecordDraft {
            content,
            layer: Some(layer),
            tags: draft.tags,
            source: draft.source,
            importance: draft.importance,
            info_class: Some(class),
            created_at: draft.created_at,
        }
        .into_record(ctx.tenant().clone(), now)?;
        record.tags.extend(extra_tags);
        record.parents = parents;
        let duplicate_link = !record.parents.is_empty();

        self.records.put(ctx, &record)?;

        // Graph extraction stays below the confidential boundary.
        if class < InfoClass::Confidential
            && let Err(e) = self.graph.link_record_mentions(ctx, &record.id, &record.content)
        {
            tracing::warn!(error = %e, "graph extraction failed; record remains valid");
        }

        self.spawn_embedding_tasks(ctx, &record);

        self.audit.emit(
            AuditEvent::of(ctx, "store_memory")
                .info_class(class)
                .latency(started.elapsed().as_millis() as u64)
                .detail(serde_json::json!({
                    "id": record.id,
                    "layer": layer.as_str(),
                    "duplicateLink": duplicate_link,
                })),
        );
        Ok(StoreOutcome {
            id: record.id,
            deduplicated: false,
            layer,
            info_class: class,
        })
    }

    /// Request embeddings for every active model, off the critical path.
    fn spawn_embedding_tasks(&self, ctx: &TenantContext, record: &MemoryRecord) {
        let models: Vec<(String, usize)> = ctx
            .config()
            .active_models(None)
            .iter()
            .map(|m| (m.name.clone(), m.dim))
            .collect();
        if models.is_empty() {
            return;
        }
        let gateway = Arc::clone(&self.gateway);
        let records = Arc::clone(&self.records);
        let vectors = Arc::clone(&self.vectors);
        let ctx = ctx.clone();
        let record_id = record.id.clone();
        let content = record.content.clone();
        let hash = record.content_hash.clone();
        tokio::spawn(async move {
            for (model, dim) in models {
                match gateway.embed(&ctx, &model, &content).await {
                    Ok(vector) if vector.len() == dim => {
                        let embedding = EmbeddingRecord {
                            tenant: ctx.tenant().clone(),
                            memory_id: record_id.clone(),
                            model: model.clone(),
                            dim,
                            vector: vector.clone(),
                            content_hash: hash.clone(),
                            created_at: Utc::now(),
                            stale: false,
                        };
                        if let Err(e) = records.put_embedding(&ctx, &embedding) {
                            tracing::warn!(error = %e, model, "embedding persist failed");
                            continue;
                        }
                        if let Err(e) =
                            vectors.upsert(ctx.tenant(), &model, dim, &record_id, vector)
                        {
                            tracing::warn!(error = %e, model, "vector index update failed");
                        }
                    }
                    Ok(vector) => {
                        tracing::warn!(
                            model,
                            got = vector.len(),
                            want = dim,
                            "embedding dimension mismatch; skipping"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, model, "embedding generation failed; \
                             record remains valid, reconciliation will retry");
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // fetch / update / delete / list
    // ------------------------------------------------------------------

    /// Fetch by id, bumping the usage counter. `None` when absent (or owned
    /// by another tenant, which is indistinguishable by design).
    pub async fn fetch(&self, ctx: &TenantContext, id: &str) -> Result<Option<MemoryRecord>> {
        ctx.check_deadline()?;
        let Some(record) = self.records.get(ctx, id)? else {
            return Ok(None);
        };
        if !self.policy.visible_to(ctx, record.info_class) {
            return Err(CoreError::NotAuthorized(format!(
                "clearance below {}",
                record.info_class
            )));
        }
        let touched = self.records.apply_update(
            ctx,
            id,
            &RecordUpdate {
                touch_usage: true,
                ..Default::default()
            },
            Utc::now(),
        )?;
        Ok(Some(touched))
    }

    /// Apply a restricted-field mutation.
    pub async fn update(
        &self,
        ctx: &TenantContext,
        id: &str,
        update: RecordUpdate,
    ) -> Result<MemoryRecord> {
        ctx.check_deadline()?;
        if update.is_empty() {
            return Err(CoreError::InvalidRecord("empty update".into()));
        }
        if let Some(importance) = update.importance
            && !(0.0..=1.0).contains(&importance)
        {
            return Err(CoreError::InvalidRecord(format!(
                "importance {importance} outside [0,1]"
            )));
        }
        let current = self
            .records
            .get(ctx, id)?
            .ok_or_else(|| CoreError::InvalidRecord(format!("unknown memory {id}")))?;
        if let Some(new_class) = update.info_class
            && new_class > current.info_class
        {
            return Err(CoreError::InfoClassViolation(
                "information class may only be downgraded".into(),
            ));
        }

        let updated = self.records.apply_update(ctx, id, &update, Utc::now())?;
        self.audit.emit(
            AuditEvent::of(ctx, "update_memory")
                .info_class(updated.info_class)
                .detail(serde_json::json!({ "id": id })),
        );
        Ok(updated)
    }

    /// Delete with full cascade: embeddings, vector shards, graph artifacts
    /// whose sole provenance this record was, and cached derivatives. The
    /// deletion audit entry backs the right-to-be-forgotten flow.
    pub async fn delete(&self, ctx: &TenantContext, id: &str) -> Result<bool> {
        ctx.check_deadline()?;
        let Some(record) = self.records.get(ctx, id)? else {
            return Ok(false);
        };

        let cascade = self.graph.store().remove_record_provenance(ctx, id)?;
        self.vectors.remove_memory(ctx.tenant(), id)?;
        let existed = self.records.delete(ctx, id)?;
        self.cache
            .invalidate_prefix(&CacheKey::tenant_prefix(ctx.tenant()));

        self.audit.emit(
            AuditEvent::of(ctx, "delete_memory")
                .info_class(record.info_class)
                .detail(serde_json::json!({
                    "id": id,
                    "layer": record.layer.as_str(),
                    "edgesRemoved": cascade.edges_removed,
                    "nodesRemoved": cascade.nodes_removed,
                }))
                .critical(),
        );
        Ok(existed)
    }

    /// Filtered listing, capped at the caller's clearance.
    pub async fn list(
        &self,
        ctx: &TenantContext,
        mut filter: RecordFilter,
    ) -> Result<Page<MemoryRecord>> {
        ctx.check_deadline()?;
        let cap = ctx.clearance();
        filter.info_class_at_most = Some(
            filter
                .info_class_at_most
                .map_or(cap, |requested| requested.min(cap)),
        );
        self.records.query(ctx, &filter)
    }

    // ------------------------------------------------------------------
    // maintenance
    // ------------------------------------------------------------------

    /// Retry missing or stale embeddings for the tenant's active models.
    pub async fn reconcile_embeddings(
        &self,
        ctx: &TenantContext,
        limit: usize,
    ) -> Result<EmbeddingSweep> {
        let models: Vec<(String, usize)> = ctx
            .config()
            .active_models(None)
            .iter()
            .map(|m| (m.name.clone(), m.dim))
            .collect();
        let model_names: Vec<String> = models.iter().map(|(m, _)| m.clone()).collect();
        let gaps = self.records.missing_embeddings(ctx, &model_names, limit)?;

        let mut sweep = EmbeddingSweep {
            attempted: gaps.len(),
            ..Default::default()
        };
        for (memory_id, model) in gaps {
            let Some(record) = self.records.get(ctx, &memory_id)? else {
                continue;
            };
            let Some(dim) = models.iter().find(|(m, _)| *m == model).map(|(_, d)| *d) else {
                continue;
            };
            match self.gateway.embed(ctx, &model, &record.content).await {
                Ok(vector) if vector.len() == dim => {
                    let embedding = EmbeddingRecord {
                        tenant: ctx.tenant().clone(),
                        memory_id: memory_id.clone(),
                        model: model.clone(),
                        dim,
                        vector: vector.clone(),
                        content_hash: record.content_hash.clone(),
                        created_at: Utc::now(),
                        stale: false,
                    };
                    self.records.put_embedding(ctx, &embedding)?;
                    self.vectors
                        .upsert(ctx.tenant(), &model, dim, &memory_id, vector)?;
                    sweep.embedded += 1;
                }
                Ok(_) | Err(_) => sweep.failed += 1,
            }
        }
        Ok(sweep)
    }

    /// Usage snapshot for `get_stats`, scoped to the tenant or one project
    /// and optionally restricted to a trailing window.
    ///
    /// Audit counts are filled in by the caller, which owns the audit sink.
    pub async fn stats(
        &self,
        ctx: &TenantContext,
        scope: &StatsScope,
        window_secs: Option<u64>,
    ) -> Result<UsageSnapshot> {
        ctx.check_deadline()?;
        let now = Utc::now();
        let models: Vec<String> = ctx
            .config()
            .active_models(None)
            .iter()
            .map(|m| m.name.clone())
            .collect();

        let mut filter = RecordFilter {
            created_after: window_secs.map(|s| now - Duration::seconds(s as i64)),
            limit: 256,
            ..Default::default()
        };
        if let StatsScope::Project(project) = scope {
            filter.any_tags = vec![project.clone()];
        }

        let mut by_layer: HashMap<String, i64> = HashMap::new();
        let mut total_records = 0;
        let mut records_with_embeddings = 0;
        let mut embedding_gaps = 0;
        loop {
            let page = self.records.query(ctx, &filter)?;
            for record in &page.items {
                total_records += 1;
                *by_layer
                    .entry(record.layer.as_str().to_string())
                    .or_insert(0) += 1;
                if !models.is_empty() {
                    let embeddings = self.records.embeddings_for(ctx, &record.id)?;
                    let live = models
                        .iter()
                        .filter(|model| {
                            embeddings
                                .iter()
                                .any(|e| &e.model == *model && e.consistent_with(record))
                        })
                        .count();
                    if live > 0 {
                        records_with_embeddings += 1;
                    }
                    embedding_gaps += (models.len() - live) as i64;
                }
            }
            filter.cursor = page.next_cursor;
            if filter.cursor.is_none() {
                break;
            }
        }

        let (semantic_nodes, graph_edges) = self.graph.store().graph_counts(ctx)?;
        Ok(UsageSnapshot {
            total_records,
            by_layer,
            semantic_nodes,
            graph_edges,
            records_with_embeddings,
            embedding_gaps,
            audit_events: 0,
        })
    }
}

//! RAE - the assembled memory engine
//!
//! [`Rae`] owns the process singletons (storage backends, vector catalog,
//! LLM gateway, cost guard, audit pipeline, scheduler), built before any
//! request is served and torn down in reverse on shutdown. It exposes the
//! programmatic contract the RPC adapter consumes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::audit::{AuditEvent, AuditPipeline, VecAuditSink};
use crate::error::{CoreError, Result};
use crate::graph::{DEFAULT_NEIGHBORHOOD_DEPTH, GraphService, MAX_NEIGHBORHOOD_DEPTH, Subgraph, extract_mentions};
use crate::layers::LayerPipeline;
use crate::llm::LlmGateway;
use crate::memory::{
    Layer, MemoryRecord, MemoryService, RecordDraft, RecordUpdate, StatsScope, StoreOutcome,
    UsageSnapshot, content_hash,
};
use crate::policy::{CostGuard, CostUsage, CostWindow, PolicyGuard};
use crate::reflection::{ReflectionEngine, ReflectionType};
use crate::search::{QueryRequest, QueryResponse, RetrievalEngine, VectorCatalog};
use crate::storage::{
    AuditStore, BlobStore, Capabilities, GraphStore, InMemoryStore, RecordFilter, RecordStore,
    SqliteStore, TenantCache,
};
use crate::tenant::{BudgetSnapshot, Role, TenantContext, TenantId, TenantRegistry};
use crate::workers::{DecayReport, DreamReport, Scheduler, SummarizationReport, WorkerConfig, WorkerSet};

const AUDIT_QUEUE_CAPACITY: usize = 1024;
const REFLECTION_EVIDENCE_LIMIT: usize = 64;

// ============================================================================
// REQUEST SHAPES
// ============================================================================

/// Graph query input.
///
/// Uses `deny_unknown_fields` to prevent field injection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct GraphQuery {
    /// Free text to extract entity mentions from
    pub text: Option<String>,
    /// Explicit entity labels
    pub entities: Vec<String>,
    /// Traversal depth; defaults to 2, capped at 3
    pub max_depth: Option<usize>,
    /// Restrict traversal to these edge predicates
    pub predicates: Option<Vec<String>>,
}

/// On-demand reflection input: evidence by explicit ids or by tag scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReflectionRequest {
    /// Explicit evidence record ids
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    /// Or: evidence gathered by tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Reflection mode
    pub mode: ReflectionType,
}

/// Budget mutation for `set_budget`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BudgetUpdate {
    /// New daily cap in USD
    pub daily_usd: Option<f64>,
    /// New monthly cap in USD
    pub monthly_usd: Option<f64>,
}

/// One federation export candidate: id plus a short snippet, never raw
/// vectors or full content. The receiving peer re-embeds in its own model
/// space.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetCandidate {
    /// Record id on this instance
    pub memory_id: String,
    /// Short content excerpt
    pub snippet: String,
}

/// Characters exported per federation snippet.
const SNIPPET_CHARS: usize = 200;

// ============================================================================
// BUILDER
// ============================================================================

/// Backend selection for the builder.
enum BackendChoice {
    Sqlite(Option<PathBuf>),
    InMemory,
}

/// Builds a [`Rae`] instance. Tests rebuild against in-memory backends; the
/// default is the SQLite store in the platform data directory.
pub struct RaeBuilder {
    backend: BackendChoice,
    start_workers: bool,
    worker_config: WorkerConfig,
}

impl Default for RaeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RaeBuilder {
    /// Builder with the SQLite backend at the default path.
    pub fn new() -> Self {
        Self {
            backend: BackendChoice::Sqlite(None),
            start_workers: false,
            worker_config: WorkerConfig::default(),
        }
    }

    /// Use the SQLite backend at an explicit path.
    pub fn db_path(mut self, path: PathBuf) -> Self {
        self.backend = BackendChoice::Sqlite(Some(path));
        self
    }

    /// Use in-memory backends (no full-text capability; exercises the
    /// lexical fallback).
    pub fn in_memory(mut self) -> Self {
        self.backend = BackendChoice::InMemory;
        self
    }

    /// Start the background scheduler.
    pub fn with_workers(mut self, config: WorkerConfig) -> Self {
        self.start_workers = true;
        self.worker_config = config;
        self
    }

    /// Assemble the engine. Must run inside a tokio runtime (the audit
    /// pipeline and scheduler spawn tasks).
    pub fn build(self) -> Result<Rae> {
        let registry = Arc::new(TenantRegistry::new());
        let cache = Arc::new(TenantCache::default());
        let cost = Arc::new(CostGuard::new());
        let policy = Arc::new(PolicyGuard::new());
        let vectors = Arc::new(VectorCatalog::new());

        let (records, graph_store, blob_store, audit_store): (
            Arc<dyn RecordStore>,
            Arc<dyn GraphStore>,
            Arc<dyn BlobStore>,
            Arc<dyn AuditStore>,
        ) = match self.backend {
            BackendChoice::Sqlite(path) => {
                let store = Arc::new(SqliteStore::open(path)?);
                (store.clone(), store.clone(), store.clone(), store)
            }
            BackendChoice::InMemory => {
                let store = Arc::new(InMemoryStore::new());
                let sink = Arc::new(VecAuditSink::new());
                (store.clone(), store.clone(), store, sink)
            }
        };

        // A backend that cannot honor the session tenant marker must not
        // register as tenant-capable.
        if !records.capabilities().session_tenant_marker {
            return Err(CoreError::Init(
                "record store does not honor the session tenant marker".into(),
            ));
        }

        let audit = AuditPipeline::spawn(Arc::clone(&audit_store), AUDIT_QUEUE_CAPACITY);
        cost.attach_audit(Arc::clone(&audit));

        let gateway = Arc::new(LlmGateway::new(
            Arc::clone(&cache),
            Arc::clone(&cost),
            Arc::clone(&audit),
            Arc::clone(&policy),
        ));
        let graph = Arc::new(GraphService::new(graph_store));
        let memory = Arc::new(MemoryService::new(
            Arc::clone(&records),
            Arc::clone(&graph),
            Arc::clone(&vectors),
            Arc::clone(&gateway),
            Arc::clone(&policy),
            Arc::clone(&audit),
            Arc::clone(&cache),
        ));
        let engine = Arc::new(RetrievalEngine::new(
            Arc::clone(&records),
            Arc::clone(&graph),
            Arc::clone(&vectors),
            Arc::clone(&gateway),
            Arc::clone(&policy),
        ));
        let reflection = Arc::new(ReflectionEngine::new(
            Arc::clone(&gateway),
            Arc::clone(&records),
            Arc::clone(&audit),
        ));
        let pipeline = Arc::new(LayerPipeline::new(
            Arc::clone(&records),
            Arc::clone(&policy),
            Arc::clone(&audit),
        ));
        let workers = Arc::new(WorkerSet::new(
            Arc::clone(&registry),
            Arc::clone(&memory),
            Arc::clone(&records),
            Arc::clone(&graph),
            Arc::clone(&pipeline),
            Arc::clone(&reflection),
            Arc::clone(&gateway),
            blob_store,
            Arc::clone(&audit),
        ));
        let scheduler = if self.start_workers {
            Some(Scheduler::spawn(Arc::clone(&workers), self.worker_config))
        } else {
            None
        };

        Ok(Rae {
            registry,
            records,
            audit_store,
            audit,
            cost,
            gateway,
            graph,
            memory,
            engine,
            reflection,
            pipeline,
            workers,
            scheduler: Mutex::new(scheduler),
            request_slots: Mutex::new(HashMap::new()),
        })
    }
}

// ============================================================================
// RAE
// ============================================================================

/// The assembled memory engine.
pub struct Rae {
    registry: Arc<TenantRegistry>,
    records: Arc<dyn RecordStore>,
    audit_store: Arc<dyn AuditStore>,
    audit: Arc<AuditPipeline>,
    cost: Arc<CostGuard>,
    gateway: Arc<LlmGateway>,
    graph: Arc<GraphService>,
    memory: Arc<MemoryService>,
    engine: Arc<RetrievalEngine>,
    reflection: Arc<ReflectionEngine>,
    pipeline: Arc<LayerPipeline>,
    workers: Arc<WorkerSet>,
    scheduler: Mutex<Option<Scheduler>>,
    request_slots: Mutex<HashMap<TenantId, Arc<Semaphore>>>,
}

impl Rae {
    /// Builder entry point.
    pub fn builder() -> RaeBuilder {
        RaeBuilder::new()
    }

    /// Establish a request context for an authenticated actor, with the
    /// current config and budget snapshot.
    pub fn context(&self, tenant: impl Into<TenantId>, actor: impl Into<String>) -> TenantContext {
        let ctx = self.registry.context(tenant, actor);
        let usage = self.cost.usage(&ctx, CostWindow::Day);
        ctx.with_budget(BudgetSnapshot {
            daily_remaining_usd: (usage.daily_budget_usd - usage.daily_used_usd).max(0.0),
            monthly_remaining_usd: (usage.monthly_budget_usd - usage.monthly_used_usd).max(0.0),
        })
    }

    /// Tenant configuration registry.
    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    /// The LLM gateway, for registering additional providers.
    pub fn gateway(&self) -> &Arc<LlmGateway> {
        &self.gateway
    }

    /// Capability matrix of the active record store.
    pub fn capabilities(&self) -> Capabilities {
        self.records.capabilities()
    }

    /// The active record store (compliance and test surface).
    pub fn record_store(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    fn request_permit(&self, ctx: &TenantContext) -> Result<tokio::sync::OwnedSemaphorePermit> {
        let semaphore = {
            let mut slots = self.request_slots.lock().expect("request slots lock");
            Arc::clone(slots.entry(ctx.tenant().clone()).or_insert_with(|| {
                Arc::new(Semaphore::new(
                    ctx.config().quotas.max_concurrent_requests.max(1),
                ))
            }))
        };
        semaphore
            .try_acquire_owned()
            .map_err(|_| CoreError::TenantThrottled)
    }

    // ------------------------------------------------------------------
    // programmatic contract
    // ------------------------------------------------------------------

    /// Store a memory. Returns the (possibly deduplicated) id.
    pub async fn store_memory(
        &self,
        ctx: &TenantContext,
        draft: RecordDraft,
    ) -> Result<StoreOutcome> {
        ctx.require_role(Role::Writer, "store_memory")?;
        let _permit = self.request_permit(ctx)?;
        self.memory.store(ctx, draft).await
    }

    /// Hybrid retrieval.
    pub async fn query_memory(
        &self,
        ctx: &TenantContext,
        request: QueryRequest,
    ) -> Result<QueryResponse> {
        ctx.require_role(Role::Reader, "query_memory")?;
        let _permit = self.request_permit(ctx)?;
        let started = Instant::now();
        let result = self.engine.query(ctx, &request).await;
        match &result {
            Ok(response) => self.audit.emit(
                AuditEvent::of(ctx, "query_memory")
                    .latency(started.elapsed().as_millis() as u64)
                    .detail(serde_json::json!({
                        "resultCount": response.results.len(),
                        "earlyExit": response.early_exit,
                        "degraded": response.degraded.len(),
                    })),
            ),
            Err(e) => self.audit.emit(
                AuditEvent::of(ctx, "query_memory")
                    .outcome(crate::audit::AuditOutcome::Error)
                    .latency(started.elapsed().as_millis() as u64)
                    .detail(serde_json::json!({ "error": e.kind() })),
            ),
        }
        result
    }

    /// Bounded-depth graph neighborhood query.
    pub async fn query_graph(&self, ctx: &TenantContext, query: GraphQuery) -> Result<Subgraph> {
        ctx.require_role(Role::Reader, "query_graph")?;
        let _permit = self.request_permit(ctx)?;
        let depth = query.max_depth.unwrap_or(DEFAULT_NEIGHBORHOOD_DEPTH);
        if depth > MAX_NEIGHBORHOOD_DEPTH {
            return Err(CoreError::InvalidRecord(format!(
                "max_depth {depth} exceeds the limit of {MAX_NEIGHBORHOOD_DEPTH}"
            )));
        }

        let mut labels = query.entities.clone();
        if let Some(text) = &query.text {
            labels.extend(extract_mentions(text));
        }

        let mut merged = Subgraph::default();
        let mut seen_nodes = std::collections::HashSet::new();
        let mut seen_edges = std::collections::HashSet::new();
        for label in labels {
            let Some(node) = self.graph.store().node_by_label(ctx, &label)? else {
                continue;
            };
            let sub = self.graph.neighborhood(
                ctx,
                &node.id,
                depth,
                query.predicates.as_deref(),
            )?;
            for node in sub.nodes {
                if seen_nodes.insert(node.id.clone()) {
                    merged.nodes.push(node);
                }
            }
            for edge in sub.edges {
                if seen_edges.insert(edge.id.clone()) {
                    merged.edges.push(edge);
                }
            }
            for (id, dist) in sub.distances {
                merged
                    .distances
                    .entry(id)
                    .and_modify(|d| *d = (*d).min(dist))
                    .or_insert(dist);
            }
        }

        self.audit.emit(
            AuditEvent::of(ctx, "query_graph").detail(serde_json::json!({
                "nodes": merged.nodes.len(),
                "edges": merged.edges.len(),
                "depth": depth,
            })),
        );
        Ok(merged)
    }

    /// Fetch one record by id, bumping usage.
    pub async fn fetch_memory(
        &self,
        ctx: &TenantContext,
        id: &str,
    ) -> Result<Option<MemoryRecord>> {
        ctx.require_role(Role::Reader, "fetch_memory")?;
        self.memory.fetch(ctx, id).await
    }

    /// Restricted-field update.
    pub async fn update_memory(
        &self,
        ctx: &TenantContext,
        id: &str,
        update: RecordUpdate,
    ) -> Result<MemoryRecord> {
        ctx.require_role(Role::Writer, "update_memory")?;
        self.memory.update(ctx, id, update).await
    }

    /// GDPR-compliant delete with full cascade.
    pub async fn delete_memory(&self, ctx: &TenantContext, id: &str) -> Result<bool> {
        ctx.require_role(Role::Writer, "delete_memory")?;
        self.memory.delete(ctx, id).await
    }

    /// Filtered listing.
    pub async fn list_memories(
        &self,
        ctx: &TenantContext,
        filter: RecordFilter,
    ) -> Result<crate::storage::Page<MemoryRecord>> {
        ctx.require_role(Role::Reader, "list_memories")?;
        self.memory.list(ctx, filter).await
    }

    /// On-demand reflection over explicit evidence or a tag scan. Returns
    /// the reflective record id, or `None` when the engine discarded the
    /// candidate (the discard reason is audited).
    pub async fn generate_reflection(
        &self,
        ctx: &TenantContext,
        request: ReflectionRequest,
    ) -> Result<Option<String>> {
        ctx.require_role(Role::Writer, "generate_reflection")?;
        let _permit = self.request_permit(ctx)?;

        let mut evidence: Vec<MemoryRecord> = Vec::new();
        if !request.evidence_ids.is_empty() {
            for id in &request.evidence_ids {
                let record = self
                    .records
                    .get(ctx, id)?
                    .ok_or_else(|| CoreError::InvalidRecord(format!("unknown evidence {id}")))?;
                evidence.push(record);
            }
        } else if !request.tags.is_empty() {
            let page = self.records.query(
                ctx,
                &RecordFilter {
                    any_tags: request.tags.clone(),
                    limit: REFLECTION_EVIDENCE_LIMIT,
                    ..Default::default()
                },
            )?;
            evidence = page.items;
        }
        if evidence.is_empty() {
            return Err(CoreError::InvalidRecord(
                "reflection request matched no evidence".into(),
            ));
        }

        let Some(outcome) = self.reflection.reflect(ctx, &evidence, request.mode).await? else {
            return Ok(None);
        };

        if outcome.duplicate_of_existing {
            // Same lesson already stored; hand back the existing id.
            let hash = content_hash(&outcome.lesson);
            let page = self
                .records
                .query(ctx, &RecordFilter::layer(Layer::Reflective, 256))?;
            if let Some(existing) = page.items.into_iter().find(|r| r.content_hash == hash) {
                return Ok(Some(existing.id));
            }
        }

        let mut tags: Vec<String> = request.tags.clone();
        tags.push("reflection".into());
        let record = self.pipeline.consolidate(
            ctx,
            &evidence,
            Layer::Reflective,
            outcome.lesson,
            tags,
            outcome.info.confidence_after,
            true,
            Some(outcome.info),
            "reflection",
        )?;
        Ok(Some(record.id))
    }

    /// Federation export: the top candidates for a query as
    /// `(memory_id, snippet)` pairs. Vectors never leave the instance; peers
    /// re-embed snippets in their local model space.
    pub async fn export_snippets(
        &self,
        ctx: &TenantContext,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SnippetCandidate>> {
        ctx.require_role(Role::Reader, "export_snippets")?;
        let response = self
            .engine
            .query(
                ctx,
                &QueryRequest {
                    text: query.to_string(),
                    top_k: Some(top_k),
                    ..Default::default()
                },
            )
            .await?;
        Ok(response
            .results
            .into_iter()
            .map(|ranked| SnippetCandidate {
                memory_id: ranked.record.id,
                snippet: ranked.record.content.chars().take(SNIPPET_CHARS).collect(),
            })
            .collect())
    }

    /// Usage snapshot for the tenant or one project, optionally restricted
    /// to a trailing window in seconds.
    pub async fn get_stats(
        &self,
        ctx: &TenantContext,
        scope: StatsScope,
        window_secs: Option<u64>,
    ) -> Result<UsageSnapshot> {
        ctx.require_role(Role::Reader, "get_stats")?;
        let mut snapshot = self.memory.stats(ctx, &scope, window_secs).await?;
        let since =
            window_secs.map(|s| chrono::Utc::now() - chrono::Duration::seconds(s as i64));
        snapshot.audit_events = self.audit_store.count_events(ctx, since)?;
        Ok(snapshot)
    }

    /// Spend picture for a window.
    pub fn get_cost_usage(&self, ctx: &TenantContext, window: CostWindow) -> Result<CostUsage> {
        ctx.require_role(Role::Reader, "get_cost_usage")?;
        Ok(self.cost.usage(ctx, window))
    }

    /// Update spend caps. Operator role required.
    pub fn set_budget(&self, ctx: &TenantContext, update: BudgetUpdate) -> Result<()> {
        ctx.require_role(Role::Operator, "set_budget")?;
        self.registry.update(ctx.tenant(), |config| {
            if let Some(daily) = update.daily_usd {
                config.budget.daily_usd = daily;
            }
            if let Some(monthly) = update.monthly_usd {
                config.budget.monthly_usd = monthly;
            }
        });
        self.audit.emit(
            AuditEvent::of(ctx, "set_budget")
                .detail(serde_json::json!({
                    "dailyUsd": update.daily_usd,
                    "monthlyUsd": update.monthly_usd,
                }))
                .critical(),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // maintenance & compliance surface
    // ------------------------------------------------------------------

    /// Read back audit events (compliance and test surface).
    pub fn audit_events(
        &self,
        ctx: &TenantContext,
        operation: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        self.audit_store.events_for(ctx, operation, limit)
    }

    /// Run one decay cycle for a tenant now.
    pub async fn run_decay(&self, tenant: &TenantId) -> Result<DecayReport> {
        self.workers.run_decay(tenant).await
    }

    /// Run one summarization cycle for a tenant now.
    pub async fn run_summarization(&self, tenant: &TenantId) -> Result<SummarizationReport> {
        self.workers.run_summarization(tenant).await
    }

    /// Run one dreaming cycle for a tenant now.
    pub async fn run_dreaming(&self, tenant: &TenantId) -> Result<DreamReport> {
        self.workers.run_dreaming(tenant).await
    }

    /// Retry missing/stale embeddings now.
    pub async fn reconcile_embeddings(
        &self,
        ctx: &TenantContext,
        limit: usize,
    ) -> Result<crate::memory::EmbeddingSweep> {
        self.memory.reconcile_embeddings(ctx, limit).await
    }

    /// Tear down in reverse construction order: stop the scheduler, flush
    /// the audit pipeline, then drop the pools.
    pub async fn shutdown(self) -> Result<()> {
        let scheduler = self.scheduler.lock().expect("scheduler lock").take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        self.audit.shutdown().await?;
        Ok(())
    }
}

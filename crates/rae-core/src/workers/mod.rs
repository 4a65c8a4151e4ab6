//! Background workers
//!
//! Three tenant-scoped cycles: decay (daily), summarization (hourly),
//! dreaming (daily off-peak). The scheduler iterates tenants, takes a
//! per-tenant advisory lock, and runs the cycle; a failure in one tenant
//! never blocks others. Cycles that need LLM spend defer when the budget is
//! exhausted — decay needs none and always runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::audit::{AuditEvent, AuditOutcome, AuditPipeline};
use crate::error::{CoreError, Result};
use crate::graph::GraphService;
use crate::layers::{CONSOLIDATED_TAG, LayerPipeline, admits_longterm, reflective_clusters};
use crate::llm::LlmGateway;
use crate::memory::{InfoClass, Layer, MemoryRecord, MemoryService};
use crate::reflection::ReflectionEngine;
use crate::storage::{BlobStore, RecordFilter, RecordStore};
use crate::tenant::{TenantContext, TenantId, TenantRegistry};

const SCAN_PAGE: usize = 256;
const LONGTERM_SCAN: usize = 512;
const SUMMARY_MAX_TOKENS: u32 = 160;

// ============================================================================
// REPORTS
// ============================================================================

/// Outcome of one decay cycle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecayReport {
    /// Records examined
    pub examined: usize,
    /// Records whose importance decayed
    pub decayed: usize,
    /// Records pruned (with cascades)
    pub pruned: usize,
    /// Graph edges pruned below the confidence floor
    pub edges_pruned: usize,
}

/// Outcome of one summarization cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizationReport {
    /// Working records examined
    pub examined: usize,
    /// Longterm records produced
    pub promoted: usize,
    /// Set when the cycle deferred ("budget")
    pub deferred: Option<String>,
}

/// Outcome of one dreaming cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamReport {
    /// Clusters considered
    pub clusters: usize,
    /// Reflections stored
    pub reflections: usize,
    /// Set when the cycle deferred ("budget")
    pub deferred: Option<String>,
}

// ============================================================================
// WORKER SET
// ============================================================================

/// The cycle implementations, shared by the scheduler and by on-demand
/// maintenance entry points.
pub struct WorkerSet {
    registry: Arc<TenantRegistry>,
    memory: Arc<MemoryService>,
    records: Arc<dyn RecordStore>,
    graph: Arc<GraphService>,
    pipeline: Arc<LayerPipeline>,
    reflection: Arc<ReflectionEngine>,
    gateway: Arc<LlmGateway>,
    blobs: Arc<dyn BlobStore>,
    audit: Arc<AuditPipeline>,
    locks: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkerSet {
    /// Wire the worker set.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TenantRegistry>,
        memory: Arc<MemoryService>,
        records: Arc<dyn RecordStore>,
        graph: Arc<GraphService>,
        pipeline: Arc<LayerPipeline>,
        reflection: Arc<ReflectionEngine>,
        gateway: Arc<LlmGateway>,
        blobs: Arc<dyn BlobStore>,
        audit: Arc<AuditPipeline>,
    ) -> Self {
        Self {
            registry,
            memory,
            records,
            graph,
            pipeline,
            reflection,
            gateway,
            blobs,
            audit,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn worker_ctx(&self, tenant: &TenantId) -> TenantContext {
        self.registry.context(tenant.clone(), "worker")
    }

    /// Per-tenant advisory lock serializing cycles for one tenant.
    fn tenant_lock(&self, tenant: &TenantId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("worker locks");
        Arc::clone(
            locks
                .entry(tenant.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    // ------------------------------------------------------------------
    // decay
    // ------------------------------------------------------------------

    /// Apply exponential importance decay and prune expired records and
    /// low-confidence edges. Needs no LLM calls, so it never defers.
    ///
    /// Pruning honors the per-layer retention policy: sensory records are
    /// raw input and are evicted outright once their TTL passes; higher
    /// layers prune only when exhausted (importance under the floor, never
    /// used) and past both their layer retention and the prune age gate.
    pub async fn run_decay(&self, tenant: &TenantId) -> Result<DecayReport> {
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;
        let ctx = self.worker_ctx(tenant);
        let config = ctx.config();
        let decay = &config.decay;
        let layers = &config.layers;
        let now = Utc::now();
        let mut report = DecayReport::default();

        let mut cursor: Option<String> = None;
        loop {
            let page = self.records.query(
                &ctx,
                &RecordFilter {
                    limit: SCAN_PAGE,
                    cursor: cursor.clone(),
                    ..Default::default()
                },
            )?;
            for record in &page.items {
                report.examined += 1;
                let since = record.last_decayed_at.unwrap_or(record.created_at);
                let elapsed_secs = (now - since).num_seconds().max(0);
                if elapsed_secs < 60 {
                    // Same logical instant as the previous pass: a no-op.
                    continue;
                }
                let elapsed_days = elapsed_secs as f64 / 86_400.0;
                let factor = (-std::f64::consts::LN_2 * elapsed_days / decay.half_life_days).exp();
                let new_importance = (record.importance * factor).clamp(0.0, 1.0);

                let retention_secs = match record.layer {
                    Layer::Sensory => layers.sensory_retention_secs,
                    Layer::Working => layers.working_retention_secs,
                    Layer::LongTerm => layers.longterm_retention_secs,
                    Layer::Reflective => layers.reflective_retention_secs,
                };
                let age_secs = record.age(now).num_seconds().max(0) as u64;
                let past_retention = age_secs > retention_secs;
                let age_days = age_secs as f64 / 86_400.0;

                let prune = if record.layer == Layer::Sensory {
                    past_retention
                } else {
                    past_retention
                        && new_importance < decay.importance_floor
                        && record.usage_count == 0
                        && age_days > decay.min_age_for_prune_days
                };
                if prune {
                    self.memory.delete(&ctx, &record.id).await?;
                    report.pruned += 1;
                } else {
                    self.records
                        .apply_decay(&ctx, &record.id, new_importance, now)?;
                    report.decayed += 1;
                }
            }
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }

        report.edges_pruned = self
            .graph
            .store()
            .prune_edges_below(&ctx, decay.edge_confidence_floor)?;
        self.pipeline.sweep_stale_stages(&ctx)?;

        self.audit.emit(
            AuditEvent::worker(tenant.clone(), "decay_cycle").detail(serde_json::json!({
                "examined": report.examined,
                "decayed": report.decayed,
                "pruned": report.pruned,
                "edgesPruned": report.edges_pruned,
            })),
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // summarization
    // ------------------------------------------------------------------

    /// Promote eligible working records to longterm, batching records that
    /// share a tag into a single summary.
    pub async fn run_summarization(&self, tenant: &TenantId) -> Result<SummarizationReport> {
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;
        let ctx = self.worker_ctx(tenant);
        let config = ctx.config();
        let now = Utc::now();
        let mut report = SummarizationReport::default();

        let page = self
            .records
            .query(&ctx, &RecordFilter::layer(Layer::Working, LONGTERM_SCAN))?;
        report.examined = page.items.len();
        let eligible: Vec<MemoryRecord> = page
            .items
            .into_iter()
            .filter(|r| admits_longterm(r, &config.layers.admission_thresholds, now))
            .collect();
        if eligible.is_empty() {
            return Ok(report);
        }

        // Batch by the first shared tag; untagged records summarize alone.
        let mut batches: Vec<Vec<MemoryRecord>> = Vec::new();
        let mut by_tag: std::collections::BTreeMap<String, Vec<MemoryRecord>> =
            std::collections::BTreeMap::new();
        for record in eligible {
            match record.tags.first() {
                Some(tag) => by_tag.entry(tag.clone()).or_default().push(record),
                None => batches.push(vec![record]),
            }
        }
        batches.extend(by_tag.into_values());

        for batch in batches {
            tokio::task::yield_now().await;
            let joined = batch
                .iter()
                .map(|r| r.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let class = batch
                .iter()
                .map(|r| r.info_class)
                .max()
                .unwrap_or(InfoClass::Internal);
            let summary = match self
                .gateway
                .complete(&ctx, "cheap", &joined, SUMMARY_MAX_TOKENS, class)
                .await
            {
                Ok(completion) => completion.text,
                Err(CoreError::BudgetExceeded { .. }) => {
                    report.deferred = Some("budget".into());
                    self.audit.emit(
                        AuditEvent::worker(tenant.clone(), "cycle_deferred")
                            .outcome(AuditOutcome::Deferred)
                            .detail(serde_json::json!({
                                "cycle": "summarization",
                                "reason": "budget",
                            }))
                            .critical(),
                    );
                    return Ok(report);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "summarization batch failed");
                    continue;
                }
            };
            if summary.trim().is_empty() {
                continue;
            }

            let importance = batch
                .iter()
                .map(|r| r.importance)
                .fold(0.0_f64, f64::max);
            let mut tags: Vec<String> = batch
                .iter()
                .flat_map(|r| r.tags.clone())
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();
            tags.dedup();

            match self.pipeline.consolidate(
                &ctx,
                &batch,
                Layer::LongTerm,
                summary,
                tags,
                importance,
                true,
                None,
                "summarization",
            ) {
                Ok(_) => {
                    report.promoted += 1;
                    // Stamp the sources so the next cycle skips them.
                    for parent in &batch {
                        let mut tags = parent.tags.clone();
                        tags.push(CONSOLIDATED_TAG.to_string());
                        let update = crate::memory::RecordUpdate {
                            tags: Some(tags),
                            ..Default::default()
                        };
                        if let Err(e) =
                            self.records.apply_update(&ctx, &parent.id, &update, now)
                        {
                            tracing::warn!(error = %e, "failed to stamp consolidated source");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "consolidation failed for batch"),
            }
        }

        self.audit.emit(
            AuditEvent::worker(tenant.clone(), "summarization_cycle").detail(serde_json::json!({
                "examined": report.examined,
                "promoted": report.promoted,
            })),
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // dreaming
    // ------------------------------------------------------------------

    /// Cluster longterm records and synthesize reflections per cluster.
    pub async fn run_dreaming(&self, tenant: &TenantId) -> Result<DreamReport> {
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;
        let ctx = self.worker_ctx(tenant);
        let config = ctx.config();
        let mut report = DreamReport::default();

        let Some(mode) = config.reflection.enabled_modes.first().copied() else {
            return Ok(report);
        };

        let page = self
            .records
            .query(&ctx, &RecordFilter::layer(Layer::LongTerm, LONGTERM_SCAN))?;
        let clusters = reflective_clusters(&page.items, &config.layers.admission_thresholds);
        report.clusters = clusters.len();

        for cluster in clusters {
            tokio::task::yield_now().await;
            let outcome = match self.reflection.reflect(&ctx, &cluster, mode).await {
                Ok(outcome) => outcome,
                Err(CoreError::BudgetExceeded { .. }) => {
                    report.deferred = Some("budget".into());
                    self.audit.emit(
                        AuditEvent::worker(tenant.clone(), "cycle_deferred")
                            .outcome(AuditOutcome::Deferred)
                            .detail(serde_json::json!({
                                "cycle": "dreaming",
                                "reason": "budget",
                            }))
                            .critical(),
                    );
                    return Ok(report);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reflection failed for cluster");
                    continue;
                }
            };
            let Some(outcome) = outcome else { continue };
            if outcome.duplicate_of_existing {
                continue;
            }

            let mut tags: Vec<String> = cluster
                .iter()
                .flat_map(|r| r.tags.clone())
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();
            tags.push("reflection".into());

            match self.pipeline.consolidate(
                &ctx,
                &cluster,
                Layer::Reflective,
                outcome.lesson,
                tags,
                outcome.info.confidence_after,
                true,
                Some(outcome.info),
                "dreaming",
            ) {
                Ok(_) => report.reflections += 1,
                Err(e) => tracing::warn!(error = %e, "storing reflection failed"),
            }
        }

        // Archive the cycle's artifact for later inspection.
        if report.reflections > 0 {
            let key = format!("dream-report:{}", uuid::Uuid::new_v4());
            match serde_json::to_vec(&report) {
                Ok(bytes) => {
                    if let Err(e) = self.blobs.put_blob(&ctx, &key, &bytes) {
                        tracing::warn!(error = %e, "failed to archive dream report");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode dream report"),
            }
        }

        self.audit.emit(
            AuditEvent::worker(tenant.clone(), "dreaming_cycle").detail(serde_json::json!({
                "clusters": report.clusters,
                "reflections": report.reflections,
            })),
        );
        Ok(report)
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Cycle intervals.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Decay cycle interval
    pub decay_interval: Duration,
    /// Summarization cycle interval
    pub summarization_interval: Duration,
    /// Dreaming cycle interval
    pub dreaming_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            decay_interval: Duration::from_secs(24 * 3600),
            summarization_interval: Duration::from_secs(3600),
            dreaming_interval: Duration::from_secs(24 * 3600),
        }
    }
}

/// Owns the three cycle loops. Runs on the worker pool, disjoint from
/// request handling; dropping via [`Scheduler::shutdown`] stops all loops.
pub struct Scheduler {
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Spawn the cycle loops.
    pub fn spawn(workers: Arc<WorkerSet>, config: WorkerConfig) -> Self {
        let shutdown = Arc::new(Notify::new());
        let mut handles = Vec::new();

        for (interval, cycle) in [
            (config.decay_interval, Cycle::Decay),
            (config.summarization_interval, Cycle::Summarization),
            (config.dreaming_interval, Cycle::Dreaming),
        ] {
            let workers = Arc::clone(&workers);
            let shutdown = Arc::clone(&shutdown);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick fires immediately; skip it so cycles start
                // one interval after boot.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = ticker.tick() => {
                            for tenant in workers.registry.tenants() {
                                let result = match cycle {
                                    Cycle::Decay => workers.run_decay(&tenant).await.map(|_| ()),
                                    Cycle::Summarization => {
                                        workers.run_summarization(&tenant).await.map(|_| ())
                                    }
                                    Cycle::Dreaming => {
                                        workers.run_dreaming(&tenant).await.map(|_| ())
                                    }
                                };
                                if let Err(e) = result {
                                    // One tenant's failure never blocks the rest.
                                    tracing::warn!(
                                        tenant = %tenant,
                                        cycle = cycle.as_str(),
                                        error = %e,
                                        "worker cycle failed"
                                    );
                                }
                            }
                        }
                    }
                }
            }));
        }
        Self { handles, shutdown }
    }

    /// Stop all loops and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_waiters();
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cycle {
    Decay,
    Summarization,
    Dreaming,
}

impl Cycle {
    fn as_str(&self) -> &'static str {
        match self {
            Cycle::Decay => "decay",
            Cycle::Summarization => "summarization",
            Cycle::Dreaming => "dreaming",
        }
    }
}

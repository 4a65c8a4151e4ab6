//! Hybrid retrieval engine
//!
//! Stage 1 fans out three candidate strategies (dense, lexical, graph) in
//! parallel. Stage 2 fuses them with RRF. Stage 3 is the safe early-exit:
//! a small, high-specificity lexical result set short-circuits fusion.
//! Stage 4 shapes by information class, layer weight, and weighted
//! subscores. Stage 5 optionally passes the head through a deadline-bounded
//! reranker, falling back to fused order.
//!
//! One failed strategy degrades the response; all three failing is
//! `RetrievalUnavailable`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::graph::GraphService;
use crate::llm::{LlmGateway, TermOverlapReranker};
use crate::memory::{Layer, MemoryRecord};
use crate::policy::PolicyGuard;
use crate::search::hybrid::{
    TieBreakMeta, density_score, diversity_shaped, reciprocal_rank_fusion, recency_score,
    sort_with_tie_breaks,
};
use crate::search::keyword::LexicalScorer;
use crate::search::vector::VectorCatalog;
use crate::storage::{RecordFilter, RecordStore};
use crate::tenant::{ModelSpace, TenantContext};

/// Candidate pool scanned for the in-memory lexical fallback.
const LEXICAL_FALLBACK_SCAN: usize = 512;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// A retrieval query.
///
/// Uses `deny_unknown_fields` to prevent field injection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct QueryRequest {
    /// Free-text query
    pub text: String,
    /// Results wanted; defaults to 10. Zero returns an empty envelope
    /// without touching any backend.
    pub top_k: Option<usize>,
    /// Restrict to these layers
    pub layers: Option<Vec<Layer>>,
    /// Restrict to records carrying at least one of these tags
    pub tags: Vec<String>,
    /// Minimum importance
    pub min_importance: Option<f64>,
    /// Pass the head through the configured reranker
    pub rerank: bool,
}

impl QueryRequest {
    /// Query with just text.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Which strategy produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Vector-space nearest neighbor
    Dense,
    /// Full-text / BM25
    Lexical,
    /// Entity-graph traversal
    Graph,
}

/// A degradation note attached to a partial response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Degradation {
    /// What degraded ("dense", "graph", "rerank_skipped", ...)
    pub kind: String,
    /// Why ("budget", "deadline", backend error text)
    pub reason: String,
}

/// One ranked result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedMemory {
    /// The record
    pub record: MemoryRecord,
    /// Final score after shaping
    pub score: f64,
    /// Strategies that surfaced the record
    pub matched: Vec<StrategyKind>,
}

/// Retrieval response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    /// Ranked results, best first
    pub results: Vec<RankedMemory>,
    /// Degradations encountered while serving
    pub degraded: Vec<Degradation>,
    /// Set when the safe early-exit returned lexical-only results
    pub early_exit: Option<String>,
    /// The deadline expired before all stages ran
    pub partial: bool,
    /// Wall-clock serving time
    pub elapsed_ms: u64,
}

impl QueryResponse {
    fn empty(elapsed_ms: u64) -> Self {
        Self {
            results: vec![],
            degraded: vec![],
            early_exit: None,
            partial: false,
            elapsed_ms,
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// The hybrid retrieval engine. Stateless between requests; all shared state
/// lives in the backends it references.
pub struct RetrievalEngine {
    records: Arc<dyn RecordStore>,
    graph: Arc<GraphService>,
    vectors: Arc<VectorCatalog>,
    gateway: Arc<LlmGateway>,
    policy: Arc<PolicyGuard>,
}

impl RetrievalEngine {
    /// Wire the engine to its backends.
    pub fn new(
        records: Arc<dyn RecordStore>,
        graph: Arc<GraphService>,
        vectors: Arc<VectorCatalog>,
        gateway: Arc<LlmGateway>,
        policy: Arc<PolicyGuard>,
    ) -> Self {
        Self {
            records,
            graph,
            vectors,
            gateway,
            policy,
        }
    }

    /// Serve a query.
    pub async fn query(&self, ctx: &TenantContext, request: &QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        let top_k = request.top_k.unwrap_or(10);
        if top_k == 0 {
            return Ok(QueryResponse::empty(started.elapsed().as_millis() as u64));
        }
        ctx.check_deadline()?;

        let config = ctx.config();
        let retrieval = &config.retrieval;
        let mut degraded: Vec<Degradation> = Vec::new();

        // ---- Stage 1: candidate generation, three strategies in parallel ----
        let (dense_result, lexical_result, graph_result) = tokio::join!(
            self.dense_candidates(ctx, &request.text, retrieval.dense_top_k),
            self.lexical_candidates(ctx, request, retrieval.lexical_top_k),
            self.graph_candidates(ctx, &request.text, retrieval.graph_top_k),
        );

        let dense = match dense_result {
            Ok(list) => Some(list),
            Err(e) => {
                tracing::warn!(error = %e, "dense strategy degraded");
                degraded.push(Degradation {
                    kind: "dense".into(),
                    reason: e.kind().to_string(),
                });
                None
            }
        };
        let lexical = match lexical_result {
            Ok(list) => Some(list),
            Err(e) => {
                tracing::warn!(error = %e, "lexical strategy degraded");
                degraded.push(Degradation {
                    kind: "lexical".into(),
                    reason: e.kind().to_string(),
                });
                None
            }
        };
        let graph = match graph_result {
            Ok(list) => Some(list),
            Err(e) => {
                tracing::warn!(error = %e, "graph strategy degraded");
                degraded.push(Degradation {
                    kind: "graph".into(),
                    reason: e.kind().to_string(),
                });
                None
            }
        };

        if dense.is_none() && lexical.is_none() && graph.is_none() {
            return Err(CoreError::RetrievalUnavailable);
        }

        // ---- Stage 3: safe early-exit ----
        // A non-empty lexical set below the threshold indicates a specific,
        // well-keyworded query; skip fusion and honor it directly.
        if let Some(lex) = &lexical
            && !lex.is_empty()
            && lex.len() < retrieval.safe_exit_threshold
        {
            let mut results = Vec::new();
            for (id, score) in lex.iter().take(top_k) {
                if let Some(record) = self.load_visible(ctx, id, request)? {
                    results.push(RankedMemory {
                        record,
                        score: *score,
                        matched: vec![StrategyKind::Lexical],
                    });
                }
            }
            return Ok(QueryResponse {
                results,
                degraded,
                early_exit: Some("lexical".into()),
                partial: false,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        // ---- Stage 2: Reciprocal Rank Fusion ----
        let mut lists: Vec<Vec<(String, f64)>> = Vec::new();
        let mut matched_by: HashMap<String, Vec<StrategyKind>> = HashMap::new();
        let mut graph_scores: HashMap<String, f64> = HashMap::new();
        if let Some(list) = &dense {
            for (id, _) in list {
                matched_by.entry(id.clone()).or_default().push(StrategyKind::Dense);
            }
            lists.push(list.clone());
        }
        if let Some(list) = &lexical {
            for (id, _) in list {
                matched_by
                    .entry(id.clone())
                    .or_default()
                    .push(StrategyKind::Lexical);
            }
            lists.push(list.clone());
        }
        if let Some(list) = &graph {
            for (id, score) in list {
                matched_by.entry(id.clone()).or_default().push(StrategyKind::Graph);
                graph_scores.insert(id.clone(), *score);
            }
            lists.push(list.clone());
        }
        let fused = reciprocal_rank_fusion(&lists, retrieval.rrf_k);

        // ---- Stage 4: load, filter, shape ----
        let mut records: HashMap<String, MemoryRecord> = HashMap::new();
        let mut meta: HashMap<String, TieBreakMeta> = HashMap::new();
        let mut shaped: Vec<(String, f64)> = Vec::new();
        for (id, score) in fused {
            let Some(record) = self.load_visible(ctx, &id, request)? else {
                continue;
            };
            let layer_weight = config.layer_weight(record.layer.as_str());
            meta.insert(
                id.clone(),
                TieBreakMeta {
                    importance: record.importance,
                    usage_count: record.usage_count,
                    last_accessed_at: record.last_accessed_at,
                },
            );
            shaped.push((id.clone(), score * layer_weight));
            records.insert(id, record);
        }
        let mut ordered = sort_with_tie_breaks(shaped, &meta);

        let deadline_hit = ctx
            .remaining()
            .is_some_and(|left| left.is_zero());
        if !deadline_hit {
            ordered = self.subscore_rerank(ctx, &request.text, ordered, &records, &graph_scores);
        }

        // ---- Stage 5: optional learned reranking ----
        let mut partial = deadline_hit;
        if request.rerank && !deadline_hit {
            match self.learned_rerank(ctx, &request.text, &mut ordered, &records).await {
                Ok(()) => {}
                Err(CoreError::BudgetExceeded { .. }) => degraded.push(Degradation {
                    kind: "rerank_skipped".into(),
                    reason: "budget".into(),
                }),
                Err(CoreError::DeadlineExceeded) => degraded.push(Degradation {
                    kind: "rerank_skipped".into(),
                    reason: "deadline".into(),
                }),
                Err(e) => degraded.push(Degradation {
                    kind: "rerank_skipped".into(),
                    reason: e.kind().to_string(),
                }),
            }
        } else if request.rerank {
            partial = true;
        }

        let results: Vec<RankedMemory> = ordered
            .into_iter()
            .take(top_k)
            .filter_map(|(id, score)| {
                records.remove(&id).map(|record| RankedMemory {
                    matched: matched_by.remove(&id).unwrap_or_default(),
                    record,
                    score,
                })
            })
            .collect();

        Ok(QueryResponse {
            results,
            degraded,
            early_exit: None,
            partial,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    // ------------------------------------------------------------------
    // strategies
    // ------------------------------------------------------------------

    async fn dense_candidates(
        &self,
        ctx: &TenantContext,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f64)>> {
        let config = ctx.config();
        let model = config
            .active_models(Some(ModelSpace::Cheap))
            .first()
            .map(|m| (m.name.clone(), m.dim))
            .ok_or_else(|| CoreError::UnknownModel("no active cheap embedding model".into()))?;

        let query_vector = self.gateway.embed(ctx, &model.0, text).await?;
        let hits = self
            .vectors
            .search(ctx.tenant(), &model.0, &query_vector, top_k)?;
        Ok(hits
            .into_iter()
            .map(|(id, score)| (id, score as f64))
            .collect())
    }

    async fn lexical_candidates(
        &self,
        ctx: &TenantContext,
        request: &QueryRequest,
        top_k: usize,
    ) -> Result<Vec<(String, f64)>> {
        if self.records.capabilities().full_text {
            return self.records.lexical_search(ctx, &request.text, top_k);
        }
        // Capability-driven fallback: scan a bounded candidate set and score
        // it in memory.
        let filter = RecordFilter {
            layers: request.layers.clone(),
            any_tags: request.tags.clone(),
            min_importance: request.min_importance,
            limit: LEXICAL_FALLBACK_SCAN,
            ..Default::default()
        };
        let page = self.records.query(ctx, &filter)?;
        let scorer = LexicalScorer::new(
            page.items
                .iter()
                .map(|r| (r.id.as_str(), r.content.as_str())),
        );
        Ok(scorer.score(&request.text, top_k))
    }

    async fn graph_candidates(
        &self,
        ctx: &TenantContext,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f64)>> {
        Ok(self
            .graph
            .candidates_for_query(ctx, text, top_k)?
            .into_iter()
            .map(|c| (c.record_id, c.score))
            .collect())
    }

    // ------------------------------------------------------------------
    // shaping
    // ------------------------------------------------------------------

    fn load_visible(
        &self,
        ctx: &TenantContext,
        id: &str,
        request: &QueryRequest,
    ) -> Result<Option<MemoryRecord>> {
        let Some(record) = self.records.get(ctx, id)? else {
            return Ok(None);
        };
        if record.staged {
            return Ok(None);
        }
        if !self.policy.visible_to(ctx, record.info_class) {
            return Ok(None);
        }
        if let Some(layers) = &request.layers
            && !layers.contains(&record.layer)
        {
            return Ok(None);
        }
        if !request.tags.is_empty() && !request.tags.iter().any(|t| record.tags.contains(t)) {
            return Ok(None);
        }
        if let Some(min) = request.min_importance
            && record.importance < min
        {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Weighted subscore re-rank over the head of the fused order.
    fn subscore_rerank(
        &self,
        ctx: &TenantContext,
        _query: &str,
        ordered: Vec<(String, f64)>,
        records: &HashMap<String, MemoryRecord>,
        graph_scores: &HashMap<String, f64>,
    ) -> Vec<(String, f64)> {
        let config = ctx.config();
        let retrieval = &config.retrieval;
        let weights = retrieval.subscore_weights;
        let head_len = retrieval.rerank_top_n.min(ordered.len());
        if head_len == 0 {
            return ordered;
        }
        let now = chrono::Utc::now();
        let max_fused = ordered
            .iter()
            .take(head_len)
            .map(|(_, s)| *s)
            .fold(f64::MIN, f64::max)
            .max(f64::EPSILON);
        let max_centrality = graph_scores
            .values()
            .copied()
            .fold(0.0_f64, f64::max)
            .max(f64::EPSILON);

        let cheap_model = config
            .active_models(Some(ModelSpace::Cheap))
            .first()
            .map(|m| m.name.clone());
        let head_ids: Vec<String> = ordered.iter().take(head_len).map(|(id, _)| id.clone()).collect();
        let mut cheap_vectors: HashMap<String, Vec<f32>> = HashMap::new();
        if let Some(model) = &cheap_model {
            for id in &head_ids {
                if let Some(v) = self.vectors.vector_of(ctx.tenant(), model, id) {
                    cheap_vectors.insert(id.clone(), v);
                }
            }
        }
        let diversity = diversity_shaped(&head_ids, &cheap_vectors, retrieval.diversity_tau);

        let mut head: Vec<(String, f64)> = ordered
            .iter()
            .take(head_len)
            .map(|(id, fused)| {
                let record = &records[id];
                let relevance = fused / max_fused;
                let centrality = graph_scores.get(id).copied().unwrap_or(0.0) / max_centrality;
                let score = weights.relevance * relevance
                    + weights.importance * record.importance
                    + weights.recency * recency_score(record.last_accessed_at, now)
                    + weights.centrality * centrality
                    + weights.diversity * diversity.get(id).copied().unwrap_or(1.0)
                    + weights.density * density_score(&record.content);
                (id.clone(), score)
            })
            .collect();
        head.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        head.into_iter().chain(ordered.into_iter().skip(head_len)).collect()
    }

    async fn learned_rerank(
        &self,
        ctx: &TenantContext,
        query: &str,
        ordered: &mut Vec<(String, f64)>,
        records: &HashMap<String, MemoryRecord>,
    ) -> Result<()> {
        let config = ctx.config();
        let retrieval = &config.retrieval;
        let head_len = retrieval.rerank_top_n.min(ordered.len());
        if head_len == 0 {
            return Ok(());
        }
        let provider = retrieval
            .rerank_provider
            .clone()
            .unwrap_or_else(|| TermOverlapReranker::ID.to_string());
        let documents: Vec<String> = ordered
            .iter()
            .take(head_len)
            .map(|(id, _)| records[id].content.clone())
            .collect();
        let deadline = Duration::from_millis(retrieval.rerank_deadline_ms.max(1));

        let scores = self
            .gateway
            .rerank(ctx, &provider, query, &documents, deadline)
            .await?;

        let mut head: Vec<(String, f64)> = ordered
            .iter()
            .take(head_len)
            .zip(scores)
            .map(|((id, _), score)| (id.clone(), score))
            .collect();
        head.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let tail: Vec<(String, f64)> = ordered.split_off(head_len);
        *ordered = head.into_iter().chain(tail).collect();
        Ok(())
    }
}

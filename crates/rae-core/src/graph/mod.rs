//! Semantic graph - typed nodes, directed edges, bounded traversal
//!
//! Nodes and edges are independently addressable entities keyed by stable
//! ids; references are ids, never live pointers. Every artifact carries the
//! tenant, and deletion cascades are explicit and audited by the caller.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::storage::GraphStore;
use crate::tenant::{TenantContext, TenantId};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Hard cap on neighborhood traversal depth, enforced at the API boundary.
pub const MAX_NEIGHBORHOOD_DEPTH: usize = 3;

/// Default traversal depth when callers do not specify one.
pub const DEFAULT_NEIGHBORHOOD_DEPTH: usize = 2;

// ============================================================================
// TYPES
// ============================================================================

/// A typed entity extracted from or attached to records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticNode {
    /// Stable id
    pub id: String,
    /// Owning tenant
    pub tenant: TenantId,
    /// Canonical label (unique per tenant, case-insensitive)
    pub label: String,
    /// Free-form domain label ("service", "person", "incident", ...)
    pub node_type: String,
    /// When the node was first observed
    pub created_at: DateTime<Utc>,
}

impl SemanticNode {
    /// New node owned by `tenant`.
    pub fn new(tenant: TenantId, label: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant,
            label: label.into(),
            node_type: node_type.into(),
            created_at: Utc::now(),
        }
    }
}

/// A directed, typed relation between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    /// Stable id
    pub id: String,
    /// Owning tenant
    pub tenant: TenantId,
    /// Source node id
    pub src: String,
    /// Relation type
    pub predicate: String,
    /// Target node id
    pub dst: String,
    /// Confidence in [0,1], maintained as a bounded moving average
    pub confidence: f64,
    /// How many observations fed the average
    pub corroborations: i64,
    /// Record ids justifying the edge
    pub provenance: Vec<String>,
    /// First observation
    pub created_at: DateTime<Utc>,
    /// Latest observation
    pub updated_at: DateTime<Utc>,
}

impl GraphEdge {
    /// Validate the numeric invariants a backend row must satisfy.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(CoreError::Poisoned(format!(
                "edge {} confidence {} outside [0,1]",
                self.id, self.confidence
            )));
        }
        Ok(())
    }
}

/// Result of a bounded neighborhood query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subgraph {
    /// Nodes reached within the hop bound
    pub nodes: Vec<SemanticNode>,
    /// Edges traversed
    pub edges: Vec<GraphEdge>,
    /// Hop distance from the seed, per node id
    pub distances: HashMap<String, usize>,
}

/// Counters from a provenance-removal cascade.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphCascade {
    /// Edges deleted because the record was their sole provenance
    pub edges_removed: usize,
    /// Nodes deleted because no mentions remained
    pub nodes_removed: usize,
    /// Edges that merely lost one provenance entry
    pub provenance_detached: usize,
}

/// A record candidate produced by the graph strategy.
#[derive(Debug, Clone)]
pub struct GraphCandidate {
    /// Record id
    pub record_id: String,
    /// `1/(1+hops) * product of edge confidences` along the path
    pub score: f64,
    /// Hop distance of the node that mentioned the record
    pub hops: usize,
}

// ============================================================================
// CONFIDENCE
// ============================================================================

/// Fold one observation into an edge's confidence.
///
/// Bounded moving average: each corroboration pulls the average toward the
/// observed value with diminishing step size, clamped to [0,1]. Conflicting
/// evidence (low observed confidence) pulls the average down the same way.
pub fn fold_confidence(current: f64, corroborations: i64, observed: f64) -> f64 {
    let n = corroborations.max(0) as f64;
    let folded = (current * n + observed.clamp(0.0, 1.0)) / (n + 1.0);
    folded.clamp(0.0, 1.0)
}

// ============================================================================
// ENTITY MENTIONS
// ============================================================================

/// Surface-form entity extraction.
///
/// Picks capitalized multi-word runs, ticket-style identifiers (`INC-00042`),
/// and long single tokens. Deliberately conservative; the reflection engine
/// adds richer nodes.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut mentions: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    fn flush(run: &mut Vec<&str>, mentions: &mut Vec<String>, seen: &mut HashSet<String>) {
        if !run.is_empty() {
            let phrase = run.join(" ");
            let key = phrase.to_lowercase();
            if phrase.len() > 2 && seen.insert(key) {
                mentions.push(phrase);
            }
            run.clear();
        }
    }

    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut run: Vec<&str> = Vec::new();

    for raw in &tokens {
        let token = raw.trim_matches(|c: char| !c.is_alphanumeric() && c != '-');
        if token.is_empty() {
            flush(&mut run, &mut mentions, &mut seen);
            continue;
        }
        let is_ticket = token.contains('-')
            && token.chars().any(|c| c.is_ascii_digit())
            && token.chars().any(|c| c.is_ascii_uppercase());
        if is_ticket {
            flush(&mut run, &mut mentions, &mut seen);
            if seen.insert(token.to_lowercase()) {
                mentions.push(token.to_string());
            }
            continue;
        }
        let capitalized = token.chars().next().is_some_and(|c| c.is_uppercase());
        if capitalized {
            run.push(token);
        } else {
            flush(&mut run, &mut mentions, &mut seen);
        }
    }
    flush(&mut run, &mut mentions, &mut seen);
    mentions
}

// ============================================================================
// GRAPH SERVICE
// ============================================================================

/// Tenant-scoped operations over the graph store.
pub struct GraphService {
    store: Arc<dyn GraphStore>,
}

impl GraphService {
    /// Wrap a graph backend.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// The underlying backend.
    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Ensure a node with this label exists and return it.
    pub fn ensure_node(
        &self,
        ctx: &TenantContext,
        label: &str,
        node_type: &str,
    ) -> Result<SemanticNode> {
        if let Some(node) = self.store.node_by_label(ctx, label)? {
            return Ok(node);
        }
        let node = SemanticNode::new(ctx.tenant().clone(), label, node_type);
        self.store.upsert_node(ctx, &node)?;
        Ok(node)
    }

    /// Record one observation of a typed relation, folding confidence.
    pub fn observe_relation(
        &self,
        ctx: &TenantContext,
        src_label: &str,
        predicate: &str,
        dst_label: &str,
        observed_confidence: f64,
        provenance_record: &str,
    ) -> Result<GraphEdge> {
        let src = self.ensure_node(ctx, src_label, "entity")?;
        let dst = self.ensure_node(ctx, dst_label, "entity")?;
        let now = Utc::now();

        let edge = match self.store.get_edge(ctx, &src.id, predicate, &dst.id)? {
            Some(mut existing) => {
                existing.confidence = fold_confidence(
                    existing.confidence,
                    existing.corroborations,
                    observed_confidence,
                );
                existing.corroborations += 1;
                if !existing.provenance.iter().any(|p| p == provenance_record) {
                    existing.provenance.push(provenance_record.to_string());
                }
                existing.updated_at = now;
                existing
            }
            None => GraphEdge {
                id: Uuid::new_v4().to_string(),
                tenant: ctx.tenant().clone(),
                src: src.id.clone(),
                predicate: predicate.to_string(),
                dst: dst.id.clone(),
                confidence: observed_confidence.clamp(0.0, 1.0),
                corroborations: 1,
                provenance: vec![provenance_record.to_string()],
                created_at: now,
                updated_at: now,
            },
        };
        self.store.upsert_edge(ctx, &edge)?;
        Ok(edge)
    }

    /// Extract surface-form mentions from a record and link them as nodes.
    pub fn link_record_mentions(
        &self,
        ctx: &TenantContext,
        record_id: &str,
        content: &str,
    ) -> Result<Vec<SemanticNode>> {
        let mut nodes = Vec::new();
        for mention in extract_mentions(content) {
            let node = self.ensure_node(ctx, &mention, "mention")?;
            self.store.link_mention(ctx, &node.id, record_id)?;
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Bounded BFS neighborhood. `depth` above [`MAX_NEIGHBORHOOD_DEPTH`] is
    /// rejected at this boundary.
    pub fn neighborhood(
        &self,
        ctx: &TenantContext,
        seed_node: &str,
        depth: usize,
        predicates: Option<&[String]>,
    ) -> Result<Subgraph> {
        if depth > MAX_NEIGHBORHOOD_DEPTH {
            return Err(CoreError::InvalidRecord(format!(
                "neighborhood depth {depth} exceeds maximum {MAX_NEIGHBORHOOD_DEPTH}"
            )));
        }
        let seed = self
            .store
            .get_node(ctx, seed_node)?
            .ok_or_else(|| CoreError::InvalidRecord(format!("unknown node {seed_node}")))?;

        let mut subgraph = Subgraph::default();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();

        subgraph.distances.insert(seed.id.clone(), 0);
        visited.insert(seed.id.clone());
        subgraph.nodes.push(seed.clone());
        queue.push_back((seed.id, 0));

        while let Some((node_id, dist)) = queue.pop_front() {
            if dist >= depth {
                continue;
            }
            for edge in self.store.edges_from(ctx, &node_id)? {
                edge.validate()?;
                if let Some(preds) = predicates
                    && !preds.iter().any(|p| p == &edge.predicate)
                {
                    continue;
                }
                let next = edge.dst.clone();
                subgraph.edges.push(edge);
                if visited.insert(next.clone()) {
                    if let Some(node) = self.store.get_node(ctx, &next)? {
                        subgraph.nodes.push(node);
                    }
                    subgraph.distances.insert(next.clone(), dist + 1);
                    queue.push_back((next, dist + 1));
                }
            }
        }
        Ok(subgraph)
    }

    /// Graph strategy for retrieval: match query mentions against node
    /// labels, walk out two hops, and score the mentioned records by
    /// `1/(1+hops) * product of edge confidences`.
    pub fn candidates_for_query(
        &self,
        ctx: &TenantContext,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<GraphCandidate>> {
        if top_k == 0 {
            return Ok(vec![]);
        }
        let mut best: HashMap<String, GraphCandidate> = HashMap::new();

        for mention in extract_mentions(query) {
            let Some(seed) = self.store.node_by_label(ctx, &mention)? else {
                continue;
            };
            // (node, hops, confidence product along the path)
            let mut queue: VecDeque<(String, usize, f64)> = VecDeque::new();
            let mut visited: HashSet<String> = HashSet::new();
            visited.insert(seed.id.clone());
            queue.push_back((seed.id, 0, 1.0));

            while let Some((node_id, hops, conf)) = queue.pop_front() {
                for record_id in self.store.records_for_node(ctx, &node_id)? {
                    let score = conf / (1.0 + hops as f64);
                    best.entry(record_id.clone())
                        .and_modify(|c| {
                            if score > c.score {
                                c.score = score;
                                c.hops = hops;
                            }
                        })
                        .or_insert(GraphCandidate {
                            record_id,
                            score,
                            hops,
                        });
                }
                if hops >= DEFAULT_NEIGHBORHOOD_DEPTH {
                    continue;
                }
                for edge in self.store.edges_from(ctx, &node_id)? {
                    if visited.insert(edge.dst.clone()) {
                        queue.push_back((edge.dst, hops + 1, conf * edge.confidence));
                    }
                }
            }
        }

        let mut candidates: Vec<GraphCandidate> = best.into_values().collect();
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        candidates.truncate(top_k);
        Ok(candidates)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_folds_toward_observations() {
        let c1 = fold_confidence(0.5, 1, 1.0);
        assert!(c1 > 0.5 && c1 <= 1.0);
        let c2 = fold_confidence(c1, 2, 1.0);
        assert!(c2 > c1);
        // Conflicting evidence pulls down
        let c3 = fold_confidence(c2, 3, 0.0);
        assert!(c3 < c2);
    }

    #[test]
    fn confidence_stays_clamped() {
        assert!(fold_confidence(1.0, 100, 2.0) <= 1.0);
        assert!(fold_confidence(0.0, 100, -1.0) >= 0.0);
    }

    #[test]
    fn mentions_pick_up_tickets_and_proper_nouns() {
        let mentions = extract_mentions("rollback of Payment Gateway after INC-00042 fired");
        assert!(mentions.iter().any(|m| m == "Payment Gateway"));
        assert!(mentions.iter().any(|m| m == "INC-00042"));
        assert!(!mentions.iter().any(|m| m == "rollback"));
    }

    #[test]
    fn mentions_dedupe_case_insensitively() {
        let mentions = extract_mentions("Postgres again, postgres always: Postgres");
        let count = mentions
            .iter()
            .filter(|m| m.eq_ignore_ascii_case("postgres"))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn edge_validation_flags_poisoned_confidence() {
        let mut edge = GraphEdge {
            id: "e1".into(),
            tenant: TenantId::from("t1"),
            src: "a".into(),
            predicate: "causes".into(),
            dst: "b".into(),
            confidence: 1.4,
            corroborations: 1,
            provenance: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(edge.validate().is_err());
        edge.confidence = 0.9;
        assert!(edge.validate().is_ok());
    }
}

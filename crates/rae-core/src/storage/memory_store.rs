//! In-memory store
//!
//! HashMap-backed implementation of the record, graph, and blob contracts.
//! Publishes no `full_text` capability, which exercises the engine's
//! in-memory lexical fallback; used by tests and as the reference backend for
//! capability-driven planning.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::error::{CoreError, Result};
use crate::graph::{GraphCascade, GraphEdge, SemanticNode};
use crate::memory::{EmbeddingRecord, MemoryRecord, RecordUpdate};
use crate::storage::{
    BlobStore, Capabilities, GraphStore, Page, RecordFilter, RecordStore,
};
use crate::tenant::{TenantContext, TenantId};

type Key = (TenantId, String);

/// In-memory backend. Honors the session tenant marker trivially (every map
/// key carries the tenant), but publishes neither `full_text` nor
/// `transactions`.
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<Key, MemoryRecord>>,
    embeddings: RwLock<HashMap<(TenantId, String, String), EmbeddingRecord>>,
    nodes: RwLock<HashMap<Key, SemanticNode>>,
    edges: RwLock<HashMap<(TenantId, String, String, String), GraphEdge>>,
    mentions: RwLock<HashMap<(TenantId, String), Vec<String>>>,
    blobs: RwLock<HashMap<Key, Vec<u8>>>,
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(ctx: &TenantContext, id: &str) -> Key {
        (ctx.tenant().clone(), id.to_string())
    }
}

impl RecordStore for InMemoryStore {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            vector_search: false,
            full_text: false,
            transactions: false,
            session_tenant_marker: true,
            ttl: false,
            atomic_graph_traverse: false,
        }
    }

    fn put(&self, ctx: &TenantContext, record: &MemoryRecord) -> Result<()> {
        ctx.assert_owns(&record.tenant, "memory")?;
        self.records
            .write()
            .expect("records lock")
            .insert(Self::key(ctx, &record.id), record.clone());
        Ok(())
    }

    fn get(&self, ctx: &TenantContext, id: &str) -> Result<Option<MemoryRecord>> {
        Ok(self
            .records
            .read()
            .expect("records lock")
            .get(&Self::key(ctx, id))
            .cloned())
    }

    fn delete(&self, ctx: &TenantContext, id: &str) -> Result<bool> {
        let existed = self
            .records
            .write()
            .expect("records lock")
            .remove(&Self::key(ctx, id))
            .is_some();
        self.embeddings
            .write()
            .expect("embeddings lock")
            .retain(|(t, m, _), _| !(t == ctx.tenant() && m == id));
        Ok(existed)
    }

    fn query(&self, ctx: &TenantContext, filter: &RecordFilter) -> Result<Page<MemoryRecord>> {
        let records = self.records.read().expect("records lock");
        let mut items: Vec<MemoryRecord> = records
            .iter()
            .filter(|((t, _), _)| t == ctx.tenant())
            .map(|(_, r)| r.clone())
            .filter(|r| filter.include_staged || !r.staged)
            .filter(|r| {
                filter
                    .layers
                    .as_ref()
                    .is_none_or(|layers| layers.contains(&r.layer))
            })
            .filter(|r| {
                filter.any_tags.is_empty()
                    || filter.any_tags.iter().any(|t| r.tags.contains(t))
            })
            .filter(|r| filter.min_importance.is_none_or(|m| r.importance >= m))
            .filter(|r| filter.max_importance.is_none_or(|m| r.importance <= m))
            .filter(|r| filter.created_after.is_none_or(|t| r.created_at >= t))
            .filter(|r| filter.created_before.is_none_or(|t| r.created_at <= t))
            .filter(|r| {
                filter
                    .info_class_at_most
                    .is_none_or(|max| r.info_class <= max)
            })
            .collect();
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        if let Some(cursor) = &filter.cursor {
            let (ts, id) = cursor
                .split_once('|')
                .ok_or_else(|| CoreError::InvalidRecord("malformed cursor".into()))?;
            let ts = DateTime::parse_from_rfc3339(ts)
                .map_err(|_| CoreError::InvalidRecord("malformed cursor timestamp".into()))?
                .with_timezone(&Utc);
            items.retain(|r| r.created_at < ts || (r.created_at == ts && r.id.as_str() < id));
        }

        let limit = if filter.limit == 0 { 100 } else { filter.limit };
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
        _ctx: &TenantContext,
        _query: &str,
        _top_k: usize,
    ) -> Result<Vec<(String, f64)>> {
        // No full_text capability; the engine scores candidates in memory.
        Err(CoreError::BackendUnavailable(
            "in-memory store has no full-text index".into(),
        ))
    }

    fn apply_update(
        &self,
        ctx: &TenantContext,
        id: &str,
        update: &RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<MemoryRecord> {
        let mut records = self.records.write().expect("records lock");
        let record = records
            .get_mut(&Self::key(ctx, id))
            .ok_or_else(|| CoreError::InvalidRecord(format!("unknown memory {id}")))?;
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
        Ok(record.clone())
    }

    fn apply_decay(
        &self,
        ctx: &TenantContext,
        id: &str,
        importance: f64,
        decayed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut records = self.records.write().expect("records lock");
        if let Some(record) = records.get_mut(&Self::key(ctx, id)) {
            record.importance = importance.clamp(0.0, 1.0);
            record.last_decayed_at = Some(decayed_at);
        }
        Ok(())
    }

    fn commit_staged(&self, ctx: &TenantContext, id: &str) -> Result<()> {
        let mut records = self.records.write().expect("records lock");
        match records.get_mut(&Self::key(ctx, id)) {
            Some(record) if record.staged => {
                record.staged = false;
                Ok(())
            }
            _ => Err(CoreError::InvalidRecord(format!(
                "no staged record {id} to commit"
            ))),
        }
    }

    fn prune_stale_staged(&self, ctx: &TenantContext, older_than: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.write().expect("records lock");
        let before = records.len();
        records.retain(|(t, _), r| {
            !(t == ctx.tenant() && r.staged && r.created_at < older_than)
        });
        Ok(before - records.len())
    }

    fn find_by_hash(
        &self,
        ctx: &TenantContext,
        content_hash: &str,
        source: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let records = self.records.read().expect("records lock");
        Ok(records
            .iter()
            .filter(|((t, _), r)| {
                t == ctx.tenant()
                    && !r.staged
                    && r.content_hash == content_hash
                    && r.source.as_deref() == source
                    && r.created_at >= since
            })
            .max_by_key(|(_, r)| r.created_at)
            .map(|((_, id), _)| id.clone()))
    }

    fn highwater(&self, ctx: &TenantContext) -> Result<Option<DateTime<Utc>>> {
        let records = self.records.read().expect("records lock");
        Ok(records
            .iter()
            .filter(|((t, _), _)| t == ctx.tenant())
            .map(|(_, r)| r.created_at)
            .max())
    }

    fn put_embedding(&self, ctx: &TenantContext, embedding: &EmbeddingRecord) -> Result<()> {
        ctx.assert_owns(&embedding.tenant, "embedding")?;
        self.embeddings.write().expect("embeddings lock").insert(
            (
                ctx.tenant().clone(),
                embedding.memory_id.clone(),
                embedding.model.clone(),
            ),
            embedding.clone(),
        );
        Ok(())
    }

    fn get_embedding(
        &self,
        ctx: &TenantContext,
        memory_id: &str,
        model: &str,
    ) -> Result<Option<EmbeddingRecord>> {
        Ok(self
            .embeddings
            .read()
            .expect("embeddings lock")
            .get(&(
                ctx.tenant().clone(),
                memory_id.to_string(),
                model.to_string(),
            ))
            .cloned())
    }

    fn embeddings_for(
        &self,
        ctx: &TenantContext,
        memory_id: &str,
    ) -> Result<Vec<EmbeddingRecord>> {
        Ok(self
            .embeddings
            .read()
            .expect("embeddings lock")
            .iter()
            .filter(|((t, m, _), _)| t == ctx.tenant() && m == memory_id)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn mark_embeddings_stale(&self, ctx: &TenantContext, memory_id: &str) -> Result<usize> {
        let mut embeddings = self.embeddings.write().expect("embeddings lock");
        let mut marked = 0;
        for ((t, m, _), e) in embeddings.iter_mut() {
            if t == ctx.tenant() && m == memory_id {
                e.stale = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    fn missing_embeddings(
        &self,
        ctx: &TenantContext,
        models: &[String],
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        let records = self.records.read().expect("records lock");
        let embeddings = self.embeddings.read().expect("embeddings lock");
        let mut pairs = Vec::new();
        for ((t, id), record) in records.iter() {
            if t != ctx.tenant() || record.staged {
                continue;
            }
            for model in models {
                let live = embeddings
                    .get(&(t.clone(), id.clone(), model.clone()))
                    .is_some_and(|e| !e.stale && e.content_hash == record.content_hash);
                if !live {
                    pairs.push((id.clone(), model.clone()));
                    if pairs.len() >= limit {
                        return Ok(pairs);
                    }
                }
            }
        }
        Ok(pairs)
    }
}

impl GraphStore for InMemoryStore {
    fn capabilities(&self) -> Capabilities {
        RecordStore::capabilities(self)
    }

    fn upsert_node(&self, ctx: &TenantContext, node: &SemanticNode) -> Result<()> {
        ctx.assert_owns(&node.tenant, "semantic node")?;
        self.nodes
            .write()
            .expect("nodes lock")
            .insert(Self::key(ctx, &node.id), node.clone());
        Ok(())
    }

    fn get_node(&self, ctx: &TenantContext, id: &str) -> Result<Option<SemanticNode>> {
        Ok(self
            .nodes
            .read()
            .expect("nodes lock")
            .get(&Self::key(ctx, id))
            .cloned())
    }

    fn node_by_label(&self, ctx: &TenantContext, label: &str) -> Result<Option<SemanticNode>> {
        Ok(self
            .nodes
            .read()
            .expect("nodes lock")
            .iter()
            .filter(|((t, _), _)| t == ctx.tenant())
            .map(|(_, n)| n)
            .find(|n| n.label.eq_ignore_ascii_case(label))
            .cloned())
    }

    fn link_mention(&self, ctx: &TenantContext, node_id: &str, record_id: &str) -> Result<()> {
        let mut mentions = self.mentions.write().expect("mentions lock");
        let entry = mentions
            .entry((ctx.tenant().clone(), node_id.to_string()))
            .or_default();
        if !entry.iter().any(|r| r == record_id) {
            entry.push(record_id.to_string());
        }
        Ok(())
    }

    fn upsert_edge(&self, ctx: &TenantContext, edge: &GraphEdge) -> Result<()> {
        ctx.assert_owns(&edge.tenant, "graph edge")?;
        self.edges.write().expect("edges lock").insert(
            (
                ctx.tenant().clone(),
                edge.src.clone(),
                edge.predicate.clone(),
                edge.dst.clone(),
            ),
            edge.clone(),
        );
        Ok(())
    }

    fn get_edge(
        &self,
        ctx: &TenantContext,
        src: &str,
        predicate: &str,
        dst: &str,
    ) -> Result<Option<GraphEdge>> {
        Ok(self
            .edges
            .read()
            .expect("edges lock")
            .get(&(
                ctx.tenant().clone(),
                src.to_string(),
                predicate.to_string(),
                dst.to_string(),
            ))
            .cloned())
    }

    fn edges_from(&self, ctx: &TenantContext, node_id: &str) -> Result<Vec<GraphEdge>> {
        Ok(self
            .edges
            .read()
            .expect("edges lock")
            .iter()
            .filter(|((t, src, _, _), _)| t == ctx.tenant() && src == node_id)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn records_for_node(&self, ctx: &TenantContext, node_id: &str) -> Result<Vec<String>> {
        Ok(self
            .mentions
            .read()
            .expect("mentions lock")
            .get(&(ctx.tenant().clone(), node_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn nodes_for_record(&self, ctx: &TenantContext, record_id: &str) -> Result<Vec<SemanticNode>> {
        let mentions = self.mentions.read().expect("mentions lock");
        let nodes = self.nodes.read().expect("nodes lock");
        Ok(mentions
            .iter()
            .filter(|((t, _), records)| {
                t == ctx.tenant() && records.iter().any(|r| r == record_id)
            })
            .filter_map(|((t, node_id), _)| nodes.get(&(t.clone(), node_id.clone())).cloned())
            .collect())
    }

    fn delete_node_cascade(&self, ctx: &TenantContext, node_id: &str) -> Result<()> {
        self.edges
            .write()
            .expect("edges lock")
            .retain(|(t, src, _, dst), _| {
                !(t == ctx.tenant() && (src == node_id || dst == node_id))
            });
        self.mentions
            .write()
            .expect("mentions lock")
            .remove(&(ctx.tenant().clone(), node_id.to_string()));
        self.nodes
            .write()
            .expect("nodes lock")
            .remove(&Self::key(ctx, node_id));
        Ok(())
    }

    fn prune_edges_below(&self, ctx: &TenantContext, floor: f64) -> Result<usize> {
        let mut edges = self.edges.write().expect("edges lock");
        let before = edges.len();
        edges.retain(|(t, _, _, _), e| !(t == ctx.tenant() && e.confidence < floor));
        Ok(before - edges.len())
    }

    fn remove_record_provenance(
        &self,
        ctx: &TenantContext,
        record_id: &str,
    ) -> Result<GraphCascade> {
        let mut cascade = GraphCascade::default();
        {
            let mut edges = self.edges.write().expect("edges lock");
            let keys: Vec<_> = edges
                .iter()
                .filter(|((t, _, _, _), e)| {
                    t == ctx.tenant() && e.provenance.iter().any(|p| p == record_id)
                })
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                if let Some(edge) = edges.get_mut(&key) {
                    edge.provenance.retain(|p| p != record_id);
                    if edge.provenance.is_empty() {
                        edges.remove(&key);
                        cascade.edges_removed += 1;
                    } else {
                        cascade.provenance_detached += 1;
                    }
                }
            }
        }

        let affected: Vec<String> = {
            let mut mentions = self.mentions.write().expect("mentions lock");
            let mut affected = Vec::new();
            for ((t, node_id), records) in mentions.iter_mut() {
                if t == ctx.tenant() && records.iter().any(|r| r == record_id) {
                    records.retain(|r| r != record_id);
                    affected.push(node_id.clone());
                }
            }
            affected
        };

        for node_id in affected {
            let orphaned = {
                let mentions = self.mentions.read().expect("mentions lock");
                let edges = self.edges.read().expect("edges lock");
                let no_mentions = mentions
                    .get(&(ctx.tenant().clone(), node_id.clone()))
                    .is_none_or(|v| v.is_empty());
                let no_edges = !edges
                    .keys()
                    .any(|(t, src, _, dst)| t == ctx.tenant() && (src == &node_id || dst == &node_id));
                no_mentions && no_edges
            };
            if orphaned {
                self.delete_node_cascade(ctx, &node_id)?;
                cascade.nodes_removed += 1;
            }
        }
        Ok(cascade)
    }

    fn graph_counts(&self, ctx: &TenantContext) -> Result<(i64, i64)> {
        let nodes = self
            .nodes
            .read()
            .expect("nodes lock")
            .keys()
            .filter(|(t, _)| t == ctx.tenant())
            .count() as i64;
        let edges = self
            .edges
            .read()
            .expect("edges lock")
            .keys()
            .filter(|(t, _, _, _)| t == ctx.tenant())
            .count() as i64;
        Ok((nodes, edges))
    }
}

impl BlobStore for InMemoryStore {
    fn put_blob(&self, ctx: &TenantContext, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .expect("blobs lock")
            .insert(Self::key(ctx, key), bytes.to_vec());
        Ok(())
    }

    fn get_blob(&self, ctx: &TenantContext, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .read()
            .expect("blobs lock")
            .get(&Self::key(ctx, key))
            .cloned())
    }

    fn delete_blob(&self, ctx: &TenantContext, key: &str) -> Result<bool> {
        Ok(self
            .blobs
            .write()
            .expect("blobs lock")
            .remove(&Self::key(ctx, key))
            .is_some())
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

    fn ctx(tenant: &str) -> TenantContext {
        TenantRegistry::new().context(tenant, "tester")
    }

    #[test]
    fn publishes_no_full_text() {
        let store = InMemoryStore::new();
        assert!(!RecordStore::capabilities(&store).full_text);
        assert!(RecordStore::capabilities(&store).session_tenant_marker);
        let c = ctx("t1");
        assert!(matches!(
            store.lexical_search(&c, "query", 5),
            Err(CoreError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn tenant_isolation_holds() {
        let store = InMemoryStore::new();
        let c1 = ctx("t1");
        let c2 = ctx("t2");
        let rec = RecordDraft::new("alpha")
            .into_record(c1.tenant().clone(), Utc::now())
            .unwrap();
        store.put(&c1, &rec).unwrap();

        assert!(store.get(&c2, &rec.id).unwrap().is_none());
        assert!(store.query(&c2, &RecordFilter::default()).unwrap().items.is_empty());
    }

    #[test]
    fn dedup_probe_respects_source() {
        let store = InMemoryStore::new();
        let c = ctx("t1");
        let mut rec = RecordDraft::new("same content")
            .into_record(c.tenant().clone(), Utc::now())
            .unwrap();
        rec.source = Some("cli".into());
        store.put(&c, &rec).unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(
            store
                .find_by_hash(&c, &rec.content_hash, Some("cli"), since)
                .unwrap(),
            Some(rec.id.clone())
        );
        assert!(
            store
                .find_by_hash(&c, &rec.content_hash, Some("other"), since)
                .unwrap()
                .is_none()
        );
    }
}

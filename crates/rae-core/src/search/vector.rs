//! Vector catalog
//!
//! Multi-model vector storage with per-(tenant, model) shards. Vectors from
//! different models are not commensurable, so a shard never answers for
//! another model; cross-space ranking is impossible by construction, and a
//! shard never holds another tenant's vectors.
//!
//! With the `vector-search` feature each shard carries a USearch HNSW index;
//! without it, search falls back to an exact cosine scan over the shard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{CoreError, Result};
#[cfg(not(feature = "vector-search"))]
use crate::search::cosine_similarity;
use crate::tenant::TenantId;

#[cfg(feature = "vector-search")]
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

// ============================================================================
// HNSW INDEX (feature-gated)
// ============================================================================

/// HNSW tuning knobs.
#[cfg(feature = "vector-search")]
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Number of dimensions
    pub dimensions: usize,
    /// HNSW connectivity parameter
    pub connectivity: usize,
    /// Expansion factor for adding vectors
    pub expansion_add: usize,
    /// Expansion factor for searching
    pub expansion_search: usize,
}

#[cfg(feature = "vector-search")]
impl VectorIndexConfig {
    /// Defaults tuned for recall over memory.
    pub fn for_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
        }
    }
}

/// String-keyed HNSW index over one model space.
#[cfg(feature = "vector-search")]
pub struct VectorIndex {
    index: Index,
    dimensions: usize,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

#[cfg(feature = "vector-search")]
impl VectorIndex {
    /// Create an index for `config.dimensions`-sized vectors, cosine metric.
    pub fn with_config(config: VectorIndexConfig) -> Result<Self> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::I8,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };
        let index = Index::new(&options)
            .map_err(|e| CoreError::Init(format!("vector index creation failed: {e}")))?;
        Ok(Self {
            index,
            dimensions: config.dimensions,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    fn reserve(&self, capacity: usize) -> Result<()> {
        self.index
            .reserve(capacity)
            .map_err(|e| CoreError::Init(format!("vector index reserve failed: {e}")))
    }

    /// Add or replace a vector under a string key.
    pub fn add(&mut self, key: &str, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(CoreError::InvalidRecord(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimensions
            )));
        }

        if let Some(&existing_id) = self.key_to_id.get(key) {
            self.index
                .remove(existing_id)
                .map_err(|e| CoreError::BackendUnavailable(format!("vector remove failed: {e}")))?;
            self.reserve(self.index.size() + 1)?;
            self.index
                .add(existing_id, vector)
                .map_err(|e| CoreError::BackendUnavailable(format!("vector add failed: {e}")))?;
            return Ok(());
        }

        // usearch requires reserve() ahead of add() once capacity is reached.
        let capacity = self.index.capacity();
        let size = self.index.size();
        if size >= capacity {
            self.reserve(std::cmp::max(capacity * 2, 16))?;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, vector)
            .map_err(|e| CoreError::BackendUnavailable(format!("vector add failed: {e}")))?;
        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        Ok(())
    }

    /// Remove a vector. Returns whether the key was present.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        if let Some(id) = self.key_to_id.remove(key) {
            self.id_to_key.remove(&id);
            self.index
                .remove(id)
                .map_err(|e| CoreError::BackendUnavailable(format!("vector remove failed: {e}")))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Approximate nearest neighbors as `(key, similarity)`, best first.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dimensions {
            return Err(CoreError::InvalidRecord(format!(
                "query has {} dimensions, index expects {}",
                query.len(),
                self.dimensions
            )));
        }
        if self.index.size() == 0 {
            return Ok(vec![]);
        }
        let results = self
            .index
            .search(query, limit)
            .map_err(|e| CoreError::BackendUnavailable(format!("vector search failed: {e}")))?;

        let mut out = Vec::with_capacity(results.keys.len());
        for (key, distance) in results.keys.iter().zip(results.distances.iter()) {
            if let Some(string_key) = self.id_to_key.get(key) {
                out.push((string_key.clone(), 1.0 - distance));
            }
        }
        Ok(out)
    }
}

// ============================================================================
// SHARDS
// ============================================================================

struct Shard {
    dim: usize,
    /// Source of truth for diversity/novelty lookups, kept in both modes.
    vectors: HashMap<String, Vec<f32>>,
    #[cfg(feature = "vector-search")]
    index: VectorIndex,
}

impl Shard {
    fn new(dim: usize) -> Result<Self> {
        Ok(Self {
            dim,
            vectors: HashMap::new(),
            #[cfg(feature = "vector-search")]
            index: VectorIndex::with_config(VectorIndexConfig::for_dimensions(dim))?,
        })
    }

    fn upsert(&mut self, memory_id: &str, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dim {
            return Err(CoreError::InvalidRecord(format!(
                "vector has {} dimensions, shard expects {}",
                vector.len(),
                self.dim
            )));
        }
        #[cfg(feature = "vector-search")]
        self.index.add(memory_id, &vector)?;
        self.vectors.insert(memory_id.to_string(), vector);
        Ok(())
    }

    fn remove(&mut self, memory_id: &str) -> Result<bool> {
        let present = self.vectors.remove(memory_id).is_some();
        #[cfg(feature = "vector-search")]
        if present {
            self.index.remove(memory_id)?;
        }
        Ok(present)
    }

    fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<(String, f32)>> {
        if top_k == 0 || self.vectors.is_empty() {
            return Ok(vec![]);
        }
        #[cfg(feature = "vector-search")]
        {
            self.index.search(query, top_k)
        }
        #[cfg(not(feature = "vector-search"))]
        {
            if query.len() != self.dim {
                return Err(CoreError::InvalidRecord(format!(
                    "query has {} dimensions, shard expects {}",
                    query.len(),
                    self.dim
                )));
            }
            let mut scored: Vec<(String, f32)> = self
                .vectors
                .iter()
                .map(|(id, v)| (id.clone(), cosine_similarity(query, v)))
                .collect();
            scored.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            scored.truncate(top_k);
            Ok(scored)
        }
    }
}

// ============================================================================
// CATALOG
// ============================================================================

type ShardKey = (TenantId, String);

/// Per-(tenant, model) vector shards. The shard key bakes the tenant in, so
/// a search can never surface another tenant's vectors.
#[derive(Default)]
pub struct VectorCatalog {
    shards: RwLock<HashMap<ShardKey, Arc<Mutex<Shard>>>>,
}

impl VectorCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, tenant: &TenantId, model: &str, dim: usize) -> Result<Arc<Mutex<Shard>>> {
        let key = (tenant.clone(), model.to_string());
        if let Some(shard) = self.shards.read().expect("catalog lock").get(&key) {
            return Ok(Arc::clone(shard));
        }
        let mut shards = self.shards.write().expect("catalog lock");
        if let Some(shard) = shards.get(&key) {
            return Ok(Arc::clone(shard));
        }
        let shard = Arc::new(Mutex::new(Shard::new(dim)?));
        shards.insert(key, Arc::clone(&shard));
        Ok(shard)
    }

    fn existing_shard(&self, tenant: &TenantId, model: &str) -> Option<Arc<Mutex<Shard>>> {
        self.shards
            .read()
            .expect("catalog lock")
            .get(&(tenant.clone(), model.to_string()))
            .cloned()
    }

    /// Insert or replace the vector for `(tenant, memory, model)`.
    pub fn upsert(
        &self,
        tenant: &TenantId,
        model: &str,
        dim: usize,
        memory_id: &str,
        vector: Vec<f32>,
    ) -> Result<()> {
        let shard = self.shard(tenant, model, dim)?;
        let mut shard = shard.lock().expect("shard lock");
        shard.upsert(memory_id, vector)
    }

    /// Nearest neighbors within one model space, `(memory_id, similarity)`.
    pub fn search(
        &self,
        tenant: &TenantId,
        model: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        match self.existing_shard(tenant, model) {
            Some(shard) => shard.lock().expect("shard lock").search(query, top_k),
            None => Ok(vec![]),
        }
    }

    /// The stored vector for a memory under one model, for diversity and
    /// novelty checks.
    pub fn vector_of(&self, tenant: &TenantId, model: &str, memory_id: &str) -> Option<Vec<f32>> {
        let shard = self.existing_shard(tenant, model)?;
        let shard = shard.lock().expect("shard lock");
        shard.vectors.get(memory_id).cloned()
    }

    /// Drop a memory's vectors across every model space of the tenant.
    pub fn remove_memory(&self, tenant: &TenantId, memory_id: &str) -> Result<usize> {
        let shards: Vec<Arc<Mutex<Shard>>> = self
            .shards
            .read()
            .expect("catalog lock")
            .iter()
            .filter(|((t, _), _)| t == tenant)
            .map(|(_, s)| Arc::clone(s))
            .collect();
        let mut removed = 0;
        for shard in shards {
            if shard.lock().expect("shard lock").remove(memory_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Vector count for one shard (stats and tests).
    pub fn shard_len(&self, tenant: &TenantId, model: &str) -> usize {
        self.existing_shard(tenant, model)
            .map(|s| s.lock().expect("shard lock").vectors.len())
            .unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_of(seed: f32, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|i| ((i as f32 + seed) / dim as f32).sin())
            .collect()
    }

    #[test]
    fn upsert_and_search_same_space() {
        let catalog = VectorCatalog::new();
        let tenant = TenantId::from("t1");
        let v1 = vec_of(1.0, 32);
        let v2 = vec_of(50.0, 32);
        catalog.upsert(&tenant, "m1", 32, "a", v1.clone()).unwrap();
        catalog.upsert(&tenant, "m1", 32, "b", v2).unwrap();

        let hits = catalog.search(&tenant, "m1", &v1, 2).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0, "a");
    }

    #[test]
    fn shards_isolate_tenants() {
        let catalog = VectorCatalog::new();
        let t1 = TenantId::from("t1");
        let t2 = TenantId::from("t2");
        let v = vec_of(1.0, 16);
        catalog.upsert(&t1, "m1", 16, "a", v.clone()).unwrap();

        assert!(catalog.search(&t2, "m1", &v, 5).unwrap().is_empty());
        assert_eq!(catalog.shard_len(&t2, "m1"), 0);
    }

    #[test]
    fn model_spaces_never_mix() {
        let catalog = VectorCatalog::new();
        let tenant = TenantId::from("t1");
        let v = vec_of(1.0, 16);
        catalog.upsert(&tenant, "cheap-model", 16, "a", v.clone()).unwrap();

        assert!(
            catalog
                .search(&tenant, "heavy-model", &v, 5)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let catalog = VectorCatalog::new();
        let tenant = TenantId::from("t1");
        catalog
            .upsert(&tenant, "m1", 16, "a", vec_of(1.0, 16))
            .unwrap();
        assert!(
            catalog
                .upsert(&tenant, "m1", 16, "b", vec_of(1.0, 8))
                .is_err()
        );
    }

    #[test]
    fn remove_memory_clears_all_spaces() {
        let catalog = VectorCatalog::new();
        let tenant = TenantId::from("t1");
        catalog
            .upsert(&tenant, "m1", 16, "a", vec_of(1.0, 16))
            .unwrap();
        catalog
            .upsert(&tenant, "m2", 8, "a", vec_of(1.0, 8))
            .unwrap();

        assert_eq!(catalog.remove_memory(&tenant, "a").unwrap(), 2);
        assert_eq!(catalog.shard_len(&tenant, "m1"), 0);
        assert_eq!(catalog.shard_len(&tenant, "m2"), 0);
    }
}

//! Retrieval machinery
//!
//! - Vector catalog: per-(tenant, model) ANN shards, never fused across
//!   model spaces
//! - Keyword scoring: FTS5 sanitization plus an in-memory lexical fallback
//!   for backends without full-text support
//! - Hybrid fusion: Reciprocal Rank Fusion with deterministic tie-breaks
//! - The retrieval engine itself: fan-out, fusion, shaping, optional rerank

mod engine;
mod hybrid;
mod keyword;
mod vector;

pub use engine::{
    Degradation, QueryRequest, QueryResponse, RankedMemory, RetrievalEngine, StrategyKind,
};
pub use hybrid::{
    TieBreakMeta, density_score, diversity_shaped, reciprocal_rank_fusion, recency_score,
    sort_with_tie_breaks,
};
pub use keyword::{LexicalScorer, sanitize_fts5_query};
pub use vector::VectorCatalog;

#[cfg(feature = "vector-search")]
pub use vector::{VectorIndex, VectorIndexConfig};

// ============================================================================
// VECTOR MATH
// ============================================================================

/// Compute cosine similarity between two vectors.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot_product / denominator
    } else {
        0.0
    }
}

/// Serialize a vector to little-endian bytes for blob storage.
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize a vector from little-endian bytes.
pub fn vector_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_is_one() {
        let a = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.0001);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.0001);
    }

    #[test]
    fn vector_bytes_roundtrip() {
        let v = vec![1.5_f32, -2.25, 0.0, 3.125];
        let bytes = vector_to_bytes(&v);
        assert_eq!(bytes.len(), 16);
        assert_eq!(vector_from_bytes(&bytes), v);
    }
}

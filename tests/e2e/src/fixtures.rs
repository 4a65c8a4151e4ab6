//! Test fixtures: engine construction against temp-file SQLite (full-text
//! capable) or in-memory backends (lexical fallback), plus deterministic
//! mock providers so no test ever touches the network or downloads a model.

use std::sync::Arc;

use async_trait::async_trait;
use rae_core::llm::{
    Completion, CompletionProvider, EmbeddingProvider, ProviderError, RerankProvider, TokenUsage,
};
use rae_core::tenant::{EmbeddingModelConfig, LlmProfile, ModelSpace, ProviderRoute};
use rae_core::{Rae, TenantId};
use tempfile::TempDir;

/// Model name the mock embedder serves.
pub const MOCK_CHEAP_MODEL: &str = "mock-cheap";

/// Mock embedding dimensionality.
pub const MOCK_DIM: usize = 32;

// ============================================================================
// MOCK PROVIDERS
// ============================================================================

/// Deterministic bag-of-words embedder: token hashes accumulate into a fixed
/// number of buckets, L2-normalized. Shared tokens yield high cosine, which
/// is enough structure for fusion and diversity tests.
pub struct MockEmbedder;

fn token_bucket(token: &str) -> usize {
    let mut hash: u64 = 1469598103934665603;
    for b in token.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    (hash % MOCK_DIM as u64) as usize
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    fn id(&self) -> &str {
        "mock-embed"
    }
    fn external(&self) -> bool {
        false
    }
    fn cost_per_1k_tokens(&self) -> f64 {
        0.0
    }
    fn dimensions(&self) -> usize {
        MOCK_DIM
    }
    async fn embed(&self, _model: &str, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vector = vec![0.0_f32; MOCK_DIM];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[token_bucket(&token.to_lowercase())] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }
}

/// Reranker priced high enough that any batch blows a cent-sized budget.
pub struct PricedReranker;

#[async_trait]
impl RerankProvider for PricedReranker {
    fn id(&self) -> &str {
        "priced-rerank"
    }
    fn external(&self) -> bool {
        true
    }
    fn cost_per_1k_tokens(&self) -> f64 {
        1000.0
    }
    async fn rerank(&self, _query: &str, documents: &[String]) -> Result<Vec<f64>, ProviderError> {
        Ok(vec![1.0; documents.len()])
    }
}

/// Completion provider priced high enough to trip worker budget deferral.
pub struct PricedCompletion;

#[async_trait]
impl CompletionProvider for PricedCompletion {
    fn id(&self) -> &str {
        "priced-complete"
    }
    fn external(&self) -> bool {
        true
    }
    fn cost_per_1k_tokens(&self) -> f64 {
        1000.0
    }
    async fn complete(
        &self,
        _model: &str,
        _prompt: &str,
        _max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        Ok(Completion {
            text: "a costly insight".into(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 10,
            },
        })
    }
}

// ============================================================================
// ENGINE FIXTURES
// ============================================================================

/// SQLite-backed engine in a temp dir. Keep the `TempDir` alive for the test.
pub fn rae_sqlite() -> (Rae, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let rae = Rae::builder()
        .db_path(dir.path().join("rae-test.db"))
        .build()
        .expect("engine");
    rae.gateway()
        .register_embedder(MOCK_CHEAP_MODEL, Arc::new(MockEmbedder));
    rae.gateway().register_reranker(Arc::new(PricedReranker));
    rae.gateway().register_completion(Arc::new(PricedCompletion));
    (rae, dir)
}

/// In-memory engine (no full-text capability; exercises the lexical
/// fallback).
pub fn rae_mem() -> Rae {
    let rae = Rae::builder().in_memory().build().expect("engine");
    rae.gateway()
        .register_embedder(MOCK_CHEAP_MODEL, Arc::new(MockEmbedder));
    rae.gateway().register_reranker(Arc::new(PricedReranker));
    rae
}

/// Point a tenant at the mock embedding model and drop the promotion age
/// gate so lifecycle tests run instantly.
pub fn configure_tenant(rae: &Rae, tenant: &str) {
    rae.registry().update(&TenantId::from(tenant), |config| {
        config.embedding_models = vec![EmbeddingModelConfig {
            name: MOCK_CHEAP_MODEL.to_string(),
            space: ModelSpace::Cheap,
            dim: MOCK_DIM,
            active: true,
        }];
        config.layers.admission_thresholds.working_min_age_secs = 0;
    });
}

/// Additionally route the tenant's reflection profile through the priced
/// completion provider (budget-deferral scenarios).
pub fn configure_priced_reflection(rae: &Rae, tenant: &str) {
    rae.registry().update(&TenantId::from(tenant), |config| {
        config.llm_profiles.insert(
            "reflect".to_string(),
            LlmProfile {
                routes: vec![ProviderRoute {
                    provider: "priced-complete".into(),
                    model: "costly-v1".into(),
                }],
                raw: false,
            },
        );
    });
}

/// Let the audit pipeline drain.
pub async fn settle_audit() {
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
}

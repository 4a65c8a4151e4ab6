//! Model providers
//!
//! Async provider traits plus the built-in implementations: a local
//! extractive completion provider (the safe zero-config default), a
//! term-overlap reranker, an OpenAI-compatible HTTP client, and the local
//! fastembed encoder behind the `embeddings` feature.

use async_trait::async_trait;
use serde::Deserialize;

// ============================================================================
// PROVIDER ERRORS
// ============================================================================

/// Failures surfaced by providers. Transient variants fall through a
/// profile's route chain; the rest surface.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Upstream rate limit
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Call timed out
    #[error("provider call timed out")]
    Timeout,
    /// Provider unreachable or erroring
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// Response did not parse
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether the next route in a fallback chain should be tried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_) | ProviderError::Timeout | ProviderError::Unavailable(_)
        )
    }
}

// ============================================================================
// COMPLETIONS
// ============================================================================

/// Token counts reported by a provider (estimated for local providers).
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    /// Prompt-side tokens
    pub input_tokens: u64,
    /// Generated tokens
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Total tokens billed.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A completion plus its accounting data.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Generated text
    pub text: String,
    /// Token accounting
    pub usage: TokenUsage,
}

/// Rough token estimate used for pre-call budget admission.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

/// Completion model behind the gateway.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider id referenced by profile routes.
    fn id(&self) -> &str;

    /// Whether calls leave the process (redaction applies).
    fn external(&self) -> bool;

    /// USD per 1k tokens; 0.0 for local providers.
    fn cost_per_1k_tokens(&self) -> f64;

    /// Generate a completion.
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<Completion, ProviderError>;
}

/// Embedding model behind the gateway.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider id.
    fn id(&self) -> &str;

    /// Whether calls leave the process.
    fn external(&self) -> bool;

    /// USD per 1k tokens; 0.0 for local providers.
    fn cost_per_1k_tokens(&self) -> f64;

    /// Output dimensionality.
    fn dimensions(&self) -> usize;

    /// Encode one text.
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Reranking model behind the gateway.
#[async_trait]
pub trait RerankProvider: Send + Sync {
    /// Provider id.
    fn id(&self) -> &str;

    /// Whether calls leave the process.
    fn external(&self) -> bool;

    /// USD per 1k tokens; 0.0 for local providers.
    fn cost_per_1k_tokens(&self) -> f64;

    /// Score each document against the query; higher is more relevant.
    async fn rerank(&self, query: &str, documents: &[String])
    -> Result<Vec<f64>, ProviderError>;
}

// ============================================================================
// EXTRACTIVE COMPLETION (local default)
// ============================================================================

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "of", "to", "in", "on", "for", "with", "is", "was",
    "are", "were", "be", "been", "it", "this", "that", "from", "by", "at", "as", "we", "our",
];

fn content_terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Local extractive completion provider.
///
/// Selects the highest-signal sentences from the prompt by term frequency
/// and returns them in original order. Deterministic, free, and never leaves
/// the process, which makes it the conservative default route for
/// summarization and reflection drafting.
pub struct ExtractiveProvider;

impl ExtractiveProvider {
    /// The provider id profiles reference.
    pub const ID: &'static str = "extractive";

    /// Extract the highest-signal sentences up to a character budget.
    pub fn extract(text: &str, max_chars: usize) -> String {
        let sentences: Vec<&str> = text
            .split(['.', '\n', '!', '?'])
            .map(str::trim)
            .filter(|s| s.len() > 15)
            .collect();
        if sentences.is_empty() {
            return text.trim().chars().take(max_chars).collect();
        }

        let mut freq: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for term in content_terms(text) {
            *freq.entry(term).or_default() += 1;
        }

        let mut scored: Vec<(usize, &str, f64)> = sentences
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let terms = content_terms(s);
                let score = if terms.is_empty() {
                    0.0
                } else {
                    terms
                        .iter()
                        .map(|t| freq.get(t).copied().unwrap_or(0) as f64)
                        .sum::<f64>()
                        / terms.len() as f64
                };
                (i, *s, score)
            })
            .collect();
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut picked: Vec<(usize, &str)> = Vec::new();
        let mut budget = 0usize;
        for (i, sentence, _) in scored {
            if budget + sentence.len() > max_chars && !picked.is_empty() {
                continue;
            }
            budget += sentence.len();
            picked.push((i, sentence));
            if budget >= max_chars {
                break;
            }
        }
        picked.sort_by_key(|(i, _)| *i);
        picked
            .into_iter()
            .map(|(_, s)| s)
            .collect::<Vec<_>>()
            .join(". ")
    }
}

#[async_trait]
impl CompletionProvider for ExtractiveProvider {
    fn id(&self) -> &str {
        Self::ID
    }

    fn external(&self) -> bool {
        false
    }

    fn cost_per_1k_tokens(&self) -> f64 {
        0.0
    }

    async fn complete(
        &self,
        _model: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        let max_chars = (max_tokens as usize).saturating_mul(4).max(80);
        let text = Self::extract(prompt, max_chars);
        let usage = TokenUsage {
            input_tokens: estimate_tokens(prompt),
            output_tokens: estimate_tokens(&text),
        };
        Ok(Completion { text, usage })
    }
}

// ============================================================================
// TERM-OVERLAP RERANKER (local default)
// ============================================================================

/// BM25-flavored term-overlap reranker used when no cross-encoder is
/// configured. Free and deadline-friendly.
pub struct TermOverlapReranker;

impl TermOverlapReranker {
    /// The provider id profiles reference.
    pub const ID: &'static str = "term-overlap";
}

#[async_trait]
impl RerankProvider for TermOverlapReranker {
    fn id(&self) -> &str {
        Self::ID
    }

    fn external(&self) -> bool {
        false
    }

    fn cost_per_1k_tokens(&self) -> f64 {
        0.0
    }

    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<f64>, ProviderError> {
        let query_terms: std::collections::HashSet<String> =
            content_terms(query).into_iter().collect();
        if query_terms.is_empty() {
            return Ok(vec![0.0; documents.len()]);
        }
        Ok(documents
            .iter()
            .map(|doc| {
                let doc_terms: std::collections::HashSet<String> =
                    content_terms(doc).into_iter().collect();
                if doc_terms.is_empty() {
                    return 0.0;
                }
                let overlap = query_terms.intersection(&doc_terms).count() as f64;
                let coverage = overlap / query_terms.len() as f64;
                // Mild length normalization so giant documents do not win on
                // incidental overlap.
                coverage / (1.0 + (doc_terms.len() as f64 / 100.0))
            })
            .collect())
    }
}

// ============================================================================
// OPENAI-COMPATIBLE HTTP PROVIDER
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// HTTP provider speaking the OpenAI-compatible API shape
/// (`/chat/completions`, `/embeddings`). One instance per upstream endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    cost_per_1k: f64,
    dimensions: usize,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Configure a provider for one endpoint.
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        cost_per_1k: f64,
        dimensions: usize,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            cost_per_1k,
            dimensions,
            client: reqwest::Client::new(),
        }
    }

    fn classify(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url.trim_end_matches('/'), path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited(format!("{status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!("status {status}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn external(&self) -> bool {
        true
    }

    fn cost_per_1k_tokens(&self) -> f64 {
        self.cost_per_1k
    }

    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        let body = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self.post("chat/completions", body).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no choices".into()))?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_else(|| TokenUsage {
                input_tokens: estimate_tokens(prompt),
                output_tokens: estimate_tokens(&choice.message.content),
            });
        Ok(Completion {
            text: choice.message.content,
            usage,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn external(&self) -> bool {
        true
    }

    fn cost_per_1k_tokens(&self) -> f64 {
        self.cost_per_1k
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = serde_json::json!({
            "model": model,
            "input": [text],
        });
        let response = self.post("embeddings", body).await?;
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let _ = parsed.usage;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::InvalidResponse("no embedding data".into()))
    }
}

// ============================================================================
// LOCAL FASTEMBED ENCODER (feature-gated)
// ============================================================================

#[cfg(feature = "embeddings")]
mod local_embedder {
    use std::sync::{Mutex, OnceLock};

    use async_trait::async_trait;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

    use super::{EmbeddingProvider, ProviderError};
    use crate::tenant::DEFAULT_CHEAP_DIM;

    /// Maximum text length fed to the encoder.
    const MAX_TEXT_LENGTH: usize = 8192;

    static MODEL: OnceLock<Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

    fn cache_dir() -> std::path::PathBuf {
        if let Ok(path) = std::env::var("FASTEMBED_CACHE_PATH") {
            return std::path::PathBuf::from(path);
        }
        if let Some(proj_dirs) = directories::ProjectDirs::from("run", "rae", "core") {
            return proj_dirs.cache_dir().join("fastembed");
        }
        std::path::PathBuf::from(".fastembed_cache")
    }

    fn embed_sync(text: &str) -> Result<Vec<f32>, ProviderError> {
        let result = MODEL.get_or_init(|| {
            let cache = cache_dir();
            if let Err(e) = std::fs::create_dir_all(&cache) {
                tracing::warn!(error = %e, "could not create fastembed cache dir");
            }
            let options = InitOptions::new(EmbeddingModel::NomicEmbedTextV15)
                .with_show_download_progress(false)
                .with_cache_dir(cache);
            TextEmbedding::try_new(options)
                .map(Mutex::new)
                .map_err(|e| format!("embedding model init failed: {e}"))
        });
        let model = match result {
            Ok(model) => model,
            Err(e) => return Err(ProviderError::Unavailable(e.clone())),
        };
        let mut model = model
            .lock()
            .map_err(|_| ProviderError::Unavailable("embedding model lock poisoned".into()))?;
        let text = if text.len() > MAX_TEXT_LENGTH {
            &text[..MAX_TEXT_LENGTH]
        } else {
            text
        };
        let mut embeddings = model
            .embed(vec![text], None)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        if embeddings.is_empty() {
            return Err(ProviderError::InvalidResponse("no embedding produced".into()));
        }
        Ok(matryoshka_truncate(embeddings.remove(0)))
    }

    /// Matryoshka truncation: the first N dims of the encoder output are a
    /// valid N-dim representation; truncate and L2-normalize.
    pub fn matryoshka_truncate(mut vector: Vec<f32>) -> Vec<f32> {
        if vector.len() > DEFAULT_CHEAP_DIM {
            vector.truncate(DEFAULT_CHEAP_DIM);
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }

    /// Local ONNX encoder for the tenant's cheap space. Lazily initialized;
    /// while the model is unavailable the dense strategy degrades and
    /// retrieval runs lexical + graph only.
    pub struct LocalEmbedder;

    impl LocalEmbedder {
        /// The provider id the default configuration references.
        pub const ID: &'static str = "local-fastembed";
    }

    #[async_trait]
    impl EmbeddingProvider for LocalEmbedder {
        fn id(&self) -> &str {
            Self::ID
        }

        fn external(&self) -> bool {
            false
        }

        fn cost_per_1k_tokens(&self) -> f64 {
            0.0
        }

        fn dimensions(&self) -> usize {
            DEFAULT_CHEAP_DIM
        }

        async fn embed(&self, _model: &str, text: &str) -> Result<Vec<f32>, ProviderError> {
            let text = text.to_string();
            tokio::task::spawn_blocking(move || embed_sync(&text))
                .await
                .map_err(|e| ProviderError::Unavailable(e.to_string()))?
        }
    }
}

#[cfg(feature = "embeddings")]
pub use local_embedder::{LocalEmbedder, matryoshka_truncate};

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extractive_provider_is_deterministic() {
        let provider = ExtractiveProvider;
        let prompt = "Rollback took forty minutes because migrations were irreversible. \
                      The team ordered pizza. Schema changes need a tested down path before deploy.";
        let a = provider.complete("x", prompt, 64).await.unwrap();
        let b = provider.complete("x", prompt, 64).await.unwrap();
        assert_eq!(a.text, b.text);
        assert!(!a.text.is_empty());
        assert!(a.usage.input_tokens > 0);
    }

    #[tokio::test]
    async fn extractive_prefers_high_signal_sentences() {
        let prompt = "Deploy rollback failed due to missing migration rollback scripts. \
                      Rollback of the deploy needed manual migration fixes. \
                      Lunch was sandwiches in the park with everyone.";
        let out = ExtractiveProvider::extract(prompt, 120);
        assert!(out.to_lowercase().contains("rollback"));
        assert!(!out.to_lowercase().contains("sandwiches"));
    }

    #[tokio::test]
    async fn overlap_reranker_orders_by_coverage() {
        let reranker = TermOverlapReranker;
        let docs = vec![
            "replication lag alert fired".to_string(),
            "kitchen sink is leaking".to_string(),
        ];
        let scores = reranker.rerank("replication lag", &docs).await.unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn token_estimate_floor() {
        assert_eq!(estimate_tokens(""), 1);
        assert!(estimate_tokens(&"x".repeat(4000)) >= 900);
    }

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimited("429".into()).is_transient());
        assert!(!ProviderError::InvalidResponse("bad json".into()).is_transient());
    }
}

//! LLM gateway
//!
//! The unified entry point for all outbound model calls: `embed`,
//! `complete`, `rerank`. Profiles map to ordered provider/model chains;
//! transient failures fall through the chain, budget denials fail fast.
//! Responses cache by `(tenant, model, content_hash)` and cache hits bypass
//! budget checks. Every non-cached call is admitted by the cost guard before
//! it is issued and reconciled after.

mod providers;

pub use providers::{
    Completion, CompletionProvider, EmbeddingProvider, ExtractiveProvider, OpenAiCompatProvider,
    ProviderError, RerankProvider, TermOverlapReranker, TokenUsage, estimate_tokens,
};

#[cfg(feature = "embeddings")]
pub use providers::{LocalEmbedder, matryoshka_truncate};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::audit::{AuditEvent, AuditPipeline};
use crate::error::{CoreError, Result};
use crate::memory::{InfoClass, content_hash};
use crate::policy::{CostGuard, PolicyGuard};
use crate::storage::{Cache, CacheKey, TenantCache};
use crate::search::{vector_from_bytes, vector_to_bytes};
use crate::tenant::{TenantContext, TenantId};

const EMBED_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
const COMPLETE_CACHE_TTL: Duration = Duration::from_secs(6 * 3600);
const MAX_TRANSIENT_RETRIES: u32 = 3;

fn map_provider_error(err: ProviderError) -> CoreError {
    match err {
        ProviderError::RateLimited(msg) => CoreError::ProviderRateLimited(msg),
        ProviderError::Timeout => CoreError::DeadlineExceeded,
        ProviderError::Unavailable(msg) | ProviderError::InvalidResponse(msg) => {
            CoreError::BackendUnavailable(msg)
        }
    }
}

/// Unified gateway in front of every model provider.
pub struct LlmGateway {
    embedders: RwLock<HashMap<String, Arc<dyn EmbeddingProvider>>>,
    completions: RwLock<HashMap<String, Arc<dyn CompletionProvider>>>,
    rerankers: RwLock<HashMap<String, Arc<dyn RerankProvider>>>,
    cache: Arc<TenantCache>,
    cost: Arc<CostGuard>,
    audit: Arc<AuditPipeline>,
    policy: Arc<PolicyGuard>,
    llm_slots: Mutex<HashMap<TenantId, Arc<Semaphore>>>,
}

impl LlmGateway {
    /// Gateway with the built-in local providers registered: the extractive
    /// completion provider, the term-overlap reranker, and (with the
    /// `embeddings` feature) the local fastembed encoder.
    pub fn new(
        cache: Arc<TenantCache>,
        cost: Arc<CostGuard>,
        audit: Arc<AuditPipeline>,
        policy: Arc<PolicyGuard>,
    ) -> Self {
        let gateway = Self {
            embedders: RwLock::new(HashMap::new()),
            completions: RwLock::new(HashMap::new()),
            rerankers: RwLock::new(HashMap::new()),
            cache,
            cost,
            audit,
            policy,
            llm_slots: Mutex::new(HashMap::new()),
        };
        gateway.register_completion(Arc::new(ExtractiveProvider));
        gateway.register_reranker(Arc::new(TermOverlapReranker));
        #[cfg(feature = "embeddings")]
        gateway.register_embedder(
            crate::tenant::DEFAULT_CHEAP_MODEL,
            Arc::new(LocalEmbedder),
        );
        gateway
    }

    /// Register an embedding provider serving one model name.
    pub fn register_embedder(&self, model: &str, provider: Arc<dyn EmbeddingProvider>) {
        self.embedders
            .write()
            .expect("embedders lock")
            .insert(model.to_string(), provider);
    }

    /// Register a completion provider under its id.
    pub fn register_completion(&self, provider: Arc<dyn CompletionProvider>) {
        self.completions
            .write()
            .expect("completions lock")
            .insert(provider.id().to_string(), provider);
    }

    /// Register a rerank provider under its id.
    pub fn register_reranker(&self, provider: Arc<dyn RerankProvider>) {
        self.rerankers
            .write()
            .expect("rerankers lock")
            .insert(provider.id().to_string(), provider);
    }

    /// Declared dimensionality of a registered embedding model.
    pub fn embedder_dimensions(&self, model: &str) -> Option<usize> {
        self.embedders
            .read()
            .expect("embedders lock")
            .get(model)
            .map(|p| p.dimensions())
    }

    async fn slot(&self, ctx: &TenantContext) -> Result<tokio::sync::OwnedSemaphorePermit> {
        let semaphore = {
            let mut slots = self.llm_slots.lock().expect("llm slots lock");
            Arc::clone(slots.entry(ctx.tenant().clone()).or_insert_with(|| {
                Arc::new(Semaphore::new(ctx.config().quotas.max_in_flight_llm.max(1)))
            }))
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| CoreError::Init("llm semaphore closed".into()))
    }

    // ------------------------------------------------------------------
    // embed
    // ------------------------------------------------------------------

    /// Encode text under a named model. Cached by content hash per tenant;
    /// cache hits bypass budget checks.
    pub async fn embed(&self, ctx: &TenantContext, model: &str, text: &str) -> Result<Vec<f32>> {
        ctx.check_deadline()?;
        let provider = self
            .embedders
            .read()
            .expect("embedders lock")
            .get(model)
            .cloned()
            .ok_or_else(|| CoreError::UnknownModel(model.to_string()))?;

        let key = CacheKey::new(
            ctx.tenant(),
            &format!("embed:{model}"),
            &content_hash(text),
        );
        if let Some(bytes) = self.cache.get(&key) {
            return Ok(vector_from_bytes(&bytes));
        }

        let _permit = self.slot(ctx).await?;

        let payload = if provider.external() {
            self.policy.redact(text, &ctx.config().policy)
        } else {
            text.to_string()
        };

        let estimated_usd =
            estimate_tokens(&payload) as f64 / 1000.0 * provider.cost_per_1k_tokens();
        let admission = self.cost.admit(ctx, estimated_usd)?;

        let started = Instant::now();
        let mut attempt = 0;
        let vector = loop {
            match provider.embed(model, &payload).await {
                Ok(vector) => break vector,
                Err(e) if e.is_transient() && attempt + 1 < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(50 << attempt)).await;
                }
                Err(e) => {
                    self.cost.settle(ctx, &admission, 0.0);
                    return Err(map_provider_error(e));
                }
            }
        };
        self.cost.settle(ctx, &admission, estimated_usd);

        if estimated_usd > 0.0 {
            self.audit.emit(
                AuditEvent::of(ctx, "llm_embed")
                    .cost(estimated_usd)
                    .latency(started.elapsed().as_millis() as u64)
                    .detail(serde_json::json!({ "model": model }))
                    .critical(),
            );
        }

        self.cache
            .set_with_ttl(key, vector_to_bytes(&vector), EMBED_CACHE_TTL);
        Ok(vector)
    }

    // ------------------------------------------------------------------
    // complete
    // ------------------------------------------------------------------

    /// Run a completion through a named profile's fallback chain.
    ///
    /// `class` is the information class of the prompt content; raw profiles
    /// skip redaction only when the class permits.
    pub async fn complete(
        &self,
        ctx: &TenantContext,
        profile_name: &str,
        prompt: &str,
        max_tokens: u32,
        class: InfoClass,
    ) -> Result<Completion> {
        ctx.check_deadline()?;
        let config = ctx.config();
        let profile = config
            .llm_profiles
            .get(profile_name)
            .ok_or_else(|| CoreError::UnknownModel(format!("profile {profile_name}")))?;

        let key = CacheKey::new(
            ctx.tenant(),
            &format!("complete:{profile_name}"),
            &content_hash(prompt),
        );
        if let Some(bytes) = self.cache.get(&key) {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            return Ok(Completion {
                text,
                usage: TokenUsage::default(),
            });
        }

        let _permit = self.slot(ctx).await?;

        let mut last_err: Option<CoreError> = None;
        for route in &profile.routes {
            let Some(provider) = self
                .completions
                .read()
                .expect("completions lock")
                .get(&route.provider)
                .cloned()
            else {
                tracing::warn!(provider = %route.provider, "profile references unknown provider");
                continue;
            };

            let skip_redaction = profile.raw && class <= InfoClass::Internal;
            let payload = if provider.external() && !skip_redaction {
                self.policy.redact(prompt, &config.policy)
            } else {
                prompt.to_string()
            };

            let estimated_usd = (estimate_tokens(&payload) + max_tokens as u64) as f64 / 1000.0
                * provider.cost_per_1k_tokens();
            // Budget denial fails fast: no falling through to pricier routes.
            let admission = self.cost.admit(ctx, estimated_usd)?;

            let started = Instant::now();
            match provider.complete(&route.model, &payload, max_tokens).await {
                Ok(completion) => {
                    let actual_usd =
                        completion.usage.total() as f64 / 1000.0 * provider.cost_per_1k_tokens();
                    self.cost.settle(ctx, &admission, actual_usd);
                    if actual_usd > 0.0 {
                        self.audit.emit(
                            AuditEvent::of(ctx, "llm_complete")
                                .cost(actual_usd)
                                .latency(started.elapsed().as_millis() as u64)
                                .detail(serde_json::json!({
                                    "provider": route.provider,
                                    "model": route.model,
                                    "inputTokens": completion.usage.input_tokens,
                                    "outputTokens": completion.usage.output_tokens,
                                }))
                                .critical(),
                        );
                    }
                    self.cache.set_with_ttl(
                        key,
                        completion.text.clone().into_bytes(),
                        COMPLETE_CACHE_TTL,
                    );
                    return Ok(completion);
                }
                Err(e) if e.is_transient() => {
                    self.cost.settle(ctx, &admission, 0.0);
                    tracing::warn!(
                        provider = %route.provider,
                        error = %e,
                        "completion route failed, falling through"
                    );
                    last_err = Some(map_provider_error(e));
                }
                Err(e) => {
                    self.cost.settle(ctx, &admission, 0.0);
                    return Err(map_provider_error(e));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            CoreError::BackendUnavailable(format!("profile {profile_name} has no usable route"))
        }))
    }

    // ------------------------------------------------------------------
    // rerank
    // ------------------------------------------------------------------

    /// Score candidates against the query through a rerank provider, bounded
    /// by `deadline`. Callers fall back to fused order on any error.
    pub async fn rerank(
        &self,
        ctx: &TenantContext,
        provider_id: &str,
        query: &str,
        documents: &[String],
        deadline: Duration,
    ) -> Result<Vec<f64>> {
        ctx.check_deadline()?;
        let provider = self
            .rerankers
            .read()
            .expect("rerankers lock")
            .get(provider_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownModel(format!("reranker {provider_id}")))?;

        let batch_chars: usize = documents.iter().map(|d| d.len()).sum();
        let estimated_usd =
            (batch_chars as u64 / 4).max(1) as f64 / 1000.0 * provider.cost_per_1k_tokens();
        let admission = self.cost.admit(ctx, estimated_usd)?;

        let started = Instant::now();
        let scores = tokio::time::timeout(deadline, provider.rerank(query, documents))
            .await
            .map_err(|_| {
                self.cost.settle(ctx, &admission, 0.0);
                CoreError::DeadlineExceeded
            })?
            .map_err(|e| {
                self.cost.settle(ctx, &admission, 0.0);
                map_provider_error(e)
            })?;

        self.cost.settle(ctx, &admission, estimated_usd);
        if estimated_usd > 0.0 {
            self.audit.emit(
                AuditEvent::of(ctx, "llm_rerank")
                    .cost(estimated_usd)
                    .latency(started.elapsed().as_millis() as u64)
                    .detail(serde_json::json!({ "provider": provider_id, "batch": documents.len() }))
                    .critical(),
            );
        }
        Ok(scores)
    }
}

// ============================================================================
// TESTS
// ============================================================================

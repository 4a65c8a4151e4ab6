//! Per-tenant configuration
//!
//! Every key has a default; an omitted config yields a safe, conservative
//! operating mode. Field names mirror the recognized configuration map of the
//! programmatic contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::memory::InfoClass;
use crate::reflection::ReflectionType;

// ============================================================================
// BUDGET
// ============================================================================

/// Spend caps and alert points for outbound model calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetConfig {
    /// Daily spend cap in USD
    pub daily_usd: f64,
    /// Monthly spend cap in USD
    pub monthly_usd: f64,
    /// Fractions of the daily cap at which alerts fire
    pub alert_thresholds: Vec<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_usd: 5.0,
            monthly_usd: 100.0,
            alert_thresholds: vec![0.5, 0.8, 0.95],
        }
    }
}

// ============================================================================
// EMBEDDING MODELS
// ============================================================================

/// Model space a vector belongs to. Vectors from different spaces are never
/// ranked against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelSpace {
    /// Lightweight model used for query encoding, diversity, and novelty
    #[default]
    Cheap,
    /// Heavier model reserved for precision-sensitive search
    Heavy,
}

impl std::fmt::Display for ModelSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelSpace::Cheap => write!(f, "cheap"),
            ModelSpace::Heavy => write!(f, "heavy"),
        }
    }
}

/// One active embedding model of the tenant's federated set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingModelConfig {
    /// Model identifier as known to the gateway
    pub name: String,
    /// Model space the vectors live in
    pub space: ModelSpace,
    /// Declared dimensionality; stored vectors must match
    pub dim: usize,
    /// Inactive models keep their stored vectors but are skipped on write
    pub active: bool,
}

/// Default local model: the bundled fastembed encoder, Matryoshka-truncated.
pub const DEFAULT_CHEAP_MODEL: &str = "nomic-ai/nomic-embed-text-v1.5";

/// Dimensionality of the default cheap model after truncation.
pub const DEFAULT_CHEAP_DIM: usize = 256;

// ============================================================================
// LAYERS
// ============================================================================

/// Admission thresholds for the layer pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionThresholds {
    /// Minimum importance for sensory -> working admission
    pub sensory_importance: f64,
    /// Minimum importance for working -> longterm admission
    pub working_importance: f64,
    /// Minimum usage counter for working -> longterm admission
    pub working_min_usage: i64,
    /// Minimum age in seconds for working -> longterm admission
    pub working_min_age_secs: u64,
    /// Minimum cluster size for longterm -> reflective
    pub cluster_min_size: usize,
    /// Minimum mean importance across a reflective cluster
    pub cluster_mean_importance: f64,
    /// Minimum mean usage across a reflective cluster
    pub cluster_mean_usage: f64,
}

impl Default for AdmissionThresholds {
    fn default() -> Self {
        Self {
            sensory_importance: 0.5,
            working_importance: 0.6,
            working_min_usage: 2,
            working_min_age_secs: 900,
            cluster_min_size: 3,
            cluster_mean_importance: 0.7,
            cluster_mean_usage: 5.0,
        }
    }
}

/// Retention and admission settings per layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerConfig {
    /// TTL for rejected sensory records, seconds
    pub sensory_retention_secs: u64,
    /// Retention for working records, seconds
    pub working_retention_secs: u64,
    /// Retention for longterm records, seconds
    pub longterm_retention_secs: u64,
    /// Retention for reflective records, seconds
    pub reflective_retention_secs: u64,
    /// Tags that force sensory -> working admission regardless of importance
    pub mandatory_tags: Vec<String>,
    /// Theta values for the pipeline
    pub admission_thresholds: AdmissionThresholds,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            sensory_retention_secs: 3_600,
            working_retention_secs: 7 * 86_400,
            longterm_retention_secs: 180 * 86_400,
            reflective_retention_secs: 365 * 86_400,
            mandatory_tags: vec![],
            admission_thresholds: AdmissionThresholds::default(),
        }
    }
}

// ============================================================================
// DECAY
// ============================================================================

/// Decay dynamics applied by the daily cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecayConfig {
    /// Importance half-life in days
    pub half_life_days: f64,
    /// Records below this importance become prune candidates
    pub importance_floor: f64,
    /// Minimum age in days before a record may be pruned
    pub min_age_for_prune_days: f64,
    /// Graph edges below this confidence are pruned
    pub edge_confidence_floor: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            half_life_days: 14.0,
            importance_floor: 0.05,
            min_age_for_prune_days: 30.0,
            edge_confidence_floor: 0.2,
        }
    }
}

// ============================================================================
// REFLECTION
// ============================================================================

/// Reflection engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionConfig {
    /// Reflection modes the tenant allows
    pub enabled_modes: Vec<ReflectionType>,
    /// Actor/Evaluator/Reflector iterations before giving up
    pub max_iterations: usize,
    /// Evaluator score required to accept a lesson
    pub acceptance_threshold: f64,
    /// Lessons below this novelty against existing reflections are suppressed
    pub novelty_floor: f64,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled_modes: vec![
                ReflectionType::Observation,
                ReflectionType::Causation,
                ReflectionType::Strategy,
            ],
            max_iterations: 2,
            acceptance_threshold: 0.7,
            novelty_floor: 0.15,
        }
    }
}

// ============================================================================
// POLICY
// ============================================================================

/// What the policy guard does when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Redact the matched tokens in place
    Scrub,
    /// Abort the write
    Reject,
    /// Allow, tagging the record with the rule name
    Tag,
}

/// One classification rule: pattern -> information class + action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRule {
    /// Rule name, also used as the tag under `RuleAction::Tag`
    pub name: String,
    /// Regex matched against record content
    pub pattern: String,
    /// Class assigned when the pattern matches
    pub class: InfoClass,
    /// Action taken on match
    pub action: RuleAction,
}

/// Information-class policy for the tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    /// Classification rules, evaluated in order; highest matched class wins
    pub info_class_rules: Vec<ClassRule>,
    /// Extra redaction patterns applied before external provider calls
    pub redaction_patterns: Vec<String>,
    /// Reject (rather than downgrade) promotions that would violate containment
    pub layer_containment_strict: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            info_class_rules: builtin_class_rules(),
            redaction_patterns: vec![],
            layer_containment_strict: true,
        }
    }
}

/// The stock rule set shipped with every tenant. SSNs and credential material
/// are restricted; medical identifiers are confidential; bare emails are
/// internal and scrubbed before external calls.
pub fn builtin_class_rules() -> Vec<ClassRule> {
    vec![
        ClassRule {
            name: "ssn".into(),
            pattern: r"\b\d{3}-\d{2}-\d{4}\b".into(),
            class: InfoClass::Restricted,
            action: RuleAction::Reject,
        },
        ClassRule {
            name: "api_key".into(),
            pattern: r"\b(sk|pk|api|key)[-_][A-Za-z0-9]{16,}\b".into(),
            class: InfoClass::Restricted,
            action: RuleAction::Reject,
        },
        ClassRule {
            name: "medical_id".into(),
            pattern: r"\b(mrn|nhs|icd)[-: ]?\d{4,}\b".into(),
            class: InfoClass::Confidential,
            action: RuleAction::Tag,
        },
        ClassRule {
            name: "email".into(),
            pattern: r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b".into(),
            class: InfoClass::Internal,
            action: RuleAction::Scrub,
        },
    ]
}

// ============================================================================
// RETRIEVAL
// ============================================================================

/// Weights for the final re-rank over fused candidates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscoreWeights {
    /// Fused relevance contribution
    pub relevance: f64,
    /// Record importance contribution
    pub importance: f64,
    /// Recency of last access contribution
    pub recency: f64,
    /// Graph centrality contribution
    pub centrality: f64,
    /// Diversity bonus (penalty for near-duplicates of selected results)
    pub diversity: f64,
    /// Information density contribution
    pub density: f64,
}

impl Default for SubscoreWeights {
    fn default() -> Self {
        Self {
            relevance: 0.40,
            importance: 0.20,
            recency: 0.15,
            centrality: 0.10,
            diversity: 0.10,
            density: 0.05,
        }
    }
}

/// Retrieval engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalConfig {
    /// Reciprocal Rank Fusion constant
    pub rrf_k: f64,
    /// Dense candidates fetched per query
    pub dense_top_k: usize,
    /// Lexical candidates fetched per query
    pub lexical_top_k: usize,
    /// Graph candidates fetched per query
    pub graph_top_k: usize,
    /// Lexical result count below which the engine returns lexical-only
    pub safe_exit_threshold: usize,
    /// Cosine overlap above which a candidate counts as a near-duplicate
    pub diversity_tau: f64,
    /// Budget for the optional learned reranker, per batch
    pub rerank_deadline_ms: u64,
    /// Fused candidates handed to subscore re-rank and the reranker
    pub rerank_top_n: usize,
    /// Rerank provider id; `None` uses the built-in term-overlap reranker
    pub rerank_provider: Option<String>,
    /// Final re-rank weights
    pub subscore_weights: SubscoreWeights,
    /// Multiplier per layer applied during shaping
    pub layer_weights: HashMap<String, f64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let mut layer_weights = HashMap::new();
        layer_weights.insert("reflective".to_string(), 1.0);
        layer_weights.insert("longterm".to_string(), 0.9);
        layer_weights.insert("working".to_string(), 0.75);
        layer_weights.insert("sensory".to_string(), 0.6);
        Self {
            rrf_k: 60.0,
            dense_top_k: 50,
            lexical_top_k: 50,
            graph_top_k: 20,
            safe_exit_threshold: 5,
            diversity_tau: 0.92,
            rerank_deadline_ms: 10,
            rerank_top_n: 30,
            rerank_provider: None,
            subscore_weights: SubscoreWeights::default(),
            layer_weights,
        }
    }
}

// ============================================================================
// LLM PROFILES & QUOTAS
// ============================================================================

/// One provider/model candidate in a profile's fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRoute {
    /// Provider id registered with the gateway
    pub provider: String,
    /// Model passed to the provider
    pub model: String,
}

/// Named completion routing with an ordered fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LlmProfile {
    /// Candidates tried in order
    pub routes: Vec<ProviderRoute>,
    /// Raw profiles skip redaction (only honored for permitted info classes)
    pub raw: bool,
}

/// Per-tenant concurrency caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    /// Concurrent foreground requests before `TenantThrottled`
    pub max_concurrent_requests: usize,
    /// Concurrent outbound LLM calls
    pub max_in_flight_llm: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 32,
            max_in_flight_llm: 8,
        }
    }
}

// ============================================================================
// DUPLICATES
// ============================================================================

/// How `store` treats an identical (content, source) within the dedup window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DuplicatePolicy {
    /// Return the existing id
    #[default]
    SameId,
    /// Create a new record carrying a `duplicate_of` parent link
    Linked,
}

// ============================================================================
// TENANT CONFIG
// ============================================================================

/// The full recognized configuration map for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantConfig {
    /// Spend caps and alert points
    pub budget: BudgetConfig,
    /// Active embedding set; the record is canonical, vectors are projections
    pub embedding_models: Vec<EmbeddingModelConfig>,
    /// Named completion routing
    pub llm_profiles: HashMap<String, LlmProfile>,
    /// Lifetimes and admission thresholds
    pub layers: LayerConfig,
    /// Decay dynamics
    pub decay: DecayConfig,
    /// Reflection engine settings
    pub reflection: ReflectionConfig,
    /// Information-class policy
    pub policy: PolicyConfig,
    /// Retrieval engine tuning
    pub retrieval: RetrievalConfig,
    /// Concurrency caps
    pub quotas: QuotaConfig,
    /// Window in which identical content+source dedups, seconds
    pub dedup_window_secs: u64,
    /// Dedup behavior
    pub duplicate_policy: DuplicatePolicy,
    /// Tolerated clock skew for the per-tenant timestamp highwater, seconds
    pub timestamp_skew_secs: u64,
}

impl Default for TenantConfig {
    fn default() -> Self {
        let mut llm_profiles = HashMap::new();
        llm_profiles.insert(
            "cheap".to_string(),
            LlmProfile {
                routes: vec![ProviderRoute {
                    provider: "extractive".into(),
                    model: "extractive-v1".into(),
                }],
                raw: false,
            },
        );
        Self {
            budget: BudgetConfig::default(),
            embedding_models: vec![EmbeddingModelConfig {
                name: DEFAULT_CHEAP_MODEL.to_string(),
                space: ModelSpace::Cheap,
                dim: DEFAULT_CHEAP_DIM,
                active: true,
            }],
            llm_profiles,
            layers: LayerConfig::default(),
            decay: DecayConfig::default(),
            reflection: ReflectionConfig::default(),
            policy: PolicyConfig::default(),
            retrieval: RetrievalConfig::default(),
            quotas: QuotaConfig::default(),
            dedup_window_secs: 3_600,
            duplicate_policy: DuplicatePolicy::default(),
            timestamp_skew_secs: 300,
        }
    }
}

impl TenantConfig {
    /// Active models in a given space.
    pub fn active_models(&self, space: Option<ModelSpace>) -> Vec<&EmbeddingModelConfig> {
        self.embedding_models
            .iter()
            .filter(|m| m.active && space.is_none_or(|s| m.space == s))
            .collect()
    }

    /// The declared model config by name, if any.
    pub fn model(&self, name: &str) -> Option<&EmbeddingModelConfig> {
        self.embedding_models.iter().find(|m| m.name == name)
    }

    /// Layer weight during shaping (1.0 for unknown layers).
    pub fn layer_weight(&self, layer: &str) -> f64 {
        self.retrieval
            .layer_weights
            .get(layer)
            .copied()
            .unwrap_or(1.0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

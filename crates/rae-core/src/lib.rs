//! # RAE Core
//!
//! Multi-tenant, multi-layer memory engine for AI agents. Clients store
//! observations, decisions, and conversations, then retrieve them through
//! semantic and graph-aware queries to ground subsequent LLM calls.
//!
//! - **Four-layer hierarchy**: sensory -> working -> longterm -> reflective,
//!   promoted by threshold-gated consolidation with parent lineage
//! - **Hybrid retrieval**: dense vectors + BM25 lexical + graph traversal,
//!   fused with Reciprocal Rank Fusion (k = 60) and a safe lexical early-exit
//! - **Reflection engine**: an Actor-Evaluator-Reflector loop that distills
//!   episodic evidence into reusable lessons
//! - **Background cycles**: decay, summarization, and dreaming, tenant-scoped
//!   with advisory locks and budget-aware deferral
//! - **Tenant substrate**: every operation traverses per-tenant policy,
//!   budget, and audit enforcement; backends carry a session tenant marker
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use rae_core::{Rae, RecordDraft, QueryRequest};
//!
//! # async fn demo() -> rae_core::Result<()> {
//! let rae = Rae::builder().in_memory().build()?;
//! let ctx = rae.context("tenant-1", "agent-7");
//!
//! let stored = rae
//!     .store_memory(&ctx, RecordDraft::new("replication lag spiked after failover"))
//!     .await?;
//!
//! let response = rae
//!     .query_memory(&ctx, QueryRequest::new("replication lag"))
//!     .await?;
//! assert_eq!(response.results[0].record.id, stored.id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `embeddings` (default): local fastembed encoder for the cheap space
//! - `vector-search` (default): HNSW ANN via USearch (exact scan otherwise)
//! - `bundled-sqlite` (default): bundle SQLite with the crate
//! - `full`: everything

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod audit;
pub mod error;
pub mod graph;
pub mod layers;
pub mod llm;
pub mod memory;
pub mod policy;
pub mod reflection;
pub mod search;
pub mod service;
pub mod storage;
pub mod tenant;
pub mod workers;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Errors
pub use error::{CoreError, Result};

// The assembled engine and its contract shapes
pub use service::{
    BudgetUpdate, GraphQuery, Rae, RaeBuilder, ReflectionRequest, SnippetCandidate,
};

// Records
pub use memory::{
    EmbeddingRecord, EmbeddingSweep, InfoClass, Layer, MemoryRecord, MemoryService, RecordDraft,
    RecordUpdate, StatsScope, StoreOutcome, UsageSnapshot, content_hash,
};

// Tenant substrate
pub use tenant::{
    BudgetConfig, BudgetSnapshot, DecayConfig, LayerConfig, ModelSpace, PolicyConfig,
    QuotaConfig, ReflectionConfig, RetrievalConfig, Role, SubscoreWeights, TenantConfig,
    TenantContext, TenantId, TenantRegistry,
};

// Retrieval
pub use search::{
    Degradation, QueryRequest, QueryResponse, RankedMemory, RetrievalEngine, StrategyKind,
    reciprocal_rank_fusion,
};

// Graph
pub use graph::{GraphEdge, GraphService, SemanticNode, Subgraph};

// Reflection
pub use reflection::{ReflectionEngine, ReflectionInfo, ReflectionType};

// Policy & budget
pub use policy::{CostGuard, CostUsage, CostWindow, PolicyGuard, StoreDecision};

// Gateway
pub use llm::{
    Completion, CompletionProvider, EmbeddingProvider, LlmGateway, ProviderError, RerankProvider,
};

// Audit
pub use audit::{AuditEvent, AuditOutcome, AuditPipeline};

// Storage contracts
pub use storage::{
    AuditStore, BlobStore, Cache, CacheKey, Capabilities, GraphStore, InMemoryStore, Page,
    RecordFilter, RecordStore, SqliteStore, TenantCache,
};

// Workers
pub use workers::{
    DecayReport, DreamReport, Scheduler, SummarizationReport, WorkerConfig, WorkerSet,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default Reciprocal Rank Fusion constant
pub const DEFAULT_RRF_K: f64 = 60.0;

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        CoreError, GraphQuery, InfoClass, Layer, MemoryRecord, QueryRequest, QueryResponse, Rae,
        RecordDraft, RecordUpdate, ReflectionRequest, ReflectionType, Result, StatsScope,
        StoreOutcome, TenantContext, TenantId, UsageSnapshot,
    };
}

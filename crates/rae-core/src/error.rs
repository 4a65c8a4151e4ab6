//! Core error taxonomy
//!
//! One semantic kind per failure mode; the RPC adapter maps these to status
//! codes. Policy and budget errors are never retried locally; transient
//! backend errors are retried with bounded backoff before surfacing.

// ============================================================================
// CORE ERROR
// ============================================================================

/// Error type shared by every core operation.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    // ---- tenant / permission ----
    /// Operation invoked without a tenant context
    #[error("no tenant context supplied")]
    MissingTenant,
    /// Context tenant does not own the target entity
    #[error("tenant mismatch for {entity}")]
    TenantMismatch {
        /// Entity kind the caller attempted to touch
        entity: String,
    },
    /// Actor lacks the role required for the operation
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    // ---- policy ----
    /// Restricted content rejected from a persistent layer
    #[error("restricted content may only live in the working layer")]
    RestrictedContent,
    /// Content crossed an information-class boundary
    #[error("information class violation: {0}")]
    InfoClassViolation(String),
    /// Sanitization could not produce a safe artifact
    #[error("sanitization failed: {0}")]
    SanitizationFailed(String),

    // ---- budget ----
    /// Cost guard denied the call
    #[error("budget exceeded: estimated {estimated_usd:.4} USD, {remaining_usd:.4} USD remaining")]
    BudgetExceeded {
        /// Cost estimate for the denied call
        estimated_usd: f64,
        /// Budget remaining in the tighter of the two windows
        remaining_usd: f64,
    },

    // ---- availability ----
    /// A single backend is down; callers may degrade
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// Every retrieval strategy failed
    #[error("all retrieval strategies failed")]
    RetrievalUnavailable,
    /// The request deadline expired
    #[error("deadline exceeded")]
    DeadlineExceeded,

    // ---- validation ----
    /// Malformed record, filter, or request
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// Embedding or completion model not configured for the tenant
    #[error("unknown model: {0}")]
    UnknownModel(String),
    /// Layer not valid for the operation
    #[error("bad layer: {0}")]
    BadLayer(String),

    // ---- conflict ----
    /// Embedding no longer matches the record content hash
    #[error("stale embedding for memory {memory_id} under model {model}")]
    StaleEmbedding {
        /// Memory the embedding belongs to
        memory_id: String,
        /// Embedding model name
        model: String,
    },
    /// Concurrent mutation lost the race
    #[error("optimistic concurrency conflict: {0}")]
    OptimisticConcurrency(String),

    // ---- throttling ----
    /// Per-tenant in-flight cap reached
    #[error("tenant throttled")]
    TenantThrottled,
    /// Upstream provider rate-limited the call
    #[error("provider rate limited: {0}")]
    ProviderRateLimited(String),

    // ---- backend plumbing ----
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Invariant violation that is fatal for the request (poisoned backend
    /// row, out-of-range confidence). Always alerted, never repaired inline.
    #[error("internal invariant violated: {0}")]
    Poisoned(String),
    /// Catch-all for subsystem initialization failures
    #[error("initialization error: {0}")]
    Init(String),
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Whether a bounded local retry is permitted for this error.
    ///
    /// Policy and budget errors are never retried; neither are validation or
    /// tenant errors. Only transient backend conditions qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::BackendUnavailable(_) | CoreError::ProviderRateLimited(_) => true,
            CoreError::Database(e) => matches!(
                e,
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::DatabaseBusy
                        || err.code == rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Stable kind label recorded on audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::MissingTenant => "missing_tenant",
            CoreError::TenantMismatch { .. } => "tenant_mismatch",
            CoreError::NotAuthorized(_) => "not_authorized",
            CoreError::RestrictedContent => "restricted_content",
            CoreError::InfoClassViolation(_) => "info_class_violation",
            CoreError::SanitizationFailed(_) => "sanitization_failed",
            CoreError::BudgetExceeded { .. } => "budget_exceeded",
            CoreError::BackendUnavailable(_) => "backend_unavailable",
            CoreError::RetrievalUnavailable => "retrieval_unavailable",
            CoreError::DeadlineExceeded => "deadline_exceeded",
            CoreError::InvalidRecord(_) => "invalid_record",
            CoreError::UnknownModel(_) => "unknown_model",
            CoreError::BadLayer(_) => "bad_layer",
            CoreError::StaleEmbedding { .. } => "stale_embedding",
            CoreError::OptimisticConcurrency(_) => "optimistic_concurrency",
            CoreError::TenantThrottled => "tenant_throttled",
            CoreError::ProviderRateLimited(_) => "provider_rate_limited",
            CoreError::Database(_) => "database",
            CoreError::Io(_) => "io",
            CoreError::Serialization(_) => "serialization",
            CoreError::Poisoned(_) => "poisoned",
            CoreError::Init(_) => "init",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_errors_are_not_transient() {
        assert!(!CoreError::RestrictedContent.is_transient());
        assert!(
            !CoreError::BudgetExceeded {
                estimated_usd: 0.02,
                remaining_usd: 0.01
            }
            .is_transient()
        );
    }

    #[test]
    fn availability_errors_are_transient() {
        assert!(CoreError::BackendUnavailable("vector index".into()).is_transient());
        assert!(CoreError::ProviderRateLimited("openai".into()).is_transient());
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(CoreError::MissingTenant.kind(), "missing_tenant");
        assert_eq!(CoreError::RetrievalUnavailable.kind(), "retrieval_unavailable");
    }
}

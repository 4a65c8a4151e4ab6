//! Tenant substrate - identity, per-request context, registry
//!
//! Every core entry point takes a [`TenantContext`]. The context is immutable
//! for the duration of one request and travels to every downstream call; an
//! operation invoked without one fails with `MissingTenant`, and any target
//! whose tenant differs from the context fails with `TenantMismatch`.

mod config;

pub use config::{
    AdmissionThresholds, BudgetConfig, ClassRule, DEFAULT_CHEAP_DIM, DEFAULT_CHEAP_MODEL,
    DecayConfig, DuplicatePolicy, EmbeddingModelConfig, LayerConfig, LlmProfile, ModelSpace,
    PolicyConfig, ProviderRoute, QuotaConfig, ReflectionConfig, RetrievalConfig, RuleAction,
    SubscoreWeights, TenantConfig, builtin_class_rules,
};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::memory::InfoClass;

// ============================================================================
// IDENTITY
// ============================================================================

/// Opaque tenant key. Authenticated out-of-band by the adapter; the core only
/// enforces once identified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Wrap an opaque tenant key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Request correlation id, stamped on every audit event of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Roles an authenticated actor may hold within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only access
    Reader,
    /// Read + write memories
    Writer,
    /// Writer plus budget/config mutation
    Operator,
}

// ============================================================================
// TENANT CONTEXT
// ============================================================================

/// Budget numbers captured when the context was established.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSnapshot {
    /// USD remaining in the current day window
    pub daily_remaining_usd: f64,
    /// USD remaining in the current month window
    pub monthly_remaining_usd: f64,
}

/// Per-request identity, policy, budget, and audit scope.
///
/// Cheap to clone; downstream calls and spawned continuation tasks hold their
/// own copy.
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant: TenantId,
    actor: String,
    roles: Vec<Role>,
    request_id: RequestId,
    deadline: Option<Instant>,
    clearance: InfoClass,
    config: Arc<TenantConfig>,
    budget: BudgetSnapshot,
}

impl TenantContext {
    /// Build a context. Use [`TenantRegistry::context`] in normal flow so the
    /// config snapshot is the registry's current one.
    pub fn new(tenant: TenantId, actor: impl Into<String>, config: Arc<TenantConfig>) -> Self {
        let budget = BudgetSnapshot {
            daily_remaining_usd: config.budget.daily_usd,
            monthly_remaining_usd: config.budget.monthly_usd,
        };
        Self {
            tenant,
            actor: actor.into(),
            roles: vec![Role::Reader, Role::Writer],
            request_id: RequestId::generate(),
            deadline: None,
            clearance: InfoClass::Confidential,
            config,
            budget,
        }
    }

    /// Restrict or extend the role set.
    pub fn with_roles(mut self, roles: Vec<Role>) -> Self {
        self.roles = roles;
        self
    }

    /// Set the absolute deadline for this request.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Convenience: deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Cap the information class this caller may receive.
    pub fn with_clearance(mut self, clearance: InfoClass) -> Self {
        self.clearance = clearance;
        self
    }

    /// Replace the budget snapshot (set by the registry at creation).
    pub(crate) fn with_budget(mut self, budget: BudgetSnapshot) -> Self {
        self.budget = budget;
        self
    }

    /// Tenant this request operates on.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Authenticated actor identity.
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Audit correlation id.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Highest information class this caller may receive.
    pub fn clearance(&self) -> InfoClass {
        self.clearance
    }

    /// Tenant configuration snapshot taken at context creation.
    pub fn config(&self) -> &Arc<TenantConfig> {
        &self.config
    }

    /// Budget snapshot taken at context creation.
    pub fn budget(&self) -> BudgetSnapshot {
        self.budget
    }

    /// Absolute deadline, if the caller set one.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast once the deadline has passed.
    pub fn check_deadline(&self) -> Result<()> {
        match self.remaining() {
            Some(left) if left.is_zero() => Err(CoreError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Whether the actor holds the given role.
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Guard: the actor must hold `role`.
    pub fn require_role(&self, role: Role, operation: &str) -> Result<()> {
        if self.has_role(role) {
            Ok(())
        } else {
            Err(CoreError::NotAuthorized(operation.to_string()))
        }
    }

    /// Guard: an entity loaded from a backend must belong to this tenant.
    ///
    /// A mismatch on a row a backend handed back under our session marker is
    /// poisoned data, not a routine miss; callers decide which of the two
    /// checks they need.
    pub fn assert_owns(&self, owner: &TenantId, entity: &str) -> Result<()> {
        if owner == &self.tenant {
            Ok(())
        } else {
            Err(CoreError::TenantMismatch {
                entity: entity.to_string(),
            })
        }
    }
}

// ============================================================================
// TENANT REGISTRY
// ============================================================================

/// Process-wide map of tenant configurations.
///
/// Unknown tenants receive the conservative default configuration; all keys
/// have defaults, so omitting configuration yields a safe operating mode.
pub struct TenantRegistry {
    configs: RwLock<HashMap<TenantId, Arc<TenantConfig>>>,
}

impl Default for TenantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
        }
    }

    /// Current config for a tenant (default if never configured).
    pub fn config(&self, tenant: &TenantId) -> Arc<TenantConfig> {
        if let Some(cfg) = self
            .configs
            .read()
            .expect("tenant registry lock")
            .get(tenant)
        {
            return Arc::clone(cfg);
        }
        let cfg = Arc::new(TenantConfig::default());
        self.configs
            .write()
            .expect("tenant registry lock")
            .entry(tenant.clone())
            .or_insert_with(|| Arc::clone(&cfg))
            .clone()
    }

    /// Replace a tenant's configuration.
    pub fn upsert(&self, tenant: TenantId, config: TenantConfig) {
        self.configs
            .write()
            .expect("tenant registry lock")
            .insert(tenant, Arc::new(config));
    }

    /// Mutate a tenant's configuration in place.
    pub fn update<F>(&self, tenant: &TenantId, mutate: F)
    where
        F: FnOnce(&mut TenantConfig),
    {
        let mut guard = self.configs.write().expect("tenant registry lock");
        let mut cfg = guard
            .get(tenant)
            .map(|c| (**c).clone())
            .unwrap_or_default();
        mutate(&mut cfg);
        guard.insert(tenant.clone(), Arc::new(cfg));
    }

    /// Every tenant the registry has seen. Used by the worker scheduler.
    pub fn tenants(&self) -> Vec<TenantId> {
        self.configs
            .read()
            .expect("tenant registry lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Build a request context with the current config snapshot.
    pub fn context(&self, tenant: impl Into<TenantId>, actor: impl Into<String>) -> TenantContext {
        let tenant = tenant.into();
        let config = self.config(&tenant);
        TenantContext::new(tenant, actor, config)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_requires_matching_tenant() {
        let registry = TenantRegistry::new();
        let ctx = registry.context("t1", "tester");
        assert!(ctx.assert_owns(&TenantId::from("t1"), "memory").is_ok());
        let err = ctx
            .assert_owns(&TenantId::from("t2"), "memory")
            .unwrap_err();
        assert!(matches!(err, CoreError::TenantMismatch { .. }));
    }

    #[test]
    fn deadline_expiry_fails_fast() {
        let registry = TenantRegistry::new();
        let ctx = registry
            .context("t1", "tester")
            .with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(
            ctx.check_deadline(),
            Err(CoreError::DeadlineExceeded)
        ));
    }

    #[test]
    fn unknown_tenant_gets_defaults() {
        let registry = TenantRegistry::new();
        let cfg = registry.config(&TenantId::from("fresh"));
        assert!(cfg.retrieval.rrf_k > 0.0);
        assert!(registry.tenants().contains(&TenantId::from("fresh")));
    }

    #[test]
    fn role_guard() {
        let registry = TenantRegistry::new();
        let ctx = registry
            .context("t1", "tester")
            .with_roles(vec![Role::Reader]);
        assert!(ctx.require_role(Role::Reader, "query").is_ok());
        assert!(matches!(
            ctx.require_role(Role::Operator, "set_budget"),
            Err(CoreError::NotAuthorized(_))
        ));
    }
}

//! Cost & policy guard
//!
//! Two cooperating concerns. The cost guard admits every prospective priced
//! call before it is issued (no retroactive accounting) and reconciles the
//! actual cost afterwards. The policy guard classifies content at store time
//! and filters what a caller may see at retrieval time; classification is a
//! pure function of `(content, tenant policy)` so it is testable in
//! isolation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditOutcome, AuditPipeline};
use crate::error::{CoreError, Result};
use crate::memory::{InfoClass, Layer};
use crate::tenant::{PolicyConfig, RuleAction, TenantContext, TenantId};

// ============================================================================
// COST GUARD
// ============================================================================

/// Accounting window selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostWindow {
    /// Current UTC day
    Day,
    /// Current UTC month
    Month,
}

/// Spend picture for one tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostUsage {
    /// Spend in the requested window
    pub used_usd: f64,
    /// Budget for the requested window
    pub budget_usd: f64,
    /// Day-window spend
    pub daily_used_usd: f64,
    /// Day-window budget
    pub daily_budget_usd: f64,
    /// Month-window spend
    pub monthly_used_usd: f64,
    /// Month-window budget
    pub monthly_budget_usd: f64,
}

/// Proof that the cost guard admitted a prospective call.
#[derive(Debug, Clone)]
pub struct Admission {
    /// Opaque admission token
    pub token: String,
    /// The estimate the reservation was made with
    pub estimated_usd: f64,
}

struct TenantLedger {
    day: NaiveDate,
    daily_spent: f64,
    month: (i32, u32),
    monthly_spent: f64,
    alerts_fired: Vec<u32>,
}

impl TenantLedger {
    fn fresh(today: NaiveDate) -> Self {
        Self {
            day: today,
            daily_spent: 0.0,
            month: (today.year(), today.month()),
            monthly_spent: 0.0,
            alerts_fired: vec![],
        }
    }

    fn roll(&mut self, today: NaiveDate) {
        if self.day != today {
            self.day = today;
            self.daily_spent = 0.0;
            self.alerts_fired.clear();
        }
        let month = (today.year(), today.month());
        if self.month != month {
            self.month = month;
            self.monthly_spent = 0.0;
        }
    }
}

// Float comparison slack below a tenth of a cent so "budget exactly equal to
// the estimate" admits and "one cent over" rejects.
const BUDGET_EPSILON: f64 = 1e-6;

/// Per-tenant budget enforcement with alerting.
pub struct CostGuard {
    ledgers: Mutex<HashMap<TenantId, TenantLedger>>,
    audit: Mutex<Option<Arc<AuditPipeline>>>,
}

impl Default for CostGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl CostGuard {
    /// Guard with empty ledgers.
    pub fn new() -> Self {
        Self {
            ledgers: Mutex::new(HashMap::new()),
            audit: Mutex::new(None),
        }
    }

    /// Attach the audit pipeline (done once at engine construction).
    pub fn attach_audit(&self, audit: Arc<AuditPipeline>) {
        *self.audit.lock().expect("cost audit lock") = Some(audit);
    }

    fn emit(&self, event: AuditEvent) {
        if let Some(audit) = self.audit.lock().expect("cost audit lock").as_ref() {
            audit.emit(event);
        }
    }

    /// Admit a prospective priced call, reserving the estimate against both
    /// windows. Admission succeeds when spend plus estimate is at or under
    /// the limit, and fails once it is over by any amount.
    pub fn admit(&self, ctx: &TenantContext, estimated_usd: f64) -> Result<Admission> {
        if estimated_usd <= 0.0 {
            return Ok(Admission {
                token: Uuid::new_v4().to_string(),
                estimated_usd: 0.0,
            });
        }
        let budget = &ctx.config().budget;
        let today = Utc::now().date_naive();
        let mut ledgers = self.ledgers.lock().expect("cost ledger lock");
        let ledger = ledgers
            .entry(ctx.tenant().clone())
            .or_insert_with(|| TenantLedger::fresh(today));
        ledger.roll(today);

        let daily_over = ledger.daily_spent + estimated_usd > budget.daily_usd + BUDGET_EPSILON;
        let monthly_over =
            ledger.monthly_spent + estimated_usd > budget.monthly_usd + BUDGET_EPSILON;
        if daily_over || monthly_over {
            let remaining = (budget.daily_usd - ledger.daily_spent)
                .min(budget.monthly_usd - ledger.monthly_spent)
                .max(0.0);
            self.emit(
                AuditEvent::of(ctx, "cost_admission")
                    .outcome(AuditOutcome::Denied)
                    .cost(estimated_usd)
                    .detail(serde_json::json!({
                        "estimatedUsd": estimated_usd,
                        "remainingUsd": remaining,
                    }))
                    .critical(),
            );
            return Err(CoreError::BudgetExceeded {
                estimated_usd,
                remaining_usd: remaining,
            });
        }

        ledger.daily_spent += estimated_usd;
        ledger.monthly_spent += estimated_usd;

        // Alerts fire as the daily window crosses configured fractions.
        let fraction = if budget.daily_usd > 0.0 {
            ledger.daily_spent / budget.daily_usd
        } else {
            1.0
        };
        for (idx, threshold) in budget.alert_thresholds.iter().enumerate() {
            let idx = idx as u32;
            if fraction + BUDGET_EPSILON >= *threshold && !ledger.alerts_fired.contains(&idx) {
                ledger.alerts_fired.push(idx);
                tracing::warn!(
                    tenant = %ctx.tenant(),
                    threshold = threshold,
                    spent = ledger.daily_spent,
                    "budget alert threshold crossed"
                );
                self.emit(
                    AuditEvent::of(ctx, "budget_alert")
                        .detail(serde_json::json!({
                            "threshold": threshold,
                            "dailySpentUsd": ledger.daily_spent,
                        }))
                        .critical(),
                );
            }
        }

        Ok(Admission {
            token: Uuid::new_v4().to_string(),
            estimated_usd,
        })
    }

    /// Reconcile the reservation against the actual cost.
    pub fn settle(&self, ctx: &TenantContext, admission: &Admission, actual_usd: f64) {
        let delta = actual_usd - admission.estimated_usd;
        if delta.abs() < BUDGET_EPSILON {
            return;
        }
        let today = Utc::now().date_naive();
        let mut ledgers = self.ledgers.lock().expect("cost ledger lock");
        let ledger = ledgers
            .entry(ctx.tenant().clone())
            .or_insert_with(|| TenantLedger::fresh(today));
        ledger.roll(today);
        ledger.daily_spent = (ledger.daily_spent + delta).max(0.0);
        ledger.monthly_spent = (ledger.monthly_spent + delta).max(0.0);
    }

    /// Current spend picture for a tenant.
    pub fn usage(&self, ctx: &TenantContext, window: CostWindow) -> CostUsage {
        let budget = &ctx.config().budget;
        let today = Utc::now().date_naive();
        let mut ledgers = self.ledgers.lock().expect("cost ledger lock");
        let ledger = ledgers
            .entry(ctx.tenant().clone())
            .or_insert_with(|| TenantLedger::fresh(today));
        ledger.roll(today);
        let (used, cap) = match window {
            CostWindow::Day => (ledger.daily_spent, budget.daily_usd),
            CostWindow::Month => (ledger.monthly_spent, budget.monthly_usd),
        };
        CostUsage {
            used_usd: used,
            budget_usd: cap,
            daily_used_usd: ledger.daily_spent,
            daily_budget_usd: budget.daily_usd,
            monthly_used_usd: ledger.monthly_spent,
            monthly_budget_usd: budget.monthly_usd,
        }
    }
}

// ============================================================================
// POLICY GUARD
// ============================================================================

/// Result of store-time classification.
#[derive(Debug, Clone)]
pub enum StoreDecision {
    /// Accept the content, possibly scrubbed and tagged
    Allow {
        /// Final information class (max of asserted and classified)
        class: InfoClass,
        /// Content after scrub actions
        content: String,
        /// Tags contributed by `Tag`-action rules
        extra_tags: Vec<String>,
        /// Names of rules that matched
        matched_rules: Vec<String>,
    },
    /// Abort the write
    Reject {
        /// Class the content classified into
        class: InfoClass,
        /// Rule that demanded rejection
        rule: String,
    },
}

fn compiled(pattern: &str) -> Option<Regex> {
    static CACHE: OnceLock<Mutex<HashMap<String, Option<Regex>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache.lock().expect("regex cache lock");
    cache
        .entry(pattern.to_string())
        .or_insert_with(|| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "invalid policy pattern skipped");
                None
            }
        })
        .clone()
}

/// Information-class policy evaluation. Stateless; every decision is a pure
/// function of the inputs.
#[derive(Default)]
pub struct PolicyGuard;

impl PolicyGuard {
    /// Fresh guard.
    pub fn new() -> Self {
        Self
    }

    /// Classify content against the tenant's rules, performing scrub/tag
    /// actions. `asserted` is the class the caller claimed; the result never
    /// sinks below it.
    pub fn classify(
        &self,
        content: &str,
        asserted: InfoClass,
        config: &PolicyConfig,
    ) -> StoreDecision {
        let mut class = InfoClass::Public.max(asserted);
        let mut scrubbed = content.to_string();
        let mut extra_tags = Vec::new();
        let mut matched_rules = Vec::new();

        for rule in &config.info_class_rules {
            let Some(re) = compiled(&rule.pattern) else {
                continue;
            };
            if !re.is_match(&scrubbed) {
                continue;
            }
            matched_rules.push(rule.name.clone());
            class = class.max(rule.class);
            match rule.action {
                RuleAction::Reject => {
                    return StoreDecision::Reject {
                        class,
                        rule: rule.name.clone(),
                    };
                }
                RuleAction::Scrub => {
                    let replacement = format!("[REDACTED:{}]", rule.name);
                    scrubbed = re.replace_all(&scrubbed, replacement.as_str()).into_owned();
                }
                RuleAction::Tag => {
                    extra_tags.push(rule.name.clone());
                }
            }
        }

        StoreDecision::Allow {
            class,
            content: scrubbed,
            extra_tags,
            matched_rules,
        }
    }

    /// Enforce the layer-containment invariant for a store or promotion.
    ///
    /// Restricted content lives only in the working layer; confidential
    /// content may not enter a consolidated layer unless it went through
    /// sanitization.
    pub fn check_layer(
        &self,
        class: InfoClass,
        target: Layer,
        sanitized: bool,
        config: &PolicyConfig,
    ) -> Result<()> {
        if !class.permits_layer(target) {
            return Err(CoreError::RestrictedContent);
        }
        if class == InfoClass::Confidential
            && target >= Layer::LongTerm
            && !sanitized
            && config.layer_containment_strict
        {
            return Err(CoreError::InfoClassViolation(format!(
                "confidential content requires sanitization before {target}"
            )));
        }
        Ok(())
    }

    /// Whether a caller may receive content of this class.
    pub fn visible_to(&self, ctx: &TenantContext, class: InfoClass) -> bool {
        class <= ctx.clearance()
    }

    /// Apply the tenant's redaction rules before content leaves the process.
    /// Scrub-action class rules apply in addition to the explicit redaction
    /// patterns.
    pub fn redact(&self, text: &str, config: &PolicyConfig) -> String {
        let mut out = text.to_string();
        for rule in &config.info_class_rules {
            if rule.action != RuleAction::Scrub && rule.class < InfoClass::Confidential {
                continue;
            }
            if let Some(re) = compiled(&rule.pattern) {
                let replacement = format!("[REDACTED:{}]", rule.name);
                out = re.replace_all(&out, replacement.as_str()).into_owned();
            }
        }
        for pattern in &config.redaction_patterns {
            if let Some(re) = compiled(pattern) {
                out = re.replace_all(&out, "[REDACTED]").into_owned();
            }
        }
        out
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{TenantConfig, TenantRegistry};

    fn ctx_with_budget(daily: f64, monthly: f64) -> TenantContext {
        let registry = TenantRegistry::new();
        registry.update(&TenantId::from("t1"), |cfg| {
            cfg.budget.daily_usd = daily;
            cfg.budget.monthly_usd = monthly;
        });
        registry.context("t1", "tester")
    }

    #[test]
    fn admission_at_exact_budget_succeeds() {
        let guard = CostGuard::new();
        let ctx = ctx_with_budget(0.02, 10.0);
        assert!(guard.admit(&ctx, 0.02).is_ok());
    }

    #[test]
    fn admission_one_cent_over_fails() {
        let guard = CostGuard::new();
        let ctx = ctx_with_budget(0.02, 10.0);
        let err = guard.admit(&ctx, 0.03).unwrap_err();
        assert!(matches!(err, CoreError::BudgetExceeded { .. }));
    }

    #[test]
    fn reservations_accumulate() {
        let guard = CostGuard::new();
        let ctx = ctx_with_budget(0.05, 10.0);
        guard.admit(&ctx, 0.03).unwrap();
        assert!(guard.admit(&ctx, 0.03).is_err());
        assert!(guard.admit(&ctx, 0.02).is_ok());
    }

    #[test]
    fn settle_reconciles_actuals() {
        let guard = CostGuard::new();
        let ctx = ctx_with_budget(0.05, 10.0);
        let admission = guard.admit(&ctx, 0.04).unwrap();
        // Actual came in cheaper; the freed budget admits another call.
        guard.settle(&ctx, &admission, 0.01);
        assert!(guard.admit(&ctx, 0.04).is_ok());
    }

    #[test]
    fn monthly_cap_binds_independently() {
        let guard = CostGuard::new();
        let ctx = ctx_with_budget(10.0, 0.02);
        assert!(guard.admit(&ctx, 0.05).is_err());
    }

    #[test]
    fn usage_reports_both_windows() {
        let guard = CostGuard::new();
        let ctx = ctx_with_budget(1.0, 5.0);
        guard.admit(&ctx, 0.25).unwrap();
        let usage = guard.usage(&ctx, CostWindow::Day);
        assert!((usage.used_usd - 0.25).abs() < 1e-9);
        assert_eq!(usage.budget_usd, 1.0);
        assert!((usage.monthly_used_usd - 0.25).abs() < 1e-9);
    }

    #[test]
    fn ssn_is_rejected_as_restricted() {
        let guard = PolicyGuard::new();
        let cfg = TenantConfig::default();
        let decision = guard.classify("SSN 123-45-6789", InfoClass::Public, &cfg.policy);
        match decision {
            StoreDecision::Reject { class, rule } => {
                assert_eq!(class, InfoClass::Restricted);
                assert_eq!(rule, "ssn");
            }
            StoreDecision::Allow { .. } => panic!("SSN content must be rejected"),
        }
    }

    #[test]
    fn emails_are_scrubbed_not_rejected() {
        let guard = PolicyGuard::new();
        let cfg = TenantConfig::default();
        let decision = guard.classify(
            "escalated by oncall@example.com at midnight",
            InfoClass::Public,
            &cfg.policy,
        );
        match decision {
            StoreDecision::Allow {
                class, content, ..
            } => {
                assert_eq!(class, InfoClass::Internal);
                assert!(!content.contains("oncall@example.com"));
                assert!(content.contains("[REDACTED:email]"));
            }
            StoreDecision::Reject { .. } => panic!("emails scrub, not reject"),
        }
    }

    #[test]
    fn classification_never_sinks_below_assertion() {
        let guard = PolicyGuard::new();
        let cfg = TenantConfig::default();
        let decision = guard.classify("plain text", InfoClass::Confidential, &cfg.policy);
        match decision {
            StoreDecision::Allow { class, .. } => assert_eq!(class, InfoClass::Confidential),
            StoreDecision::Reject { .. } => panic!("plain text must pass"),
        }
    }

    #[test]
    fn layer_containment() {
        let guard = PolicyGuard::new();
        let cfg = TenantConfig::default();
        assert!(
            guard
                .check_layer(InfoClass::Restricted, Layer::Working, false, &cfg.policy)
                .is_ok()
        );
        assert!(matches!(
            guard.check_layer(InfoClass::Restricted, Layer::LongTerm, false, &cfg.policy),
            Err(CoreError::RestrictedContent)
        ));
        assert!(matches!(
            guard.check_layer(InfoClass::Confidential, Layer::LongTerm, false, &cfg.policy),
            Err(CoreError::InfoClassViolation(_))
        ));
        assert!(
            guard
                .check_layer(InfoClass::Confidential, Layer::LongTerm, true, &cfg.policy)
                .is_ok()
        );
    }

    #[test]
    fn redaction_applies_before_external_calls() {
        let guard = PolicyGuard::new();
        let cfg = TenantConfig::default();
        let out = guard.redact("ping admin@site.io about the deploy", &cfg.policy);
        assert!(!out.contains("admin@site.io"));
    }
}

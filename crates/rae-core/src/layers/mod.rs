//! Four-layer memory pipeline
//!
//! Records flow sensory -> working -> longterm -> reflective and never move
//! down. Admission is threshold-gated per transition; every promotion
//! produces a new record with parent pointers, written in two phases (stage,
//! then commit) so workers never observe a torn consolidation. A
//! reconciliation sweep clears stages that never committed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditPipeline};
use crate::error::{CoreError, Result};
use crate::memory::{InfoClass, Layer, MemoryRecord, content_hash};
use crate::policy::PolicyGuard;
use crate::reflection::ReflectionInfo;
use crate::storage::RecordStore;
use crate::tenant::{AdmissionThresholds, LayerConfig, TenantContext};

/// Staged consolidations older than this are rolled back by the sweep.
const STALE_STAGE_HORIZON_SECS: i64 = 3_600;

/// Tag stamped on records that already fed a consolidation; keeps cycles
/// from promoting the same sources again.
pub const CONSOLIDATED_TAG: &str = "consolidated";

// ============================================================================
// ADMISSION POLICY
// ============================================================================

/// Sensory -> working: importance at the threshold, or a mandatory tag.
pub fn admits_working(record: &MemoryRecord, config: &LayerConfig) -> bool {
    record.importance >= config.admission_thresholds.sensory_importance
        || config
            .mandatory_tags
            .iter()
            .any(|t| record.tags.contains(t))
}

/// Working -> longterm: importance, usage, and age thresholds, and never
/// restricted content.
pub fn admits_longterm(
    record: &MemoryRecord,
    thresholds: &AdmissionThresholds,
    now: DateTime<Utc>,
) -> bool {
    record.layer == Layer::Working
        && record.info_class != InfoClass::Restricted
        && !record.tags.iter().any(|t| t == CONSOLIDATED_TAG)
        && record.importance >= thresholds.working_importance
        && record.usage_count >= thresholds.working_min_usage
        && record.age(now) >= Duration::seconds(thresholds.working_min_age_secs as i64)
}

/// Longterm -> reflective clustering: groups of records sharing a tag, with
/// size, mean importance, and mean usage above the thresholds.
pub fn reflective_clusters(
    records: &[MemoryRecord],
    thresholds: &AdmissionThresholds,
) -> Vec<Vec<MemoryRecord>> {
    let mut by_tag: std::collections::BTreeMap<&str, Vec<&MemoryRecord>> =
        std::collections::BTreeMap::new();
    for record in records {
        if record.layer != Layer::LongTerm {
            continue;
        }
        for tag in &record.tags {
            by_tag.entry(tag.as_str()).or_default().push(record);
        }
    }

    let mut clusters: Vec<Vec<MemoryRecord>> = Vec::new();
    let mut seen_member_sets: Vec<Vec<String>> = Vec::new();
    for (_, members) in by_tag {
        if members.len() < thresholds.cluster_min_size {
            continue;
        }
        let mean_importance =
            members.iter().map(|r| r.importance).sum::<f64>() / members.len() as f64;
        let mean_usage =
            members.iter().map(|r| r.usage_count as f64).sum::<f64>() / members.len() as f64;
        if mean_importance < thresholds.cluster_mean_importance
            || mean_usage < thresholds.cluster_mean_usage
        {
            continue;
        }
        let mut ids: Vec<String> = members.iter().map(|r| r.id.clone()).collect();
        ids.sort();
        if seen_member_sets.contains(&ids) {
            continue;
        }
        seen_member_sets.push(ids);
        clusters.push(members.into_iter().cloned().collect());
    }
    clusters
}

// ============================================================================
// CONSOLIDATION
// ============================================================================

/// Report from the staged-consolidation reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSweep {
    /// Stages rolled back
    pub rolled_back: usize,
}

/// Performs two-phase consolidations and the reconciliation sweep.
pub struct LayerPipeline {
    records: Arc<dyn RecordStore>,
    policy: Arc<PolicyGuard>,
    audit: Arc<AuditPipeline>,
}

impl LayerPipeline {
    /// Wire the pipeline.
    pub fn new(
        records: Arc<dyn RecordStore>,
        policy: Arc<PolicyGuard>,
        audit: Arc<AuditPipeline>,
    ) -> Self {
        Self {
            records,
            policy,
            audit,
        }
    }

    /// Consolidate `parents` into a new record in `target`, two-phase.
    ///
    /// The target layer must strictly exceed every parent's layer; the
    /// policy guard checks information-class containment for the synthesized
    /// class (the max across parents). `sanitized` asserts the content was
    /// rewritten rather than copied.
    #[allow(clippy::too_many_arguments)]
    pub fn consolidate(
        &self,
        ctx: &TenantContext,
        parents: &[MemoryRecord],
        target: Layer,
        content: String,
        tags: Vec<String>,
        importance: f64,
        sanitized: bool,
        reflection: Option<ReflectionInfo>,
        worker: &str,
    ) -> Result<MemoryRecord> {
        if parents.is_empty() {
            return Err(CoreError::InvalidRecord("consolidation needs parents".into()));
        }
        for parent in parents {
            ctx.assert_owns(&parent.tenant, "consolidation parent")?;
            if parent.layer.rank() >= target.rank() {
                return Err(CoreError::BadLayer(format!(
                    "parent {} in {} cannot consolidate into {}",
                    parent.id, parent.layer, target
                )));
            }
        }
        let class = parents
            .iter()
            .map(|p| p.info_class)
            .max()
            .unwrap_or_default();
        self.policy
            .check_layer(class, target, sanitized, &ctx.config().policy)?;

        let now = Utc::now();
        let hash = content_hash(&content);
        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            tenant: ctx.tenant().clone(),
            layer: target,
            content,
            tags,
            source: Some(format!("consolidation:{worker}")),
            importance: importance.clamp(0.0, 1.0),
            usage_count: 0,
            created_at: now,
            last_accessed_at: now,
            last_decayed_at: None,
            info_class: if sanitized && class == InfoClass::Confidential {
                InfoClass::Internal
            } else {
                class
            },
            content_hash: hash.clone(),
            parents: parents.iter().map(|p| p.id.clone()).collect(),
            staged: true,
            reflection,
        };

        // Phase one: stage the record with lineage in place.
        self.records.put(ctx, &record)?;
        // Phase two: commit. On a crash in between, the sweep rolls back.
        self.records.commit_staged(ctx, &record.id)?;

        self.audit.emit(
            AuditEvent::of(ctx, "consolidation")
                .info_class(record.info_class)
                .detail(serde_json::json!({
                    "worker": worker,
                    "target": target.as_str(),
                    "parents": record.parents,
                    "contentHash": hash,
                })),
        );

        let mut committed = record;
        committed.staged = false;
        Ok(committed)
    }

    /// Roll back stages that never committed.
    pub fn sweep_stale_stages(&self, ctx: &TenantContext) -> Result<StageSweep> {
        let horizon = Utc::now() - Duration::seconds(STALE_STAGE_HORIZON_SECS);
        let rolled_back = self.records.prune_stale_staged(ctx, horizon)?;
        if rolled_back > 0 {
            tracing::warn!(rolled_back, "rolled back stale consolidation stages");
        }
        Ok(StageSweep { rolled_back })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::VecAuditSink;
    use crate::memory::RecordDraft;
    use crate::storage::InMemoryStore;
    use crate::tenant::TenantRegistry;

    fn record(ctx: &TenantContext, layer: Layer, importance: f64) -> MemoryRecord {
        let mut record = RecordDraft::new(format!("record in {layer} at {importance}"))
            .into_record(ctx.tenant().clone(), Utc::now())
            .unwrap();
        record.layer = layer;
        record.importance = importance;
        record
    }

    #[test]
    fn working_admission_by_importance_or_tag() {
        let registry = TenantRegistry::new();
        let ctx = registry.context("t1", "tester");
        let config = LayerConfig {
            mandatory_tags: vec!["pin".into()],
            ..Default::default()
        };

        let mut low = record(&ctx, Layer::Sensory, 0.2);
        assert!(!admits_working(&low, &config));
        low.tags = vec!["pin".into()];
        assert!(admits_working(&low, &config));

        let high = record(&ctx, Layer::Sensory, 0.8);
        assert!(admits_working(&high, &config));
    }

    #[test]
    fn longterm_admission_requires_all_gates() {
        let registry = TenantRegistry::new();
        let ctx = registry.context("t1", "tester");
        let thresholds = AdmissionThresholds::default();
        let now = Utc::now();

        let mut rec = record(&ctx, Layer::Working, 0.8);
        rec.usage_count = 3;
        rec.created_at = now - Duration::hours(2);
        assert!(admits_longterm(&rec, &thresholds, now));

        // Too young
        rec.created_at = now - Duration::seconds(10);
        assert!(!admits_longterm(&rec, &thresholds, now));
        rec.created_at = now - Duration::hours(2);

        // Too few usages
        rec.usage_count = 1;
        assert!(!admits_longterm(&rec, &thresholds, now));
        rec.usage_count = 3;

        // Restricted never promotes
        rec.info_class = InfoClass::Restricted;
        assert!(!admits_longterm(&rec, &thresholds, now));
    }

    #[test]
    fn clustering_requires_shared_tags_and_means() {
        let registry = TenantRegistry::new();
        let ctx = registry.context("t1", "tester");
        let thresholds = AdmissionThresholds::default();

        let mut records = Vec::new();
        for i in 0..4 {
            let mut rec = record(&ctx, Layer::LongTerm, 0.8);
            rec.tags = vec!["deploy".into()];
            rec.usage_count = 6;
            rec.content = format!("deploy trouble {i}");
            records.push(rec);
        }
        // A lone record under another tag
        let mut stray = record(&ctx, Layer::LongTerm, 0.9);
        stray.tags = vec!["misc".into()];
        records.push(stray);

        let clusters = reflective_clusters(&records, &thresholds);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 4);

        // Low mean usage kills the cluster
        let mut low_usage = records.clone();
        for rec in &mut low_usage {
            rec.usage_count = 1;
        }
        assert!(reflective_clusters(&low_usage, &thresholds).is_empty());
    }

    fn pipeline() -> (LayerPipeline, Arc<InMemoryStore>, TenantContext) {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(VecAuditSink::new());
        let registry = TenantRegistry::new();
        let ctx = registry.context("t1", "tester");
        let pipeline = LayerPipeline::new(
            store.clone(),
            Arc::new(PolicyGuard::new()),
            crate::audit::AuditPipeline::spawn(audit, 16),
        );
        (pipeline, store, ctx)
    }

    #[tokio::test]
    async fn consolidation_links_parents_and_commits() {
        let (pipeline, store, ctx) = pipeline();
        let mut parent = record(&ctx, Layer::Working, 0.8);
        parent.usage_count = 4;
        store.put(&ctx, &parent).unwrap();

        let consolidated = pipeline
            .consolidate(
                &ctx,
                &[parent.clone()],
                Layer::LongTerm,
                "summary of the working record".into(),
                vec!["deploy".into()],
                0.8,
                true,
                None,
                "summarization",
            )
            .unwrap();

        assert_eq!(consolidated.layer, Layer::LongTerm);
        assert_eq!(consolidated.parents, vec![parent.id.clone()]);
        let loaded = store.get(&ctx, &consolidated.id).unwrap().unwrap();
        assert!(!loaded.staged);
        assert!(loaded.layer > parent.layer);
    }

    #[tokio::test]
    async fn consolidation_rejects_non_upward_targets() {
        let (pipeline, store, ctx) = pipeline();
        let parent = record(&ctx, Layer::LongTerm, 0.8);
        store.put(&ctx, &parent).unwrap();

        let err = pipeline
            .consolidate(
                &ctx,
                &[parent],
                Layer::Working,
                "downgrade attempt".into(),
                vec![],
                0.5,
                true,
                None,
                "test",
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::BadLayer(_)));
    }

    #[tokio::test]
    async fn restricted_parents_never_consolidate() {
        let (pipeline, store, ctx) = pipeline();
        let mut parent = record(&ctx, Layer::Working, 0.9);
        parent.info_class = InfoClass::Restricted;
        store.put(&ctx, &parent).unwrap();

        let err = pipeline
            .consolidate(
                &ctx,
                &[parent],
                Layer::LongTerm,
                "should not happen".into(),
                vec![],
                0.5,
                true,
                None,
                "test",
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::RestrictedContent));
    }
}

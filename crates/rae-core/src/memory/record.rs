//! Memory record - the atomic unit
//!
//! A record belongs to exactly one tenant, lives in exactly one layer, and
//! never moves down. Consolidation produces a new record in a higher layer
//! with parent pointers back to its sources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::tenant::TenantId;

// ============================================================================
// LAYERS
// ============================================================================

/// The four memory tiers. Ordering is the promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Ephemeral raw input
    #[default]
    Sensory,
    /// Active context
    Working,
    /// Persisted consolidated knowledge
    #[serde(rename = "longterm")]
    LongTerm,
    /// Synthesized meta-insights
    Reflective,
}

impl Layer {
    /// Stable string form used in storage and configuration keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Sensory => "sensory",
            Layer::Working => "working",
            Layer::LongTerm => "longterm",
            Layer::Reflective => "reflective",
        }
    }

    /// Parse a storage string.
    pub fn parse_name(s: &str) -> Result<Self> {
        match s {
            "sensory" => Ok(Layer::Sensory),
            "working" => Ok(Layer::Working),
            "longterm" => Ok(Layer::LongTerm),
            "reflective" => Ok(Layer::Reflective),
            other => Err(CoreError::BadLayer(other.to_string())),
        }
    }

    /// Promotion rank; consolidation targets must strictly exceed sources.
    pub fn rank(&self) -> u8 {
        match self {
            Layer::Sensory => 0,
            Layer::Working => 1,
            Layer::LongTerm => 2,
            Layer::Reflective => 3,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// INFORMATION CLASS
// ============================================================================

/// Confidentiality label. Ordering is sensitivity: `Public < Internal <
/// Confidential < Restricted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InfoClass {
    /// Unrestricted content
    Public,
    /// Default for tenant-internal material
    #[default]
    Internal,
    /// Requires sanitization before consolidation
    Confidential,
    /// Transient only; never persists outside the working layer
    Restricted,
}

impl InfoClass {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            InfoClass::Public => "public",
            InfoClass::Internal => "internal",
            InfoClass::Confidential => "confidential",
            InfoClass::Restricted => "restricted",
        }
    }

    /// Parse a storage string.
    pub fn parse_name(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(InfoClass::Public),
            "internal" => Ok(InfoClass::Internal),
            "confidential" => Ok(InfoClass::Confidential),
            "restricted" => Ok(InfoClass::Restricted),
            other => Err(CoreError::InfoClassViolation(format!(
                "unknown class: {other}"
            ))),
        }
    }

    /// Whether content of this class may be persisted into `layer`.
    pub fn permits_layer(&self, layer: Layer) -> bool {
        match self {
            InfoClass::Restricted => layer == Layer::Working,
            _ => true,
        }
    }
}

impl std::fmt::Display for InfoClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY RECORD
// ============================================================================

/// The atomic unit of memory.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    /// Unique within the tenant
    pub id: String,
    /// Owning tenant (mandatory on every artifact)
    pub tenant: TenantId,
    /// Memory tier
    pub layer: Layer,
    /// Textual payload
    pub content: String,
    /// Free-form indexed labels
    pub tags: Vec<String>,
    /// Origin hint (URL, conversation id, tool name)
    pub source: Option<String>,
    /// Importance in [0,1]
    pub importance: f64,
    /// Monotonically increasing access counter
    pub usage_count: i64,
    /// Creation time, UTC
    pub created_at: DateTime<Utc>,
    /// Last read or usage bump, UTC
    pub last_accessed_at: DateTime<Utc>,
    /// Last time the decay cycle touched this record
    pub last_decayed_at: Option<DateTime<Utc>>,
    /// Confidentiality label
    pub info_class: InfoClass,
    /// SHA-256 of the content at write time
    pub content_hash: String,
    /// Consolidation lineage (ids of lower-layer sources)
    pub parents: Vec<String>,
    /// Set on staged consolidation outputs until the commit phase
    pub staged: bool,
    /// Present on reflective-layer records produced by the reflection engine
    pub reflection: Option<crate::reflection::ReflectionInfo>,
}

impl MemoryRecord {
    /// Age relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// Validate the numeric invariants a backend row must satisfy. A failure
    /// here on a loaded row means poisoned data.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.importance) {
            return Err(CoreError::Poisoned(format!(
                "importance {} outside [0,1] for {}",
                self.importance, self.id
            )));
        }
        if self.usage_count < 0 {
            return Err(CoreError::Poisoned(format!(
                "negative usage counter for {}",
                self.id
            )));
        }
        Ok(())
    }
}

/// SHA-256 of a content payload, hex-encoded.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// DRAFTS & UPDATES
// ============================================================================

/// Input for storing a new memory.
///
/// Uses `deny_unknown_fields` to prevent field injection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RecordDraft {
    /// The content to remember
    pub content: String,
    /// Requested layer; `None` lets ingest pick sensory/working by source
    pub layer: Option<Layer>,
    /// Free-form labels
    pub tags: Vec<String>,
    /// Origin hint
    pub source: Option<String>,
    /// Importance in [0,1]; defaults to 0.5
    pub importance: Option<f64>,
    /// Caller-asserted class; the policy guard may raise it, never lower it
    pub info_class: Option<InfoClass>,
    /// Caller-supplied creation time; must not trail the tenant highwater
    pub created_at: Option<DateTime<Utc>>,
}

impl RecordDraft {
    /// Draft with just content.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Materialize into a record owned by `tenant`.
    pub fn into_record(self, tenant: TenantId, now: DateTime<Utc>) -> Result<MemoryRecord> {
        if self.content.trim().is_empty() {
            return Err(CoreError::InvalidRecord("empty content".into()));
        }
        let importance = self.importance.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&importance) {
            return Err(CoreError::InvalidRecord(format!(
                "importance {importance} outside [0,1]"
            )));
        }
        let created_at = self.created_at.unwrap_or(now);
        let hash = content_hash(&self.content);
        Ok(MemoryRecord {
            id: Uuid::new_v4().to_string(),
            tenant,
            layer: self.layer.unwrap_or(Layer::Sensory),
            content: self.content,
            tags: self.tags,
            source: self.source,
            importance,
            usage_count: 0,
            created_at,
            last_accessed_at: created_at,
            last_decayed_at: None,
            info_class: self.info_class.unwrap_or_default(),
            content_hash: hash,
            parents: vec![],
            staged: false,
            reflection: None,
        })
    }
}

/// Mutation applied by `update`. Content changes are forbidden once embeddings
/// exist; clients create a new record and link via parent ref instead.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RecordUpdate {
    /// Replace the tag set
    pub tags: Option<Vec<String>>,
    /// Replace importance (validated to [0,1])
    pub importance: Option<f64>,
    /// Downgrade only; raising sensitivity after the fact is rejected
    pub info_class: Option<InfoClass>,
    /// Increment the usage counter and refresh last-accessed
    pub touch_usage: bool,
}

impl RecordUpdate {
    /// Whether this update changes anything.
    pub fn is_empty(&self) -> bool {
        self.tags.is_none()
            && self.importance.is_none()
            && self.info_class.is_none()
            && !self.touch_usage
    }
}

// ============================================================================
// EMBEDDING RECORD
// ============================================================================

/// A stored vector projection of one record under one model.
///
/// Federated-embedding invariant: the record is canonical; each embedding is a
/// local projection. A hash or dimension mismatch marks the projection stale
/// and excludes it from vector search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingRecord {
    /// Owning tenant
    pub tenant: TenantId,
    /// Record this vector projects
    pub memory_id: String,
    /// Embedding model name
    pub model: String,
    /// Declared dimensionality of the model
    pub dim: usize,
    /// The vector
    pub vector: Vec<f32>,
    /// Content hash at embedding time
    pub content_hash: String,
    /// When the vector was computed
    pub created_at: DateTime<Utc>,
    /// Stale projections are ignored by retrieval until recomputed
    pub stale: bool,
}

impl EmbeddingRecord {
    /// Whether this embedding is consistent with the record it projects.
    pub fn consistent_with(&self, record: &MemoryRecord) -> bool {
        !self.stale && self.content_hash == record.content_hash && self.vector.len() == self.dim
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_ordering_matches_promotion_order() {
        assert!(Layer::Sensory < Layer::Working);
        assert!(Layer::Working < Layer::LongTerm);
        assert!(Layer::LongTerm < Layer::Reflective);
        assert_eq!(Layer::parse_name("longterm").unwrap(), Layer::LongTerm);
        assert!(Layer::parse_name("archive").is_err());
    }

    #[test]
    fn restricted_only_lives_in_working() {
        assert!(InfoClass::Restricted.permits_layer(Layer::Working));
        assert!(!InfoClass::Restricted.permits_layer(Layer::LongTerm));
        assert!(!InfoClass::Restricted.permits_layer(Layer::Reflective));
        assert!(InfoClass::Confidential.permits_layer(Layer::LongTerm));
    }

    #[test]
    fn draft_validates_importance() {
        let draft = RecordDraft {
            content: "hello".into(),
            importance: Some(1.5),
            ..Default::default()
        };
        assert!(matches!(
            draft.into_record(TenantId::from("t1"), Utc::now()),
            Err(CoreError::InvalidRecord(_))
        ));
    }

    #[test]
    fn draft_rejects_empty_content() {
        let draft = RecordDraft::new("   ");
        assert!(draft.into_record(TenantId::from("t1"), Utc::now()).is_err());
    }

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash("replication lag");
        let b = content_hash("replication lag");
        let c = content_hash("replication lag!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn embedding_consistency_checks_hash_and_dim() {
        let record = RecordDraft::new("content")
            .into_record(TenantId::from("t1"), Utc::now())
            .unwrap();
        let good = EmbeddingRecord {
            tenant: record.tenant.clone(),
            memory_id: record.id.clone(),
            model: "m".into(),
            dim: 3,
            vector: vec![0.1, 0.2, 0.3],
            content_hash: record.content_hash.clone(),
            created_at: Utc::now(),
            stale: false,
        };
        assert!(good.consistent_with(&record));

        let mut wrong_dim = good.clone();
        wrong_dim.vector.push(0.4);
        assert!(!wrong_dim.consistent_with(&record));

        let mut wrong_hash = good.clone();
        wrong_hash.content_hash = content_hash("other");
        assert!(!wrong_hash.consistent_with(&record));
    }
}

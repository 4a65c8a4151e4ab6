//! Memory module - core record types and the record service
//!
//! The atomic unit is [`MemoryRecord`]: tenant-owned, layer-tagged,
//! information-classed, hash-stamped. The service layer wraps the storage
//! backends with policy, dedup, embedding fan-out, and audit.

mod record;
mod service;

pub use record::{
    EmbeddingRecord, InfoClass, Layer, MemoryRecord, RecordDraft, RecordUpdate, content_hash,
};
pub use service::{EmbeddingSweep, MemoryService, StatsScope, StoreOutcome, UsageSnapshot};

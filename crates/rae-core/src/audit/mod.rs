//! Audit & telemetry
//!
//! Every significant action emits a structured event with a common envelope.
//! Events flow through a bounded async pipeline so audit writes never block
//! the critical path; on overflow the pipeline drops the least-critical
//! telemetry first and always keeps policy and cost events.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::memory::InfoClass;
use crate::storage::AuditStore;
use crate::tenant::{TenantContext, TenantId};

// ============================================================================
// EVENT ENVELOPE
// ============================================================================

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Completed
    Ok,
    /// Rejected by policy or budget
    Denied,
    /// Failed with an error
    Error,
    /// Postponed (worker budget deferral)
    Deferred,
    /// Completed with degradation
    Partial,
}

impl AuditOutcome {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Ok => "ok",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Error => "error",
            AuditOutcome::Deferred => "deferred",
            AuditOutcome::Partial => "partial",
        }
    }
}

/// One audit event. Append-only once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event id
    pub event_id: String,
    /// Emission time, UTC
    pub timestamp: DateTime<Utc>,
    /// Tenant the operation ran under
    pub tenant: TenantId,
    /// Authenticated actor
    pub actor: String,
    /// Request correlation id
    pub request_id: String,
    /// Operation name ("store_memory", "query_memory", "decay_cycle", ...)
    pub operation: String,
    /// Information class of involved content, when applicable
    pub info_class: Option<InfoClass>,
    /// Outcome
    pub outcome: AuditOutcome,
    /// Wall-clock latency, when measured
    pub latency_ms: Option<u64>,
    /// Cost in USD, for priced calls
    pub cost_usd: Option<f64>,
    /// Operation-specific fields
    pub detail: serde_json::Value,
    /// Policy/cost events are critical and survive pipeline overflow
    pub critical: bool,
}

impl AuditEvent {
    /// Start an event for an operation under a request context.
    pub fn of(ctx: &TenantContext, operation: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            tenant: ctx.tenant().clone(),
            actor: ctx.actor().to_string(),
            request_id: ctx.request_id().as_str().to_string(),
            operation: operation.into(),
            info_class: None,
            outcome: AuditOutcome::Ok,
            latency_ms: None,
            cost_usd: None,
            detail: serde_json::Value::Null,
            critical: false,
        }
    }

    /// Event for a worker cycle with no request context.
    pub fn worker(tenant: TenantId, operation: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            tenant,
            actor: "worker".to_string(),
            request_id: String::new(),
            operation: operation.into(),
            info_class: None,
            outcome: AuditOutcome::Ok,
            latency_ms: None,
            cost_usd: None,
            detail: serde_json::Value::Null,
            critical: false,
        }
    }

    /// Set the outcome.
    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Set the content class.
    pub fn info_class(mut self, class: InfoClass) -> Self {
        self.info_class = Some(class);
        self
    }

    /// Set measured latency.
    pub fn latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Set the call cost.
    pub fn cost(mut self, usd: f64) -> Self {
        self.cost_usd = Some(usd);
        self
    }

    /// Attach operation-specific detail.
    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Mark as a policy/cost event that must survive overflow.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Bounded async audit pipeline in front of an append-only sink.
pub struct AuditPipeline {
    tx: Mutex<Option<mpsc::Sender<AuditEvent>>>,
    sink: Arc<dyn AuditStore>,
    dropped: AtomicU64,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AuditPipeline {
    /// Spawn the drain task. `capacity` bounds the queue; overflow drops
    /// non-critical events and writes critical ones through synchronously.
    pub fn spawn(sink: Arc<dyn AuditStore>, capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(capacity.max(1));
        let drain_sink = Arc::clone(&sink);
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = drain_sink.append_event(&event) {
                    tracing::warn!(operation = %event.operation, error = %e, "audit append failed");
                }
            }
        });
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            sink,
            dropped: AtomicU64::new(0),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Emit one event. Never blocks the caller: a full queue drops telemetry
    /// (counted) but critical policy/cost events are written through to the
    /// sink inline instead of being lost.
    pub fn emit(&self, event: AuditEvent) {
        tracing::debug!(
            tenant = %event.tenant,
            operation = %event.operation,
            outcome = event.outcome.as_str(),
            "audit"
        );
        let undelivered = {
            let guard = self.tx.lock().expect("audit tx lock");
            match guard.as_ref() {
                Some(tx) => match tx.try_send(event) {
                    Ok(()) => None,
                    Err(mpsc::error::TrySendError::Full(ev))
                    | Err(mpsc::error::TrySendError::Closed(ev)) => Some(ev),
                },
                None => Some(event),
            }
        };
        if let Some(event) = undelivered {
            if event.critical {
                if let Err(e) = self.sink.append_event(&event) {
                    tracing::error!(error = %e, "critical audit event lost");
                }
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Telemetry events dropped under overflow so far.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the drain task to flush.
    pub async fn shutdown(&self) -> Result<()> {
        // Dropping the sender ends the drain loop after it flushes the queue.
        self.tx.lock().expect("audit tx lock").take();
        let handle = self.worker.lock().expect("audit worker lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

// ============================================================================
// TEST SINK
// ============================================================================

/// In-memory append-only sink for tests.
#[derive(Default)]
pub struct VecAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl VecAuditSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit sink lock").clone()
    }
}

impl AuditStore for VecAuditSink {
    fn append_event(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .expect("audit sink lock")
            .push(event.clone());
        Ok(())
    }

    fn events_for(
        &self,
        ctx: &TenantContext,
        operation: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        let events = self.events.lock().expect("audit sink lock");
        let mut out: Vec<AuditEvent> = events
            .iter()
            .rev()
            .filter(|e| &e.tenant == ctx.tenant())
            .filter(|e| operation.is_none_or(|op| e.operation == op))
            .take(limit)
            .cloned()
            .collect();
        out.shrink_to_fit();
        Ok(out)
    }

    fn count_events(&self, ctx: &TenantContext, since: Option<DateTime<Utc>>) -> Result<i64> {
        let events = self.events.lock().expect("audit sink lock");
        Ok(events
            .iter()
            .filter(|e| &e.tenant == ctx.tenant())
            .filter(|e| since.is_none_or(|s| e.timestamp >= s))
            .count() as i64)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantRegistry;

    #[tokio::test]
    async fn pipeline_delivers_events() {
        let sink = Arc::new(VecAuditSink::new());
        let pipeline = AuditPipeline::spawn(sink.clone(), 16);
        let registry = TenantRegistry::new();
        let ctx = registry.context("t1", "tester");

        pipeline.emit(AuditEvent::of(&ctx, "store_memory").latency(3));
        // Give the drain task a beat.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, "store_memory");
        assert_eq!(events[0].latency_ms, Some(3));
    }

    #[tokio::test]
    async fn critical_events_survive_overflow() {
        let sink = Arc::new(VecAuditSink::new());
        // Capacity 1 and no draining yet: flood it.
        let pipeline = AuditPipeline::spawn(sink.clone(), 1);
        let registry = TenantRegistry::new();
        let ctx = registry.context("t1", "tester");

        for _ in 0..50 {
            pipeline.emit(AuditEvent::of(&ctx, "telemetry"));
        }
        pipeline.emit(AuditEvent::of(&ctx, "policy_event").critical());

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let events = sink.events();
        assert!(events.iter().any(|e| e.operation == "policy_event"));
    }

    #[test]
    fn tenant_filter_on_readback() {
        let sink = VecAuditSink::new();
        let registry = TenantRegistry::new();
        let ctx1 = registry.context("t1", "a");
        let ctx2 = registry.context("t2", "b");
        sink.append_event(&AuditEvent::of(&ctx1, "x")).unwrap();
        sink.append_event(&AuditEvent::of(&ctx2, "y")).unwrap();

        let events = sink.events_for(&ctx1, None, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, "x");
    }
}

//! Policy and budget enforcement: restricted containment, classification
//! audit, budget boundaries, rerank degradation, and worker deferral.

use rae_core::policy::CostGuard;
use rae_core::prelude::*;
use rae_core::tenant::{Role, TenantRegistry};
use rae_core::{BudgetUpdate, GraphQuery};
use rae_e2e_tests::fixtures::{
    configure_priced_reflection, configure_tenant, rae_sqlite, settle_audit,
};

#[tokio::test]
async fn restricted_content_never_reaches_a_persistent_layer() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    let err = rae
        .store_memory(
            &ctx,
            RecordDraft {
                content: "customer SSN 123-45-6789 from the call".into(),
                layer: Some(Layer::LongTerm),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RestrictedContent));

    // Nothing persisted anywhere.
    let response = rae
        .query_memory(&ctx, QueryRequest::new("customer call"))
        .await
        .unwrap();
    assert!(response.results.is_empty());

    // The denial is audited as a policy event.
    settle_audit().await;
    let events = rae.audit_events(&ctx, Some("policy_event"), 10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].detail["event"], "restricted_detected");
}

#[tokio::test]
async fn emails_are_scrubbed_on_the_way_in() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    let stored = rae
        .store_memory(
            &ctx,
            RecordDraft::new("escalated by oncall@example.com during the deploy"),
        )
        .await
        .unwrap();
    let record = rae.fetch_memory(&ctx, &stored.id).await.unwrap().unwrap();
    assert!(!record.content.contains("oncall@example.com"));
    assert!(record.content.contains("[REDACTED:email]"));
    assert_eq!(record.info_class, InfoClass::Internal);
}

#[tokio::test]
async fn graph_depth_is_capped_at_three() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    let err = rae
        .query_graph(
            &ctx,
            GraphQuery {
                text: Some("Anything".into()),
                max_depth: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidRecord(_)));

    // Depth three is the inclusive maximum.
    assert!(
        rae.query_graph(
            &ctx,
            GraphQuery {
                text: Some("Anything".into()),
                max_depth: Some(3),
                ..Default::default()
            },
        )
        .await
        .is_ok()
    );
}

#[test]
fn budget_admits_at_exactly_equal_and_rejects_one_cent_over() {
    let registry = TenantRegistry::new();
    registry.update(&TenantId::from("t1"), |config| {
        config.budget.daily_usd = 0.02;
        config.budget.monthly_usd = 10.0;
    });

    let guard = CostGuard::new();
    let ctx = registry.context("t1", "agent");
    assert!(guard.admit(&ctx, 0.02).is_ok());

    let guard = CostGuard::new();
    let ctx = registry.context("t1", "agent");
    assert!(matches!(
        guard.admit(&ctx, 0.03),
        Err(CoreError::BudgetExceeded { .. })
    ));
}

#[tokio::test]
async fn rerank_degrades_to_fused_order_when_budget_denies_it() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    rae.registry().update(&TenantId::from("t1"), |config| {
        config.retrieval.rerank_provider = Some("priced-rerank".into());
    });
    let operator = rae
        .context("t1", "operator")
        .with_roles(vec![Role::Reader, Role::Writer, Role::Operator]);
    rae.set_budget(
        &operator,
        BudgetUpdate {
            daily_usd: Some(0.01),
            monthly_usd: None,
        },
    )
    .unwrap();

    let ctx = rae.context("t1", "agent");
    for i in 0..6 {
        rae.store_memory(
            &ctx,
            RecordDraft::new(format!(
                "deploy incident {i}: canary failed and the rollback dragged on"
            )),
        )
        .await
        .unwrap();
    }

    let response = rae
        .query_memory(
            &ctx,
            QueryRequest {
                text: "deploy rollback".into(),
                rerank: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!response.results.is_empty(), "fused results still served");
    assert!(
        response
            .degraded
            .iter()
            .any(|d| d.kind == "rerank_skipped" && d.reason == "budget"),
        "missing rerank_skipped: budget flag, got {:?}",
        response.degraded
    );
}

#[tokio::test]
async fn dreaming_defers_when_the_budget_is_exhausted() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    configure_priced_reflection(&rae, "t1");
    let operator = rae
        .context("t1", "operator")
        .with_roles(vec![Role::Reader, Role::Writer, Role::Operator]);
    rae.set_budget(
        &operator,
        BudgetUpdate {
            daily_usd: Some(0.01),
            monthly_usd: None,
        },
    )
    .unwrap();

    // Seed a reflective-eligible cluster: three longterm records sharing a
    // tag, importance 0.8, mean usage >= 5 via fetches.
    let ctx = rae.context("t1", "agent");
    let mut ids = Vec::new();
    for i in 0..3 {
        let stored = rae
            .store_memory(
                &ctx,
                RecordDraft {
                    content: format!("deploy {i} rollback was painful and slow"),
                    layer: Some(Layer::LongTerm),
                    importance: Some(0.8),
                    tags: vec!["deploy".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        ids.push(stored.id);
    }
    for id in &ids {
        for _ in 0..5 {
            rae.fetch_memory(&ctx, id).await.unwrap();
        }
    }

    let report = rae.run_dreaming(&TenantId::from("t1")).await.unwrap();
    assert_eq!(report.deferred.as_deref(), Some("budget"));
    assert_eq!(report.reflections, 0);

    settle_audit().await;
    let events = rae.audit_events(&ctx, Some("cycle_deferred"), 10).unwrap();
    assert!(!events.is_empty());
    assert_eq!(events[0].detail["reason"], "budget");

    // Decay needs no LLM and still runs.
    assert!(rae.run_decay(&TenantId::from("t1")).await.is_ok());
}

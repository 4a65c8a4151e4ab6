//! Tenant isolation: no operation by one tenant may observe or mutate
//! another tenant's records, embeddings, graph artifacts, or audit trail.

use rae_core::prelude::*;
use rae_e2e_tests::fixtures::{configure_tenant, rae_sqlite, settle_audit};

#[tokio::test]
async fn tenants_never_observe_each_other() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    configure_tenant(&rae, "t2");
    let ctx1 = rae.context("t1", "agent-a");
    let ctx2 = rae.context("t2", "agent-b");

    let stored = rae
        .store_memory(
            &ctx1,
            RecordDraft {
                content: "alpha".into(),
                layer: Some(Layer::LongTerm),
                importance: Some(0.8),
                tags: vec!["x".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Fetch by id across the boundary: indistinguishable from absent.
    assert!(rae.fetch_memory(&ctx2, &stored.id).await.unwrap().is_none());

    // Query across the boundary: empty.
    let response = rae
        .query_memory(
            &ctx2,
            QueryRequest {
                text: "alpha".into(),
                top_k: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(response.results.is_empty());

    // Mutation across the boundary: rejected as unknown.
    let err = rae
        .update_memory(
            &ctx2,
            &stored.id,
            RecordUpdate {
                importance: Some(0.1),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidRecord(_)));

    // The record is untouched for its owner.
    let mine = rae.fetch_memory(&ctx1, &stored.id).await.unwrap().unwrap();
    assert_eq!(mine.importance, 0.8);

    // Audit: one store event under t1, one zero-result query under t2, and
    // neither visible from the other side.
    settle_audit().await;
    let store_events = rae.audit_events(&ctx1, Some("store_memory"), 10).unwrap();
    assert_eq!(store_events.len(), 1);
    let query_events = rae.audit_events(&ctx2, Some("query_memory"), 10).unwrap();
    assert_eq!(query_events.len(), 1);
    assert_eq!(query_events[0].detail["resultCount"], 0);
    assert!(
        rae.audit_events(&ctx2, Some("store_memory"), 10)
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn same_tenant_retrieval_still_works() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent-a");

    let stored = rae
        .store_memory(&ctx, RecordDraft::new("alpha particle detector notes"))
        .await
        .unwrap();
    let response = rae
        .query_memory(&ctx, QueryRequest::new("alpha"))
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].record.id, stored.id);
}

#[tokio::test]
async fn graph_artifacts_stay_scoped() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    configure_tenant(&rae, "t2");
    let ctx1 = rae.context("t1", "agent-a");
    let ctx2 = rae.context("t2", "agent-b");

    rae.store_memory(
        &ctx1,
        RecordDraft::new("Payment Gateway rollback after INC-00042"),
    )
    .await
    .unwrap();

    let graph = rae
        .query_graph(
            &ctx2,
            GraphQuery {
                text: Some("Payment Gateway".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(graph.nodes.is_empty());

    let graph = rae
        .query_graph(
            &ctx1,
            GraphQuery {
                text: Some("Payment Gateway".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!graph.nodes.is_empty());
}

//! Record lifecycle laws: round-trips, cascaded deletes, promotion lineage,
//! deduplication, and decay dynamics.

use chrono::{Duration, Utc};
use rae_core::prelude::*;
use rae_core::storage::{RecordFilter, RecordStore};
use rae_e2e_tests::fixtures::{MOCK_CHEAP_MODEL, configure_tenant, rae_sqlite, settle_audit};

#[tokio::test]
async fn store_then_fetch_round_trips_all_fields() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    let stored = rae
        .store_memory(
            &ctx,
            RecordDraft {
                content: "the canary caught the bad rollout".into(),
                tags: vec!["deploy".into(), "canary".into()],
                source: Some("ci-bot".into()),
                importance: Some(0.7),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let record = rae.fetch_memory(&ctx, &stored.id).await.unwrap().unwrap();
    assert_eq!(record.content, "the canary caught the bad rollout");
    assert_eq!(record.tags, vec!["deploy", "canary"]);
    assert_eq!(record.source.as_deref(), Some("ci-bot"));
    assert_eq!(record.importance, 0.7);
    assert!(!record.id.is_empty());
    assert_eq!(record.content_hash.len(), 64);
    assert!(record.last_accessed_at >= record.created_at);
    // Fetch bumps usage.
    assert_eq!(record.usage_count, 1);
}

#[tokio::test]
async fn delete_cascades_and_leaves_an_audit_trail() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    let stored = rae
        .store_memory(
            &rae.context("t1", "agent"),
            RecordDraft::new("Primary Database failover notes worth embedding"),
        )
        .await
        .unwrap();
    rae.reconcile_embeddings(&ctx, 100).await.unwrap();
    assert!(
        rae.record_store()
            .get_embedding(&ctx, &stored.id, MOCK_CHEAP_MODEL)
            .unwrap()
            .is_some()
    );

    assert!(rae.delete_memory(&ctx, &stored.id).await.unwrap());

    // Fetch-after-delete: gone.
    assert!(rae.fetch_memory(&ctx, &stored.id).await.unwrap().is_none());
    // Embeddings gone with it.
    assert!(
        rae.record_store()
            .get_embedding(&ctx, &stored.id, MOCK_CHEAP_MODEL)
            .unwrap()
            .is_none()
    );
    // Graph artifacts whose sole provenance it was are gone.
    let graph = rae
        .query_graph(
            &ctx,
            GraphQuery {
                text: Some("Primary Database".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(graph.nodes.is_empty());

    // A deletion audit entry exists (right-to-be-forgotten).
    settle_audit().await;
    let events = rae.audit_events(&ctx, Some("delete_memory"), 10).unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn summarization_promotes_with_lineage() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    let mut working_ids = Vec::new();
    for i in 0..2 {
        let stored = rae
            .store_memory(
                &ctx,
                RecordDraft {
                    content: format!(
                        "deploy {i} rollback stalled because the schema migration had no down path"
                    ),
                    tags: vec!["deploy".into()],
                    importance: Some(0.8),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(stored.layer, Layer::Working);
        working_ids.push(stored.id);
    }
    // Reach the usage gate.
    for id in &working_ids {
        for _ in 0..2 {
            rae.fetch_memory(&ctx, id).await.unwrap();
        }
    }

    let report = rae.run_summarization(&TenantId::from("t1")).await.unwrap();
    assert!(report.promoted >= 1);
    assert!(report.deferred.is_none());

    let page = rae
        .list_memories(
            &ctx,
            RecordFilter {
                layers: Some(vec![Layer::LongTerm]),
                limit: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    let consolidated = &page.items[0];
    assert!(!consolidated.parents.is_empty());
    // Every parent is fetchable and sits strictly below the child.
    for parent_id in &consolidated.parents {
        assert!(working_ids.contains(parent_id));
        let parent = rae.fetch_memory(&ctx, parent_id).await.unwrap().unwrap();
        assert!(parent.layer < consolidated.layer);
    }
}

#[tokio::test]
async fn identical_content_dedups_within_the_window() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    let draft = RecordDraft {
        content: "the same observation twice".into(),
        source: Some("cli".into()),
        ..Default::default()
    };
    let first = rae.store_memory(&ctx, draft.clone()).await.unwrap();
    let second = rae.store_memory(&ctx, draft).await.unwrap();
    assert_eq!(first.id, second.id);
    assert!(!first.deduplicated);
    assert!(second.deduplicated);
}

#[tokio::test]
async fn decay_reduces_importance_and_is_idempotent_per_instant() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    let stored = rae
        .store_memory(
            &ctx,
            RecordDraft {
                content: "an old memory that should fade".into(),
                importance: Some(0.5),
                created_at: Some(Utc::now() - Duration::days(28)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    rae.run_decay(&TenantId::from("t1")).await.unwrap();
    let after_first = rae.fetch_memory(&ctx, &stored.id).await.unwrap().unwrap();
    assert!(after_first.importance < 0.5);
    assert!(after_first.importance > 0.0);

    // A second pass in the same logical instant changes nothing.
    rae.run_decay(&TenantId::from("t1")).await.unwrap();
    let after_second = rae.fetch_memory(&ctx, &stored.id).await.unwrap().unwrap();
    assert_eq!(after_first.importance, after_second.importance);
}

#[tokio::test]
async fn exhausted_records_are_pruned_with_cascades() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    let stored = rae
        .store_memory(
            &ctx,
            RecordDraft {
                content: "long forgotten scrap nobody ever used".into(),
                layer: Some(Layer::Working),
                importance: Some(0.05),
                created_at: Some(Utc::now() - Duration::days(60)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let report = rae.run_decay(&TenantId::from("t1")).await.unwrap();
    assert!(report.pruned >= 1);
    assert!(rae.fetch_memory(&ctx, &stored.id).await.unwrap().is_none());
}

#[tokio::test]
async fn rejected_sensory_records_expire_on_their_ttl() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    // Low importance keeps both out of the working layer.
    let expired = rae
        .store_memory(
            &ctx,
            RecordDraft {
                content: "stale raw capture past its retention".into(),
                importance: Some(0.1),
                created_at: Some(Utc::now() - Duration::hours(2)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let fresh = rae
        .store_memory(
            &ctx,
            RecordDraft {
                content: "fresh raw capture inside its retention".into(),
                importance: Some(0.1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(expired.layer, Layer::Sensory);
    assert_eq!(fresh.layer, Layer::Sensory);

    // Default sensory retention is one hour; the two-hour-old capture goes
    // even though its importance never fell, the fresh one stays.
    rae.run_decay(&TenantId::from("t1")).await.unwrap();
    assert!(rae.fetch_memory(&ctx, &expired.id).await.unwrap().is_none());
    assert!(rae.fetch_memory(&ctx, &fresh.id).await.unwrap().is_some());
}

#[tokio::test]
async fn stats_cover_scope_window_and_embedding_coverage() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    // One record well outside a one-day window, one inside it and tagged
    // with a project.
    rae.store_memory(
        &ctx,
        RecordDraft {
            content: "old migration note from last week".into(),
            created_at: Some(Utc::now() - Duration::days(7)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    rae.store_memory(
        &ctx,
        RecordDraft {
            content: "fresh canary rollout note".into(),
            tags: vec!["proj-alpha".into()],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    rae.reconcile_embeddings(&ctx, 100).await.unwrap();
    settle_audit().await;

    let all = rae
        .get_stats(&ctx, StatsScope::Tenant, None)
        .await
        .unwrap();
    assert_eq!(all.total_records, 2);
    assert_eq!(all.records_with_embeddings, 2);
    assert_eq!(all.embedding_gaps, 0);
    assert!(all.audit_events >= 2);
    assert_eq!(all.by_layer.values().sum::<i64>(), 2);

    let project = rae
        .get_stats(&ctx, StatsScope::Project("proj-alpha".into()), None)
        .await
        .unwrap();
    assert_eq!(project.total_records, 1);
    assert_eq!(project.by_layer.get("working"), Some(&1));

    let windowed = rae
        .get_stats(&ctx, StatsScope::Tenant, Some(86_400))
        .await
        .unwrap();
    assert_eq!(windowed.total_records, 1);
}

#[tokio::test]
async fn stale_timestamps_are_rejected() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    rae.store_memory(&ctx, RecordDraft::new("establishes the highwater"))
        .await
        .unwrap();
    let err = rae
        .store_memory(
            &ctx,
            RecordDraft {
                content: "arrives from the distant past".into(),
                created_at: Some(Utc::now() - Duration::days(365)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidRecord(_)));
}

#[tokio::test]
async fn info_class_can_only_move_down() {
    let (rae, _dir) = rae_sqlite();
    configure_tenant(&rae, "t1");
    let ctx = rae.context("t1", "agent");

    let stored = rae
        .store_memory(
            &ctx,
            RecordDraft {
                content: "ordinary internal note".into(),
                info_class: Some(InfoClass::Confidential),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Downgrade: allowed.
    rae.update_memory(
        &ctx,
        &stored.id,
        RecordUpdate {
            info_class: Some(InfoClass::Internal),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // Upgrade back: rejected.
    let err = rae
        .update_memory(
            &ctx,
            &stored.id,
            RecordUpdate {
                info_class: Some(InfoClass::Restricted),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InfoClassViolation(_)));
}

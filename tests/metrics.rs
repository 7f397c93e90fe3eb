//! Metric keys emitted along the consistency paths.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{Harness, queue_drained};
use metrics_util::debugging::DebuggingRecorder;
use scriptorium::application::articles::NewArticle;
use scriptorium::domain::keys::ActorIdentity;
use scriptorium::infra::telemetry;
use scriptorium::infra::worker::sweep_expired;

#[tokio::test]
async fn consistency_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let harness = Harness::new(true);
    let created = harness
        .service
        .create_article(NewArticle {
            slug: "measured".to_string(),
            title: "Measured".to_string(),
            summary: String::new(),
            content: "Body".to_string(),
            is_published: true,
        })
        .await
        .expect("create article");

    assert!(queue_drained(harness.queue.as_ref(), Duration::from_secs(5)).await);

    // miss then hit
    harness.service.get_article(created.id).await.unwrap();
    harness.service.get_article(created.id).await.unwrap();

    let actor = ActorIdentity::from_request(Some("metrics"), "127.0.0.1", "test");
    harness.service.like(created.id, actor.clone()).await.unwrap();
    harness.service.like(created.id, actor).await.unwrap();

    // rolled back: unknown article
    let _ = harness
        .service
        .delete_article(uuid::Uuid::new_v4())
        .await
        .unwrap_err();

    harness
        .cache
        .set("ephemeral", &1_u8, Duration::from_millis(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(sweep_expired(&harness.cache).await, 1);

    harness.shutdown().await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    for expected in [
        "scriptorium_cache_hit_total",
        "scriptorium_cache_miss_total",
        "scriptorium_cache_purged_total",
        "scriptorium_idempotency_duplicate_total",
        "scriptorium_queue_enqueued_total",
        "scriptorium_queue_processed_total",
        "scriptorium_queue_attempt_seconds",
        "scriptorium_tx_rolled_back_total",
        "scriptorium_effect_dispatched_total",
    ] {
        assert!(names.contains(expected), "missing metric `{expected}`: {names:?}");
    }
}

//! End-to-end scenarios over the in-memory gallery pipeline.

use serde_json::json;
use shutterbus::event::{ATTR_MESSAGE_TYPE, ATTR_METADATA_TYPE};
use shutterbus::mail::{Mailer, MemoryMailer};
use shutterbus::pool::ProcessOutcome;
use shutterbus::queue::NackOutcome;
use shutterbus::router::RouterError;
use shutterbus::stream::BatchOutcome;
use shutterbus::topology::Stores;
use shutterbus::{Event, Pipeline, ShutterbusConfig};
use std::sync::Arc;

fn gallery() -> (Pipeline, Arc<MemoryMailer>) {
    gallery_with(ShutterbusConfig::default())
}

fn gallery_with(mut config: ShutterbusConfig) -> (Pipeline, Arc<MemoryMailer>) {
    config.mail.default_recipient = Some("owner@example.com".into());
    let mailer = Arc::new(MemoryMailer::new());
    let stores = Stores::in_memory(&config.storage);
    let pipeline = Pipeline::build(config, stores, mailer.clone() as Arc<dyn Mailer>).unwrap();
    (pipeline, mailer)
}

async fn ingest(pipeline: &Pipeline, key: &str) {
    pipeline.upload(key, vec![0xFF, 0xD8, 0xFF]).await.unwrap();
    assert!(matches!(pipeline.process_queue_once().await, ProcessOutcome::Acked { .. }));
}

#[tokio::test]
async fn test_upload_reaches_ingestion_queue_only() {
    let (pipeline, _) = gallery();

    let (_, report) = pipeline.upload("holiday/beach.png", vec![1, 2, 3]).await.unwrap();
    assert_eq!(report.matched, vec!["valid-images"]);
    assert!(report.is_success());

    assert!(matches!(pipeline.process_queue_once().await, ProcessOutcome::Acked { .. }));
    let record = pipeline.stores().records.get("holiday/beach.png").await.unwrap().unwrap();
    assert_eq!(record["status"], "pending");
    assert_eq!(pipeline.queue().stats().acked, 1);
}

#[tokio::test]
async fn test_third_failure_dead_letters_then_cleanup_removes_object() {
    let (pipeline, _) = gallery();
    pipeline.upload("bad.gif", vec![0x47, 0x49, 0x46]).await.unwrap();

    for expected in 1..=2 {
        match pipeline.process_queue_once().await {
            ProcessOutcome::Nacked {
                outcome: NackOutcome::Requeued { delivery_count },
                ..
            } => assert_eq!(delivery_count, expected),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert!(matches!(
        pipeline.process_queue_once().await,
        ProcessOutcome::Nacked {
            outcome: NackOutcome::DeadLettered,
            ..
        }
    ));
    assert!(pipeline.queue().is_empty());
    assert!(pipeline.stores().records.get("bad.gif").await.unwrap().is_none());

    let dead = pipeline.dead_letters().list(10, 0);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.delivery_count, 3);
    assert_eq!(dead[0].source_queue, "images");

    assert!(matches!(
        pipeline.process_dead_letter_once().await,
        ProcessOutcome::Acked { .. }
    ));
    assert!(pipeline.stores().objects.get("bad.gif").await.unwrap().is_none());
    assert!(pipeline.dead_letters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_upload_refused_by_full_queue_is_rolled_back() {
    let mut config = ShutterbusConfig::default();
    config.queue.capacity = Some(1);
    let (pipeline, _) = gallery_with(config);

    let (_, first) = pipeline.upload("a.png", vec![1]).await.unwrap();
    assert!(first.is_success());

    let (info, second) = pipeline.upload("b.png", vec![2]).await.unwrap();
    assert_eq!(info.key, "b.png");
    assert_eq!(second.failure_count(), 1);
    match &second.failures[0] {
        RouterError::EnqueueFailed { attempts, .. } => {
            assert_eq!(*attempts, pipeline.config().delivery.max_attempts)
        }
        other => panic!("unexpected failure {:?}", other),
    }

    assert_eq!(pipeline.queue().len(), 1);
    assert!(pipeline.stores().objects.get("b.png").await.unwrap().is_none());
    assert!(pipeline.stores().objects.get("a.png").await.unwrap().is_some());
}

#[tokio::test]
async fn test_metadata_event_updates_record() {
    let (pipeline, _) = gallery();
    ingest(&pipeline, "cats/tom.jpeg").await;

    let event = Event::application()
        .with_attribute(ATTR_METADATA_TYPE, "Caption")
        .with_payload_ref("cats/tom.jpeg")
        .with_body(json!({ "value": "Tom on the sofa" }));
    let report = pipeline.publish(&event).await;

    assert_eq!(report.matched, vec!["add-metadata"]);
    assert_eq!(report.delivered, 1);
    let record = pipeline.stores().records.get("cats/tom.jpeg").await.unwrap().unwrap();
    assert_eq!(record["caption"], "Tom on the sofa");
}

#[tokio::test]
async fn test_unlisted_metadata_type_matches_nothing() {
    let (pipeline, _) = gallery();
    ingest(&pipeline, "cats/tom.jpeg").await;

    let event = Event::application()
        .with_attribute(ATTR_METADATA_TYPE, "Location")
        .with_payload_ref("cats/tom.jpeg")
        .with_body(json!({ "value": "Paris" }));
    let report = pipeline.publish(&event).await;

    assert!(report.matched.is_empty());
    assert_eq!(pipeline.stats().topic.unmatched, 1);
    let record = pipeline.stores().records.get("cats/tom.jpeg").await.unwrap().unwrap();
    assert!(record.get("location").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_commits_once_and_mails_once() {
    let (pipeline, mailer) = gallery();
    ingest(&pipeline, "cats/tom.jpeg").await;

    // the insert itself needs no email
    assert!(matches!(
        pipeline.poll_stream_once().await.unwrap(),
        Some(BatchOutcome::Committed { .. })
    ));
    assert!(mailer.sent().is_empty());

    let confirm = Event::application()
        .with_attribute(ATTR_MESSAGE_TYPE, "StatusUpdate")
        .with_payload_ref("cats/tom.jpeg")
        .with_body(json!({ "status": "confirmed" }));
    let report = pipeline.publish(&confirm).await;
    assert_eq!(report.matched, vec!["update-status"]);

    assert!(matches!(
        pipeline.poll_stream_once().await.unwrap(),
        Some(BatchOutcome::Committed { .. })
    ));
    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "owner@example.com");
    assert_eq!(pipeline.stats().stream_checkpoint, Some(2));

    // the acknowledged position is not handed out again
    assert!(pipeline.poll_stream_once().await.unwrap().is_none());
    assert_eq!(mailer.sent().len(), 1);

    // confirming again changes nothing, so nothing more is sent
    pipeline.publish(&confirm).await;
    assert_eq!(mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_status_update_skips_metadata_subscription() {
    let (pipeline, _) = gallery();
    ingest(&pipeline, "cats/tom.jpeg").await;

    let reject = Event::application()
        .with_attribute(ATTR_MESSAGE_TYPE, "StatusUpdate")
        .with_payload_ref("cats/tom.jpeg")
        .with_body(json!({ "status": "rejected" }));
    let report = pipeline.publish(&reject).await;

    assert_eq!(report.matched, vec!["update-status"]);
    assert_eq!(report.delivered, 1);
    let record = pipeline.stores().records.get("cats/tom.jpeg").await.unwrap().unwrap();
    assert_eq!(record["status"], "rejected");
}

#[tokio::test(start_paused = true)]
async fn test_status_update_for_missing_record_reports_failure() {
    let (pipeline, _) = gallery();

    let confirm = Event::application()
        .with_attribute(ATTR_MESSAGE_TYPE, "StatusUpdate")
        .with_payload_ref("ghost.png")
        .with_body(json!({ "status": "confirmed" }));
    let report = pipeline.publish(&confirm).await;

    assert_eq!(report.matched, vec!["update-status"]);
    assert_eq!(report.failure_count(), 1);
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_duplicate_upload_keeps_single_record() {
    let (pipeline, _) = gallery();
    ingest(&pipeline, "dup.png").await;
    ingest(&pipeline, "dup.png").await;

    let record = pipeline.stores().records.get("dup.png").await.unwrap().unwrap();
    assert_eq!(record["status"], "pending");
    assert_eq!(pipeline.queue().stats().acked, 2);
}

#[test]
fn test_shipped_config_matches_defaults() {
    let config = ShutterbusConfig::parse(include_str!("../config/shutterbus.toml")).unwrap();
    let defaults = ShutterbusConfig::default();

    assert_eq!(config.subscriptions, defaults.subscriptions);
    assert_eq!(config.queue.max_receive_count, 3);
    assert_eq!(config.server.api_key, None);
}

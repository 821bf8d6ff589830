//! End-to-end tests through the [`Relay`] facade.
//!
//! Every test runs on a paused tokio clock, so completion polls, retries and
//! inter-target delays advance instantly once the runtime is idle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{RecordingAutomation, drain, sample_bytes, test_config};
use fanout_relay::{
    Config, ContentPayload, DispatchOptions, Error, Event, FileMetadata, FileRef, Relay,
    TargetId, TargetRef, TargetStatus,
};

fn metadata(name: &str) -> FileMetadata {
    FileMetadata {
        name: name.to_string(),
        mime_type: Some("image/png".to_string()),
        last_modified: None,
    }
}

fn payload(title: &str, files: Vec<FileRef>) -> ContentPayload {
    ContentPayload {
        title: title.to_string(),
        body: "body".to_string(),
        files,
    }
}

fn targets(ids: &[&str]) -> Vec<TargetRef> {
    ids.iter().map(|id| TargetRef::new(*id)).collect()
}

#[tokio::test(start_paused = true)]
async fn concurrent_destinations_share_one_attachment_session() {
    let relay = Relay::new(test_config()).await.unwrap();
    let mut events = relay.subscribe();

    let automations: Vec<_> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|id| (*id, Arc::new(RecordingAutomation::default())))
        .collect();
    for (id, automation) in &automations {
        relay.register_destination(*id, automation.clone()).await;
    }

    let bytes = sample_bytes(3000);
    let image = relay.ingest(bytes.clone(), metadata("cover.png")).await.unwrap();
    assert_eq!(image.total_chunks, 12);

    let summary = relay
        .dispatch(
            targets(&["alpha", "beta", "gamma"]),
            payload("launch", vec![FileRef::from(&image)]),
            DispatchOptions::concurrent(),
        )
        .await
        .unwrap();

    assert_eq!(summary.success_count, 3);
    assert_eq!(summary.failure_count, 0);
    let order: Vec<_> = summary.per_target.iter().map(|r| r.target_id.0.as_str()).collect();
    assert_eq!(order, ["alpha", "beta", "gamma"]);

    for (id, automation) in &automations {
        let published = automation.published();
        assert_eq!(published.len(), 1, "{id} published once");
        assert_eq!(published[0].title, "launch");
        assert_eq!(published[0].files, vec![bytes.clone()]);
    }

    let events = drain(&mut events);
    let sessions = events
        .iter()
        .filter(|e| matches!(e, Event::SessionCreated { .. }))
        .count();
    assert_eq!(sessions, 1);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::SessionCompleted { .. }))
    );

    let stats = relay.broker_stats().await.unwrap();
    assert_eq!(stats.sessions, 0);
    assert!(stats.active_targets.is_empty());

    let progress = relay.progress_snapshot();
    for id in ["alpha", "beta", "gamma"] {
        assert_eq!(progress[&TargetId::new(id)].overall_percent, 100.0);
    }
}

#[tokio::test(start_paused = true)]
async fn small_attachment_is_published_without_a_session() {
    let relay = Relay::new(test_config()).await.unwrap();
    let mut events = relay.subscribe();
    let a = Arc::new(RecordingAutomation::default());
    let b = Arc::new(RecordingAutomation::default());
    relay.register_destination("a", a.clone()).await;
    relay.register_destination("b", b.clone()).await;

    let bytes = sample_bytes(200);
    let icon = relay.ingest(bytes.clone(), metadata("icon.png")).await.unwrap();

    let summary = relay
        .dispatch(
            targets(&["a", "b"]),
            payload("tiny", vec![FileRef::from(&icon)]),
            DispatchOptions::concurrent(),
        )
        .await
        .unwrap();

    assert_eq!(summary.success_count, 2);
    assert_eq!(a.published()[0].files, vec![bytes.clone()]);
    assert_eq!(b.published()[0].files, vec![bytes]);
    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::SessionCreated { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn sequential_stop_on_error_skips_remaining_destinations() {
    let relay = Relay::new(test_config()).await.unwrap();
    let first = Arc::new(RecordingAutomation::default());
    let broken = Arc::new(RecordingAutomation::failing());
    let last = Arc::new(RecordingAutomation::default());
    relay.register_destination("first", first.clone()).await;
    relay.register_destination("broken", broken.clone()).await;
    relay.register_destination("last", last.clone()).await;

    let summary = relay
        .dispatch(
            targets(&["first", "broken", "last"]),
            payload("text only", Vec::new()),
            DispatchOptions::sequential(true),
        )
        .await
        .unwrap();

    let statuses: Vec<_> = summary.per_target.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        [
            TargetStatus::Succeeded,
            TargetStatus::Failed,
            TargetStatus::NotAttempted
        ]
    );
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.failure_count, 1);
    assert_eq!(summary.not_attempted_count, 1);
    assert!(
        summary.per_target[1]
            .error
            .as_deref()
            .unwrap()
            .contains("composer rejected the post")
    );
    assert!(last.published().is_empty());
    assert_eq!(
        summary.per_target[0].result_payload,
        Some(serde_json::json!({ "url": "https://first/p/1" }))
    );
}

#[tokio::test(start_paused = true)]
async fn sequential_destination_fetches_the_attachment_alone() {
    let relay = Relay::new(test_config()).await.unwrap();
    let mut events = relay.subscribe();
    let a = Arc::new(RecordingAutomation::default());
    let b = Arc::new(RecordingAutomation::default());
    relay.register_destination("a", a.clone()).await;
    relay.register_destination("b", b.clone()).await;

    let bytes = sample_bytes(2048);
    let doc = relay.ingest(bytes.clone(), metadata("doc.pdf")).await.unwrap();

    let summary = relay
        .dispatch(
            targets(&["a", "b"]),
            payload("one by one", vec![FileRef::from(&doc)]),
            DispatchOptions::sequential(false),
        )
        .await
        .unwrap();

    assert_eq!(summary.success_count, 2);
    assert_eq!(a.published()[0].files, vec![bytes.clone()]);
    assert_eq!(b.published()[0].files, vec![bytes]);
    // Only one target is ever active, so no session can form
    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::SessionCreated { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn slow_destination_times_out_alone() {
    let relay = Relay::new(test_config()).await.unwrap();
    let fast = Arc::new(RecordingAutomation::default());
    let slow = Arc::new(RecordingAutomation::delayed(Duration::from_secs(60)));
    relay.register_destination("fast", fast.clone()).await;
    relay.register_destination("slow", slow.clone()).await;

    let options = DispatchOptions {
        target_timeout: Some(Duration::from_secs(5)),
        ..DispatchOptions::concurrent()
    };
    let summary = relay
        .dispatch(targets(&["slow", "fast"]), payload("race", Vec::new()), options)
        .await
        .unwrap();

    assert_eq!(summary.per_target[0].status, TargetStatus::TimedOut);
    assert_eq!(summary.per_target[1].status, TargetStatus::Succeeded);
    assert!(summary.duration_ms < 60_000);
}

#[tokio::test(start_paused = true)]
async fn unknown_destination_is_rejected_before_anything_runs() {
    let relay = Relay::new(test_config()).await.unwrap();
    let known = Arc::new(RecordingAutomation::default());
    relay.register_destination("known", known.clone()).await;

    let err = relay
        .dispatch(
            targets(&["known", "nowhere"]),
            payload("x", Vec::new()),
            DispatchOptions::concurrent(),
        )
        .await
        .unwrap_err();

    assert_eq!(err, Error::UnknownDestination(TargetId::new("nowhere")));
    assert!(known.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unregistered_destination_is_no_longer_dispatchable() {
    let relay = Relay::new(test_config()).await.unwrap();
    relay
        .register_destination("gone", Arc::new(RecordingAutomation::default()))
        .await;

    assert!(relay.unregister_destination(&TargetId::new("gone")).await);
    assert!(!relay.unregister_destination(&TargetId::new("gone")).await);

    let err = relay
        .dispatch(targets(&["gone"]), payload("x", Vec::new()), DispatchOptions::concurrent())
        .await
        .unwrap_err();
    assert_eq!(err, Error::UnknownDestination(TargetId::new("gone")));
}

#[tokio::test(start_paused = true)]
async fn released_attachment_is_dropped_after_the_job() {
    let relay = Relay::new(test_config()).await.unwrap();
    relay
        .register_destination("a", Arc::new(RecordingAutomation::default()))
        .await;

    let file = relay.ingest(sample_bytes(4096), metadata("big.bin")).await.unwrap();
    assert_eq!(relay.broker_stats().await.unwrap().files, 1);

    relay
        .dispatch(
            targets(&["a"]),
            payload("x", vec![FileRef::from(&file)]),
            DispatchOptions::concurrent(),
        )
        .await
        .unwrap();

    relay.release(file.file_id).await.unwrap();
    assert_eq!(relay.broker_stats().await.unwrap().files, 0);
}

#[tokio::test(start_paused = true)]
async fn missing_attachment_fails_the_target_not_the_job() {
    let relay = Relay::new(test_config()).await.unwrap();
    let a = Arc::new(RecordingAutomation::default());
    relay.register_destination("a", a.clone()).await;

    let file = relay.ingest(sample_bytes(4096), metadata("big.bin")).await.unwrap();
    relay.release(file.file_id).await.unwrap();

    let summary = relay
        .dispatch(
            targets(&["a"]),
            payload("x", vec![FileRef::from(&file)]),
            DispatchOptions::concurrent(),
        )
        .await
        .unwrap();

    assert_eq!(summary.per_target[0].status, TargetStatus::Failed);
    assert!(a.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_new_jobs_and_announces_itself() {
    let relay = Relay::new(test_config()).await.unwrap();
    let mut events = relay.subscribe();
    relay
        .register_destination("a", Arc::new(RecordingAutomation::default()))
        .await;

    relay.shutdown().await.unwrap();

    let err = relay
        .dispatch(targets(&["a"]), payload("late", Vec::new()), DispatchOptions::concurrent())
        .await
        .unwrap_err();
    assert_eq!(err, Error::ShuttingDown);
    assert!(relay.ingest(sample_bytes(10), metadata("late.png")).await.is_err());

    let events = drain(&mut events);
    assert!(matches!(events.last(), Some(Event::Shutdown)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_a_running_job() {
    let relay = Relay::new(test_config()).await.unwrap();
    let slow = Arc::new(RecordingAutomation::delayed(Duration::from_secs(3)));
    relay.register_destination("slow", slow.clone()).await;

    let job = {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .dispatch(targets(&["slow"]), payload("x", Vec::new()), DispatchOptions::concurrent())
                .await
        })
    };
    // Let the job start before shutting down
    tokio::time::sleep(Duration::from_millis(500)).await;

    relay.shutdown().await.unwrap();
    let summary = job.await.unwrap().unwrap();
    assert_eq!(summary.success_count, 1);
}

#[test]
fn config_from_json_fills_defaults() {
    let config = Config::from_json(
        r#"{
            "broker": { "chunk_size": 65536, "session_ttl": 30 },
            "worker": { "completion_poll_interval": 250, "reuse_assigned_chunks": true },
            "scheduler": { "max_concurrent_targets": 4 }
        }"#,
    )
    .unwrap();

    assert_eq!(config.broker.chunk_size, 65536);
    assert_eq!(config.broker.session_ttl, Duration::from_secs(30));
    assert_eq!(config.broker.direct_threshold_bytes, 5 * 1024 * 1024);
    assert_eq!(config.worker.completion_poll_interval, Duration::from_millis(250));
    assert!(config.worker.reuse_assigned_chunks);
    assert!(config.worker.attach_to_in_flight);
    assert_eq!(config.scheduler.max_concurrent_targets, 4);
    assert_eq!(config.progress.acquisition_weight, 40);
}

#[test]
fn config_from_json_rejects_bad_weights() {
    let err = Config::from_json(
        r#"{ "progress": { "acquisition_weight": 50, "assembly_weight": 30, "injection_weight": 30 } }"#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Config { key: Some(ref key), .. } if key == "progress"));
}

#[tokio::test]
async fn relay_refuses_invalid_config() {
    let mut config = test_config();
    config.broker.chunk_size = 0;
    let err = Relay::new(config).await.err().unwrap();
    assert!(matches!(err, Error::Config { .. }));
}

#[tokio::test(start_paused = true)]
async fn overlapping_jobs_do_not_draft_each_others_destinations() {
    let config = test_config();
    let completion_wait_ms = config.worker.completion_wait.as_millis() as u64;
    let relay = Relay::new(config).await.unwrap();
    let mut events = relay.subscribe();

    let alpha = Arc::new(RecordingAutomation::default());
    let beta = Arc::new(RecordingAutomation::delayed(Duration::from_secs(20)));
    relay.register_destination("alpha", alpha.clone()).await;
    relay.register_destination("beta", beta.clone()).await;

    // Text-only job keeps "beta" busy for the whole of the second job
    let text_only = {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .dispatch(
                    targets(&["beta"]),
                    payload("status update", Vec::new()),
                    DispatchOptions::concurrent(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bytes = sample_bytes(3000);
    let image = relay.ingest(bytes.clone(), metadata("cover.png")).await.unwrap();
    let summary = relay
        .dispatch(
            targets(&["alpha"]),
            payload("gallery", vec![FileRef::from(&image)]),
            DispatchOptions::concurrent(),
        )
        .await
        .unwrap();

    assert_eq!(summary.success_count, 1);
    assert_eq!(alpha.published()[0].files, vec![bytes]);
    assert!(
        summary.per_target[0].duration_ms < completion_wait_ms,
        "alpha waited on a session it shares with nobody: {} ms",
        summary.per_target[0].duration_ms
    );
    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::SessionCreated { .. }))
    );

    let other = text_only.await.unwrap().unwrap();
    assert_eq!(other.success_count, 1);
    assert!(beta.published()[0].files.is_empty());
}

#[tokio::test(start_paused = true)]
async fn late_starter_is_not_paired_with_an_already_served_destination() {
    let mut config = test_config();
    config.scheduler.max_concurrent_targets = 2;
    let completion_wait_ms = config.worker.completion_wait.as_millis() as u64;
    let relay = Relay::new(config).await.unwrap();
    let mut events = relay.subscribe();

    let a = Arc::new(RecordingAutomation::default());
    // "b" holds its slot long after it has the attachment
    let b = Arc::new(RecordingAutomation::delayed(Duration::from_secs(20)));
    let c = Arc::new(RecordingAutomation::default());
    relay.register_destination("a", a.clone()).await;
    relay.register_destination("b", b.clone()).await;
    relay.register_destination("c", c.clone()).await;

    let bytes = sample_bytes(3000);
    let image = relay.ingest(bytes.clone(), metadata("cover.png")).await.unwrap();
    let summary = relay
        .dispatch(
            targets(&["a", "b", "c"]),
            payload("launch", vec![FileRef::from(&image)]),
            DispatchOptions::concurrent(),
        )
        .await
        .unwrap();

    assert_eq!(summary.success_count, 3);
    for automation in [&a, &b, &c] {
        assert_eq!(automation.published()[0].files, vec![bytes.clone()]);
    }

    let created: Vec<Vec<TargetId>> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            Event::SessionCreated { participants, .. } => Some(participants),
            _ => None,
        })
        .collect();
    assert_eq!(created, [vec![TargetId::new("a"), TargetId::new("b")]]);

    let late = summary
        .per_target
        .iter()
        .find(|r| r.target_id == TargetId::new("c"))
        .unwrap();
    assert!(
        late.duration_ms < completion_wait_ms,
        "c stalled on a completion wait: {} ms",
        late.duration_ms
    );
}

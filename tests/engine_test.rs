//! Integration tests for the stream engine

use cpr_stream_agent::{
    ClassLabels, Classifier, ClassifierError, EngineOptions, InferenceDispatcher, ScalerParams,
    Sample, SessionEvent, StreamEngine, Subscription, Tensor, WindowMode, WINDOW_SIZE,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scores class 0 by the window mean so results are deterministic.
#[derive(Default)]
struct MeanClassifier {
    calls: AtomicUsize,
}

impl Classifier for MeanClassifier {
    fn run(&self, input: &Tensor) -> Result<Vec<Tensor>, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let batch = input.shape()[0];
        let mut scores = Vec::with_capacity(batch * 4);
        for window in input.data().chunks(WINDOW_SIZE) {
            let mean = window.iter().sum::<f32>() / WINDOW_SIZE as f32;
            scores.extend([mean, 1.0, 0.0, -1.0]);
        }
        Ok(vec![Tensor::new(vec![batch, 4], scores)?])
    }
}

fn engine() -> (StreamEngine, Arc<MeanClassifier>) {
    let classifier = Arc::new(MeanClassifier::default());
    let dispatcher = InferenceDispatcher::new(
        classifier.clone(),
        ScalerParams::identity(),
        ClassLabels::default(),
    );
    let options = EngineOptions {
        delivery_timeout: Duration::from_millis(50),
        observer_buffer: 512,
        ..EngineOptions::default()
    };
    (StreamEngine::new(dispatcher, options), classifier)
}

fn drain(subscription: &mut Subscription) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = subscription.receiver.try_recv() {
        events.push(event);
    }
    events
}

fn kinds(events: &[SessionEvent]) -> Vec<&'static str> {
    events.iter().map(SessionEvent::kind).collect()
}

#[tokio::test]
async fn test_nonoverlap_round_trip() {
    let (engine, classifier) = engine();
    let depths = [5.0, 6.0, 5.0, 7.0, 6.0, 5.0, 6.0, 7.0, 5.0, 6.0];

    for (i, depth) in depths.iter().enumerate() {
        let outcome = engine
            .ingest("s1", Sample::new(*depth), Some("nonoverlap"))
            .await
            .unwrap();
        assert_eq!(outcome.mode, WindowMode::NonOverlap);
        assert_eq!(outcome.stride, WINDOW_SIZE);

        if i < depths.len() - 1 {
            assert!(!outcome.inferred);
            assert_eq!(outcome.buffer_len, i + 1);
        } else {
            assert!(outcome.inferred);
            assert_eq!(outcome.buffer_len, 0);
            let result = outcome.result.unwrap();
            assert_eq!(result.class_index, 0);
            assert_eq!(result.class_label, "stabil");
        }
    }
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);

    let eleventh = engine.ingest("s1", Sample::new(5.0), None).await.unwrap();
    assert!(!eleventh.inferred);
    assert_eq!(eleventh.buffer_len, 1);
    assert!(eleventh.result.is_none());

    // The last result survives until the next window
    assert!(engine.get_last("s1").await.result.is_some());
}

#[tokio::test]
async fn test_sliding_infers_every_sample_after_warm_up() {
    let (engine, classifier) = engine();

    for i in 0..25 {
        let outcome = engine
            .ingest("s1", Sample::new(5.5).with_mode("sliding"), None)
            .await
            .unwrap();
        assert_eq!(outcome.stride, 1);

        if i < WINDOW_SIZE - 1 {
            assert!(!outcome.inferred);
            assert_eq!(outcome.buffer_len, i + 1);
        } else {
            assert!(outcome.inferred);
            assert_eq!(outcome.buffer_len, WINDOW_SIZE - 1);
        }
    }
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 25 - (WINDOW_SIZE - 1));
}

#[tokio::test]
async fn test_mode_precedence_and_persistence() {
    let (engine, _) = engine();
    assert_eq!(engine.get_mode("s1").await, WindowMode::NonOverlap);

    // Override beats the sample's own mode and is stored
    let outcome = engine
        .ingest("s1", Sample::new(5.0).with_mode("block"), Some("sliding"))
        .await
        .unwrap();
    assert_eq!(outcome.mode, WindowMode::Sliding);
    assert_eq!(engine.get_mode("s1").await, WindowMode::Sliding);

    // Stored mode beats the default
    let outcome = engine.ingest("s1", Sample::new(5.0), None).await.unwrap();
    assert_eq!(outcome.mode, WindowMode::Sliding);

    // Repeating the same override is idempotent
    for _ in 0..3 {
        engine
            .ingest("s1", Sample::new(5.0), Some("non-overlapping"))
            .await
            .unwrap();
        assert_eq!(engine.get_mode("s1").await, WindowMode::NonOverlap);
    }
}

#[tokio::test]
async fn test_blank_mode_keeps_stored_mode() {
    let (engine, _) = engine();
    engine.set_mode("s1", "nonoverlap").await.unwrap();

    let outcome = engine.ingest("s1", Sample::new(5.0), Some("")).await.unwrap();
    assert_eq!(outcome.mode, WindowMode::NonOverlap);

    let outcome = engine
        .ingest("s1", Sample::new(5.0).with_mode(" "), None)
        .await
        .unwrap();
    assert_eq!(outcome.mode, WindowMode::NonOverlap);
    assert_eq!(engine.get_mode("s1").await, WindowMode::NonOverlap);

    // A fresh session with a blank payload mode takes the default
    let outcome = engine
        .ingest("s2", Sample::new(5.0).with_mode(""), None)
        .await
        .unwrap();
    assert_eq!(outcome.mode, WindowMode::NonOverlap);
}

#[tokio::test]
async fn test_history_auto_reset() {
    let (engine, _) = engine();
    let mut events = engine.subscribe("s1").await;

    for _ in 0..119 {
        engine.ingest("s1", Sample::new(5.0), None).await.unwrap();
    }
    assert_eq!(engine.get_history("s1", 200).await.total_count, 119);
    let before = drain(&mut events);
    assert!(!before.iter().any(|e| e.kind() == "session_complete"));

    // 120th sample completes the session
    let outcome = engine.ingest("s1", Sample::new(5.0), None).await.unwrap();
    assert_eq!(outcome.buffer_len, 0);
    assert!(!outcome.inferred);
    assert_eq!(engine.get_history("s1", 200).await.total_count, 0);

    let at_limit = drain(&mut events);
    assert_eq!(kinds(&at_limit), vec!["session_complete"]);
    match &at_limit[0] {
        SessionEvent::SessionComplete {
            total_compressions, ..
        } => assert_eq!(*total_compressions, 120),
        other => panic!("unexpected event {other:?}"),
    }

    // 121st sample starts counting from one
    engine.ingest("s1", Sample::new(5.0), None).await.unwrap();
    let after = drain(&mut events);
    match &after[..] {
        [SessionEvent::DepthData {
            total_compressions,
            buffer_len,
            ..
        }] => {
            assert_eq!(*total_compressions, 1);
            assert_eq!(*buffer_len, 1);
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(engine.stats().sessions_completed, 1);
}

#[tokio::test]
async fn test_event_order_within_ingest() {
    let (engine, _) = engine();
    let mut events = engine.subscribe("s1").await;

    for _ in 0..WINDOW_SIZE {
        engine.ingest("s1", Sample::new(5.0), None).await.unwrap();
    }

    let received = drain(&mut events);
    assert_eq!(received.len(), WINDOW_SIZE + 1);
    assert!(received[..WINDOW_SIZE].iter().all(|e| e.kind() == "depth_data"));
    assert_eq!(received[WINDOW_SIZE].kind(), "inference");

    // The window-completing depth_data reports the full buffer
    match &received[WINDOW_SIZE - 1] {
        SessionEvent::DepthData { buffer_len, .. } => assert_eq!(*buffer_len, WINDOW_SIZE),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_reset_scenario() {
    let (engine, _) = engine();
    let mut events = engine.subscribe("s1").await;

    for _ in 0..5 {
        engine.ingest("s1", Sample::new(5.0), None).await.unwrap();
    }
    drain(&mut events);

    assert_eq!(engine.reset("s1").await, 5);
    assert!(engine.get_history("s1", 50).await.depth_data.is_empty());
    assert_eq!(engine.get_last("s1").await.buffer_len, 0);

    let received = drain(&mut events);
    match &received[..] {
        [SessionEvent::SessionReset {
            total_compressions_before_reset,
            ..
        }] => assert_eq!(*total_compressions_before_reset, 5),
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_session_reads() {
    let (engine, _) = engine();

    let last = engine.get_last("never-seen").await;
    assert_eq!(last.buffer_len, 0);
    assert!(last.result.is_none());

    let history = engine.get_history("never-seen", 50).await;
    assert!(history.depth_data.is_empty());

    assert_eq!(engine.reset("never-seen").await, 0);
    assert_eq!(engine.session_count().await, 0);
}

#[tokio::test]
async fn test_history_query_returns_recent_tail() {
    let (engine, _) = engine();
    for i in 0..30 {
        engine
            .ingest("s1", Sample::new(4.0 + i as f64 * 0.1), None)
            .await
            .unwrap();
    }

    let history = engine.get_history("s1", 5).await;
    assert_eq!(history.total_count, 5);
    let indices: Vec<usize> = history.depth_data.iter().map(|p| p.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert!((history.depth_data[4].depth - 6.9).abs() < 1e-4);
}

#[tokio::test]
async fn test_concurrent_ingests_on_one_session_are_serialized() {
    let (engine, classifier) = engine();
    let engine = Arc::new(engine);

    let tasks: Vec<_> = (0..WINDOW_SIZE * 3)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.ingest("s1", Sample::new(5.0), None).await })
        })
        .collect();

    let mut inferred = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().inferred {
            inferred += 1;
        }
    }

    assert_eq!(inferred, 3);
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.get_last("s1").await.buffer_len, 0);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let (engine, _) = engine();
    let mut a_events = engine.subscribe("a").await;

    for _ in 0..4 {
        engine.ingest("a", Sample::new(5.0), None).await.unwrap();
    }
    engine.set_mode("b", "sliding").await.unwrap();
    engine.ingest("b", Sample::new(5.0), None).await.unwrap();

    assert_eq!(engine.get_last("a").await.buffer_len, 4);
    assert_eq!(engine.get_last("b").await.buffer_len, 1);
    assert_eq!(engine.get_mode("a").await, WindowMode::NonOverlap);
    assert_eq!(drain(&mut a_events).len(), 4);
}

#[tokio::test]
async fn test_set_mode_reports_change() {
    let (engine, _) = engine();
    let mut events = engine.subscribe("s1").await;

    let change = engine.set_mode("s1", "Sliding").await.unwrap();
    assert_eq!(change.old_mode, WindowMode::NonOverlap);
    assert_eq!(change.new_mode, WindowMode::Sliding);

    let received = drain(&mut events);
    assert_eq!(kinds(&received), vec!["mode_change"]);
}

#[tokio::test]
async fn test_predict_updates_last_and_notifies() {
    let (engine, _) = engine();
    let mut events = engine.subscribe("s1").await;

    let result = engine.predict("s1", vec![6.0; WINDOW_SIZE]).await.unwrap();
    let sum: f64 = result.probs.iter().sum();
    assert!((sum - 1.0).abs() < 1e-5);
    assert_eq!(engine.get_last("s1").await.result, Some(result));
    assert_eq!(kinds(&drain(&mut events)), vec!["inference"]);

    let err = engine.predict("s1", vec![6.0; 9]).await.unwrap_err();
    assert!(err.is_client_error());
}

#[tokio::test]
async fn test_stale_observer_does_not_affect_ingest() {
    let (engine, _) = engine();
    let stale = engine.subscribe("s1").await;
    let mut live = engine.subscribe("s1").await;
    drop(stale);

    let outcome = engine.ingest("s1", Sample::new(5.0), None).await.unwrap();
    assert_eq!(outcome.buffer_len, 1);
    assert_eq!(kinds(&drain(&mut live)), vec!["depth_data"]);
    assert_eq!(engine.stats().deliveries_dropped, 1);
}

//! Replay a recorded compression sequence through the stream engine.
//!
//! This example shows how to:
//! 1. Build an engine around an in-memory linear model
//! 2. Attach an observer to a session
//! 3. Ingest samples in both windowing modes
//! 4. Print every event the observer receives
//!
//! Run with: cargo run --example replay_session

use cpr_stream_agent::{
    ClassLabels, EngineOptions, InferenceDispatcher, LinearModel, Sample, ScalerParams,
    StreamEngine, WINDOW_SIZE,
};
use std::sync::Arc;

const RECORDING: [f64; 24] = [
    5.1, 5.4, 5.0, 5.6, 5.3, 5.2, 5.5, 5.4, 5.1, 5.3, 4.2, 4.0, 4.4, 3.9, 4.1, 4.3, 4.0, 4.2,
    6.6, 6.8, 6.5, 6.9, 6.7, 6.6,
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("CPR Stream Agent - Replay Demo");
    println!("==============================");
    println!();

    // Class 0 likes depths near the mean, 2 likes deep, 3 likes shallow.
    let model = LinearModel {
        weights: vec![
            vec![0.0; WINDOW_SIZE],
            vec![0.05; WINDOW_SIZE],
            vec![0.4; WINDOW_SIZE],
            vec![-0.4; WINDOW_SIZE],
        ],
        bias: vec![1.0, 0.0, 0.0, 0.0],
    };
    let scaler = ScalerParams {
        mean: vec![5.25; WINDOW_SIZE],
        scale: vec![0.6; WINDOW_SIZE],
    };

    let dispatcher = InferenceDispatcher::new(Arc::new(model), scaler, ClassLabels::default());
    let engine = StreamEngine::new(dispatcher, EngineOptions::default());

    let mut subscription = engine.subscribe("demo").await;
    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.receiver.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("  event: {json}"),
                Err(e) => eprintln!("  unprintable event: {e}"),
            }
        }
    });

    println!("Non-overlapping windows:");
    for depth in RECORDING {
        let outcome = engine.ingest("demo", Sample::new(depth), None).await?;
        if let Some(result) = outcome.result {
            println!("-> {} {:?}", result.class_label, result.probs);
        }
    }

    engine.reset("demo").await;

    println!();
    println!("Sliding windows:");
    for depth in RECORDING {
        let outcome = engine
            .ingest("demo", Sample::new(depth), Some("sliding"))
            .await?;
        if let Some(result) = outcome.result {
            println!("-> {}", result.class_label);
        }
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&engine.stats())?);

    drop(engine);
    printer.await?;
    Ok(())
}

//! Scripted demo that exercises every robot action without audio input

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::robot::ActionExecutor;

/// One scripted step
#[derive(Debug, Clone)]
pub struct DemoStep {
    pub action: &'static str,
    pub arguments: Value,
}

/// Outcome of one step
#[derive(Debug, Clone)]
pub struct DemoOutcome {
    pub action: &'static str,
    pub result: std::result::Result<Value, String>,
}

/// The fixed demo sequence
#[must_use]
pub fn script() -> Vec<DemoStep> {
    let step = |action, arguments| DemoStep { action, arguments };
    vec![
        step("get-status", json!({})),
        step("move-head", json!({ "pitch": 15, "duration": 1.0 })),
        step("move-head", json!({ "pitch": -15, "duration": 1.0 })),
        step("move-head", json!({ "pitch": 0, "duration": 0.5 })),
        step("move-antennas", json!({ "left": 0.7, "right": -0.7 })),
        step("move-antennas", json!({ "left": 0.0, "right": 0.0 })),
        step("play-emotion", json!({ "emotion": "happy" })),
        step("dance", json!({ "dance": "simple_nod" })),
        step(
            "speak",
            json!({ "text": "Hello! I am Reachy, and this is my demo." }),
        ),
        step("capture-image", json!({})),
    ]
}

/// Run the demo script until it ends or `cancel` fires
///
/// Failed steps are logged and the script continues.
pub async fn run(executor: &ActionExecutor, cancel: &CancellationToken) -> Vec<DemoOutcome> {
    tracing::info!("running demo sequence");
    let mut outcomes = Vec::new();

    for step in script() {
        if cancel.is_cancelled() {
            tracing::info!("demo cancelled");
            break;
        }

        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = executor.run(step.action, &step.arguments) => result,
        };
        match &result {
            Ok(value) => tracing::info!(action = step.action, result = %value, "demo step done"),
            Err(e) => tracing::warn!(action = step.action, error = %e, "demo step failed"),
        }
        outcomes.push(DemoOutcome {
            action: step.action,
            result: result.map_err(|e| e.to_string()),
        });
    }

    tracing::info!(steps = outcomes.len(), "demo complete");
    outcomes
}

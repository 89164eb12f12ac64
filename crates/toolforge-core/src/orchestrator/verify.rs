//! Result verification: how well an execution result answers the task.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{IoSpec, IoType};

/// Plans below this confidence get a feedback note.
const LOW_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    /// In [0, 1]; compared against the acceptance threshold.
    pub score: f64,
    pub feedback: Vec<String>,
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Score `result` against the task's output hint and the confidence of the
/// plan that produced the tool.
///
/// The shape score is scaled by `0.5 + confidence / 2`; reused tools carry no
/// plan and pass `None`.
pub fn verify(result: &Value, io: &IoSpec, confidence: Option<f64>) -> Verification {
    let mut score: f64 = 1.0;
    let mut feedback = Vec::new();
    let expects_null = io.output_type == Some(IoType::Null);

    if result.is_null() && !expects_null {
        score = 0.3;
        feedback.push("tool returned no value".to_string());
    } else if is_empty(result) {
        score = 0.7;
        feedback.push("tool returned an empty value".to_string());
    }

    if let Some(status) = result.get("status").and_then(Value::as_str) {
        if matches!(status, "error" | "failed" | "failure") {
            score = score.min(0.2);
            feedback.push(format!("tool reported status {status:?}"));
        }
    }

    if let Some(expected) = &io.output_type {
        if !result.is_null() && !expected.matches_value(result) {
            score = score.min(0.4);
            feedback.push(format!("expected a result of type {expected}"));
        }
    }

    if let Some(confidence) = confidence {
        let confidence = confidence.clamp(0.0, 1.0);
        score *= 0.5 + confidence / 2.0;
        if confidence < LOW_CONFIDENCE {
            feedback.push(format!("plan confidence {confidence:.2} is low"));
        }
    }

    Verification { score, feedback }
}

//! Confidence gate for description payloads.
//!
//! The only contractual field of a description is a numeric
//! `data_quality.overall_confidence` on a 0-100 scale. Anything that cannot
//! be read as that number keeps the fragment: a payload whose schema drifted
//! is never silently discarded.

use serde_json::Value;

/// Result of evaluating one description.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    /// Confidence is above the threshold.
    Pass(f64),
    /// Confidence is at or below the threshold.
    Drop(f64),
    /// No numeric confidence could be read.
    Unparsed,
}

impl GateDecision {
    /// Whether the fragment survives.
    pub const fn keeps(self) -> bool {
        !matches!(self, Self::Drop(_))
    }
}

/// Strip a surrounding Markdown code fence such as ```` ```json ... ``` ````.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`, `JSON`, ...) on the opening line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Parse a description payload as JSON, tolerating a code fence.
pub fn parse_payload(text: &str) -> Option<Value> {
    serde_json::from_str(strip_code_fence(text)).ok()
}

/// Read `data_quality.overall_confidence` as a number.
pub fn overall_confidence(payload: &Value) -> Option<f64> {
    payload.get("data_quality")?.get("overall_confidence")?.as_f64()
}

/// Evaluate `description` against `threshold`.
pub fn evaluate(description: &str, threshold: f64) -> GateDecision {
    match parse_payload(description).as_ref().and_then(overall_confidence) {
        Some(confidence) if confidence > threshold => GateDecision::Pass(confidence),
        Some(confidence) => GateDecision::Drop(confidence),
        None => GateDecision::Unparsed,
    }
}

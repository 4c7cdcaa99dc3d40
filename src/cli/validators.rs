//! CLI argument validators.
//!
//! Shared validation functions for CLI argument parsing.

use crate::constants::confidence;

/// Parse and validate a bounded float value.
///
/// # Arguments
///
/// * `s` - The string to parse
/// * `min` - Minimum allowed value (inclusive)
/// * `max` - Maximum allowed value (inclusive)
/// * `name` - Name of the parameter for error messages
pub fn parse_bounded_float(s: &str, min: f64, max: f64, name: &str) -> Result<f64, String> {
    let value: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if !(min..=max).contains(&value) {
        return Err(format!(
            "{name} must be between {min} and {max}, got {value}"
        ));
    }

    Ok(value)
}

/// Parse and validate a description confidence threshold (0-100).
pub fn parse_confidence_threshold(s: &str) -> Result<f64, String> {
    parse_bounded_float(s, confidence::MIN, confidence::MAX, "confidence threshold")
}

/// Parse and validate an IoU threshold (0.0-1.0).
#[allow(clippy::cast_possible_truncation)]
pub fn parse_iou_threshold(s: &str) -> Result<f32, String> {
    parse_bounded_float(s, 0.0, 1.0, "IoU threshold").map(|v| v as f32)
}

//! Queue message schemas.
//!
//! Every message is JSON and carries its own `image_id`, so consumers never
//! depend on delivery order. Messages also carry the processing `run` they
//! belong to; the status consumers ignore messages from an earlier run.

use crate::dedup::{BBox, DetectionCandidate};
use serde::{Deserialize, Serialize};

/// Image identifier shared by every message and record.
pub type ImageId = u64;

/// Processing run of an image, bumped on every reprocess.
pub type RunId = u32;

/// Request to process one uploaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Image being processed.
    pub image_id: ImageId,
    /// URL or local path of the image bytes.
    pub image_ref: String,
    /// MIME type of the image.
    pub content_type: String,
    /// Processing run.
    #[serde(default)]
    pub run: RunId,
}

/// One deduplicated detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    /// Box in pixel coordinates.
    pub bbox: BBox,
    /// Class label.
    pub label: String,
    /// Detector score.
    pub confidence: f32,
}

impl From<DetectionCandidate> for DetectedObject {
    fn from(c: DetectionCandidate) -> Self {
        Self {
            bbox: c.bbox,
            label: c.label,
            confidence: c.score,
        }
    }
}

/// Output of the detection stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Image the detections belong to.
    pub image_id: ImageId,
    /// URL or local path of the image bytes.
    pub image_ref: String,
    /// Image width in pixels.
    pub image_width: u32,
    /// Image height in pixels.
    pub image_height: u32,
    /// Processing run.
    #[serde(default)]
    pub run: RunId,
    /// Surviving detections, best first. May be empty.
    #[serde(default)]
    pub objects: Vec<DetectedObject>,
}

/// Enriched description of one surviving object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentOutcome {
    /// Box in pixel coordinates, clamped to the image.
    pub bbox: BBox,
    /// Class label.
    pub label: String,
    /// Detector score.
    pub confidence: f32,
    /// Storage reference of the cropped fragment.
    pub fragment_ref: String,
    /// Raw description payload returned by the describer.
    pub description: String,
}

/// Aggregated output of the enrichment stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalDescription {
    /// Image the outcomes belong to.
    pub image_id: ImageId,
    /// Processing run.
    #[serde(default)]
    pub run: RunId,
    /// Outcomes that passed the confidence gate.
    #[serde(default)]
    pub objects: Vec<FragmentOutcome>,
}

/// A stage gave up on a message for this image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotice {
    /// Image whose processing failed.
    pub image_id: ImageId,
    /// Processing run.
    #[serde(default)]
    pub run: RunId,
    /// Stage that gave up.
    pub stage: String,
    /// Human-readable cause.
    pub reason: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_result_wire_format() {
        let json = r#"{
            "image_id": 42,
            "image_ref": "https://bucket/images/a.jpg",
            "image_width": 640,
            "image_height": 480,
            "objects": [{"bbox": [1, 2, 30, 40], "label": "tree", "confidence": 0.8}]
        }"#;
        let result: DetectionResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.image_id, 42);
        assert_eq!(result.objects.len(), 1);
        assert_eq!(result.objects[0].bbox, BBox::new(1.0, 2.0, 30.0, 40.0));
    }

    #[test]
    fn test_missing_objects_defaults_to_empty() {
        let json = r#"{"image_id": 1, "image_ref": "x", "image_width": 1, "image_height": 1}"#;
        let result: DetectionResult = serde_json::from_str(json).unwrap();
        assert!(result.objects.is_empty());
        assert_eq!(result.run, 0);
    }

    #[test]
    fn test_task_requires_image_ref() {
        let json = r#"{"image_id": 1, "content_type": "image/jpeg"}"#;
        assert!(serde_json::from_str::<Task>(json).is_err());
    }
}

//! Duplicate suppression for raw detections.

mod geometry;
mod suppress;

pub use geometry::BBox;
pub use suppress::{DedupParams, dedup};

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// A raw detection produced by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
    /// Box in pixel coordinates.
    pub bbox: BBox,
    /// Class label, e.g. `tree` or `bush`.
    pub label: String,
    /// Detector score in `[0, 1]`.
    pub score: f32,
}

/// Deduplicate candidates, returning survivors in descending score order.
pub fn dedup_candidates(
    candidates: &[DetectionCandidate],
    params: &DedupParams,
) -> Result<Vec<DetectionCandidate>> {
    let boxes: Vec<BBox> = candidates.iter().map(|c| c.bbox).collect();
    let scores: Vec<f32> = candidates.iter().map(|c| c.score).collect();
    let labels: Vec<&str> = candidates.iter().map(|c| c.label.as_str()).collect();

    let kept = dedup(&boxes, &scores, &labels, params)?;
    Ok(kept.into_iter().map(|i| candidates[i].clone()).collect())
}

//! Two-stage greedy non-maximum suppression.
//!
//! Stage one suppresses within each label by IoU and, optionally, by
//! containment ratio. Stage two suppresses across labels by IoU alone.
//!
//! Both stages are O(n^2) in the number of candidates. Per-image candidate
//! counts are in the tens, so no spatial index is used; this is the scaling
//! limit of the engine.

use super::geometry::BBox;
use crate::error::{Error, Result};
use std::cmp::Ordering;

/// Suppression thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupParams {
    /// Same-label boxes with IoU above this are suppressed.
    pub iou_threshold: f32,
    /// Same-label boxes with containment ratio at or above this are
    /// suppressed. Negative disables the rule.
    pub beta: f32,
    /// Boxes of any label with IoU above this are suppressed. Values outside
    /// `[0, 1)` disable cross-label suppression.
    pub alpha_all_classes: f32,
}

impl DedupParams {
    /// Plain per-label NMS: no containment rule, no cross-label stage.
    pub const fn per_class(iou_threshold: f32) -> Self {
        Self {
            iou_threshold,
            beta: -1.0,
            alpha_all_classes: -1.0,
        }
    }

    fn containment_enabled(&self) -> bool {
        self.beta >= 0.0
    }

    fn cross_class_enabled(&self) -> bool {
        (0.0..1.0).contains(&self.alpha_all_classes)
    }
}

/// Deduplicate candidate detections.
///
/// Returns indices into the input slices in descending score order. Ties are
/// broken by input position.
pub fn dedup<L: AsRef<str>>(
    boxes: &[BBox],
    scores: &[f32],
    labels: &[L],
    params: &DedupParams,
) -> Result<Vec<usize>> {
    if boxes.len() != scores.len() || boxes.len() != labels.len() {
        return Err(Error::DedupInput {
            boxes: boxes.len(),
            scores: scores.len(),
            labels: labels.len(),
        });
    }

    let survivors = suppress_per_label(boxes, scores, labels, params);
    Ok(suppress_cross_label(boxes, scores, survivors, params))
}

/// Stage one: greedy suppression inside each label.
fn suppress_per_label<L: AsRef<str>>(
    boxes: &[BBox],
    scores: &[f32],
    labels: &[L],
    params: &DedupParams,
) -> Vec<usize> {
    // Labels in first-appearance order.
    let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
    for (idx, label) in labels.iter().enumerate() {
        let label = label.as_ref();
        match groups.iter_mut().find(|(l, _)| *l == label) {
            Some((_, members)) => members.push(idx),
            None => groups.push((label, vec![idx])),
        }
    }

    let mut kept = Vec::with_capacity(boxes.len());
    for (_, mut members) in groups {
        sort_by_score(&mut members, scores);
        kept.extend(greedy(boxes, members, |i, j| {
            let (a, b) = (&boxes[i], &boxes[j]);
            a.iou(b) > params.iou_threshold
                || (params.containment_enabled() && a.containment(b) >= params.beta)
        }));
    }
    kept
}

/// Stage two: greedy IoU suppression regardless of label.
fn suppress_cross_label(
    boxes: &[BBox],
    scores: &[f32],
    mut survivors: Vec<usize>,
    params: &DedupParams,
) -> Vec<usize> {
    sort_by_score(&mut survivors, scores);
    if !params.cross_class_enabled() {
        return survivors;
    }

    greedy(boxes, survivors, |i, j| {
        boxes[i].iou(&boxes[j]) > params.alpha_all_classes
    })
}

/// Keep the head of `order`, drop everything it suppresses, repeat.
///
/// `order` must already be sorted best-first; the result keeps that order.
fn greedy<F>(boxes: &[BBox], order: Vec<usize>, suppresses: F) -> Vec<usize>
where
    F: Fn(usize, usize) -> bool,
{
    let mut removed = vec![false; boxes.len()];
    let mut kept = Vec::new();

    for (pos, &i) in order.iter().enumerate() {
        if removed[i] {
            continue;
        }
        kept.push(i);
        for &j in &order[pos + 1..] {
            if !removed[j] && suppresses(i, j) {
                removed[j] = true;
            }
        }
    }

    kept
}

/// Stable sort by descending score, ties by ascending index.
fn sort_by_score(indices: &mut [usize], scores: &[f32]) {
    indices.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.cmp(&b))
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn b(x1: f32, y1: f32, x2: f32, y2: f32) -> BBox {
        BBox::new(x1, y1, x2, y2)
    }

    #[test]
    fn test_empty_input() {
        let labels: [&str; 0] = [];
        let kept = dedup(&[], &[], &labels, &DedupParams::per_class(0.5)).unwrap();
        assert!(kept.is_empty());
    }

    #[test]
    fn test_single_box_kept() {
        let kept = dedup(
            &[b(0.0, 0.0, 1.0, 1.0)],
            &[0.1],
            &["tree"],
            &DedupParams::per_class(0.0),
        )
        .unwrap();
        assert_eq!(kept, vec![0]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = dedup(
            &[b(0.0, 0.0, 1.0, 1.0)],
            &[0.1, 0.2],
            &["tree"],
            &DedupParams::per_class(0.5),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DedupInput { boxes: 1, scores: 2, labels: 1 }));
    }

    #[test]
    fn test_output_sorted_by_score() {
        let boxes = [
            b(0.0, 0.0, 10.0, 10.0),
            b(100.0, 100.0, 110.0, 110.0),
            b(200.0, 200.0, 210.0, 210.0),
        ];
        let kept = dedup(
            &boxes,
            &[0.2, 0.9, 0.5],
            &["tree", "bush", "tree"],
            &DedupParams::per_class(0.5),
        )
        .unwrap();
        assert_eq!(kept, vec![1, 2, 0]);
    }

    #[test]
    fn test_equal_scores_keep_input_order() {
        let boxes = [b(0.0, 0.0, 10.0, 10.0), b(0.0, 0.0, 10.0, 10.0)];
        let kept = dedup(&boxes, &[0.5, 0.5], &["tree", "tree"], &DedupParams::per_class(0.5))
            .unwrap();
        assert_eq!(kept, vec![0]);
    }

    #[test]
    fn test_iou_threshold_of_one_disables_iou_rule() {
        // IoU never exceeds 1.0, so identical boxes both survive.
        let boxes = [b(0.0, 0.0, 10.0, 10.0), b(0.0, 0.0, 10.0, 10.0)];
        let kept = dedup(&boxes, &[0.9, 0.8], &["tree", "tree"], &DedupParams::per_class(1.0))
            .unwrap();
        assert_eq!(kept, vec![0, 1]);
    }

    #[test]
    fn test_suppressed_box_does_not_suppress_others() {
        // 1 overlaps 0 and is removed; 2 overlaps only 1, so it survives.
        let boxes = [
            b(0.0, 0.0, 10.0, 10.0),
            b(5.0, 0.0, 15.0, 10.0),
            b(11.0, 0.0, 21.0, 10.0),
        ];
        let kept = dedup(
            &boxes,
            &[0.9, 0.8, 0.7],
            &["tree", "tree", "tree"],
            &DedupParams::per_class(0.3),
        )
        .unwrap();
        assert_eq!(kept, vec![0, 2]);
    }
}

//! Axis-aligned box geometry.

use crate::constants::dedup::EPSILON;
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in pixel coordinates.
///
/// Serialized as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    /// Left edge.
    pub x1: f32,
    /// Top edge.
    pub y1: f32,
    /// Right edge.
    pub x2: f32,
    /// Bottom edge.
    pub y2: f32,
}

impl BBox {
    /// Create a box from its corners.
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Width, zero for inverted boxes.
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    /// Height, zero for inverted boxes.
    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// Area, zero for degenerate boxes.
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Area of the overlap with `other`.
    pub fn intersection(&self, other: &Self) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Intersection over union.
    pub fn iou(&self, other: &Self) -> f32 {
        let inter = self.intersection(other);
        inter / (self.area() + other.area() - inter + EPSILON)
    }

    /// Intersection divided by the smaller of the two areas.
    ///
    /// Close to 1.0 when one box sits almost entirely inside the other,
    /// regardless of how different their sizes are.
    pub fn containment(&self, other: &Self) -> f32 {
        let inter = self.intersection(other);
        inter / (self.area().min(other.area()) + EPSILON)
    }

    /// Clamp to `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    /// Box covering a whole `width` x `height` image.
    #[allow(clippy::cast_precision_loss)]
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }
}

impl From<[f32; 4]> for BBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_area_and_degenerate() {
        assert_eq!(BBox::new(0.0, 0.0, 10.0, 5.0).area(), 50.0);
        assert_eq!(BBox::new(10.0, 0.0, 0.0, 5.0).area(), 0.0);
    }

    #[test]
    fn test_iou_identical_boxes() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint_boxes() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_zero_area_does_not_divide_by_zero() {
        let a = BBox::new(5.0, 5.0, 5.0, 5.0);
        assert_eq!(a.iou(&a), 0.0);
        assert_eq!(a.containment(&a), 0.0);
    }

    #[test]
    fn test_containment_of_nested_box() {
        let outer = BBox::new(0.0, 0.0, 100.0, 100.0);
        let inner = BBox::new(10.0, 10.0, 90.0, 90.0);
        assert!((outer.containment(&inner) - 1.0).abs() < 1e-6);
        assert!((outer.iou(&inner) - 0.64).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_to_image() {
        let b = BBox::new(-5.0, 10.0, 700.0, 500.0).clamp_to(640, 480);
        assert_eq!(b, BBox::new(0.0, 10.0, 640.0, 480.0));
    }

    #[test]
    fn test_serializes_as_array() {
        let b = BBox::new(1.0, 2.0, 3.0, 4.0);
        assert_eq!(serde_json::to_string(&b).unwrap(), "[1.0,2.0,3.0,4.0]");
        let parsed: BBox = serde_json::from_str("[1,2,3,4]").unwrap();
        assert_eq!(parsed, b);
    }
}

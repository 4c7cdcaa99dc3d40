//! Fakes shared by the pipeline integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use canopy::services::{Describer, Detections, Detector, ImageInput, ImageSource};
use canopy::{Error, Result};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// PNG bytes of a solid image.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let pixels = RgbImage::from_pixel(width, height, image::Rgb([40, 120, 40]));
    let image = DynamicImage::ImageRgb8(pixels);
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// Describer payload carrying an overall confidence.
pub fn description(confidence: f64) -> String {
    format!(
        r#"{{"species": "oak", "data_quality": {{"overall_confidence": {confidence}}}}}"#
    )
}

/// Serves fixed bytes for every reference except `missing`.
pub struct StaticSource {
    pub bytes: Vec<u8>,
}

#[async_trait]
impl ImageSource for StaticSource {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        if reference == "missing" {
            return Err(Error::Fetch {
                reference: reference.to_string(),
                transient: false,
                source: "no such object".into(),
            });
        }
        Ok(self.bytes.clone())
    }
}

/// Answers by crop width: a configured confidence, a hang, or an error.
#[derive(Default)]
pub struct ScriptedDescriber {
    pub confidence_by_width: HashMap<u32, f64>,
    pub hang_widths: Vec<u32>,
    pub default_confidence: f64,
    pub calls: AtomicUsize,
}

impl ScriptedDescriber {
    pub fn confident() -> Self {
        Self {
            default_confidence: 90.0,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Describer for ScriptedDescriber {
    async fn describe(&self, image: ImageInput<'_>, _prompt_id: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ImageInput::Bytes { data, .. } = image else {
            return Err(Error::Description {
                reason: "expected inline bytes".to_string(),
            });
        };
        let width = image::load_from_memory(data)?.width();

        if self.hang_widths.contains(&width) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        let confidence = self
            .confidence_by_width
            .get(&width)
            .copied()
            .unwrap_or(self.default_confidence);
        Ok(description(confidence))
    }
}

/// Returns the same detections for every image.
pub struct FixedDetector {
    pub detections: Detections,
    pub warmups: AtomicUsize,
    pub fail_detect: bool,
    pub seen: Mutex<usize>,
}

impl FixedDetector {
    pub fn new(boxes: Vec<[f32; 4]>, labels: &[&str], scores: Vec<f32>) -> Self {
        Self {
            detections: Detections {
                boxes,
                labels: labels.iter().map(ToString::to_string).collect(),
                scores,
                masks: None,
            },
            warmups: AtomicUsize::new(0),
            fail_detect: false,
            seen: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Detector for FixedDetector {
    async fn warmup(&self) -> Result<()> {
        self.warmups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn detect(&self, _image: &[u8]) -> Result<Detections> {
        *self.seen.lock().unwrap() += 1;
        if self.fail_detect {
            return Err(Error::Detection {
                reason: "model rejected input".to_string(),
            });
        }
        Ok(self.detections.clone())
    }
}

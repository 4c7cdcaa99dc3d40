//! Object detection collaborator.

use crate::config::DetectorConfig;
use crate::dedup::{BBox, DetectionCandidate};
use crate::error::{Error, Result};
use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::{debug, info};

/// Raw detector output, parallel arrays as returned by the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detections {
    /// Boxes as `[x1, y1, x2, y2]` pixels.
    pub boxes: Vec<[f32; 4]>,
    /// Class label per box.
    pub labels: Vec<String>,
    /// Score per box.
    pub scores: Vec<f32>,
    /// Optional segmentation masks. Not used by the pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masks: Option<serde_json::Value>,
}

impl Detections {
    /// Zip the parallel arrays into candidates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Detection`] when the arrays have different lengths.
    pub fn into_candidates(self) -> Result<Vec<DetectionCandidate>> {
        if self.boxes.len() != self.labels.len() || self.boxes.len() != self.scores.len() {
            return Err(Error::Detection {
                reason: format!(
                    "detector returned {} boxes, {} labels, {} scores",
                    self.boxes.len(),
                    self.labels.len(),
                    self.scores.len()
                ),
            });
        }

        Ok(self
            .boxes
            .into_iter()
            .zip(self.labels)
            .zip(self.scores)
            .map(|((bbox, label), score)| DetectionCandidate {
                bbox: BBox::from(bbox),
                label,
                score,
            })
            .collect())
    }
}

/// Detects objects of interest in an encoded image.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Load the model and run a throwaway inference.
    async fn warmup(&self) -> Result<()>;

    /// Detect objects in encoded image bytes.
    async fn detect(&self, image: &[u8]) -> Result<Detections>;
}

/// Detector backed by an HTTP inference service.
///
/// The service receives the encoded image as the request body and answers
/// with a JSON [`Detections`] object.
#[derive(Debug, Clone)]
pub struct HttpDetector {
    client: Client,
    endpoint: String,
    params: Vec<(String, String)>,
}

impl HttpDetector {
    /// Create a detector for `endpoint`.
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            params: Vec::new(),
        }
    }

    /// Create a detector from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] when no endpoint is configured.
    pub fn from_config(config: &DetectorConfig, client: Client) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| Error::ConfigValidation {
                message: "detector.endpoint is not set".to_string(),
            })?;

        let mut params: Vec<_> = config
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.sort();

        Ok(Self {
            client,
            endpoint,
            params,
        })
    }
}

impl HttpDetector {
    /// Endpoint with the configured query parameters appended.
    fn request_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint).map_err(|e| Error::Detection {
            reason: format!("invalid detector endpoint '{}': {e}", self.endpoint),
        })?;
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.params);
        }
        Ok(url)
    }
}

/// Small blank JPEG used to exercise the model during warmup.
fn warmup_image() -> Result<Vec<u8>> {
    let blank = RgbImage::new(64, 64);
    let mut buf = Cursor::new(Vec::new());
    blank.write_to(&mut buf, ImageFormat::Jpeg)?;
    Ok(buf.into_inner())
}

#[async_trait]
impl Detector for HttpDetector {
    async fn warmup(&self) -> Result<()> {
        let image = warmup_image()?;
        let detections = self.detect(&image).await?;
        info!(
            endpoint = %self.endpoint,
            boxes = detections.boxes.len(),
            "detector warmed up"
        );
        Ok(())
    }

    async fn detect(&self, image: &[u8]) -> Result<Detections> {
        let response = self
            .client
            .post(self.request_url()?)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|source| Error::Http {
                url: self.endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }

        let detections: Detections = response.json().await.map_err(|e| Error::Detection {
            reason: format!("invalid detector response: {e}"),
        })?;
        debug!(boxes = detections.boxes.len(), "detector responded");
        Ok(detections)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_into_candidates_zips_arrays() {
        let detections = Detections {
            boxes: vec![[0.0, 0.0, 10.0, 10.0], [5.0, 5.0, 20.0, 20.0]],
            labels: vec!["tree".to_string(), "bush".to_string()],
            scores: vec![0.9, 0.4],
            masks: None,
        };
        let candidates = detections.into_candidates().unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].label, "bush");
        assert_eq!(candidates[1].bbox, BBox::new(5.0, 5.0, 20.0, 20.0));
    }

    #[test]
    fn test_into_candidates_rejects_mismatch() {
        let detections = Detections {
            boxes: vec![[0.0, 0.0, 10.0, 10.0]],
            labels: Vec::new(),
            scores: vec![0.9],
            masks: None,
        };
        assert!(matches!(
            detections.into_candidates(),
            Err(Error::Detection { .. })
        ));
    }

    #[test]
    fn test_response_without_masks_parses() {
        let json = r#"{"boxes": [[1, 2, 3, 4]], "labels": ["tree"], "scores": [0.5]}"#;
        let detections: Detections = serde_json::from_str(json).unwrap();
        assert!(detections.masks.is_none());
        assert_eq!(detections.boxes[0], [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let config = DetectorConfig::default();
        assert!(HttpDetector::from_config(&config, Client::new()).is_err());

        let config = DetectorConfig {
            endpoint: Some("http://localhost:9000/detect".to_string()),
            params: HashMap::from([("box_threshold".to_string(), "0.3".to_string())]),
        };
        let detector = HttpDetector::from_config(&config, Client::new()).unwrap();
        assert_eq!(detector.params.len(), 1);
    }

    #[test]
    fn test_request_url_appends_params() {
        let config = DetectorConfig {
            endpoint: Some("http://localhost:9000/detect?model=trees".to_string()),
            params: HashMap::from([
                ("box_threshold".to_string(), "0.3".to_string()),
                ("text_prompt".to_string(), "tree. bush.".to_string()),
            ]),
        };
        let detector = HttpDetector::from_config(&config, Client::new()).unwrap();
        let url = detector.request_url().unwrap();

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("model".to_string(), "trees".to_string()),
                ("box_threshold".to_string(), "0.3".to_string()),
                ("text_prompt".to_string(), "tree. bush.".to_string()),
            ]
        );
    }

    #[test]
    fn test_request_url_rejects_garbage_endpoint() {
        let detector = HttpDetector::new(Client::new(), "not a url");
        assert!(matches!(
            detector.request_url(),
            Err(Error::Detection { .. })
        ));
    }

    #[test]
    fn test_warmup_image_is_jpeg() {
        let bytes = warmup_image().unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}

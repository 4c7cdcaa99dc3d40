//! Enrichment stage: detection result → per-object descriptions → final
//! description.
//!
//! The source image is fetched and decoded once per message and shared
//! read-only by every fragment task. Fragment tasks run concurrently up to
//! `max_concurrency`; a failing fragment is dropped without affecting its
//! siblings. Only an unusable source image (or a failing whole-image pass)
//! fails the message.

use super::crop::{self, Crop};
use super::gate::{self, GateDecision};
use super::notify_failure;
use crate::broker::{Broker, Handler, publish_json};
use crate::config::Config;
use crate::constants::enrichment::{CROP_CONTENT_TYPE, WHOLE_IMAGE_LABEL};
use crate::dedup::BBox;
use crate::error::{Error, Result};
use crate::messages::{DetectedObject, DetectionResult, FinalDescription, FragmentOutcome, ImageId};
use crate::retry::{Backoff, CallPolicy, with_retry};
use crate::services::{Describer, ImageInput, ImageSource, ObjectStore};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use image::DynamicImage;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tunables for the enrichment stage.
#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    /// Maximum concurrent fragment tasks per message.
    pub max_concurrency: usize,
    /// Fragments at or below this confidence are dropped.
    pub confidence_threshold: f64,
    /// Prompt identifier for every describe call.
    pub prompt_id: String,
    /// Storage folder prefix for crops.
    pub fragment_folder: String,
    /// JPEG quality for crops.
    pub jpeg_quality: u8,
    /// Source image download policy.
    pub download: CallPolicy,
    /// Describe call policy.
    pub describe: CallPolicy,
    /// Crop upload policy.
    pub storage: CallPolicy,
}

impl EnrichmentSettings {
    /// Derive settings from configuration.
    pub fn from_config(config: &Config) -> Self {
        let backoff = Backoff::from(&config.retry);
        let policy = |timeout| CallPolicy {
            attempts: config.retry.call_attempts,
            timeout,
            backoff,
        };

        Self {
            max_concurrency: config.enrichment.max_concurrency.max(1),
            confidence_threshold: config.enrichment.confidence_threshold,
            prompt_id: config.enrichment.prompt_id.clone(),
            fragment_folder: config.enrichment.fragment_folder.clone(),
            jpeg_quality: config.enrichment.jpeg_quality,
            download: policy(config.timeouts.download()),
            describe: policy(config.timeouts.describe()),
            storage: policy(config.timeouts.storage()),
        }
    }
}

/// Consumes [`DetectionResult`] messages and publishes [`FinalDescription`]
/// messages.
pub struct EnrichmentStage {
    broker: Arc<dyn Broker>,
    source: Arc<dyn ImageSource>,
    describer: Arc<dyn Describer>,
    store: Arc<dyn ObjectStore>,
    settings: EnrichmentSettings,
    descriptions_queue: String,
    failures_queue: String,
}

impl EnrichmentStage {
    /// Create the stage.
    pub fn new(
        broker: Arc<dyn Broker>,
        source: Arc<dyn ImageSource>,
        describer: Arc<dyn Describer>,
        store: Arc<dyn ObjectStore>,
        settings: EnrichmentSettings,
        descriptions_queue: impl Into<String>,
        failures_queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            source,
            describer,
            store,
            settings,
            descriptions_queue: descriptions_queue.into(),
            failures_queue: failures_queue.into(),
        }
    }

    /// Build the final description for one detection result.
    ///
    /// # Errors
    ///
    /// Fails when the source image cannot be fetched or decoded, or when the
    /// whole-image pass fails. Individual fragment failures are logged and
    /// the fragment is left out.
    pub async fn enrich(&self, result: &DetectionResult) -> Result<FinalDescription> {
        let image_id = result.image_id;

        let bytes = with_retry("download", self.settings.download, || {
            self.source.fetch(&result.image_ref)
        })
        .await?;
        let image = Arc::new(crop::decode_blocking(Arc::new(bytes)).await?);

        if (image.width(), image.height()) != (result.image_width, result.image_height) {
            warn!(
                image_id,
                expected_width = result.image_width,
                expected_height = result.image_height,
                width = image.width(),
                height = image.height(),
                "image dimensions differ from detection result"
            );
        }

        let objects = if result.objects.is_empty() {
            let whole = DetectedObject {
                bbox: BBox::full(image.width(), image.height()),
                label: WHOLE_IMAGE_LABEL.to_string(),
                confidence: 1.0,
            };
            // Nothing to isolate the failure from: it fails the message.
            self.enrich_fragment(&image, image_id, 0, &whole)
                .await?
                .into_iter()
                .collect()
        } else {
            self.enrich_all(&image, image_id, &result.objects).await
        };

        Ok(FinalDescription {
            image_id,
            run: result.run,
            objects,
        })
    }

    async fn enrich_all(
        &self,
        image: &Arc<DynamicImage>,
        image_id: ImageId,
        objects: &[DetectedObject],
    ) -> Vec<FragmentOutcome> {
        // Collected before streaming to keep `handle` Send.
        let tasks: Vec<_> = objects
            .iter()
            .enumerate()
            .map(|(index, object)| async move {
                (index, self.enrich_fragment(image, image_id, index, object).await)
            })
            .collect();
        let mut results: Vec<(usize, Result<Option<FragmentOutcome>>)> = stream::iter(tasks)
            .buffer_unordered(self.settings.max_concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let mut outcomes = Vec::with_capacity(results.len());
        for (index, result) in results {
            match result {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => warn!(image_id, fragment = index, "fragment dropped: {e}"),
            }
        }
        outcomes
    }

    /// Crop, describe, gate and store one object.
    ///
    /// `Ok(None)` means the confidence gate dropped it.
    async fn enrich_fragment(
        &self,
        image: &Arc<DynamicImage>,
        image_id: ImageId,
        index: usize,
        object: &DetectedObject,
    ) -> Result<Option<FragmentOutcome>> {
        let Crop { bbox, jpeg } =
            crop::crop_jpeg_blocking(Arc::clone(image), object.bbox, self.settings.jpeg_quality)
                .await?;

        let input = ImageInput::Bytes {
            data: &jpeg,
            content_type: CROP_CONTENT_TYPE,
        };
        let description = with_retry("describe", self.settings.describe, || {
            self.describer.describe(input, &self.settings.prompt_id)
        })
        .await?;

        match gate::evaluate(&description, self.settings.confidence_threshold) {
            GateDecision::Drop(confidence) => {
                debug!(
                    image_id,
                    fragment = index,
                    confidence,
                    "below confidence threshold"
                );
                return Ok(None);
            }
            GateDecision::Unparsed => {
                debug!(image_id, fragment = index, "confidence unreadable, keeping");
            }
            GateDecision::Pass(_) => {}
        }

        let folder = format!("{}/{image_id}", self.settings.fragment_folder);
        let stored = with_retry("store", self.settings.storage, || {
            self.store.put(&jpeg, CROP_CONTENT_TYPE, &folder)
        })
        .await?;

        Ok(Some(FragmentOutcome {
            bbox,
            label: object.label.clone(),
            confidence: object.confidence,
            fragment_ref: stored.key,
            description,
        }))
    }
}

#[async_trait]
impl Handler for EnrichmentStage {
    type Message = DetectionResult;

    fn stage(&self) -> &'static str {
        "enrichment"
    }

    async fn handle(&self, result: &DetectionResult) -> Result<()> {
        let description = self.enrich(result).await?;
        publish_json(&*self.broker, &self.descriptions_queue, &description).await?;
        info!(
            image_id = result.image_id,
            detected = result.objects.len(),
            kept = description.objects.len(),
            "description published"
        );
        Ok(())
    }

    async fn abandon(&self, result: &DetectionResult, error: &Error) {
        notify_failure(
            &*self.broker,
            &self.failures_queue,
            result.image_id,
            result.run,
            self.stage(),
            error,
        )
        .await;
    }
}

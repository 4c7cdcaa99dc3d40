//! Status consumer: the only writer of image lifecycle state.

use super::gate;
use crate::broker::Handler;
use crate::constants::enrichment::WHOLE_IMAGE_LABEL;
use crate::error::Result;
use crate::messages::{FailureNotice, FinalDescription, FragmentOutcome, ImageId, RunId};
use crate::services::{ImageRecord, ImageRepository, ImageStatus, ImageUpdate, NewFragment};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Load `id`, or `None` when it is missing, already terminal or on another
/// run than the message.
///
/// These cases are logged; none is retried. A missing image cannot be
/// recovered from the message. A terminal image means this delivery is a
/// duplicate, and a run mismatch means it predates a reprocess.
async fn open_image(
    repository: &dyn ImageRepository,
    id: ImageId,
    run: RunId,
) -> Result<Option<ImageRecord>> {
    let Some(image) = repository.get_image(id).await? else {
        error!(image_id = id, "image not found, dropping message");
        return Ok(None);
    };
    if image.run != run {
        info!(image_id = id, run, current = image.run, "message from a stale run, ignoring");
        return Ok(None);
    }
    if image.status.is_terminal() {
        info!(image_id = id, status = %image.status, "image already finished, ignoring");
        return Ok(None);
    }
    Ok(Some(image))
}

fn fragment_fields(outcome: &FragmentOutcome) -> NewFragment {
    NewFragment {
        storage_ref: outcome.fragment_ref.clone(),
        label: outcome.label.clone(),
        confidence: outcome.confidence,
        position_x: outcome.bbox.x1,
        position_y: outcome.bbox.y1,
        width: outcome.bbox.width(),
        height: outcome.bbox.height(),
        description: gate::parse_payload(&outcome.description)
            .unwrap_or_else(|| Value::String(outcome.description.clone())),
    }
}

fn detected_objects(description: &FinalDescription) -> Value {
    Value::Array(
        description
            .objects
            .iter()
            .map(|o| {
                json!({
                    "bbox": o.bbox,
                    "label": o.label,
                    "confidence": o.confidence,
                    "fragment_ref": o.fragment_ref,
                })
            })
            .collect(),
    )
}

fn whole_image_text(description: &FinalDescription) -> Option<String> {
    match description.objects.as_slice() {
        [only] if only.label == WHOLE_IMAGE_LABEL => Some(only.description.clone()),
        _ => None,
    }
}

/// Consumes [`FinalDescription`] messages and completes images.
pub struct StatusConsumer {
    repository: Arc<dyn ImageRepository>,
}

impl StatusConsumer {
    /// Create the consumer.
    pub fn new(repository: Arc<dyn ImageRepository>) -> Self {
        Self { repository }
    }

    async fn persist(&self, description: &FinalDescription, created: &mut Vec<u64>) -> Result<()> {
        let image_id = description.image_id;
        for outcome in &description.objects {
            let fragment = self
                .repository
                .create_fragment(image_id, fragment_fields(outcome))
                .await?;
            created.push(fragment.id);
        }

        self.repository
            .update_image(
                image_id,
                ImageUpdate {
                    status: Some(ImageStatus::Completed),
                    detected_objects: Some(detected_objects(description)),
                    description_text: whole_image_text(description),
                    image_ref: None,
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Handler for StatusConsumer {
    type Message = FinalDescription;

    fn stage(&self) -> &'static str {
        "status"
    }

    async fn handle(&self, description: &FinalDescription) -> Result<()> {
        let image_id = description.image_id;
        if open_image(&*self.repository, image_id, description.run).await?.is_none() {
            return Ok(());
        }

        let mut created = Vec::new();
        match self.persist(description, &mut created).await {
            Ok(()) => {
                info!(
                    image_id,
                    fragments = created.len(),
                    "image completed"
                );
                Ok(())
            }
            Err(e) => {
                error!(image_id, "persisting description failed: {e}");
                if !created.is_empty()
                    && let Err(rollback) = self.repository.delete_fragments(image_id, &created).await
                {
                    warn!(image_id, "fragment rollback failed: {rollback}");
                }
                self.repository
                    .update_image(image_id, ImageUpdate::status(ImageStatus::Failed))
                    .await?;
                Ok(())
            }
        }
    }
}

/// Consumes [`FailureNotice`] messages and fails images.
pub struct FailureConsumer {
    repository: Arc<dyn ImageRepository>,
}

impl FailureConsumer {
    /// Create the consumer.
    pub fn new(repository: Arc<dyn ImageRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Handler for FailureConsumer {
    type Message = FailureNotice;

    fn stage(&self) -> &'static str {
        "failures"
    }

    async fn handle(&self, notice: &FailureNotice) -> Result<()> {
        let image_id = notice.image_id;
        if open_image(&*self.repository, image_id, notice.run).await?.is_none() {
            return Ok(());
        }

        self.repository
            .update_image(image_id, ImageUpdate::status(ImageStatus::Failed))
            .await?;
        warn!(
            image_id,
            stage = %notice.stage,
            reason = %notice.reason,
            "image failed"
        );
        Ok(())
    }
}

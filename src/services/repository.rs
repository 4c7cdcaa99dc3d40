//! Image and fragment persistence.

use crate::error::{Error, Result};
use crate::messages::{ImageId, RunId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::RwLock;
use tracing::debug;

/// Processing state of an image.
///
/// States only move forward: `Uploaded`, `Processing`, then one of the two
/// terminal states. Leaving a terminal state requires
/// [`ImageRepository::reset_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    /// Stored, not yet submitted.
    Uploaded,
    /// Submitted to the pipeline.
    Processing,
    /// Description persisted.
    Completed,
    /// A stage gave up on the image.
    Failed,
}

impl ImageStatus {
    const fn rank(self) -> u8 {
        match self {
            Self::Uploaded => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// `Completed` or `Failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a normal (non-reprocess) update may move to `next`.
    pub const fn can_advance_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Stored image metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Identifier.
    pub id: ImageId,
    /// Original file name.
    pub file_name: String,
    /// MIME type.
    pub content_type: String,
    /// Size of the encoded image in bytes.
    pub file_size: u64,
    /// Key of the source bytes in object storage.
    pub storage_key: String,
    /// Reference handed to the pipeline.
    pub image_ref: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Lifecycle state.
    pub status: ImageStatus,
    /// Processing run, incremented by each reset.
    #[serde(default)]
    pub run: RunId,
    /// Surviving objects written by the status consumer.
    pub detected_objects: Option<serde_json::Value>,
    /// Whole-image description text, when one was produced.
    pub description_text: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    /// Original file name.
    pub file_name: String,
    /// MIME type.
    pub content_type: String,
    /// Size of the encoded image in bytes.
    pub file_size: u64,
    /// Key of the source bytes in object storage.
    pub storage_key: String,
    /// Reference handed to the pipeline.
    pub image_ref: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Partial update of an image. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageUpdate {
    /// New status; must be a forward move.
    pub status: Option<ImageStatus>,
    /// Replacement detected objects.
    pub detected_objects: Option<serde_json::Value>,
    /// Replacement description text.
    pub description_text: Option<String>,
    /// Replacement reference.
    pub image_ref: Option<String>,
}

impl ImageUpdate {
    /// Update that only changes status.
    pub fn status(status: ImageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Stored fragment metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentRecord {
    /// Identifier.
    pub id: u64,
    /// Parent image.
    pub image_id: ImageId,
    /// Storage reference of the crop.
    pub storage_ref: String,
    /// Class label.
    pub label: String,
    /// Detector score.
    pub confidence: f32,
    /// Left edge in pixels.
    pub position_x: f32,
    /// Top edge in pixels.
    pub position_y: f32,
    /// Width in pixels.
    pub width: f32,
    /// Height in pixels.
    pub height: f32,
    /// Description as JSON when parseable, else the raw string.
    pub description: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Fields for a new fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFragment {
    /// Storage reference of the crop.
    pub storage_ref: String,
    /// Class label.
    pub label: String,
    /// Detector score.
    pub confidence: f32,
    /// Left edge in pixels.
    pub position_x: f32,
    /// Top edge in pixels.
    pub position_y: f32,
    /// Width in pixels.
    pub width: f32,
    /// Height in pixels.
    pub height: f32,
    /// Description payload.
    pub description: serde_json::Value,
}

/// Persistence of images and their fragments.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Create an image in the `Uploaded` state.
    async fn insert_image(&self, image: NewImage) -> Result<ImageRecord>;

    /// Load an image, `None` when it does not exist.
    async fn get_image(&self, id: ImageId) -> Result<Option<ImageRecord>>;

    /// Apply `update`.
    ///
    /// # Errors
    ///
    /// [`Error::ImageNotFound`] for unknown ids and
    /// [`Error::InvalidTransition`] for backward status moves.
    async fn update_image(&self, id: ImageId, update: ImageUpdate) -> Result<ImageRecord>;

    /// Move an image back to `Processing` for reprocessing.
    ///
    /// Clears detected objects and description text. Fails unless the image
    /// is in a terminal state.
    async fn reset_image(&self, id: ImageId) -> Result<ImageRecord>;

    /// Attach a fragment to an image.
    async fn create_fragment(&self, image_id: ImageId, fragment: NewFragment)
    -> Result<FragmentRecord>;

    /// Fragments of an image, in creation order.
    async fn list_fragments(&self, image_id: ImageId) -> Result<Vec<FragmentRecord>>;

    /// Delete fragments of an image. An empty `ids` deletes all of them.
    /// Returns the number removed.
    async fn delete_fragments(&self, image_id: ImageId, ids: &[u64]) -> Result<usize>;

    /// Every image, by id.
    async fn list_images(&self) -> Result<Vec<ImageRecord>>;
}

#[derive(Debug, Default)]
struct Tables {
    next_image_id: ImageId,
    next_fragment_id: u64,
    images: BTreeMap<ImageId, ImageRecord>,
    fragments: BTreeMap<u64, FragmentRecord>,
    history: BTreeMap<ImageId, Vec<ImageStatus>>,
}

/// In-memory [`ImageRepository`].
///
/// Enforces the same lifecycle rules a relational backend would and records
/// every status an image passes through.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status `id` has been in, oldest first.
    pub async fn status_history(&self, id: ImageId) -> Vec<ImageStatus> {
        self.tables
            .read()
            .await
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ImageRepository for MemoryRepository {
    async fn insert_image(&self, image: NewImage) -> Result<ImageRecord> {
        let mut tables = self.tables.write().await;
        tables.next_image_id += 1;
        let id = tables.next_image_id;
        let now = Utc::now();

        let record = ImageRecord {
            id,
            file_name: image.file_name,
            content_type: image.content_type,
            file_size: image.file_size,
            storage_key: image.storage_key,
            image_ref: image.image_ref,
            width: image.width,
            height: image.height,
            status: ImageStatus::Uploaded,
            run: 0,
            detected_objects: None,
            description_text: None,
            created_at: now,
            updated_at: now,
        };
        tables.images.insert(id, record.clone());
        tables.history.insert(id, vec![ImageStatus::Uploaded]);
        Ok(record)
    }

    async fn get_image(&self, id: ImageId) -> Result<Option<ImageRecord>> {
        Ok(self.tables.read().await.images.get(&id).cloned())
    }

    async fn update_image(&self, id: ImageId, update: ImageUpdate) -> Result<ImageRecord> {
        let mut tables = self.tables.write().await;
        let record = tables
            .images
            .get_mut(&id)
            .ok_or(Error::ImageNotFound { id })?;

        if let Some(next) = update.status
            && !record.status.can_advance_to(next)
        {
            return Err(Error::InvalidTransition {
                id,
                from: record.status.to_string(),
                to: next.to_string(),
            });
        }

        if let Some(objects) = update.detected_objects {
            record.detected_objects = Some(objects);
        }
        if let Some(text) = update.description_text {
            record.description_text = Some(text);
        }
        if let Some(image_ref) = update.image_ref {
            record.image_ref = image_ref;
        }
        if let Some(next) = update.status {
            record.status = next;
        }
        record.updated_at = Utc::now();

        let record = record.clone();
        if let Some(next) = update.status {
            tables.history.entry(id).or_default().push(next);
            debug!(image_id = id, status = %next, "image status changed");
        }
        Ok(record)
    }

    async fn reset_image(&self, id: ImageId) -> Result<ImageRecord> {
        let mut tables = self.tables.write().await;
        let record = tables
            .images
            .get_mut(&id)
            .ok_or(Error::ImageNotFound { id })?;

        if !record.status.is_terminal() {
            return Err(Error::InvalidTransition {
                id,
                from: record.status.to_string(),
                to: ImageStatus::Processing.to_string(),
            });
        }

        record.status = ImageStatus::Processing;
        record.run += 1;
        record.detected_objects = None;
        record.description_text = None;
        record.updated_at = Utc::now();

        let record = record.clone();
        tables
            .history
            .entry(id)
            .or_default()
            .push(ImageStatus::Processing);
        Ok(record)
    }

    async fn create_fragment(
        &self,
        image_id: ImageId,
        fragment: NewFragment,
    ) -> Result<FragmentRecord> {
        let mut tables = self.tables.write().await;
        if !tables.images.contains_key(&image_id) {
            return Err(Error::ImageNotFound { id: image_id });
        }

        tables.next_fragment_id += 1;
        let record = FragmentRecord {
            id: tables.next_fragment_id,
            image_id,
            storage_ref: fragment.storage_ref,
            label: fragment.label,
            confidence: fragment.confidence,
            position_x: fragment.position_x,
            position_y: fragment.position_y,
            width: fragment.width,
            height: fragment.height,
            description: fragment.description,
            created_at: Utc::now(),
        };
        tables.fragments.insert(record.id, record.clone());
        Ok(record)
    }

    async fn list_fragments(&self, image_id: ImageId) -> Result<Vec<FragmentRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .fragments
            .values()
            .filter(|f| f.image_id == image_id)
            .cloned()
            .collect())
    }

    async fn delete_fragments(&self, image_id: ImageId, ids: &[u64]) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let before = tables.fragments.len();
        tables
            .fragments
            .retain(|id, f| f.image_id != image_id || !(ids.is_empty() || ids.contains(id)));
        Ok(before - tables.fragments.len())
    }

    async fn list_images(&self) -> Result<Vec<ImageRecord>> {
        Ok(self.tables.read().await.images.values().cloned().collect())
    }
}

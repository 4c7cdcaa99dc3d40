//! Task submission and reprocessing.

use crate::broker::{Broker, publish_json};
use crate::error::{Error, Result};
use crate::messages::{ImageId, Task};
use crate::services::{ImageRecord, ImageRepository, ImageStatus, ImageUpdate};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info};

/// Per-image async locks, dropped once nobody holds them.
#[derive(Debug, Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<ImageId, Weak<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, id: ImageId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, weak| weak.strong_count() > 0);
            if let Some(lock) = locks.get(&id).and_then(Weak::upgrade) {
                lock
            } else {
                let lock = Arc::new(AsyncMutex::new(()));
                locks.insert(id, Arc::downgrade(&lock));
                lock
            }
        };
        lock.lock_owned().await
    }
}

/// Starts processing of stored images.
///
/// Submission is explicit and its outcome observable: the image moves to
/// `Processing` before the task is published, and to `Failed` if the publish
/// does not go through. Calls for the same image are serialized.
pub struct TaskPublisher {
    broker: Arc<dyn Broker>,
    repository: Arc<dyn ImageRepository>,
    tasks_queue: String,
    locks: KeyedLocks,
}

impl TaskPublisher {
    /// Create a publisher for `tasks_queue`.
    pub fn new(
        broker: Arc<dyn Broker>,
        repository: Arc<dyn ImageRepository>,
        tasks_queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            repository,
            tasks_queue: tasks_queue.into(),
            locks: KeyedLocks::default(),
        }
    }

    /// Submit a freshly uploaded image.
    ///
    /// # Errors
    ///
    /// [`Error::ImageNotFound`], [`Error::InvalidTransition`] when the image
    /// was already submitted, or the publish error.
    pub async fn submit(&self, id: ImageId) -> Result<()> {
        let _guard = self.locks.lock(id).await;

        let image = self
            .repository
            .update_image(id, ImageUpdate::status(ImageStatus::Processing))
            .await?;
        self.publish(&image).await
    }

    /// Run a finished image through the pipeline again.
    ///
    /// Fragments from the previous run are removed.
    pub async fn reprocess(&self, id: ImageId) -> Result<()> {
        let _guard = self.locks.lock(id).await;

        let image = self.repository.reset_image(id).await?;
        let removed = self.repository.delete_fragments(id, &[]).await?;
        info!(image_id = id, removed, "reprocessing image");
        self.publish(&image).await
    }

    async fn publish(&self, image: &ImageRecord) -> Result<()> {
        let task = Task {
            image_id: image.id,
            image_ref: image.image_ref.clone(),
            content_type: image.content_type.clone(),
            run: image.run,
        };

        if let Err(e) = publish_json(&*self.broker, &self.tasks_queue, &task).await {
            error!(image_id = image.id, "task publish failed: {e}");
            if let Err(mark) = self
                .repository
                .update_image(image.id, ImageUpdate::status(ImageStatus::Failed))
                .await
            {
                error!(image_id = image.id, "could not mark image failed: {mark}");
            }
            return Err(Error::Publish {
                queue: self.tasks_queue.clone(),
                reason: e.to_string(),
            });
        }

        info!(image_id = image.id, "task submitted");
        Ok(())
    }
}

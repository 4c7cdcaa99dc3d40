//! External collaborators and their concrete implementations.
//!
//! Stages depend only on the traits here. [`Services`] bundles one instance of
//! each, built once at startup and handed to every stage.

mod describer;
mod detector;
mod fetch;
mod repository;
mod storage;

pub use describer::{ChatDescriber, Describer, ImageInput};
pub use detector::{Detections, Detector, HttpDetector};
pub use fetch::{ImageFetcher, ImageSource};
pub use repository::{
    FragmentRecord, ImageRecord, ImageRepository, ImageStatus, ImageUpdate, MemoryRepository,
    NewFragment, NewImage,
};
pub use storage::{LocalStore, ObjectStore, StoredObject};

use crate::broker::Broker;
use crate::config::Config;
use crate::constants::timeouts::CONNECT_SECS;
use crate::error::{Error, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// One instance of every collaborator, shared by all stages.
#[derive(Clone)]
pub struct Services {
    /// Message broker.
    pub broker: Arc<dyn Broker>,
    /// Object detector.
    pub detector: Arc<dyn Detector>,
    /// Vision-language describer.
    pub describer: Arc<dyn Describer>,
    /// Object storage.
    pub store: Arc<dyn ObjectStore>,
    /// Source image reader.
    pub source: Arc<dyn ImageSource>,
    /// Image and fragment persistence.
    pub repository: Arc<dyn ImageRepository>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// Build the outbound HTTP client shared by every collaborator.
///
/// Per-call deadlines are applied by the caller; the client only bounds the
/// connect phase and the idle pool.
pub fn http_client(max_connections: usize) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_SECS))
        .pool_max_idle_per_host(max_connections)
        .build()
        .map_err(|e| Error::Internal {
            message: format!("Failed to create HTTP client: {e}"),
        })
}

/// Build the concrete collaborators described by `config`.
///
/// The broker is passed in so callers can keep a handle for shutdown.
pub fn build_services(config: &Config, broker: Arc<dyn Broker>) -> Result<Services> {
    let client = http_client(config.enrichment.max_concurrency)?;

    let root = match &config.storage.root {
        Some(root) => root.clone(),
        None => crate::config::default_storage_root()?,
    };

    Ok(Services {
        broker,
        detector: Arc::new(HttpDetector::from_config(&config.detector, client.clone())?),
        describer: Arc::new(ChatDescriber::from_config(&config.describer, client.clone())),
        store: Arc::new(LocalStore::new(root)),
        source: Arc::new(ImageFetcher::new(client)),
        repository: Arc::new(MemoryRepository::new()),
    })
}

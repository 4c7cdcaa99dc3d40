//! Configuration loading and management.

mod file;
mod paths;
mod types;
mod validate;

pub use file::{load_config_file, save_config};
pub use paths::{config_dir, config_file_path, default_storage_root};
pub use types::{
    Config, DedupConfig, DescriberConfig, DetectorConfig, EnrichmentConfig, QueueConfig,
    RetryConfig, StorageConfig, TimeoutConfig,
};
pub use validate::validate_config;

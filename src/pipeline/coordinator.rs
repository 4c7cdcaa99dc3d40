//! Input discovery and image ingestion for local runs.

use super::crop;
use crate::constants::REPORT_EXTENSION;
use crate::constants::ingest::{IMAGE_EXTENSIONS, IMAGE_FOLDER, MAX_FILE_SIZE};
use crate::error::{Error, Result};
use crate::services::{ImageRecord, ImageRepository, NewImage, ObjectStore};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Limits applied when ingesting an image.
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// Maximum accepted file size in bytes.
    pub max_file_size: u64,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_file_size: MAX_FILE_SIZE,
        }
    }
}

/// Determine the output directory for a file.
pub fn output_dir_for(input: &Path, explicit_output_dir: Option<&Path>) -> PathBuf {
    explicit_output_dir.map_or_else(
        || {
            input
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        },
        Path::to_path_buf,
    )
}

/// Path of the JSON report for `input`.
pub fn report_path_for(input: &Path, output_dir: &Path) -> PathBuf {
    // Non-UTF-8 names are kept lossily
    let stem = input.file_stem().map_or_else(
        || std::borrow::Cow::Borrowed("image"),
        |s| s.to_string_lossy(),
    );
    output_dir.join(format!("{stem}{REPORT_EXTENSION}"))
}

/// Whether `input` still needs processing.
pub fn should_process(input: &Path, output_dir: &Path, force: bool) -> bool {
    force || !report_path_for(input, output_dir).exists()
}

/// Collect input files from paths (files and directories).
pub fn collect_input_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_file() {
            if is_image_file(path) {
                files.push(path.clone());
            } else {
                warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            collect_image_files_recursive(path, &mut files)?;
        } else {
            warn!("Skipping non-existent path: {}", path.display());
        }
    }

    files.sort();
    Ok(files)
}

fn collect_image_files_recursive(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.is_dir() {
            collect_image_files_recursive(&path, files)?;
        } else if is_image_file(&path) {
            files.push(path);
        }
    }

    Ok(())
}

/// Check if a file has a supported image extension.
pub fn is_image_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| {
        IMAGE_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known))
    })
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => "image/jpeg",
    }
}

/// Store `path` and create its image record in the `Uploaded` state.
///
/// # Errors
///
/// [`Error::ImageTooLarge`] above the size limit; decode errors when the
/// file is not a readable image.
pub async fn ingest_image(
    path: &Path,
    store: &dyn ObjectStore,
    repository: &dyn ImageRepository,
    options: IngestOptions,
) -> Result<ImageRecord> {
    let size = tokio::fs::metadata(path).await?.len();
    if size > options.max_file_size {
        return Err(Error::ImageTooLarge {
            path: path.to_path_buf(),
            size,
            limit: options.max_file_size,
        });
    }

    let bytes = tokio::fs::read(path).await?;
    let (width, height) = crop::dimensions(&bytes)?;
    let content_type = content_type_for(path);

    let stored = store.put(&bytes, content_type, IMAGE_FOLDER).await?;
    let file_name = path
        .file_name()
        .map_or_else(String::new, |n| n.to_string_lossy().into_owned());

    let record = repository
        .insert_image(NewImage {
            file_name,
            content_type: content_type.to_string(),
            file_size: size,
            storage_key: stored.key,
            image_ref: stored.url,
            width,
            height,
        })
        .await?;
    debug!(image_id = record.id, width, height, "image ingested");
    Ok(record)
}

//! Region cropping and JPEG encoding.

use crate::dedup::BBox;
use crate::error::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader};
use std::io::Cursor;
use std::sync::Arc;

/// A crop ready for description and storage.
#[derive(Debug, Clone)]
pub struct Crop {
    /// Box actually cropped, clamped to the image.
    pub bbox: BBox,
    /// JPEG bytes.
    pub jpeg: Vec<u8>,
}

/// Decode encoded image bytes.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    Ok(ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?)
}

/// Read dimensions from the image header without decoding pixels.
pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    Ok(ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()?)
}

/// Integer pixel rectangle `(x, y, width, height)` covering `bbox`.
///
/// The box is clamped to the image first; fractional edges are widened
/// outwards so the crop never loses a partial pixel.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn pixel_rect(bbox: &BBox, width: u32, height: u32) -> Result<(BBox, u32, u32, u32, u32)> {
    let clamped = bbox.clamp_to(width, height);
    let x1 = clamped.x1.floor() as u32;
    let y1 = clamped.y1.floor() as u32;
    let x2 = (clamped.x2.ceil() as u32).min(width);
    let y2 = (clamped.y2.ceil() as u32).min(height);

    if x2 <= x1 || y2 <= y1 {
        return Err(Error::EmptyCrop {
            bbox: (*bbox).into(),
            width,
            height,
        });
    }
    Ok((clamped, x1, y1, x2 - x1, y2 - y1))
}

/// Crop `bbox` out of `image` and encode it as JPEG.
///
/// # Errors
///
/// [`Error::EmptyCrop`] when the box has no area inside the image.
pub fn crop_jpeg(image: &DynamicImage, bbox: &BBox, quality: u8) -> Result<Crop> {
    let (clamped, x, y, w, h) = pixel_rect(bbox, image.width(), image.height())?;
    // JPEG has no alpha channel.
    let region = DynamicImage::ImageRgb8(image.crop_imm(x, y, w, h).to_rgb8());

    let mut jpeg = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
    region.write_with_encoder(encoder)?;

    Ok(Crop {
        bbox: clamped,
        jpeg,
    })
}

/// [`crop_jpeg`] on the blocking pool.
pub async fn crop_jpeg_blocking(image: Arc<DynamicImage>, bbox: BBox, quality: u8) -> Result<Crop> {
    tokio::task::spawn_blocking(move || crop_jpeg(&image, &bbox, quality))
        .await
        .map_err(|e| Error::Internal {
            message: format!("crop task failed: {e}"),
        })?
}

/// [`decode`] on the blocking pool.
pub async fn decode_blocking(bytes: Arc<Vec<u8>>) -> Result<DynamicImage> {
    tokio::task::spawn_blocking(move || decode(&bytes))
        .await
        .map_err(|e| Error::Internal {
            message: format!("decode task failed: {e}"),
        })?
}

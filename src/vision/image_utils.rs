// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Image loading and encoding utilities for the detection and query flows

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, ImageFormat};
use std::path::Path;
use thiserror::Error;

/// Maximum accepted upload size (10MB)
const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image data is too large: {0} bytes (max: {1} bytes)")]
    TooLarge(usize, usize),

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("failed to decode image: {0}")]
    DecodeFailed(String),

    #[error("image data is empty")]
    EmptyData,

    #[error("failed to read image file: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode raw uploaded image bytes.
///
/// The format is detected from magic bytes; the surrounding form accepts
/// JPEG and PNG photos.
pub fn decode_image_bytes(bytes: &[u8]) -> Result<(DynamicImage, ImageFormat), ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::EmptyData);
    }
    if bytes.len() > MAX_IMAGE_SIZE {
        return Err(ImageError::TooLarge(bytes.len(), MAX_IMAGE_SIZE));
    }

    let format = detect_format(bytes)?;
    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ImageError::DecodeFailed(e.to_string()))?;

    Ok((image, format))
}

/// Detect image format from magic bytes.
pub fn detect_format(bytes: &[u8]) -> Result<ImageFormat, ImageError> {
    if bytes.len() < 4 {
        return Err(ImageError::UnsupportedFormat);
    }

    match bytes {
        // PNG: 89 50 4E 47
        [0x89, 0x50, 0x4E, 0x47, ..] => Ok(ImageFormat::Png),

        // JPEG: FF D8 FF
        [0xFF, 0xD8, 0xFF, ..] => Ok(ImageFormat::Jpeg),

        // WebP: RIFF .... WEBP
        [0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x45, 0x42, 0x50, ..] => Ok(ImageFormat::WebP),

        _ => Err(ImageError::UnsupportedFormat),
    }
}

/// Get the format extension as a string.
pub fn format_to_extension(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpg",
        ImageFormat::WebP => "webp",
        _ => "unknown",
    }
}

/// Read a stored image file and encode it as a base64 data URL for the
/// multimodal chat payload and for surfacing the analyzed image to callers.
pub fn data_url_for_file(path: &Path) -> Result<String, ImageError> {
    let bytes = std::fs::read(path)?;
    let media_type = match detect_format(&bytes) {
        Ok(ImageFormat::Png) => "png",
        Ok(ImageFormat::WebP) => "webp",
        // Pre-existing files of unknown provenance are sent as JPEG, which
        // is what the hosted API assumes when it cannot sniff
        _ => "jpeg",
    };
    Ok(format!(
        "data:image/{};base64,{}",
        media_type,
        STANDARD.encode(&bytes)
    ))
}

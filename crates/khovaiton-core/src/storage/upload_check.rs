//! Client-side validation of image bytes before an unsigned upload.

use std::io::Cursor;

use image::{ImageFormat, ImageReader};

use crate::{Error, Result};

/// Formats the upload endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Jpeg,
    Png,
    WebP,
}

impl UploadFormat {
    const fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::WebP => Some(Self::WebP),
            _ => None,
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::WebP => "webp",
        }
    }

    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }
}

/// Size limits applied before any bytes leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_bytes: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Facts about an upload that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckedUpload {
    pub format: UploadFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
}

/// Validate upload bytes: non-empty, within the size limit, and a decodable
/// JPEG, PNG or WebP header.
///
/// Only the header is read, so large images are not fully decoded.
pub fn check_upload(bytes: &[u8], limits: UploadLimits) -> Result<CheckedUpload> {
    if bytes.is_empty() {
        return Err(Error::InvalidInput(
            "Upload image bytes cannot be empty".to_string(),
        ));
    }
    if bytes.len() > limits.max_bytes {
        return Err(Error::InvalidInput(format!(
            "Upload image is {} bytes, above the {} byte limit",
            bytes.len(),
            limits.max_bytes
        )));
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|error| Error::InvalidInput(format!("Failed to read upload image: {error}")))?;
    let Some(detected) = reader.format() else {
        return Err(Error::InvalidInput(
            "Failed to decode upload image: unknown format".to_string(),
        ));
    };
    let Some(format) = UploadFormat::from_image_format(detected) else {
        return Err(Error::InvalidInput(format!(
            "Unsupported upload image format {detected:?}; expected jpg, png or webp"
        )));
    };
    let (width, height) = reader
        .into_dimensions()
        .map_err(|error| Error::InvalidInput(format!("Failed to decode upload image: {error}")))?;

    Ok(CheckedUpload {
        format,
        width,
        height,
        bytes: bytes.len(),
    })
}

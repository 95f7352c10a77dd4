use bytes::Bytes;
use image::{ImageFormat, ImageReader};
use std::io::Cursor;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::model::Category;
use crate::{AppError, ErrorKind, MAX_PHOTO_BYTES, MAX_PHOTO_DIMENSION};

const HASH_PREFIX_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PhotoError {
    #[error("photo is empty")]
    Empty,

    #[error("photo too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("unsupported photo format, expected JPEG, PNG or WebP")]
    UnsupportedFormat,

    #[error("photo dimensions {width}x{height} exceed {max}x{max}")]
    DimensionsTooLarge { width: u32, height: u32, max: u32 },

    #[error("photo could not be read: {0}")]
    Unreadable(String),

    #[error("photo check was interrupted")]
    Interrupted,
}

impl From<PhotoError> for AppError {
    fn from(e: PhotoError) -> Self {
        AppError::new(ErrorKind::Upload, "photo rejected").with_internal(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoFormat {
    Jpeg,
    Png,
    WebP,
}

impl PhotoFormat {
    fn from_image(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::WebP => Some(Self::WebP),
            _ => None,
        }
    }

    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }

    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::WebP => "webp",
        }
    }
}

/// A photo that passed every pre-upload check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPhoto {
    pub bytes: Bytes,
    pub format: PhotoFormat,
    pub width: u32,
    pub height: u32,
    /// `"{table}/{content hash}.{ext}"`; identical photos share a path.
    pub path: String,
}

/// Format sniffing plus a header-only dimension read.
pub fn inspect(bytes: &[u8]) -> Result<(PhotoFormat, u32, u32), PhotoError> {
    if bytes.is_empty() {
        return Err(PhotoError::Empty);
    }
    if bytes.len() > MAX_PHOTO_BYTES {
        return Err(PhotoError::TooLarge {
            size: bytes.len(),
            max: MAX_PHOTO_BYTES,
        });
    }
    let format = image::guess_format(bytes)
        .ok()
        .and_then(PhotoFormat::from_image)
        .ok_or(PhotoError::UnsupportedFormat)?;

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PhotoError::Unreadable(e.to_string()))?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| PhotoError::Unreadable(e.to_string()))?;
    if width > MAX_PHOTO_DIMENSION || height > MAX_PHOTO_DIMENSION {
        return Err(PhotoError::DimensionsTooLarge {
            width,
            height,
            max: MAX_PHOTO_DIMENSION,
        });
    }
    if width == 0 || height == 0 {
        return Err(PhotoError::Unreadable("zero-sized image".to_owned()));
    }
    Ok((format, width, height))
}

#[must_use]
pub fn object_path(category: Category, bytes: &[u8], format: PhotoFormat) -> String {
    let hash = blake3::hash(bytes).to_hex();
    format!(
        "{}/{}.{}",
        category.table(),
        &hash.as_str()[..HASH_PREFIX_LEN],
        format.extension()
    )
}

/// Validates off the async thread and derives the upload path.
#[instrument(skip(bytes), fields(size = bytes.len()))]
pub async fn prepare(category: Category, bytes: Bytes) -> Result<PreparedPhoto, PhotoError> {
    let checked = bytes.clone();
    let (format, width, height) = tokio::task::spawn_blocking(move || inspect(&checked))
        .await
        .map_err(|_| PhotoError::Interrupted)?
        .map_err(|e| {
            warn!(error = %e, "photo rejected");
            e
        })?;
    let path = object_path(category, &bytes, format);
    Ok(PreparedPhoto {
        bytes,
        format,
        width,
        height,
        path,
    })
}

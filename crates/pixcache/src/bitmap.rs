//! # Decoded images
//!
//! [`Image`] is the decoded value handed to callers. Decoding goes through the
//! [`BitmapDecoder`] trait so embedders can swap in a platform decoder; the
//! default implementation sniffs the container format from its magic bytes and
//! uses the `image` crate.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::DynamicImage;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const GIF_SIGNATURE: [u8; 3] = [0x47, 0x49, 0x46];

/// Container format detected from the leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Unknown,
}

impl ImageFormat {
    /// Sniff the format from magic bytes.
    pub fn sniff(data: &[u8]) -> Self {
        if data.starts_with(&PNG_SIGNATURE) {
            ImageFormat::Png
        } else if data.starts_with(&JPEG_SOI) {
            ImageFormat::Jpeg
        } else if data.starts_with(&GIF_SIGNATURE) {
            ImageFormat::Gif
        } else {
            ImageFormat::Unknown
        }
    }

    fn codec(self) -> Option<image::ImageFormat> {
        match self {
            ImageFormat::Png => Some(image::ImageFormat::Png),
            ImageFormat::Jpeg => Some(image::ImageFormat::Jpeg),
            ImageFormat::Gif => Some(image::ImageFormat::Gif),
            ImageFormat::Unknown => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Gif => "gif",
            ImageFormat::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A decoded image. Cloning is cheap.
#[derive(Clone)]
pub struct Image {
    pixels: Arc<DynamicImage>,
    format: ImageFormat,
    scale: f32,
}

impl Image {
    pub fn new(pixels: DynamicImage, format: ImageFormat, scale: f32) -> Self {
        Self {
            pixels: Arc::new(pixels),
            format,
            scale,
        }
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Approximate decoded size in bytes, used as the memory cache weight.
    pub fn cost(&self) -> u64 {
        self.pixels.as_bytes().len() as u64
    }

    /// Same pixels with another scale factor.
    pub fn with_scale(&self, scale: f32) -> Self {
        Self {
            pixels: Arc::clone(&self.pixels),
            format: self.format,
            scale,
        }
    }

    /// Convert into a display-ready RGBA8 buffer.
    pub fn decoded(&self) -> Self {
        if matches!(*self.pixels, DynamicImage::ImageRgba8(_)) {
            return self.clone();
        }
        Self::new(
            DynamicImage::ImageRgba8(self.pixels.to_rgba8()),
            self.format,
            self.scale,
        )
    }

    /// Encode the pixels in `format`, falling back to PNG for unknown formats.
    pub fn encode(&self, format: ImageFormat) -> Option<Bytes> {
        let codec = format.codec().unwrap_or(image::ImageFormat::Png);
        let mut buffer = Cursor::new(Vec::new());
        let pixels = if codec == image::ImageFormat::Jpeg {
            // JPEG has no alpha channel.
            DynamicImage::ImageRgb8(self.pixels.to_rgb8())
        } else {
            (*self.pixels).clone()
        };
        pixels.write_to(&mut buffer, codec).ok()?;
        Some(Bytes::from(buffer.into_inner()))
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("format", &self.format)
            .field("scale", &self.scale)
            .finish()
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.width() == other.width()
            && self.height() == other.height()
            && self.scale == other.scale
            && self.pixels.as_bytes() == other.pixels.as_bytes()
    }
}

/// Turns raw bytes into an [`Image`].
pub trait BitmapDecoder: Send + Sync {
    fn decode(&self, data: &[u8], scale: f32) -> Option<Image>;
}

/// Decoder backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBitmapDecoder;

impl BitmapDecoder for DefaultBitmapDecoder {
    fn decode(&self, data: &[u8], scale: f32) -> Option<Image> {
        let format = ImageFormat::sniff(data);
        let decoded = match format.codec() {
            Some(codec) => image::load_from_memory_with_format(data, codec),
            None => image::load_from_memory(data),
        };
        match decoded {
            Ok(pixels) => Some(Image::new(pixels, format, scale)),
            Err(e) => {
                tracing::debug!(format = %format, len = data.len(), error = %e, "Failed to decode image data");
                None
            }
        }
    }
}

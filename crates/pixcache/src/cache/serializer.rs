//! # Cache Serializer
//!
//! Converts between decoded images and the bytes written to the disk tier.

use bytes::Bytes;

use crate::bitmap::{Image, ImageFormat};
use crate::options::RetrieveOptions;

/// Converts images to and from their on-disk form.
pub trait CacheSerializer: Send + Sync {
    /// Bytes to persist for `image`. `original` is the downloaded payload, if any.
    fn data(&self, image: &Image, original: Option<&Bytes>) -> Option<Bytes>;

    /// Decode persisted bytes.
    fn image(&self, data: &Bytes, options: &RetrieveOptions) -> Option<Image>;

    /// Whether persisted bytes are the unprocessed payload, so reads must run
    /// the processor again.
    fn original_data_used(&self) -> bool {
        false
    }
}

/// Re-encodes the image in the format of the original payload, or stores
/// the original bytes untouched when `prefer_cache_original_data` is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCacheSerializer {
    pub prefer_cache_original_data: bool,
}

impl DefaultCacheSerializer {
    pub fn original_data() -> Self {
        Self {
            prefer_cache_original_data: true,
        }
    }
}

impl CacheSerializer for DefaultCacheSerializer {
    fn data(&self, image: &Image, original: Option<&Bytes>) -> Option<Bytes> {
        if self.prefer_cache_original_data {
            if let Some(original) = original {
                return Some(original.clone());
            }
        }
        let format = original
            .map(|data| ImageFormat::sniff(data))
            .unwrap_or(ImageFormat::Unknown);
        image.encode(format)
    }

    fn image(&self, data: &Bytes, options: &RetrieveOptions) -> Option<Image> {
        let image = options.decoder.decode(data, options.scale_factor)?;
        if options.background_decode {
            Some(image.decoded())
        } else {
            Some(image)
        }
    }

    fn original_data_used(&self) -> bool {
        self.prefer_cache_original_data
    }
}

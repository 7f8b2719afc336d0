//! # Processors
//!
//! A processor turns raw bytes or an already decoded image into the image a
//! caller asked for. The identifier names the transform; it is part of the
//! cache key of processed variants and is used to share one result between
//! callers that asked for the same transform.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::bitmap::Image;
use crate::options::RetrieveOptions;

/// Identifier of the identity processor.
pub const DEFAULT_PROCESSOR_IDENTIFIER: &str = "";

/// Input of a processing step.
#[derive(Debug, Clone)]
pub enum ImageItem {
    Image(Image),
    Data(Bytes),
}

impl ImageItem {
    /// Short description used in errors.
    pub fn describe(&self) -> String {
        match self {
            ImageItem::Image(image) => format!("image {}x{}", image.width(), image.height()),
            ImageItem::Data(data) => format!("data ({} bytes)", data.len()),
        }
    }
}

/// A single-step image transform.
pub trait ImageProcessor: Send + Sync {
    fn identifier(&self) -> &str;

    fn process(&self, item: &ImageItem, options: &RetrieveOptions) -> Option<Image>;

    /// Run `self` then `next` as one processor.
    fn append(self: Arc<Self>, next: Arc<dyn ImageProcessor>) -> Arc<dyn ImageProcessor>
    where
        Self: Sized + 'static,
    {
        Arc::new(ComposedProcessor::new(self, next))
    }
}

/// Whether `processor` is the identity processor.
pub fn is_default(processor: &dyn ImageProcessor) -> bool {
    processor.identifier() == DEFAULT_PROCESSOR_IDENTIFIER
}

/// Decodes data and passes images through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultImageProcessor;

impl ImageProcessor for DefaultImageProcessor {
    fn identifier(&self) -> &str {
        DEFAULT_PROCESSOR_IDENTIFIER
    }

    fn process(&self, item: &ImageItem, options: &RetrieveOptions) -> Option<Image> {
        match item {
            ImageItem::Image(image) => Some(image.with_scale(options.scale_factor)),
            ImageItem::Data(data) => options.decoder.decode(data, options.scale_factor),
        }
    }
}

/// Two processors applied in sequence.
pub struct ComposedProcessor {
    identifier: String,
    first: Arc<dyn ImageProcessor>,
    second: Arc<dyn ImageProcessor>,
}

impl ComposedProcessor {
    pub fn new(first: Arc<dyn ImageProcessor>, second: Arc<dyn ImageProcessor>) -> Self {
        let identifier = format!("{}|>{}", first.identifier(), second.identifier());
        Self {
            identifier,
            first,
            second,
        }
    }
}

impl ImageProcessor for ComposedProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(&self, item: &ImageItem, options: &RetrieveOptions) -> Option<Image> {
        let image = self.first.process(item, options)?;
        self.second.process(&ImageItem::Image(image), options)
    }
}

type TransformFn = dyn Fn(&Image, &RetrieveOptions) -> Option<Image> + Send + Sync;

/// A processor built from a closure over a decoded image.
///
/// Data inputs are decoded with the options' decoder before the closure runs.
#[derive(Clone)]
pub struct FnImageProcessor {
    identifier: String,
    transform: Arc<TransformFn>,
}

impl FnImageProcessor {
    pub fn new<F>(identifier: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&Image, &RetrieveOptions) -> Option<Image> + Send + Sync + 'static,
    {
        Self {
            identifier: identifier.into(),
            transform: Arc::new(transform),
        }
    }
}

impl fmt::Debug for FnImageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnImageProcessor")
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl ImageProcessor for FnImageProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(&self, item: &ImageItem, options: &RetrieveOptions) -> Option<Image> {
        match item {
            ImageItem::Image(image) => (self.transform)(image, options),
            ImageItem::Data(data) => {
                let image = options.decoder.decode(data, options.scale_factor)?;
                (self.transform)(&image, options)
            }
        }
    }
}

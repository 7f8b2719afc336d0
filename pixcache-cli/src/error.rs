use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] pixcache::EngineError),

    #[error("Image error: {0}")]
    Image(#[from] pixcache::ImageError),

    #[error("Cache error: {0}")]
    Cache(#[from] pixcache::CacheError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("{failed} of {total} images could not be retrieved")]
    Incomplete { failed: usize, total: usize },
}

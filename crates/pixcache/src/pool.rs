//! Bounded pool for CPU-bound decode and transform work.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

/// Runs blocking closures with at most `size` of them in flight.
#[derive(Debug, Clone)]
pub struct ProcessingPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl ProcessingPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `work` on the blocking thread pool once a slot is free.
    ///
    /// Returns `None` if the work panicked or the pool was closed.
    pub async fn run<F, T>(&self, work: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await;
        match joined {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Processing work did not complete");
                None
            }
        }
    }
}

impl Default for ProcessingPool {
    fn default() -> Self {
        let size = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(4);
        Self::new(size)
    }
}

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::registry::{CancelToken, TaskRegistry};
use crate::error::ImageError;

#[derive(Default)]
struct TaskSlot {
    current: Option<CancelToken>,
    cancelled: bool,
}

/// Handle to a running retrieval.
///
/// The handle follows the retrieval across retries and alternative sources;
/// cancelling it detaches the caller from whichever transfer is current.
#[derive(Clone)]
pub struct DownloadTask {
    key: String,
    registry: TaskRegistry,
    slot: Arc<Mutex<TaskSlot>>,
    cancellation: CancellationToken,
}

impl DownloadTask {
    pub(crate) fn new(key: impl Into<String>, registry: TaskRegistry) -> Self {
        Self {
            key: key.into(),
            registry,
            slot: Arc::new(Mutex::new(TaskSlot::default())),
            cancellation: CancellationToken::new(),
        }
    }

    /// Cache key of the retrieval
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cancel this caller's retrieval. Other callers sharing the transfer are unaffected.
    pub fn cancel(&self) {
        let current = {
            let mut slot = self.slot.lock();
            if slot.cancelled {
                return;
            }
            slot.cancelled = true;
            slot.current.take()
        };
        self.cancellation.cancel();
        if let Some(token) = current {
            self.registry.cancel(&token);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.lock().cancelled
    }

    /// Completes once the task is cancelled
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// The transfer ticket of the current attempt
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.slot.lock().current.clone()
    }

    /// Register the next attempt, unless the task was already cancelled.
    pub(crate) fn attach<F>(&self, start: F) -> Result<(), ImageError>
    where
        F: FnOnce() -> Result<CancelToken, ImageError>,
    {
        let mut slot = self.slot.lock();
        if slot.cancelled {
            return Err(ImageError::cancelled(self.key.clone()));
        }
        slot.current = Some(start()?);
        Ok(())
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("key", &self.key)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

//! # Prefetcher
//!
//! Warms the cache for a list of sources with bounded concurrency. Sources
//! already cached are skipped; the rest are retrieved through the manager so
//! they share transfers with regular callers.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::CacheType;
use crate::manager::ImageManager;
use crate::options::{CallbackQueue, RetrieveOptions};
use crate::source::Source;

/// Default number of sources retrieved at once
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 5;

/// Outcome of a prefetch run
#[derive(Debug, Clone, Default)]
pub struct PrefetchSummary {
    /// Already cached
    pub skipped: Vec<Source>,
    /// Failed or stopped before finishing
    pub failed: Vec<Source>,
    /// Retrieved and cached
    pub completed: Vec<Source>,
}

impl PrefetchSummary {
    pub fn total(&self) -> usize {
        self.skipped.len() + self.failed.len() + self.completed.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Skipped,
    Failed,
    Completed,
}

/// Prefetches a fixed list of sources.
#[derive(Clone)]
pub struct ImagePrefetcher {
    manager: ImageManager,
    sources: Vec<Source>,
    options: RetrieveOptions,
    max_concurrent_downloads: usize,
    stop: CancellationToken,
    progress: Arc<Mutex<PrefetchSummary>>,
}

impl ImagePrefetcher {
    pub fn new(manager: ImageManager, sources: Vec<Source>, options: RetrieveOptions) -> Self {
        Self {
            manager,
            sources,
            options,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            stop: CancellationToken::new(),
            progress: Arc::new(Mutex::new(PrefetchSummary::default())),
        }
    }

    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = max.max(1);
        self
    }

    /// Stop the run. Unfinished sources are reported as failed.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Snapshot of the sources finished so far
    pub fn progress(&self) -> PrefetchSummary {
        self.progress.lock().clone()
    }

    /// Run to completion and return the summary.
    pub async fn run(&self) -> PrefetchSummary {
        info!(
            sources = self.sources.len(),
            concurrency = self.max_concurrent_downloads,
            "Starting prefetch"
        );

        futures::stream::iter(self.sources.iter().cloned())
            .map(|source| async move {
                let outcome = self.prefetch_one(&source).await;
                self.record(source, outcome);
            })
            .buffer_unordered(self.max_concurrent_downloads)
            .collect::<()>()
            .await;

        let summary = self.progress();
        info!(
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            completed = summary.completed.len(),
            "Prefetch finished"
        );
        summary
    }

    /// Run in the background and hand the summary to `completion`.
    pub fn start<F>(&self, completion: F) -> JoinHandle<()>
    where
        F: FnOnce(PrefetchSummary) + Send + 'static,
    {
        let prefetcher = self.clone();
        tokio::spawn(async move {
            let summary = prefetcher.run().await;
            completion(summary);
        })
    }

    fn record(&self, source: Source, outcome: Outcome) {
        let mut progress = self.progress.lock();
        match outcome {
            Outcome::Skipped => progress.skipped.push(source),
            Outcome::Failed => progress.failed.push(source),
            Outcome::Completed => progress.completed.push(source),
        }
    }

    async fn prefetch_one(&self, source: &Source) -> Outcome {
        if self.stop.is_cancelled() {
            return Outcome::Failed;
        }

        if !self.options.force_refresh {
            let identifier = self.options.processor_identifier();
            match self.manager.cached_status(source, identifier) {
                CacheType::Memory => return Outcome::Skipped,
                CacheType::Disk if !self.options.also_prefetch_to_memory => {
                    return Outcome::Skipped;
                }
                CacheType::Disk => {
                    // Promote to memory; the read itself counts as the skip.
                    if let Err(e) = self
                        .manager
                        .cache()
                        .retrieve_image(source.cache_key(), &self.options)
                        .await
                    {
                        debug!(key = source.cache_key(), error = %e, "Failed to load disk entry into memory");
                    }
                    return Outcome::Skipped;
                }
                CacheType::None => {}
            }
        }

        let (tx, rx) = oneshot::channel();
        let options = self.options.clone().with_callback_queue(CallbackQueue::Inline);
        let task = self.manager.retrieve(source.clone(), options, move |result| {
            let _ = tx.send(result);
        });

        tokio::select! {
            result = rx => match result {
                Ok(Ok(_)) => Outcome::Completed,
                Ok(Err(e)) => {
                    debug!(key = source.cache_key(), error = %e, "Prefetch failed");
                    Outcome::Failed
                }
                Err(_) => Outcome::Failed,
            },
            _ = self.stop.cancelled() => {
                if let Some(task) = task {
                    task.cancel();
                }
                Outcome::Failed
            }
        }
    }
}

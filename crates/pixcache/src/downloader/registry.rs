//! # Task Registry
//!
//! Coalesces concurrent fetches of one key into a single transfer. Every
//! caller that joins gets its own [`CancelToken`]; the transfer is aborted
//! only when the last caller detaches.
//!
//! All registry mutation happens under one lock. Processing and callback
//! invocation happen after the entry was purged, outside the lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info};
use url::Url;

use crate::bitmap::Image;
use crate::error::{ImageError, ProcessorError};
use crate::options::RetrieveOptions;
use crate::pool::ProcessingPool;
use crate::processor::ImageItem;

/// Raw bytes produced by a transfer
#[derive(Debug, Clone)]
pub struct FetchedData {
    pub data: Bytes,
    pub url: Option<Url>,
}

/// A transfer's result after processing for one caller
#[derive(Debug, Clone)]
pub struct ImageLoadingResult {
    pub image: Image,
    pub url: Option<Url>,
    pub original_data: Bytes,
}

pub type FetchFuture = BoxFuture<'static, Result<FetchedData, ImageError>>;

type Completion = Box<dyn FnOnce(Result<ImageLoadingResult, ImageError>) + Send>;

/// A caller waiting on a transfer, with the options its result is processed with.
pub struct SessionCallback {
    options: RetrieveOptions,
    completion: Completion,
}

impl SessionCallback {
    pub fn new<F>(options: RetrieveOptions, completion: F) -> Self
    where
        F: FnOnce(Result<ImageLoadingResult, ImageError>) + Send + 'static,
    {
        Self {
            options,
            completion: Box::new(completion),
        }
    }

    fn deliver(self, result: Result<ImageLoadingResult, ImageError>) {
        (self.completion)(result)
    }
}

impl fmt::Debug for SessionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallback")
            .field("processor", &self.options.processor_identifier())
            .finish_non_exhaustive()
    }
}

/// Ticket identifying one caller of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelToken {
    key: String,
    transfer_id: u64,
    token: u64,
}

impl CancelToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

struct Transfer {
    id: u64,
    callbacks: Vec<(u64, SessionCallback)>,
    abort: Option<AbortHandle>,
}

struct RegistryInner {
    transfers: Mutex<HashMap<String, Transfer>>,
    next_id: AtomicU64,
    pool: ProcessingPool,
    runtime: Handle,
}

/// Download coalescer
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

impl TaskRegistry {
    pub fn new(pool: ProcessingPool, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transfers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                pool,
                runtime,
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start a transfer for `key`, or join the one in flight.
    ///
    /// `fetch` is only called when a new transfer is created.
    pub fn start<F>(&self, key: &str, fetch: F, callback: SessionCallback) -> CancelToken
    where
        F: FnOnce() -> FetchFuture,
    {
        let token = self.next_id();
        let mut transfers = self.inner.transfers.lock();

        if let Some(transfer) = transfers.get_mut(key) {
            transfer.callbacks.push((token, callback));
            debug!(key, waiting = transfer.callbacks.len(), "Joined in-flight transfer");
            return CancelToken {
                key: key.to_string(),
                transfer_id: transfer.id,
                token,
            };
        }

        let transfer_id = self.next_id();
        let registry = self.clone();
        let owned_key = key.to_string();
        let future = fetch();
        // Completion takes the same lock, so it cannot observe the entry before
        // the abort handle is stored.
        let handle = self.inner.runtime.spawn(async move {
            let outcome = future.await;
            registry.complete(&owned_key, transfer_id, outcome).await;
        });
        transfers.insert(
            key.to_string(),
            Transfer {
                id: transfer_id,
                callbacks: vec![(token, callback)],
                abort: Some(handle.abort_handle()),
            },
        );
        debug!(key, "Started transfer");

        CancelToken {
            key: key.to_string(),
            transfer_id,
            token,
        }
    }

    /// Detach one caller. Its callback receives `TaskCancelled`.
    ///
    /// The transfer is aborted when no callers remain. Tokens of finished
    /// transfers are ignored.
    pub fn cancel(&self, token: &CancelToken) {
        let callback = {
            let mut transfers = self.inner.transfers.lock();
            let Some(transfer) = transfers.get_mut(&token.key) else {
                return;
            };
            if transfer.id != token.transfer_id {
                return;
            }
            let Some(position) = transfer.callbacks.iter().position(|(t, _)| *t == token.token)
            else {
                return;
            };
            let (_, callback) = transfer.callbacks.remove(position);
            let remaining = transfer.callbacks.len();

            if remaining == 0 {
                if let Some(transfer) = transfers.remove(&token.key) {
                    if let Some(abort) = transfer.abort {
                        abort.abort();
                    }
                }
                info!(key = %token.key, "Aborted transfer with no remaining callers");
            } else {
                debug!(key = %token.key, remaining, "Caller detached from transfer");
            }
            callback
        };

        callback.deliver(Err(ImageError::cancelled(token.key.clone())));
    }

    /// Number of transfers in flight
    pub fn active_transfers(&self) -> usize {
        self.inner.transfers.lock().len()
    }

    /// Whether a transfer for `key` is in flight
    pub fn is_running(&self, key: &str) -> bool {
        self.inner.transfers.lock().contains_key(key)
    }

    async fn complete(&self, key: &str, transfer_id: u64, outcome: Result<FetchedData, ImageError>) {
        let callbacks = {
            let mut transfers = self.inner.transfers.lock();
            match transfers.get(key) {
                Some(transfer) if transfer.id == transfer_id => transfers
                    .remove(key)
                    .map(|transfer| transfer.callbacks)
                    .unwrap_or_default(),
                _ => return,
            }
        };

        let fetched = match outcome {
            Ok(fetched) => fetched,
            Err(error) => {
                debug!(key, error = %error, callbacks = callbacks.len(), "Transfer failed");
                for (_, callback) in callbacks {
                    callback.deliver(Err(error.clone()));
                }
                return;
            }
        };

        debug!(key, bytes = fetched.data.len(), callbacks = callbacks.len(), "Transfer finished");

        let mut processed: HashMap<String, Option<Image>> = HashMap::new();
        for (_, callback) in callbacks {
            let identifier = callback.options.processor_identifier().to_string();
            let image = match processed.get(&identifier) {
                Some(image) => image.clone(),
                None => {
                    let image = self.process(&fetched.data, &callback.options).await;
                    processed.insert(identifier.clone(), image.clone());
                    image
                }
            };

            let result = match image {
                Some(image) => Ok(ImageLoadingResult {
                    image,
                    url: fetched.url.clone(),
                    original_data: fetched.data.clone(),
                }),
                None => Err(ProcessorError::ProcessingFailed {
                    identifier,
                    item: ImageItem::Data(fetched.data.clone()).describe(),
                }
                .into()),
            };
            callback.deliver(result);
        }
    }

    async fn process(&self, data: &Bytes, options: &RetrieveOptions) -> Option<Image> {
        let pool = options
            .processing_pool
            .clone()
            .unwrap_or_else(|| self.inner.pool.clone());
        let data = data.clone();
        let options = options.clone();
        pool.run(move || {
            let image = options
                .processor
                .process(&ImageItem::Data(data), &options)?;
            if options.background_decode {
                Some(image.decoded())
            } else {
                Some(image)
            }
        })
        .await
        .flatten()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("active_transfers", &self.active_transfers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::tests::png_bytes;
    use crate::processor::FnImageProcessor;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{Notify, mpsc};

    fn registry() -> TaskRegistry {
        TaskRegistry::new(ProcessingPool::new(2), Handle::current())
    }

    fn gated_fetch(
        gate: Arc<Notify>,
        calls: Arc<AtomicUsize>,
        data: Bytes,
    ) -> impl FnOnce() -> FetchFuture {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                gate.notified().await;
                Ok(FetchedData { data, url: None })
            }
            .boxed()
        }
    }

    type Tx = mpsc::UnboundedSender<(usize, Result<ImageLoadingResult, ImageError>)>;

    fn callback(tx: &Tx, index: usize, options: RetrieveOptions) -> SessionCallback {
        let tx = tx.clone();
        SessionCallback::new(options, move |result| {
            let _ = tx.send((index, result));
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_joins_share_one_transfer_in_order() {
        let registry = registry();
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..3 {
            registry.start(
                "k",
                gated_fetch(Arc::clone(&gate), Arc::clone(&calls), png_bytes(2, 2)),
                callback(&tx, i, RetrieveOptions::default()),
            );
        }
        assert_eq!(registry.active_transfers(), 1);
        gate.notify_one();

        for expected in 0..3 {
            let (index, result) = rx.recv().await.unwrap();
            assert_eq!(index, expected);
            assert_eq!(result.unwrap().image.width(), 2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!registry.is_running("k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_partial_cancel_keeps_transfer() {
        let registry = registry();
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = registry.start(
            "k",
            gated_fetch(Arc::clone(&gate), Arc::clone(&calls), png_bytes(1, 1)),
            callback(&tx, 0, RetrieveOptions::default()),
        );
        registry.start(
            "k",
            gated_fetch(Arc::clone(&gate), Arc::clone(&calls), png_bytes(1, 1)),
            callback(&tx, 1, RetrieveOptions::default()),
        );

        registry.cancel(&first);
        let (index, result) = rx.recv().await.unwrap();
        assert_eq!(index, 0);
        assert!(result.unwrap_err().is_task_cancelled());
        assert!(registry.is_running("k"));

        // A second cancel of the same token is a no-op.
        registry.cancel(&first);

        gate.notify_one();
        let (index, result) = rx.recv().await.unwrap();
        assert_eq!(index, 1);
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelling_every_caller_aborts() {
        let registry = registry();
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tokens: Vec<_> = (0..2)
            .map(|i| {
                registry.start(
                    "k",
                    gated_fetch(Arc::clone(&gate), Arc::clone(&calls), png_bytes(1, 1)),
                    callback(&tx, i, RetrieveOptions::default()),
                )
            })
            .collect();
        for token in &tokens {
            registry.cancel(token);
        }
        drop(tx);

        let mut cancelled = 0;
        while let Some((_, result)) = rx.recv().await {
            assert!(result.unwrap_err().is_task_cancelled());
            cancelled += 1;
        }
        assert_eq!(cancelled, 2);
        assert!(!registry.is_running("k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_each_identifier_processed_once() {
        let registry = registry();
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let counted = {
            let runs = Arc::clone(&runs);
            Arc::new(FnImageProcessor::new("counted", move |image, _| {
                runs.fetch_add(1, Ordering::SeqCst);
                Some(image.clone())
            }))
        };
        let failing = Arc::new(FnImageProcessor::new("failing", |_, _| None));

        let option_sets = [
            RetrieveOptions::default().with_processor(counted.clone()),
            RetrieveOptions::default().with_processor(failing),
            RetrieveOptions::default().with_processor(counted),
            RetrieveOptions::default(),
        ];
        for (i, options) in option_sets.into_iter().enumerate() {
            registry.start(
                "k",
                gated_fetch(Arc::clone(&gate), Arc::clone(&calls), png_bytes(2, 2)),
                callback(&tx, i, options),
            );
        }
        gate.notify_one();

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            let (index, result) = rx.recv().await.unwrap();
            outcomes.push((index, result.is_ok()));
        }
        assert_eq!(outcomes, vec![(0, true), (1, false), (2, true), (3, true)]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}

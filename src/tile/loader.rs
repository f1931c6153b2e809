//! Async tile loading with bounded concurrency
//!
//! Fetch + decode run on tokio tasks. Results travel back over a channel and
//! are only observed when the owner calls [`TileRequester::poll`], which keeps
//! every cache mutation on the caller's thread.

use std::collections::HashSet;
use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::core::{Error, Result};
use crate::tile::fetch::{FetchError, TileFetcher};
use crate::tile::key::GeoKey;

/// A finished fetch, successful or not
#[derive(Debug)]
pub struct FetchCompletion {
    pub key: GeoKey,
    pub result: std::result::Result<RgbaImage, FetchError>,
}

/// Something that can fetch tiles in the background on the cache's behalf
pub trait TileRequester {
    /// Begin fetching `key`. Must return immediately.
    fn request(&mut self, key: GeoKey);

    /// Drain completions that arrived since the last call. Non-blocking.
    fn poll(&mut self) -> Vec<FetchCompletion>;
}

/// Worker parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// Maximum fetches in flight at once
    pub max_concurrent: usize,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self { max_concurrent: 8 }
    }
}

/// Concurrent tile loader backed by a [`TileFetcher`]
pub struct TileLoader<F: TileFetcher> {
    /// Channel for sending keys to the worker
    request_tx: mpsc::UnboundedSender<GeoKey>,
    /// Channel for receiving completions
    result_rx: mpsc::UnboundedReceiver<FetchCompletion>,
    /// Keys currently being fetched
    pending: HashSet<GeoKey>,
    /// Requests that could not reach the worker, reported on the next poll
    undeliverable: Vec<FetchCompletion>,
    fetcher: Arc<F>,
    /// Dedicated runtime (None when spawned on the caller's runtime)
    #[allow(dead_code)]
    runtime: Option<Runtime>,
}

impl<F: TileFetcher> TileLoader<F> {
    /// Create a loader with its own multi-threaded tokio runtime.
    pub fn new(fetcher: F, settings: &LoaderSettings) -> Result<Self> {
        let runtime = Runtime::new()
            .map_err(|e| Error::Runtime(format!("failed to create tokio runtime: {}", e)))?;

        let fetcher = Arc::new(fetcher);
        let (request_tx, request_rx) = mpsc::unbounded_channel::<GeoKey>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<FetchCompletion>();

        runtime.spawn(Self::worker_loop(
            fetcher.clone(),
            settings.max_concurrent.max(1),
            request_rx,
            result_tx,
        ));

        Ok(Self {
            request_tx,
            result_rx,
            pending: HashSet::new(),
            undeliverable: Vec::new(),
            fetcher,
            runtime: Some(runtime),
        })
    }

    /// Create a loader on the current tokio runtime.
    ///
    /// Panics if called outside a tokio runtime context.
    pub fn new_with_current_runtime(fetcher: F, settings: &LoaderSettings) -> Self {
        let fetcher = Arc::new(fetcher);
        let (request_tx, request_rx) = mpsc::unbounded_channel::<GeoKey>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<FetchCompletion>();

        tokio::spawn(Self::worker_loop(
            fetcher.clone(),
            settings.max_concurrent.max(1),
            request_rx,
            result_tx,
        ));

        Self {
            request_tx,
            result_rx,
            pending: HashSet::new(),
            undeliverable: Vec::new(),
            fetcher,
            runtime: None,
        }
    }

    /// Worker loop that dispatches fetches with concurrency control.
    ///
    /// Coarser levels are dispatched first: they cover more ground and feed
    /// the fallback chain of everything beneath them.
    async fn worker_loop(
        fetcher: Arc<F>,
        max_concurrent: usize,
        mut request_rx: mpsc::UnboundedReceiver<GeoKey>,
        result_tx: mpsc::UnboundedSender<FetchCompletion>,
    ) {
        let mut active_tasks = JoinSet::new();
        let mut queued: Vec<GeoKey> = Vec::new();
        let mut accepting = true;

        loop {
            tokio::select! {
                request = request_rx.recv(), if accepting => {
                    match request {
                        Some(key) => queued.push(key),
                        None => accepting = false,
                    }
                }

                Some(joined) = active_tasks.join_next(), if !active_tasks.is_empty() => {
                    match joined {
                        Ok(completion) => {
                            if result_tx.send(completion).is_err() {
                                // Loader dropped; nobody is listening any more
                                break;
                            }
                        }
                        Err(e) => log::error!("Tile fetch supervisor failed: {}", e),
                    }
                }

                else => {
                    if queued.is_empty() {
                        break;
                    }
                }
            }

            while active_tasks.len() < max_concurrent && !queued.is_empty() {
                let next = queued
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, key)| key.level)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let key = queued.remove(next);

                let fetcher = fetcher.clone();
                active_tasks.spawn(async move {
                    // A panicking fetcher must still produce a completion or the
                    // cache would wait on this key forever.
                    match tokio::spawn(Self::fetch_task(fetcher, key)).await {
                        Ok(completion) => completion,
                        Err(e) => {
                            log::error!("Tile fetch task for {} failed: {}", key, e);
                            FetchCompletion { key, result: Err(FetchError::Cancelled(key)) }
                        }
                    }
                });
            }
        }
    }

    /// Fetch one tile and decode it to RGBA8 off the async threads.
    async fn fetch_task(fetcher: Arc<F>, key: GeoKey) -> FetchCompletion {
        let result = match fetcher.fetch(key).await {
            Ok(bytes) => tokio::task::spawn_blocking(move || decode_tile(key, &bytes))
                .await
                .unwrap_or_else(|e| Err(FetchError::Decode { key, message: e.to_string() })),
            Err(e) => Err(e),
        };
        FetchCompletion { key, result }
    }

    /// Request a tile
    ///
    /// Returns `false` if the tile is already pending, `true` if the request was queued.
    pub fn request_tile(&mut self, key: GeoKey) -> bool {
        if self.pending.contains(&key) {
            return false;
        }
        self.pending.insert(key);

        if self.request_tx.send(key).is_err() {
            log::error!("Tile loader worker is gone; failing fetch for {}", key);
            self.undeliverable.push(FetchCompletion {
                key,
                result: Err(FetchError::Cancelled(key)),
            });
        }
        true
    }

    /// Get the number of pending fetches
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if a specific tile is currently pending
    pub fn is_pending(&self, key: GeoKey) -> bool {
        self.pending.contains(&key)
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }
}

impl<F: TileFetcher> TileRequester for TileLoader<F> {
    fn request(&mut self, key: GeoKey) {
        self.request_tile(key);
    }

    fn poll(&mut self) -> Vec<FetchCompletion> {
        let mut results = std::mem::take(&mut self.undeliverable);
        while let Ok(completion) = self.result_rx.try_recv() {
            results.push(completion);
        }
        for completion in &results {
            self.pending.remove(&completion.key);
        }
        results
    }
}

/// Decode encoded image bytes into an RGBA8 tile
pub fn decode_tile(key: GeoKey, bytes: &[u8]) -> std::result::Result<RgbaImage, FetchError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|e| FetchError::Decode { key, message: e.to_string() })
}

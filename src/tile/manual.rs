//! Hand-driven [`TileRequester`]
//!
//! Records requests and hands back whatever completions the owner stages.
//! Used for deterministic simulations, benchmarks and tests where no real
//! I/O should happen.

use std::collections::VecDeque;

use image::RgbaImage;

use crate::tile::fetch::FetchError;
use crate::tile::key::GeoKey;
use crate::tile::loader::{FetchCompletion, TileRequester};

#[derive(Debug, Default)]
pub struct ManualRequester {
    requested: Vec<GeoKey>,
    staged: VecDeque<FetchCompletion>,
}

impl ManualRequester {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key requested so far, in order.
    pub fn requested(&self) -> &[GeoKey] {
        &self.requested
    }

    /// How many times `key` has been requested.
    pub fn request_count(&self, key: GeoKey) -> usize {
        self.requested.iter().filter(|k| **k == key).count()
    }

    /// Stage a successful fetch for the next poll.
    pub fn succeed(&mut self, key: GeoKey, image: RgbaImage) {
        self.staged.push_back(FetchCompletion { key, result: Ok(image) });
    }

    /// Stage a failed fetch for the next poll.
    pub fn fail(&mut self, key: GeoKey) {
        self.staged.push_back(FetchCompletion {
            key,
            result: Err(FetchError::NotFound(key)),
        });
    }
}

impl TileRequester for ManualRequester {
    fn request(&mut self, key: GeoKey) {
        self.requested.push(key);
    }

    fn poll(&mut self) -> Vec<FetchCompletion> {
        self.staged.drain(..).collect()
    }
}

//! Tile addressing, fetching and caching

pub mod key;
pub mod resource;
pub mod fetch;
pub mod budget;
pub mod loader;
pub mod manual;
pub mod cache;

pub use key::{GeoKey, KeyError, MAX_KEY_LEVEL};
pub use resource::{DEFAULT_TILE_SIZE, TileOrigin, TileResource, synthesize_fallback};
pub use fetch::{
    ConfiguredFetcher, FetchError, LocalTileFetcher, MemoryTileFetcher, TileFetcher,
    TileSourceConfig,
};
#[cfg(feature = "remote")]
pub use fetch::RemoteTileFetcher;
pub use budget::MemoryBudget;
pub use loader::{FetchCompletion, LoaderSettings, TileLoader, TileRequester};
pub use manual::ManualRequester;
pub use cache::{
    CacheEntry, CacheKey, CacheSettings, CacheStats, ConsistencyIssue, ConsistencyReport,
    EntryStatus, Resolution, SweepStats, TileCache, TileUpdate,
};

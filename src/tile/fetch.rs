//! Tile byte sources
//!
//! A [`TileFetcher`] turns a [`GeoKey`] into encoded image bytes. Two backends
//! ship with the crate: a directory tree addressed by a path template, and a
//! remote quadkey-addressed tile service (behind the `remote` feature).

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Error, Result};
use crate::tile::key::GeoKey;

/// Default on-disk layout: `<root>/<level>/<col>/<row>/tile.png`.
pub const DEFAULT_PATH_TEMPLATE: &str = "{level}/{col}/{row}/tile.png";

/// Default remote service: Bing Maps aerial imagery addressed by quadkey.
pub const DEFAULT_URL_TEMPLATE: &str =
    "https://ecn.t0.tiles.virtualearth.net/tiles/a{quadkey}.jpeg?n=z&g=15368";

/// Why a tile could not be produced. Never fatal: the cache falls back to
/// coarser imagery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("tile {0} not found")]
    NotFound(GeoKey),

    #[error("IO error reading tile {key}: {message}")]
    Io { key: GeoKey, message: String },

    #[error("HTTP error fetching tile {key}: {message}")]
    Http { key: GeoKey, message: String },

    #[error("tile {key} answered with HTTP status {status}")]
    Status { key: GeoKey, status: u16 },

    #[error("failed to decode tile {key}: {message}")]
    Decode { key: GeoKey, message: String },

    #[error("fetch for tile {0} was cancelled")]
    Cancelled(GeoKey),
}

impl FetchError {
    /// The tile this error refers to.
    pub fn key(&self) -> GeoKey {
        match self {
            FetchError::NotFound(key) | FetchError::Cancelled(key) => *key,
            FetchError::Io { key, .. }
            | FetchError::Http { key, .. }
            | FetchError::Status { key, .. }
            | FetchError::Decode { key, .. } => *key,
        }
    }
}

/// Asynchronous source of encoded tile bytes
pub trait TileFetcher: Send + Sync + 'static {
    fn fetch(&self, key: GeoKey) -> impl Future<Output = std::result::Result<Vec<u8>, FetchError>> + Send;
}

/// Substitute `{level}`, `{col}`, `{row}` and `{quadkey}` (and the common
/// `{z}`, `{x}`, `{y}` aliases) in a path or URL template.
///
/// # Examples
/// ```
/// use terratile::tile::{GeoKey, fetch::expand_template};
///
/// let key = GeoKey::new(3, 3, 5);
/// assert_eq!(expand_template("{z}/{x}/{y}.png", key), "3/3/5.png");
/// assert_eq!(expand_template("a{quadkey}.jpeg", key), "a213.jpeg");
/// ```
pub fn expand_template(template: &str, key: GeoKey) -> String {
    let mut out = template
        .replace("{level}", &key.level.to_string())
        .replace("{col}", &key.col.to_string())
        .replace("{row}", &key.row.to_string())
        .replace("{z}", &key.level.to_string())
        .replace("{x}", &key.col.to_string())
        .replace("{y}", &key.row.to_string());
    if out.contains("{quadkey}") {
        out = out.replace("{quadkey}", &key.to_quadkey());
    }
    out
}

/// Where tile imagery comes from
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TileSourceConfig {
    /// Directory tree on local disk
    Local {
        root: PathBuf,
        #[serde(default = "default_path_template")]
        template: String,
    },
    /// HTTP tile service
    Remote {
        #[serde(default = "default_url_template")]
        url_template: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_path_template() -> String {
    DEFAULT_PATH_TEMPLATE.to_string()
}

fn default_url_template() -> String {
    DEFAULT_URL_TEMPLATE.to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

impl Default for TileSourceConfig {
    fn default() -> Self {
        TileSourceConfig::Local {
            root: PathBuf::from("assets/tiles"),
            template: default_path_template(),
        }
    }
}

/// Reads tiles from a directory tree
#[derive(Clone, Debug)]
pub struct LocalTileFetcher {
    root: PathBuf,
    template: String,
}

impl LocalTileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_template(root, DEFAULT_PATH_TEMPLATE)
    }

    pub fn with_template(root: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            template: template.into(),
        }
    }

    /// File path for a tile
    pub fn tile_path(&self, key: GeoKey) -> PathBuf {
        self.root.join(expand_template(&self.template, key))
    }
}

impl TileFetcher for LocalTileFetcher {
    fn fetch(&self, key: GeoKey) -> impl Future<Output = std::result::Result<Vec<u8>, FetchError>> + Send {
        let path = self.tile_path(key);
        async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound(key)),
                Err(e) => Err(FetchError::Io {
                    key,
                    message: format!("{}: {}", path.display(), e),
                }),
            }
        }
    }
}

/// Downloads tiles from an HTTP service
#[cfg(feature = "remote")]
#[derive(Clone, Debug)]
pub struct RemoteTileFetcher {
    client: reqwest::Client,
    url_template: String,
}

#[cfg(feature = "remote")]
impl RemoteTileFetcher {
    pub fn new(url_template: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Runtime(format!("http client init failed: {}", e)))?;
        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    pub fn tile_url(&self, key: GeoKey) -> String {
        expand_template(&self.url_template, key)
    }
}

#[cfg(feature = "remote")]
impl TileFetcher for RemoteTileFetcher {
    fn fetch(&self, key: GeoKey) -> impl Future<Output = std::result::Result<Vec<u8>, FetchError>> + Send {
        let request = self.client.get(self.tile_url(key));
        async move {
            let response = request.send().await.map_err(|e| FetchError::Http {
                key,
                message: e.to_string(),
            })?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound(key));
            }
            if !status.is_success() {
                return Err(FetchError::Status {
                    key,
                    status: status.as_u16(),
                });
            }

            let bytes = response.bytes().await.map_err(|e| FetchError::Http {
                key,
                message: e.to_string(),
            })?;
            Ok(bytes.to_vec())
        }
    }
}

/// Tiles held in memory. Handy for tests, benchmarks and baked-in imagery.
#[derive(Clone, Debug, Default)]
pub struct MemoryTileFetcher {
    tiles: HashMap<GeoKey, Vec<u8>>,
}

impl MemoryTileFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: GeoKey, bytes: Vec<u8>) {
        self.tiles.insert(key, bytes);
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

impl TileFetcher for MemoryTileFetcher {
    fn fetch(&self, key: GeoKey) -> impl Future<Output = std::result::Result<Vec<u8>, FetchError>> + Send {
        let found = self.tiles.get(&key).cloned();
        async move { found.ok_or(FetchError::NotFound(key)) }
    }
}

/// Fetcher chosen at runtime from a [`TileSourceConfig`]
#[derive(Clone, Debug)]
pub enum ConfiguredFetcher {
    Local(LocalTileFetcher),
    #[cfg(feature = "remote")]
    Remote(RemoteTileFetcher),
}

impl ConfiguredFetcher {
    pub fn from_config(config: &TileSourceConfig) -> Result<Self> {
        match config {
            TileSourceConfig::Local { root, template } => Ok(ConfiguredFetcher::Local(
                LocalTileFetcher::with_template(root.clone(), template.clone()),
            )),
            #[cfg(feature = "remote")]
            TileSourceConfig::Remote { url_template, timeout_secs } => {
                let timeout = std::time::Duration::from_secs(*timeout_secs);
                Ok(ConfiguredFetcher::Remote(RemoteTileFetcher::new(url_template.clone(), timeout)?))
            }
            #[cfg(not(feature = "remote"))]
            TileSourceConfig::Remote { .. } => Err(Error::Config(
                "remote tile source requires the `remote` feature".into(),
            )),
        }
    }
}

impl TileFetcher for ConfiguredFetcher {
    fn fetch(&self, key: GeoKey) -> impl Future<Output = std::result::Result<Vec<u8>, FetchError>> + Send {
        async move {
            match self {
                ConfiguredFetcher::Local(fetcher) => fetcher.fetch(key).await,
                #[cfg(feature = "remote")]
                ConfiguredFetcher::Remote(fetcher) => fetcher.fetch(key).await,
            }
        }
    }
}

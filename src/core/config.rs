//! Top-level terrain configuration, stored as JSON.

use std::path::Path;

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};
use crate::lod::LodSettings;
use crate::tile::{CacheSettings, LoaderSettings, TileSourceConfig};

/// Earth's equatorial circumference in kilometres; the default root footprint.
pub const EARTH_CIRCUMFERENCE: f64 = 40075.017;

/// Everything needed to stand up a [`TerrainController`](crate::terrain::TerrainController).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Edge length of the root tile in world units.
    pub root_size: f64,
    /// World position of the terrain's (0, 0) corner. Subtracted from the
    /// viewpoint before LOD evaluation.
    pub terrain_offset: DVec3,
    /// Split/merge thresholds.
    pub lod: LodSettings,
    /// Tile cache parameters.
    pub cache: CacheSettings,
    /// Where tile imagery comes from.
    pub source: TileSourceConfig,
    /// Fetch worker parameters.
    pub loader: LoaderSettings,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            root_size: EARTH_CIRCUMFERENCE,
            terrain_offset: DVec3::ZERO,
            lod: LodSettings::default(),
            cache: CacheSettings::default(),
            source: TileSourceConfig::default(),
            loader: LoaderSettings::default(),
        }
    }
}

impl TerrainConfig {
    /// Load a config from a JSON file. Missing fields fall back to defaults
    /// and out-of-range values are clamped.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: TerrainConfig = serde_json::from_str(&json)?;
        config.validated()
    }

    /// Write the config as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Clamp tunables into range and reject values that cannot be repaired.
    pub fn validated(mut self) -> Result<Self> {
        if !(self.root_size.is_finite() && self.root_size > 0.0) {
            return Err(Error::Config(format!(
                "root_size must be a positive number, got {}",
                self.root_size
            )));
        }
        if self.cache.tile_size == 0 {
            return Err(Error::Config("cache.tile_size must be non-zero".into()));
        }
        self.lod = self.lod.sanitized();
        self.cache.sweep_interval = self.cache.sweep_interval.max(1);
        self.loader.max_concurrent = self.loader.max_concurrent.max(1);
        Ok(self)
    }
}

//! Tile image resources and fallback synthesis

use std::sync::{Arc, OnceLock};

use image::{Rgba, RgbaImage, imageops::FilterType};

use crate::tile::key::GeoKey;

/// Edge length of a standard pyramid tile in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Where a tile resource came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileOrigin {
    /// The tile's own imagery
    Exact,
    /// Cropped and upsampled from the ancestor at `source_level`
    Fallback { source_level: u8 },
    /// The shared empty tile
    Placeholder,
}

/// Shared, immutable tile image
///
/// Cloning is cheap; every clone points at the same pixels.
#[derive(Clone, Debug)]
pub struct TileResource {
    image: Arc<RgbaImage>,
    origin: TileOrigin,
}

impl TileResource {
    /// Wrap the imagery of an exactly matching tile.
    pub fn exact(image: RgbaImage) -> Self {
        Self {
            image: Arc::new(image),
            origin: TileOrigin::Exact,
        }
    }

    /// Wrap imagery synthesized from an ancestor tile.
    pub fn fallback(image: RgbaImage, source_level: u8) -> Self {
        Self {
            image: Arc::new(image),
            origin: TileOrigin::Fallback { source_level },
        }
    }

    /// The process-wide placeholder: a single opaque black pixel.
    pub fn placeholder() -> Self {
        static PLACEHOLDER: OnceLock<Arc<RgbaImage>> = OnceLock::new();
        let image = PLACEHOLDER
            .get_or_init(|| Arc::new(RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 255]))))
            .clone();
        Self {
            image,
            origin: TileOrigin::Placeholder,
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn origin(&self) -> TileOrigin {
        self.origin
    }

    pub fn is_placeholder(&self) -> bool {
        self.origin == TileOrigin::Placeholder
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Bytes of pixel storage (RGBA8).
    pub fn byte_size(&self) -> usize {
        self.image.as_raw().len()
    }

    /// Whether both handles share the same pixel buffer.
    pub fn same_image(&self, other: &TileResource) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

/// Build a `tile_size`² stand-in for `target` from the imagery of its
/// ancestor `source`.
///
/// The ancestor covers `2^(target.level - source.level)` target tiles per
/// edge; the matching sub-square is cropped (image origin top-left, rows
/// increasing southwards like tile rows) and upsampled by nearest neighbour.
/// Sources that are not `tile_size` square are first resized to it.
pub fn synthesize_fallback(
    source: &RgbaImage,
    source_key: GeoKey,
    target: GeoKey,
    tile_size: u32,
) -> RgbaImage {
    debug_assert!(source_key.level <= target.level);
    debug_assert_eq!(target.ancestor(source_key.level), Some(source_key));

    let resized;
    let source = if source.dimensions() == (tile_size, tile_size) {
        source
    } else {
        resized = image::imageops::resize(source, tile_size, tile_size, FilterType::Nearest);
        &resized
    };

    let factor = 1u64 << (target.level - source_key.level);
    let size = tile_size as u64;
    let sub_size = (size / factor).max(1);
    let crop_x = ((target.col as u64 % factor) * size / factor).min(size - sub_size);
    let crop_y = ((target.row as u64 % factor) * size / factor).min(size - sub_size);

    RgbaImage::from_fn(tile_size, tile_size, |x, y| {
        let sx = (x as u64 * sub_size / size).min(sub_size - 1);
        let sy = (y as u64 * sub_size / size).min(sub_size - 1);
        *source.get_pixel((crop_x + sx) as u32, (crop_y + sy) as u32)
    })
}

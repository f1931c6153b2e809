//! Tile pyramid addressing
//!
//! A [`GeoKey`] names one square of a power-of-two image pyramid: level `z`
//! has `2^z × 2^z` tiles, columns counting east from the west edge and rows
//! counting south from the north edge. Keys convert to and from quadrant-path
//! strings ("quadkeys"), one base-4 digit per level from coarsest to finest.

use std::fmt;

use thiserror::Error;

/// Deepest level a key can address (columns and rows must fit in `u32`).
pub const MAX_KEY_LEVEL: u8 = 30;

/// Errors produced when parsing a quadkey
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("quadkey digit '{digit}' at position {position} is not in 0..=3")]
    InvalidDigit { digit: char, position: usize },

    #[error("quadkey has {0} digits, more than the supported maximum")]
    TooDeep(usize),
}

/// Level/column/row address of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeoKey {
    pub level: u8,
    pub col: u32,
    pub row: u32,
}

impl GeoKey {
    pub fn new(level: u8, col: u32, row: u32) -> Self {
        Self { level, col, row }
    }

    /// The single tile covering the whole pyramid.
    pub fn root() -> Self {
        Self::new(0, 0, 0)
    }

    /// Number of tiles along one edge at this key's level.
    pub fn tiles_per_edge(&self) -> u64 {
        1u64 << self.level
    }

    /// Whether column and row lie inside the level's grid.
    pub fn is_valid(&self) -> bool {
        self.level <= MAX_KEY_LEVEL
            && (self.col as u64) < self.tiles_per_edge()
            && (self.row as u64) < self.tiles_per_edge()
    }

    /// The tile one level up that contains this one.
    pub fn parent(&self) -> Option<GeoKey> {
        if self.level == 0 {
            None
        } else {
            Some(GeoKey::new(self.level - 1, self.col / 2, self.row / 2))
        }
    }

    /// The tile at `level` containing this one. Returns `None` when `level`
    /// is finer than the key itself.
    pub fn ancestor(&self, level: u8) -> Option<GeoKey> {
        if level > self.level {
            return None;
        }
        let shift = self.level - level;
        Some(GeoKey::new(level, self.col >> shift, self.row >> shift))
    }

    /// The four tiles one level down, in quadkey digit order
    /// (top-left, top-right, bottom-left, bottom-right).
    ///
    /// The quadtree orders its children by footprint instead, south row
    /// first; see `lod::child_keys`. Both cover the same four tiles.
    pub fn children(&self) -> [GeoKey; 4] {
        let level = self.level + 1;
        let (c, r) = (self.col * 2, self.row * 2);
        [
            GeoKey::new(level, c, r),
            GeoKey::new(level, c + 1, r),
            GeoKey::new(level, c, r + 1),
            GeoKey::new(level, c + 1, r + 1),
        ]
    }

    /// Encode as a quadrant path of `level` digits.
    ///
    /// # Examples
    /// ```
    /// use terratile::tile::GeoKey;
    ///
    /// assert_eq!(GeoKey::new(0, 0, 0).to_quadkey(), "");
    /// assert_eq!(GeoKey::new(1, 1, 0).to_quadkey(), "1");
    /// assert_eq!(GeoKey::new(3, 3, 5).to_quadkey(), "213");
    /// ```
    pub fn to_quadkey(&self) -> String {
        let mut quadkey = String::with_capacity(self.level as usize);
        for i in (1..=self.level).rev() {
            let mask = 1u32 << (i - 1);
            let mut digit = b'0';
            if self.col & mask != 0 {
                digit += 1;
            }
            if self.row & mask != 0 {
                digit += 2;
            }
            quadkey.push(digit as char);
        }
        quadkey
    }

    /// Decode a quadrant path back into a key. The level is the path length.
    pub fn from_quadkey(quadkey: &str) -> Result<GeoKey, KeyError> {
        let level = quadkey.chars().count();
        if level > MAX_KEY_LEVEL as usize {
            return Err(KeyError::TooDeep(level));
        }

        let mut col = 0u32;
        let mut row = 0u32;
        for (position, digit) in quadkey.chars().enumerate() {
            let quadrant = digit
                .to_digit(4)
                .ok_or(KeyError::InvalidDigit { digit, position })?;
            col = (col << 1) | (quadrant & 1);
            row = (row << 1) | (quadrant >> 1);
        }

        Ok(GeoKey::new(level as u8, col, row))
    }
}

impl fmt::Display for GeoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.level, self.col, self.row)
    }
}

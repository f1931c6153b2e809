//! LOD thresholds

use serde::{Deserialize, Serialize};

/// Thresholds driving split and merge decisions
///
/// A node's distance ratio is its distance to the viewpoint divided by its
/// diagonal, scaled by `distance_scale`. Below `split_ratio` the node wants
/// to split, above `merge_ratio` its parent wants to merge, and in between it
/// holds. The gap between the two ratios is what keeps nodes from flapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodSettings {
    pub split_ratio: f64,
    pub merge_ratio: f64,
    /// Weight of the vertical axis in distance (0 = ignore altitude)
    pub height_weight: f64,
    /// Deepest level a node may split to
    pub max_level: u8,
    pub distance_scale: f64,
    /// Splits allowed per tick
    pub split_budget: u32,
}

impl Default for LodSettings {
    fn default() -> Self {
        Self {
            split_ratio: 2.0,
            merge_ratio: 3.0,
            height_weight: 0.2,
            max_level: 15,
            distance_scale: 2.0,
            split_budget: 2,
        }
    }
}

impl LodSettings {
    /// Clamp every field into its usable range.
    ///
    /// `merge_ratio` always ends up at least 0.01 above `split_ratio`.
    pub fn sanitized(self) -> Self {
        let split_ratio = if self.split_ratio.is_finite() {
            self.split_ratio.max(0.01)
        } else {
            0.01
        };
        let merge_ratio = if self.merge_ratio.is_finite() {
            self.merge_ratio.max(split_ratio + 0.01)
        } else {
            split_ratio + 0.01
        };
        let height_weight = if self.height_weight.is_finite() {
            self.height_weight.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let distance_scale = if self.distance_scale.is_finite() {
            self.distance_scale.max(1.0)
        } else {
            1.0
        };

        Self {
            split_ratio,
            merge_ratio,
            height_weight,
            max_level: self.max_level.clamp(1, crate::tile::MAX_KEY_LEVEL),
            distance_scale,
            split_budget: self.split_budget,
        }
    }
}

//! Quadtree level of detail
//!
//! Decides, tick by tick, which square regions of the terrain need finer or
//! coarser detail relative to a viewpoint.

pub mod settings;
pub mod node;
pub mod event;
pub mod index;

pub use settings::LodSettings;
pub use node::{Footprint, Node, NodeArena, NodeId};
pub use event::{ChangeKind, LodEvent};
pub use index::{AdvanceStats, LodIndex, child_keys};

//! Terratile - streamed quadtree LOD terrain tiles

pub mod core;
pub mod lod;
pub mod tile;
pub mod terrain;

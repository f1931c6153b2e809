//! Streamed terrain: the LOD index and tile cache driven together

pub mod sink;
pub mod controller;

pub use sink::{NodeView, PresentationSink, RecordingSink, SinkCall, Surface, SurfaceTracker};
pub use controller::{TerrainController, TerrainStats, TickReport};

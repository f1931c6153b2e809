//! Presentation interface
//!
//! The controller tells a [`PresentationSink`] which surfaces to create,
//! retexture and tear down. Sinks only ever read what they are handed.

use std::collections::HashMap;

use glam::{DVec2, DVec3};

use crate::lod::{Footprint, Node, NodeId};
use crate::tile::{GeoKey, Resolution, TileOrigin, TileResource};

/// Snapshot of a node as seen by a sink
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeView {
    pub id: NodeId,
    pub key: GeoKey,
    pub footprint: Footprint,
    /// World position of the terrain's (0, 0) corner
    pub offset: DVec3,
}

impl NodeView {
    pub fn new(id: NodeId, node: &Node, offset: DVec3) -> Self {
        Self {
            id,
            key: node.geo_key,
            footprint: node.footprint,
            offset,
        }
    }

    /// Centre of the surface in world space, on the terrain plane.
    pub fn world_center(&self) -> DVec3 {
        let c: DVec2 = self.footprint.center();
        self.offset + DVec3::new(c.x, 0.0, c.y)
    }

    pub fn size(&self) -> f64 {
        self.footprint.size
    }
}

/// Consumer of surface lifecycle notifications
pub trait PresentationSink {
    /// Create a surface over `node` showing `resolution`'s imagery.
    fn node_became_leaf(&mut self, node: &NodeView, resolution: &Resolution);

    /// Tear down `node`'s own surface; its children arrive as new leaves.
    fn node_became_branch(&mut self, node: &NodeView);

    /// Tear down every surface in a detached subtree. `nodes[0]` is the
    /// subtree root, the rest follow in pre-order.
    fn subtree_removed(&mut self, nodes: &[NodeView]);

    /// Replace the imagery of a live surface.
    fn tile_updated(&mut self, node: &NodeView, resource: &TileResource);
}

/// One recorded sink call
#[derive(Clone, Debug)]
pub enum SinkCall {
    BecameLeaf { node: NodeView, ready: bool, origin: TileOrigin },
    BecameBranch { node: NodeView },
    SubtreeRemoved { nodes: Vec<NodeView> },
    TileUpdated { node: NodeView, origin: TileOrigin },
}

/// Sink that records every call in order
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub calls: Vec<SinkCall>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Vec<SinkCall> {
        std::mem::take(&mut self.calls)
    }
}

impl PresentationSink for RecordingSink {
    fn node_became_leaf(&mut self, node: &NodeView, resolution: &Resolution) {
        self.calls.push(SinkCall::BecameLeaf {
            node: *node,
            ready: resolution.is_ready(),
            origin: resolution.resource().origin(),
        });
    }

    fn node_became_branch(&mut self, node: &NodeView) {
        self.calls.push(SinkCall::BecameBranch { node: *node });
    }

    fn subtree_removed(&mut self, nodes: &[NodeView]) {
        self.calls.push(SinkCall::SubtreeRemoved { nodes: nodes.to_vec() });
    }

    fn tile_updated(&mut self, node: &NodeView, resource: &TileResource) {
        self.calls.push(SinkCall::TileUpdated {
            node: *node,
            origin: resource.origin(),
        });
    }
}

/// A surface as a renderer would hold it
#[derive(Clone, Debug)]
pub struct Surface {
    pub view: NodeView,
    pub resource: TileResource,
}

/// Sink that keeps the set of live surfaces, like a renderer's scene would
#[derive(Debug, Default)]
pub struct SurfaceTracker {
    surfaces: HashMap<NodeId, Surface>,
    created: u64,
    destroyed: u64,
    retextured: u64,
}

impl SurfaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NodeId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Surface)> {
        self.surfaces.iter()
    }

    /// Surfaces showing their exact tile, a fallback, and the placeholder.
    pub fn origin_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for surface in self.surfaces.values() {
            match surface.resource.origin() {
                TileOrigin::Exact => counts.0 += 1,
                TileOrigin::Fallback { .. } => counts.1 += 1,
                TileOrigin::Placeholder => counts.2 += 1,
            }
        }
        counts
    }

    /// Lifetime totals: surfaces created, destroyed and retextured.
    pub fn totals(&self) -> (u64, u64, u64) {
        (self.created, self.destroyed, self.retextured)
    }

    fn destroy(&mut self, id: NodeId) {
        if self.surfaces.remove(&id).is_some() {
            self.destroyed += 1;
        }
    }
}

impl PresentationSink for SurfaceTracker {
    fn node_became_leaf(&mut self, node: &NodeView, resolution: &Resolution) {
        let surface = Surface {
            view: *node,
            resource: resolution.resource().clone(),
        };
        if self.surfaces.insert(node.id, surface).is_some() {
            log::warn!("Surface for {} created twice", node.key);
        }
        self.created += 1;
    }

    fn node_became_branch(&mut self, node: &NodeView) {
        self.destroy(node.id);
    }

    fn subtree_removed(&mut self, nodes: &[NodeView]) {
        for node in nodes {
            self.destroy(node.id);
        }
    }

    fn tile_updated(&mut self, node: &NodeView, resource: &TileResource) {
        match self.surfaces.get_mut(&node.id) {
            Some(surface) => {
                surface.resource = resource.clone();
                self.retextured += 1;
            }
            None => log::warn!("Tile update for {} without a surface", node.key),
        }
    }
}

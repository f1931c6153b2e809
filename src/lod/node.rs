//! Quadtree nodes and the arena that owns them

use glam::DVec2;

use crate::tile::GeoKey;

/// Generation-checked handle to a node in a [`NodeArena`]
///
/// A handle outlives the node it names; lookups through a stale handle fail
/// instead of returning whatever reused the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Axis-aligned square on the XZ plane
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Footprint {
    /// Minimum x and z corner
    pub origin: DVec2,
    /// Edge length in world units
    pub size: f64,
}

impl Footprint {
    pub fn new(origin: DVec2, size: f64) -> Self {
        Self { origin, size }
    }

    pub fn center(&self) -> DVec2 {
        self.origin + DVec2::splat(self.size * 0.5)
    }

    pub fn diagonal(&self) -> f64 {
        self.size * std::f64::consts::SQRT_2
    }

    pub fn area(&self) -> f64 {
        self.size * self.size
    }

    /// Whether `point` lies inside, min edges inclusive and max edges exclusive.
    pub fn contains(&self, point: DVec2) -> bool {
        point.x >= self.origin.x
            && point.y >= self.origin.y
            && point.x < self.origin.x + self.size
            && point.y < self.origin.y + self.size
    }

    /// Footprint of `key` within a root square of `root_size` anchored at
    /// the origin. Tile rows count from the far edge, so row 0 has the
    /// largest z.
    pub fn of_key(key: GeoKey, root_size: f64) -> Self {
        let tiles = key.tiles_per_edge() as f64;
        let size = root_size / tiles;
        let x = key.col as f64 * size;
        let z = (tiles - 1.0 - key.row as f64) * size;
        Self::new(DVec2::new(x, z), size)
    }

    /// The four quarters in child order: `(x, z)`, `(x+h, z)`, `(x, z+h)`,
    /// `(x+h, z+h)`.
    pub fn quarters(&self) -> [Footprint; 4] {
        let half = self.size * 0.5;
        let o = self.origin;
        [
            Footprint::new(o, half),
            Footprint::new(DVec2::new(o.x + half, o.y), half),
            Footprint::new(DVec2::new(o.x, o.y + half), half),
            Footprint::new(DVec2::new(o.x + half, o.y + half), half),
        ]
    }
}

/// One quadtree node
#[derive(Clone, Debug)]
pub struct Node {
    pub footprint: Footprint,
    pub geo_key: GeoKey,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Option<[NodeId; 4]>,
    /// Set when a merge detached this node from the tree
    pub(crate) pending_removal: bool,
}

impl Node {
    pub(crate) fn new(footprint: Footprint, geo_key: GeoKey, parent: Option<NodeId>) -> Self {
        Self {
            footprint,
            geo_key,
            parent,
            children: None,
            pending_removal: false,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> Option<&[NodeId; 4]> {
        self.children.as_ref()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn is_detached(&self) -> bool {
        self.pending_removal
    }

    pub fn level(&self) -> u8 {
        self.geo_key.level
    }

    pub fn size(&self) -> f64 {
        self.footprint.size
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Slot storage for nodes with a free list
#[derive(Debug, Default)]
pub struct NodeArena {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    live: usize,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId { index, generation: slot.generation };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, node: Some(node) });
        NodeId { index, generation: 0 }
    }

    /// Free a slot. The handle and every copy of it go stale.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(id.index);
        self.live -= 1;
        Some(node)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over every occupied slot.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|node| {
                (NodeId { index: index as u32, generation: slot.generation }, node)
            })
        })
    }

    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_slots.push(index as u32);
            }
        }
        self.live = 0;
    }
}

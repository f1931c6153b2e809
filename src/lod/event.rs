//! Node lifecycle events

use crate::lod::node::NodeId;

/// What happened to a node during a tick
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Node is now an active leaf and needs a surface
    BecameLeaf,
    /// Node was split; only its own surface goes away
    BecameBranch,
    /// Node and every descendant were detached by a merge
    RemovedSubtree,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LodEvent {
    pub node: NodeId,
    pub kind: ChangeKind,
}

impl LodEvent {
    pub fn new(node: NodeId, kind: ChangeKind) -> Self {
        Self { node, kind }
    }
}

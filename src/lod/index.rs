//! Adaptive quadtree level-of-detail index
//!
//! The active leaves form a frontier that is walked once per tick. Each leaf
//! either merges into its parent, splits into four children, or carries over
//! unchanged into the next tick's frontier. Splits are budgeted per tick so a
//! large viewpoint jump refines over several ticks instead of one long one.
//!
//! The index knows nothing about tiles; it reports what changed as a list of
//! [`LodEvent`]s.

use std::collections::VecDeque;

use glam::{DVec2, DVec3};

use crate::lod::event::{ChangeKind, LodEvent};
use crate::lod::node::{Footprint, Node, NodeArena, NodeId};
use crate::lod::settings::LodSettings;
use crate::tile::GeoKey;

/// Work done by one [`LodIndex::advance`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdvanceStats {
    /// Frontier entries examined
    pub visited: usize,
    pub splits: u32,
    pub merges: u32,
    /// Leaves that wanted to split but ran into the budget
    pub deferred_splits: u32,
    /// Frontier entries skipped because a merge had already detached them
    pub stale: usize,
    /// Detached nodes reclaimed at the start of the tick
    pub reclaimed: usize,
}

/// Quadtree over a square terrain footprint
pub struct LodIndex {
    settings: LodSettings,
    nodes: NodeArena,
    root: Option<NodeId>,
    current_frontier: VecDeque<NodeId>,
    next_frontier: VecDeque<NodeId>,
    /// Detached by a merge; freed at the start of the next advance
    detached: Vec<NodeId>,
    events: Vec<LodEvent>,
    splits_this_tick: u32,
    advancing: bool,
    last_stats: AdvanceStats,
}

impl LodIndex {
    pub fn new(settings: LodSettings) -> Self {
        Self {
            settings: settings.sanitized(),
            nodes: NodeArena::new(),
            root: None,
            current_frontier: VecDeque::new(),
            next_frontier: VecDeque::new(),
            detached: Vec::new(),
            events: Vec::new(),
            splits_this_tick: 0,
            advancing: false,
            last_stats: AdvanceStats::default(),
        }
    }

    /// Allocate the root leaf covering `[0, size)²` with tile `key`.
    ///
    /// Replaces any existing tree; the old root is reported as a removed
    /// subtree. The root's `BecameLeaf` event is delivered by the next
    /// [`advance`](Self::advance) or [`take_events`](Self::take_events).
    pub fn create_root(&mut self, size: f64, key: GeoKey) -> NodeId {
        if let Some(old_root) = self.root.take() {
            self.events.push(LodEvent::new(old_root, ChangeKind::RemovedSubtree));
            self.detach_subtree(old_root);
            self.current_frontier.clear();
            self.next_frontier.clear();
        }

        let footprint = Footprint::new(DVec2::ZERO, size);
        let root = self.nodes.insert(Node::new(footprint, key, None));
        self.root = Some(root);
        self.current_frontier.push_back(root);
        self.events.push(LodEvent::new(root, ChangeKind::BecameLeaf));
        log::info!("Created LOD root {} with size {:.3}", key, size);
        root
    }

    /// Set the split/merge thresholds. Values are clamped so that
    /// `merge_ratio > split_ratio` always holds.
    pub fn configure(
        &mut self,
        split_ratio: f64,
        merge_ratio: f64,
        height_weight: f64,
        max_level: u8,
        distance_scale: f64,
    ) {
        self.settings = LodSettings {
            split_ratio,
            merge_ratio,
            height_weight,
            max_level,
            distance_scale,
            split_budget: self.settings.split_budget,
        }
        .sanitized();
    }

    pub fn set_split_budget(&mut self, budget: u32) {
        self.settings.split_budget = budget;
    }

    pub fn settings(&self) -> &LodSettings {
        &self.settings
    }

    /// Run one tick of split/merge decisions for `viewpoint`.
    pub fn advance(&mut self, viewpoint: DVec3) -> Vec<LodEvent> {
        let mut stats = AdvanceStats {
            reclaimed: self.reclaim_detached(),
            ..Default::default()
        };

        self.splits_this_tick = 0;
        self.next_frontier.clear();
        self.advancing = true;

        while let Some(id) = self.current_frontier.pop_front() {
            let Some(node) = self.nodes.get(id) else {
                stats.stale += 1;
                continue;
            };
            if node.pending_removal || !node.is_leaf() {
                stats.stale += 1;
                continue;
            }
            stats.visited += 1;

            if let Some(parent_id) = node.parent {
                if self.parent_wants_merge(parent_id, viewpoint) {
                    self.merge(parent_id);
                    stats.merges += 1;
                    continue;
                }
            }

            let wants_split = node.size() > self.calculate_lod_size(node, viewpoint);
            if wants_split && self.splits_this_tick < self.settings.split_budget {
                if self.split(id) {
                    self.splits_this_tick += 1;
                    stats.splits += 1;
                } else {
                    self.next_frontier.push_back(id);
                }
            } else {
                if wants_split {
                    stats.deferred_splits += 1;
                }
                self.next_frontier.push_back(id);
            }
        }

        self.advancing = false;
        std::mem::swap(&mut self.current_frontier, &mut self.next_frontier);
        self.prune_frontier();

        log::trace!(
            "LOD advance: visited {}, {} splits ({} deferred), {} merges, {} leaves",
            stats.visited,
            stats.splits,
            stats.deferred_splits,
            stats.merges,
            self.current_frontier.len()
        );
        self.last_stats = stats;
        std::mem::take(&mut self.events)
    }

    /// Drain events queued outside of [`advance`](Self::advance), such as the
    /// root's creation.
    pub fn take_events(&mut self) -> Vec<LodEvent> {
        std::mem::take(&mut self.events)
    }

    /// Edge length `node` should have as seen from `viewpoint`.
    ///
    /// Returns half the node's size when it should split, double when it
    /// should merge, and its own size when it should hold. A node at
    /// `max_level` never asks to split.
    pub fn calculate_lod_size(&self, node: &Node, viewpoint: DVec3) -> f64 {
        let size = node.size();
        let ratio = self.distance_ratio(node, viewpoint);

        if node.level() >= self.settings.max_level {
            return if ratio > self.settings.merge_ratio { size * 2.0 } else { size };
        }
        if ratio < self.settings.split_ratio {
            size * 0.5
        } else if ratio > self.settings.merge_ratio {
            size * 2.0
        } else {
            size
        }
    }

    /// Weighted viewpoint distance over node diagonal, times `distance_scale`.
    ///
    /// The terrain lies in the `y = 0` plane.
    pub fn distance_ratio(&self, node: &Node, viewpoint: DVec3) -> f64 {
        let center = node.footprint.center();
        let dx = viewpoint.x - center.x;
        let dz = viewpoint.z - center.y;
        let dy = viewpoint.y * self.settings.height_weight;
        let d = (dx * dx + dz * dz + dy * dy).sqrt();
        d / node.footprint.diagonal().max(1.0) * self.settings.distance_scale
    }

    /// Replace leaf `id` with four children. Returns `false` if the node is
    /// not a live leaf or is already at `max_level`.
    pub fn split(&mut self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get(id) else {
            return false;
        };
        if node.pending_removal || !node.is_leaf() {
            return false;
        }
        if node.level() >= self.settings.max_level {
            log::warn!("Node {} is at max level {}, not splitting", node.geo_key, self.settings.max_level);
            return false;
        }

        let quarters = node.footprint.quarters();
        let keys = child_keys(node.geo_key);

        let mut children = [id; 4];
        for (i, child) in children.iter_mut().enumerate() {
            *child = self.nodes.insert(Node::new(quarters[i], keys[i], Some(id)));
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.children = Some(children);
        }

        self.events.push(LodEvent::new(id, ChangeKind::BecameBranch));
        for child in children {
            self.enqueue(child);
            self.events.push(LodEvent::new(child, ChangeKind::BecameLeaf));
        }
        self.prune_frontier();
        true
    }

    /// Collapse `id`'s subtree back into `id`. No-op on a leaf.
    ///
    /// Every descendant is marked detached; they stay readable through
    /// [`get`](Self::get) and [`subtree`](Self::subtree) until the next advance.
    pub fn merge(&mut self, id: NodeId) -> bool {
        let Some(children) = self
            .nodes
            .get(id)
            .filter(|node| !node.pending_removal)
            .and_then(|node| node.children)
        else {
            return false;
        };

        self.enqueue(id);
        for child in children {
            self.events.push(LodEvent::new(child, ChangeKind::RemovedSubtree));
            self.detach_subtree(child);
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.children = None;
        }
        self.events.push(LodEvent::new(id, ChangeKind::BecameLeaf));
        self.prune_frontier();
        true
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// The active leaf frontier.
    pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.current_frontier
            .iter()
            .copied()
            .filter(move |id| self.nodes.get(*id).is_some_and(|n| !n.pending_removal && n.is_leaf()))
    }

    /// `id` and all its descendants in pre-order. Works on detached subtrees
    /// until they are reclaimed.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(current) else { continue };
            out.push(current);
            if let Some(children) = node.children {
                stack.extend(children.iter().rev());
            }
        }
        out
    }

    /// Nodes held in the arena, detached ones included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Live nodes reachable from the root.
    pub fn live_node_count(&self) -> usize {
        self.nodes.len() - self.detached_count()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves().count()
    }

    /// Number of active leaves per level, indexed by level.
    pub fn depth_histogram(&self) -> Vec<usize> {
        let mut histogram = Vec::new();
        for id in self.leaves() {
            if let Some(node) = self.nodes.get(id) {
                let level = node.level() as usize;
                if histogram.len() <= level {
                    histogram.resize(level + 1, 0);
                }
                histogram[level] += 1;
            }
        }
        histogram
    }

    /// Deepest level among the active leaves.
    pub fn max_depth(&self) -> u8 {
        self.leaves()
            .filter_map(|id| self.nodes.get(id))
            .map(Node::level)
            .max()
            .unwrap_or(0)
    }

    /// The active leaf containing `point` on the XZ plane.
    pub fn leaf_at(&self, point: DVec2) -> Option<NodeId> {
        let mut current = self.root?;
        loop {
            let node = self.nodes.get(current)?;
            if !node.footprint.contains(point) {
                return None;
            }
            match node.children {
                None => return Some(current),
                Some(children) => {
                    current = children
                        .into_iter()
                        .find(|c| self.nodes.get(*c).is_some_and(|n| n.footprint.contains(point)))?;
                }
            }
        }
    }

    pub fn last_stats(&self) -> AdvanceStats {
        self.last_stats
    }

    fn detached_count(&self) -> usize {
        self.detached.iter().filter(|id| self.nodes.contains(**id)).count()
    }

    fn enqueue(&mut self, id: NodeId) {
        if self.advancing {
            self.next_frontier.push_back(id);
        } else {
            self.current_frontier.push_back(id);
        }
    }

    /// Drop frontier entries that are no longer live leaves. Mid-tick the
    /// dequeue loop skips them instead.
    fn prune_frontier(&mut self) {
        if self.advancing {
            return;
        }
        let nodes = &self.nodes;
        self.current_frontier
            .retain(|id| nodes.get(*id).is_some_and(|n| !n.pending_removal && n.is_leaf()));
    }

    fn parent_wants_merge(&self, parent_id: NodeId, viewpoint: DVec3) -> bool {
        let Some(parent) = self.nodes.get(parent_id) else {
            return false;
        };
        let Some(siblings) = parent.children else {
            return false;
        };
        let all_leaves = siblings
            .iter()
            .all(|s| self.nodes.get(*s).is_some_and(Node::is_leaf));
        all_leaves && parent.size() <= self.calculate_lod_size(parent, viewpoint)
    }

    fn detach_subtree(&mut self, id: NodeId) {
        for descendant in self.subtree(id) {
            if let Some(node) = self.nodes.get_mut(descendant) {
                node.pending_removal = true;
                node.parent = None;
                self.detached.push(descendant);
            }
        }
    }

    fn reclaim_detached(&mut self) -> usize {
        let mut reclaimed = 0;
        for id in std::mem::take(&mut self.detached) {
            if self.nodes.remove(id).is_some() {
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

/// Tile keys of the four children of `key`, matching [`Footprint::quarters`].
///
/// World `+z` runs north while tile rows count southwards from the north
/// edge, so the children at the low `z` edge take the odd (southern) rows.
pub fn child_keys(key: GeoKey) -> [GeoKey; 4] {
    let level = key.level + 1;
    let (c, r) = (key.col * 2, key.row * 2);
    [
        GeoKey::new(level, c, r + 1),
        GeoKey::new(level, c + 1, r + 1),
        GeoKey::new(level, c, r),
        GeoKey::new(level, c + 1, r),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    const EARTH: f64 = 40075.017;

    fn settings(max_level: u8) -> LodSettings {
        LodSettings {
            max_level,
            ..Default::default()
        }
    }

    fn index_with_root(size: f64, max_level: u8) -> (LodIndex, NodeId) {
        let mut index = LodIndex::new(settings(max_level));
        let root = index.create_root(size, GeoKey::root());
        (index, root)
    }

    /// Advance until a tick produces no events. Returns the number of ticks.
    fn settle(index: &mut LodIndex, viewpoint: DVec3, max_ticks: usize) -> usize {
        for tick in 0..max_ticks {
            if index.advance(viewpoint).is_empty() {
                return tick;
            }
        }
        panic!("tree did not settle within {} ticks", max_ticks);
    }

    /// Leaves exactly tile the root: areas sum up, nothing overlaps, and each
    /// footprint sits where its key says it should.
    fn assert_partition(index: &LodIndex, root_size: f64) {
        let leaves: Vec<&Node> = index.leaves().filter_map(|id| index.get(id)).collect();
        let keys: HashSet<GeoKey> = leaves.iter().map(|n| n.geo_key).collect();
        assert_eq!(keys.len(), leaves.len(), "duplicate leaves");

        let coverage: f64 = leaves.iter().map(|n| 0.25f64.powi(n.level() as i32)).sum();
        assert!((coverage - 1.0).abs() < 1e-12, "leaves cover {}", coverage);

        for node in &leaves {
            let mut ancestor = node.geo_key.parent();
            while let Some(key) = ancestor {
                assert!(!keys.contains(&key), "{} overlaps its ancestor", node.geo_key);
                ancestor = key.parent();
            }

            let size = root_size / (1u64 << node.level()) as f64;
            let rows = (1u64 << node.level()) as f64;
            assert!((node.size() - size).abs() < 1e-9);
            assert!((node.footprint.origin.x - node.geo_key.col as f64 * size).abs() < 1e-6);
            let expected_z = (rows - 1.0 - node.geo_key.row as f64) * size;
            assert!((node.footprint.origin.y - expected_z).abs() < 1e-6);
        }
    }

    /// Frontier holds every live leaf exactly once and nothing else.
    fn assert_frontier(index: &LodIndex) {
        let frontier: Vec<NodeId> = index.current_frontier.iter().copied().collect();
        let unique: HashSet<NodeId> = frontier.iter().copied().collect();
        assert_eq!(unique.len(), frontier.len(), "node queued twice");

        let live_leaves: HashSet<NodeId> = index
            .nodes
            .iter()
            .filter(|(_, n)| !n.is_detached() && n.is_leaf())
            .map(|(id, _)| id)
            .collect();
        assert_eq!(unique, live_leaves);
    }

    #[test]
    fn test_create_root() {
        let (mut index, root) = index_with_root(1024.0, 8);
        assert_eq!(index.root(), Some(root));
        assert_eq!(index.node_count(), 1);
        assert_eq!(index.leaves().collect::<Vec<_>>(), vec![root]);
        assert_eq!(index.take_events(), vec![LodEvent::new(root, ChangeKind::BecameLeaf)]);

        let node = index.get(root).expect("root");
        assert!(node.is_leaf());
        assert!(node.parent().is_none());
        assert_eq!(node.footprint.origin, DVec2::ZERO);
    }

    #[test]
    fn test_recreate_root_removes_old_tree() {
        let (mut index, old) = index_with_root(64.0, 4);
        index.take_events();
        assert!(index.split(old));
        index.take_events();

        let new_root = index.create_root(128.0, GeoKey::root());
        assert_eq!(
            index.take_events(),
            vec![
                LodEvent::new(old, ChangeKind::RemovedSubtree),
                LodEvent::new(new_root, ChangeKind::BecameLeaf),
            ]
        );
        assert_eq!(index.subtree(old).len(), 5);
        assert_eq!(index.leaf_count(), 1);

        // Old nodes go at the next tick
        index.advance(DVec3::new(1e9, 1e9, 1e9));
        assert!(index.get(old).is_none());
        assert_eq!(index.node_count(), 1);
    }

    #[test]
    fn test_split_layout_and_events() {
        let (mut index, root) = index_with_root(100.0, 4);
        index.take_events();

        assert!(index.split(root));
        let children = *index.get(root).and_then(Node::children).expect("children");

        let events = index.take_events();
        assert_eq!(events[0], LodEvent::new(root, ChangeKind::BecameBranch));
        for (i, child) in children.iter().enumerate() {
            assert_eq!(events[i + 1], LodEvent::new(*child, ChangeKind::BecameLeaf));
        }

        let expected = [
            (DVec2::new(0.0, 0.0), GeoKey::new(1, 0, 1)),
            (DVec2::new(50.0, 0.0), GeoKey::new(1, 1, 1)),
            (DVec2::new(0.0, 50.0), GeoKey::new(1, 0, 0)),
            (DVec2::new(50.0, 50.0), GeoKey::new(1, 1, 0)),
        ];
        for (child, (origin, key)) in children.iter().zip(expected) {
            let node = index.get(*child).expect("child");
            assert_eq!(node.footprint.origin, origin);
            assert_eq!(node.size(), 50.0);
            assert_eq!(node.geo_key, key);
            assert_eq!(node.parent(), Some(root));
        }

        // A branch cannot be split again
        assert!(!index.split(root));
        assert_partition(&index, 100.0);
        assert_frontier(&index);
    }

    #[test]
    fn test_child_keys_have_parent() {
        let key = GeoKey::new(3, 5, 2);
        for child in child_keys(key) {
            assert_eq!(child.parent(), Some(key));
        }
        let unique: HashSet<_> = child_keys(key).into_iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_split_refused_at_max_level() {
        let (mut index, root) = index_with_root(16.0, 1);
        index.take_events();
        assert!(index.split(root));
        let child = index.get(root).and_then(Node::children).expect("children")[0];
        index.take_events();

        assert!(!index.split(child));
        assert!(index.get(child).is_some_and(Node::is_leaf));
        assert!(index.take_events().is_empty());
    }

    #[test]
    fn test_merge_events_and_detach() {
        let (mut index, root) = index_with_root(100.0, 4);
        index.take_events();
        index.split(root);
        let children = *index.get(root).and_then(Node::children).expect("children");
        index.split(children[3]);
        let grandchildren = *index.get(children[3]).and_then(Node::children).expect("grandchildren");
        index.take_events();

        assert!(index.merge(root));
        let events = index.take_events();
        assert_eq!(events.len(), 5);
        for (i, child) in children.iter().enumerate() {
            assert_eq!(events[i], LodEvent::new(*child, ChangeKind::RemovedSubtree));
        }
        assert_eq!(events[4], LodEvent::new(root, ChangeKind::BecameLeaf));

        // Detached nodes stay readable until the next tick
        for id in children.iter().chain(grandchildren.iter()) {
            let node = index.get(*id).expect("still readable");
            assert!(node.is_detached());
            assert!(node.parent().is_none());
        }
        assert_eq!(index.subtree(children[3]).len(), 5);
        assert_eq!(index.live_node_count(), 1);
        assert_eq!(index.leaves().collect::<Vec<_>>(), vec![root]);

        // Merging a leaf does nothing
        assert!(!index.merge(root));

        index.advance(DVec3::new(1e9, 0.0, 1e9));
        assert!(children.iter().all(|id| index.get(*id).is_none()));
        assert_eq!(index.node_count(), 1);
        assert_eq!(index.last_stats().reclaimed, 8);
    }

    #[test]
    fn test_calculate_lod_size_bands() {
        let mut index = LodIndex::new(LodSettings {
            height_weight: 0.0,
            distance_scale: 1.0,
            ..settings(8)
        });
        let root = index.create_root(100.0, GeoKey::root());
        let node = index.get(root).expect("root").clone();
        let diag = 100.0 * std::f64::consts::SQRT_2;
        let at = |ratio: f64| DVec3::new(50.0 + ratio * diag, 1000.0, 50.0);

        assert_eq!(index.calculate_lod_size(&node, at(1.0)), 50.0);
        assert_eq!(index.calculate_lod_size(&node, at(2.5)), 100.0);
        assert_eq!(index.calculate_lod_size(&node, at(3.5)), 200.0);
        assert!((index.distance_ratio(&node, at(2.5)) - 2.5).abs() < 1e-9);

        // Hold or merge only at the depth ceiling
        index.configure(2.0, 3.0, 0.0, 0, 1.0);
        assert_eq!(index.settings().max_level, 1);
        let mut deep = node.clone();
        deep.geo_key = GeoKey::new(1, 0, 0);
        assert_eq!(index.calculate_lod_size(&deep, at(1.0)), 100.0);
        assert_eq!(index.calculate_lod_size(&deep, at(3.5)), 200.0);
    }

    #[test]
    fn test_height_weight_scales_altitude() {
        let mut index = LodIndex::new(LodSettings {
            height_weight: 0.5,
            distance_scale: 1.0,
            ..settings(8)
        });
        let root = index.create_root(10.0, GeoKey::root());
        let node = index.get(root).expect("root").clone();
        let ratio = index.distance_ratio(&node, DVec3::new(5.0, 40.0, 5.0));
        assert!((ratio - 20.0 / (10.0 * std::f64::consts::SQRT_2)).abs() < 1e-9);

        // Small nodes measure against a diagonal of at least 1
        let tiny = Node::new(Footprint::new(DVec2::ZERO, 0.1), GeoKey::new(5, 0, 0), None);
        let ratio = index.distance_ratio(&tiny, DVec3::new(3.05, 0.0, 0.05));
        assert!((ratio - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_configure_clamps() {
        let mut index = LodIndex::new(LodSettings::default());
        index.set_split_budget(7);
        index.configure(0.0, 0.0, -1.0, 0, 0.5);
        let s = index.settings();
        assert_eq!(s.split_ratio, 0.01);
        assert!(s.merge_ratio > s.split_ratio);
        assert_eq!(s.height_weight, 0.0);
        assert_eq!(s.max_level, 1);
        assert_eq!(s.distance_scale, 1.0);
        assert_eq!(s.split_budget, 7);
    }

    #[test]
    fn test_split_budget_bounds_each_tick() {
        let (mut index, _) = index_with_root(1024.0, 8);
        let viewpoint = DVec3::new(512.0, 1.0, 512.0);

        let mut ticks_with_deferred = 0;
        for _ in 0..200 {
            let events = index.advance(viewpoint);
            let stats = index.last_stats();
            let branch_events = events.iter().filter(|e| e.kind == ChangeKind::BecameBranch).count();
            assert!(stats.splits <= 2);
            assert_eq!(branch_events as u32, stats.splits);
            if stats.deferred_splits > 0 {
                ticks_with_deferred += 1;
            }
        }
        assert!(ticks_with_deferred > 0, "budget never limited anything");
    }

    #[test]
    fn test_zero_budget_never_splits() {
        let (mut index, _) = index_with_root(1024.0, 8);
        index.set_split_budget(0);
        for _ in 0..10 {
            index.advance(DVec3::new(512.0, 0.0, 512.0));
        }
        assert_eq!(index.leaf_count(), 1);
        assert_eq!(index.last_stats().deferred_splits, 1);
    }

    #[test]
    fn test_depth_ceiling() {
        let (mut index, _) = index_with_root(1024.0, 4);
        let viewpoint = DVec3::new(300.0, 0.0, 700.0);
        for _ in 0..300 {
            index.advance(viewpoint);
            assert!(index.leaves().all(|id| index.get(id).is_some_and(|n| n.level() <= 4)));
        }
        assert_eq!(index.max_depth(), 4);

        let leaf = index.leaf_at(DVec2::new(300.0, 700.0)).expect("leaf under viewpoint");
        assert_eq!(index.get(leaf).map(Node::level), Some(4));
    }

    #[test]
    fn test_stationary_viewpoint_is_stable() {
        let (mut index, _) = index_with_root(4096.0, 10);
        let viewpoint = DVec3::new(1000.0, 20.0, 3000.0);
        settle(&mut index, viewpoint, 1000);

        let before: HashSet<GeoKey> =
            index.leaves().filter_map(|id| index.get(id)).map(|n| n.geo_key).collect();
        // Some leaves sit inside the hold band
        let holding = index
            .leaves()
            .filter_map(|id| index.get(id))
            .filter(|n| {
                let ratio = index.distance_ratio(n, viewpoint);
                (2.0..=3.0).contains(&ratio)
            })
            .count();
        assert!(holding > 0);

        for _ in 0..50 {
            assert!(index.advance(viewpoint).is_empty());
        }
        let after: HashSet<GeoKey> =
            index.leaves().filter_map(|id| index.get(id)).map(|n| n.geo_key).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_moving_away_merges_back_to_root() {
        let (mut index, root) = index_with_root(1024.0, 6);
        settle(&mut index, DVec3::new(512.0, 0.0, 512.0), 500);
        assert!(index.leaf_count() > 1);

        let far = DVec3::new(1e7, 0.0, 1e7);
        settle(&mut index, far, 500);
        assert_eq!(index.leaves().collect::<Vec<_>>(), vec![root]);
        assert!(index.get(root).is_some_and(Node::is_leaf));
        // One more tick reclaims the last detached nodes
        index.advance(far);
        assert_eq!(index.node_count(), 1);
    }

    #[test]
    fn test_earth_scale_descent() {
        let mut index = LodIndex::new(LodSettings {
            split_ratio: 2.0,
            merge_ratio: 3.0,
            max_level: 15,
            ..Default::default()
        });
        index.create_root(EARTH, GeoKey::root());
        let viewpoint = DVec3::new(EARTH / 2.0, 50.0, EARTH / 2.0);

        let mut ticks_with_splits = 0;
        let mut total_splits = 0;
        let mut settled = false;
        for _ in 0..500 {
            let events = index.advance(viewpoint);
            let splits = index.last_stats().splits;
            assert!(splits <= 2);
            if splits > 0 {
                ticks_with_splits += 1;
            }
            total_splits += splits;
            if events.is_empty() {
                settled = true;
                break;
            }
        }

        assert!(settled);
        assert!(ticks_with_splits >= 10);
        assert_eq!(total_splits, 49);
        // Nodes around the viewpoint stop refining once altitude dominates
        // the distance: 50 units up at 0.2 weight holds at level 13.
        assert_eq!(index.max_depth(), 13);

        let histogram = index.depth_histogram();
        assert_eq!(histogram.len(), 14);
        assert_eq!(histogram[0], 0);
        assert!(histogram[13] > 0);
        assert_eq!(histogram.iter().sum::<usize>(), index.leaf_count());
        assert_partition(&index, EARTH);
        assert_frontier(&index);
    }

    #[test]
    fn test_node_footprints_match_their_keys() {
        let (mut index, root) = index_with_root(1024.0, 7);
        assert!(index.split(root));
        let children = *index.get(root).and_then(|n| n.children()).expect("split root");
        assert!(index.split(children[3]));

        for id in index.subtree(root) {
            let node = index.get(id).expect("live node");
            assert_eq!(node.footprint, Footprint::of_key(node.geo_key, 1024.0), "{}", node.geo_key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_frontier_partitions_root(
            path in prop::collection::vec((0.0f64..1024.0, 0.0f64..300.0, 0.0f64..1024.0, 1usize..6), 1..8)
        ) {
            let (mut index, _) = index_with_root(1024.0, 7);
            for (x, y, z, ticks) in path {
                for _ in 0..ticks {
                    index.advance(DVec3::new(x, y, z));
                    prop_assert!(index.last_stats().splits <= 2);
                    assert_partition(&index, 1024.0);
                    assert_frontier(&index);
                    prop_assert!(index.max_depth() <= 7);
                }
            }
        }
    }
}

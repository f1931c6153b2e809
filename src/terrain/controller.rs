//! Per-tick orchestration of the LOD index and the tile cache

use std::collections::HashMap;
use std::fmt;

use glam::DVec3;

use crate::core::TerrainConfig;
use crate::lod::{ChangeKind, LodEvent, LodIndex, NodeId};
use crate::terrain::sink::{NodeView, PresentationSink};
use crate::tile::{
    ConsistencyReport, GeoKey, SweepStats, TileCache, TileRequester, TileResource,
};

/// Debug counters for one terrain
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TerrainStats {
    pub tick: u64,
    /// Live quadtree nodes, branches included
    pub total_nodes: usize,
    pub leaf_nodes: usize,
    pub max_depth: u8,
    /// Cache entries, exact tiles and fallbacks
    pub cached_tiles: usize,
    pub pending_fetches: usize,
    pub cache_mib: f32,
}

impl fmt::Display for TerrainStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tick {}: {} nodes, {} leaves (depth {}), {} tiles cached, {} fetching, {:.2}MB",
            self.tick,
            self.total_nodes,
            self.leaf_nodes,
            self.max_depth,
            self.cached_tiles,
            self.pending_fetches,
            self.cache_mib
        )
    }
}

/// What one tick did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub completions: usize,
    pub events: usize,
    pub acquired: usize,
    pub released: usize,
    pub updates: usize,
    pub sweep: Option<SweepStats>,
}

/// Surface the controller holds a cache reference for
#[derive(Clone, Debug)]
struct SurfaceRef {
    node: NodeId,
    /// Imagery the sink was last given
    shown: TileResource,
}

/// Drives one terrain: feeds the viewpoint to the index, turns its events into
/// cache references and sink calls, and sweeps the cache on a fixed cadence.
pub struct TerrainController<R: TileRequester> {
    index: LodIndex,
    cache: TileCache<R>,
    /// Leaf surfaces keyed by tile, each holding one cache reference
    surfaces: HashMap<GeoKey, SurfaceRef>,
    terrain_offset: DVec3,
    sweep_interval: u32,
    ticks_since_sweep: u32,
    tick: u64,
}

impl<R: TileRequester> TerrainController<R> {
    pub fn new(config: &TerrainConfig, requester: R) -> Self {
        let mut index = LodIndex::new(config.lod.clone());
        index.create_root(config.root_size, GeoKey::root());

        Self {
            index,
            cache: TileCache::new(requester, &config.cache),
            surfaces: HashMap::new(),
            terrain_offset: config.terrain_offset,
            sweep_interval: config.cache.sweep_interval.max(1),
            ticks_since_sweep: 0,
            tick: 0,
        }
    }

    /// Run one tick for a camera at world position `camera`.
    pub fn tick(&mut self, camera: DVec3, sink: &mut impl PresentationSink) -> TickReport {
        self.tick += 1;
        let mut report = TickReport {
            completions: self.cache.pump(),
            ..Default::default()
        };

        let events = self.index.advance(camera - self.terrain_offset);
        report.events = events.len();
        for event in &events {
            self.handle_event(event, sink, &mut report);
        }

        report.updates = self.route_updates(sink);

        self.ticks_since_sweep += 1;
        if self.ticks_since_sweep >= self.sweep_interval || self.cache.should_sweep() {
            self.ticks_since_sweep = 0;
            report.sweep = Some(self.cache.sweep());
        }
        report
    }

    fn handle_event(&mut self, event: &LodEvent, sink: &mut impl PresentationSink, report: &mut TickReport) {
        let Some(node) = self.index.get(event.node) else {
            log::warn!("Event {:?} for a node that no longer exists", event.kind);
            return;
        };
        let view = NodeView::new(event.node, node, self.terrain_offset);

        match event.kind {
            ChangeKind::BecameLeaf => {
                if self.surfaces.contains_key(&view.key) && self.drop_surface(view.key, None) {
                    log::warn!("Tile {} already had a surface; replacing it", view.key);
                    report.released += 1;
                }
                let resolution = self.cache.acquire(view.key);
                report.acquired += 1;
                self.surfaces.insert(
                    view.key,
                    SurfaceRef {
                        node: event.node,
                        shown: resolution.resource().clone(),
                    },
                );
                sink.node_became_leaf(&view, &resolution);
            }
            ChangeKind::BecameBranch => {
                if self.drop_surface(view.key, Some(event.node)) {
                    report.released += 1;
                }
                sink.node_became_branch(&view);
            }
            ChangeKind::RemovedSubtree => {
                let views: Vec<NodeView> = self
                    .index
                    .subtree(event.node)
                    .into_iter()
                    .filter_map(|id| {
                        self.index
                            .get(id)
                            .map(|n| NodeView::new(id, n, self.terrain_offset))
                    })
                    .collect();
                for v in &views {
                    if self.drop_surface(v.key, Some(v.id)) {
                        report.released += 1;
                    }
                }
                sink.subtree_removed(&views);
            }
        }
    }

    /// Release the surface for `key`, optionally only if `node` owns it.
    fn drop_surface(&mut self, key: GeoKey, node: Option<NodeId>) -> bool {
        match self.surfaces.get(&key) {
            Some(surface) if node.is_none_or(|n| n == surface.node) => {
                self.surfaces.remove(&key);
                self.cache.release(key);
                true
            }
            _ => false,
        }
    }

    /// Forward new imagery to the surfaces showing those tiles.
    fn route_updates(&mut self, sink: &mut impl PresentationSink) -> usize {
        let mut routed = 0;
        for update in self.cache.drain_updates() {
            let Some(surface) = self.surfaces.get_mut(&update.key) else {
                continue;
            };
            if surface.shown.same_image(&update.resource) {
                continue;
            }
            let Some(node) = self.index.get(surface.node) else {
                continue;
            };
            surface.shown = update.resource.clone();
            let view = NodeView::new(surface.node, node, self.terrain_offset);
            sink.tile_updated(&view, &update.resource);
            routed += 1;
        }
        routed
    }

    pub fn stats(&self) -> TerrainStats {
        let cache = self.cache.stats();
        TerrainStats {
            tick: self.tick,
            total_nodes: self.index.live_node_count(),
            leaf_nodes: self.index.leaf_count(),
            max_depth: self.index.max_depth(),
            cached_tiles: cache.entries,
            pending_fetches: cache.in_flight,
            cache_mib: self.cache.budget().used_mib(),
        }
    }

    /// Run the cache's self-check, and make sure every surface still holds a
    /// reference.
    pub fn check_consistency(&mut self) -> ConsistencyReport {
        let report = self.cache.check_consistency();
        for key in self.surfaces.keys() {
            if self.cache.ref_count(*key).unwrap_or(0) == 0 {
                log::warn!("Surface for {} holds no cache reference", key);
            }
        }
        report
    }

    pub fn index(&self) -> &LodIndex {
        &self.index
    }

    pub fn cache(&self) -> &TileCache<R> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut TileCache<R> {
        &mut self.cache
    }

    /// Node currently showing `key`, if any.
    pub fn surface(&self, key: GeoKey) -> Option<NodeId> {
        self.surfaces.get(&key).map(|s| s.node)
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    pub fn terrain_offset(&self) -> DVec3 {
        self.terrain_offset
    }

    pub fn set_terrain_offset(&mut self, offset: DVec3) {
        self.terrain_offset = offset;
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lod::LodSettings;
    use crate::terrain::sink::{RecordingSink, SinkCall, SurfaceTracker};
    use crate::tile::{CacheSettings, ManualRequester, TileOrigin};
    use image::{Rgba, RgbaImage};
    use std::collections::HashSet;

    fn config(root_size: f64, max_level: u8, sweep_interval: u32) -> TerrainConfig {
        TerrainConfig {
            root_size,
            lod: LodSettings {
                max_level,
                ..Default::default()
            },
            cache: CacheSettings {
                tile_size: 8,
                sweep_interval,
                memory_budget_mb: 64,
            },
            ..Default::default()
        }
    }

    fn tile(color: u8) -> RgbaImage {
        RgbaImage::from_pixel(8, 8, Rgba([color, color, color, 255]))
    }

    #[test]
    fn test_first_tick_creates_root_surface() {
        let mut controller = TerrainController::new(&config(1024.0, 4, 120), ManualRequester::new());
        let mut sink = RecordingSink::new();

        let report = controller.tick(DVec3::new(1e6, 1e6, 1e6), &mut sink);
        assert_eq!(report.events, 1);
        assert_eq!(report.acquired, 1);

        let calls = sink.take();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            SinkCall::BecameLeaf { node, ready, origin } => {
                assert_eq!(node.key, GeoKey::root());
                assert!(!ready);
                assert_eq!(*origin, TileOrigin::Placeholder);
            }
            other => panic!("unexpected call {:?}", other),
        }
        assert_eq!(controller.cache().requester().requested(), &[GeoKey::root()]);
    }

    #[test]
    fn test_completed_fetch_updates_surface() {
        let mut controller = TerrainController::new(&config(1024.0, 4, 120), ManualRequester::new());
        let mut sink = RecordingSink::new();
        let far = DVec3::new(1e6, 1e6, 1e6);

        controller.tick(far, &mut sink);
        sink.take();
        controller.cache_mut().requester_mut().succeed(GeoKey::root(), tile(50));

        let report = controller.tick(far, &mut sink);
        assert_eq!(report.completions, 1);
        assert_eq!(report.updates, 1);
        let calls = sink.take();
        assert!(matches!(
            calls.as_slice(),
            [SinkCall::TileUpdated { origin: TileOrigin::Exact, .. }]
        ));

        // Nothing new next tick
        let report = controller.tick(far, &mut sink);
        assert_eq!(report.updates, 0);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_split_children_show_parent_fallback() {
        let mut controller = TerrainController::new(&config(1024.0, 4, 120), ManualRequester::new());
        let mut sink = SurfaceTracker::new();
        let far = DVec3::new(1e6, 1e6, 1e6);

        controller.tick(far, &mut sink);
        controller.cache_mut().requester_mut().succeed(GeoKey::root(), tile(90));
        controller.tick(far, &mut sink);

        // Fly close: the root splits, children borrow the root's imagery
        controller.tick(DVec3::new(512.0, 0.0, 512.0), &mut sink);
        assert_eq!(sink.len(), 4);
        let (exact, fallback, placeholder) = sink.origin_counts();
        assert_eq!((exact, fallback, placeholder), (0, 4, 0));
        assert!(controller.surface(GeoKey::root()).is_none());
        // Root is only referenced by the children's fallbacks now
        assert_eq!(controller.cache().ref_count(GeoKey::root()), Some(0));
    }

    #[test]
    fn test_references_follow_leaves() {
        let mut controller = TerrainController::new(&config(1024.0, 5, 1000), ManualRequester::new());
        let mut sink = SurfaceTracker::new();

        let path = [
            DVec3::new(512.0, 0.0, 512.0),
            DVec3::new(100.0, 10.0, 900.0),
            DVec3::new(900.0, 50.0, 100.0),
            DVec3::new(1e5, 1e4, 1e5),
        ];
        for viewpoint in path {
            for _ in 0..40 {
                controller.tick(viewpoint, &mut sink);
                assert_eq!(sink.len(), controller.index().leaf_count());
                for (id, _) in sink.iter() {
                    let node = controller.index().get(*id).expect("surface node exists");
                    assert!(node.is_leaf() && !node.is_detached());
                    assert_eq!(controller.cache().ref_count(node.geo_key), Some(1));
                }
                assert_eq!(controller.surface_count(), controller.index().leaf_count());
            }
        }
        // Back at the root
        assert_eq!(controller.index().leaf_count(), 1);
        assert!(controller.check_consistency().is_consistent());
    }

    #[test]
    fn test_sweep_cadence_reclaims_released_tiles() {
        let mut controller = TerrainController::new(&config(1024.0, 3, 5), ManualRequester::new());
        let mut sink = SurfaceTracker::new();

        for _ in 0..20 {
            controller.tick(DVec3::new(512.0, 0.0, 512.0), &mut sink);
        }
        let peak = controller.cache().len();
        assert!(peak > 1);

        let mut sweeps = 0;
        for _ in 0..20 {
            let report = controller.tick(DVec3::new(1e7, 0.0, 1e7), &mut sink);
            if report.sweep.is_some() {
                sweeps += 1;
            }
        }
        assert_eq!(sweeps, 4);
        // Only the root's entry survives
        assert_eq!(controller.cache().len(), 1);
        assert_eq!(controller.cache().ref_count(GeoKey::root()), Some(1));
    }

    #[test]
    fn test_terrain_offset_shifts_viewpoint() {
        let mut plain = TerrainController::new(&config(1024.0, 5, 120), ManualRequester::new());
        let mut shifted_config = config(1024.0, 5, 120);
        shifted_config.terrain_offset = DVec3::new(-3000.0, 0.0, 7000.0);
        let mut shifted = TerrainController::new(&shifted_config, ManualRequester::new());

        let mut sink_a = SurfaceTracker::new();
        let mut sink_b = SurfaceTracker::new();
        let local = DVec3::new(200.0, 5.0, 800.0);
        for _ in 0..60 {
            plain.tick(local, &mut sink_a);
            shifted.tick(local + shifted.terrain_offset(), &mut sink_b);
        }

        let keys = |c: &TerrainController<ManualRequester>| -> HashSet<GeoKey> {
            c.index().leaves().filter_map(|id| c.index().get(id)).map(|n| n.geo_key).collect()
        };
        assert_eq!(keys(&plain), keys(&shifted));

        let (_, surface) = sink_b.iter().next().expect("surface");
        let expected = surface.view.footprint.center();
        let world = surface.view.world_center();
        assert_eq!(world.x, expected.x - 3000.0);
        assert_eq!(world.z, expected.y + 7000.0);
    }

    #[test]
    fn test_stats() {
        let mut controller = TerrainController::new(&config(1024.0, 4, 120), ManualRequester::new());
        let mut sink = SurfaceTracker::new();
        controller.tick(DVec3::new(1e6, 0.0, 1e6), &mut sink);
        controller.cache_mut().requester_mut().succeed(GeoKey::root(), tile(1));
        controller.tick(DVec3::new(1e6, 0.0, 1e6), &mut sink);

        let stats = controller.stats();
        assert_eq!(stats.tick, 2);
        assert_eq!(stats.total_nodes, 1);
        assert_eq!(stats.leaf_nodes, 1);
        assert_eq!(stats.max_depth, 0);
        assert_eq!(stats.cached_tiles, 1);
        assert_eq!(stats.pending_fetches, 0);
        assert!(stats.cache_mib > 0.0);
        assert!(stats.to_string().starts_with("tick 2: 1 nodes, 1 leaves"));
    }
}

//! Reference-counted tile cache with a fallback chain
//!
//! Maps tile keys to decoded imagery. Acquiring a tile that is not cached
//! starts a background fetch and hands out a placeholder (or, when a coarser
//! ancestor is already cached, an upsampled crop of it) until the real tile
//! arrives. When a fetch fails the cache walks towards the root looking for
//! an ancestor it can crop from.
//!
//! Releasing never frees anything; zero-reference entries linger until the
//! next [`TileCache::sweep`].

use std::collections::{HashMap, HashSet};

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::tile::budget::MemoryBudget;
use crate::tile::fetch::FetchError;
use crate::tile::key::GeoKey;
use crate::tile::loader::TileRequester;
use crate::tile::resource::{DEFAULT_TILE_SIZE, TileResource, synthesize_fallback};

/// Cache parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Edge length of every tile handed out, in pixels
    pub tile_size: u32,
    /// Ticks between regular sweeps
    pub sweep_interval: u32,
    /// Decoded imagery budget in megabytes; exceeding 90% triggers an early sweep
    pub memory_budget_mb: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            sweep_interval: 120,
            memory_budget_mb: 256,
        }
    }
}

/// Identity of a cache entry
///
/// An exact tile and a stand-in synthesized for the same key from some
/// ancestor level never share an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub key: GeoKey,
    /// `None` for the tile itself, `Some(level)` for a fallback cropped from
    /// the ancestor at `level`
    pub origin_level: Option<u8>,
}

impl CacheKey {
    pub fn exact(key: GeoKey) -> Self {
        Self { key, origin_level: None }
    }

    pub fn fallback(key: GeoKey, source_level: u8) -> Self {
        Self { key, origin_level: Some(source_level) }
    }
}

/// Where an entry is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    /// Exact fetch in flight
    Loading,
    /// Exact fetch failed; waiting on the ancestor at `level`
    Descending { level: u8 },
    /// Imagery available (exact tile, or the synthesized stand-in itself)
    Ready,
    /// Exact fetch failed and a fallback now stands in for it
    Substituted,
    /// Nothing at any level; the placeholder stands in
    Exhausted,
}

/// One cached tile
#[derive(Clone, Debug)]
pub struct CacheEntry {
    key: GeoKey,
    origin_level: Option<u8>,
    resource: Option<TileResource>,
    ref_count: u32,
    status: EntryStatus,
    /// Source level of the fallback currently shown in place of this exact entry
    fallback: Option<u8>,
}

impl CacheEntry {
    fn exact(key: GeoKey, ref_count: u32) -> Self {
        Self {
            key,
            origin_level: None,
            resource: None,
            ref_count,
            status: EntryStatus::Loading,
            fallback: None,
        }
    }

    fn synthesized(key: GeoKey, source_level: u8, resource: TileResource, ref_count: u32) -> Self {
        Self {
            key,
            origin_level: Some(source_level),
            resource: Some(resource),
            ref_count,
            status: EntryStatus::Ready,
            fallback: None,
        }
    }

    pub fn key(&self) -> GeoKey {
        self.key
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey { key: self.key, origin_level: self.origin_level }
    }

    pub fn origin_level(&self) -> Option<u8> {
        self.origin_level
    }

    pub fn resource(&self) -> Option<&TileResource> {
        self.resource.as_ref()
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn fallback(&self) -> Option<u8> {
        self.fallback
    }
}

/// What a consumer gets back from [`TileCache::acquire`]
#[derive(Clone, Debug)]
pub enum Resolution {
    /// Final imagery: the exact tile, a settled fallback, or the placeholder
    /// when nothing exists at any level
    Ready(TileResource),
    /// Still loading; the resource is an interim stand-in
    Pending(TileResource),
}

impl Resolution {
    pub fn resource(&self) -> &TileResource {
        match self {
            Resolution::Ready(resource) | Resolution::Pending(resource) => resource,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Resolution::Ready(_))
    }
}

/// New imagery for a key that consumers currently hold
#[derive(Clone, Debug)]
pub struct TileUpdate {
    pub key: GeoKey,
    pub resource: TileResource,
}

/// Result of one sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub freed: usize,
    pub freed_bytes: usize,
}

/// Snapshot of cache occupancy
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub exact: usize,
    pub fallbacks: usize,
    pub ready: usize,
    pub unreferenced: usize,
    pub in_flight: usize,
    pub bytes: usize,
    pub pressure: f32,
}

/// Bookkeeping drift found (and repaired) by [`TileCache::check_consistency`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsistencyIssue {
    /// Entry claims to be ready but holds no imagery
    ReadyWithoutResource(CacheKey),
    /// Entry holds imagery but is not marked ready
    ResourceNotReady(CacheKey),
    /// Exact entry points at a fallback entry that no longer exists
    DanglingFallback { key: GeoKey, source_level: u8 },
    /// In-flight fetch lists a waiter with no cache entry
    OrphanedWaiter { fetch: GeoKey, target: GeoKey },
    /// The shared placeholder was stored as a cache entry
    PlaceholderStored(CacheKey),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub issues: Vec<ConsistencyIssue>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Tile cache
pub struct TileCache<R: TileRequester> {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Fetches in flight, each with the targets waiting on it as a fallback source
    in_flight: HashMap<GeoKey, Vec<GeoKey>>,
    /// Keys whose last fetch failed; skipped by fallback walks until the next sweep
    failed: HashSet<GeoKey>,
    updates: Vec<TileUpdate>,
    budget: MemoryBudget,
    placeholder: TileResource,
    tile_size: u32,
    requester: R,
}

impl<R: TileRequester> TileCache<R> {
    pub fn new(requester: R, settings: &CacheSettings) -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            failed: HashSet::new(),
            updates: Vec::new(),
            budget: MemoryBudget::new(settings.memory_budget_mb),
            placeholder: TileResource::placeholder(),
            tile_size: settings.tile_size.max(1),
            requester,
        }
    }

    /// Take a reference on `key`'s imagery.
    ///
    /// Never blocks. On a miss the tile is fetched in the background and the
    /// best stand-in available right now is returned as `Pending`.
    pub fn acquire(&mut self, key: GeoKey) -> Resolution {
        let exact = CacheKey::exact(key);
        match self.entries.get_mut(&exact) {
            Some(entry) => {
                entry.ref_count += 1;
                if let Some(level) = entry.fallback {
                    if let Some(fallback) = self.entries.get_mut(&CacheKey::fallback(key, level)) {
                        fallback.ref_count += 1;
                    }
                }
            }
            None => {
                self.entries.insert(exact, CacheEntry::exact(key, 1));
                if self.failed.contains(&key) {
                    // Known missing: go straight to the fallback walk
                    self.descend(key, key.level);
                } else {
                    self.request_fetch(key);
                    self.install_interim_fallback(key);
                }
            }
        }
        self.resolve(key)
    }

    /// Drop a reference on `key`. Imagery stays cached until the next sweep.
    pub fn release(&mut self, key: GeoKey) {
        let fallback = match self.entries.get_mut(&CacheKey::exact(key)) {
            Some(entry) if entry.ref_count > 0 => {
                entry.ref_count -= 1;
                entry.fallback
            }
            Some(_) => {
                log::warn!("Tile {} released more often than acquired", key);
                return;
            }
            None => {
                log::warn!("Tile {} released but not in cache", key);
                return;
            }
        };

        if let Some(level) = fallback {
            if let Some(entry) = self.entries.get_mut(&CacheKey::fallback(key, level)) {
                entry.ref_count = entry.ref_count.saturating_sub(1);
            }
        }
    }

    /// What `key` currently resolves to, without touching reference counts.
    pub fn resolve(&self, key: GeoKey) -> Resolution {
        let Some(entry) = self.entries.get(&CacheKey::exact(key)) else {
            return Resolution::Pending(self.placeholder.clone());
        };
        let fallback = entry
            .fallback
            .and_then(|level| self.entries.get(&CacheKey::fallback(key, level)))
            .and_then(|fb| fb.resource.clone());

        match entry.status {
            EntryStatus::Ready => match &entry.resource {
                Some(resource) => Resolution::Ready(resource.clone()),
                None => Resolution::Pending(self.placeholder.clone()),
            },
            EntryStatus::Substituted => match fallback {
                Some(resource) => Resolution::Ready(resource),
                None => Resolution::Ready(self.placeholder.clone()),
            },
            EntryStatus::Exhausted => Resolution::Ready(self.placeholder.clone()),
            EntryStatus::Loading | EntryStatus::Descending { .. } => {
                Resolution::Pending(fallback.unwrap_or_else(|| self.placeholder.clone()))
            }
        }
    }

    /// Apply every completion the requester has delivered. Returns how many
    /// were applied.
    pub fn pump(&mut self) -> usize {
        let completions = self.requester.poll();
        let count = completions.len();
        for completion in completions {
            self.on_fetch_completed(completion.key, completion.result);
        }
        count
    }

    /// Record the outcome of a background fetch.
    pub fn on_fetch_completed(&mut self, key: GeoKey, result: Result<RgbaImage, FetchError>) {
        let waiters = self.in_flight.remove(&key).unwrap_or_default();

        match result {
            Ok(image) => {
                self.failed.remove(&key);
                let resource = TileResource::exact(image);
                self.store_exact(key, resource.clone());
                for target in waiters {
                    if let Some(installed) = self.install_fallback(target, key.level, Some(&resource), true) {
                        self.notify(target, installed);
                    }
                }
            }
            Err(e) => {
                log::debug!("Tile fetch failed: {}", e);
                self.failed.insert(key);
                let own_entry_loading = self
                    .entries
                    .get(&CacheKey::exact(key))
                    .is_some_and(|entry| entry.status == EntryStatus::Loading);
                if own_entry_loading {
                    self.descend(key, key.level);
                }
                for target in waiters {
                    self.descend(target, key.level);
                }
            }
        }
    }

    /// Free every entry nobody references.
    pub fn sweep(&mut self) -> SweepStats {
        let mut stats = SweepStats::default();
        let budget = &mut self.budget;
        self.entries.retain(|_, entry| {
            if entry.ref_count > 0 {
                return true;
            }
            stats.freed += 1;
            if let Some(resource) = &entry.resource {
                stats.freed_bytes += resource.byte_size();
                budget.remove(resource.byte_size());
            }
            false
        });

        let entries = &self.entries;
        for waiters in self.in_flight.values_mut() {
            waiters.retain(|target| entries.contains_key(&CacheKey::exact(*target)));
        }
        self.failed.clear();

        if stats.freed > 0 {
            log::debug!(
                "Tile sweep: freed {} entries, {:.2}MB",
                stats.freed,
                stats.freed_bytes as f64 / (1024.0 * 1024.0)
            );
        }
        stats
    }

    /// Diagnostic pass: find bookkeeping drift, log it and repair it.
    pub fn check_consistency(&mut self) -> ConsistencyReport {
        let mut report = ConsistencyReport::default();

        for (cache_key, entry) in &self.entries {
            let holds_placeholder = entry
                .resource
                .as_ref()
                .is_some_and(|r| r.is_placeholder() || r.same_image(&self.placeholder));
            if holds_placeholder {
                report.issues.push(ConsistencyIssue::PlaceholderStored(*cache_key));
                continue;
            }
            match (entry.status, entry.resource.is_some()) {
                (EntryStatus::Ready, false) => {
                    report.issues.push(ConsistencyIssue::ReadyWithoutResource(*cache_key))
                }
                (status, true) if status != EntryStatus::Ready => {
                    report.issues.push(ConsistencyIssue::ResourceNotReady(*cache_key))
                }
                _ => {}
            }
            if let Some(level) = entry.fallback {
                if !self.entries.contains_key(&CacheKey::fallback(entry.key, level)) {
                    report.issues.push(ConsistencyIssue::DanglingFallback {
                        key: entry.key,
                        source_level: level,
                    });
                }
            }
        }
        for (fetch, waiters) in &self.in_flight {
            for target in waiters {
                if !self.entries.contains_key(&CacheKey::exact(*target)) {
                    report.issues.push(ConsistencyIssue::OrphanedWaiter { fetch: *fetch, target: *target });
                }
            }
        }

        for issue in &report.issues {
            log::warn!("Tile cache inconsistency: {:?}", issue);
            self.repair(issue);
        }
        report
    }

    fn repair(&mut self, issue: &ConsistencyIssue) {
        match issue {
            ConsistencyIssue::PlaceholderStored(cache_key) => {
                self.remove_entry(cache_key);
            }
            ConsistencyIssue::ReadyWithoutResource(cache_key) => {
                if cache_key.origin_level.is_some() {
                    self.remove_entry(cache_key);
                } else if let Some(entry) = self.entries.get_mut(cache_key) {
                    entry.status = EntryStatus::Loading;
                    self.request_fetch(cache_key.key);
                }
            }
            ConsistencyIssue::ResourceNotReady(cache_key) => {
                let stale = self.entries.get_mut(cache_key).and_then(|entry| {
                    entry.status = EntryStatus::Ready;
                    entry.fallback.take()
                });
                if let Some(level) = stale {
                    self.drop_fallback_hold(cache_key.key, level);
                }
            }
            ConsistencyIssue::DanglingFallback { key, .. } => {
                let status = self.entries.get_mut(&CacheKey::exact(*key)).map(|entry| {
                    entry.fallback = None;
                    entry.status
                });
                if status == Some(EntryStatus::Substituted) {
                    self.descend(*key, key.level);
                }
            }
            ConsistencyIssue::OrphanedWaiter { fetch, target } => {
                if let Some(waiters) = self.in_flight.get_mut(fetch) {
                    waiters.retain(|t| t != target);
                }
            }
        }
    }

    fn remove_entry(&mut self, cache_key: &CacheKey) {
        if let Some(resource) = self.entries.remove(cache_key).and_then(|entry| entry.resource) {
            self.budget.remove(resource.byte_size());
        }
    }

    /// Drain notifications for imagery that changed since the last call.
    pub fn drain_updates(&mut self) -> Vec<TileUpdate> {
        std::mem::take(&mut self.updates)
    }

    pub fn entry(&self, cache_key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(cache_key)
    }

    /// Reference count of `key`'s exact entry
    pub fn ref_count(&self, key: GeoKey) -> Option<u32> {
        self.entries.get(&CacheKey::exact(key)).map(|entry| entry.ref_count)
    }

    pub fn contains(&self, cache_key: &CacheKey) -> bool {
        self.entries.contains_key(cache_key)
    }

    pub fn is_in_flight(&self, key: GeoKey) -> bool {
        self.in_flight.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn placeholder(&self) -> &TileResource {
        &self.placeholder
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Whether memory pressure calls for a sweep ahead of schedule
    pub fn should_sweep(&self) -> bool {
        self.budget.should_sweep()
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn requester(&self) -> &R {
        &self.requester
    }

    pub fn requester_mut(&mut self) -> &mut R {
        &mut self.requester
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            entries: self.entries.len(),
            in_flight: self.in_flight.len(),
            bytes: self.budget.used(),
            pressure: self.budget.pressure(),
            ..Default::default()
        };
        for entry in self.entries.values() {
            match entry.origin_level {
                None => stats.exact += 1,
                Some(_) => stats.fallbacks += 1,
            }
            if entry.status == EntryStatus::Ready {
                stats.ready += 1;
            }
            if entry.ref_count == 0 {
                stats.unreferenced += 1;
            }
        }
        stats
    }

    fn request_fetch(&mut self, key: GeoKey) {
        if !self.in_flight.contains_key(&key) {
            self.in_flight.insert(key, Vec::new());
            self.requester.request(key);
        }
    }

    fn notify(&mut self, key: GeoKey, resource: TileResource) {
        let referenced = self
            .entries
            .get(&CacheKey::exact(key))
            .is_some_and(|entry| entry.ref_count > 0);
        if referenced {
            self.updates.push(TileUpdate { key, resource });
        }
    }

    /// Store freshly fetched imagery as `key`'s exact entry. The exact tile
    /// supersedes any fallback that was standing in for it.
    fn store_exact(&mut self, key: GeoKey, resource: TileResource) {
        let entry = self
            .entries
            .entry(CacheKey::exact(key))
            .or_insert_with(|| CacheEntry::exact(key, 0));

        if let Some(old) = entry.resource.replace(resource.clone()) {
            self.budget.remove(old.byte_size());
        }
        self.budget.add(resource.byte_size());
        entry.status = EntryStatus::Ready;

        if let Some(level) = entry.fallback.take() {
            self.drop_fallback_hold(key, level);
        }
        // A ready tile no longer waits on any ancestor
        for waiters in self.in_flight.values_mut() {
            waiters.retain(|target| *target != key);
        }
        self.notify(key, resource);
    }

    /// Consumers stopped looking at a fallback; leave it for the sweep.
    fn drop_fallback_hold(&mut self, key: GeoKey, level: u8) {
        if let Some(fallback) = self.entries.get_mut(&CacheKey::fallback(key, level)) {
            fallback.ref_count = 0;
        }
    }

    /// On a miss, borrow from the nearest ancestor already in memory so the
    /// consumer has something better than the placeholder while loading.
    fn install_interim_fallback(&mut self, key: GeoKey) {
        for level in (0..key.level).rev() {
            if self.entries.contains_key(&CacheKey::fallback(key, level)) {
                self.install_fallback(key, level, None, false);
                return;
            }
            if let Some(source) = self.ready_exact(key, level) {
                self.install_fallback(key, level, Some(&source), false);
                return;
            }
        }
    }

    /// Continue `target`'s fallback walk at the levels strictly coarser than
    /// `below_level`.
    fn descend(&mut self, target: GeoKey, below_level: u8) {
        let exact_ready = self
            .entries
            .get(&CacheKey::exact(target))
            .is_some_and(|entry| entry.status == EntryStatus::Ready);
        if exact_ready {
            return;
        }

        for level in (0..below_level.min(target.level)).rev() {
            if self.entries.contains_key(&CacheKey::fallback(target, level)) {
                if let Some(installed) = self.install_fallback(target, level, None, true) {
                    self.notify(target, installed);
                }
                return;
            }
            if let Some(source) = self.ready_exact(target, level) {
                if let Some(installed) = self.install_fallback(target, level, Some(&source), true) {
                    self.notify(target, installed);
                }
                return;
            }

            let Some(ancestor) = target.ancestor(level) else { break };
            if self.failed.contains(&ancestor) {
                continue;
            }

            match self.entries.get_mut(&CacheKey::exact(target)) {
                Some(entry) => entry.status = EntryStatus::Descending { level },
                None => return,
            }
            self.request_fetch(ancestor);
            if let Some(waiters) = self.in_flight.get_mut(&ancestor) {
                if !waiters.contains(&target) {
                    waiters.push(target);
                }
            }
            log::debug!("Tile {} falling back to {}", target, ancestor);
            return;
        }

        // Nothing at any level
        let stale = self.entries.get_mut(&CacheKey::exact(target)).and_then(|entry| {
            entry.status = EntryStatus::Exhausted;
            entry.fallback.take()
        });
        if let Some(level) = stale {
            self.drop_fallback_hold(target, level);
        }
        log::debug!("No imagery for tile {} at any level", target);
        self.notify(target, self.placeholder.clone());
    }

    /// The exact imagery of `key`'s ancestor at `level`, if cached and ready.
    fn ready_exact(&self, key: GeoKey, level: u8) -> Option<TileResource> {
        let ancestor = key.ancestor(level)?;
        let entry = self.entries.get(&CacheKey::exact(ancestor))?;
        if entry.status == EntryStatus::Ready {
            entry.resource.clone()
        } else {
            None
        }
    }

    /// Point `target` at the stand-in cropped from its ancestor at `level`,
    /// synthesizing it from `source` unless it is already cached. With
    /// `settle` the target stops waiting and reports the stand-in as final.
    ///
    /// Returns the stand-in, or `None` when the target no longer needs one.
    fn install_fallback(
        &mut self,
        target: GeoKey,
        level: u8,
        source: Option<&TileResource>,
        settle: bool,
    ) -> Option<TileResource> {
        let (ref_count, previous) = match self.entries.get(&CacheKey::exact(target)) {
            Some(entry) if entry.status != EntryStatus::Ready => (entry.ref_count, entry.fallback),
            _ => return None,
        };

        let fallback_key = CacheKey::fallback(target, level);
        let resource = match self.entries.get_mut(&fallback_key) {
            Some(existing) => {
                existing.ref_count = ref_count;
                existing.resource.clone()?
            }
            None => {
                let source_key = target.ancestor(level)?;
                let image = synthesize_fallback(source?.image(), source_key, target, self.tile_size);
                let resource = TileResource::fallback(image, level);
                self.budget.add(resource.byte_size());
                self.entries.insert(
                    fallback_key,
                    CacheEntry::synthesized(target, level, resource.clone(), ref_count),
                );
                log::debug!("Synthesized fallback for {} from level {}", target, level);
                resource
            }
        };

        if let Some(old) = previous.filter(|old| *old != level) {
            self.drop_fallback_hold(target, old);
        }
        if let Some(entry) = self.entries.get_mut(&CacheKey::exact(target)) {
            entry.fallback = Some(level);
            if settle {
                entry.status = EntryStatus::Substituted;
            }
        }
        Some(resource)
    }
}

//! Headless terrain flythrough.
//!
//! Usage: cargo run --release -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>        Terrain config JSON (default: built-in defaults)
//!   --write-config <PATH>  Write the effective config to PATH and exit
//!   --ticks <N>            Ticks to simulate (default: 600)
//!   --tick-ms <MS>         Wall-clock delay per tick (default: 16)
//!   --altitude <H>         Starting camera height (default: root size / 4)
//!   --stats-every <N>      Log stats every N ticks (default: 60)
//!   --focus <QUADKEY>      Circle over this tile instead of the root centre
//!
//! The camera starts high above the centre of the focus tile and descends to
//! 50 units while circling, so the quadtree refines towards the ground and
//! fetched tiles replace their fallbacks.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use glam::DVec3;

use terratile::core::{Result, TerrainConfig, logging};
use terratile::lod::Footprint;
use terratile::terrain::{SurfaceTracker, TerrainController};
use terratile::tile::{ConfiguredFetcher, GeoKey, TileLoader};

const FINAL_ALTITUDE: f64 = 50.0;

fn main() {
    logging::init();

    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config = match parse_str_arg(&args, "--config") {
        Some(path) => TerrainConfig::load(&PathBuf::from(path))?,
        None => TerrainConfig::default(),
    };

    if let Some(path) = parse_str_arg(&args, "--write-config") {
        config.save(&PathBuf::from(&path))?;
        log::info!("Wrote config to {}", path);
        return Ok(());
    }

    let ticks = parse_u64_arg(&args, "--ticks").unwrap_or(600);
    let tick_ms = parse_u64_arg(&args, "--tick-ms").unwrap_or(16);
    let stats_every = parse_u64_arg(&args, "--stats-every").unwrap_or(60).max(1);
    let start_altitude = parse_f64_arg(&args, "--altitude").unwrap_or(config.root_size / 4.0);

    log::info!("Root size {:.3}, {} ticks", config.root_size, ticks);
    log::info!("Tile source: {:?}", config.source);

    let fetcher = ConfiguredFetcher::from_config(&config.source)?;
    let loader = TileLoader::new(fetcher, &config.loader)?;
    let mut controller = TerrainController::new(&config, loader);
    let mut sink = SurfaceTracker::new();

    let focus = match parse_str_arg(&args, "--focus") {
        Some(quadkey) => GeoKey::from_quadkey(&quadkey)?,
        None => GeoKey::root(),
    };
    let focus_center = Footprint::of_key(focus, config.root_size).center();
    let center = DVec3::new(focus_center.x, 0.0, focus_center.y);
    log::info!("Focus tile {} at ({:.1}, {:.1})", focus, center.x, center.z);
    let start = Instant::now();

    for tick in 0..ticks {
        let camera = config.terrain_offset + camera_at(tick, ticks, center, start_altitude);
        let report = controller.tick(camera, &mut sink);

        if let Some(sweep) = report.sweep {
            if sweep.freed > 0 {
                log::info!("Swept {} tiles", sweep.freed);
            }
        }
        if (tick + 1) % stats_every == 0 {
            let (exact, fallback, placeholder) = sink.origin_counts();
            log::info!("{}", controller.stats());
            log::info!(
                "Surfaces: {} exact, {} fallback, {} placeholder (camera at {:.1} high)",
                exact,
                fallback,
                placeholder,
                camera.y
            );
        }

        if tick_ms > 0 {
            std::thread::sleep(Duration::from_millis(tick_ms));
        }
    }

    let report = controller.check_consistency();
    if !report.is_consistent() {
        log::warn!("Tile cache repaired {} inconsistencies", report.issues.len());
    }

    let (created, destroyed, retextured) = sink.totals();
    log::info!("{}", controller.stats());
    log::info!(
        "Done in {:.2?}: {} surfaces created, {} destroyed, {} retextured",
        start.elapsed(),
        created,
        destroyed,
        retextured
    );
    Ok(())
}

/// Camera position for `tick`: a shrinking circle around `center` while the
/// altitude falls geometrically to [`FINAL_ALTITUDE`].
fn camera_at(tick: u64, ticks: u64, center: DVec3, start_altitude: f64) -> DVec3 {
    let t = if ticks <= 1 { 1.0 } else { tick as f64 / (ticks - 1) as f64 };
    let start = start_altitude.max(FINAL_ALTITUDE);
    let altitude = start * (FINAL_ALTITUDE / start).powf(t);
    let radius = altitude * 0.5;
    let angle = t * std::f64::consts::TAU;
    center + DVec3::new(radius * angle.cos(), altitude, radius * angle.sin())
}

fn parse_u64_arg(args: &[String], flag: &str) -> Option<u64> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_f64_arg(args: &[String], flag: &str) -> Option<f64> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

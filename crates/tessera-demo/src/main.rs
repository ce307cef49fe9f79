//! Headless fly-over of a synthetic heightfield through the streaming
//! terrain quadtree.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p tessera-demo -- --frames 1200 --budget-mb 8`.

use std::time::{Duration, Instant};

use clap::Parser;
use glam::{Mat4, Vec3};
use tessera_config::{CliArgs, Config, default_config_dir};
use tessera_quadtree::{BlockRequest, PatchData, SourceError, TerrainQuadTree, ViewParams};
use tracing::{error, info, warn};

/// Camera height above the terrain surface.
const EYE_HEIGHT: f32 = 40.0;

/// Rolling hills: a few octaves of sines over world coordinates.
fn synthetic_height(x: f32, z: f32) -> f32 {
    let broad = (x * 0.002).sin() * (z * 0.0017).cos() * 120.0;
    let hills = (x * 0.011 + 1.3).sin() * (z * 0.009).sin() * 24.0;
    let detail = (x * 0.07).cos() * (z * 0.05 + 0.4).sin() * 3.0;
    128.0 + broad + hills + detail
}

fn synthetic_block(request: &BlockRequest) -> Result<Vec<u8>, SourceError> {
    let side = PatchData::samples_per_side(request.resolution);
    let size = request.bounds.size();
    let step = 1.0 / request.resolution as f32;

    let mut heights = Vec::with_capacity(side * side);
    let mut materials = Vec::with_capacity(side * side);
    for j in 0..side {
        for i in 0..side {
            let x = request.bounds.min.x + size.x * i as f32 * step;
            let z = request.bounds.min.z + size.z * j as f32 * step;
            let h = synthetic_height(x, z);
            heights.push(h);
            materials.push(if h > 200.0 { 2 } else if h > 100.0 { 1 } else { 0 });
        }
    }

    PatchData::from_samples(request.resolution, heights, materials)
        .map(|data| data.encode())
        .map_err(|e| SourceError::Other(e.to_string()))
}

/// Camera path: a diagonal pass across the terrain, looking ahead.
fn camera_at(config: &Config, t: f32) -> (Vec3, Vec3) {
    let [ox, oz] = config.terrain.origin;
    let size = config.terrain.size;
    let x = ox + size * (0.05 + 0.9 * t);
    let z = oz + size * (0.5 + 0.35 * (t * std::f32::consts::TAU).sin());
    let eye = Vec3::new(x, synthetic_height(x, z) + EYE_HEIGHT, z);
    let ahead = Vec3::new(1.0, -0.15, (t * std::f32::consts::TAU).cos() * 0.5).normalize();
    (eye, ahead)
}

fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| std::env::temp_dir().join("tessera"));

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    tessera_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let mut terrain = match TerrainQuadTree::new(&config, synthetic_block) {
        Ok(terrain) => terrain,
        Err(e) => {
            error!(error = %e, "failed to start terrain");
            std::process::exit(1);
        }
    };

    let aspect = 16.0 / 9.0;
    let fov = config.terrain.vertical_fov_degrees.to_radians();
    let far = config.terrain.size * 2.0;
    let projection = Mat4::perspective_rh(fov, aspect, 0.5, far);

    let frames = args.frames.max(1);
    let start = Instant::now();
    for frame in 0..frames {
        let t = frame as f32 / frames as f32;
        let (eye, ahead) = camera_at(&config, t);
        let view_projection = projection * Mat4::look_to_rh(eye, ahead, Vec3::Y);
        let view = ViewParams::from_config(eye, &config.terrain).with_view_projection(&view_projection);

        // Halfway through, squeeze the budget to exercise eviction.
        if frame == frames / 2 {
            let halved = terrain.store().budget() / 2;
            warn!(bytes = halved, "halving patch budget");
            terrain.set_budget(halved);
        }

        let output = terrain.update(&view);
        let stats = output.stats;
        if frame % 60 == 0 || frame + 1 == frames {
            let skirts: usize = output.leaves.iter().map(|leaf| leaf.skirts.len()).sum();
            info!(
                frame,
                nodes = stats.nodes,
                rendered = stats.rendered,
                culled = stats.culled,
                skirts,
                resident_kb = stats.resident_bytes / 1024,
                budget_kb = stats.budget_bytes / 1024,
                in_flight = stats.in_flight,
                pending = stats.pending,
                lagging = stats.lagging,
                "frame"
            );
            info!(
                x = eye.x,
                z = eye.z,
                ground = terrain.height_at(eye.x, eye.z),
                "camera"
            );
        }

        std::thread::sleep(Duration::from_millis(2));
    }

    info!(
        frames,
        elapsed_ms = start.elapsed().as_millis() as u64,
        nodes = terrain.hierarchy().len(),
        resident = terrain.store().len(),
        "fly-over complete"
    );
}

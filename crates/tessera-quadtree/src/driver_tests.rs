//! End-to-end tests for the per-frame traversal.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use glam::{Mat4, Vec3};

use super::*;
use crate::error::SourceError;
use crate::node::Direction;
use crate::source::BlockRequest;

fn flat_block(resolution: u32, height: f32) -> Vec<u8> {
    let samples = PatchData::samples_per_side(resolution).pow(2);
    PatchData::from_samples(resolution, vec![height; samples], vec![1; samples])
        .unwrap()
        .encode()
}

fn flat_source(height: f32) -> impl PatchSource {
    move |req: &BlockRequest| Ok::<_, SourceError>(flat_block(req.resolution, height))
}

/// 1024-unit terrain, 16-pixel threshold, four levels below the root.
fn scenario_config() -> Config {
    let mut config = Config::default();
    config.terrain.origin = [0.0, 0.0];
    config.terrain.size = 1024.0;
    config.terrain.initial_height_range = [0.0, 0.0];
    config.terrain.max_depth = 4;
    config.terrain.error_threshold = 16.0;
    config.terrain.patch_resolution = 16;
    config.terrain.fallback_height = -1.0;
    config.streaming.budget_bytes = 64 * 1024 * 1024;
    config.streaming.max_concurrent_loads = 16;
    config.streaming.worker_threads = 2;
    config.streaming.retry_backoff_frames = vec![1];
    config
}

fn corner_view() -> ViewParams {
    ViewParams::new(Vec3::new(-10.0, 0.0, 0.0), 256.0)
}

fn estimate() -> usize {
    PatchData::estimated_bytes(16)
}

/// Run frames until a frame changes nothing and no load is outstanding.
fn settle(tree: &mut TerrainQuadTree, view: &ViewParams) -> FrameOutput {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let out = tree.update(view);
        let stats = &out.stats;
        if tree.is_idle()
            && stats.tick > 1
            && stats.subdivided == 0
            && stats.merged == 0
            && stats.completed == 0
        {
            return out;
        }
        assert!(Instant::now() < deadline, "terrain did not settle");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn interior_keys(tree: &TerrainQuadTree) -> BTreeSet<NodeKey> {
    tree.hierarchy()
        .iter()
        .filter(|(_, node)| !node.is_leaf())
        .map(|(_, node)| node.key())
        .collect()
}

fn key(depth: u8, x: u32, y: u32) -> NodeKey {
    NodeKey { depth, x, y }
}

#[test]
fn test_corner_viewer_refines_only_its_ancestor_chain() {
    let mut tree = TerrainQuadTree::new(&scenario_config(), flat_source(0.0)).unwrap();
    let out = settle(&mut tree, &corner_view());

    let expected: BTreeSet<_> = [key(0, 0, 0), key(1, 0, 0), key(2, 0, 0), key(3, 0, 0)]
        .into_iter()
        .collect();
    assert_eq!(interior_keys(&tree), expected);

    // The chain reaches the maximum depth at the corner.
    assert!(out.leaves.iter().any(|leaf| leaf.key == key(4, 0, 0)));
    // The opposite corner stays at the root's own split.
    let se = tree
        .hierarchy()
        .iter()
        .find(|(_, node)| node.key() == key(1, 1, 1))
        .map(|(_, node)| node.clone())
        .unwrap();
    assert!(se.is_leaf());

    // 3 coarse siblings at each of depths 1-3, plus 4 at depth 4.
    assert_eq!(out.leaves.len(), 13);
    assert_eq!(out.stats.rendered, 13);
    assert!(out.leaves.iter().all(|leaf| leaf.lag == 0));
    assert_eq!(tree.store().len(), 17);
}

#[test]
fn test_rendered_leaves_partition_the_terrain() {
    let mut tree = TerrainQuadTree::new(&scenario_config(), flat_source(0.0)).unwrap();
    let out = settle(&mut tree, &corner_view());

    let area: f32 = out.leaves.iter().map(|l| l.bounds.footprint_area()).sum();
    assert_eq!(area, 1024.0 * 1024.0);
    for (i, a) in out.leaves.iter().enumerate() {
        for b in &out.leaves[i + 1..] {
            assert_eq!(a.bounds.footprint_overlap(&b.bounds), 0.0);
        }
    }
}

/// Direction from `a` to `b` when their footprints share an edge segment.
fn shared_edge(a: &Aabb, b: &Aabb) -> Option<Direction> {
    let x_overlap = a.max.x.min(b.max.x) - a.min.x.max(b.min.x);
    let z_overlap = a.max.z.min(b.max.z) - a.min.z.max(b.min.z);
    if z_overlap > 0.0 && a.max.x == b.min.x {
        Some(Direction::East)
    } else if z_overlap > 0.0 && a.min.x == b.max.x {
        Some(Direction::West)
    } else if x_overlap > 0.0 && a.max.z == b.min.z {
        Some(Direction::South)
    } else if x_overlap > 0.0 && a.min.z == b.max.z {
        Some(Direction::North)
    } else {
        None
    }
}

#[test]
fn test_finer_leaf_carries_skirt_on_every_depth_change() {
    let mut tree = TerrainQuadTree::new(&scenario_config(), flat_source(0.0)).unwrap();
    let out = settle(&mut tree, &corner_view());

    let mut transitions = 0;
    for a in &out.leaves {
        for b in &out.leaves {
            let Some(direction) = shared_edge(&a.bounds, &b.bounds) else {
                continue;
            };
            if a.depth() > b.depth() {
                transitions += 1;
                assert!(a.edges.has_skirt(direction), "{} -> {}", a.key, b.key);
                assert_eq!(a.edges.depth_delta(direction), a.depth() - b.depth());
                assert!(a.skirts.iter().any(|strip| strip.direction == direction));
            } else if a.depth() == b.depth() {
                assert!(!a.edges.has_skirt(direction), "{} -> {}", a.key, b.key);
            }
        }
    }
    assert!(transitions > 0);

    // Terrain boundary edges are skirted too.
    let corner = out.leaves.iter().find(|l| l.key == key(4, 0, 0)).unwrap();
    assert!(corner.edges.has_skirt(Direction::North));
    assert!(corner.edges.has_skirt(Direction::West));
}

#[test]
fn test_failing_node_degrades_after_retries_and_parent_keeps_rendering() {
    let failing = key(1, 0, 0);
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let source = move |req: &BlockRequest| {
        if req.key == failing {
            counter.fetch_add(1, Ordering::SeqCst);
            return Err(SourceError::Other("corrupt block".into()));
        }
        Ok(flat_block(req.resolution, 0.0))
    };

    let mut config = scenario_config();
    config.terrain.max_depth = 1;
    let mut tree = TerrainQuadTree::new(&config, source).unwrap();
    let view = corner_view();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut saw_three_failures = false;
    let mut degraded_frames = 0;
    while degraded_frames < 50 {
        let out = tree.update(&view);
        assert!(out.leaves.iter().all(|leaf| leaf.key == NodeKey::ROOT));

        let failures = attempts.load(Ordering::SeqCst);
        let degraded = tree.scheduler().is_degraded(failing);
        if failures == 3 && !degraded {
            saw_three_failures = true;
            assert!(tree.node(tree.root()).unwrap().state().has_data());
        }
        if degraded {
            degraded_frames += 1;
            assert_eq!(out.leaves.len(), 1);
        }
        assert!(Instant::now() < deadline, "node never degraded");
        std::thread::sleep(Duration::from_millis(1));
    }

    assert!(saw_three_failures);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    let node = tree
        .hierarchy()
        .iter()
        .find(|(_, node)| node.key() == failing)
        .map(|(_, node)| node.clone())
        .unwrap();
    assert!(node.is_degraded());
    assert_eq!(node.state(), NodeState::Empty);
    assert_eq!(node.load_status().failed_attempts, 4);
}

#[test]
fn test_budget_reduction_evicts_only_leaves() {
    let mut tree = TerrainQuadTree::new(&scenario_config(), flat_source(0.0)).unwrap();
    let view = corner_view();
    settle(&mut tree, &view);

    let interior: Vec<NodeId> = tree
        .hierarchy()
        .iter()
        .filter(|(_, node)| !node.is_leaf())
        .map(|(id, _)| id)
        .collect();
    let resident_before = tree.store().len();
    tree.set_budget((resident_before - 3) * estimate());

    let out = tree.update(&view);
    assert!(out.stats.evicted >= 3);
    assert!(out.stats.resident_bytes <= out.stats.budget_bytes);
    assert!(tree.store().resident_bytes() + tree.scheduler().reserved_bytes() <= tree.store().budget());
    assert!(tree.node(tree.root()).unwrap().patch().is_some());
    for id in interior {
        assert!(tree.node(id).unwrap().patch().is_some());
    }
}

#[test]
fn test_resident_bytes_stay_within_budget_while_flying() {
    let mut config = scenario_config();
    config.streaming.budget_bytes = 12 * estimate();
    let mut tree = TerrainQuadTree::new(&config, flat_source(0.0)).unwrap();

    for frame in 0..300 {
        let t = frame as f32 / 300.0;
        let position = Vec3::new(-10.0 + 1044.0 * t, 0.0, 1044.0 * t - 10.0);
        let out = tree.update(&ViewParams::new(position, 256.0));
        assert!(out.stats.resident_bytes <= out.stats.budget_bytes);
        std::thread::sleep(Duration::from_micros(200));
    }
}

#[test]
fn test_moving_away_merges_back_to_root() {
    let mut tree = TerrainQuadTree::new(&scenario_config(), flat_source(0.0)).unwrap();
    settle(&mut tree, &corner_view());
    assert!(tree.hierarchy().len() > 1);

    let far = ViewParams::new(Vec3::new(-1.0e6, 0.0, 0.0), 256.0);
    let out = tree.update(&far);
    assert_eq!(out.stats.merged, 4);
    assert_eq!(tree.hierarchy().len(), 1);
    assert_eq!(tree.store().len(), 1);
    assert_eq!(out.leaves.len(), 1);
    assert_eq!(out.leaves[0].key, NodeKey::ROOT);
    assert_eq!(out.leaves[0].edges.mask, 0b1111);
}

#[test]
fn test_culled_terrain_is_not_refined_or_rendered() {
    let mut tree = TerrainQuadTree::new(&scenario_config(), flat_source(0.0)).unwrap();
    let eye = Vec3::new(-10.0, 10.0, 512.0);
    let view_projection = Mat4::perspective_rh(std::f32::consts::FRAC_PI_3, 1.0, 0.1, 5000.0)
        * Mat4::look_to_rh(eye, Vec3::NEG_X, Vec3::Y);
    let view = ViewParams::new(eye, 256.0).with_view_projection(&view_projection);

    let out = settle(&mut tree, &view);
    assert!(out.leaves.is_empty());
    assert_eq!(out.stats.culled, 1);
    assert_eq!(tree.hierarchy().len(), 1);
    assert!(tree.node(tree.root()).unwrap().patch().is_some());
}

#[test]
fn test_fallback_frame_renders_parent_while_children_stream() {
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded::<()>();
    let source = move |req: &BlockRequest| {
        if req.depth() > 0 {
            let _ = gate_rx.recv();
        }
        Ok::<_, SourceError>(flat_block(req.resolution, 0.0))
    };
    let mut tree = TerrainQuadTree::new(&scenario_config(), source).unwrap();
    let view = corner_view();

    let deadline = Instant::now() + Duration::from_secs(10);
    while tree.update(&view).leaves.is_empty() {
        assert!(Instant::now() < deadline, "root never loaded");
        std::thread::sleep(Duration::from_millis(1));
    }

    let out = tree.update(&view);
    assert_eq!(out.leaves.len(), 1);
    assert_eq!(out.leaves[0].key, NodeKey::ROOT);
    let children = tree.node(tree.root()).unwrap().children().to_vec();
    assert_eq!(children.len(), 4);
    for child in children {
        let node = tree.node(child).unwrap();
        assert_eq!(node.state(), NodeState::Streaming);
        assert_eq!(node.last_touched(), out.stats.tick);
    }

    drop(gate_tx);
    let out = settle(&mut tree, &view);
    assert_eq!(out.leaves.len(), 13);
}

#[test]
fn test_height_queries_and_lag_reporting() {
    let mut tree = TerrainQuadTree::new(&scenario_config(), flat_source(5.0)).unwrap();
    assert_eq!(tree.height_at(100.0, 100.0), -1.0);

    let view = corner_view();
    let deadline = Instant::now() + Duration::from_secs(10);
    let first = loop {
        let out = tree.update(&view);
        if !out.leaves.is_empty() {
            break out;
        }
        assert!(Instant::now() < deadline, "root never loaded");
        std::thread::sleep(Duration::from_millis(1));
    };
    // Only the root is rendered while the viewer wants depth 4.
    assert_eq!(first.leaves.len(), 1);
    assert_eq!(first.stats.max_lag, 4);
    assert_eq!(first.stats.lagging, 1);
    assert_eq!(first.stats.subdivided, 1);

    let out = settle(&mut tree, &view);
    assert_eq!(out.stats.lagging, 0);
    assert_eq!(tree.height_at(100.0, 100.0), 5.0);
    assert_eq!(tree.height_at(1000.0, 20.0), 5.0);
    assert_eq!(tree.height_at(-50.0, 0.0), -1.0);

    let root_patch = tree.resident_patch(tree.root()).unwrap();
    assert_eq!(root_patch.max_height(), 5.0);
    assert_eq!(tree.node(tree.root()).unwrap().bounds().min.y, 5.0);
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = scenario_config();
    config.terrain.patch_resolution = 0;
    assert!(matches!(
        TerrainQuadTree::new(&config, flat_source(0.0)),
        Err(TerrainError::Config(_))
    ));

    // Grid addresses past depth 32 do not fit in a u32.
    let mut config = scenario_config();
    config.terrain.max_depth = 40;
    assert!(matches!(
        TerrainQuadTree::new(&config, flat_source(0.0)),
        Err(TerrainError::Config(_))
    ));
}

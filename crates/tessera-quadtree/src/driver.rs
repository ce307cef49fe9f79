//! Per-frame orchestration: drain completions, refine the tree against the
//! viewer, emit the stitched render list, merge what is no longer needed and
//! issue loads.

use std::sync::Arc;

use glam::Vec2;
use rustc_hash::FxHashSet;
use tessera_config::Config;
use tessera_math::Aabb;
use tracing::{debug, error, info, warn};

use crate::collision::sample_height;
use crate::error::{PreconditionViolation, TerrainError};
use crate::hierarchy::NodeHierarchy;
use crate::load_queue::{LoadPriorityFactors, compute_priority};
use crate::lod::{LodEvaluator, ViewParams};
use crate::node::{NodeId, NodeKey, NodeState, QuadTreeNode};
use crate::patch::{PatchData, PatchHandle, PatchStore};
use crate::scheduler::{RequestStatus, StreamScheduler};
use crate::source::PatchSource;
use crate::stitching::{EdgeSkirts, SkirtStrip, build_skirt_strips, resolve_edges};

/// A node selected for rendering this frame, with everything needed to
/// upload and draw it.
#[derive(Clone, Debug)]
pub struct RenderLeaf {
    pub node: NodeId,
    pub key: NodeKey,
    pub bounds: Aabb,
    pub patch: PatchHandle,
    pub data: Arc<PatchData>,
    pub edges: EdgeSkirts,
    pub skirts: Vec<SkirtStrip>,
    /// Levels between the rendered depth and the depth the viewer needs.
    pub lag: u8,
}

impl RenderLeaf {
    pub fn depth(&self) -> u8 {
        self.key.depth
    }
}

/// Counters describing one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub tick: u64,
    /// Live nodes in the hierarchy.
    pub nodes: usize,
    /// Leaves handed to the renderer.
    pub rendered: usize,
    /// Selected nodes skipped by frustum culling.
    pub culled: usize,
    pub resident_bytes: usize,
    pub budget_bytes: usize,
    pub in_flight: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub degraded: usize,
    pub stale: usize,
    pub evicted: usize,
    pub deferred: usize,
    pub subdivided: usize,
    pub merged: usize,
    /// Rendered leaves lagging their ideal depth by more than the bound.
    pub lagging: usize,
    pub max_lag: u8,
}

/// Result of [`TerrainQuadTree::update`].
#[derive(Clone, Debug, Default)]
pub struct FrameOutput {
    pub leaves: Vec<RenderLeaf>,
    pub stats: FrameStats,
}

/// Streaming terrain quadtree: owns the hierarchy, the patch store and the
/// loader pool, and is driven once per frame from a single thread.
pub struct TerrainQuadTree {
    hierarchy: NodeHierarchy,
    store: PatchStore,
    scheduler: StreamScheduler,
    evaluator: LodEvaluator,
    max_lag_levels: u8,
    fallback_height: f32,
    tick: u64,
    was_lagging: bool,
}

impl TerrainQuadTree {
    /// Build a tree over the configured extent, reading blocks from `source`.
    pub fn new(config: &Config, source: impl PatchSource) -> Result<Self, TerrainError> {
        Self::with_shared_source(config, Arc::new(source))
    }

    /// Like [`TerrainQuadTree::new`] for a source that is already shared.
    pub fn with_shared_source(
        config: &Config,
        source: Arc<dyn PatchSource>,
    ) -> Result<Self, TerrainError> {
        config.validate()?;
        let terrain = &config.terrain;

        let origin = Vec2::from(terrain.origin);
        let [lo, hi] = terrain.initial_height_range;
        let bounds = Aabb::from_footprint(origin, origin + Vec2::splat(terrain.size), lo, hi);

        let scheduler = StreamScheduler::new(&config.streaming, terrain.patch_resolution, source)?;
        info!(
            size = terrain.size,
            max_depth = terrain.max_depth,
            resolution = terrain.patch_resolution,
            budget = config.streaming.budget_bytes,
            workers = scheduler.worker_count(),
            "terrain quadtree created"
        );

        Ok(Self {
            hierarchy: NodeHierarchy::new(bounds),
            store: PatchStore::new(config.streaming.budget_bytes),
            scheduler,
            evaluator: LodEvaluator::from_config(terrain),
            max_lag_levels: terrain.max_lag_levels,
            fallback_height: terrain.fallback_height,
            tick: 0,
            was_lagging: false,
        })
    }

    pub fn hierarchy(&self) -> &NodeHierarchy {
        &self.hierarchy
    }

    pub fn store(&self) -> &PatchStore {
        &self.store
    }

    pub fn scheduler(&self) -> &StreamScheduler {
        &self.scheduler
    }

    pub fn evaluator(&self) -> &LodEvaluator {
        &self.evaluator
    }

    pub fn root(&self) -> NodeId {
        self.hierarchy.root()
    }

    pub fn node(&self, id: NodeId) -> Option<&QuadTreeNode> {
        self.hierarchy.get(id)
    }

    /// Frames processed so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// True when no load is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    /// Change the byte ceiling. Takes effect at the next frame's eviction step.
    pub fn set_budget(&mut self, bytes: usize) {
        info!(from = self.store.budget(), to = bytes, "patch budget changed");
        self.store.set_budget(bytes);
    }

    /// Shared block of a node, if its data is resident.
    pub fn resident_patch(&self, id: NodeId) -> Option<Arc<PatchData>> {
        let handle = self.hierarchy.get(id)?.patch()?;
        self.store.get(handle).cloned()
    }

    /// Terrain height at `(x, z)` from the finest resident data, or the
    /// configured fallback height where nothing is resident.
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        sample_height(&self.hierarchy, &self.store, x, z).unwrap_or(self.fallback_height)
    }

    /// Run one frame.
    pub fn update(&mut self, view: &ViewParams) -> FrameOutput {
        self.tick += 1;
        let tick = self.tick;
        let mut stats = FrameStats {
            tick,
            ..Default::default()
        };

        // Completions land before traversal so the tree is stable for the frame.
        self.scheduler
            .drain_completions(&mut self.hierarchy, &mut self.store, tick);
        self.scheduler
            .enforce_budget(&mut self.hierarchy, &mut self.store, tick);

        let root = self.hierarchy.root();
        if self
            .hierarchy
            .get(root)
            .is_some_and(|node| node.state() == NodeState::Empty)
        {
            self.request_load(root, view, 0);
        }

        let mut selected = Vec::new();
        self.visit(root, view, &mut selected, &mut stats);

        let leaves = self.collect_leaves(&selected, view, &mut stats);

        self.merge_pass(root, view, &mut stats);
        self.scheduler
            .issue(&mut self.hierarchy, &mut self.store, tick);

        let report = self.scheduler.take_report();
        stats.completed = report.completed;
        stats.failed = report.failed;
        stats.degraded = report.degraded;
        stats.stale = report.stale;
        stats.evicted = report.evicted;
        stats.deferred = report.deferred;
        stats.nodes = self.hierarchy.len();
        stats.resident_bytes = self.store.resident_bytes();
        stats.budget_bytes = self.store.budget();
        stats.in_flight = self.scheduler.in_flight_count();
        stats.pending = self.scheduler.pending_count();

        FrameOutput { leaves, stats }
    }

    /// Refine the subtree at `id`, appending the nodes that form the rendered
    /// surface to `selected`.
    fn visit(
        &mut self,
        id: NodeId,
        view: &ViewParams,
        selected: &mut Vec<NodeId>,
        stats: &mut FrameStats,
    ) {
        let tick = self.tick;
        let Some(node) = self.hierarchy.get(id) else {
            return;
        };
        let (bounds, state, depth, children) =
            (*node.bounds(), node.state(), node.depth(), node.child_array());

        if view.is_visible(&bounds) || state == NodeState::Streaming {
            self.hierarchy.touch(id, tick);
        }
        if !state.has_data() {
            return;
        }

        let sufficient = self.evaluator.is_sufficient(&bounds, view);
        let Some(children) = children else {
            if !sufficient && state == NodeState::Resident && depth < self.evaluator.max_depth() {
                match self.hierarchy.subdivide(id) {
                    Ok(new_children) => {
                        stats.subdivided += 1;
                        let lag = self.lag(depth, &bounds, view);
                        for child in new_children {
                            self.request_load(child, view, lag);
                        }
                    }
                    Err(violation) => report_violation(&violation),
                }
            }
            // Rendered until the children arrive.
            selected.push(id);
            return;
        };

        if sufficient {
            // Children are merged away after the render list is built.
            selected.push(id);
            return;
        }

        let lag = self.lag(depth, &bounds, view);
        let mut all_have_data = true;
        for child in children {
            let child_state = self.hierarchy.get(child).map(|node| node.state());
            match child_state {
                Some(NodeState::Empty) | Some(NodeState::Streaming) => {
                    self.request_load(child, view, lag);
                    all_have_data = false;
                }
                Some(_) => {}
                None => all_have_data = false,
            }
        }

        if all_have_data {
            for child in children {
                self.visit(child, view, selected, stats);
            }
        } else {
            // Keep loaded siblings alive while the rest stream in. Children
            // are not visited here: none is rendered until all have data.
            for child in children {
                self.hierarchy.touch(child, tick);
            }
            selected.push(id);
        }
    }

    fn lag(&self, depth: u8, bounds: &Aabb, view: &ViewParams) -> u8 {
        self.evaluator.ideal_depth(depth, bounds, view) - depth
    }

    fn request_load(&mut self, id: NodeId, view: &ViewParams, lag: u8) -> RequestStatus {
        let distance = self
            .hierarchy
            .get(id)
            .map_or(f32::MAX, |node| node.bounds().distance_to_point(view.position));
        let priority = compute_priority(&LoadPriorityFactors { distance, lag });
        self.scheduler
            .request_load(&mut self.hierarchy, id, self.tick, priority)
    }

    /// Stitch the selected nodes and package the visible ones for rendering.
    fn collect_leaves(
        &mut self,
        selected: &[NodeId],
        view: &ViewParams,
        stats: &mut FrameStats,
    ) -> Vec<RenderLeaf> {
        let rendered: FxHashSet<NodeId> = selected.iter().copied().collect();
        let mut leaves = Vec::with_capacity(selected.len());

        for &id in selected {
            let Some(node) = self.hierarchy.get(id) else {
                continue;
            };
            if !view.is_visible(node.bounds()) {
                stats.culled += 1;
                continue;
            }
            let Some(handle) = node.patch() else {
                continue;
            };
            let Some(data) = self.store.get(handle) else {
                continue;
            };

            let bounds = *node.bounds();
            let edges = resolve_edges(&self.hierarchy, &rendered, &self.evaluator, id);
            let skirts = build_skirt_strips(&bounds, data, &edges);
            let lag = self.lag(node.depth(), &bounds, view);
            if lag > self.max_lag_levels {
                stats.lagging += 1;
            }
            stats.max_lag = stats.max_lag.max(lag);

            leaves.push(RenderLeaf {
                node: id,
                key: node.key(),
                bounds,
                patch: handle,
                data: Arc::clone(data),
                edges,
                skirts,
                lag,
            });
        }
        stats.rendered = leaves.len();

        if stats.lagging > 0 && !self.was_lagging {
            warn!(
                lagging = stats.lagging,
                max_lag = stats.max_lag,
                bound = self.max_lag_levels,
                "rendered terrain lags its ideal detail beyond the staleness bound"
            );
        } else if stats.lagging == 0 && self.was_lagging {
            debug!("rendered terrain back within the staleness bound");
        }
        self.was_lagging = stats.lagging > 0;
        leaves
    }

    /// Post-order merge of subtrees the viewer no longer needs. Returns
    /// whether `id` is a leaf afterwards.
    fn merge_pass(&mut self, id: NodeId, view: &ViewParams, stats: &mut FrameStats) -> bool {
        let Some(children) = self.hierarchy.get(id).and_then(|node| node.child_array()) else {
            return true;
        };

        let mut all_leaves = true;
        for child in children {
            if !self.merge_pass(child, view, stats) {
                all_leaves = false;
            }
        }
        if !all_leaves {
            return false;
        }

        let needed = |tree: &Self, node: NodeId| {
            tree.hierarchy
                .get(node)
                .is_none_or(|n| !tree.evaluator.is_sufficient(n.bounds(), view))
        };
        // The parent must be sufficient too. Its error is at least twice its
        // children's, so merging on the children alone would re-subdivide next frame.
        if needed(self, id) || children.iter().any(|&child| needed(self, child)) {
            return false;
        }

        for child in children {
            self.scheduler.cancel(&mut self.hierarchy, child);
        }
        match self.hierarchy.merge(id) {
            Ok(released) => {
                for handle in released {
                    self.store.release(handle);
                }
                stats.merged += 1;
                true
            }
            Err(violation) => {
                report_violation(&violation);
                false
            }
        }
    }
}

fn report_violation(violation: &PreconditionViolation) {
    error!(%violation, "hierarchy precondition violated");
    debug_assert!(false, "hierarchy precondition violated: {violation}");
}

#[cfg(test)]
#[path = "driver_tests.rs"]
mod tests;

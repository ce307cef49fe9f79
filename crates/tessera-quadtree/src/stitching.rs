//! Crack-free boundaries between rendered nodes at different depths.
//!
//! Every edge of a rendered node is classified against the rendered node on
//! the other side. A coarser neighbor or the terrain boundary gets a vertical
//! skirt hanging from the edge; an equal-depth neighbor shares identical
//! edge samples and needs nothing; a finer neighbor owns the skirt itself.
//! The result depends only on the hierarchy and the rendered set, so leaves
//! can be resolved in any order.

use bytemuck::{Pod, Zeroable};
use rustc_hash::FxHashSet;
use tessera_math::Aabb;

use crate::hierarchy::NodeHierarchy;
use crate::lod::LodEvaluator;
use crate::node::{Direction, NodeId};
use crate::patch::PatchData;

/// Per-edge stitching decisions for one rendered node, indexed by
/// [`Direction::index`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EdgeSkirts {
    /// Bit `d` set when edge `d` carries a skirt.
    pub mask: u8,
    /// Depth difference to the coarser neighbor (0 for boundary or no skirt).
    pub depth_delta: [u8; 4],
    /// How far each skirt hangs below the edge.
    pub skirt_depth: [f32; 4],
}

impl EdgeSkirts {
    pub fn has_skirt(&self, direction: Direction) -> bool {
        self.mask & direction.bit() != 0
    }

    pub fn depth_delta(&self, direction: Direction) -> u8 {
        self.depth_delta[direction.index()]
    }

    pub fn skirt_depth(&self, direction: Direction) -> f32 {
        self.skirt_depth[direction.index()]
    }

    fn set(&mut self, direction: Direction, delta: u8, depth: f32) {
        self.mask |= direction.bit();
        self.depth_delta[direction.index()] = delta;
        self.skirt_depth[direction.index()] = depth;
    }
}

/// One skirt vertex, laid out for direct upload.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SkirtVertex {
    pub position: [f32; 3],
}

/// Triangle-strip skirt along one edge: top and bottom vertices alternate.
#[derive(Clone, Debug, PartialEq)]
pub struct SkirtStrip {
    pub direction: Direction,
    pub vertices: Vec<SkirtVertex>,
}

/// Classify each edge of a rendered node.
///
/// `rendered` is the full set of nodes forming the rendered surface,
/// including nodes culled from the render list.
pub fn resolve_edges(
    hierarchy: &NodeHierarchy,
    rendered: &FxHashSet<NodeId>,
    evaluator: &LodEvaluator,
    id: NodeId,
) -> EdgeSkirts {
    let mut skirts = EdgeSkirts::default();
    let Some(node) = hierarchy.get(id) else {
        return skirts;
    };

    for direction in Direction::ALL {
        let Some(neighbor) = hierarchy.find_neighbor(id, direction) else {
            let depth = height_span(node.bounds(), node.bounds())
                .max(evaluator.geometric_error(node.bounds()));
            skirts.set(direction, 0, depth);
            continue;
        };
        let Some(covering) = rendered_ancestor_or_self(hierarchy, rendered, neighbor) else {
            // The region across is rendered finer; its nodes carry the skirt.
            continue;
        };
        let Some(other) = hierarchy.get(covering) else {
            continue;
        };
        if other.depth() < node.depth() {
            let depth = height_span(node.bounds(), other.bounds())
                .max(evaluator.geometric_error(other.bounds()));
            skirts.set(direction, node.depth() - other.depth(), depth);
        }
    }
    skirts
}

/// The first node at or above `id` that is part of the rendered set.
fn rendered_ancestor_or_self(
    hierarchy: &NodeHierarchy,
    rendered: &FxHashSet<NodeId>,
    id: NodeId,
) -> Option<NodeId> {
    let mut current = Some(id);
    while let Some(node_id) = current {
        if rendered.contains(&node_id) {
            return Some(node_id);
        }
        current = hierarchy.get(node_id).and_then(|node| node.parent());
    }
    None
}

/// Vertical extent covering both boxes: the largest step that can open
/// between their surfaces along a shared edge.
fn height_span(a: &Aabb, b: &Aabb) -> f32 {
    a.max.y.max(b.max.y) - a.min.y.min(b.min.y)
}

/// Build skirt strips for every skirted edge from the block's edge rows.
pub fn build_skirt_strips(bounds: &Aabb, patch: &PatchData, skirts: &EdgeSkirts) -> Vec<SkirtStrip> {
    Direction::ALL
        .into_iter()
        .filter(|&direction| skirts.has_skirt(direction))
        .map(|direction| {
            let heights = patch.skirt_template().edge(direction);
            let drop = skirts.skirt_depth(direction);
            let steps = heights.len().saturating_sub(1).max(1) as f32;

            let mut vertices = Vec::with_capacity(heights.len() * 2);
            for (k, &h) in heights.iter().enumerate() {
                let t = k as f32 / steps;
                let (x, z) = match direction {
                    Direction::North => (lerp(bounds.min.x, bounds.max.x, t), bounds.min.z),
                    Direction::South => (lerp(bounds.min.x, bounds.max.x, t), bounds.max.z),
                    Direction::West => (bounds.min.x, lerp(bounds.min.z, bounds.max.z, t)),
                    Direction::East => (bounds.max.x, lerp(bounds.min.z, bounds.max.z, t)),
                };
                vertices.push(SkirtVertex {
                    position: [x, h, z],
                });
                vertices.push(SkirtVertex {
                    position: [x, h - drop, z],
                });
            }
            SkirtStrip {
                direction,
                vertices,
            }
        })
        .collect()
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use glam::Vec2;

    use super::*;
    use crate::patch::PatchStore;

    struct Fixture {
        hierarchy: NodeHierarchy,
        store: PatchStore,
        evaluator: LodEvaluator,
    }

    impl Fixture {
        fn new() -> Self {
            let mut fixture = Self {
                hierarchy: NodeHierarchy::new(Aabb::from_footprint(
                    Vec2::ZERO,
                    Vec2::splat(1024.0),
                    0.0,
                    0.0,
                )),
                store: PatchStore::new(usize::MAX),
                evaluator: LodEvaluator::new(16.0, 16, 8),
            };
            let root = fixture.hierarchy.root();
            fixture.load(root);
            fixture
        }

        fn load(&mut self, id: NodeId) {
            let handle = self
                .store
                .insert(PatchData::from_samples(1, vec![0.0; 4], vec![0; 4]).unwrap());
            self.hierarchy.mark_streaming(id, 1).unwrap();
            self.hierarchy.mark_resident(id, handle, 0.0, 0.0).unwrap();
        }

        fn split(&mut self, id: NodeId) -> [NodeId; 4] {
            let children = self.hierarchy.subdivide(id).unwrap();
            for child in children {
                self.load(child);
            }
            children
        }

        fn resolve(&self, rendered: &FxHashSet<NodeId>, id: NodeId) -> EdgeSkirts {
            resolve_edges(&self.hierarchy, rendered, &self.evaluator, id)
        }
    }

    #[test]
    fn test_uniform_depth_only_boundary_skirts() {
        let mut fx = Fixture::new();
        let root = fx.hierarchy.root();
        let [nw, ne, sw, se] = fx.split(root);
        let rendered: FxHashSet<_> = [nw, ne, sw, se].into_iter().collect();

        let skirts = fx.resolve(&rendered, nw);
        assert!(skirts.has_skirt(Direction::North));
        assert!(skirts.has_skirt(Direction::West));
        assert!(!skirts.has_skirt(Direction::East));
        assert!(!skirts.has_skirt(Direction::South));
        assert_eq!(skirts.depth_delta(Direction::North), 0);

        let skirts = fx.resolve(&rendered, se);
        assert_eq!(
            skirts.mask,
            Direction::East.bit() | Direction::South.bit()
        );
    }

    #[test]
    fn test_finer_side_owns_the_skirt() {
        let mut fx = Fixture::new();
        let root = fx.hierarchy.root();
        let [nw, ne, sw, se] = fx.split(root);
        let nw_children = fx.split(nw);
        let rendered: FxHashSet<_> = nw_children.into_iter().chain([ne, sw, se]).collect();

        // NW.NE borders the coarser NE node on its east edge.
        let skirts = fx.resolve(&rendered, nw_children[1]);
        assert!(skirts.has_skirt(Direction::East));
        assert_eq!(skirts.depth_delta(Direction::East), 1);
        // 512-unit node at resolution 16.
        assert_eq!(skirts.skirt_depth(Direction::East), 32.0);
        assert!(!skirts.has_skirt(Direction::West));

        // NW.SE borders NE on the east and SW on the south.
        let skirts = fx.resolve(&rendered, nw_children[3]);
        assert!(skirts.has_skirt(Direction::East));
        assert!(skirts.has_skirt(Direction::South));

        // The coarse side does nothing toward the finer region.
        let skirts = fx.resolve(&rendered, ne);
        assert!(!skirts.has_skirt(Direction::West));
        let skirts = fx.resolve(&rendered, sw);
        assert!(!skirts.has_skirt(Direction::North));
    }

    #[test]
    fn test_fallback_parent_counts_as_rendered() {
        let mut fx = Fixture::new();
        let root = fx.hierarchy.root();
        let [nw, ne, sw, se] = fx.split(root);
        // NW split but its children are not rendered yet.
        let nw_children = fx.hierarchy.subdivide(nw).unwrap();
        let rendered: FxHashSet<_> = [nw, ne, sw, se].into_iter().collect();

        assert!(!fx.resolve(&rendered, ne).has_skirt(Direction::West));
        assert!(!fx.resolve(&rendered, nw).has_skirt(Direction::East));
        assert!(fx.hierarchy.contains(nw_children[0]));
    }

    #[test]
    fn test_two_level_delta() {
        let mut fx = Fixture::new();
        let root = fx.hierarchy.root();
        let [nw, ne, sw, se] = fx.split(root);
        let nw_children = fx.split(nw);
        let deep = fx.split(nw_children[1]);
        let rendered: FxHashSet<_> = deep
            .into_iter()
            .chain([nw_children[0], nw_children[2], nw_children[3], ne, sw, se])
            .collect();

        // The NE-most grandchild of NW.NE sits against NE, two levels up.
        let skirts = fx.resolve(&rendered, deep[1]);
        assert_eq!(skirts.depth_delta(Direction::East), 2);
        assert!(skirts.has_skirt(Direction::North));
        assert_eq!(skirts.depth_delta(Direction::North), 0);
    }

    #[test]
    fn test_skirt_strip_geometry() {
        let side = PatchData::samples_per_side(2);
        let heights = (0..side * side).map(|k| k as f32).collect();
        let patch = PatchData::from_samples(2, heights, vec![0; side * side]).unwrap();
        let bounds = Aabb::from_footprint(Vec2::new(10.0, 20.0), Vec2::new(14.0, 24.0), 0.0, 8.0);
        let mut skirts = EdgeSkirts::default();
        skirts.set(Direction::North, 1, 5.0);
        skirts.set(Direction::East, 1, 2.0);

        let strips = build_skirt_strips(&bounds, &patch, &skirts);
        assert_eq!(strips.len(), 2);

        let north = &strips[0];
        assert_eq!(north.direction, Direction::North);
        assert_eq!(north.vertices.len(), 6);
        assert_eq!(north.vertices[0].position, [10.0, 0.0, 20.0]);
        assert_eq!(north.vertices[1].position, [10.0, -5.0, 20.0]);
        assert_eq!(north.vertices[4].position, [14.0, 2.0, 20.0]);

        let east = &strips[1];
        assert_eq!(east.direction, Direction::East);
        assert_eq!(east.vertices[2].position, [14.0, 5.0, 22.0]);
        assert_eq!(east.vertices[5].position, [14.0, 6.0, 24.0]);

        let bytes: &[u8] = bytemuck::cast_slice(&east.vertices);
        assert_eq!(bytes.len(), 6 * 12);
    }
}

//! Arena-backed quadtree: geometric partitioning, parent/child/neighbor
//! relationships and per-node state transitions.
//!
//! Nodes live in a slot arena addressed by generational [`NodeId`]s. A parent
//! owns its children's slots; parent and neighbor links are plain ids that go
//! stale (and are detected as such) once the referenced node is destroyed.

use glam::Vec2;
use tessera_math::Aabb;

use crate::error::PreconditionViolation;
use crate::node::{Direction, NodeId, NodeKey, NodeState, Quadrant, QuadTreeNode};
use crate::patch::PatchHandle;

struct Slot {
    generation: u32,
    node: Option<QuadTreeNode>,
}

/// The node hierarchy. The root always exists.
pub struct NodeHierarchy {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
    live: usize,
}

impl NodeHierarchy {
    /// Create a hierarchy holding a single `Empty` root covering `bounds`.
    pub fn new(bounds: Aabb) -> Self {
        let mut hierarchy = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId::new(0, 0),
            live: 0,
        };
        hierarchy.root = hierarchy.allocate(QuadTreeNode::new(NodeKey::ROOT, bounds, None, None));
        hierarchy
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Look up a node; `None` for destroyed nodes and recycled slots.
    pub fn get(&self, id: NodeId) -> Option<&QuadTreeNode> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut QuadTreeNode> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_mut())
    }

    fn node(&self, id: NodeId) -> Result<&QuadTreeNode, PreconditionViolation> {
        self.get(id).ok_or(PreconditionViolation::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut QuadTreeNode, PreconditionViolation> {
        self.get_mut(id).ok_or(PreconditionViolation::UnknownNode(id))
    }

    /// Iterate over all live nodes in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &QuadTreeNode)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node
                .as_ref()
                .map(|node| (NodeId::new(index as u32, slot.generation), node))
        })
    }

    /// Ids of all childless nodes.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, node)| node.is_leaf())
            .map(|(id, _)| id)
            .collect()
    }

    fn allocate(&mut self, node: QuadTreeNode) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId::new(index, slot.generation)
        } else {
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId::new((self.slots.len() - 1) as u32, 0)
        }
    }

    fn destroy(&mut self, id: NodeId) -> Option<QuadTreeNode> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        self.live -= 1;
        Some(node)
    }

    /// Split a resident leaf into four `Empty` children.
    ///
    /// Children partition the parent's footprint at its midpoint and inherit
    /// its height range. The parent enters `Subdividing` until every child
    /// has data.
    pub fn subdivide(&mut self, id: NodeId) -> Result<[NodeId; 4], PreconditionViolation> {
        let node = self.node(id)?;
        if node.children.is_some() {
            return Err(PreconditionViolation::AlreadySubdivided(id));
        }
        if node.state != NodeState::Resident {
            return Err(PreconditionViolation::SubdivideNotResident {
                node: id,
                state: node.state,
            });
        }

        let key = node.key;
        let [Some(nw), Some(ne), Some(sw), Some(se)] = Quadrant::ALL.map(|q| key.child(q)) else {
            return Err(PreconditionViolation::DepthLimit(id));
        };
        let child_keys = [nw, ne, sw, se];
        let bounds = node.bounds;
        let mid = Vec2::new(bounds.center().x, bounds.center().z);
        let (lo, hi) = (bounds.min.y, bounds.max.y);

        let children = Quadrant::ALL.map(|quadrant| {
            let min_x = if quadrant.is_east() { mid.x } else { bounds.min.x };
            let max_x = if quadrant.is_east() { bounds.max.x } else { mid.x };
            let min_z = if quadrant.is_south() { mid.y } else { bounds.min.z };
            let max_z = if quadrant.is_south() { bounds.max.z } else { mid.y };
            let child_bounds =
                Aabb::from_footprint(Vec2::new(min_x, min_z), Vec2::new(max_x, max_z), lo, hi);
            QuadTreeNode::new(
                child_keys[quadrant.index()],
                child_bounds,
                Some(quadrant),
                Some(id),
            )
        });
        let ids = children.map(|child| self.allocate(child));

        let node = self.node_mut(id)?;
        node.children = Some(ids);
        node.state = NodeState::Subdividing;
        Ok(ids)
    }

    /// Destroy a node's four leaf children and return the handles they held.
    ///
    /// Every child must be a leaf in `Resident` or `Empty` state and the node
    /// itself must hold data. The caller releases the returned handles from
    /// the patch store.
    pub fn merge(&mut self, id: NodeId) -> Result<Vec<PatchHandle>, PreconditionViolation> {
        let node = self.node(id)?;
        let children = node
            .children
            .ok_or(PreconditionViolation::NotSubdivided(id))?;
        if !node.state.has_data() {
            return Err(PreconditionViolation::MergeWithoutData(id));
        }
        for &child_id in &children {
            let child = self.node(child_id)?;
            if child.children.is_some() {
                return Err(PreconditionViolation::ChildSubdivided {
                    node: id,
                    child: child_id,
                });
            }
            if !matches!(child.state, NodeState::Resident | NodeState::Empty) {
                return Err(PreconditionViolation::ChildBusy {
                    node: id,
                    child: child_id,
                    state: child.state,
                });
            }
        }

        self.node_mut(id)?.state = NodeState::Merging;
        let released = children
            .iter()
            .filter_map(|&child_id| self.destroy(child_id))
            .filter_map(|child| child.patch)
            .collect();

        let node = self.node_mut(id)?;
        node.children = None;
        node.state = NodeState::Resident;
        Ok(released)
    }

    /// `Empty` → `Streaming`, recording the request epoch.
    pub fn mark_streaming(&mut self, id: NodeId, epoch: u64) -> Result<(), PreconditionViolation> {
        let node = self.node_mut(id)?;
        if node.state != NodeState::Empty {
            return Err(PreconditionViolation::UnexpectedState {
                node: id,
                state: node.state,
                expected: NodeState::Empty,
            });
        }
        node.state = NodeState::Streaming;
        node.load.epoch = epoch;
        Ok(())
    }

    /// `Streaming` → `Resident`: attach the block and adopt its height range.
    ///
    /// Ancestor bounds grow to enclose the refined range, and a `Subdividing`
    /// parent returns to `Resident` once all its children have data.
    pub fn mark_resident(
        &mut self,
        id: NodeId,
        handle: PatchHandle,
        min_height: f32,
        max_height: f32,
    ) -> Result<(), PreconditionViolation> {
        let node = self.node_mut(id)?;
        if node.state != NodeState::Streaming {
            return Err(PreconditionViolation::UnexpectedState {
                node: id,
                state: node.state,
                expected: NodeState::Streaming,
            });
        }
        node.state = NodeState::Resident;
        node.patch = Some(handle);
        node.bounds = node.bounds.with_height_range(min_height, max_height);

        let mut bounds = node.bounds;
        let mut parent = node.parent;
        while let Some(parent_id) = parent {
            let Some(ancestor) = self.get_mut(parent_id) else {
                break;
            };
            ancestor.bounds = ancestor.bounds.union(&bounds);
            bounds = ancestor.bounds;
            parent = ancestor.parent;
        }

        self.refresh_parent(id);
        Ok(())
    }

    /// `Streaming` → `Empty` after a failed or cancelled load.
    pub fn mark_empty(&mut self, id: NodeId) -> Result<(), PreconditionViolation> {
        let node = self.node_mut(id)?;
        if node.state != NodeState::Streaming {
            return Err(PreconditionViolation::UnexpectedState {
                node: id,
                state: node.state,
                expected: NodeState::Streaming,
            });
        }
        node.state = NodeState::Empty;
        Ok(())
    }

    /// Drop a resident leaf's data (`Resident` → `Empty`) and return its
    /// handle for release from the store. The root is never released.
    pub fn release_patch(&mut self, id: NodeId) -> Result<PatchHandle, PreconditionViolation> {
        if id == self.root {
            return Err(PreconditionViolation::EvictRoot);
        }
        let node = self.node_mut(id)?;
        if node.children.is_some() {
            return Err(PreconditionViolation::EvictInterior(id));
        }
        let handle = match (node.state, node.patch) {
            (NodeState::Resident, Some(handle)) => handle,
            (state, _) => {
                return Err(PreconditionViolation::UnexpectedState {
                    node: id,
                    state,
                    expected: NodeState::Resident,
                });
            }
        };
        node.state = NodeState::Empty;
        node.patch = None;
        self.refresh_parent(id);
        Ok(handle)
    }

    /// Record use of a node at `tick`.
    pub fn touch(&mut self, id: NodeId, tick: u64) {
        if let Some(node) = self.get_mut(id) {
            node.last_touched = tick;
        }
    }

    /// Re-derive a parent's state from its children: `Resident` when all
    /// children hold data, `Subdividing` otherwise.
    fn refresh_parent(&mut self, child: NodeId) {
        let Some(parent_id) = self.get(child).and_then(|node| node.parent) else {
            return;
        };
        let Some(children) = self.get(parent_id).and_then(|parent| parent.children) else {
            return;
        };
        let all_have_data = children
            .iter()
            .all(|&c| self.get(c).is_some_and(|node| node.state.has_data()));
        if let Some(parent) = self.get_mut(parent_id)
            && matches!(parent.state, NodeState::Resident | NodeState::Subdividing)
        {
            parent.state = if all_have_data {
                NodeState::Resident
            } else {
                NodeState::Subdividing
            };
        }
    }

    /// The deepest node at depth ≤ `id`'s depth adjacent across `direction`,
    /// or `None` at the terrain boundary.
    ///
    /// Climbs until the edge is crossed inside a common ancestor, then
    /// descends the mirrored path as far as the tree goes.
    pub fn find_neighbor(&self, id: NodeId, direction: Direction) -> Option<NodeId> {
        let node = self.get(id)?;
        let parent_id = node.parent?;
        let quadrant = node.quadrant?;
        let parent = self.get(parent_id)?;
        let siblings = parent.children?;

        if let Some(sibling) = quadrant.sibling_toward(direction) {
            return Some(siblings[sibling.index()]);
        }

        let across = self.find_neighbor(parent_id, direction)?;
        let across_node = self.get(across)?;
        match across_node.children {
            Some(children) if across_node.depth() == parent.depth() => {
                Some(children[quadrant.mirrored(direction).index()])
            }
            _ => Some(across),
        }
    }

    /// Resident non-root leaves not touched at or after `protected_tick`,
    /// least recently touched first.
    pub fn eviction_candidates(&self, protected_tick: u64) -> Vec<NodeId> {
        let mut candidates: Vec<(u64, NodeId)> = self
            .iter()
            .filter(|&(id, node)| {
                id != self.root
                    && node.is_leaf()
                    && node.state == NodeState::Resident
                    && node.last_touched < protected_tick
            })
            .map(|(id, node)| (node.last_touched, id))
            .collect();
        candidates.sort_unstable();
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    /// Deepest node whose footprint contains `(x, z)` and satisfies `accept`,
    /// descending only through nodes that satisfy it.
    pub fn deepest_containing(
        &self,
        x: f32,
        z: f32,
        accept: impl Fn(&QuadTreeNode) -> bool,
    ) -> Option<NodeId> {
        let root = self.get(self.root)?;
        if !root.bounds.contains_xz(x, z) || !accept(root) {
            return None;
        }
        let mut current = self.root;
        while let Some(children) = self.get(current).and_then(|node| node.children) {
            let next = children.into_iter().find(|&child| {
                self.get(child)
                    .is_some_and(|node| node.bounds.contains_xz(x, z) && accept(node))
            });
            match next {
                Some(child) => current = child,
                None => break,
            }
        }
        Some(current)
    }
}

#[cfg(test)]
#[path = "hierarchy_tests.rs"]
mod tests;

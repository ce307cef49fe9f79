//! Quadtree node identity, addressing and per-node state.

use std::fmt;

use tessera_config::MAX_TERRAIN_DEPTH;
use tessera_math::Aabb;

use crate::patch::PatchHandle;

/// Generational index of a node in the hierarchy arena.
///
/// A destroyed node's slot may be reused; the generation distinguishes the
/// new occupant from stale references to the old one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot index.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Generation of the slot when this id was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Grid address of a node: depth plus column/row at that depth.
///
/// Used to address backing storage; stable across node recreation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    /// Depth (0 = root).
    pub depth: u8,
    /// Column, increasing toward +x (east).
    pub x: u32,
    /// Row, increasing toward +z (south).
    pub y: u32,
}

impl NodeKey {
    /// Address of the root node.
    pub const ROOT: NodeKey = NodeKey {
        depth: 0,
        x: 0,
        y: 0,
    };

    /// Address of the child in the given quadrant, or `None` when the
    /// child would lie below the deepest addressable level.
    pub fn child(&self, quadrant: Quadrant) -> Option<NodeKey> {
        if self.depth >= MAX_TERRAIN_DEPTH {
            return None;
        }
        Some(NodeKey {
            depth: self.depth + 1,
            x: self.x.checked_mul(2)? + u32::from(quadrant.is_east()),
            y: self.y.checked_mul(2)? + u32::from(quadrant.is_south()),
        })
    }

    /// Address of the parent, or `None` for the root.
    pub fn parent(&self) -> Option<NodeKey> {
        (self.depth > 0).then(|| NodeKey {
            depth: self.depth - 1,
            x: self.x / 2,
            y: self.y / 2,
        })
    }

    /// Which quadrant of its parent this key occupies (`None` for the root).
    pub fn quadrant(&self) -> Option<Quadrant> {
        (self.depth > 0).then(|| Quadrant::from_bits(self.x & 1 == 1, self.y & 1 == 1))
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}_{}", self.depth, self.x, self.y)
    }
}

/// Child position within a parent. Children are always stored in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Quadrant {
    NorthWest = 0,
    NorthEast = 1,
    SouthWest = 2,
    SouthEast = 3,
}

impl Quadrant {
    /// All quadrants in storage order.
    pub const ALL: [Quadrant; 4] = [
        Quadrant::NorthWest,
        Quadrant::NorthEast,
        Quadrant::SouthWest,
        Quadrant::SouthEast,
    ];

    /// Storage index (0..4).
    pub fn index(self) -> usize {
        self as usize
    }

    fn from_bits(east: bool, south: bool) -> Quadrant {
        Quadrant::ALL[usize::from(east) | (usize::from(south) << 1)]
    }

    /// True for the two quadrants on the +x side.
    pub fn is_east(self) -> bool {
        self.index() & 1 == 1
    }

    /// True for the two quadrants on the +z side.
    pub fn is_south(self) -> bool {
        self.index() & 2 == 2
    }

    /// The sibling adjacent across `direction`, if it lies inside the same parent.
    pub fn sibling_toward(self, direction: Direction) -> Option<Quadrant> {
        let (east, south) = (self.is_east(), self.is_south());
        match direction {
            Direction::East if !east => Some(Quadrant::from_bits(true, south)),
            Direction::West if east => Some(Quadrant::from_bits(false, south)),
            Direction::South if !south => Some(Quadrant::from_bits(east, true)),
            Direction::North if south => Some(Quadrant::from_bits(east, false)),
            _ => None,
        }
    }

    /// Reflection of this quadrant across the edge facing `direction`: the
    /// quadrant of the neighboring parent that touches this one.
    pub fn mirrored(self, direction: Direction) -> Quadrant {
        match direction {
            Direction::East | Direction::West => Quadrant::from_bits(!self.is_east(), self.is_south()),
            Direction::North | Direction::South => {
                Quadrant::from_bits(self.is_east(), !self.is_south())
            }
        }
    }
}

/// Edge directions. North is -z, east is +x.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    North = 0,
    East = 1,
    South = 2,
    West = 3,
}

impl Direction {
    /// All directions, indexable by [`Direction::index`].
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
    ];

    /// Index into per-edge arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The facing direction.
    pub fn opposite(self) -> Direction {
        Direction::ALL[(self.index() + 2) % 4]
    }

    /// Single-bit mask for this edge.
    pub fn bit(self) -> u8 {
        1 << self.index()
    }
}

/// Streaming/structural state of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum NodeState {
    /// No data resident and no load outstanding.
    #[default]
    Empty,
    /// A load is queued or in flight.
    Streaming,
    /// Data is resident.
    Resident,
    /// Data is resident and freshly created children are still streaming.
    Subdividing,
    /// Data is resident and the children are being torn down.
    Merging,
}

impl NodeState {
    /// Whether the node's patch handle is valid in this state.
    pub fn has_data(self) -> bool {
        matches!(
            self,
            NodeState::Resident | NodeState::Subdividing | NodeState::Merging
        )
    }
}

/// Load bookkeeping: request epoch, failures and retry backoff.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadStatus {
    /// Epoch of the most recent load request.
    pub epoch: u64,
    /// Consecutive failed attempts.
    pub failed_attempts: u32,
    /// No retry is issued before this tick.
    pub retry_after: u64,
    /// Retries are exhausted; the node is never loaded again.
    pub degraded: bool,
}

/// One square region of terrain at one depth.
#[derive(Clone, Debug)]
pub struct QuadTreeNode {
    pub(crate) key: NodeKey,
    pub(crate) bounds: Aabb,
    pub(crate) quadrant: Option<Quadrant>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Option<[NodeId; 4]>,
    pub(crate) state: NodeState,
    pub(crate) patch: Option<PatchHandle>,
    pub(crate) last_touched: u64,
    pub(crate) load: LoadStatus,
}

impl QuadTreeNode {
    pub(crate) fn new(
        key: NodeKey,
        bounds: Aabb,
        quadrant: Option<Quadrant>,
        parent: Option<NodeId>,
    ) -> Self {
        Self {
            key,
            bounds,
            quadrant,
            parent,
            children: None,
            state: NodeState::Empty,
            patch: None,
            last_touched: 0,
            load: LoadStatus::default(),
        }
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn depth(&self) -> u8 {
        self.key.depth
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    /// Position within the parent (`None` for the root).
    pub fn quadrant(&self) -> Option<Quadrant> {
        self.quadrant
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in NW, NE, SW, SE order: either empty or exactly four.
    pub fn children(&self) -> &[NodeId] {
        match &self.children {
            Some(children) => children,
            None => &[],
        }
    }

    pub fn child_array(&self) -> Option<[NodeId; 4]> {
        self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Handle of the resident block; `Some` exactly when the state has data.
    pub fn patch(&self) -> Option<PatchHandle> {
        self.patch
    }

    pub fn last_touched(&self) -> u64 {
        self.last_touched
    }

    pub fn load_status(&self) -> &LoadStatus {
        &self.load
    }

    pub fn is_degraded(&self) -> bool {
        self.load.degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_keys_and_parent_roundtrip() {
        let key = NodeKey {
            depth: 2,
            x: 3,
            y: 1,
        };
        for quadrant in Quadrant::ALL {
            let child = key.child(quadrant).unwrap();
            assert_eq!(child.depth, 3);
            assert_eq!(child.parent(), Some(key));
            assert_eq!(child.quadrant(), Some(quadrant));
        }
        assert_eq!(
            key.child(Quadrant::SouthEast),
            Some(NodeKey { depth: 3, x: 7, y: 3 })
        );
        assert_eq!(NodeKey::ROOT.parent(), None);
    }

    #[test]
    fn test_no_child_keys_below_deepest_level() {
        let last = NodeKey {
            depth: MAX_TERRAIN_DEPTH - 1,
            x: u32::MAX >> 1,
            y: u32::MAX >> 1,
        };
        let deepest = last.child(Quadrant::SouthEast).unwrap();
        assert_eq!(deepest.x, u32::MAX);
        assert_eq!(deepest.y, u32::MAX);
        for quadrant in Quadrant::ALL {
            assert_eq!(deepest.child(quadrant), None);
        }
    }

    #[test]
    fn test_sibling_toward() {
        use Direction::*;
        use Quadrant::*;
        assert_eq!(NorthWest.sibling_toward(East), Some(NorthEast));
        assert_eq!(NorthWest.sibling_toward(South), Some(SouthWest));
        assert_eq!(NorthWest.sibling_toward(West), None);
        assert_eq!(NorthWest.sibling_toward(North), None);
        assert_eq!(SouthEast.sibling_toward(North), Some(NorthEast));
        assert_eq!(SouthEast.sibling_toward(West), Some(SouthWest));
    }

    #[test]
    fn test_mirrored() {
        use Direction::*;
        use Quadrant::*;
        assert_eq!(NorthEast.mirrored(East), NorthWest);
        assert_eq!(SouthWest.mirrored(South), NorthWest);
        assert_eq!(NorthWest.mirrored(North), SouthWest);
        assert_eq!(SouthWest.mirrored(West), SouthEast);
    }

    #[test]
    fn test_direction_helpers() {
        assert_eq!(Direction::North.opposite(), Direction::South);
        assert_eq!(Direction::West.opposite(), Direction::East);
        let mask = Direction::ALL.iter().fold(0u8, |acc, d| acc | d.bit());
        assert_eq!(mask, 0b1111);
    }

    #[test]
    fn test_state_has_data() {
        assert!(!NodeState::Empty.has_data());
        assert!(!NodeState::Streaming.has_data());
        assert!(NodeState::Resident.has_data());
        assert!(NodeState::Subdividing.has_data());
    }

    #[test]
    fn test_key_display() {
        let key = NodeKey { depth: 4, x: 9, y: 2 };
        assert_eq!(key.to_string(), "4/9_2");
    }
}

//! Error types for the terrain quadtree.

use tessera_config::ConfigError;

use crate::node::{NodeId, NodeKey, NodeState};

/// A hierarchy operation was invoked outside its contract.
///
/// These are programming errors: the traversal driver asserts on them in
/// debug builds and treats them as no-ops in release builds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionViolation {
    /// The id refers to a destroyed node or a recycled slot.
    #[error("node {0:?} no longer exists")]
    UnknownNode(NodeId),

    /// Subdivision requires a resident node.
    #[error("cannot subdivide node {node:?} in state {state:?}")]
    SubdivideNotResident { node: NodeId, state: NodeState },

    /// Subdivision requires a childless node.
    #[error("node {0:?} already has children")]
    AlreadySubdivided(NodeId),

    /// The node sits at the deepest addressable level.
    #[error("node {0:?} is at the deepest addressable level")]
    DepthLimit(NodeId),

    /// Merge requires a node with children.
    #[error("node {0:?} has no children to merge")]
    NotSubdivided(NodeId),

    /// Merge requires the parent's own data to be resident.
    #[error("cannot merge node {0:?}: its own data is not resident")]
    MergeWithoutData(NodeId),

    /// Merge requires every child to be `Resident` or `Empty`.
    #[error("cannot merge node {node:?}: child {child:?} is {state:?}")]
    ChildBusy {
        node: NodeId,
        child: NodeId,
        state: NodeState,
    },

    /// Merge requires every child to be a leaf.
    #[error("cannot merge node {node:?}: child {child:?} has children")]
    ChildSubdivided { node: NodeId, child: NodeId },

    /// A state transition was requested from the wrong state.
    #[error("node {node:?} is {state:?}, expected {expected:?}")]
    UnexpectedState {
        node: NodeId,
        state: NodeState,
        expected: NodeState,
    },

    /// The root is never evicted.
    #[error("the root node cannot be evicted")]
    EvictRoot,

    /// Only childless nodes are evicted.
    #[error("node {0:?} has children and cannot be evicted")]
    EvictInterior(NodeId),
}

/// Failure reported by backing storage.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// No block exists for the requested node.
    #[error("no block stored for {0}")]
    NotFound(NodeKey),

    /// Reading the block failed.
    #[error("failed to read block: {0}")]
    Io(#[from] std::io::Error),

    /// Any other source-specific failure.
    #[error("{0}")]
    Other(String),
}

/// A block's bytes do not form a valid patch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// The byte length does not match the patch resolution.
    #[error("block is {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },

    /// A height sample is NaN or infinite.
    #[error("height sample {index} is not finite")]
    NonFiniteHeight { index: usize },
}

/// Loading a node's block failed; recoverable through retries.
#[derive(Debug, thiserror::Error)]
pub enum StreamingFailure {
    /// The backing source could not produce the block.
    #[error("source read failed for {key}: {source}")]
    Source { key: NodeKey, source: SourceError },

    /// The block bytes could not be decoded.
    #[error("decode failed for {key}: {source}")]
    Decode { key: NodeKey, source: DecodeError },
}

/// Errors constructing a terrain quadtree.
#[derive(Debug, thiserror::Error)]
pub enum TerrainError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A loader thread could not be spawned.
    #[error("failed to spawn loader thread: {0}")]
    Spawn(#[source] std::io::Error),
}

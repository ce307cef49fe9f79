//! Streaming terrain quadtree: a view-dependent hierarchy of height patches
//! that refines toward the viewer, streams blocks from a [`PatchSource`] on
//! worker threads under a byte budget, and emits a crack-free render list
//! each frame.

mod collision;
mod driver;
mod error;
mod hierarchy;
mod load_queue;
mod lod;
mod node;
mod patch;
mod scheduler;
mod source;
mod stitching;

pub use collision::sample_height;
pub use driver::{FrameOutput, FrameStats, RenderLeaf, TerrainQuadTree};
pub use error::{DecodeError, PreconditionViolation, SourceError, StreamingFailure, TerrainError};
pub use hierarchy::NodeHierarchy;
pub use load_queue::{LoadPriorityFactors, LoadQueue, compute_priority};
pub use lod::{LodEvaluator, ViewParams, projection_scale};
pub use node::{Direction, LoadStatus, NodeId, NodeKey, NodeState, Quadrant, QuadTreeNode};
pub use patch::{PatchData, PatchHandle, PatchStore, SkirtTemplate};
pub use scheduler::{LoadCompletion, LoadOutcome, RequestStatus, StreamScheduler, StreamingReport};
pub use source::{BlockRequest, DirectorySource, PatchSource};
pub use stitching::{EdgeSkirts, SkirtStrip, SkirtVertex, build_skirt_strips, resolve_edges};

//! Geometric primitives consumed by the terrain quadtree: f32 bounding boxes
//! and view-frustum culling.

mod aabb;
mod frustum;

pub use aabb::Aabb;
pub use frustum::Frustum;

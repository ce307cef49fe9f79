//! Screen-space error metric driving subdivide/merge decisions.

use glam::{Mat4, Vec3};
use tessera_config::{MAX_TERRAIN_DEPTH, TerrainConfig};
use tessera_math::{Aabb, Frustum};

/// Per-frame viewer inputs.
#[derive(Clone, Debug)]
pub struct ViewParams {
    /// Viewer position in terrain space.
    pub position: Vec3,
    /// Culling volume. `None` treats every node as visible.
    pub frustum: Option<Frustum>,
    /// `viewport_height / (2 · tan(fov_y / 2))`, in pixels per unit at unit distance.
    pub projection_scale: f32,
}

impl ViewParams {
    /// Viewer at `position` with an explicit projection scale and no culling.
    pub fn new(position: Vec3, projection_scale: f32) -> Self {
        Self {
            position,
            frustum: None,
            projection_scale,
        }
    }

    /// Viewer with a perspective projection of the given vertical field of
    /// view (radians) and viewport height in pixels.
    pub fn perspective(position: Vec3, fov_y: f32, viewport_height: f32) -> Self {
        Self::new(position, projection_scale(fov_y, viewport_height))
    }

    /// Viewer described by a terrain config's field of view and viewport.
    pub fn from_config(position: Vec3, terrain: &TerrainConfig) -> Self {
        Self::perspective(
            position,
            terrain.vertical_fov_degrees.to_radians(),
            terrain.viewport_height as f32,
        )
    }

    /// Attach a culling frustum.
    pub fn with_frustum(mut self, frustum: Frustum) -> Self {
        self.frustum = Some(frustum);
        self
    }

    /// Attach a frustum extracted from a view-projection matrix.
    pub fn with_view_projection(self, view_projection: &Mat4) -> Self {
        self.with_frustum(Frustum::from_view_projection(view_projection))
    }

    /// Whether a box is at least partially inside the frustum.
    pub fn is_visible(&self, bounds: &Aabb) -> bool {
        self.frustum
            .as_ref()
            .is_none_or(|frustum| frustum.is_visible(bounds))
    }
}

/// Pixels per world unit at unit distance for a perspective projection.
pub fn projection_scale(fov_y: f32, viewport_height: f32) -> f32 {
    viewport_height / (2.0 * (fov_y * 0.5).tan())
}

/// Scores nodes against the screen-space error threshold.
#[derive(Clone, Copy, Debug)]
pub struct LodEvaluator {
    threshold: f32,
    patch_resolution: u32,
    max_depth: u8,
}

impl LodEvaluator {
    /// `max_depth` is capped at the deepest addressable level.
    pub fn new(threshold: f32, patch_resolution: u32, max_depth: u8) -> Self {
        Self {
            threshold,
            patch_resolution: patch_resolution.max(1),
            max_depth: max_depth.min(MAX_TERRAIN_DEPTH),
        }
    }

    pub fn from_config(terrain: &TerrainConfig) -> Self {
        Self::new(
            terrain.error_threshold,
            terrain.patch_resolution,
            terrain.max_depth,
        )
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn max_depth(&self) -> u8 {
        self.max_depth
    }

    /// World-space size of one grid cell of a node's patch.
    pub fn geometric_error(&self, bounds: &Aabb) -> f32 {
        bounds.horizontal_size() / self.patch_resolution as f32
    }

    /// Projected size of one grid cell, in pixels. Infinite when the viewer
    /// is inside the bounds.
    pub fn screen_space_error(&self, bounds: &Aabb, view: &ViewParams) -> f32 {
        let distance = bounds.distance_to_point(view.position);
        if distance <= 0.0 {
            return f32::INFINITY;
        }
        self.geometric_error(bounds) * view.projection_scale / distance
    }

    /// A node is sufficient when its error is at most the threshold or it
    /// lies entirely outside the frustum.
    pub fn is_sufficient(&self, bounds: &Aabb, view: &ViewParams) -> bool {
        !view.is_visible(bounds) || self.screen_space_error(bounds, view) <= self.threshold
    }

    /// Depth at which a node covering `bounds` would become sufficient,
    /// assuming error halves per level. Clamped to the maximum depth.
    pub fn ideal_depth(&self, depth: u8, bounds: &Aabb, view: &ViewParams) -> u8 {
        if self.is_sufficient(bounds, view) {
            return depth;
        }
        let error = self.screen_space_error(bounds, view);
        if !error.is_finite() {
            return self.max_depth.max(depth);
        }
        let extra = (error / self.threshold).log2().ceil().max(0.0);
        let ideal = depth as f32 + extra;
        (ideal.min(self.max_depth as f32) as u8).max(depth)
    }
}

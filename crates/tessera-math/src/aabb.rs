use glam::{Vec2, Vec3};

/// Axis-aligned bounding box in local f32 space.
///
/// Terrain uses `x` and `z` as the horizontal plane and `y` as height.
///
/// Invariant: `min.x <= max.x`, `min.y <= max.y`, `min.z <= max.z`.
/// The constructor enforces this by swapping components if needed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    /// Minimum corner of the bounding box.
    pub min: Vec3,
    /// Maximum corner of the bounding box.
    pub max: Vec3,
}

impl Aabb {
    /// Create an AABB from two corners. Components are sorted so that
    /// `min <= max` on every axis.
    pub fn new(a: Vec3, b: Vec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Create an AABB from a horizontal rectangle and a height range.
    pub fn from_footprint(min_xz: Vec2, max_xz: Vec2, min_height: f32, max_height: f32) -> Self {
        Self::new(
            Vec3::new(min_xz.x, min_height, min_xz.y),
            Vec3::new(max_xz.x, max_height, max_xz.y),
        )
    }

    /// Returns the center point of the AABB.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Returns the half-extents (half-size along each axis).
    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Returns the size along each axis.
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Largest horizontal side length (x or z).
    pub fn horizontal_size(&self) -> f32 {
        let size = self.size();
        size.x.max(size.z)
    }

    /// Horizontal area of the footprint.
    pub fn footprint_area(&self) -> f32 {
        let size = self.size();
        size.x * size.z
    }

    /// Returns true if the point lies inside or on the boundary.
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Returns true if the horizontal position `(x, z)` lies inside or on the
    /// boundary of the footprint.
    pub fn contains_xz(&self, x: f32, z: f32) -> bool {
        x >= self.min.x && x <= self.max.x && z >= self.min.z && z <= self.max.z
    }

    /// Returns true if this AABB overlaps with `other`
    /// (including touching edges/faces).
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Area of the horizontal intersection of two footprints (0 when they only
    /// touch along an edge or do not meet).
    pub fn footprint_overlap(&self, other: &Aabb) -> f32 {
        let dx = self.max.x.min(other.max.x) - self.min.x.max(other.min.x);
        let dz = self.max.z.min(other.max.z) - self.min.z.max(other.min.z);
        dx.max(0.0) * dz.max(0.0)
    }

    /// Returns the smallest AABB enclosing both `self` and `other`.
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// The point of the box closest to `p` (`p` itself when inside).
    pub fn closest_point(&self, p: Vec3) -> Vec3 {
        p.clamp(self.min, self.max)
    }

    /// Euclidean distance from `p` to the nearest point of the box.
    /// Zero when `p` is inside.
    pub fn distance_to_point(&self, p: Vec3) -> f32 {
        (self.closest_point(p) - p).length()
    }

    /// Copy of this box with its vertical range replaced.
    pub fn with_height_range(&self, min_height: f32, max_height: f32) -> Aabb {
        Aabb::new(
            Vec3::new(self.min.x, min_height, self.min.z),
            Vec3::new(self.max.x, max_height, self.max.z),
        )
    }
}

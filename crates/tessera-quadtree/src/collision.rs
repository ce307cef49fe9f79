//! Read-only height queries against resident data.

use crate::hierarchy::NodeHierarchy;
use crate::patch::PatchStore;

/// Bilinearly sampled height at `(x, z)` from the deepest node containing the
/// point that has data resident. `None` outside the terrain or when no
/// containing node holds data.
pub fn sample_height(hierarchy: &NodeHierarchy, store: &PatchStore, x: f32, z: f32) -> Option<f32> {
    let id = hierarchy.deepest_containing(x, z, |node| node.state().has_data())?;
    let node = hierarchy.get(id)?;
    let data = store.get(node.patch()?)?;

    let bounds = node.bounds();
    let size = bounds.size();
    let u = if size.x > 0.0 { (x - bounds.min.x) / size.x } else { 0.0 };
    let v = if size.z > 0.0 { (z - bounds.min.z) / size.z } else { 0.0 };
    Some(data.sample(u, v))
}

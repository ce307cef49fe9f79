//! Resident height/material blocks and the byte-budgeted store holding them.
//!
//! Blocks arrive as raw bytes: `(R + 1)²` little-endian `f32` heights followed
//! by `(R + 1)²` `u8` material indices, both row-major with `z` as the row.
//! Decoding validates the layout and precomputes the skirt template so the
//! stitching pass never touches the full grid.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::DecodeError;
use crate::node::Direction;

/// Opaque handle to a block held by the [`PatchStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchHandle(u64);

impl PatchHandle {
    /// Raw handle value, unique for the lifetime of the store.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Edge height rows of a block, indexed by [`Direction::index`].
///
/// North and south rows run along `+x`; east and west rows run along `+z`.
#[derive(Clone, Debug, PartialEq)]
pub struct SkirtTemplate {
    edges: [Vec<f32>; 4],
}

impl SkirtTemplate {
    /// Height samples along one edge.
    pub fn edge(&self, direction: Direction) -> &[f32] {
        &self.edges[direction.index()]
    }
}

/// One decoded block: heights, materials and derived data. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchData {
    resolution: u32,
    heights: Vec<f32>,
    materials: Vec<u8>,
    min_height: f32,
    max_height: f32,
    skirt: SkirtTemplate,
}

impl PatchData {
    /// Number of samples per side for a resolution.
    pub fn samples_per_side(resolution: u32) -> usize {
        resolution as usize + 1
    }

    /// Length of an encoded block.
    pub fn encoded_len(resolution: u32) -> usize {
        let samples = Self::samples_per_side(resolution).pow(2);
        samples * (std::mem::size_of::<f32>() + std::mem::size_of::<u8>())
    }

    /// Bytes a resident block of this resolution is charged against the budget.
    ///
    /// Equal to [`PatchData::byte_size`] of any block with that resolution, so
    /// load reservations match the final charge exactly.
    pub fn estimated_bytes(resolution: u32) -> usize {
        let side = Self::samples_per_side(resolution);
        Self::encoded_len(resolution) + 4 * side * std::mem::size_of::<f32>()
    }

    /// Build a block from sample grids. Both grids hold `(R + 1)²` entries.
    pub fn from_samples(
        resolution: u32,
        heights: Vec<f32>,
        materials: Vec<u8>,
    ) -> Result<Self, DecodeError> {
        let samples = Self::samples_per_side(resolution).pow(2);
        if heights.len() != samples || materials.len() != samples {
            return Err(DecodeError::Length {
                expected: samples,
                actual: heights.len().min(materials.len()),
            });
        }
        if let Some(index) = heights.iter().position(|h| !h.is_finite()) {
            return Err(DecodeError::NonFiniteHeight { index });
        }

        let (min_height, max_height) = heights
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &h| {
                (lo.min(h), hi.max(h))
            });
        let skirt = build_skirt_template(resolution, &heights);

        Ok(Self {
            resolution,
            heights,
            materials,
            min_height,
            max_height,
            skirt,
        })
    }

    /// Decode a raw block.
    pub fn decode(resolution: u32, bytes: &[u8]) -> Result<Self, DecodeError> {
        let expected = Self::encoded_len(resolution);
        if bytes.len() != expected {
            return Err(DecodeError::Length {
                expected,
                actual: bytes.len(),
            });
        }

        let samples = Self::samples_per_side(resolution).pow(2);
        let (height_bytes, material_bytes) = bytes.split_at(samples * 4);
        let heights = height_bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Self::from_samples(resolution, heights, material_bytes.to_vec())
    }

    /// Encode into the raw block layout accepted by [`PatchData::decode`].
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::encoded_len(self.resolution));
        for h in &self.heights {
            bytes.extend_from_slice(&h.to_le_bytes());
        }
        bytes.extend_from_slice(&self.materials);
        bytes
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn heights(&self) -> &[f32] {
        &self.heights
    }

    pub fn materials(&self) -> &[u8] {
        &self.materials
    }

    pub fn min_height(&self) -> f32 {
        self.min_height
    }

    pub fn max_height(&self) -> f32 {
        self.max_height
    }

    pub fn skirt_template(&self) -> &SkirtTemplate {
        &self.skirt
    }

    /// Bytes charged against the store budget.
    pub fn byte_size(&self) -> usize {
        Self::estimated_bytes(self.resolution)
    }

    /// Height at grid sample `(i, j)`; `i` along `+x`, `j` along `+z`.
    pub fn height(&self, i: usize, j: usize) -> f32 {
        let side = Self::samples_per_side(self.resolution);
        self.heights[j.min(side - 1) * side + i.min(side - 1)]
    }

    /// Material index at grid sample `(i, j)`.
    pub fn material(&self, i: usize, j: usize) -> u8 {
        let side = Self::samples_per_side(self.resolution);
        self.materials[j.min(side - 1) * side + i.min(side - 1)]
    }

    /// Bilinearly interpolated height at normalized coordinates `(u, v)`,
    /// clamped to `[0, 1]`.
    pub fn sample(&self, u: f32, v: f32) -> f32 {
        let r = self.resolution as f32;
        let fx = u.clamp(0.0, 1.0) * r;
        let fz = v.clamp(0.0, 1.0) * r;
        let (i0, j0) = (fx.floor() as usize, fz.floor() as usize);
        let (tx, tz) = (fx - i0 as f32, fz - j0 as f32);

        let h00 = self.height(i0, j0);
        let h10 = self.height(i0 + 1, j0);
        let h01 = self.height(i0, j0 + 1);
        let h11 = self.height(i0 + 1, j0 + 1);

        let top = h00 + (h10 - h00) * tx;
        let bottom = h01 + (h11 - h01) * tx;
        top + (bottom - top) * tz
    }
}

fn build_skirt_template(resolution: u32, heights: &[f32]) -> SkirtTemplate {
    let side = PatchData::samples_per_side(resolution);
    let last = side - 1;
    let row = |j: usize| (0..side).map(|i| heights[j * side + i]).collect::<Vec<_>>();
    let column = |i: usize| (0..side).map(|j| heights[j * side + i]).collect::<Vec<_>>();

    let mut edges: [Vec<f32>; 4] = Default::default();
    edges[Direction::North.index()] = row(0);
    edges[Direction::South.index()] = row(last);
    edges[Direction::West.index()] = column(0);
    edges[Direction::East.index()] = column(last);
    SkirtTemplate { edges }
}

/// Byte-budgeted store of resident blocks.
///
/// Blocks are shared with render leaves and collision queries through
/// `Arc`; the store's byte counter only changes on the owning thread.
pub struct PatchStore {
    patches: FxHashMap<PatchHandle, Arc<PatchData>>,
    next_handle: u64,
    resident_bytes: usize,
    budget: usize,
}

impl PatchStore {
    /// Create an empty store with the given byte ceiling.
    pub fn new(budget: usize) -> Self {
        Self {
            patches: FxHashMap::default(),
            next_handle: 1,
            resident_bytes: 0,
            budget,
        }
    }

    /// Take ownership of a block and return its handle.
    pub fn insert(&mut self, data: PatchData) -> PatchHandle {
        let handle = PatchHandle(self.next_handle);
        self.next_handle += 1;
        self.resident_bytes += data.byte_size();
        self.patches.insert(handle, Arc::new(data));
        handle
    }

    pub fn get(&self, handle: PatchHandle) -> Option<&Arc<PatchData>> {
        self.patches.get(&handle)
    }

    /// Drop the store's reference to a block. Returns the bytes freed.
    pub fn release(&mut self, handle: PatchHandle) -> usize {
        match self.patches.remove(&handle) {
            Some(data) => {
                let bytes = data.byte_size();
                self.resident_bytes -= bytes;
                bytes
            }
            None => 0,
        }
    }

    pub fn contains(&self, handle: PatchHandle) -> bool {
        self.patches.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn set_budget(&mut self, budget: usize) {
        self.budget = budget;
    }

    /// Whether `extra` more bytes fit under the ceiling.
    pub fn fits(&self, extra: usize) -> bool {
        self.resident_bytes.saturating_add(extra) <= self.budget
    }

    pub fn is_over_budget(&self) -> bool {
        self.resident_bytes > self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(resolution: u32) -> PatchData {
        let side = PatchData::samples_per_side(resolution);
        let heights = (0..side * side)
            .map(|k| ((k % side) + 10 * (k / side)) as f32)
            .collect();
        let materials = (0..side * side).map(|k| (k % 7) as u8).collect();
        PatchData::from_samples(resolution, heights, materials).unwrap()
    }

    #[test]
    fn test_decode_encoded_block() {
        let patch = ramp(4);
        let bytes = patch.encode();
        assert_eq!(bytes.len(), PatchData::encoded_len(4));
        let decoded = PatchData::decode(4, &bytes).unwrap();
        assert_eq!(decoded, patch);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let err = PatchData::decode(4, &[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Length {
                expected: 125,
                actual: 10
            }
        );
    }

    #[test]
    fn test_decode_rejects_nan() {
        let mut bytes = ramp(2).encode();
        bytes[4..8].copy_from_slice(&f32::NAN.to_le_bytes());
        assert_eq!(
            PatchData::decode(2, &bytes).unwrap_err(),
            DecodeError::NonFiniteHeight { index: 1 }
        );
    }

    #[test]
    fn test_height_range_and_skirt_rows() {
        let patch = ramp(2);
        assert_eq!(patch.min_height(), 0.0);
        assert_eq!(patch.max_height(), 22.0);

        let skirt = patch.skirt_template();
        assert_eq!(skirt.edge(Direction::North), &[0.0, 1.0, 2.0]);
        assert_eq!(skirt.edge(Direction::South), &[20.0, 21.0, 22.0]);
        assert_eq!(skirt.edge(Direction::West), &[0.0, 10.0, 20.0]);
        assert_eq!(skirt.edge(Direction::East), &[2.0, 12.0, 22.0]);
    }

    #[test]
    fn test_bilinear_sample() {
        let patch = ramp(2);
        assert_eq!(patch.sample(0.0, 0.0), 0.0);
        assert_eq!(patch.sample(1.0, 1.0), 22.0);
        // Midway between (1,0)=1 and (1,1)=11.
        assert!((patch.sample(0.5, 0.25) - 6.0).abs() < 1e-5);
        // Clamped outside the unit square.
        assert_eq!(patch.sample(-3.0, 2.0), 20.0);
    }

    #[test]
    fn test_store_accounting() {
        let mut store = PatchStore::new(PatchData::estimated_bytes(4) * 2);
        let a = store.insert(ramp(4));
        let b = store.insert(ramp(4));
        assert_ne!(a, b);
        assert_eq!(store.resident_bytes(), PatchData::estimated_bytes(4) * 2);
        assert!(!store.fits(1));
        assert!(!store.is_over_budget());

        assert_eq!(store.release(a), PatchData::estimated_bytes(4));
        assert_eq!(store.release(a), 0);
        assert!(store.fits(PatchData::estimated_bytes(4)));
        assert!(store.contains(b));
        assert_eq!(store.len(), 1);

        store.set_budget(0);
        assert!(store.is_over_budget());
    }
}

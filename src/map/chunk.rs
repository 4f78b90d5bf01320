//! Per-region voxel storage.
//!
//! A [`MapChunk`] owns one contiguous byte buffer per layer of the map
//! layout, all addressed by the same region key and origin. Buffers are
//! initialised to each layer's clear values on allocation.

use crate::core::{Key, Point3, RegionKey, RegionSize};
use crate::error::{Error, Result};
use crate::layout::MapLayout;

/// Linear index of a voxel inside a layer with `dim` voxels per axis.
///
/// X varies fastest, then Y, then Z.
#[inline]
pub fn voxel_index(key: &Key, dim: RegionSize) -> usize {
    let local = key.local();
    local[0] as usize
        + local[1] as usize * dim.x as usize
        + local[2] as usize * dim.x as usize * dim.y as usize
}

/// A single region's voxel storage across all layers.
#[derive(Debug)]
pub struct MapChunk {
    region_key: RegionKey,
    origin: Point3,
    /// One buffer per layer, indexed by layer index.
    layers: Vec<Vec<u8>>,
    /// Per-layer dirty flags: host data modified since last serialisation
    /// or device upload.
    dirty: Vec<bool>,
    /// Smallest occupancy-layer voxel index written so far, if any.
    first_valid_index: Option<u32>,
    created_time: f64,
    touched_time: f64,
    first_ray_time: Option<f64>,
}

impl MapChunk {
    /// Allocate a chunk with clear-initialised buffers for every layer.
    pub fn new(
        region_key: RegionKey,
        origin: Point3,
        layout: &MapLayout,
        region_dim: RegionSize,
        time: f64,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(layout.layer_count());
        for layer in layout.layers() {
            let buffer = layer
                .allocate_buffer(region_dim)
                .map_err(Error::RegionAllocationFailed)?;
            layers.push(buffer);
        }
        Ok(Self {
            region_key,
            origin,
            dirty: vec![false; layers.len()],
            layers,
            first_valid_index: None,
            created_time: time,
            touched_time: time,
            first_ray_time: None,
        })
    }

    /// Region key addressing this chunk.
    #[inline]
    pub fn region_key(&self) -> RegionKey {
        self.region_key
    }

    /// World-space origin of the region's minimum corner.
    #[inline]
    pub fn origin(&self) -> Point3 {
        self.origin
    }

    /// Creation timestamp (map time, seconds).
    #[inline]
    pub fn created_time(&self) -> f64 {
        self.created_time
    }

    /// Most recent touch timestamp (map time, seconds).
    #[inline]
    pub fn touched_time(&self) -> f64 {
        self.touched_time
    }

    /// Timestamp of the first ray integrated into this chunk, if any.
    #[inline]
    pub fn first_ray_time(&self) -> Option<f64> {
        self.first_ray_time
    }

    /// Record a touch at `time`, stamping the first ray time if unset.
    pub fn touch(&mut self, time: f64) {
        self.touched_time = time;
        if self.first_ray_time.is_none() {
            self.first_ray_time = Some(time);
        }
    }

    /// Number of layer buffers.
    #[inline]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Borrow a layer's bytes.
    #[inline]
    pub fn layer_bytes(&self, layer: usize) -> &[u8] {
        &self.layers[layer]
    }

    /// Mutably borrow a layer's bytes. Callers are responsible for marking
    /// the layer dirty after writing.
    #[inline]
    pub fn layer_bytes_mut(&mut self, layer: usize) -> &mut [u8] {
        &mut self.layers[layer]
    }

    /// True when the layer has been modified since the flag was last
    /// cleared.
    #[inline]
    pub fn is_dirty(&self, layer: usize) -> bool {
        self.dirty[layer]
    }

    /// Mark a layer modified.
    #[inline]
    pub fn mark_dirty(&mut self, layer: usize) {
        self.dirty[layer] = true;
    }

    /// Clear a layer's dirty flag.
    #[inline]
    pub fn clear_dirty(&mut self, layer: usize) {
        self.dirty[layer] = false;
    }

    /// Smallest occupancy voxel index written so far.
    #[inline]
    pub fn first_valid_index(&self) -> Option<u32> {
        self.first_valid_index
    }

    /// Lower the first-valid index to `index` if it is smaller than the
    /// current value.
    #[inline]
    pub fn update_first_valid(&mut self, index: u32) {
        match self.first_valid_index {
            Some(current) if current <= index => {}
            _ => self.first_valid_index = Some(index),
        }
    }

    /// Restore timestamps from serialised state.
    pub(crate) fn restore_times(&mut self, touched: f64, first_ray: Option<f64>) {
        self.touched_time = touched;
        self.first_ray_time = first_ray;
    }

    /// Replace the layer buffers with a filtered subset.
    ///
    /// `mapping` pairs old layer indices with new ones, as produced by
    /// [`MapLayout::filter_layers`]. Preserved buffers keep their byte
    /// content.
    pub fn filter_layers(&mut self, mapping: &[(usize, usize)]) {
        let mut kept: Vec<Vec<u8>> = Vec::with_capacity(mapping.len());
        let mut kept_dirty = Vec::with_capacity(mapping.len());
        for &(old, new) in mapping {
            debug_assert_eq!(new, kept.len());
            kept.push(std::mem::take(&mut self.layers[old]));
            kept_dirty.push(self.dirty[old]);
        }
        self.layers = kept;
        self.dirty = kept_dirty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::default_layers;

    fn test_layout() -> MapLayout {
        let mut layout = MapLayout::new();
        default_layers::add_occupancy(&mut layout);
        default_layers::add_voxel_mean(&mut layout);
        layout
    }

    #[test]
    fn test_chunk_allocation_clears_layers() {
        let layout = test_layout();
        let dim = RegionSize::cubic(8);
        let chunk = MapChunk::new(RegionKey::new(0, 0, 0), Point3::ZERO, &layout, dim, 10.0)
            .unwrap();

        assert_eq!(chunk.layer_count(), 2);
        assert_eq!(chunk.layer_bytes(0).len(), 512 * 4);
        assert_eq!(chunk.layer_bytes(1).len(), 512 * 8);

        let occupancy = chunk.layer_bytes(0);
        let value = f32::from_le_bytes([occupancy[0], occupancy[1], occupancy[2], occupancy[3]]);
        assert_eq!(value, default_layers::unobserved_occupancy_value());

        assert_eq!(chunk.created_time(), 10.0);
        assert_eq!(chunk.touched_time(), 10.0);
        assert_eq!(chunk.first_ray_time(), None);
    }

    #[test]
    fn test_voxel_index_linear_order() {
        let dim = RegionSize::cubic(4);
        let key = |x, y, z| Key::new(RegionKey::new(0, 0, 0), x, y, z);

        assert_eq!(voxel_index(&key(0, 0, 0), dim), 0);
        assert_eq!(voxel_index(&key(1, 0, 0), dim), 1);
        assert_eq!(voxel_index(&key(0, 1, 0), dim), 4);
        assert_eq!(voxel_index(&key(0, 0, 1), dim), 16);
        assert_eq!(voxel_index(&key(3, 3, 3), dim), 63);
    }

    #[test]
    fn test_touch_records_first_ray() {
        let layout = test_layout();
        let dim = RegionSize::cubic(4);
        let mut chunk =
            MapChunk::new(RegionKey::new(0, 0, 0), Point3::ZERO, &layout, dim, 1.0).unwrap();

        chunk.touch(5.0);
        chunk.touch(9.0);
        assert_eq!(chunk.touched_time(), 9.0);
        assert_eq!(chunk.first_ray_time(), Some(5.0));
    }

    #[test]
    fn test_first_valid_tracking() {
        let layout = test_layout();
        let dim = RegionSize::cubic(4);
        let mut chunk =
            MapChunk::new(RegionKey::new(0, 0, 0), Point3::ZERO, &layout, dim, 0.0).unwrap();

        assert_eq!(chunk.first_valid_index(), None);
        chunk.update_first_valid(10);
        chunk.update_first_valid(20);
        chunk.update_first_valid(5);
        assert_eq!(chunk.first_valid_index(), Some(5));
    }

    #[test]
    fn test_filter_layers_preserves_bytes() {
        let layout = test_layout();
        let dim = RegionSize::cubic(4);
        let mut chunk =
            MapChunk::new(RegionKey::new(0, 0, 0), Point3::ZERO, &layout, dim, 0.0).unwrap();

        chunk.layer_bytes_mut(1)[0] = 0x5A;
        let before = chunk.layer_bytes(1).to_vec();

        // Keep only the mean layer (old index 1 -> new index 0).
        chunk.filter_layers(&[(1, 0)]);
        assert_eq!(chunk.layer_count(), 1);
        assert_eq!(chunk.layer_bytes(0), &before[..]);
    }
}

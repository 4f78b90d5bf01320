//! Map-wide layer schema.
//!
//! A [`MapLayout`] is an ordered list of named [`MapLayer`]s. Each layer
//! owns a [`VoxelLayout`] describing its per-voxel members and may
//! downsample the map resolution (each subsampling level combines 8 voxels
//! into one). The layout is fixed once a map holds chunks; see
//! [`OccupancyMap::set_layout`](crate::OccupancyMap::set_layout).

use serde::{Deserialize, Serialize};

use super::voxel_layout::VoxelLayout;
use crate::core::RegionSize;

/// Result of comparing two layouts with
/// [`MapLayout::check_equivalent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutMatch {
    /// Neither names nor voxel structures line up.
    Different,
    /// Layer and member names match in order, but the voxel structures
    /// differ.
    NamesOnly,
    /// Voxel structures match layer-for-layer, but names differ.
    StructureOnly,
    /// Voxel structures and all layer and member names match.
    Exact,
}

/// One named per-voxel data stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MapLayer {
    name: String,
    index: usize,
    subsampling: u16,
    voxel_layout: VoxelLayout,
}

impl MapLayer {
    fn new(name: &str, index: usize, subsampling: u16) -> Self {
        Self {
            name: name.to_string(),
            index,
            subsampling,
            voxel_layout: VoxelLayout::new(),
        }
    }

    /// Layer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position of this layer in the layout.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Subsampling level (0 = full resolution).
    pub fn subsampling(&self) -> u16 {
        self.subsampling
    }

    /// The voxel member schema.
    pub fn voxel_layout(&self) -> &VoxelLayout {
        &self.voxel_layout
    }

    /// Mutable voxel member schema, for populating a new layer.
    pub fn voxel_layout_mut(&mut self) -> &mut VoxelLayout {
        &mut self.voxel_layout
    }

    /// Voxel dimensions of this layer for a region of `region_dim` voxels,
    /// accounting for subsampling.
    #[inline]
    pub fn dimensions(&self, region_dim: RegionSize) -> RegionSize {
        region_dim.subsampled(self.subsampling)
    }

    /// Number of voxels this layer stores per region.
    #[inline]
    pub fn voxel_count(&self, region_dim: RegionSize) -> usize {
        self.dimensions(region_dim).voxel_count()
    }

    /// Byte size of this layer's buffer for one region.
    #[inline]
    pub fn layer_byte_size(&self, region_dim: RegionSize) -> usize {
        self.voxel_count(region_dim) * self.voxel_layout.voxel_byte_size()
    }

    /// Allocate and clear-initialise a buffer for one region.
    pub fn allocate_buffer(&self, region_dim: RegionSize) -> Result<Vec<u8>, usize> {
        let byte_size = self.layer_byte_size(region_dim);
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(byte_size).map_err(|_| byte_size)?;
        buffer.resize(byte_size, 0);

        let voxel_size = self.voxel_layout.voxel_byte_size();
        if voxel_size > 0 {
            let mut clear = vec![0u8; voxel_size];
            self.voxel_layout.write_clear(&mut clear);
            for voxel in buffer.chunks_exact_mut(voxel_size) {
                voxel.copy_from_slice(&clear);
            }
        }
        Ok(buffer)
    }
}

/// Ordered, named layer schema for an occupancy map.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MapLayout {
    layers: Vec<MapLayer>,
}

impl MapLayout {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all layers.
    pub fn clear(&mut self) {
        self.layers.clear();
    }

    /// Add a layer. The layer starts with an empty voxel layout which the
    /// caller populates through [`MapLayer::voxel_layout_mut`].
    ///
    /// Layer names should be unique; [`layer_index`](MapLayout::layer_index)
    /// resolves the first match.
    pub fn add_layer(&mut self, name: &str, subsampling: u16) -> &mut MapLayer {
        let index = self.layers.len();
        self.layers.push(MapLayer::new(name, index, subsampling));
        &mut self.layers[index]
    }

    /// Number of layers.
    #[inline]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Layer by index.
    #[inline]
    pub fn layer(&self, index: usize) -> &MapLayer {
        &self.layers[index]
    }

    /// Layer by index, tolerating out-of-range values.
    pub fn layer_ptr(&self, index: usize) -> Option<&MapLayer> {
        self.layers.get(index)
    }

    /// First layer with the given name.
    pub fn layer_by_name(&self, name: &str) -> Option<&MapLayer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Index of the first layer with the given name.
    pub fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == name)
    }

    /// Iterate layers in index order.
    pub fn layers(&self) -> std::slice::Iter<'_, MapLayer> {
        self.layers.iter()
    }

    /// Index of the well-known occupancy layer.
    pub fn occupancy_layer(&self) -> Option<usize> {
        self.layer_index(super::default_layers::OCCUPANCY_LAYER)
    }

    /// Index of the well-known voxel mean layer.
    pub fn mean_layer(&self) -> Option<usize> {
        self.layer_index(super::default_layers::MEAN_LAYER)
    }

    /// Index of the well-known covariance layer.
    pub fn covariance_layer(&self) -> Option<usize> {
        self.layer_index(super::default_layers::COVARIANCE_LAYER)
    }

    /// Index of the well-known clearance layer.
    pub fn clearance_layer(&self) -> Option<usize> {
        self.layer_index(super::default_layers::CLEARANCE_LAYER)
    }

    /// Index of the well-known traversal layer.
    pub fn traversal_layer(&self) -> Option<usize> {
        self.layer_index(super::default_layers::TRAVERSAL_LAYER)
    }

    /// Index of the well-known hit/miss count layer.
    pub fn hit_miss_count_layer(&self) -> Option<usize> {
        self.layer_index(super::default_layers::HIT_MISS_COUNT_LAYER)
    }

    /// Index of the well-known intensity layer.
    pub fn intensity_layer(&self) -> Option<usize> {
        self.layer_index(super::default_layers::INTENSITY_LAYER)
    }

    /// Index of the well-known semantic layer.
    pub fn semantic_layer(&self) -> Option<usize> {
        self.layer_index(super::default_layers::SEMANTIC_LAYER)
    }

    /// Remove all layers except the named ones, repacking indices so the
    /// surviving layers stay in their original relative order with no gaps.
    ///
    /// Returns the mapping from old layer index to new layer index for the
    /// preserved layers.
    pub fn filter_layers(&mut self, preserve: &[&str]) -> Vec<(usize, usize)> {
        let mut mapping = Vec::new();
        let mut kept = Vec::new();
        for layer in self.layers.drain(..) {
            if preserve.contains(&layer.name.as_str()) {
                mapping.push((layer.index, kept.len()));
                let mut layer = layer;
                layer.index = kept.len();
                kept.push(layer);
            }
        }
        self.layers = kept;
        mapping
    }

    /// Compare this layout with another.
    ///
    /// Returns [`LayoutMatch::Exact`] when all layer names, subsampling
    /// levels, member names and voxel structures match;
    /// [`LayoutMatch::StructureOnly`] when the voxel structures match
    /// layer-for-layer but names differ; [`LayoutMatch::NamesOnly`] when
    /// the names line up but the structures do not;
    /// [`LayoutMatch::Different`] otherwise.
    pub fn check_equivalent(&self, other: &MapLayout) -> LayoutMatch {
        if self.layers.len() != other.layers.len() {
            return LayoutMatch::Different;
        }

        let structurally_equal = self.layers.iter().zip(other.layers.iter()).all(|(a, b)| {
            a.subsampling == b.subsampling && a.voxel_layout.check_equivalent(&b.voxel_layout, false)
        });
        let names_equal = self.layers.iter().zip(other.layers.iter()).all(|(a, b)| {
            a.name == b.name
                && a.voxel_layout.member_count() == b.voxel_layout.member_count()
                && a.voxel_layout
                    .members()
                    .zip(b.voxel_layout.members())
                    .all(|(m, n)| m.name() == n.name())
        });

        match (structurally_equal, names_equal) {
            (true, true) => LayoutMatch::Exact,
            (true, false) => LayoutMatch::StructureOnly,
            (false, true) => LayoutMatch::NamesOnly,
            (false, false) => LayoutMatch::Different,
        }
    }

    /// Calculate which layers of this layout are also present in `other`.
    ///
    /// Layers are matched by name first, then validated structurally. Each
    /// match contributes `(self_index, other_index)` to the result.
    pub fn calculate_overlapping_layer_set(&self, other: &MapLayout) -> Vec<(usize, usize)> {
        let mut overlap = Vec::new();
        for layer in &self.layers {
            if let Some(other_index) = other.layer_index(&layer.name) {
                let other_layer = other.layer(other_index);
                if layer.subsampling == other_layer.subsampling
                    && layer
                        .voxel_layout
                        .check_equivalent(&other_layer.voxel_layout, false)
                {
                    overlap.push((layer.index, other_index));
                }
            }
        }
        overlap
    }
}

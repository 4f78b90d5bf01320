//! Voxel handles.
//!
//! A [`Voxel`] (const) or [`VoxelMut`] (mutable) exposes one addressed
//! voxel's data across the map's layers. A const handle may reference a
//! voxel in an absent chunk; such handles report `is_valid() == false` and
//! read as unobserved. Mutable handles always reference an existing chunk
//! and keep the chunk's dirty flags and first-valid index up to date.

use crate::core::{Key, RegionSize};
use crate::layout::default_layers::unobserved_occupancy_value;
use crate::layout::{DataType, MapLayout};

use super::chunk::{voxel_index, MapChunk};

fn member_slice<'a>(
    chunk: &'a MapChunk,
    layout: &MapLayout,
    region_dim: RegionSize,
    key: &Key,
    layer: usize,
    member: usize,
) -> Option<&'a [u8]> {
    let map_layer = layout.layer_ptr(layer)?;
    let voxel_layout = map_layer.voxel_layout();
    if member >= voxel_layout.member_count() {
        return None;
    }
    let m = voxel_layout.member(member);
    let voxel_size = voxel_layout.voxel_byte_size();
    let index = voxel_index(key, map_layer.dimensions(region_dim));
    let at = index * voxel_size + m.offset();
    Some(&chunk.layer_bytes(layer)[at..at + m.data_type().byte_size()])
}

/// Read-only handle to one voxel.
pub struct Voxel<'a> {
    pub(super) key: Key,
    pub(super) chunk: Option<&'a MapChunk>,
    pub(super) layout: &'a MapLayout,
    pub(super) region_dim: RegionSize,
}

impl<'a> Voxel<'a> {
    /// The addressed key.
    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    /// True when the handle references an existing chunk.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.chunk.is_some() && !self.key.is_null()
    }

    /// Occupancy log-odds value; the unobserved sentinel when the handle is
    /// invalid or the map has no occupancy layer.
    pub fn occupancy(&self) -> f32 {
        self.layout
            .occupancy_layer()
            .and_then(|layer| self.member_f32(layer, 0))
            .unwrap_or_else(unobserved_occupancy_value)
    }

    /// This voxel's bytes within a layer.
    pub fn layer_bytes(&self, layer: usize) -> Option<&'a [u8]> {
        let chunk = self.chunk?;
        let map_layer = self.layout.layer_ptr(layer)?;
        let voxel_size = map_layer.voxel_layout().voxel_byte_size();
        let index = voxel_index(&self.key, map_layer.dimensions(self.region_dim));
        let at = index * voxel_size;
        Some(&chunk.layer_bytes(layer)[at..at + voxel_size])
    }

    /// Read an `f32` member.
    pub fn member_f32(&self, layer: usize, member: usize) -> Option<f32> {
        let bytes = member_slice(
            self.chunk?,
            self.layout,
            self.region_dim,
            &self.key,
            layer,
            member,
        )?;
        Some(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a `u32` member.
    pub fn member_u32(&self, layer: usize, member: usize) -> Option<u32> {
        let bytes = member_slice(
            self.chunk?,
            self.layout,
            self.region_dim,
            &self.key,
            layer,
            member,
        )?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Mutable handle to one voxel of an existing chunk.
pub struct VoxelMut<'a> {
    pub(super) key: Key,
    pub(super) chunk: &'a mut MapChunk,
    pub(super) layout: &'a MapLayout,
    pub(super) region_dim: RegionSize,
    pub(super) time: f64,
}

impl<'a> VoxelMut<'a> {
    /// The addressed key.
    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    /// Occupancy log-odds value; the unobserved sentinel when the map has
    /// no occupancy layer.
    pub fn occupancy(&self) -> f32 {
        self.layout
            .occupancy_layer()
            .and_then(|layer| self.member_f32(layer, 0))
            .unwrap_or_else(unobserved_occupancy_value)
    }

    /// Write the occupancy log-odds value, updating the chunk's dirty flag,
    /// touch time and first-valid index.
    pub fn set_occupancy(&mut self, value: f32) {
        if let Some(layer) = self.layout.occupancy_layer() {
            let index = voxel_index(
                &self.key,
                self.layout.layer(layer).dimensions(self.region_dim),
            );
            self.set_member_f32(layer, 0, value);
            self.chunk.update_first_valid(index as u32);
            self.chunk.touch(self.time);
        }
    }

    /// Read an `f32` member.
    pub fn member_f32(&self, layer: usize, member: usize) -> Option<f32> {
        let bytes = member_slice(
            self.chunk,
            self.layout,
            self.region_dim,
            &self.key,
            layer,
            member,
        )?;
        Some(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a `u32` member.
    pub fn member_u32(&self, layer: usize, member: usize) -> Option<u32> {
        let bytes = member_slice(
            self.chunk,
            self.layout,
            self.region_dim,
            &self.key,
            layer,
            member,
        )?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write an `f32` member and mark the layer dirty.
    pub fn set_member_f32(&mut self, layer: usize, member: usize, value: f32) -> bool {
        self.write_member(layer, member, DataType::F32, &value.to_le_bytes())
    }

    /// Write a `u32` member and mark the layer dirty.
    pub fn set_member_u32(&mut self, layer: usize, member: usize, value: u32) -> bool {
        self.write_member(layer, member, DataType::U32, &value.to_le_bytes())
    }

    /// This voxel's bytes within a layer, mutably. Marks the layer dirty.
    pub fn layer_bytes_mut(&mut self, layer: usize) -> Option<&mut [u8]> {
        let map_layer = self.layout.layer_ptr(layer)?;
        let voxel_size = map_layer.voxel_layout().voxel_byte_size();
        let index = voxel_index(&self.key, map_layer.dimensions(self.region_dim));
        let at = index * voxel_size;
        self.chunk.mark_dirty(layer);
        Some(&mut self.chunk.layer_bytes_mut(layer)[at..at + voxel_size])
    }

    fn write_member(
        &mut self,
        layer: usize,
        member: usize,
        expected: DataType,
        bytes: &[u8],
    ) -> bool {
        let Some(map_layer) = self.layout.layer_ptr(layer) else {
            return false;
        };
        let voxel_layout = map_layer.voxel_layout();
        if member >= voxel_layout.member_count() {
            return false;
        }
        let m = voxel_layout.member(member);
        if m.data_type() != expected {
            return false;
        }
        let voxel_size = voxel_layout.voxel_byte_size();
        let index = voxel_index(&self.key, map_layer.dimensions(self.region_dim));
        let at = index * voxel_size + m.offset();
        self.chunk.layer_bytes_mut(layer)[at..at + bytes.len()].copy_from_slice(bytes);
        self.chunk.mark_dirty(layer);
        true
    }
}

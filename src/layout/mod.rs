//! Voxel and layer schema: what each voxel stores, per layer.

pub mod default_layers;
mod map_layout;
mod voxel_data;
mod voxel_layout;

pub use map_layout::{LayoutMatch, MapLayer, MapLayout};
pub use voxel_data::{CovarianceVoxel, HitMissCount, VoxelMean};
pub use voxel_layout::{clear_from_f32, clear_from_f64, clear_from_i32, DataType, VoxelLayout, VoxelMember};

//! Chunked map storage: chunks, the region index and the occupancy map.

mod chunk;
mod occupancy;
mod region_index;
mod voxel;

pub use chunk::{voxel_index, MapChunk};
pub use occupancy::{
    probability_to_value, value_to_probability, Occupancy, OccupancyConfig, OccupancyIter,
    OccupancyMap,
};
pub use voxel::{Voxel, VoxelMut};

pub(crate) use occupancy::update_occupancy_value;

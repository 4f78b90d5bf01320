//! Fundamental types: voxel keys, region geometry, world-space points.

mod key;
mod math;

pub use key::{Key, KeyList, RegionKey, RegionSize};
pub use math::Point3;

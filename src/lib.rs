//! # Ghana-Map: Probabilistic 3-D Occupancy Voxel Mapping
//!
//! A spatially chunked voxel map for robotic mapping. Streams of ranging
//! rays (sensor origin plus hit point) are integrated into per-voxel
//! log-odds occupancy estimates, optionally augmented with per-voxel mean,
//! covariance, clearance and other data layers.
//!
//! ## Features
//!
//! - **Chunked storage**: voxels live in fixed-size regions allocated
//!   lazily on first write and addressed by a spatial hash
//! - **Pluggable voxel schema**: each map carries an ordered set of named
//!   data layers with self-describing member layouts
//! - **Deterministic traversal**: segment-to-voxel walking with pinned tie
//!   breaking, so test output is reproducible
//! - **Batched device integration**: a double-buffered pipeline ships ray
//!   batches to a compute device through a bounded region cache, with a
//!   host fallback that applies identical arithmetic
//!
//! ## Quick Start
//!
//! ```rust
//! use ghana_map::{OccupancyMap, Point3, RayFlags, RegionSize};
//!
//! let mut map = OccupancyMap::new(0.25, RegionSize::cubic(32)).unwrap();
//!
//! // One ray: free space from the sensor to the sample, a hit at the
//! // sample.
//! let rays = [Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 1.0, 0.5)];
//! map.integrate_rays(&rays, RayFlags::NONE).unwrap();
//!
//! let key = map.voxel_key(Point3::new(2.0, 1.0, 0.5));
//! assert!(map.is_occupied(key));
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: voxel keys, region geometry, world-space points
//! - [`layout`]: the per-voxel member schema and well-known layers
//! - [`map`]: chunks, the region index and [`OccupancyMap`]
//! - [`raycast`]: segment-to-voxel traversal
//! - [`integrator`]: the host ray updater and integration flags
//! - [`gpu`]: the device abstraction, region cache and batched integrator
//! - [`io`]: the self-describing binary map format
//!
//! ## Data Flow
//!
//! ```text
//!  rays (origin, sample)*
//!        │
//!        ├────────────────────────────┐
//!        ▼                            ▼
//!  ┌───────────────┐          ┌────────────────┐
//!  │ host updater  │          │ GpuMap batches │
//!  │ (integrator)  │          │ (double-buffer)│
//!  └──────┬────────┘          └───────┬────────┘
//!         │ walk + log-odds           │ regions → LayerCache slots
//!         ▼                           ▼
//!  ┌───────────────┐   sync   ┌────────────────┐
//!  │   MapChunks   │◄─────────┤ device buffers │
//!  │ (region index)│          │ + update kernel│
//!  └───────────────┘          └────────────────┘
//! ```
//!
//! Within one `OccupancyMap` all mutating operations are single-writer;
//! device execution is asynchronous and observed through events. Parallel
//! threads operate on disjoint maps.

pub mod core;
pub mod error;
pub mod gpu;
pub mod integrator;
pub mod io;
pub mod layout;
pub mod map;
pub mod raycast;

// Re-export the main types at the crate root.
pub use crate::core::{Key, KeyList, Point3, RegionKey, RegionSize};
pub use error::{Error, Result};
pub use gpu::{Device, GpuMap, GpuMapConfig, HostDevice};
pub use integrator::RayFlags;
pub use layout::{DataType, LayoutMatch, MapLayout, VoxelLayout};
pub use map::{
    probability_to_value, value_to_probability, MapChunk, Occupancy, OccupancyConfig, OccupancyMap,
};

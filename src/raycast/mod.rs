//! Segment-to-voxel traversal.

mod line_walker;

pub use line_walker::{
    walk_segment_keys, walk_segment_regions, voxel_to_key, WalkContext,
};

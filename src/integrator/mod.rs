//! Ray integration into the map.

mod host;

pub use host::{integrate_rays, RayFlags};

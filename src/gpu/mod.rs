//! Device-backed batch integration: the device abstraction, the region
//! cache and the double-buffered batch integrator.

mod batch;
mod cache;
mod device;
mod kernel;

pub use batch::{GpuMap, GpuMapConfig};
pub use cache::LayerCache;
pub use device::{BufferId, Device, Event, HostDevice, Kernel, KernelArgs};
pub use kernel::{
    decode_key, decode_region_key, encode_key, encode_region_key, KernelParams, GPU_KEY_BYTES,
    RAY_BYTES, REGION_KEY_BYTES,
};

//! Error types for ghana-map.
//!
//! # Error Recovery Strategies
//!
//! Different error kinds call for different handling:
//!
//! - **`BadArgument`**: Caller error (out-of-range probability, zero
//!   resolution, negative cull distance). Fix the call site.
//!
//! - **`NoSuchLayer`**: The requested layer name or index is not present in
//!   the map layout. Check the layout before the operation.
//!
//! - **`RegionAllocationFailed`**: Host memory for a new chunk was refused.
//!   Free regions (cull or expire) and retry, or treat as fatal.
//!
//! - **`CacheExhausted`**: Every device cache slot is referenced by an
//!   unfinished device operation. Non-fatal: call
//!   [`GpuMap::sync_occupancy`](crate::gpu::GpuMap::sync_occupancy) and retry
//!   the batch.
//!
//! - **`DeviceUnavailable`**: No compute device. Synchronous integration
//!   falls back to the host updater; asynchronous calls surface this error.
//!
//! - **`DeviceKernelFailed`**: A kernel submission or completion reported
//!   failure. The affected batch is lost; the host copy of the map remains
//!   valid up to the last successful sync.
//!
//! - **`Io` / `BadFormat` / `UnsupportedVersion` / `LayoutMismatch`**:
//!   Surfaced from the map file codec. The map being loaded is left
//!   untouched.
//!
//! Voxel-level mismatches (stale sentinel, out-of-range stored value) are
//! never errors; such voxels read as "unknown".

use thiserror::Error;

/// Errors that can occur in ghana-map.
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("no such layer: {0}")]
    NoSuchLayer(String),

    #[error("region allocation failed for {0} bytes")]
    RegionAllocationFailed(usize),

    #[error("device cache exhausted: all slots in flight")]
    CacheExhausted,

    #[error("no compute device available")]
    DeviceUnavailable,

    #[error("device kernel failed: {0}")]
    DeviceKernelFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad map file format: {0}")]
    BadFormat(String),

    #[error("unsupported map file version: {0}")]
    UnsupportedVersion(u32),

    #[error("map layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("serialisation aborted")]
    Aborted,
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

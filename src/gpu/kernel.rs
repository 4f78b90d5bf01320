//! The device update programs.
//!
//! Real accelerator backends compile these programs for their own
//! execution model; this module defines the scalar parameter block, the
//! staging buffer encodings shared with the batch integrator, and a host
//! execution of both programs used by
//! [`HostDevice`](super::device::HostDevice).
//!
//! The update is two-pass. The `RegionUpdate` pass walks each ray and
//! applies misses freely; sample voxels are deferred to the serialized
//! `NdtHit` pass when NDT layers are present, because concurrent workers
//! may aim at the same endpoint voxel.

use crate::core::{Key, Point3, RegionKey, RegionSize};
use crate::integrator::RayFlags;
use crate::layout::{CovarianceVoxel, HitMissCount, VoxelMean};
use crate::map::update_occupancy_value;
use crate::raycast::{walk_segment_keys, WalkContext};

use super::device::{Kernel, KernelArgs};

/// Bytes of one encoded voxel key in the keys buffer.
pub const GPU_KEY_BYTES: usize = 12;
/// Bytes of one encoded ray (two `f32` triples) in the rays buffer.
pub const RAY_BYTES: usize = 24;
/// Bytes of one encoded region key in the region key buffer.
pub const REGION_KEY_BYTES: usize = 8;

/// Scalar parameters of an update launch.
#[derive(Clone, Copy, Debug)]
pub struct KernelParams {
    /// Voxels per region, per axis.
    pub region_dim: RegionSize,
    /// Voxel edge length in metres.
    pub resolution: f32,
    /// Log-odds applied by a miss.
    pub miss_value: f32,
    /// Log-odds applied by a hit.
    pub hit_value: f32,
    /// Occupancy threshold (log-odds).
    pub occupied_threshold: f32,
    /// Saturation lower bound.
    pub min_value: f32,
    /// Saturation upper bound.
    pub max_value: f32,
    /// Raw [`RayFlags`] bits.
    pub flags: u32,
    /// Expected sensor range noise in metres. Consumed by accelerator NDT
    /// variants; the host execution's covariance model does not use it.
    pub sensor_noise: f32,
    /// Rays in this launch.
    pub ray_count: u32,
    /// Regions resident for this launch.
    pub region_count: u32,
    /// True when the mean/covariance/hit-miss layers are bound.
    pub ndt: bool,
}

/// Encode a key into the keys buffer layout: region `i16` triple, local
/// `u8` triple, three pad bytes.
pub fn encode_key(key: &Key, out: &mut Vec<u8>) {
    let region = key.region();
    out.extend_from_slice(&region.x.to_le_bytes());
    out.extend_from_slice(&region.y.to_le_bytes());
    out.extend_from_slice(&region.z.to_le_bytes());
    let local = key.local();
    out.extend_from_slice(&local);
    out.extend_from_slice(&[0u8; 3]);
}

/// Decode a key from the keys buffer.
pub fn decode_key(bytes: &[u8]) -> Key {
    let region = RegionKey::new(
        i16::from_le_bytes([bytes[0], bytes[1]]),
        i16::from_le_bytes([bytes[2], bytes[3]]),
        i16::from_le_bytes([bytes[4], bytes[5]]),
    );
    Key::new(region, bytes[6], bytes[7], bytes[8])
}

/// Encode a region key into the region key buffer layout: `i16` triple
/// plus one pad `i16`.
pub fn encode_region_key(region: &RegionKey, out: &mut Vec<u8>) {
    out.extend_from_slice(&region.x.to_le_bytes());
    out.extend_from_slice(&region.y.to_le_bytes());
    out.extend_from_slice(&region.z.to_le_bytes());
    out.extend_from_slice(&[0u8; 2]);
}

/// Decode a region key from the region key buffer.
pub fn decode_region_key(bytes: &[u8]) -> RegionKey {
    RegionKey::new(
        i16::from_le_bytes([bytes[0], bytes[1]]),
        i16::from_le_bytes([bytes[2], bytes[3]]),
        i16::from_le_bytes([bytes[4], bytes[5]]),
    )
}

/// Execute a program against the device buffer store. Called by
/// [`HostDevice`](super::device::HostDevice)'s worker.
pub(crate) fn execute(kernel: Kernel, args: &KernelArgs, buffers: &mut [Vec<u8>]) {
    match kernel {
        Kernel::RegionUpdate => region_update(args, buffers),
        Kernel::NdtHit => ndt_hit(args, buffers),
    }
}

struct Staging {
    regions: Vec<RegionKey>,
    /// Per bound layer, one byte offset per region.
    offsets: Vec<Vec<u64>>,
    keys: Vec<u8>,
    rays: Vec<u8>,
}

fn stage(args: &KernelArgs, buffers: &[Vec<u8>]) -> Staging {
    let params = &args.params;
    let region_count = params.region_count as usize;

    let region_bytes = &buffers[args.region_keys];
    let regions = (0..region_count)
        .map(|i| decode_region_key(&region_bytes[i * REGION_KEY_BYTES..]))
        .collect();

    let offsets = args
        .voxel_buffers
        .iter()
        .map(|&(_, offsets_buffer)| {
            let bytes = &buffers[offsets_buffer];
            (0..region_count)
                .map(|i| {
                    u64::from_le_bytes([
                        bytes[i * 8],
                        bytes[i * 8 + 1],
                        bytes[i * 8 + 2],
                        bytes[i * 8 + 3],
                        bytes[i * 8 + 4],
                        bytes[i * 8 + 5],
                        bytes[i * 8 + 6],
                        bytes[i * 8 + 7],
                    ])
                })
                .collect()
        })
        .collect();

    Staging {
        regions,
        offsets,
        keys: buffers[args.keys].clone(),
        rays: buffers[args.rays].clone(),
    }
}

impl Staging {
    fn region_index(&self, region: RegionKey) -> Option<usize> {
        self.regions.iter().position(|r| *r == region)
    }

    fn ray_points(&self, ray: usize) -> (Point3, Point3) {
        let at = ray * RAY_BYTES;
        let read = |at: usize| -> f32 {
            f32::from_le_bytes([
                self.rays[at],
                self.rays[at + 1],
                self.rays[at + 2],
                self.rays[at + 3],
            ])
        };
        (
            Point3::new(
                f64::from(read(at)),
                f64::from(read(at + 4)),
                f64::from(read(at + 8)),
            ),
            Point3::new(
                f64::from(read(at + 12)),
                f64::from(read(at + 16)),
                f64::from(read(at + 20)),
            ),
        )
    }

    fn end_key(&self, ray: usize) -> Key {
        decode_key(&self.keys[(ray * 2 + 1) * GPU_KEY_BYTES..])
    }
}

fn read_f32(buffers: &[Vec<u8>], buffer: usize, at: usize) -> f32 {
    let b = &buffers[buffer];
    f32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn write_f32(buffers: &mut [Vec<u8>], buffer: usize, at: usize, value: f32) {
    buffers[buffer][at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Byte address of a voxel within a layer's packed device buffer.
fn voxel_address(staging: &Staging, layer: usize, region_index: usize, key: &Key, voxel_size: usize, dim: RegionSize) -> usize {
    let local = key.local();
    let index = local[0] as usize
        + local[1] as usize * dim.x as usize
        + local[2] as usize * dim.x as usize * dim.y as usize;
    staging.offsets[layer][region_index] as usize + index * voxel_size
}

fn region_update(args: &KernelArgs, buffers: &mut [Vec<u8>]) {
    let params = args.params;
    let flags = RayFlags::from_bits(params.flags);
    let staging = stage(args, buffers);

    let occupancy_buffer = args.voxel_buffers[0].0;
    let hit_miss = if params.ndt && args.voxel_buffers.len() > 3 {
        Some(args.voxel_buffers[3].0)
    } else {
        None
    };

    let context = WalkContext {
        origin: Point3::ZERO,
        resolution: f64::from(params.resolution),
        region_dim: params.region_dim,
    };

    let clear_only = flags.contains(RayFlags::CLEAR_ONLY);
    let stop_on_occupied = flags.contains(RayFlags::STOP_ON_FIRST_OCCUPIED);
    let exclude_sample = flags.contains(RayFlags::EXCLUDE_SAMPLE);
    let end_as_free = flags.contains(RayFlags::END_POINT_AS_FREE);

    let mut keys = crate::core::KeyList::new();
    for ray in 0..params.ray_count as usize {
        let (from, to) = staging.ray_points(ray);
        let end_key = staging.end_key(ray);

        keys.clear();
        walk_segment_keys(&mut keys, from, to, false, &context);

        let mut blocked = false;
        for i in 0..keys.len() {
            let key = keys[i];
            // The f32 reconstruction can drift the walk into the sample
            // voxel; the uploaded end key is authoritative.
            if key == end_key {
                continue;
            }
            let Some(region_index) = staging.region_index(key.region()) else {
                continue;
            };
            let at = voxel_address(&staging, 0, region_index, &key, 4, params.region_dim);
            let current = read_f32(buffers, occupancy_buffer, at);

            let observed = (params.min_value..=params.max_value).contains(&current);
            if stop_on_occupied && observed && current >= params.occupied_threshold {
                write_f32(
                    buffers,
                    occupancy_buffer,
                    at,
                    update_occupancy_value(
                        current,
                        params.miss_value,
                        params.min_value,
                        params.max_value,
                    ),
                );
                blocked = true;
                break;
            }
            if clear_only && !observed {
                continue;
            }
            write_f32(
                buffers,
                occupancy_buffer,
                at,
                update_occupancy_value(
                    current,
                    params.miss_value,
                    params.min_value,
                    params.max_value,
                ),
            );
            if let Some(hit_miss_buffer) = hit_miss {
                tally_miss(&staging, buffers, args, region_index, &key, hit_miss_buffer, params.region_dim);
            }
        }

        if blocked || exclude_sample {
            continue;
        }

        // Sample voxel handling for the non-NDT path. NDT launches set
        // EXCLUDE_SAMPLE and defer this to the NdtHit pass.
        let Some(region_index) = staging.region_index(end_key.region()) else {
            continue;
        };
        let at = voxel_address(&staging, 0, region_index, &end_key, 4, params.region_dim);
        let current = read_f32(buffers, occupancy_buffer, at);
        let observed = (params.min_value..=params.max_value).contains(&current);
        // Clear-only gates misses; a hit always lands.
        if clear_only && end_as_free && !observed {
            continue;
        }
        let delta = if end_as_free {
            params.miss_value
        } else {
            params.hit_value
        };
        write_f32(
            buffers,
            occupancy_buffer,
            at,
            update_occupancy_value(current, delta, params.min_value, params.max_value),
        );
    }
}

/// Increment the miss count of a traversed voxel that already carries a
/// distribution (NDT-TM counts misses only where a mean exists).
fn tally_miss(
    staging: &Staging,
    buffers: &mut [Vec<u8>],
    args: &KernelArgs,
    region_index: usize,
    key: &Key,
    hit_miss_buffer: usize,
    dim: RegionSize,
) {
    let mean_buffer = args.voxel_buffers[1].0;
    let mean_at = voxel_address(staging, 1, region_index, key, VoxelMean::BYTE_SIZE, dim);
    let mean = VoxelMean::from_bytes(&buffers[mean_buffer][mean_at..mean_at + VoxelMean::BYTE_SIZE]);
    if mean.count == 0 {
        return;
    }
    let at = voxel_address(staging, 3, region_index, key, HitMissCount::BYTE_SIZE, dim);
    let mut counts =
        HitMissCount::from_bytes(&buffers[hit_miss_buffer][at..at + HitMissCount::BYTE_SIZE]);
    counts.miss_count = counts.miss_count.saturating_add(1);
    counts.write_bytes(&mut buffers[hit_miss_buffer][at..at + HitMissCount::BYTE_SIZE]);
}

fn ndt_hit(args: &KernelArgs, buffers: &mut [Vec<u8>]) {
    let params = args.params;
    let staging = stage(args, buffers);

    let occupancy_buffer = args.voxel_buffers[0].0;
    let mean_buffer = args.voxel_buffers[1].0;
    let covariance_buffer = args.voxel_buffers[2].0;
    let hit_miss_buffer = args.voxel_buffers[3].0;

    let resolution = f64::from(params.resolution);
    let dim = params.region_dim;

    for ray in 0..params.ray_count as usize {
        let (_, sample) = staging.ray_points(ray);
        let end_key = staging.end_key(ray);
        let Some(region_index) = staging.region_index(end_key.region()) else {
            continue;
        };

        // Occupancy hit.
        let at = voxel_address(&staging, 0, region_index, &end_key, 4, dim);
        let current = read_f32(buffers, occupancy_buffer, at);
        write_f32(
            buffers,
            occupancy_buffer,
            at,
            update_occupancy_value(current, params.hit_value, params.min_value, params.max_value),
        );

        // Sample position as a fraction of the voxel.
        let fraction = [
            (sample.x / resolution - end_key.global_axis(0, dim) as f64).clamp(0.0, 1.0),
            (sample.y / resolution - end_key.global_axis(1, dim) as f64).clamp(0.0, 1.0),
            (sample.z / resolution - end_key.global_axis(2, dim) as f64).clamp(0.0, 1.0),
        ];

        // Welford update of mean and covariance in voxel-local metres.
        let mean_at = voxel_address(&staging, 1, region_index, &end_key, VoxelMean::BYTE_SIZE, dim);
        let mut mean =
            VoxelMean::from_bytes(&buffers[mean_buffer][mean_at..mean_at + VoxelMean::BYTE_SIZE]);
        let mean_before = mean.position(resolution);
        mean.update(fraction);
        let mean_after = mean.position(resolution);
        mean.write_bytes(&mut buffers[mean_buffer][mean_at..mean_at + VoxelMean::BYTE_SIZE]);

        let sample_local = Point3::new(
            fraction[0] * resolution,
            fraction[1] * resolution,
            fraction[2] * resolution,
        );
        let cov_at = voxel_address(
            &staging,
            2,
            region_index,
            &end_key,
            CovarianceVoxel::BYTE_SIZE,
            dim,
        );
        let mut covariance = CovarianceVoxel::from_bytes(
            &buffers[covariance_buffer][cov_at..cov_at + CovarianceVoxel::BYTE_SIZE],
        );
        covariance.update(sample_local, mean_before, mean_after);
        covariance.write_bytes(
            &mut buffers[covariance_buffer][cov_at..cov_at + CovarianceVoxel::BYTE_SIZE],
        );

        let counts_at = voxel_address(
            &staging,
            3,
            region_index,
            &end_key,
            HitMissCount::BYTE_SIZE,
            dim,
        );
        let mut counts = HitMissCount::from_bytes(
            &buffers[hit_miss_buffer][counts_at..counts_at + HitMissCount::BYTE_SIZE],
        );
        counts.hit_count = counts.hit_count.saturating_add(1);
        counts.write_bytes(
            &mut buffers[hit_miss_buffer][counts_at..counts_at + HitMissCount::BYTE_SIZE],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding_round_trip() {
        let key = Key::new(RegionKey::new(-3, 7, 12000), 31, 0, 15);
        let mut bytes = Vec::new();
        encode_key(&key, &mut bytes);
        assert_eq!(bytes.len(), GPU_KEY_BYTES);
        assert_eq!(decode_key(&bytes), key);
    }

    #[test]
    fn test_region_key_encoding_round_trip() {
        let region = RegionKey::new(i16::MIN, -1, i16::MAX);
        let mut bytes = Vec::new();
        encode_region_key(&region, &mut bytes);
        assert_eq!(bytes.len(), REGION_KEY_BYTES);
        assert_eq!(decode_region_key(&bytes), region);
    }
}

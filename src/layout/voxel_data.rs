//! Packed per-voxel data structures for the well-known layers.
//!
//! These mirror the byte layouts declared by
//! [`default_layers`](super::default_layers): each struct converts to and
//! from the little-endian bytes of one voxel in its layer.

use crate::core::Point3;

/// Voxel mean data: sub-voxel mean position packed into 30 bits plus a
/// sample count.
///
/// Each axis of the mean is quantised to 10 bits over `[0, 1)` within the
/// voxel, relative to the voxel's minimum corner. The progressive mean
/// update keeps the packed form exact enough for NDT use while costing
/// 8 bytes per voxel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VoxelMean {
    /// Packed sub-voxel coordinate: bits [0,10) x, [10,20) y, [20,30) z.
    pub coord: u32,
    /// Number of samples accumulated into the mean.
    pub count: u32,
}

const MEAN_QUANTA: u32 = 1023;

impl VoxelMean {
    /// Byte size of the packed struct.
    pub const BYTE_SIZE: usize = 8;

    /// Decode from one voxel's bytes in the mean layer.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            coord: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            count: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Encode into one voxel's bytes in the mean layer.
    pub fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.coord.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.count.to_le_bytes());
    }

    /// Unpack the mean position as a fraction of the voxel in `[0, 1)` per
    /// axis, relative to the voxel's minimum corner.
    pub fn position_fraction(&self) -> [f64; 3] {
        let unpack = |bits: u32| -> f64 { f64::from(bits & MEAN_QUANTA) / f64::from(MEAN_QUANTA + 1) };
        [
            unpack(self.coord),
            unpack(self.coord >> 10),
            unpack(self.coord >> 20),
        ]
    }

    /// Mean position in metres relative to the voxel's minimum corner.
    pub fn position(&self, resolution: f64) -> Point3 {
        let f = self.position_fraction();
        Point3::new(f[0] * resolution, f[1] * resolution, f[2] * resolution)
    }

    /// Fold one sample into the mean. `sample_fraction` is the sample
    /// position as a fraction of the voxel in `[0, 1)` per axis.
    pub fn update(&mut self, sample_fraction: [f64; 3]) {
        let current = self.position_fraction();
        let count = f64::from(self.count);
        let pack = |axis: usize| -> u32 {
            let mean = (current[axis] * count + sample_fraction[axis].clamp(0.0, 1.0))
                / (count + 1.0);
            ((mean * f64::from(MEAN_QUANTA + 1)) as u32).min(MEAN_QUANTA)
        };
        self.coord = pack(0) | (pack(1) << 10) | (pack(2) << 20);
        self.count = self.count.saturating_add(1);
    }
}

/// Upper-triangular 3x3 covariance sums, stored per voxel in the
/// covariance layer.
///
/// Holds the running sum of squared deviations (Welford's M2 matrix) in the
/// order xx, xy, yy, xz, yz, zz. The covariance is `m2 / count` with the
/// count taken from the voxel's [`VoxelMean`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CovarianceVoxel {
    /// Upper triangular entries: xx, xy, yy, xz, yz, zz.
    pub m2: [f32; 6],
}

impl CovarianceVoxel {
    /// Byte size of the packed struct.
    pub const BYTE_SIZE: usize = 24;

    /// Decode from one voxel's bytes in the covariance layer.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut m2 = [0f32; 6];
        for (i, value) in m2.iter_mut().enumerate() {
            let at = i * 4;
            *value = f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        }
        Self { m2 }
    }

    /// Encode into one voxel's bytes in the covariance layer.
    pub fn write_bytes(&self, bytes: &mut [u8]) {
        for (i, value) in self.m2.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Welford incremental update.
    ///
    /// `mean_before` is the voxel mean before this sample was folded in and
    /// `mean_after` the mean afterwards, both in voxel-local metres, as is
    /// `sample`. The M2 sums accumulate
    /// `(sample - mean_before) * (sample - mean_after)^T`.
    pub fn update(&mut self, sample: Point3, mean_before: Point3, mean_after: Point3) {
        let d0 = sample - mean_before;
        let d1 = sample - mean_after;
        self.m2[0] += (d0.x * d1.x) as f32;
        self.m2[1] += (d0.x * d1.y) as f32;
        self.m2[2] += (d0.y * d1.y) as f32;
        self.m2[3] += (d0.x * d1.z) as f32;
        self.m2[4] += (d0.y * d1.z) as f32;
        self.m2[5] += (d0.z * d1.z) as f32;
    }

    /// Covariance entries for a voxel with `count` samples, or zeros for an
    /// empty voxel.
    pub fn covariance(&self, count: u32) -> [f32; 6] {
        if count == 0 {
            return [0.0; 6];
        }
        let inv = 1.0 / count as f32;
        let mut cov = self.m2;
        for value in &mut cov {
            *value *= inv;
        }
        cov
    }
}

/// Hit and miss counters for NDT-TM style updates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HitMissCount {
    /// Samples that ended in this voxel.
    pub hit_count: u32,
    /// Rays that passed through this voxel without ending in it.
    pub miss_count: u32,
}

impl HitMissCount {
    /// Byte size of the packed struct.
    pub const BYTE_SIZE: usize = 8;

    /// Decode from one voxel's bytes in the hit/miss layer.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            hit_count: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            miss_count: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Encode into one voxel's bytes in the hit/miss layer.
    pub fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.hit_count.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.miss_count.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_voxel_mean_round_trip() {
        let mut mean = VoxelMean::default();
        mean.update([0.5, 0.25, 0.75]);

        let mut bytes = [0u8; VoxelMean::BYTE_SIZE];
        mean.write_bytes(&mut bytes);
        let decoded = VoxelMean::from_bytes(&bytes);
        assert_eq!(decoded, mean);
        assert_eq!(decoded.count, 1);

        let f = decoded.position_fraction();
        assert_relative_eq!(f[0], 0.5, epsilon = 2e-3);
        assert_relative_eq!(f[1], 0.25, epsilon = 2e-3);
        assert_relative_eq!(f[2], 0.75, epsilon = 2e-3);
    }

    #[test]
    fn test_voxel_mean_progressive_average() {
        let mut mean = VoxelMean::default();
        mean.update([0.0, 0.0, 0.0]);
        mean.update([0.5, 0.5, 0.5]);

        let f = mean.position_fraction();
        assert_relative_eq!(f[0], 0.25, epsilon = 4e-3);
        assert_eq!(mean.count, 2);
    }

    #[test]
    fn test_voxel_mean_position_scaled_by_resolution() {
        let mut mean = VoxelMean::default();
        mean.update([0.5, 0.5, 0.5]);
        let p = mean.position(0.2);
        assert_relative_eq!(p.x, 0.1, epsilon = 1e-3);
    }

    #[test]
    fn test_covariance_welford_matches_batch() {
        // Three samples on a line; compare Welford sums against the batch
        // covariance.
        let samples = [
            Point3::new(0.1, 0.0, 0.0),
            Point3::new(0.2, 0.0, 0.0),
            Point3::new(0.3, 0.0, 0.0),
        ];

        let mut cov = CovarianceVoxel::default();
        let mut mean = Point3::ZERO;
        for (i, sample) in samples.iter().enumerate() {
            let count = i as f64;
            let mean_after = (mean * count + *sample) * (1.0 / (count + 1.0));
            cov.update(*sample, mean, mean_after);
            mean = mean_after;
        }

        // Batch variance of x: E[(x - 0.2)^2] = (0.01 + 0 + 0.01) / 3.
        let xx = cov.covariance(3)[0];
        assert_relative_eq!(xx, (0.02 / 3.0) as f32, epsilon = 1e-6);
        // Off-diagonals stay zero.
        assert_relative_eq!(cov.covariance(3)[1], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_hit_miss_round_trip() {
        let counts = HitMissCount {
            hit_count: 7,
            miss_count: 21,
        };
        let mut bytes = [0u8; HitMissCount::BYTE_SIZE];
        counts.write_bytes(&mut bytes);
        assert_eq!(HitMissCount::from_bytes(&bytes), counts);
    }
}

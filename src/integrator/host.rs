//! Host-side probabilistic ray updater.
//!
//! Applies the log-odds update rule along each ray's traversed voxels: one
//! miss per crossed voxel, and a hit at the sample voxel unless the ray is
//! flagged as free at its endpoint. This is the in-process counterpart of
//! the batched device integrator and produces the same per-voxel
//! arithmetic.

use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::{KeyList, Point3};
use crate::error::Result;
use crate::map::{Occupancy, OccupancyMap};

/// Behaviour flags for ray integration.
///
/// Flags combine with `|`. The unset default integrates misses along each
/// ray and a hit at the sample voxel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RayFlags(u32);

impl RayFlags {
    /// No flags: misses along the ray, hit at the endpoint.
    pub const NONE: RayFlags = RayFlags(0);
    /// Treat the endpoint voxel as free (miss) instead of a hit.
    pub const END_POINT_AS_FREE: RayFlags = RayFlags(1);
    /// Stop traversal at the first occupied voxel along the ray.
    pub const STOP_ON_FIRST_OCCUPIED: RayFlags = RayFlags(1 << 1);
    /// Leave unobserved voxels untouched; only adjust observed ones.
    pub const CLEAR_ONLY: RayFlags = RayFlags(1 << 2);
    /// Do not update the sample voxel at all. Used by the device
    /// integrator's miss pass, which defers sample updates to a second
    /// pass.
    pub const EXCLUDE_SAMPLE: RayFlags = RayFlags(1 << 3);

    /// True when every flag in `other` is set in `self`.
    #[inline]
    pub fn contains(&self, other: RayFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit value, as passed to the device kernel.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Reconstruct from raw bits.
    #[inline]
    pub fn from_bits(bits: u32) -> RayFlags {
        RayFlags(bits)
    }
}

impl BitOr for RayFlags {
    type Output = RayFlags;

    #[inline]
    fn bitor(self, other: RayFlags) -> RayFlags {
        RayFlags(self.0 | other.0)
    }
}

/// Integrate rays into `map` on the host.
///
/// `rays` holds consecutive (sensor origin, sample) point pairs; a trailing
/// unpaired point is ignored. Every voxel crossed by a ray receives a miss
/// except the sample voxel, which receives a hit unless
/// [`RayFlags::END_POINT_AS_FREE`] is set. The abort flag, when given, is
/// read between rays; integration stops early without error once it is
/// set.
///
/// Returns the number of rays applied.
pub fn integrate_rays(
    map: &mut OccupancyMap,
    rays: &[Point3],
    flags: RayFlags,
    abort: Option<&AtomicBool>,
) -> Result<usize> {
    let mut keys = KeyList::new();
    let mut applied = 0;

    for ray in rays.chunks_exact(2) {
        if let Some(abort) = abort {
            if abort.load(Ordering::Relaxed) {
                break;
            }
        }
        integrate_ray(map, ray[0], ray[1], flags, &mut keys)?;
        applied += 1;
    }
    Ok(applied)
}

fn integrate_ray(
    map: &mut OccupancyMap,
    origin: Point3,
    sample: Point3,
    flags: RayFlags,
    keys: &mut KeyList,
) -> Result<()> {
    keys.clear();
    map.calculate_segment_keys(keys, origin, sample, false);

    let clear_only = flags.contains(RayFlags::CLEAR_ONLY);
    let stop_on_occupied = flags.contains(RayFlags::STOP_ON_FIRST_OCCUPIED);

    for i in 0..keys.len() {
        let key = keys[i];
        let value = map.occupancy(key);
        let occupancy = map.occupancy_type(value);

        if stop_on_occupied && occupancy == Occupancy::Occupied {
            // The ray is blocked before its sample: adjust the blocking
            // voxel toward free and stop.
            map.integrate_miss(key)?;
            return Ok(());
        }
        if clear_only && occupancy == Occupancy::Unknown {
            continue;
        }
        map.integrate_miss(key)?;
    }

    if flags.contains(RayFlags::EXCLUDE_SAMPLE) {
        return Ok(());
    }

    let sample_key = map.voxel_key(sample);
    if flags.contains(RayFlags::END_POINT_AS_FREE) {
        if clear_only && map.occupancy_type(map.occupancy(sample_key)) == Occupancy::Unknown {
            return Ok(());
        }
        map.integrate_miss(sample_key)?;
    } else {
        map.integrate_hit(sample_key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RegionSize;
    use crate::layout::default_layers::unobserved_occupancy_value;
    use approx::assert_relative_eq;

    fn test_map(resolution: f64, region: u8) -> OccupancyMap {
        OccupancyMap::new(resolution, RegionSize::cubic(region)).unwrap()
    }

    #[test]
    fn test_single_ray_miss_and_hit() {
        let mut map = test_map(0.25, 32);
        let origin = Point3::new(0.3, 0.3, 0.3);
        let sample = Point3::new(1.1, 1.1, 1.1);

        map.integrate_rays(&[origin, sample], RayFlags::NONE).unwrap();

        // Traversed voxels from (1,1,1) carry misses; the sample voxel
        // (4,4,4) carries its hit on top of any misses recorded on the way
        // in.
        let mut keys = KeyList::new();
        map.calculate_segment_keys(&mut keys, origin, sample, false);
        assert_eq!(keys[0].local(), [1, 1, 1]);
        for key in keys.iter() {
            assert!(map.occupancy(*key) < 0.0, "voxel on ray should be free");
        }

        let sample_key = map.voxel_key(sample);
        assert_eq!(sample_key.local(), [4, 4, 4]);
        assert!(map.occupancy(sample_key) >= map.hit_value() + map.miss_value());
        assert!(map.is_occupied(sample_key));
    }

    #[test]
    fn test_ray_crossing_regions() {
        let mut map = test_map(0.25, 16);
        let origin = Point3::new(-5.0, -5.0, -5.0);
        let sample = Point3::new(0.3, 0.3, 0.3);

        map.integrate_rays(&[origin, sample], RayFlags::NONE).unwrap();

        // Regions along the diagonal were created and populated.
        assert!(map.region_count() >= 2);
        let sample_key = map.voxel_key(sample);
        assert_eq!(sample_key.region(), crate::core::RegionKey::new(0, 0, 0));
        assert!(map.is_occupied(sample_key));

        let origin_key = map.voxel_key(origin);
        assert!(map.occupancy(origin_key) < 0.0);
    }

    #[test]
    fn test_end_point_as_free() {
        let mut map = test_map(0.25, 32);
        let sample = Point3::new(1.1, 0.1, 0.1);

        map.integrate_rays(
            &[Point3::new(0.1, 0.1, 0.1), sample],
            RayFlags::END_POINT_AS_FREE,
        )
        .unwrap();

        let sample_key = map.voxel_key(sample);
        assert!(map.occupancy(sample_key) < 0.0);
    }

    #[test]
    fn test_clear_only_leaves_unobserved_untouched() {
        let mut map = test_map(0.25, 32);
        let origin = Point3::new(0.1, 0.1, 0.1);
        let sample = Point3::new(2.1, 0.1, 0.1);

        // Pre-occupy one voxel on the ray.
        let occupied = map.voxel_key(Point3::new(1.1, 0.1, 0.1));
        for _ in 0..4 {
            map.integrate_hit(occupied).unwrap();
        }

        let flags = RayFlags::END_POINT_AS_FREE
            | RayFlags::STOP_ON_FIRST_OCCUPIED
            | RayFlags::CLEAR_ONLY;
        map.integrate_rays(&[origin, sample], flags).unwrap();

        // The occupied voxel moved toward free.
        assert!(map.occupancy(occupied) < map.max_value());

        // Every other voxel stayed unobserved.
        let mut keys = KeyList::new();
        map.calculate_segment_keys(&mut keys, origin, sample, true);
        for key in keys.iter() {
            if *key != occupied {
                assert_eq!(
                    map.occupancy(*key),
                    unobserved_occupancy_value(),
                    "unobserved voxel must stay unobserved"
                );
            }
        }
    }

    #[test]
    fn test_stop_on_first_occupied_shields_sample() {
        let mut map = test_map(0.25, 32);
        let origin = Point3::new(0.1, 0.1, 0.1);
        let sample = Point3::new(2.1, 0.1, 0.1);

        let blocker = map.voxel_key(Point3::new(1.1, 0.1, 0.1));
        for _ in 0..8 {
            map.integrate_hit(blocker).unwrap();
        }
        let blocker_value = map.occupancy(blocker);

        map.integrate_rays(&[origin, sample], RayFlags::STOP_ON_FIRST_OCCUPIED)
            .unwrap();

        // Blocker got a miss, sample voxel was never reached.
        assert_relative_eq!(
            map.occupancy(blocker),
            blocker_value + map.miss_value(),
            epsilon = 1e-6
        );
        let sample_key = map.voxel_key(sample);
        assert_eq!(map.occupancy(sample_key), unobserved_occupancy_value());
    }

    #[test]
    fn test_abort_stops_between_rays() {
        let mut map = test_map(0.25, 32);
        let abort = AtomicBool::new(true);

        let rays = [
            Point3::new(0.1, 0.1, 0.1),
            Point3::new(1.1, 0.1, 0.1),
            Point3::new(0.1, 0.1, 0.1),
            Point3::new(0.1, 1.1, 0.1),
        ];
        let applied = map
            .integrate_rays_with_abort(&rays, RayFlags::NONE, &abort)
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(map.region_count(), 0);
    }

    #[test]
    fn test_trailing_unpaired_point_ignored() {
        let mut map = test_map(0.25, 32);
        let rays = [
            Point3::new(0.1, 0.1, 0.1),
            Point3::new(1.1, 0.1, 0.1),
            Point3::new(9.0, 9.0, 9.0),
        ];
        let applied = map.integrate_rays(&rays, RayFlags::NONE).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(
            map.occupancy(map.voxel_key(Point3::new(9.0, 9.0, 9.0))),
            unobserved_occupancy_value()
        );
    }

    #[test]
    fn test_exclude_sample_skips_endpoint() {
        let mut map = test_map(0.25, 32);
        let sample = Point3::new(1.1, 0.1, 0.1);
        map.integrate_rays(
            &[Point3::new(0.1, 0.1, 0.1), sample],
            RayFlags::EXCLUDE_SAMPLE,
        )
        .unwrap();

        let sample_key = map.voxel_key(sample);
        assert_eq!(map.occupancy(sample_key), unobserved_occupancy_value());
    }
}

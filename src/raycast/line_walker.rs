//! Voxel traversal of line segments.
//!
//! Implements the Amanatides-Woo DDA over the map's voxel grid, producing
//! the ordered key sequence for every voxel a segment crosses. The same
//! stepping runs at region granularity for the batch integrator, which only
//! needs the set of touched regions.
//!
//! # Numeric rules
//!
//! - Both endpoints are taken relative to the map origin in double
//!   precision, and converted to integer cell coordinates before stepping,
//!   so precision does not decay on large maps.
//! - Axes with zero direction never step (`t_max = +inf`).
//! - A tie between two axes' `t_max` steps the lower axis index (x before y
//!   before z) for reproducible output.
//! - The walk terminates at the cell containing the segment end; that cell
//!   is emitted only when requested.

use crate::core::{Key, KeyList, Point3, RegionKey, RegionSize};

/// Geometry needed to walk a segment: map origin, voxel resolution and
/// region dimensions.
#[derive(Clone, Copy, Debug)]
pub struct WalkContext {
    /// World-space origin of voxel (0,0,0;0,0,0).
    pub origin: Point3,
    /// Voxel edge length in metres.
    pub resolution: f64,
    /// Voxels per region, per axis.
    pub region_dim: RegionSize,
}

impl WalkContext {
    /// Upper bound on the number of voxels a segment of `length` metres can
    /// cross. Callers sizing buffers use this bound.
    #[inline]
    pub fn max_segment_keys(&self, length: f64) -> usize {
        ((length / self.resolution).ceil() * 3f64.sqrt()) as usize + 1
    }

    /// The cell coordinate containing `p` on each axis, for cells of size
    /// `cell`. Ties break toward the lower edge (floor).
    #[inline]
    fn cell_of(rel: Point3, cell: [f64; 3]) -> [i64; 3] {
        [
            (rel.x / cell[0]).floor() as i64,
            (rel.y / cell[1]).floor() as i64,
            (rel.z / cell[2]).floor() as i64,
        ]
    }
}

/// Convert a global voxel coordinate to a key.
#[inline]
pub fn voxel_to_key(voxel: [i64; 3], region_dim: RegionSize) -> Key {
    let dim = [
        region_dim.x as i64,
        region_dim.y as i64,
        region_dim.z as i64,
    ];
    let region = RegionKey::new(
        voxel[0].div_euclid(dim[0]) as i16,
        voxel[1].div_euclid(dim[1]) as i16,
        voxel[2].div_euclid(dim[2]) as i16,
    );
    Key::new(
        region,
        voxel[0].rem_euclid(dim[0]) as u8,
        voxel[1].rem_euclid(dim[1]) as u8,
        voxel[2].rem_euclid(dim[2]) as u8,
    )
}

/// Walk the cells crossed by the open segment `rel_from -> rel_to`
/// (already relative to the grid origin), calling `visit` for each cell
/// before the final one, in traversal order. The final cell is visited only
/// when `include_end` is set.
fn walk_cells(
    rel_from: Point3,
    rel_to: Point3,
    cell: [f64; 3],
    include_end: bool,
    mut visit: impl FnMut([i64; 3]),
) {
    let mut current = WalkContext::cell_of(rel_from, cell);
    let end = WalkContext::cell_of(rel_to, cell);

    if current == end {
        if include_end {
            visit(end);
        }
        return;
    }

    let dir = rel_to - rel_from;

    let mut step = [0i64; 3];
    let mut t_max = [f64::INFINITY; 3];
    let mut t_delta = [f64::INFINITY; 3];
    for axis in 0..3 {
        let d = dir[axis];
        if d != 0.0 {
            step[axis] = if d > 0.0 { 1 } else { -1 };
            let boundary = (current[axis] + i64::from(d > 0.0)) as f64 * cell[axis];
            t_max[axis] = (boundary - rel_from[axis]) / d;
            t_delta[axis] = cell[axis] / d.abs();
        }
    }

    // Exact step count: the DDA advances one axis per iteration, so the
    // walk takes the L1 cell distance in steps. The bound guards against a
    // stall from pathological float input; the end test is the normal exit.
    let limit = (0..3)
        .map(|a| (end[a] - current[a]).unsigned_abs() as usize)
        .sum::<usize>()
        + 1;

    for _ in 0..limit {
        visit(current);

        let mut axis = 0;
        for a in 1..3 {
            if t_max[a] < t_max[axis] {
                axis = a;
            }
        }
        current[axis] += step[axis];
        t_max[axis] += t_delta[axis];

        if current == end {
            break;
        }
    }

    if include_end {
        visit(end);
    }
}

/// Compute the ordered keys of every voxel crossed by the segment
/// `from -> to`, appending to `out`. The voxel containing `to` is included
/// only when `include_end_point` is set. Returns the number of keys
/// appended.
pub fn walk_segment_keys(
    out: &mut KeyList,
    from: Point3,
    to: Point3,
    include_end_point: bool,
    context: &WalkContext,
) -> usize {
    let rel_from = from - context.origin;
    let rel_to = to - context.origin;
    let cell = [context.resolution; 3];

    out.reserve(context.max_segment_keys((to - from).length()));
    let before = out.len();
    walk_cells(rel_from, rel_to, cell, include_end_point, |voxel| {
        out.push(voxel_to_key(voxel, context.region_dim));
    });
    out.len() - before
}

/// Compute the regions crossed by the segment `from -> to`, including the
/// end region, appending to `out`. Returns the number of regions appended.
///
/// This is the coarse stepping used by the batch integrator to resolve
/// which regions a ray touches.
pub fn walk_segment_regions(
    out: &mut Vec<RegionKey>,
    from: Point3,
    to: Point3,
    context: &WalkContext,
) -> usize {
    let rel_from = from - context.origin;
    let rel_to = to - context.origin;
    let cell = [
        context.resolution * context.region_dim.x as f64,
        context.resolution * context.region_dim.y as f64,
        context.resolution * context.region_dim.z as f64,
    ];

    let before = out.len();
    walk_cells(rel_from, rel_to, cell, true, |region| {
        out.push(RegionKey::new(
            region[0] as i16,
            region[1] as i16,
            region[2] as i16,
        ));
    });
    out.len() - before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(resolution: f64, region: u8) -> WalkContext {
        WalkContext {
            origin: Point3::ZERO,
            resolution,
            region_dim: RegionSize::cubic(region),
        }
    }

    fn keys_for(from: Point3, to: Point3, include_end: bool, ctx: &WalkContext) -> Vec<Key> {
        let mut out = KeyList::new();
        walk_segment_keys(&mut out, from, to, include_end, ctx);
        out.as_slice().to_vec()
    }

    #[test]
    fn test_axis_aligned_walk() {
        let ctx = context(1.0, 32);
        let keys = keys_for(
            Point3::new(0.5, 0.5, 0.5),
            Point3::new(4.5, 0.5, 0.5),
            true,
            &ctx,
        );

        assert_eq!(keys.len(), 5);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(key.local(), [i as u8, 0, 0]);
        }
    }

    #[test]
    fn test_endpoint_exclusion() {
        let ctx = context(1.0, 32);
        let with_end = keys_for(
            Point3::new(0.5, 0.5, 0.5),
            Point3::new(3.5, 0.5, 0.5),
            true,
            &ctx,
        );
        let without_end = keys_for(
            Point3::new(0.5, 0.5, 0.5),
            Point3::new(3.5, 0.5, 0.5),
            false,
            &ctx,
        );

        assert_eq!(with_end.len(), without_end.len() + 1);
        assert_eq!(&with_end[..without_end.len()], &without_end[..]);
    }

    #[test]
    fn test_degenerate_segment_single_cell() {
        let ctx = context(0.25, 32);
        let p = Point3::new(0.3, 0.3, 0.3);
        let q = Point3::new(0.4, 0.35, 0.3);

        let keys = keys_for(p, q, true, &ctx);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].local(), [1, 1, 1]);

        let keys = keys_for(p, q, false, &ctx);
        assert!(keys.is_empty());
    }

    #[test]
    fn test_diagonal_tie_steps_lowest_axis_first() {
        let ctx = context(1.0, 32);
        // Perfect diagonal from cell (0,0,0) to (1,1,1): all three t_max
        // values tie at every boundary. The walk must step x, then y, then
        // z.
        let keys = keys_for(Point3::ZERO, Point3::new(2.0, 2.0, 2.0), false, &ctx);

        let locals: Vec<[u8; 3]> = keys.iter().map(|k| k.local()).collect();
        assert_eq!(
            locals,
            vec![
                [0, 0, 0],
                [1, 0, 0],
                [1, 1, 0],
                [1, 1, 1],
                [2, 1, 1],
                [2, 2, 1],
            ]
        );
    }

    #[test]
    fn test_consecutive_keys_differ_by_one_step() {
        let ctx = context(0.25, 16);
        let keys = keys_for(
            Point3::new(-3.9, 1.2, 0.7),
            Point3::new(2.8, -2.3, 3.1),
            true,
            &ctx,
        );
        assert!(keys.len() > 10);

        let dim = ctx.region_dim;
        for pair in keys.windows(2) {
            let mut diffs = 0;
            for axis in 0..3 {
                let a = pair[0].global_axis(axis, dim);
                let b = pair[1].global_axis(axis, dim);
                let d = (b - a).abs();
                assert!(d <= 1, "step larger than one voxel on axis {}", axis);
                diffs += d;
            }
            assert_eq!(diffs, 1, "consecutive keys must differ on exactly one axis");
        }
    }

    #[test]
    fn test_zero_direction_axis_never_steps() {
        let ctx = context(0.5, 32);
        let keys = keys_for(
            Point3::new(0.1, 0.6, 0.9),
            Point3::new(5.1, 0.6, 0.9),
            true,
            &ctx,
        );
        for key in &keys {
            assert_eq!(key.local_axis(1), 1);
            assert_eq!(key.local_axis(2), 1);
        }
    }

    #[test]
    fn test_negative_direction_crosses_region() {
        let ctx = context(0.25, 16);
        let keys = keys_for(
            Point3::new(0.3, 0.3, 0.3),
            Point3::new(-0.7, 0.3, 0.3),
            true,
            &ctx,
        );

        assert_eq!(keys.first().unwrap().region(), RegionKey::new(0, 0, 0));
        assert_eq!(keys.last().unwrap().region(), RegionKey::new(-1, 0, 0));
        // -0.7 / 0.25 = -2.8 -> voxel -3 -> local 13 in region -1.
        assert_eq!(keys.last().unwrap().local(), [13, 1, 1]);
    }

    #[test]
    fn test_key_count_within_bound() {
        let ctx = context(0.1, 32);
        let from = Point3::new(0.05, 0.05, 0.05);
        let to = Point3::new(3.33, 2.71, 1.41);

        let keys = keys_for(from, to, true, &ctx);
        assert!(keys.len() <= ctx.max_segment_keys((to - from).length()));
    }

    #[test]
    fn test_region_walk_covers_voxel_regions() {
        let ctx = context(0.25, 16);
        let from = Point3::new(-5.0, -5.0, -5.0);
        let to = Point3::new(0.3, 0.3, 0.3);

        let mut regions = Vec::new();
        walk_segment_regions(&mut regions, from, to, &ctx);

        // Every region seen in the fine walk must appear in the coarse
        // walk.
        let keys = keys_for(from, to, true, &ctx);
        for key in &keys {
            assert!(
                regions.contains(&key.region()),
                "missing region {:?}",
                key.region()
            );
        }
        assert!(regions.contains(&RegionKey::new(-2, -2, -2)));
        assert!(regions.contains(&RegionKey::new(0, 0, 0)));
    }
}

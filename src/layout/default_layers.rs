//! Well-known layer names and helpers for adding them to a layout.
//!
//! Each helper is a no-op when the layout already has a layer of that name;
//! no validation is performed that an existing layer's structure matches.

use super::map_layout::{MapLayer, MapLayout};
use super::voxel_layout::{clear_from_f32, DataType};

/// Name of the occupancy layer: one `f32` log-odds value per voxel.
pub const OCCUPANCY_LAYER: &str = "occupancy";
/// Name of the voxel mean layer: packed sub-voxel mean plus sample count.
pub const MEAN_LAYER: &str = "mean";
/// Name of the covariance layer: upper-triangular 3x3 as six `f32`.
pub const COVARIANCE_LAYER: &str = "covariance";
/// Name of the clearance layer: range to the nearest obstruction in metres.
pub const CLEARANCE_LAYER: &str = "clearance";
/// Name of the intensity layer: running mean and covariance of sample
/// intensity.
pub const INTENSITY_LAYER: &str = "intensity";
/// Name of the traversal layer: accumulated distance travelled by rays
/// through each voxel.
pub const TRAVERSAL_LAYER: &str = "traversal";
/// Name of the hit/miss count layer.
pub const HIT_MISS_COUNT_LAYER: &str = "hit_miss_count";
/// Name of the touch time layer: most recent update time per voxel, in
/// milliseconds from the map time base.
pub const TOUCH_TIME_LAYER: &str = "touch_time";
/// Name of the semantic label layer. Contents are not interpreted by the
/// core.
pub const SEMANTIC_LAYER: &str = "semantic";

/// Occupancy value marking a voxel that has never been observed.
///
/// The sentinel sits outside every usable `[min_value, max_value]` interval
/// so that saturation clamping can never produce it.
#[inline]
pub fn unobserved_occupancy_value() -> f32 {
    -f32::MAX
}

fn add_if_absent<'a>(
    layout: &'a mut MapLayout,
    name: &str,
    subsampling: u16,
    populate: impl FnOnce(&mut MapLayer),
) -> &'a MapLayer {
    if let Some(index) = layout.layer_index(name) {
        return layout.layer(index);
    }
    let index = layout.layer_count();
    populate(layout.add_layer(name, subsampling));
    layout.layer(index)
}

/// Ensure `layout` has the occupancy layer, cleared to the unobserved
/// sentinel.
pub fn add_occupancy(layout: &mut MapLayout) -> &MapLayer {
    add_if_absent(layout, OCCUPANCY_LAYER, 0, |layer| {
        layer.voxel_layout_mut().add_member(
            OCCUPANCY_LAYER,
            DataType::F32,
            clear_from_f32(unobserved_occupancy_value()),
        );
    })
}

/// Ensure `layout` has the voxel mean layer (packed coordinate + count).
pub fn add_voxel_mean(layout: &mut MapLayout) -> &MapLayer {
    add_if_absent(layout, MEAN_LAYER, 0, |layer| {
        let voxel = layer.voxel_layout_mut();
        voxel.add_member("coord", DataType::U32, 0);
        voxel.add_member("count", DataType::U32, 0);
    })
}

/// Ensure `layout` has the covariance layer (upper triangular, six `f32`
/// members cleared to zero).
pub fn add_covariance(layout: &mut MapLayout) -> &MapLayer {
    add_if_absent(layout, COVARIANCE_LAYER, 0, |layer| {
        let voxel = layer.voxel_layout_mut();
        for name in ["xx", "xy", "yy", "xz", "yz", "zz"] {
            voxel.add_member(name, DataType::F32, 0);
        }
    })
}

/// Ensure `layout` has the clearance layer, cleared to -1 (no data).
pub fn add_clearance(layout: &mut MapLayout) -> &MapLayer {
    add_if_absent(layout, CLEARANCE_LAYER, 0, |layer| {
        layer
            .voxel_layout_mut()
            .add_member(CLEARANCE_LAYER, DataType::F32, clear_from_f32(-1.0));
    })
}

/// Ensure `layout` has the intensity layer (running mean and covariance).
pub fn add_intensity(layout: &mut MapLayout) -> &MapLayer {
    add_if_absent(layout, INTENSITY_LAYER, 0, |layer| {
        let voxel = layer.voxel_layout_mut();
        voxel.add_member("mean", DataType::F32, 0);
        voxel.add_member("cov", DataType::F32, 0);
    })
}

/// Ensure `layout` has the traversal layer, cleared to zero distance.
pub fn add_traversal(layout: &mut MapLayout) -> &MapLayer {
    add_if_absent(layout, TRAVERSAL_LAYER, 0, |layer| {
        layer
            .voxel_layout_mut()
            .add_member(TRAVERSAL_LAYER, DataType::F32, 0);
    })
}

/// Ensure `layout` has the hit/miss count layer.
pub fn add_hit_miss_count(layout: &mut MapLayout) -> &MapLayer {
    add_if_absent(layout, HIT_MISS_COUNT_LAYER, 0, |layer| {
        let voxel = layer.voxel_layout_mut();
        voxel.add_member("hit_count", DataType::U32, 0);
        voxel.add_member("miss_count", DataType::U32, 0);
    })
}

/// Ensure `layout` has the touch time layer.
pub fn add_touch_time(layout: &mut MapLayout) -> &MapLayer {
    add_if_absent(layout, TOUCH_TIME_LAYER, 0, |layer| {
        layer
            .voxel_layout_mut()
            .add_member(TOUCH_TIME_LAYER, DataType::U32, 0);
    })
}

/// Ensure `layout` has the semantic label layer.
pub fn add_semantic(layout: &mut MapLayout) -> &MapLayer {
    add_if_absent(layout, SEMANTIC_LAYER, 0, |layer| {
        let voxel = layer.voxel_layout_mut();
        voxel.add_member("label", DataType::U32, 0);
        voxel.add_member("probability", DataType::F32, 0);
    })
}

//! The occupancy map.
//!
//! An [`OccupancyMap`] owns the layer schema, the chunked region storage,
//! the map geometry (origin, resolution, region dimensions) and the
//! probability parameters of the log-odds update. Chunks are created lazily
//! on first write to a region and destroyed by explicit removal, expiry or
//! map teardown.
//!
//! # Log-Odds Representation
//!
//! ```text
//! P(occupied) = 1 / (1 + exp(-value))
//!
//! value = ln(P(occupied) / P(free))
//!
//! Update: value_new = clamp(value_old + observation, min_value, max_value)
//! ```
//!
//! A voxel that has never been observed stores the sentinel
//! [`unobserved_occupancy_value`], which sits outside every usable
//! saturation interval.

use serde::{Deserialize, Serialize};

use crate::core::{Key, KeyList, Point3, RegionKey, RegionSize};
use crate::error::{Error, Result};
use crate::integrator::{self, RayFlags};
use crate::layout::default_layers::{self, unobserved_occupancy_value};
use crate::layout::MapLayout;
use crate::raycast::{self, WalkContext};

use super::chunk::MapChunk;
use super::region_index::RegionIndex;
use super::voxel::{Voxel, VoxelMut};

/// Classification of a voxel's occupancy value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    /// Value at or above the occupancy threshold.
    Occupied,
    /// Observed value below the occupancy threshold.
    Free,
    /// Unobserved, or outside the usable value interval.
    Unknown,
}

/// Convert a probability in `(0, 1)` to a log-odds value.
#[inline]
pub fn probability_to_value(probability: f32) -> f32 {
    (probability / (1.0 - probability)).ln()
}

/// Convert a log-odds value back to a probability.
#[inline]
pub fn value_to_probability(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

/// Apply one log-odds observation to a stored value.
///
/// The unobserved sentinel acts as the 0.5-probability prior (log-odds 0);
/// the result always saturates into `[min_value, max_value]`.
#[inline]
pub(crate) fn update_occupancy_value(current: f32, delta: f32, min_value: f32, max_value: f32) -> f32 {
    let base = if current == unobserved_occupancy_value() {
        0.0
    } else {
        current
    };
    (base + delta).clamp(min_value, max_value)
}

/// Construction parameters for an [`OccupancyMap`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OccupancyConfig {
    /// Voxel edge length in metres. Must be positive.
    pub resolution: f64,
    /// Voxels per region, per axis.
    pub region_dim: RegionSize,
    /// World-space origin of voxel (0,0,0;0,0,0).
    pub origin: Point3,
    /// Probability applied by a hit observation. Must be in `(0.5, 1)`.
    pub hit_probability: f32,
    /// Probability applied by a miss observation. Must be in `(0, 0.5)`.
    pub miss_probability: f32,
    /// Saturation lower bound (log-odds).
    pub min_value: f32,
    /// Saturation upper bound (log-odds).
    pub max_value: f32,
    /// Probability at or above which a voxel classifies as occupied. Must
    /// be in `[0, 1)`.
    pub occupancy_threshold_probability: f32,
}

impl Default for OccupancyConfig {
    fn default() -> Self {
        Self {
            resolution: 0.1,
            region_dim: RegionSize::cubic(32),
            origin: Point3::ZERO,
            hit_probability: 0.7,
            miss_probability: 0.4,
            min_value: -2.0,
            max_value: 3.28,
            occupancy_threshold_probability: 0.5,
        }
    }
}

/// Chunked probabilistic 3-D occupancy map.
#[derive(Debug)]
pub struct OccupancyMap {
    origin: Point3,
    resolution: f64,
    region_dim: RegionSize,
    /// World-space extents of one region.
    region_spatial_dim: Point3,

    hit_value: f32,
    miss_value: f32,
    min_value: f32,
    max_value: f32,
    occupancy_threshold_value: f32,
    occupancy_threshold_probability: f32,

    layout: MapLayout,
    regions: RegionIndex,

    /// Caller-advanced map time in seconds, stamped onto chunks on
    /// creation and touch.
    time: f64,
    /// Monotonic modification stamp.
    stamp: u64,
}

impl OccupancyMap {
    /// Create a map with the default layout (occupancy layer only) and
    /// default probability parameters.
    pub fn new(resolution: f64, region_dim: RegionSize) -> Result<Self> {
        Self::with_config(OccupancyConfig {
            resolution,
            region_dim,
            ..OccupancyConfig::default()
        })
    }

    /// Create a map from a full configuration.
    pub fn with_config(config: OccupancyConfig) -> Result<Self> {
        if !(config.resolution > 0.0) {
            return Err(Error::BadArgument(format!(
                "resolution must be positive, got {}",
                config.resolution
            )));
        }
        if config.region_dim.voxel_count() == 0 {
            return Err(Error::BadArgument("region dimensions must be non-zero".into()));
        }
        if !(config.hit_probability > 0.5 && config.hit_probability < 1.0) {
            return Err(Error::BadArgument(format!(
                "hit probability must be in (0.5, 1), got {}",
                config.hit_probability
            )));
        }
        if !(config.miss_probability > 0.0 && config.miss_probability < 0.5) {
            return Err(Error::BadArgument(format!(
                "miss probability must be in (0, 0.5), got {}",
                config.miss_probability
            )));
        }
        if !(config.occupancy_threshold_probability >= 0.0
            && config.occupancy_threshold_probability < 1.0)
        {
            return Err(Error::BadArgument(format!(
                "occupancy threshold probability must be in [0, 1), got {}",
                config.occupancy_threshold_probability
            )));
        }

        let mut layout = MapLayout::new();
        default_layers::add_occupancy(&mut layout);

        let region_dim = config.region_dim;
        Ok(Self {
            origin: config.origin,
            resolution: config.resolution,
            region_dim,
            region_spatial_dim: Point3::new(
                region_dim.x as f64 * config.resolution,
                region_dim.y as f64 * config.resolution,
                region_dim.z as f64 * config.resolution,
            ),
            hit_value: probability_to_value(config.hit_probability),
            miss_value: probability_to_value(config.miss_probability),
            min_value: config.min_value,
            max_value: config.max_value,
            occupancy_threshold_value: probability_to_value(
                config.occupancy_threshold_probability,
            ),
            occupancy_threshold_probability: config.occupancy_threshold_probability,
            layout,
            regions: RegionIndex::new(),
            time: 0.0,
            stamp: 0,
        })
    }

    // === Geometry ===

    /// World-space origin of the map.
    #[inline]
    pub fn origin(&self) -> Point3 {
        self.origin
    }

    /// Voxel edge length in metres.
    #[inline]
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Voxels per region, per axis.
    #[inline]
    pub fn region_dim(&self) -> RegionSize {
        self.region_dim
    }

    /// World-space extents of one region.
    #[inline]
    pub fn region_spatial_dim(&self) -> Point3 {
        self.region_spatial_dim
    }

    /// Walker geometry for this map.
    #[inline]
    pub fn walk_context(&self) -> WalkContext {
        WalkContext {
            origin: self.origin,
            resolution: self.resolution,
            region_dim: self.region_dim,
        }
    }

    /// The key of the voxel whose half-open cell
    /// `[origin, origin + resolution)^3` contains `p`.
    pub fn voxel_key(&self, p: Point3) -> Key {
        let rel = p - self.origin;
        let voxel = [
            (rel.x / self.resolution).floor() as i64,
            (rel.y / self.resolution).floor() as i64,
            (rel.z / self.resolution).floor() as i64,
        ];
        raycast::voxel_to_key(voxel, self.region_dim)
    }

    /// World-space centre of the addressed voxel.
    pub fn voxel_centre_global(&self, key: Key) -> Point3 {
        self.origin + self.voxel_centre_local(key)
    }

    /// Centre of the addressed voxel relative to the map origin.
    pub fn voxel_centre_local(&self, key: Key) -> Point3 {
        Point3::new(
            (key.global_axis(0, self.region_dim) as f64 + 0.5) * self.resolution,
            (key.global_axis(1, self.region_dim) as f64 + 0.5) * self.resolution,
            (key.global_axis(2, self.region_dim) as f64 + 0.5) * self.resolution,
        )
    }

    /// World-space origin (minimum corner) of a region.
    pub fn region_origin(&self, region: RegionKey) -> Point3 {
        self.origin
            + Point3::new(
                region.x as f64 * self.region_spatial_dim.x,
                region.y as f64 * self.region_spatial_dim.y,
                region.z as f64 * self.region_spatial_dim.z,
            )
    }

    /// World-space centre of a region.
    pub fn region_centre(&self, region: RegionKey) -> Point3 {
        self.region_origin(region) + self.region_spatial_dim * 0.5
    }

    // === Layout ===

    /// The layer schema.
    #[inline]
    pub fn layout(&self) -> &MapLayout {
        &self.layout
    }

    /// Replace the layer schema. Fails once the map holds chunks.
    pub fn set_layout(&mut self, layout: MapLayout) -> Result<()> {
        if !self.regions.is_empty() {
            return Err(Error::BadArgument(
                "layout is fixed once the map has chunks".into(),
            ));
        }
        self.layout = layout;
        Ok(())
    }

    /// Remove all layers except the named ones, from the layout and from
    /// every chunk. Preserved layers keep their byte content.
    pub fn filter_layers(&mut self, preserve: &[&str]) -> Result<()> {
        for name in preserve {
            if self.layout.layer_index(name).is_none() {
                return Err(Error::NoSuchLayer((*name).to_string()));
            }
        }
        let mapping = self.layout.filter_layers(preserve);
        for chunk in self.regions.iter_mut() {
            chunk.filter_layers(&mapping);
        }
        self.stamp += 1;
        Ok(())
    }

    /// Index of the occupancy layer.
    pub fn occupancy_layer(&self) -> Result<usize> {
        self.layout
            .occupancy_layer()
            .ok_or_else(|| Error::NoSuchLayer(default_layers::OCCUPANCY_LAYER.into()))
    }

    // === Probability parameters ===

    /// Log-odds value applied by a hit.
    #[inline]
    pub fn hit_value(&self) -> f32 {
        self.hit_value
    }

    /// Log-odds value applied by a miss.
    #[inline]
    pub fn miss_value(&self) -> f32 {
        self.miss_value
    }

    /// Saturation lower bound.
    #[inline]
    pub fn min_value(&self) -> f32 {
        self.min_value
    }

    /// Saturation upper bound.
    #[inline]
    pub fn max_value(&self) -> f32 {
        self.max_value
    }

    /// Occupancy threshold as a log-odds value.
    #[inline]
    pub fn occupancy_threshold_value(&self) -> f32 {
        self.occupancy_threshold_value
    }

    /// Occupancy threshold as a probability.
    #[inline]
    pub fn occupancy_threshold_probability(&self) -> f32 {
        self.occupancy_threshold_probability
    }

    /// Set the occupancy threshold from a probability in `[0, 1)`.
    pub fn set_occupancy_threshold_probability(&mut self, probability: f32) -> Result<()> {
        if !(probability >= 0.0 && probability < 1.0) {
            return Err(Error::BadArgument(format!(
                "occupancy threshold probability must be in [0, 1), got {}",
                probability
            )));
        }
        self.occupancy_threshold_probability = probability;
        self.occupancy_threshold_value = probability_to_value(probability);
        Ok(())
    }

    /// Set the hit probability, in `(0.5, 1)`.
    pub fn set_hit_probability(&mut self, probability: f32) -> Result<()> {
        if !(probability > 0.5 && probability < 1.0) {
            return Err(Error::BadArgument(format!(
                "hit probability must be in (0.5, 1), got {}",
                probability
            )));
        }
        self.hit_value = probability_to_value(probability);
        Ok(())
    }

    /// Set the miss probability, in `(0, 0.5)`.
    pub fn set_miss_probability(&mut self, probability: f32) -> Result<()> {
        if !(probability > 0.0 && probability < 0.5) {
            return Err(Error::BadArgument(format!(
                "miss probability must be in (0, 0.5), got {}",
                probability
            )));
        }
        self.miss_value = probability_to_value(probability);
        Ok(())
    }

    /// Restore exact log-odds parameters from serialised state, bypassing
    /// the probability round trip.
    pub(crate) fn restore_value_parameters(
        &mut self,
        hit_value: f32,
        miss_value: f32,
        min_value: f32,
        max_value: f32,
        threshold_value: f32,
    ) {
        self.hit_value = hit_value;
        self.miss_value = miss_value;
        self.min_value = min_value;
        self.max_value = max_value;
        self.occupancy_threshold_value = threshold_value;
        self.occupancy_threshold_probability = value_to_probability(threshold_value);
    }

    // === Time ===

    /// Current map time in seconds.
    #[inline]
    pub fn timestamp(&self) -> f64 {
        self.time
    }

    /// Advance the map time. Chunk creation and touch stamps sample this
    /// value; the map never reads wall clocks itself.
    pub fn set_timestamp(&mut self, time: f64) {
        self.time = time;
    }

    /// Monotonic modification stamp, incremented on every mutation.
    #[inline]
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    // === Region and voxel access ===

    /// Number of resident chunks.
    #[inline]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// The chunk for a region key, if resident.
    pub fn region(&self, region: RegionKey) -> Option<&MapChunk> {
        self.regions.get(region)
    }

    /// The chunk for a region key, mutably, creating it when `create` is
    /// set.
    pub fn region_mut(&mut self, region: RegionKey, create: bool) -> Result<Option<&mut MapChunk>> {
        if self.regions.get(region).is_none() {
            if !create {
                return Ok(None);
            }
            let chunk = MapChunk::new(
                region,
                self.region_origin(region),
                &self.layout,
                self.region_dim,
                self.time,
            )?;
            self.regions.insert(chunk);
            self.stamp += 1;
        }
        Ok(self.regions.get_mut(region))
    }

    /// Iterate resident chunks in unspecified order.
    pub fn chunks(&self) -> impl Iterator<Item = &MapChunk> {
        self.regions.iter()
    }

    /// Iterate resident chunks mutably in unspecified order.
    pub fn chunks_mut(&mut self) -> impl Iterator<Item = &mut MapChunk> {
        self.regions.iter_mut()
    }

    /// Read-only handle to the addressed voxel. The handle is invalid
    /// (reads as unobserved) when the key is null or the chunk is absent.
    pub fn voxel(&self, key: Key) -> Voxel<'_> {
        let chunk = if key.is_null() {
            None
        } else {
            self.regions.get(key.region())
        };
        Voxel {
            key,
            chunk,
            layout: &self.layout,
            region_dim: self.region_dim,
        }
    }

    /// Mutable handle to the addressed voxel. Returns `Ok(None)` when the
    /// chunk is absent and `create` is unset, or when the key is null.
    pub fn voxel_mut(&mut self, key: Key, create: bool) -> Result<Option<VoxelMut<'_>>> {
        if key.is_null() {
            return Ok(None);
        }
        let time = self.time;
        if self.regions.get(key.region()).is_none() {
            if !create {
                return Ok(None);
            }
            let chunk = MapChunk::new(
                key.region(),
                self.region_origin(key.region()),
                &self.layout,
                self.region_dim,
                time,
            )?;
            self.regions.insert(chunk);
        }
        self.stamp += 1;
        let region_dim = self.region_dim;
        let Some(chunk) = self.regions.get_mut(key.region()) else {
            return Ok(None);
        };
        Ok(Some(VoxelMut {
            key,
            chunk,
            layout: &self.layout,
            region_dim,
            time,
        }))
    }

    /// Occupancy value at a key; the unobserved sentinel when the voxel or
    /// chunk is absent.
    pub fn occupancy(&self, key: Key) -> f32 {
        self.voxel(key).occupancy()
    }

    /// Classify an occupancy value against the threshold.
    pub fn occupancy_type(&self, value: f32) -> Occupancy {
        if !(self.min_value..=self.max_value).contains(&value) {
            Occupancy::Unknown
        } else if value >= self.occupancy_threshold_value {
            Occupancy::Occupied
        } else {
            Occupancy::Free
        }
    }

    /// True when the addressed voxel is observed and at or above the
    /// occupancy threshold.
    pub fn is_occupied(&self, key: Key) -> bool {
        self.occupancy_type(self.occupancy(key)) == Occupancy::Occupied
    }

    // === Integration ===

    /// Apply a hit observation to the addressed voxel, creating its chunk
    /// if needed.
    pub fn integrate_hit(&mut self, key: Key) -> Result<()> {
        let delta = self.hit_value;
        self.integrate_value(key, delta)
    }

    /// Apply a miss observation to the addressed voxel, creating its chunk
    /// if needed.
    pub fn integrate_miss(&mut self, key: Key) -> Result<()> {
        let delta = self.miss_value;
        self.integrate_value(key, delta)
    }

    fn integrate_value(&mut self, key: Key, delta: f32) -> Result<()> {
        let (min_value, max_value) = (self.min_value, self.max_value);
        let Some(mut voxel) = self.voxel_mut(key, true)? else {
            return Err(Error::BadArgument("null key".into()));
        };
        let current = voxel.occupancy();
        voxel.set_occupancy(update_occupancy_value(current, delta, min_value, max_value));
        Ok(())
    }

    /// Compute the ordered keys of every voxel crossed by the segment
    /// `from -> to`, appending to `out`. Returns the number of keys
    /// appended. See [`raycast::walk_segment_keys`] for the traversal
    /// rules.
    pub fn calculate_segment_keys(
        &self,
        out: &mut KeyList,
        from: Point3,
        to: Point3,
        include_end_point: bool,
    ) -> usize {
        raycast::walk_segment_keys(out, from, to, include_end_point, &self.walk_context())
    }

    /// Integrate rays on the host: each consecutive pair of points is a
    /// (sensor origin, sample) ray. Returns the number of rays applied.
    pub fn integrate_rays(&mut self, rays: &[Point3], flags: RayFlags) -> Result<usize> {
        integrator::integrate_rays(self, rays, flags, None)
    }

    /// As [`integrate_rays`](Self::integrate_rays), checking `abort`
    /// between rays and stopping early when it is set.
    pub fn integrate_rays_with_abort(
        &mut self,
        rays: &[Point3],
        flags: RayFlags,
        abort: &std::sync::atomic::AtomicBool,
    ) -> Result<usize> {
        integrator::integrate_rays(self, rays, flags, Some(abort))
    }

    // === Region lifecycle ===

    /// Remove every chunk whose centre lies strictly beyond `distance`
    /// metres from `from`. Returns the number of chunks removed.
    pub fn remove_distance_regions(&mut self, from: Point3, distance: f64) -> Result<usize> {
        if distance < 0.0 {
            return Err(Error::BadArgument(format!(
                "cull distance must be non-negative, got {}",
                distance
            )));
        }
        let origin = self.origin;
        let spatial = self.region_spatial_dim;
        let removed = self.regions.remove_where(|chunk| {
            let centre = Point3::new(
                origin.x + chunk.region_key().x as f64 * spatial.x + spatial.x * 0.5,
                origin.y + chunk.region_key().y as f64 * spatial.y + spatial.y * 0.5,
                origin.z + chunk.region_key().z as f64 * spatial.z + spatial.z * 0.5,
            );
            centre.distance(&from) > distance
        });
        if !removed.is_empty() {
            self.stamp += 1;
        }
        Ok(removed.len())
    }

    /// Remove every chunk whose touched timestamp is strictly before
    /// `time`. Returns the number of chunks removed.
    pub fn expire_regions(&mut self, time: f64) -> usize {
        let removed = self
            .regions
            .remove_where(|chunk| chunk.touched_time() < time);
        if !removed.is_empty() {
            self.stamp += 1;
        }
        removed.len()
    }

    /// Remove a single region's chunk. Returns true when a chunk was
    /// removed.
    pub fn remove_region(&mut self, region: RegionKey) -> bool {
        let removed = self.regions.remove(region).is_some();
        if removed {
            self.stamp += 1;
        }
        removed
    }

    /// Iterate every voxel of every resident chunk, yielding the voxel key
    /// and occupancy value.
    ///
    /// Iteration is chunk-by-chunk in unspecified chunk order, then linear
    /// voxel index within a chunk. The region key of the yielded voxel is
    /// stable information callers may use for grouping; no cross-chunk
    /// ordering is promised.
    pub fn iter(&self) -> OccupancyIter<'_> {
        OccupancyIter::new(self)
    }
}

/// Iterator over all voxels of all resident chunks.
pub struct OccupancyIter<'a> {
    chunks: Vec<&'a MapChunk>,
    region_dim: RegionSize,
    occupancy_layer: Option<usize>,
    voxel_size: usize,
    chunk_index: usize,
    voxel_index: usize,
}

impl<'a> OccupancyIter<'a> {
    fn new(map: &'a OccupancyMap) -> Self {
        let occupancy_layer = map.layout.occupancy_layer();
        let voxel_size = occupancy_layer
            .map(|layer| map.layout.layer(layer).voxel_layout().voxel_byte_size())
            .unwrap_or(0);
        Self {
            chunks: map.chunks().collect(),
            region_dim: map.region_dim,
            occupancy_layer,
            voxel_size,
            chunk_index: 0,
            voxel_index: 0,
        }
    }
}

impl<'a> Iterator for OccupancyIter<'a> {
    type Item = (Key, f32);

    fn next(&mut self) -> Option<Self::Item> {
        let layer = self.occupancy_layer?;
        loop {
            let chunk = self.chunks.get(self.chunk_index)?;
            if self.voxel_index >= self.region_dim.voxel_count() {
                self.chunk_index += 1;
                self.voxel_index = 0;
                continue;
            }

            let index = self.voxel_index;
            self.voxel_index += 1;

            let dim = self.region_dim;
            let x = (index % dim.x as usize) as u8;
            let y = ((index / dim.x as usize) % dim.y as usize) as u8;
            let z = (index / (dim.x as usize * dim.y as usize)) as u8;
            let key = Key::new(chunk.region_key(), x, y, z);

            let bytes = chunk.layer_bytes(layer);
            let at = index * self.voxel_size;
            let value = f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
            return Some((key, value));
        }
    }
}

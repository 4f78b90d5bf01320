//! Double-buffered batch integrator.
//!
//! A [`GpuMap`] wraps an [`OccupancyMap`] and ships ray batches to a
//! [`Device`]. Two staging sets overlap host preparation with device
//! execution: while one batch's kernel runs, the next batch is assembled
//! and uploaded into the other set. Touched regions are made resident
//! through per-layer [`LayerCache`]s; on [`GpuMap::sync_occupancy`] every
//! dirty slot is downloaded back into its host chunk and the chunk is
//! marked dirty per affected layer.
//!
//! Without a device, synchronous integration falls back to the host
//! updater (warned once per map); asynchronous integration reports
//! [`Error::DeviceUnavailable`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{Point3, RegionKey};
use crate::error::{Error, Result};
use crate::integrator::{self, RayFlags};
use crate::layout::default_layers;
use crate::map::OccupancyMap;
use crate::raycast::walk_segment_regions;

use super::cache::LayerCache;
use super::device::{BufferId, Device, Event, Kernel, KernelArgs};
use super::kernel::{self, KernelParams};

/// Construction parameters for a [`GpuMap`].
#[derive(Clone, Debug)]
pub struct GpuMapConfig {
    /// Expected rays per batch, used to size the staging buffers.
    pub batch_size: usize,
    /// Device cache slots per layer. Bounds device memory at
    /// `slots * layer_byte_size` per cached layer.
    pub cache_slots: usize,
    /// Enable the NDT variant: mean, covariance and hit/miss count layers
    /// are cached and updated by a second serialized sample pass.
    pub ndt: bool,
    /// Expected sensor range noise in metres, forwarded to NDT kernels.
    pub sensor_noise: f32,
}

impl Default for GpuMapConfig {
    fn default() -> Self {
        Self {
            batch_size: 2048,
            cache_slots: 512,
            ndt: false,
            sensor_noise: 0.05,
        }
    }
}

struct BatchSet {
    keys: BufferId,
    rays: BufferId,
    region_keys: BufferId,
    /// One offsets buffer per cached layer.
    offsets: Vec<BufferId>,
    /// Completion of this set's most recent update kernel.
    update_event: Option<Event>,
}

struct DevicePipeline {
    device: Arc<dyn Device>,
    /// Cached layers: occupancy first; NDT adds mean, covariance,
    /// hit/miss count in that order.
    caches: Vec<LayerCache>,
    sets: [BatchSet; 2],
    next_set: usize,
    batch_marker: u32,
    ndt: bool,
    sensor_noise: f32,
    // Per-batch staging, reused across batches.
    regions: Vec<RegionKey>,
    region_scratch: Vec<RegionKey>,
}

/// Batched device integrator over a borrowed [`OccupancyMap`].
pub struct GpuMap<'a> {
    map: &'a mut OccupancyMap,
    pipeline: Option<DevicePipeline>,
    warned_no_device: bool,
}

impl<'a> GpuMap<'a> {
    /// Wrap `map` for batched integration on `device`. Passing `None`
    /// creates a host-fallback integrator.
    ///
    /// In NDT mode the mean, covariance and hit/miss count layers must be
    /// present in the map layout; they are added automatically while the
    /// map has no chunks.
    pub fn new(
        map: &'a mut OccupancyMap,
        device: Option<Arc<dyn Device>>,
        config: GpuMapConfig,
    ) -> Result<GpuMap<'a>> {
        let Some(device) = device else {
            return Ok(GpuMap {
                map,
                pipeline: None,
                warned_no_device: false,
            });
        };

        if config.batch_size == 0 {
            return Err(Error::BadArgument("batch size must be non-zero".into()));
        }

        let mut layer_indices = vec![map.occupancy_layer()?];
        if config.ndt {
            let mut layout = map.layout().clone();
            let needs = [
                default_layers::MEAN_LAYER,
                default_layers::COVARIANCE_LAYER,
                default_layers::HIT_MISS_COUNT_LAYER,
            ];
            if needs.iter().any(|name| layout.layer_index(name).is_none()) {
                default_layers::add_voxel_mean(&mut layout);
                default_layers::add_covariance(&mut layout);
                default_layers::add_hit_miss_count(&mut layout);
                map.set_layout(layout)?;
            }
            for name in needs {
                layer_indices.push(
                    map.layout()
                        .layer_index(name)
                        .ok_or_else(|| Error::NoSuchLayer(name.into()))?,
                );
            }
        }

        let region_dim = map.region_dim();
        let mut caches = Vec::with_capacity(layer_indices.len());
        for layer_index in layer_indices {
            let slot_size = map.layout().layer(layer_index).layer_byte_size(region_dim);
            caches.push(LayerCache::new(
                device.clone(),
                layer_index,
                slot_size,
                config.cache_slots,
            )?);
        }

        let make_set = |device: &Arc<dyn Device>| -> Result<BatchSet> {
            Ok(BatchSet {
                keys: device.create_buffer(config.batch_size * 2 * kernel::GPU_KEY_BYTES)?,
                rays: device.create_buffer(config.batch_size * kernel::RAY_BYTES)?,
                region_keys: device.create_buffer(64 * kernel::REGION_KEY_BYTES)?,
                offsets: (0..caches.len())
                    .map(|_| device.create_buffer(64 * 8))
                    .collect::<Result<Vec<_>>>()?,
                update_event: None,
            })
        };
        let sets = [make_set(&device)?, make_set(&device)?];
        let batch_marker = caches[0].batch_marker();
        for cache in &caches[1..] {
            cache.begin_batch_with(batch_marker);
        }

        Ok(GpuMap {
            map,
            pipeline: Some(DevicePipeline {
                device,
                caches,
                sets,
                next_set: 0,
                batch_marker,
                ndt: config.ndt,
                sensor_noise: config.sensor_noise,
                regions: Vec::new(),
                region_scratch: Vec::new(),
            }),
            warned_no_device: false,
        })
    }

    /// True when a device backs this integrator.
    pub fn has_device(&self) -> bool {
        self.pipeline.is_some()
    }

    /// The wrapped map.
    pub fn map(&self) -> &OccupancyMap {
        self.map
    }

    /// Integrate rays, falling back to the host updater when no device is
    /// available. With a device the call returns once the batch is
    /// enqueued; results reach host chunks after
    /// [`sync_occupancy`](Self::sync_occupancy).
    ///
    /// Returns the number of rays accepted.
    pub fn integrate_rays(&mut self, rays: &[Point3], flags: RayFlags) -> Result<usize> {
        match &mut self.pipeline {
            Some(pipeline) => pipeline.enqueue_batch(self.map, rays, flags),
            None => {
                if !self.warned_no_device {
                    log::warn!("no compute device available; integrating rays on the host");
                    self.warned_no_device = true;
                }
                integrator::integrate_rays(self.map, rays, flags, None)
            }
        }
    }

    /// Integrate rays asynchronously. Unlike
    /// [`integrate_rays`](Self::integrate_rays) this fails with
    /// [`Error::DeviceUnavailable`] when no device is available.
    pub fn integrate_rays_async(&mut self, rays: &[Point3], flags: RayFlags) -> Result<usize> {
        match &mut self.pipeline {
            Some(pipeline) => pipeline.enqueue_batch(self.map, rays, flags),
            None => Err(Error::DeviceUnavailable),
        }
    }

    /// Wait for every in-flight batch, then download all dirty cache slots
    /// into their host chunks, marking each downloaded chunk layer dirty.
    pub fn sync_occupancy(&mut self) -> Result<()> {
        let Some(pipeline) = &mut self.pipeline else {
            return Ok(());
        };
        pipeline.sync(self.map)
    }

    /// Poll until all in-flight device work completes. `timeout_ms` of
    /// `None` waits without limit. Returns true when everything completed
    /// within the timeout.
    pub fn wait_async(&self, timeout_ms: Option<u64>) -> bool {
        let Some(pipeline) = &self.pipeline else {
            return true;
        };
        pipeline.wait_async(timeout_ms)
    }
}

impl DevicePipeline {
    fn enqueue_batch(
        &mut self,
        map: &mut OccupancyMap,
        rays: &[Point3],
        flags: RayFlags,
    ) -> Result<usize> {
        let ray_count = rays.len() / 2;
        if ray_count == 0 {
            return Ok(0);
        }

        // Reusing a staging set implies its previous kernel has finished;
        // wait before overwriting the buffers.
        if let Some(event) = self.sets[self.next_set].update_event.take() {
            event.wait();
        }

        // Resolve the touched regions with the coarse region walk.
        let context = map.walk_context();
        self.regions.clear();
        for ray in rays.chunks_exact(2) {
            self.region_scratch.clear();
            walk_segment_regions(&mut self.region_scratch, ray[0], ray[1], &context);
            for region in &self.region_scratch {
                if !self.regions.contains(region) {
                    self.regions.push(*region);
                }
            }
        }

        // Pin regions into the caches, recording per-layer slot offsets.
        let mut offsets: Vec<Vec<u8>> = vec![Vec::with_capacity(self.regions.len() * 8); self.caches.len()];
        for region in &self.regions {
            for (layer, cache) in self.caches.iter().enumerate() {
                let slot = cache.ensure_resident(map, *region)?;
                offsets[layer].extend_from_slice(&cache.slot_offset(slot).to_le_bytes());
            }
        }

        // Encode the staging buffers.
        let origin = map.origin();
        let mut keys_bytes = Vec::with_capacity(ray_count * 2 * kernel::GPU_KEY_BYTES);
        let mut rays_bytes = Vec::with_capacity(ray_count * kernel::RAY_BYTES);
        for ray in rays.chunks_exact(2) {
            kernel::encode_key(&map.voxel_key(ray[0]), &mut keys_bytes);
            kernel::encode_key(&map.voxel_key(ray[1]), &mut keys_bytes);
            for point in [ray[0], ray[1]] {
                for component in (point - origin).to_f32_array() {
                    rays_bytes.extend_from_slice(&component.to_le_bytes());
                }
            }
        }
        let mut region_bytes = Vec::with_capacity(self.regions.len() * kernel::REGION_KEY_BYTES);
        for region in &self.regions {
            kernel::encode_region_key(region, &mut region_bytes);
        }

        let set = &mut self.sets[self.next_set];
        let mut wait = vec![
            self.device.write_buffer(set.keys, 0, &keys_bytes)?,
            self.device.write_buffer(set.rays, 0, &rays_bytes)?,
            self.device.write_buffer(set.region_keys, 0, &region_bytes)?,
        ];
        for (layer, bytes) in offsets.iter().enumerate() {
            wait.push(self.device.write_buffer(set.offsets[layer], 0, bytes)?);
        }
        self.device.insert_barrier();

        // Cross-batch ordering: the other set's kernel may still reference
        // slots this batch reuses.
        if let Some(event) = &self.sets[1 - self.next_set].update_event {
            wait.push(event.clone());
        }

        let sample_included = !flags.contains(RayFlags::EXCLUDE_SAMPLE)
            && !flags.contains(RayFlags::END_POINT_AS_FREE);
        let miss_flags = if self.ndt && sample_included {
            flags | RayFlags::EXCLUDE_SAMPLE
        } else {
            flags
        };

        let set = &self.sets[self.next_set];
        let params = KernelParams {
            region_dim: map.region_dim(),
            resolution: map.resolution() as f32,
            miss_value: map.miss_value(),
            hit_value: map.hit_value(),
            occupied_threshold: map.occupancy_threshold_value(),
            min_value: map.min_value(),
            max_value: map.max_value(),
            flags: miss_flags.bits(),
            sensor_noise: self.sensor_noise,
            ray_count: ray_count as u32,
            region_count: self.regions.len() as u32,
            ndt: self.ndt,
        };
        let args = KernelArgs {
            voxel_buffers: self
                .caches
                .iter()
                .enumerate()
                .map(|(layer, cache)| (cache.buffer(), set.offsets[layer]))
                .collect(),
            region_keys: set.region_keys,
            keys: set.keys,
            rays: set.rays,
            params,
        };

        let miss_event = self
            .device
            .enqueue_kernel(Kernel::RegionUpdate, args.clone(), &wait)?;

        let update_event = if self.ndt && sample_included {
            self.device
                .enqueue_kernel(Kernel::NdtHit, args, &[miss_event])?
        } else {
            miss_event
        };

        // Stamp the touched slots with the kernel completion and start the
        // next batch.
        for cache in &self.caches {
            cache.update_events(self.batch_marker, update_event.clone());
        }
        self.batch_marker = self.caches[0].begin_batch();
        for cache in &self.caches[1..] {
            cache.begin_batch_with(self.batch_marker);
        }

        self.sets[self.next_set].update_event = Some(update_event);
        self.next_set = 1 - self.next_set;
        Ok(ray_count)
    }

    fn sync(&mut self, map: &mut OccupancyMap) -> Result<()> {
        for set in &mut self.sets {
            if let Some(event) = set.update_event.take() {
                event.wait();
            }
        }
        for cache in &self.caches {
            cache.flush(map, None)?;
        }
        Ok(())
    }

    fn wait_async(&self, timeout_ms: Option<u64>) -> bool {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        loop {
            let mut pending = false;
            for set in &self.sets {
                if let Some(event) = &set.update_event {
                    if !event.is_complete() {
                        pending = true;
                    }
                }
            }
            if !pending {
                for cache in &self.caches {
                    if !cache.pending_events().is_empty() {
                        pending = true;
                        break;
                    }
                }
            }
            if !pending {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            std::thread::sleep(Duration::from_micros(500));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RegionSize;
    use crate::gpu::device::HostDevice;
    use approx::assert_relative_eq;

    fn test_map(resolution: f64, region: u8) -> OccupancyMap {
        OccupancyMap::new(resolution, RegionSize::cubic(region)).unwrap()
    }

    #[test]
    fn test_fallback_without_device() {
        let mut map = test_map(0.25, 32);
        let mut gpu = GpuMap::new(&mut map, None, GpuMapConfig::default()).unwrap();
        assert!(!gpu.has_device());

        let rays = [Point3::new(0.1, 0.1, 0.1), Point3::new(1.1, 0.1, 0.1)];
        let applied = gpu.integrate_rays(&rays, RayFlags::NONE).unwrap();
        assert_eq!(applied, 1);

        assert!(matches!(
            gpu.integrate_rays_async(&rays, RayFlags::NONE),
            Err(Error::DeviceUnavailable)
        ));

        // Host path applied the hit immediately.
        let sample_key = map.voxel_key(Point3::new(1.1, 0.1, 0.1));
        assert!(map.is_occupied(sample_key));
    }

    #[test]
    fn test_device_batch_matches_host_single_ray() {
        let origin = Point3::new(0.3, 0.3, 0.3);
        let sample = Point3::new(1.1, 1.1, 1.1);

        let mut host_map = test_map(0.25, 32);
        host_map
            .integrate_rays(&[origin, sample], RayFlags::NONE)
            .unwrap();

        let mut device_map = test_map(0.25, 32);
        {
            let device = HostDevice::new().unwrap();
            let mut gpu =
                GpuMap::new(&mut device_map, Some(device), GpuMapConfig::default()).unwrap();
            gpu.integrate_rays(&[origin, sample], RayFlags::NONE).unwrap();
            gpu.sync_occupancy().unwrap();
        }

        for (key, value) in host_map.iter() {
            assert_relative_eq!(device_map.occupancy(key), value, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_sync_marks_chunks_dirty() {
        let mut map = test_map(0.25, 16);
        let device = HostDevice::new().unwrap();
        let mut gpu = GpuMap::new(&mut map, Some(device), GpuMapConfig::default()).unwrap();

        let rays = [Point3::new(-1.1, 0.1, 0.1), Point3::new(1.1, 0.1, 0.1)];
        gpu.integrate_rays(&rays, RayFlags::NONE).unwrap();
        gpu.sync_occupancy().unwrap();
        drop(gpu);

        let layer = map.layout().occupancy_layer().unwrap();
        assert!(map.region_count() >= 2);
        for chunk in map.chunks() {
            assert!(chunk.is_dirty(layer), "synced chunk must be marked dirty");
        }
    }

    #[test]
    fn test_wait_async_completes() {
        let mut map = test_map(0.25, 32);
        let device = HostDevice::new().unwrap();
        let mut gpu = GpuMap::new(&mut map, Some(device), GpuMapConfig::default()).unwrap();

        let rays = [Point3::new(0.1, 0.1, 0.1), Point3::new(2.1, 2.1, 0.1)];
        gpu.integrate_rays(&rays, RayFlags::NONE).unwrap();

        assert!(gpu.wait_async(Some(5000)));
        assert!(gpu.wait_async(None));
    }

    #[test]
    fn test_ndt_updates_sample_statistics() {
        let mut map = test_map(0.25, 16);
        let device = HostDevice::new().unwrap();
        let config = GpuMapConfig {
            ndt: true,
            ..GpuMapConfig::default()
        };
        let sample = Point3::new(1.1, 0.6, 0.35);
        {
            let mut gpu = GpuMap::new(&mut map, Some(device), config).unwrap();
            let rays = [
                Point3::new(0.1, 0.1, 0.1),
                sample,
                Point3::new(0.2, 0.1, 0.1),
                sample,
            ];
            gpu.integrate_rays(&rays, RayFlags::NONE).unwrap();
            gpu.sync_occupancy().unwrap();
        }

        let key = map.voxel_key(sample);
        assert!(map.is_occupied(key));

        let mean_layer = map.layout().mean_layer().unwrap();
        let voxel = map.voxel(key);
        let mean = crate::layout::VoxelMean::from_bytes(voxel.layer_bytes(mean_layer).unwrap());
        assert_eq!(mean.count, 2);

        let hit_miss_layer = map.layout().hit_miss_count_layer().unwrap();
        let counts =
            crate::layout::HitMissCount::from_bytes(voxel.layer_bytes(hit_miss_layer).unwrap());
        assert_eq!(counts.hit_count, 2);
    }

    #[test]
    fn test_many_batches_small_cache() {
        // More touched regions than cache slots forces eviction traffic;
        // results must still converge to the host values.
        let mut host_map = test_map(0.5, 8);
        let mut device_map = test_map(0.5, 8);

        let mut rays = Vec::new();
        for i in 0..40 {
            let x = i as f64;
            rays.push(Point3::new(x, 0.25, 0.25));
            rays.push(Point3::new(x + 0.9, 0.25, 0.25));
        }

        host_map.integrate_rays(&rays, RayFlags::NONE).unwrap();

        {
            let device = HostDevice::new().unwrap();
            let config = GpuMapConfig {
                cache_slots: 4,
                ..GpuMapConfig::default()
            };
            let mut gpu = GpuMap::new(&mut device_map, Some(device), config).unwrap();
            for batch in rays.chunks(8) {
                gpu.integrate_rays(batch, RayFlags::NONE).unwrap();
            }
            gpu.sync_occupancy().unwrap();
        }

        for (key, value) in host_map.iter() {
            assert_relative_eq!(device_map.occupancy(key), value, epsilon = 1e-4);
        }
    }
}

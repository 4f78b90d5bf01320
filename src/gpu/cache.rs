//! Bounded device mirror of chunk layer buffers.
//!
//! A [`LayerCache`] packs a fixed number of region-sized slots into one
//! device buffer for a single layer. Residency follows an upload/evict
//! protocol:
//!
//! - present slots are promoted to most-recently-used on access;
//! - absent regions evict the least-recently-used slot whose in-flight
//!   flag is clear, downloading it first when dirty;
//! - when every slot is referenced by an unfinished device operation the
//!   request fails with [`Error::CacheExhausted`].
//!
//! Slot lifecycle: `empty -> uploading -> clean -> dirty -> downloading ->
//! clean | empty`, with in-flight an orthogonal flag covering uploads,
//! downloads and any kernel referencing the slot. Batches stamp the slots
//! they touch with an odd cycling batch marker so kernel completion events
//! can be attached afterwards.
//!
//! The state tables live behind an internal mutex; the device buffer
//! itself is only touched through the device queue.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::RegionKey;
use crate::error::{Error, Result};
use crate::map::OccupancyMap;

use super::device::{BufferId, Device, Event};

#[derive(Debug, Default)]
struct Slot {
    region: Option<RegionKey>,
    dirty: bool,
    /// Marker of the batch that last touched the slot.
    batch_stamp: u32,
    /// Allocation generation, the LRU tiebreaker.
    generation: u64,
    /// Use counter value at the last touch; the LRU key.
    last_use: u64,
    upload_event: Option<Event>,
    /// Completion of the most recent kernel referencing the slot.
    sync_event: Option<Event>,
}

impl Slot {
    fn in_flight(&self) -> bool {
        let pending = |event: &Option<Event>| {
            event.as_ref().map(|e| !e.is_complete()).unwrap_or(false)
        };
        pending(&self.upload_event) || pending(&self.sync_event)
    }
}

struct CacheState {
    slots: Vec<Slot>,
    /// Spatial-hash index with collision chains: hash -> (region, slot).
    index: HashMap<u32, Vec<(RegionKey, usize)>>,
    use_counter: u64,
    generation_counter: u64,
    batch_marker: u32,
}

impl CacheState {
    fn find(&self, region: RegionKey) -> Option<usize> {
        self.index
            .get(&region.hash())?
            .iter()
            .find(|(key, _)| *key == region)
            .map(|(_, slot)| *slot)
    }

    fn unlink(&mut self, region: RegionKey) {
        if let Some(chain) = self.index.get_mut(&region.hash()) {
            chain.retain(|(key, _)| *key != region);
            if chain.is_empty() {
                self.index.remove(&region.hash());
            }
        }
    }

    fn link(&mut self, region: RegionKey, slot: usize) {
        self.index
            .entry(region.hash())
            .or_default()
            .push((region, slot));
    }

    /// Choose the eviction victim: strictly least-recently-used among
    /// non-in-flight slots, generation breaking ties (older first). Empty
    /// slots sort before all occupied ones through their zero use stamp.
    fn pick_victim(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.in_flight())
            .min_by_key(|(_, slot)| (slot.last_use, slot.generation))
            .map(|(index, _)| index)
    }
}

/// Device-resident cache of one layer's chunk buffers.
pub struct LayerCache {
    device: Arc<dyn Device>,
    layer_index: usize,
    slot_size: usize,
    buffer: BufferId,
    state: Mutex<CacheState>,
}

impl LayerCache {
    /// Create a cache of `slot_count` slots of `slot_size` bytes for the
    /// given layer.
    pub fn new(
        device: Arc<dyn Device>,
        layer_index: usize,
        slot_size: usize,
        slot_count: usize,
    ) -> Result<LayerCache> {
        if slot_count == 0 || slot_size == 0 {
            return Err(Error::BadArgument(
                "cache requires non-zero slot size and count".into(),
            ));
        }
        let buffer = device.create_buffer(slot_size * slot_count)?;
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, Slot::default);
        Ok(LayerCache {
            device,
            layer_index,
            slot_size,
            buffer,
            state: Mutex::new(CacheState {
                slots,
                index: HashMap::new(),
                use_counter: 0,
                generation_counter: 0,
                batch_marker: 1,
            }),
        })
    }

    /// Index of the layer this cache mirrors.
    #[inline]
    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    /// Bytes per slot.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Total slots.
    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// The packed device buffer holding all slots.
    #[inline]
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Byte offset of a slot within the device buffer.
    #[inline]
    pub fn slot_offset(&self, slot: usize) -> u64 {
        (slot * self.slot_size) as u64
    }

    /// Current batch marker.
    pub fn batch_marker(&self) -> u32 {
        self.state.lock().batch_marker
    }

    /// Rotate the batch marker, cycling odd values and skipping zero.
    /// Returns the new marker.
    pub fn begin_batch(&self) -> u32 {
        let mut state = self.state.lock();
        state.batch_marker = state.batch_marker.wrapping_add(2) | 1;
        state.batch_marker
    }

    /// Adopt a marker generated by another layer's cache so all caches of
    /// one batch stamp identically.
    pub fn begin_batch_with(&self, marker: u32) {
        self.state.lock().batch_marker = marker;
    }

    /// Make `region` resident, returning its slot index.
    ///
    /// A present region is promoted to most-recently-used. An absent one
    /// claims the eviction victim, downloading the victim's data into its
    /// host chunk when dirty, then uploads the region's host chunk
    /// (creating the chunk if needed). The slot is stamped with the
    /// current batch marker.
    pub fn ensure_resident(&self, map: &mut OccupancyMap, region: RegionKey) -> Result<usize> {
        let mut state = self.state.lock();
        state.use_counter += 1;
        let use_stamp = state.use_counter;
        let marker = state.batch_marker;

        if let Some(slot_index) = state.find(region) {
            let slot = &mut state.slots[slot_index];
            slot.last_use = use_stamp;
            slot.batch_stamp = marker;
            return Ok(slot_index);
        }

        let Some(victim) = state.pick_victim() else {
            return Err(Error::CacheExhausted);
        };

        // Retire the victim: downloads of dirty data precede reuse.
        if let Some(old_region) = state.slots[victim].region {
            if state.slots[victim].dirty {
                log::debug!(
                    "layer {} cache: evicting dirty region ({}, {}, {})",
                    self.layer_index,
                    old_region.x,
                    old_region.y,
                    old_region.z
                );
                self.download_slot(map, &mut state.slots[victim], old_region, victim)?;
            }
            state.unlink(old_region);
        }

        // Upload the new region from its host chunk.
        let chunk = map
            .region_mut(region, true)?
            .expect("chunk creation requested");
        let upload_event =
            self.device
                .write_buffer(self.buffer, victim * self.slot_size, chunk.layer_bytes(self.layer_index))?;

        state.generation_counter += 1;
        let generation = state.generation_counter;
        let slot = &mut state.slots[victim];
        slot.region = Some(region);
        slot.dirty = false;
        slot.batch_stamp = marker;
        slot.generation = generation;
        slot.last_use = use_stamp;
        slot.upload_event = Some(upload_event);
        slot.sync_event = None;
        state.link(region, victim);
        Ok(victim)
    }

    fn download_slot(
        &self,
        map: &mut OccupancyMap,
        slot: &mut Slot,
        region: RegionKey,
        slot_index: usize,
    ) -> Result<()> {
        if let Some(event) = &slot.sync_event {
            event.wait();
        }
        if let Some(event) = &slot.upload_event {
            event.wait();
        }
        let layer = self.layer_index;
        if let Some(chunk) = map.region_mut(region, false)? {
            self.device.read_buffer(
                self.buffer,
                slot_index * self.slot_size,
                chunk.layer_bytes_mut(layer),
            )?;
            chunk.mark_dirty(layer);
        }
        slot.dirty = false;
        Ok(())
    }

    /// Mark a slot's device copy newer than the host copy.
    pub fn mark_dirty(&self, slot: usize) {
        self.state.lock().slots[slot].dirty = true;
    }

    /// Associate a kernel completion event with every slot stamped by
    /// `marker`, marking those slots dirty.
    pub fn update_events(&self, marker: u32, event: Event) {
        let mut state = self.state.lock();
        for slot in &mut state.slots {
            if slot.region.is_some() && slot.batch_stamp == marker {
                slot.sync_event = Some(event.clone());
                slot.dirty = true;
            }
        }
    }

    /// Download the named dirty slots (all dirty slots when `regions` is
    /// `None`) into their host chunks, waiting for completion. Returns the
    /// number of slots downloaded.
    pub fn flush(&self, map: &mut OccupancyMap, regions: Option<&[RegionKey]>) -> Result<usize> {
        let mut state = self.state.lock();
        let mut flushed = 0;
        for slot_index in 0..state.slots.len() {
            let slot = &state.slots[slot_index];
            let Some(region) = slot.region else {
                continue;
            };
            if !slot.dirty {
                continue;
            }
            if let Some(filter) = regions {
                if !filter.contains(&region) {
                    continue;
                }
            }
            self.download_slot(map, &mut state.slots[slot_index], region, slot_index)?;
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Drop a region's slot, discarding its device contents. Reuse of the
    /// slot still defers on any outstanding events.
    pub fn invalidate(&self, region: RegionKey) {
        let mut state = self.state.lock();
        if let Some(slot_index) = state.find(region) {
            state.unlink(region);
            let slot = &mut state.slots[slot_index];
            slot.region = None;
            slot.dirty = false;
            slot.last_use = 0;
            slot.batch_stamp = 0;
        }
    }

    /// Outstanding events of every resident slot, for sync waits.
    pub fn pending_events(&self) -> Vec<Event> {
        let state = self.state.lock();
        let mut events = Vec::new();
        for slot in &state.slots {
            for event in [&slot.upload_event, &slot.sync_event].into_iter().flatten() {
                if !event.is_complete() {
                    events.push(event.clone());
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RegionSize;
    use crate::gpu::device::HostDevice;

    fn test_map() -> OccupancyMap {
        OccupancyMap::new(0.25, RegionSize::cubic(8)).unwrap()
    }

    fn test_cache(map: &OccupancyMap, slots: usize) -> LayerCache {
        let device = HostDevice::new().unwrap();
        let layer = map.layout().occupancy_layer().unwrap();
        let slot_size = map
            .layout()
            .layer(layer)
            .layer_byte_size(map.region_dim());
        LayerCache::new(device, layer, slot_size, slots).unwrap()
    }

    #[test]
    fn test_resident_slot_is_stable() {
        let mut map = test_map();
        let cache = test_cache(&map, 4);

        let a = cache.ensure_resident(&mut map, RegionKey::new(0, 0, 0)).unwrap();
        let b = cache.ensure_resident(&mut map, RegionKey::new(1, 0, 0)).unwrap();
        assert_ne!(a, b);

        // Repeat lookups return the same slots.
        assert_eq!(
            cache.ensure_resident(&mut map, RegionKey::new(0, 0, 0)).unwrap(),
            a
        );
        assert_eq!(
            cache.ensure_resident(&mut map, RegionKey::new(1, 0, 0)).unwrap(),
            b
        );
        assert_eq!(map.region_count(), 2);
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut map = test_map();
        let cache = test_cache(&map, 2);

        let a = cache.ensure_resident(&mut map, RegionKey::new(0, 0, 0)).unwrap();
        let b = cache.ensure_resident(&mut map, RegionKey::new(1, 0, 0)).unwrap();

        // Touch region A so region B becomes the LRU tail.
        cache.ensure_resident(&mut map, RegionKey::new(0, 0, 0)).unwrap();

        let c = cache.ensure_resident(&mut map, RegionKey::new(2, 0, 0)).unwrap();
        assert_eq!(c, b, "least recently used slot must be reused");

        // A is still resident in its original slot.
        assert_eq!(
            cache.ensure_resident(&mut map, RegionKey::new(0, 0, 0)).unwrap(),
            a
        );
    }

    #[test]
    fn test_cache_exhausted_when_all_in_flight() {
        let mut map = test_map();
        let cache = test_cache(&map, 2);

        let a = cache.ensure_resident(&mut map, RegionKey::new(0, 0, 0)).unwrap();
        let b = cache.ensure_resident(&mut map, RegionKey::new(1, 0, 0)).unwrap();

        // Attach incomplete kernel events to both slots.
        let marker = cache.batch_marker();
        let pending = Event::new();
        cache.update_events(marker, pending.clone());
        let _ = (a, b);

        let result = cache.ensure_resident(&mut map, RegionKey::new(2, 0, 0));
        assert!(matches!(result, Err(Error::CacheExhausted)));

        // Completion clears the in-flight state and the request succeeds.
        pending.mark_complete();
        assert!(cache.ensure_resident(&mut map, RegionKey::new(2, 0, 0)).is_ok());
    }

    #[test]
    fn test_dirty_eviction_downloads_to_host() {
        let mut map = test_map();
        let cache = test_cache(&map, 1);
        let layer = cache.layer_index();

        let slot = cache.ensure_resident(&mut map, RegionKey::new(0, 0, 0)).unwrap();

        // Scribble on the device copy, then mark the slot dirty.
        let pattern = vec![0x42u8; cache.slot_size()];
        let device = cache.device.clone();
        device
            .write_buffer(cache.buffer(), cache.slot_offset(slot) as usize, &pattern)
            .unwrap()
            .wait();
        cache.mark_dirty(slot);

        // Evicting for another region must download the pattern into the
        // host chunk first.
        cache.ensure_resident(&mut map, RegionKey::new(1, 0, 0)).unwrap();
        let chunk = map.region(RegionKey::new(0, 0, 0)).unwrap();
        assert_eq!(chunk.layer_bytes(layer), &pattern[..]);
        assert!(chunk.is_dirty(layer));
    }

    #[test]
    fn test_batch_marker_cycles_odd() {
        let map = test_map();
        let cache = test_cache(&map, 2);

        let mut marker = cache.batch_marker();
        assert_eq!(marker % 2, 1);
        for _ in 0..5 {
            let next = cache.begin_batch();
            assert_eq!(next % 2, 1);
            assert_ne!(next, marker);
            marker = next;
        }
    }

    #[test]
    fn test_flush_downloads_dirty_slots() {
        let mut map = test_map();
        let cache = test_cache(&map, 4);

        cache.ensure_resident(&mut map, RegionKey::new(0, 0, 0)).unwrap();
        cache.ensure_resident(&mut map, RegionKey::new(1, 0, 0)).unwrap();

        let marker = cache.batch_marker();
        cache.update_events(marker, Event::completed());

        let flushed = cache.flush(&mut map, None).unwrap();
        assert_eq!(flushed, 2);

        // Second flush has nothing to do.
        assert_eq!(cache.flush(&mut map, None).unwrap(), 0);
    }

    #[test]
    fn test_invalidate_releases_slot() {
        let mut map = test_map();
        let cache = test_cache(&map, 1);

        cache.ensure_resident(&mut map, RegionKey::new(0, 0, 0)).unwrap();
        cache.invalidate(RegionKey::new(0, 0, 0));

        // The slot is reusable without evicting the invalidated region.
        let slot = cache.ensure_resident(&mut map, RegionKey::new(5, 0, 0)).unwrap();
        assert_eq!(slot, 0);
    }
}

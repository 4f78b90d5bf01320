//! Spatially hashed region storage.
//!
//! Chunks are bucketed by the 32-bit spatial hash of their region key.
//! Hash collisions keep collision chains inside a bucket; lookups always
//! compare the full region key before returning a chunk.

use std::collections::HashMap;

use crate::core::RegionKey;

use super::chunk::MapChunk;

/// Region-key to chunk map with spatial hashing and collision chains.
#[derive(Debug, Default)]
pub struct RegionIndex {
    buckets: HashMap<u32, Vec<MapChunk>>,
    count: usize,
}

impl RegionIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks held.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// True when no chunks are held.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Find the chunk for a region key.
    pub fn get(&self, key: RegionKey) -> Option<&MapChunk> {
        self.buckets
            .get(&key.hash())?
            .iter()
            .find(|chunk| chunk.region_key() == key)
    }

    /// Find the chunk for a region key, mutably.
    pub fn get_mut(&mut self, key: RegionKey) -> Option<&mut MapChunk> {
        self.buckets
            .get_mut(&key.hash())?
            .iter_mut()
            .find(|chunk| chunk.region_key() == key)
    }

    /// Insert a chunk. A chunk with the same region key must not already be
    /// present.
    pub fn insert(&mut self, chunk: MapChunk) {
        let hash = chunk.region_key().hash();
        debug_assert!(self.get(chunk.region_key()).is_none());
        self.buckets.entry(hash).or_default().push(chunk);
        self.count += 1;
    }

    /// Remove and return the chunk for a region key.
    pub fn remove(&mut self, key: RegionKey) -> Option<MapChunk> {
        let hash = key.hash();
        let bucket = self.buckets.get_mut(&hash)?;
        let at = bucket.iter().position(|chunk| chunk.region_key() == key)?;
        let chunk = bucket.swap_remove(at);
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        self.count -= 1;
        Some(chunk)
    }

    /// Remove every chunk matching the predicate, returning their region
    /// keys.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&MapChunk) -> bool) -> Vec<RegionKey> {
        let mut removed = Vec::new();
        self.buckets.retain(|_, bucket| {
            bucket.retain(|chunk| {
                if predicate(chunk) {
                    removed.push(chunk.region_key());
                    false
                } else {
                    true
                }
            });
            !bucket.is_empty()
        });
        self.count -= removed.len();
        removed
    }

    /// Remove all chunks.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.count = 0;
    }

    /// Iterate chunks in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &MapChunk> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    /// Iterate chunks mutably in unspecified order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MapChunk> {
        self.buckets.values_mut().flat_map(|bucket| bucket.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Point3, RegionSize};
    use crate::layout::{default_layers, MapLayout};

    fn make_chunk(key: RegionKey) -> MapChunk {
        let mut layout = MapLayout::new();
        default_layers::add_occupancy(&mut layout);
        MapChunk::new(key, Point3::ZERO, &layout, RegionSize::cubic(2), 0.0).unwrap()
    }

    #[test]
    fn test_insert_get_remove() {
        let mut index = RegionIndex::new();
        assert!(index.is_empty());

        index.insert(make_chunk(RegionKey::new(1, 2, 3)));
        index.insert(make_chunk(RegionKey::new(-1, 0, 0)));
        assert_eq!(index.len(), 2);

        assert!(index.get(RegionKey::new(1, 2, 3)).is_some());
        assert!(index.get(RegionKey::new(9, 9, 9)).is_none());

        let removed = index.remove(RegionKey::new(1, 2, 3)).unwrap();
        assert_eq!(removed.region_key(), RegionKey::new(1, 2, 3));
        assert_eq!(index.len(), 1);
        assert!(index.get(RegionKey::new(1, 2, 3)).is_none());
    }

    #[test]
    fn test_bucket_only_returns_exact_key() {
        // Even if two keys ever landed in one bucket, the equality check
        // must keep them apart. Exercise the chain path directly.
        let mut index = RegionIndex::new();
        index.insert(make_chunk(RegionKey::new(5, 0, 0)));

        for z in -4..4 {
            let probe = RegionKey::new(5, 0, z);
            if z != 0 {
                assert!(index.get(probe).is_none());
            }
        }
    }

    #[test]
    fn test_remove_where_counts() {
        let mut index = RegionIndex::new();
        for x in 0..4 {
            index.insert(make_chunk(RegionKey::new(x, 0, 0)));
        }

        let removed = index.remove_where(|chunk| chunk.region_key().x >= 2);
        assert_eq!(removed.len(), 2);
        assert_eq!(index.len(), 2);
        assert!(index.get(RegionKey::new(0, 0, 0)).is_some());
        assert!(index.get(RegionKey::new(3, 0, 0)).is_none());
    }

    #[test]
    fn test_iteration_covers_all_chunks() {
        let mut index = RegionIndex::new();
        for x in 0..8 {
            index.insert(make_chunk(RegionKey::new(x, x, 0)));
        }
        let mut seen: Vec<i16> = index.iter().map(|chunk| chunk.region_key().x).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }
}

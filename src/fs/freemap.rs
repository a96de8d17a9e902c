//! The free-sector map (component C3): a bitmap over device sectors.
//!
//! Reserved sectors (the bitmap's own backing store and the root directory)
//! are marked in-use at `init` so they can never be handed out by
//! `allocate`. Grounded on the teacher's `disk_layout::BlockBitmap`, but
//! generalized from a fixed 4096-bit array to one sized at runtime from the
//! device's sector count, and widened from single-bit allocation to
//! contiguous-run allocation for swap slots and multi-sector index trees.

use std::sync::Mutex;

use crate::cache::BufferCache;
use crate::device::SECTOR_SIZE;
use crate::error::{CoreError, Result};
use crate::fs::layout::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

const BITS_PER_SECTOR: usize = SECTOR_SIZE * 8;

struct Bitmap {
    bits: Vec<bool>,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        Self { bits: vec![false; len] }
    }

    fn scan_free_run(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return Some(0);
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for (i, used) in self.bits.iter().enumerate() {
            if *used {
                run_len = 0;
                run_start = i + 1;
            } else {
                run_len += 1;
                if run_len == len {
                    return Some(run_start);
                }
            }
        }
        None
    }

    fn set_range(&mut self, start: usize, len: usize, used: bool) {
        for bit in self.bits[start..start + len].iter_mut() {
            *bit = used;
        }
    }
}

/// Allocates and releases runs of sectors on the filesystem device.
///
/// A dedicated lock (here, the `Mutex` wrapping [`Bitmap`]) serializes every
/// allocation and release, independent of the cache-wide lock and every
/// per-inode lock above it in the lock hierarchy.
pub struct FreeMap {
    bitmap: Mutex<Bitmap>,
    persist_sectors: u32,
}

impl FreeMap {
    /// Builds a fresh free map over `sector_count` sectors, marking the
    /// sectors the bitmap itself occupies and the root directory's inode
    /// sector as already in use.
    pub fn format(sector_count: u32) -> Self {
        let bits_needed = sector_count as usize;
        let persist_sectors = bits_needed.div_ceil(BITS_PER_SECTOR).max(1) as u32;
        let mut bitmap = Bitmap::new(bits_needed);
        for sector in FREE_MAP_SECTOR..FREE_MAP_SECTOR + persist_sectors {
            bitmap.set_range(sector as usize, 1, true);
        }
        bitmap.set_range(ROOT_DIR_SECTOR as usize, 1, true);
        Self { bitmap: Mutex::new(bitmap), persist_sectors }
    }

    /// Reloads a free map previously persisted by [`store`](Self::store).
    pub fn load(cache: &BufferCache, sector_count: u32) -> Result<Self> {
        let map = Self::format(sector_count);
        let mut bitmap = map.bitmap.lock().unwrap();
        for i in 0..map.persist_sectors {
            let sector = cache.read(FREE_MAP_SECTOR + i)?;
            for (byte_idx, byte) in sector.iter().enumerate() {
                for bit in 0..8 {
                    let pos = (i as usize) * BITS_PER_SECTOR + byte_idx * 8 + bit;
                    if pos >= bitmap.bits.len() {
                        break;
                    }
                    bitmap.bits[pos] = (byte >> bit) & 1 != 0;
                }
            }
        }
        drop(bitmap);
        Ok(map)
    }

    /// Writes the bitmap back to its reserved sectors.
    pub fn store(&self, cache: &BufferCache) -> Result<()> {
        let bitmap = self.bitmap.lock().unwrap();
        for i in 0..self.persist_sectors {
            let mut sector = [0u8; SECTOR_SIZE];
            for (byte_idx, byte) in sector.iter_mut().enumerate() {
                let mut packed = 0u8;
                for bit in 0..8 {
                    let pos = (i as usize) * BITS_PER_SECTOR + byte_idx * 8 + bit;
                    if bitmap.bits.get(pos).copied().unwrap_or(false) {
                        packed |= 1 << bit;
                    }
                }
                *byte = packed;
            }
            cache.write(FREE_MAP_SECTOR + i, &sector)?;
        }
        Ok(())
    }

    /// Allocates `count` contiguous sectors, marking them in-use.
    pub fn allocate(&self, count: usize) -> Result<u32> {
        let mut bitmap = self.bitmap.lock().unwrap();
        let start = bitmap.scan_free_run(count).ok_or(CoreError::NoSpace)?;
        bitmap.set_range(start, count, true);
        Ok(start as u32)
    }

    /// Releases `count` sectors starting at `sector` back to the free pool.
    pub fn release(&self, sector: u32, count: usize) {
        let mut bitmap = self.bitmap.lock().unwrap();
        bitmap.set_range(sector as usize, count, false);
    }

    /// Number of sectors currently marked free, for tests asserting that a
    /// create/open/close/remove cycle returns the bitmap to its prior state.
    pub fn free_count(&self) -> usize {
        self.bitmap.lock().unwrap().bits.iter().filter(|used| !**used).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::device::MemBlockDevice;
    use std::sync::Arc;

    #[test]
    fn allocate_and_release_round_trips_free_count() {
        let map = FreeMap::format(64);
        let before = map.free_count();
        let sector = map.allocate(3).unwrap();
        assert_eq!(map.free_count(), before - 3);
        map.release(sector, 3);
        assert_eq!(map.free_count(), before);
    }

    #[test]
    fn allocate_refuses_when_full() {
        let map = FreeMap::format(8);
        let before = map.free_count();
        assert!(map.allocate(before + 1).is_err());
    }

    #[test]
    fn reserved_sectors_are_never_handed_out() {
        let map = FreeMap::format(64);
        for _ in 0..61 {
            let s = map.allocate(1).unwrap();
            assert_ne!(s, FREE_MAP_SECTOR);
            assert_ne!(s, ROOT_DIR_SECTOR);
        }
    }

    #[test]
    fn store_then_load_preserves_allocations() {
        let dev = Arc::new(MemBlockDevice::new(64));
        let cache = BufferCache::init(dev, CacheConfig { capacity: 16, ..Default::default() });
        let map = FreeMap::format(64);
        map.allocate(2).unwrap();
        map.store(&cache).unwrap();

        let reloaded = FreeMap::load(&cache, 64).unwrap();
        assert_eq!(reloaded.free_count(), map.free_count());
    }
}

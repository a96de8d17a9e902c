//! The sector buffer cache (component C2).
//!
//! Grounded on the teacher's `LRUCache<K, V, MAX_SIZE>`
//! (`keos-project5/src/ffs/lru.rs`): this keeps its fixed-capacity,
//! monotonic-timestamp LRU selection, generalized from a const-generic array
//! to a runtime-configured `Vec` of slots, and split into two locks instead
//! of one so readers of different sectors never block each other.
//!
//! Two locks cooperate:
//! - the cache-wide lock (`CacheState`, behind a single `Mutex`) serializes
//!   *entry identity*: which sector maps to which slot, and slot metadata
//!   (dirty/valid/victim/LRU time).
//! - each slot's [`EntryRwLock`](entry::EntryRwLock) serializes *content
//!   access* for that one slot, independent of every other slot.
//!
//! `get_block` holds the cache-wide lock for the whole scan/evict/writeback/
//! reassign sequence, then drops it before the caller touches slot content.
//! That gap is the victim-flag race: between `get_block` returning a slot
//! index and the caller acquiring that slot's content lock, another thread
//! could already be loading (or have finished loading) different content
//! into the same slot. `read`/`write` close the gap by rechecking, under the
//! content lock, that the slot still maps to the sector they asked for and
//! isn't mid-eviction, retrying `get_block` from scratch on a mismatch.

mod entry;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::Result;
use entry::EntryRwLock;

/// Tunables for a [`BufferCache`] instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of 512-byte slots held in memory at once.
    pub capacity: usize,
    /// Period between automatic background flushes of dirty slots.
    pub flush_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            flush_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Copy)]
struct SlotMeta {
    sector: Option<u32>,
    valid: bool,
    dirty: bool,
    victim: bool,
    time: u64,
}

impl Default for SlotMeta {
    fn default() -> Self {
        Self { sector: None, valid: false, dirty: false, victim: false, time: 0 }
    }
}

struct CacheState {
    index: HashMap<u32, usize>,
    meta: Vec<SlotMeta>,
    clock: u64,
}

struct Slot {
    data: EntryRwLock<[u8; SECTOR_SIZE]>,
}

struct Shared {
    device: Arc<dyn BlockDevice>,
    config: CacheConfig,
    state: Mutex<CacheState>,
    /// Signaled whenever a slot's victim flag clears, so a `get_block` call
    /// waiting on that sector or waiting for any free slot can retry.
    state_cv: Condvar,
    slots: Vec<Slot>,
    readahead_queue: Mutex<VecDeque<u32>>,
    readahead_cv: Condvar,
    stop: AtomicBool,
}

impl Shared {
    /// Flushes every dirty slot to the device. Takes the per-slot content
    /// lock with `try_write`, never blocking: a slot currently held by a
    /// reader, writer, or evictor is skipped and picked up on the next tick
    /// rather than stalling the whole background flush behind it.
    fn flush_all(&self) -> Result<()> {
        let dirty: Vec<(u32, usize)> = {
            let state = self.state.lock().unwrap();
            state
                .meta
                .iter()
                .enumerate()
                .filter_map(|(idx, m)| m.sector.filter(|_| m.dirty && m.valid && !m.victim).map(|s| (s, idx)))
                .collect()
        };
        for (sector, idx) in dirty {
            let Some(guard) = self.slots[idx].data.try_write() else {
                trace!("flush skipping busy slot {idx} for sector {sector}");
                continue;
            };
            self.device.write(sector, &guard)?;
            drop(guard);
            let mut state = self.state.lock().unwrap();
            if state.meta[idx].sector == Some(sector) {
                state.meta[idx].dirty = false;
            }
        }
        Ok(())
    }

    /// Picks a slot to reuse: the first empty one, or else the non-victim
    /// slot with the oldest LRU timestamp. `None` means every slot is
    /// currently claimed by another in-flight eviction; the caller must wait
    /// for one to clear rather than handing out a slot still mid-eviction.
    fn choose_slot(&self, state: &mut CacheState) -> Option<usize> {
        if let Some(idx) = state.meta.iter().position(|m| m.sector.is_none()) {
            return Some(idx);
        }
        state
            .meta
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.victim)
            .min_by_key(|(_, m)| m.time)
            .map(|(idx, _)| idx)
    }

    fn get_block(&self, sector: u32) -> Result<usize> {
        loop {
            let mut state = self.state.lock().unwrap();
            if let Some(&idx) = state.index.get(&sector) {
                if state.meta[idx].victim {
                    let _state = self.state_cv.wait(state).unwrap();
                    continue;
                }
                state.clock += 1;
                state.meta[idx].time = state.clock;
                return Ok(idx);
            }

            let idx = match self.choose_slot(&mut state) {
                Some(idx) => idx,
                None => {
                    // Every slot is mid-eviction; wait for one to finish
                    // rather than handing out a victim-flagged slot.
                    let _state = self.state_cv.wait(state).unwrap();
                    continue;
                }
            };
            let evicted = state.meta[idx].sector;
            let needs_writeback = evicted.is_some() && state.meta[idx].dirty;
            if let Some(old) = evicted {
                state.index.remove(&old);
            }
            state.meta[idx] = SlotMeta { sector: Some(sector), valid: false, dirty: false, victim: true, time: 0 };
            state.clock += 1;
            state.meta[idx].time = state.clock;
            state.index.insert(sector, idx);

            // Held through the writeback: the design serializes the whole
            // scan/evict/writeback/reassign sequence behind the cache-wide
            // lock rather than releasing it mid-eviction.
            if needs_writeback {
                if let Some(old_sector) = evicted {
                    let guard = self.slots[idx].data.evict();
                    trace!("writing back dirty sector {old_sector} before reuse");
                    self.device.write(old_sector, &guard)?;
                }
            }
            drop(state);

            let mut buf = [0u8; SECTOR_SIZE];
            self.device.read(sector, &mut buf)?;
            {
                let mut guard = self.slots[idx].data.write();
                *guard = buf;
            }

            let mut state = self.state.lock().unwrap();
            if state.index.get(&sector) == Some(&idx) {
                state.meta[idx].valid = true;
                state.meta[idx].victim = false;
            }
            drop(state);
            self.state_cv.notify_all();
            return Ok(idx);
        }
    }
}

/// The sector buffer cache sitting between the inode layer and the block
/// device. Background threads flush dirty slots periodically and service
/// read-ahead requests; both are stopped and drained by [`shutdown`].
///
/// [`shutdown`]: BufferCache::shutdown
pub struct BufferCache {
    shared: Arc<Shared>,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
    readahead_thread: Mutex<Option<JoinHandle<()>>>,
}

impl BufferCache {
    /// Brings up a cache of `config.capacity` slots over `device`, starting
    /// the background flush and read-ahead worker threads.
    pub fn init(device: Arc<dyn BlockDevice>, config: CacheConfig) -> Self {
        let capacity = config.capacity.max(1);
        let shared = Arc::new(Shared {
            device,
            slots: (0..capacity).map(|_| Slot { data: EntryRwLock::new([0u8; SECTOR_SIZE]) }).collect(),
            state: Mutex::new(CacheState {
                index: HashMap::with_capacity(capacity),
                meta: vec![SlotMeta::default(); capacity],
                clock: 0,
            }),
            state_cv: Condvar::new(),
            config,
            readahead_queue: Mutex::new(VecDeque::new()),
            readahead_cv: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let flush_thread = {
            let shared = shared.clone();
            thread::spawn(move || Self::flush_worker(shared))
        };
        let readahead_thread = {
            let shared = shared.clone();
            thread::spawn(move || Self::readahead_worker(shared))
        };

        Self {
            shared,
            flush_thread: Mutex::new(Some(flush_thread)),
            readahead_thread: Mutex::new(Some(readahead_thread)),
        }
    }

    fn flush_worker(shared: Arc<Shared>) {
        let interval = shared.config.flush_interval;
        while !shared.stop.load(Ordering::Acquire) {
            thread::sleep(interval);
            if let Err(err) = shared.flush_all() {
                warn!("periodic flush failed: {err}");
            }
        }
    }

    fn readahead_worker(shared: Arc<Shared>) {
        loop {
            let sector = {
                let mut queue = shared.readahead_queue.lock().unwrap();
                while queue.is_empty() && !shared.stop.load(Ordering::Acquire) {
                    queue = shared.readahead_cv.wait(queue).unwrap();
                }
                match queue.pop_front() {
                    Some(s) => s,
                    None => return,
                }
            };
            if let Err(err) = shared.get_block(sector) {
                debug!("read-ahead of sector {sector} failed: {err}");
            }
        }
    }

    /// Reads sector `sector`, faulting it in from the device on a miss.
    pub fn read(&self, sector: u32) -> Result<[u8; SECTOR_SIZE]> {
        loop {
            let idx = self.shared.get_block(sector)?;
            let guard = self.shared.slots[idx].data.read();
            let fresh = {
                let state = self.shared.state.lock().unwrap();
                state.index.get(&sector) == Some(&idx) && !state.meta[idx].victim
            };
            if fresh {
                return Ok(*guard);
            }
        }
    }

    /// Overwrites sector `sector` in the cache, marking it dirty for a later
    /// flush rather than writing through to the device immediately.
    pub fn write(&self, sector: u32, data: &[u8; SECTOR_SIZE]) -> Result<()> {
        loop {
            let idx = self.shared.get_block(sector)?;
            let mut guard = self.shared.slots[idx].data.write();
            let fresh = {
                let mut state = self.shared.state.lock().unwrap();
                let ok = state.index.get(&sector) == Some(&idx) && !state.meta[idx].victim;
                if ok {
                    state.meta[idx].dirty = true;
                }
                ok
            };
            if fresh {
                *guard = *data;
                return Ok(());
            }
        }
    }

    /// Queues `sector` to be faulted in by the read-ahead worker without the
    /// caller blocking on it. Sector 0 is never requested this way: by
    /// convention an all-zero sector number means "unallocated" in the inode
    /// layer, and warming it would just pollute the cache with a block
    /// nothing references yet.
    pub fn read_ahead(&self, sector: u32) {
        if sector == 0 {
            return;
        }
        let mut queue = self.shared.readahead_queue.lock().unwrap();
        if !queue.contains(&sector) {
            queue.push_back(sector);
            self.shared.readahead_cv.notify_one();
        }
    }

    /// Flushes every dirty slot to the device, stops the background
    /// threads, and waits for them to exit. Idempotent: a second call is a
    /// cheap no-op once the threads have already been joined.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.flush_all()?;
        self.shared.stop.store(true, Ordering::Release);
        self.shared.readahead_cv.notify_all();
        if let Some(t) = self.flush_thread.lock().unwrap().take() {
            let _ = t.join();
        }
        if let Some(t) = self.readahead_thread.lock().unwrap().take() {
            let _ = t.join();
        }
        Ok(())
    }

    /// Number of slots currently holding a valid sector.
    pub fn occupied(&self) -> usize {
        self.shared.state.lock().unwrap().meta.iter().filter(|m| m.sector.is_some()).count()
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn cache(capacity: usize) -> (BufferCache, Arc<MemBlockDevice>) {
        let dev = Arc::new(MemBlockDevice::new(16));
        let cache = BufferCache::init(dev.clone(), CacheConfig { capacity, flush_interval: Duration::from_secs(3600) });
        (cache, dev)
    }

    #[test]
    fn repeated_reads_hit_the_cache() {
        let (cache, dev) = cache(4);
        cache.read(1).unwrap();
        cache.read(1).unwrap();
        cache.read(1).unwrap();
        assert_eq!(dev.read_count(), 1);
    }

    #[test]
    fn write_then_shutdown_flushes_to_device() {
        let (cache, dev) = cache(4);
        let mut data = [0u8; SECTOR_SIZE];
        data[0] = 0x42;
        cache.write(2, &data).unwrap();
        assert_eq!(dev.write_count(), 0);
        cache.shutdown().unwrap();
        assert_eq!(dev.write_count(), 1);
        let mut out = [0u8; SECTOR_SIZE];
        dev.read(2, &mut out).unwrap();
        assert_eq!(out[0], 0x42);
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        let (cache, dev) = cache(1);
        let mut data = [0u8; SECTOR_SIZE];
        data[0] = 9;
        cache.write(1, &data).unwrap();
        cache.read(2).unwrap();
        assert_eq!(dev.write_count(), 1);
        let mut out = [0u8; SECTOR_SIZE];
        dev.read(1, &mut out).unwrap();
        assert_eq!(out[0], 9);
    }

    #[test]
    fn read_ahead_warms_cache_without_blocking() {
        let (cache, dev) = cache(4);
        cache.read_ahead(3);
        cache.shutdown().unwrap();
        assert!(dev.read_count() >= 1);
    }
}

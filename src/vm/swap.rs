//! The swap area (component C6): a bitmap over fixed-size slots on a second
//! block device, each slot backing exactly one evicted physical page.

use std::sync::{Arc, Mutex};

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{CoreError, Result};
use crate::hal::PAGE_SIZE;

/// Sectors making up one swap slot (one page).
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

struct Bitmap {
    used: Vec<bool>,
    next_scan: usize,
}

/// Backs evicted pages on a dedicated swap device. A single lock serializes
/// every bitmap operation, independent of every other lock in the hierarchy.
pub struct SwapArea {
    device: Arc<dyn BlockDevice>,
    bitmap: Mutex<Bitmap>,
}

impl SwapArea {
    /// Computes slot count as `device.sector_count() / 8` and marks every
    /// slot free.
    pub fn init(device: Arc<dyn BlockDevice>) -> Self {
        let slot_count = device.sector_count() as usize / SECTORS_PER_SLOT;
        Self { device, bitmap: Mutex::new(Bitmap { used: vec![false; slot_count], next_scan: 0 }) }
    }

    /// Scans the bitmap from the last-used offset, marks the first free
    /// slot used, and writes the page's 8 sectors sequentially into it.
    /// Exhaustion is treated as fatal, matching a real kernel's swap-full
    /// panic, via [`CoreError::NoSpace`].
    pub fn write(&self, page: &[u8; PAGE_SIZE]) -> Result<usize> {
        let mut bitmap = self.bitmap.lock().unwrap();
        let len = bitmap.used.len();
        if len == 0 {
            return Err(CoreError::NoSpace);
        }
        let start = bitmap.next_scan;
        let slot = (0..len).map(|i| (start + i) % len).find(|&i| !bitmap.used[i]).ok_or(CoreError::NoSpace)?;
        bitmap.used[slot] = true;
        bitmap.next_scan = (slot + 1) % len;
        drop(bitmap);

        for i in 0..SECTORS_PER_SLOT {
            let sector = (slot * SECTORS_PER_SLOT + i) as u32;
            let chunk: &[u8; SECTOR_SIZE] = page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].try_into().unwrap();
            self.device.write(sector, chunk)?;
        }
        Ok(slot)
    }

    /// Reads slot `slot`'s 8 sectors back into `page` and frees the slot.
    pub fn read(&self, slot: usize, page: &mut [u8; PAGE_SIZE]) -> Result<()> {
        for i in 0..SECTORS_PER_SLOT {
            let sector = (slot * SECTORS_PER_SLOT + i) as u32;
            let mut chunk = [0u8; SECTOR_SIZE];
            self.device.read(sector, &mut chunk)?;
            page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&chunk);
        }
        self.free(slot);
        Ok(())
    }

    /// Frees `slot` without reading it back, for process teardown discarding
    /// a swapped-out page nobody will read again.
    pub fn delete(&self, slot: usize) {
        self.free(slot);
    }

    fn free(&self, slot: usize) {
        let mut bitmap = self.bitmap.lock().unwrap();
        if let Some(bit) = bitmap.used.get_mut(slot) {
            *bit = false;
        }
    }

    pub fn slot_count(&self) -> usize {
        self.bitmap.lock().unwrap().used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    #[test]
    fn write_then_read_round_trips_a_page() {
        let dev = Arc::new(MemBlockDevice::new(64));
        let swap = SwapArea::init(dev);
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 7;
        page[PAGE_SIZE - 1] = 9;
        let slot = swap.write(&page).unwrap();
        let mut out = [0u8; PAGE_SIZE];
        swap.read(slot, &mut out).unwrap();
        assert_eq!(out[0], 7);
        assert_eq!(out[PAGE_SIZE - 1], 9);
    }

    #[test]
    fn read_frees_the_slot_for_reuse() {
        let dev = Arc::new(MemBlockDevice::new(16));
        let swap = SwapArea::init(dev);
        let page = [0u8; PAGE_SIZE];
        let slot = swap.write(&page).unwrap();
        swap.read(slot, &mut [0u8; PAGE_SIZE]).unwrap();
        let slot2 = swap.write(&page).unwrap();
        assert_eq!(slot, slot2);
    }

    #[test]
    fn exhaustion_is_reported_as_no_space() {
        let dev = Arc::new(MemBlockDevice::new(8));
        let swap = SwapArea::init(dev);
        let page = [0u8; PAGE_SIZE];
        swap.write(&page).unwrap();
        assert!(matches!(swap.write(&page), Err(CoreError::NoSpace)));
    }
}

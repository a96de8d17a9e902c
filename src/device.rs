//! The block device boundary (component C1 of the design).
//!
//! The raw disk driver is an external collaborator: a real kernel talks to
//! IDE/virtio hardware, this crate only needs *a* synchronous, sector
//! addressable device to sit underneath the buffer cache and the swap area.
//! [`MemBlockDevice`] is the reference implementation used by every test in
//! this crate; it also exposes a read counter so the cache hit/miss scenario
//! can assert on exactly how many device reads occurred.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{CoreError, Result};

/// Bytes in a single addressable sector.
pub const SECTOR_SIZE: usize = 512;

/// A synchronous, sector-addressable block device.
///
/// Errors are expected to be fatal in a real kernel (a failed disk read/write
/// panics the machine); this crate still threads a [`Result`] through so that
/// [`MemBlockDevice`] can simulate a full device without `panic!`, and so that
/// a future hosted backend (a file-backed device, say) can report I/O errors
/// normally.
pub trait BlockDevice: Send + Sync {
    /// Reads sector `sector` into `buf`.
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()>;
    /// Writes `buf` to sector `sector`.
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()>;
    /// Total number of addressable sectors on this device.
    fn sector_count(&self) -> u32;
}

/// An in-memory [`BlockDevice`] backing every test in this crate.
///
/// Reads of sectors beyond `sector_count` return [`CoreError::InvalidArgument`]
/// rather than panicking, which keeps out-of-bounds bugs in the layers above
/// visible as ordinary test failures instead of aborts.
pub struct MemBlockDevice {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemBlockDevice {
    /// Creates a zero-filled device with `sector_count` sectors.
    pub fn new(sector_count: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; sector_count as usize]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of [`BlockDevice::read`] calls observed so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of [`BlockDevice::write`] calls observed so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        let sectors = self.sectors.lock().unwrap();
        let slot = sectors.get(sector as usize).ok_or(CoreError::InvalidArgument)?;
        buf.copy_from_slice(slot);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        let mut sectors = self.sectors.lock().unwrap();
        let slot = sectors.get_mut(sector as usize).ok_or(CoreError::InvalidArgument)?;
        slot.copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }
}

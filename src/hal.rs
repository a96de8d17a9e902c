//! Hardware abstraction layer: the seams where this crate meets the
//! physical-page allocator (C10) and the hardware page directory (C11).
//!
//! Both are external collaborators per the design: a real kernel wires in
//! `palloc_get_page`/`palloc_free_page` and `pagedir_*`. This module defines
//! the traits the VM coordinator drives, plus reference in-memory
//! implementations used by every test and by the end-to-end scenarios.

use std::collections::HashMap;
use std::sync::Mutex;

use bitflags::bitflags;

use crate::device::SECTOR_SIZE;

/// Bytes in a single virtual-memory page; always [`SECTORS_PER_PAGE`] sectors.
pub const PAGE_SIZE: usize = 4096;
/// Sectors making up one page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

bitflags! {
    /// Page protection bits handed to [`PageDirectory::set_mapping`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permission: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

/// Identifies the process/address-space a frame or mapping belongs to.
///
/// This crate never interprets `Owner` beyond equality and use as a map key —
/// it is the seam where an embedding kernel's real process handle would be
/// substituted; the scheduler that creates and tears down owners is out of
/// scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Owner(pub u64);

/// A handle to one physical page handed out by a [`PageAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame(pub u64);

/// The physical-page allocator boundary (component C10).
///
/// In a real kernel this is `palloc_get_page`/`palloc_free_page`; here it also
/// doubles as the only way to read or write a frame's bytes, since this crate
/// has no raw pointer into physical memory to hand out.
pub trait PageAllocator: Send + Sync {
    /// Allocates one zero-filled physical page, or `None` if the pool is
    /// exhausted (the VM coordinator responds by evicting a frame and
    /// retrying, per the design's `get_frame` contract).
    fn alloc_zeroed(&self) -> Option<Frame>;
    /// Returns a frame to the free pool.
    fn free(&self, frame: Frame);
    /// Copies the frame's contents into `out`.
    fn read(&self, frame: Frame, out: &mut [u8; PAGE_SIZE]);
    /// Overwrites the frame's contents with `data`.
    fn write(&self, frame: Frame, data: &[u8; PAGE_SIZE]);
}

/// The hardware page directory boundary (component C11).
///
/// Stands in for `pagedir_set_page`/`pagedir_clear_page`/dirty-and-accessed
/// bit queries in a real kernel.
pub trait PageDirectory: Send + Sync {
    /// Installs a present, mapping `owner`'s virtual page `vpage` to `frame`
    /// with permission `perm`. `vpage` is a page-aligned virtual address.
    fn set_mapping(&self, owner: Owner, vpage: u64, frame: Frame, perm: Permission);
    /// Removes the mapping for `owner`'s virtual page `vpage`, if any.
    fn clear_mapping(&self, owner: Owner, vpage: u64);
    /// Returns the frame `owner`'s virtual page `vpage` currently maps to.
    fn mapped_frame(&self, owner: Owner, vpage: u64) -> Option<Frame>;
    /// Whether the page has been written since it was last mapped in.
    fn is_dirty(&self, owner: Owner, vpage: u64) -> bool;
    /// Whether the page has been read or written since its accessed bit was
    /// last cleared.
    fn is_accessed(&self, owner: Owner, vpage: u64) -> bool;
    /// Sets (or clears) the accessed bit, used by clock-hand eviction.
    fn set_accessed(&self, owner: Owner, vpage: u64, value: bool);
}

/// A bitmap-backed [`PageAllocator`] over a fixed pool of frames, used by
/// tests and the end-to-end scenarios.
pub struct TestPageAllocator {
    pages: Mutex<Vec<Option<Box<[u8; PAGE_SIZE]>>>>,
}

impl TestPageAllocator {
    /// Creates an allocator backed by `capacity` physical frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            pages: Mutex::new((0..capacity).map(|_| None).collect()),
        }
    }
}

impl PageAllocator for TestPageAllocator {
    fn alloc_zeroed(&self) -> Option<Frame> {
        let mut pages = self.pages.lock().unwrap();
        let idx = pages.iter().position(|slot| slot.is_none())?;
        pages[idx] = Some(Box::new([0u8; PAGE_SIZE]));
        Some(Frame(idx as u64))
    }

    fn free(&self, frame: Frame) {
        let mut pages = self.pages.lock().unwrap();
        pages[frame.0 as usize] = None;
    }

    fn read(&self, frame: Frame, out: &mut [u8; PAGE_SIZE]) {
        let pages = self.pages.lock().unwrap();
        let page = pages[frame.0 as usize].as_ref().expect("read of freed frame");
        out.copy_from_slice(page.as_ref());
    }

    fn write(&self, frame: Frame, data: &[u8; PAGE_SIZE]) {
        let mut pages = self.pages.lock().unwrap();
        let page = pages[frame.0 as usize].as_mut().expect("write of freed frame");
        page.as_mut().copy_from_slice(data);
    }
}

#[derive(Default, Clone, Copy)]
struct Mapping {
    frame: Frame,
    dirty: bool,
    accessed: bool,
}

impl Default for Frame {
    fn default() -> Self {
        Frame(u64::MAX)
    }
}

/// A `HashMap`-backed [`PageDirectory`] used by tests and the end-to-end
/// scenarios; dirty/accessed bits are simulated rather than read off real
/// hardware.
#[derive(Default)]
pub struct TestPageDirectory {
    table: Mutex<HashMap<(Owner, u64), Mapping>>,
}

impl TestPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `vpage` dirty, as if the owning process had just written
    /// through it. Exposed so tests can simulate a write without a real MMU.
    pub fn mark_dirty(&self, owner: Owner, vpage: u64) {
        if let Some(m) = self.table.lock().unwrap().get_mut(&(owner, vpage)) {
            m.dirty = true;
        }
    }
}

impl PageDirectory for TestPageDirectory {
    fn set_mapping(&self, owner: Owner, vpage: u64, frame: Frame, _perm: Permission) {
        self.table.lock().unwrap().insert(
            (owner, vpage),
            Mapping { frame, dirty: false, accessed: true },
        );
    }

    fn clear_mapping(&self, owner: Owner, vpage: u64) {
        self.table.lock().unwrap().remove(&(owner, vpage));
    }

    fn mapped_frame(&self, owner: Owner, vpage: u64) -> Option<Frame> {
        self.table.lock().unwrap().get(&(owner, vpage)).map(|m| m.frame)
    }

    fn is_dirty(&self, owner: Owner, vpage: u64) -> bool {
        self.table.lock().unwrap().get(&(owner, vpage)).is_some_and(|m| m.dirty)
    }

    fn is_accessed(&self, owner: Owner, vpage: u64) -> bool {
        self.table.lock().unwrap().get(&(owner, vpage)).is_some_and(|m| m.accessed)
    }

    fn set_accessed(&self, owner: Owner, vpage: u64, value: bool) {
        if let Some(m) = self.table.lock().unwrap().get_mut(&(owner, vpage)) {
            m.accessed = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_reuses_freed_frames() {
        let alloc = TestPageAllocator::new(1);
        let f1 = alloc.alloc_zeroed().unwrap();
        assert!(alloc.alloc_zeroed().is_none());
        alloc.free(f1);
        assert!(alloc.alloc_zeroed().is_some());
    }

    #[test]
    fn directory_tracks_dirty_and_accessed() {
        let dir = TestPageDirectory::new();
        let owner = Owner(1);
        dir.set_mapping(owner, 0x1000, Frame(0), Permission::READ | Permission::WRITE);
        assert!(dir.is_accessed(owner, 0x1000));
        assert!(!dir.is_dirty(owner, 0x1000));
        dir.mark_dirty(owner, 0x1000);
        assert!(dir.is_dirty(owner, 0x1000));
        dir.set_accessed(owner, 0x1000, false);
        assert!(!dir.is_accessed(owner, 0x1000));
        dir.clear_mapping(owner, 0x1000);
        assert!(dir.mapped_frame(owner, 0x1000).is_none());
    }
}

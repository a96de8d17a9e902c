//! The supplemental page table (component C8): a per-process hash keyed by
//! user virtual page address, tracking what backs a page that either isn't
//! resident yet or has been evicted.

use std::collections::HashMap;

use crate::hal::Frame;

/// What a resident page would fall back to on eviction, if anything.
/// Carried alongside [`SupplementalEntry::Resident`] so that identity isn't
/// lost the moment a lazy entry is faulted in — without it, every resident
/// page looks alike to the evictor and neither the mmap writeback path nor
/// the clean-file-backed discard path could ever be reached.
#[derive(Clone, Copy, Debug)]
pub enum Backing {
    /// Plain on-demand file content (e.g. an executable segment); never
    /// written back to the file on eviction, since diverging from it is
    /// expected copy-on-write behavior.
    File { file_sector: u32, offset: u64, read_bytes: u32, zero_bytes: u32 },
    /// A memory-mapped file region; a dirty page here is written back to
    /// `(file_sector, offset)` on eviction or `munmap`.
    Mmap { file_sector: u32, offset: u64, read_bytes: u32, zero_bytes: u32 },
}

/// The on-demand backing behind one virtual page, mirroring the state
/// machine in §4.8: `LAZY` is [`FileBacked`](SupplementalEntry::FileBacked)
/// or [`Mmap`](SupplementalEntry::Mmap) before first touch, `RESIDENT` is
/// [`Resident`](SupplementalEntry::Resident), `SWAPPED` is
/// [`OnSwap`](SupplementalEntry::OnSwap).
#[derive(Clone, Copy, Debug)]
pub enum SupplementalEntry {
    /// Mapped to a physical frame right now. `backing` is `None` for
    /// anonymous pages (stack, heap) and `Some` for a page faulted in from
    /// [`FileBacked`](SupplementalEntry::FileBacked) or
    /// [`Mmap`](SupplementalEntry::Mmap), so eviction can still tell the two
    /// apart.
    Resident { frame: Frame, writable: bool, backing: Option<Backing> },
    /// Evicted to a swap slot; not backed by any file. Reached only for
    /// anonymous pages or file-backed pages that have diverged from their
    /// file (dirty or writable) — an `Mmap` page never lands here, since it
    /// always writes back to its file and re-lazies instead.
    OnSwap { slot: usize, writable: bool },
    /// Not yet touched; backed by `read_bytes` of file content at `offset`,
    /// zero-padded to a full page. Used for executable segments and for
    /// plain on-demand file reads that never write back on eviction unless
    /// dirty.
    FileBacked { file_sector: u32, offset: u64, read_bytes: u32, zero_bytes: u32, writable: bool },
    /// Not yet touched; backed by a memory-mapped file region. Dirty
    /// eviction or `munmap` writes the page back to `(file_sector, offset)`.
    Mmap { file_sector: u32, offset: u64, read_bytes: u32, zero_bytes: u32 },
}

impl SupplementalEntry {
    pub fn writable(&self) -> bool {
        match self {
            SupplementalEntry::Resident { writable, .. } => *writable,
            SupplementalEntry::OnSwap { writable, .. } => *writable,
            SupplementalEntry::FileBacked { writable, .. } => *writable,
            SupplementalEntry::Mmap { .. } => true,
        }
    }
}

/// One process's virtual-page → backing-state table.
#[derive(Default)]
pub struct SupplementalTable {
    entries: HashMap<u64, SupplementalEntry>,
}

impl SupplementalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a resident mapping. `backing` carries forward the page's
    /// file or mmap identity if it was faulted in from one of those lazy
    /// states; `None` for anonymous pages (stack, heap) and for pages
    /// faulted back in from swap.
    pub fn install(&mut self, vpage: u64, frame: Frame, writable: bool, backing: Option<Backing>) {
        self.entries.insert(vpage, SupplementalEntry::Resident { frame, writable, backing });
    }

    /// Registers a not-yet-loaded page backed by file content.
    pub fn lazy_install_file(&mut self, vpage: u64, file_sector: u32, offset: u64, read_bytes: u32, zero_bytes: u32, writable: bool) {
        self.entries
            .insert(vpage, SupplementalEntry::FileBacked { file_sector, offset, read_bytes, zero_bytes, writable });
    }

    /// Registers a not-yet-loaded `mmap`-backed page.
    pub fn lazy_install_mmap(&mut self, vpage: u64, file_sector: u32, offset: u64, read_bytes: u32, zero_bytes: u32) {
        self.entries.insert(vpage, SupplementalEntry::Mmap { file_sector, offset, read_bytes, zero_bytes });
    }

    pub fn get(&self, vpage: u64) -> Option<SupplementalEntry> {
        self.entries.get(&vpage).copied()
    }

    pub fn set(&mut self, vpage: u64, entry: SupplementalEntry) {
        self.entries.insert(vpage, entry);
    }

    pub fn delete(&mut self, vpage: u64) -> Option<SupplementalEntry> {
        self.entries.remove(&vpage)
    }

    pub fn contains(&self, vpage: u64) -> bool {
        self.entries.contains_key(&vpage)
    }

    pub fn vpages(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_then_get_round_trips() {
        let mut table = SupplementalTable::new();
        table.install(0x1000, Frame(3), true, None);
        match table.get(0x1000) {
            Some(SupplementalEntry::Resident { frame, writable, backing }) => {
                assert_eq!(frame, Frame(3));
                assert!(writable);
                assert!(backing.is_none());
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn delete_removes_the_entry() {
        let mut table = SupplementalTable::new();
        table.lazy_install_file(0x2000, 7, 0, 4096, 0, true);
        assert!(table.contains(0x2000));
        table.delete(0x2000);
        assert!(!table.contains(0x2000));
    }
}

//! The VM coordinator (component C9): page-fault resolution, frame
//! acquisition under memory pressure, and `mmap`/`munmap`.
//!
//! Ties together the frame table (C7), swap area (C6), and one supplemental
//! page table (C8) per process, plus the inode layer for loading and
//! writing back file-backed and memory-mapped pages. `vm_init` in the
//! design notes corresponds to [`VirtualMemory::new`]; there is no global
//! mutable singleton here since every test mounts its own device pair.

pub mod frame;
pub mod supplemental;
pub mod swap;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use log::{trace, warn};

use crate::error::{CoreError, Result};
use crate::fs::FileSystem;
use crate::hal::{Frame, Owner, PageAllocator, PageDirectory, Permission, PAGE_SIZE};
use frame::FrameTable;
use supplemental::{Backing, SupplementalEntry, SupplementalTable};
use swap::SwapArea;

/// Identifies one live `mmap` region, returned by [`VirtualMemory::mmap`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MmapId(u64);

struct MmapDescriptor {
    file_sector: u32,
    pages: Vec<u64>,
}

/// Coordinates demand paging across every process sharing this VM instance.
pub struct VirtualMemory {
    allocator: Arc<dyn PageAllocator>,
    pagedir: Arc<dyn PageDirectory>,
    frames: FrameTable,
    swap: SwapArea,
    supplemental: Mutex<HashMap<Owner, SupplementalTable>>,
    mmaps: Mutex<HashMap<MmapId, MmapDescriptor>>,
    next_mmap_id: Mutex<u64>,
    fs_handle: OnceLock<Arc<FileSystem>>,
}

impl VirtualMemory {
    /// Brings up the frame table and swap area. Corresponds to `vm_init` in
    /// the design notes.
    pub fn new(allocator: Arc<dyn PageAllocator>, pagedir: Arc<dyn PageDirectory>, swap_device: Arc<dyn crate::device::BlockDevice>) -> Self {
        Self {
            allocator,
            pagedir,
            frames: FrameTable::new(),
            swap: SwapArea::init(swap_device),
            supplemental: Mutex::new(HashMap::new()),
            mmaps: Mutex::new(HashMap::new()),
            next_mmap_id: Mutex::new(1),
            fs_handle: OnceLock::new(),
        }
    }

    /// Wires in the filesystem used to load and write back file-backed and
    /// `mmap`-ed pages. Must be called once before any fault is handled;
    /// kept separate from `new` so a `VirtualMemory` and its `FileSystem`
    /// can be constructed independently and then linked.
    pub fn bind_fs(&self, fs: Arc<FileSystem>) {
        let _ = self.fs_handle.set(fs);
    }

    fn with_table<R>(&self, owner: Owner, f: impl FnOnce(&mut SupplementalTable) -> R) -> R {
        let mut all = self.supplemental.lock().unwrap();
        let table = all.entry(owner).or_default();
        f(table)
    }

    /// Eagerly maps `vpage` to a freshly allocated, zero-filled frame —
    /// the path used for newly allocated stack and heap pages.
    pub fn install_eager(&self, owner: Owner, vpage: u64, writable: bool) -> Result<()> {
        let frame = self.get_frame(owner, vpage)?;
        self.pagedir.set_mapping(owner, vpage, frame, perm(writable));
        self.with_table(owner, |t| t.install(vpage, frame, writable, None));
        Ok(())
    }

    /// Registers `vpage` as backed by `file_sector` without touching
    /// memory yet; the first fault loads it.
    pub fn lazy_install_file(&self, owner: Owner, vpage: u64, file_sector: u32, offset: u64, read_bytes: u32, zero_bytes: u32, writable: bool) {
        self.with_table(owner, |t| t.lazy_install_file(vpage, file_sector, offset, read_bytes, zero_bytes, writable));
    }

    pub fn get_supplemental(&self, owner: Owner, vpage: u64) -> Option<SupplementalEntry> {
        self.with_table(owner, |t| t.get(vpage))
    }

    pub fn delete_supplemental(&self, owner: Owner, vpage: u64) {
        self.with_table(owner, |t| t.delete(vpage));
    }

    /// Allocates one physical page for `owner`'s `vpage`, evicting a victim
    /// under memory pressure if the allocator is exhausted.
    fn get_frame(&self, owner: Owner, vpage: u64) -> Result<Frame> {
        if let Some(frame) = self.allocator.alloc_zeroed() {
            self.frames.add(frame, owner, vpage);
            return Ok(frame);
        }
        self.evict_one(owner)?;
        let frame = self.allocator.alloc_zeroed().ok_or(CoreError::NoMemory)?;
        self.frames.add(frame, owner, vpage);
        Ok(frame)
    }

    fn evict_one(&self, fs_owner: Owner) -> Result<()> {
        let (victim_frame, victim_owner, victim_vpage) =
            self.frames.evict_victim(self.pagedir.as_ref()).ok_or(CoreError::NoMemory)?;
        let dirty = self.pagedir.is_dirty(victim_owner, victim_vpage);
        let entry = self.with_table(victim_owner, |t| t.get(victim_vpage));

        let mut buf = [0u8; PAGE_SIZE];
        self.allocator.read(victim_frame, &mut buf);

        let new_entry = match entry {
            Some(SupplementalEntry::Resident { backing: Some(Backing::Mmap { file_sector, offset, read_bytes, zero_bytes }), .. }) => {
                if dirty {
                    trace!("writing back dirty mmap page owner={fs_owner:?} vpage={victim_vpage:#x}");
                    self.write_back(file_sector, offset, &buf[..read_bytes as usize])?;
                }
                // Either way the page re-lazies to its file backing rather
                // than going to swap: a clean mmap page already matches the
                // file, and a dirty one was just written back to it.
                Some(SupplementalEntry::Mmap { file_sector, offset, read_bytes, zero_bytes })
            }
            Some(SupplementalEntry::Resident { writable: false, backing: Some(Backing::File { file_sector, offset, read_bytes, zero_bytes }), .. })
                if !dirty =>
            {
                // Clean, read-only file-backed page: just discard, it can
                // be re-faulted from the file later.
                Some(SupplementalEntry::FileBacked { writable: false, file_sector, offset, read_bytes, zero_bytes })
            }
            Some(entry) => {
                let slot = self.swap.write(&buf)?;
                Some(SupplementalEntry::OnSwap { slot, writable: entry.writable() })
            }
            None => None,
        };

        self.pagedir.clear_mapping(victim_owner, victim_vpage);
        self.allocator.free(victim_frame);
        match new_entry {
            Some(e) => self.with_table(victim_owner, |t| t.set(victim_vpage, e)),
            None => self.with_table(victim_owner, |t| {
                t.delete(victim_vpage);
            }),
        }
        Ok(())
    }

    fn write_back(&self, file_sector: u32, offset: u64, data: &[u8]) -> Result<()> {
        let inode = self.fs()?.inodes().open(self.fs()?.cache(), self.fs()?.freemap(), file_sector)?;
        inode.write_at(data, offset)?;
        self.fs()?.inodes().close(inode);
        Ok(())
    }

    /// Set once by [`VirtualMemory::bind_fs`]; demand-paging needs it to
    /// read and write file content.
    fn fs(&self) -> Result<&FileSystem> {
        self.fs_handle.get().map(Arc::as_ref).ok_or(CoreError::NotSupported)
    }

    /// Resolves a page fault at `fault_addr` for `owner`, whose user stack
    /// pointer was `user_sp` at the time of the fault.
    ///
    /// Returns `Ok(true)` if the fault was resolved and the faulting
    /// instruction can be retried, `Ok(false)` if it could not be (the
    /// caller terminates the process).
    pub fn handle_fault(&self, owner: Owner, fault_addr: u64, user_sp: u64) -> Result<bool> {
        let vpage = fault_addr & !(PAGE_SIZE as u64 - 1);
        let existing = self.with_table(owner, |t| t.get(vpage));
        match existing {
            Some(SupplementalEntry::OnSwap { slot, writable }) => {
                let frame = self.get_frame(owner, vpage)?;
                let mut buf = [0u8; PAGE_SIZE];
                self.swap.read(slot, &mut buf)?;
                self.allocator.write(frame, &buf);
                self.pagedir.set_mapping(owner, vpage, frame, perm(writable));
                self.with_table(owner, |t| t.install(vpage, frame, writable, None));
                Ok(true)
            }
            Some(SupplementalEntry::FileBacked { file_sector, offset, read_bytes, zero_bytes, writable }) => {
                let frame = self.get_frame(owner, vpage)?;
                let buf = self.load_demand(file_sector, offset, read_bytes, zero_bytes)?;
                self.allocator.write(frame, &buf);
                self.pagedir.set_mapping(owner, vpage, frame, perm(writable));
                let backing = Some(Backing::File { file_sector, offset, read_bytes, zero_bytes });
                self.with_table(owner, |t| t.install(vpage, frame, writable, backing));
                Ok(true)
            }
            Some(SupplementalEntry::Mmap { file_sector, offset, read_bytes, zero_bytes }) => {
                let frame = self.get_frame(owner, vpage)?;
                let buf = self.load_demand(file_sector, offset, read_bytes, zero_bytes)?;
                self.allocator.write(frame, &buf);
                self.pagedir.set_mapping(owner, vpage, frame, Permission::READ | Permission::WRITE);
                let backing = Some(Backing::Mmap { file_sector, offset, read_bytes, zero_bytes });
                self.with_table(owner, |t| t.install(vpage, frame, true, backing));
                Ok(true)
            }
            Some(SupplementalEntry::Resident { .. }) => {
                warn!("fault on already-resident page owner={owner:?} vpage={vpage:#x}");
                Ok(false)
            }
            None => {
                // Heuristic stack growth: a push instruction may fault up
                // to 32 bytes below the current stack pointer (the reach of
                // the widest `push`-like instruction) before the page it
                // targets has ever been touched.
                if fault_addr >= user_sp.saturating_sub(32) {
                    let frame = self.get_frame(owner, vpage)?;
                    self.pagedir.set_mapping(owner, vpage, frame, Permission::READ | Permission::WRITE);
                    self.with_table(owner, |t| t.install(vpage, frame, true, None));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn load_demand(&self, file_sector: u32, offset: u64, read_bytes: u32, zero_bytes: u32) -> Result<[u8; PAGE_SIZE]> {
        let mut buf = [0u8; PAGE_SIZE];
        let fs = self.fs()?;
        let inode = fs.inodes().open(fs.cache(), fs.freemap(), file_sector)?;
        inode.read_at(&mut buf[..read_bytes as usize], offset)?;
        fs.inodes().close(inode);
        let _ = zero_bytes; // already zero in `buf`; kept for callers' bookkeeping
        Ok(buf)
    }

    /// Maps `size` bytes of `file_sector` starting at user virtual page
    /// `start_vpage`. Rolls the whole mapping back if any page collides
    /// with an existing supplemental entry.
    pub fn mmap(&self, owner: Owner, file_sector: u32, start_vpage: u64, size: u64) -> Result<MmapId> {
        let page_count = (size as usize).div_ceil(PAGE_SIZE);
        let mut installed = Vec::with_capacity(page_count);
        for i in 0..page_count {
            let vpage = start_vpage + (i * PAGE_SIZE) as u64;
            if self.with_table(owner, |t| t.contains(vpage)) {
                for v in &installed {
                    self.with_table(owner, |t| {
                        t.delete(*v);
                    });
                }
                return Err(CoreError::MappingExist);
            }
            let offset = (i * PAGE_SIZE) as u64;
            let remaining = size - offset;
            let read_bytes = remaining.min(PAGE_SIZE as u64) as u32;
            let zero_bytes = PAGE_SIZE as u32 - read_bytes;
            self.with_table(owner, |t| t.lazy_install_mmap(vpage, file_sector, offset, read_bytes, zero_bytes));
            installed.push(vpage);
        }
        let id = {
            let mut next = self.next_mmap_id.lock().unwrap();
            let id = MmapId(*next);
            *next += 1;
            id
        };
        self.mmaps.lock().unwrap().insert(id, MmapDescriptor { file_sector, pages: installed });
        Ok(id)
    }

    /// Writes back every dirty resident page of the mapping, frees its
    /// frames and swap slots, and removes its supplemental entries.
    pub fn munmap(&self, owner: Owner, id: MmapId) -> Result<()> {
        let desc = self.mmaps.lock().unwrap().remove(&id).ok_or(CoreError::NoSuchEntry)?;
        for (i, vpage) in desc.pages.iter().enumerate() {
            let entry = self.with_table(owner, |t| t.delete(*vpage));
            let offset = (i * PAGE_SIZE) as u64;
            match entry {
                Some(SupplementalEntry::Resident { frame, .. }) => {
                    if self.pagedir.is_dirty(owner, *vpage) {
                        let mut buf = [0u8; PAGE_SIZE];
                        self.allocator.read(frame, &mut buf);
                        let remaining = (desc.pages.len() as u64 * PAGE_SIZE as u64 - offset).min(PAGE_SIZE as u64);
                        self.write_back(desc.file_sector, offset, &buf[..remaining as usize])?;
                    }
                    self.pagedir.clear_mapping(owner, *vpage);
                    self.frames.remove(frame);
                    self.allocator.free(frame);
                }
                Some(SupplementalEntry::OnSwap { slot, .. }) => {
                    self.swap.delete(slot);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Tears down every supplemental entry `owner` has outstanding: flushes
    /// dirty `mmap` pages back to their files, frees resident frames, and
    /// releases swap slots. Called at process exit.
    pub fn destroy_all(&self, owner: Owner) -> Result<()> {
        let vpages = self.with_table(owner, |t| t.vpages());
        for vpage in vpages {
            let entry = self.with_table(owner, |t| t.delete(vpage));
            match entry {
                Some(SupplementalEntry::Resident { frame, .. }) => {
                    self.pagedir.clear_mapping(owner, vpage);
                    self.frames.remove(frame);
                    self.allocator.free(frame);
                }
                Some(SupplementalEntry::OnSwap { slot, .. }) => {
                    self.swap.delete(slot);
                }
                _ => {}
            }
        }
        self.supplemental.lock().unwrap().remove(&owner);
        Ok(())
    }
}

fn perm(writable: bool) -> Permission {
    if writable {
        Permission::READ | Permission::WRITE
    } else {
        Permission::READ
    }
}

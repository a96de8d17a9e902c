//! Persistence and virtual-memory core for a small teaching operating
//! system: a sector buffer cache, an indexed on-disk inode filesystem, and
//! a demand-paged VM subsystem.
//!
//! The thread scheduler, ELF loader, trap/syscall dispatch, raw disk
//! driver, physical page allocator, and hardware page directory are all
//! external collaborators in a real kernel. This crate defines the three
//! interfaces where it touches them — [`device::BlockDevice`],
//! [`hal::PageAllocator`], [`hal::PageDirectory`] — and is otherwise an
//! ordinary `std` library, testable without any of that surrounding
//! machinery.

pub mod cache;
pub mod device;
pub mod error;
pub mod fs;
pub mod hal;
pub mod vm;

pub use cache::{BufferCache, CacheConfig};
pub use device::{BlockDevice, MemBlockDevice, SECTOR_SIZE};
pub use error::{CoreError, Result};
pub use fs::FileSystem;
pub use hal::{Frame, Owner, PageAllocator, PageDirectory, Permission, TestPageAllocator, TestPageDirectory, PAGE_SIZE};
pub use vm::supplemental::SupplementalEntry;
pub use vm::{MmapId, VirtualMemory};

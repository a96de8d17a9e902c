//! The directory layer (component C5): a directory is an inode whose
//! payload is a dense array of fixed-size entries.
//!
//! Path tokenization (`/`, leading-root, `.`/`..` segment resolution) is the
//! shell/loader's job, not this layer's — only single-name `add`/`remove`/
//! `lookup` within one already-open directory live here. `.` and `..` are
//! still written automatically at directory creation, since those are data
//! entries, not resolved paths.

use std::sync::Arc;

use crate::cache::BufferCache;
use crate::error::{CoreError, Result};
use crate::fs::freemap::FreeMap;
use crate::fs::inode::{Inode, InodeTable};
use crate::fs::layout::{RawDirEntry, ENTRIES_PER_SECTOR};

/// A directory: an open inode known to hold directory-entry data.
pub struct Directory {
    inode: Arc<Inode>,
}

impl Directory {
    /// Wraps an already-open directory inode. Returns
    /// [`CoreError::NotDirectory`] if the inode isn't one.
    pub fn new(inode: Arc<Inode>) -> Result<Self> {
        if !inode.is_dir() {
            return Err(CoreError::NotDirectory);
        }
        Ok(Self { inode })
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    fn entry_count(&self) -> usize {
        (self.inode.length() as usize) / core::mem::size_of::<RawDirEntry>()
    }

    fn read_entry(&self, idx: usize) -> Result<RawDirEntry> {
        let mut bytes = [0u8; 16];
        self.inode.read_at(&mut bytes, (idx * 16) as u64)?;
        Ok(RawDirEntry::from_bytes(&bytes))
    }

    fn write_entry(&self, idx: usize, entry: RawDirEntry) -> Result<()> {
        self.inode.write_at(&entry.to_bytes(), (idx * 16) as u64)?;
        Ok(())
    }

    /// Creates a fresh directory inode at `sector`, wires up its `.` and
    /// `..` entries, and registers `sector` as a child of `parent_sector`
    /// (the caller is expected to add an entry for it in the parent).
    pub fn format(
        table: &InodeTable,
        cache: &Arc<BufferCache>,
        freemap: &Arc<FreeMap>,
        sector: u32,
        parent_sector: u32,
    ) -> Result<Self> {
        table.create(cache, freemap, sector, 0, true, parent_sector)?;
        let inode = table.open(cache, freemap, sector)?;
        let dir = Self { inode };
        dir.add(".", sector)?;
        dir.add("..", parent_sector)?;
        Ok(dir)
    }

    /// Linear scan for `name`, returning its inode sector if present.
    pub fn lookup(&self, name: &str) -> Result<Option<u32>> {
        for idx in 0..self.entry_count() {
            let entry = self.read_entry(idx)?;
            if entry.in_use() && entry.name() == name {
                return Ok(Some(entry.inode_sector));
            }
        }
        Ok(None)
    }

    /// Writes a new entry mapping `name` to `inode_sector`, reusing the
    /// first free (never-used or removed) slot, or appending past the end.
    pub fn add(&self, name: &str, inode_sector: u32) -> Result<()> {
        if self.lookup(name)?.is_some() {
            return Err(CoreError::FileExist);
        }
        let entry = RawDirEntry::new(name, inode_sector).ok_or(CoreError::NameTooLong)?;
        for idx in 0..self.entry_count() {
            if !self.read_entry(idx)?.in_use() {
                return self.write_entry(idx, entry);
            }
        }
        self.write_entry(self.entry_count(), entry)
    }

    /// Clears the `in_use` flag for `name`. Refuses with
    /// [`CoreError::DirectoryNotEmpty`] if `name` is itself a non-empty
    /// subdirectory (only `.` and `..` remaining counts as empty).
    pub fn remove(&self, table: &InodeTable, cache: &Arc<BufferCache>, freemap: &Arc<FreeMap>, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(CoreError::InvalidArgument);
        }
        for idx in 0..self.entry_count() {
            let entry = self.read_entry(idx)?;
            if entry.in_use() && entry.name() == name {
                let child = table.open(cache, freemap, entry.inode_sector)?;
                if child.is_dir() {
                    let child_dir = Directory::new(child.clone())?;
                    if child_dir.entry_count_in_use()? > 2 {
                        table.close(child);
                        return Err(CoreError::DirectoryNotEmpty);
                    }
                }
                table.mark_removed(&child);
                table.close(child);
                self.write_entry(idx, RawDirEntry::EMPTY)?;
                return Ok(());
            }
        }
        Err(CoreError::NoSuchEntry)
    }

    fn entry_count_in_use(&self) -> Result<usize> {
        let mut n = 0;
        for idx in 0..self.entry_count() {
            if self.read_entry(idx)?.in_use() {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Names of every live entry, for `readdir`. Order matches on-disk slot
    /// order, which is not alphabetical.
    pub fn names(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for idx in 0..self.entry_count() {
            let entry = self.read_entry(idx)?;
            if entry.in_use() {
                out.push(entry.name().to_string());
            }
        }
        Ok(out)
    }
}

/// Resolves a `/`-separated path from `root` by repeated single-name
/// `lookup`, walking into each intermediate directory along the way.
/// Leading and repeated `/` are ignored; an empty path resolves to `root`
/// itself. This exists only to exercise `lookup`/`add`/`remove` end-to-end
/// across nested directories in tests — it is not a general shell and does
/// not resolve `.`/`..` specially, since those are ordinary entries already
/// written by [`Directory::format`].
pub fn resolve_path(table: &InodeTable, cache: &Arc<BufferCache>, freemap: &Arc<FreeMap>, root: &Directory, path: &str) -> Result<Option<u32>> {
    let mut current_sector = root.inode().sector();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let dir_inode = table.open(cache, freemap, current_sector)?;
        let dir = match Directory::new(dir_inode.clone()) {
            Ok(dir) => dir,
            Err(err) => {
                table.close(dir_inode);
                return Err(err);
            }
        };
        let next = dir.lookup(segment)?;
        table.close(dir_inode);
        match next {
            Some(sector) => current_sector = sector,
            None => return Ok(None),
        }
    }
    Ok(Some(current_sector))
}

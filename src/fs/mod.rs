//! Filesystem core: free-sector map (C3), indexed inode layer (C4), and
//! directory layer (C5) wired together over a [`BufferCache`].

pub mod directory;
pub mod freemap;
pub mod inode;
pub mod layout;

use std::sync::Arc;

use crate::cache::BufferCache;
use crate::error::Result;
use directory::Directory;
use freemap::FreeMap;
use inode::InodeTable;
use layout::ROOT_DIR_SECTOR;

/// Ties the free map and open-inode table to one buffer cache, and owns the
/// root directory's sector. A real kernel holds one of these per mounted
/// device; the test suite in this crate mounts exactly one in-memory
/// device per test.
pub struct FileSystem {
    cache: Arc<BufferCache>,
    freemap: Arc<FreeMap>,
    inodes: InodeTable,
}

impl FileSystem {
    /// Formats a brand new filesystem over `cache`'s device: builds an empty
    /// free map and a root directory at [`ROOT_DIR_SECTOR`].
    pub fn format(cache: Arc<BufferCache>, sector_count: u32) -> Result<Self> {
        let freemap = Arc::new(FreeMap::format(sector_count));
        let inodes = InodeTable::new();
        Directory::format(&inodes, &cache, &freemap, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR)?;
        freemap.store(&cache)?;
        Ok(Self { cache, freemap, inodes })
    }

    /// Mounts a filesystem previously formatted and flushed to `cache`'s
    /// device, reloading the free map from its persisted sectors.
    pub fn mount(cache: Arc<BufferCache>, sector_count: u32) -> Result<Self> {
        let freemap = Arc::new(FreeMap::load(&cache, sector_count)?);
        let inodes = InodeTable::new();
        Ok(Self { cache, freemap, inodes })
    }

    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    pub fn freemap(&self) -> &Arc<FreeMap> {
        &self.freemap
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    /// Opens the root directory.
    pub fn root(&self) -> Result<Directory> {
        let inode = self.inodes.open(&self.cache, &self.freemap, ROOT_DIR_SECTOR)?;
        Directory::new(inode)
    }

    /// Creates a plain file of `length` bytes inside `parent`, entering it
    /// under `name`.
    pub fn create_file(&self, parent: &Directory, name: &str, length: u64) -> Result<u32> {
        let sector = self.freemap.allocate(1)?;
        if let Err(err) = self.inodes.create(&self.cache, &self.freemap, sector, length, false, parent.inode().sector()) {
            self.freemap.release(sector, 1);
            return Err(err);
        }
        if let Err(err) = parent.add(name, sector) {
            self.freemap.release(sector, 1);
            return Err(err);
        }
        Ok(sector)
    }

    /// Creates a subdirectory of `parent` named `name`.
    pub fn create_dir(&self, parent: &Directory, name: &str) -> Result<Directory> {
        let sector = self.freemap.allocate(1)?;
        let dir = match Directory::format(&self.inodes, &self.cache, &self.freemap, sector, parent.inode().sector()) {
            Ok(d) => d,
            Err(err) => {
                self.freemap.release(sector, 1);
                return Err(err);
            }
        };
        if let Err(err) = parent.add(name, sector) {
            self.freemap.release(sector, 1);
            return Err(err);
        }
        Ok(dir)
    }

    /// Persists the free map; callers flush the cache separately via
    /// [`BufferCache::shutdown`].
    pub fn sync(&self) -> Result<()> {
        self.freemap.store(&self.cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::device::MemBlockDevice;

    fn fresh_fs(sectors: u32) -> FileSystem {
        let dev = Arc::new(MemBlockDevice::new(sectors));
        let cache = Arc::new(BufferCache::init(dev, CacheConfig { capacity: 32, ..Default::default() }));
        FileSystem::format(cache, sectors).unwrap()
    }

    #[test]
    fn create_open_close_remove_restores_free_count() {
        let fs = fresh_fs(512);
        let before = fs.freemap().free_count();
        let root = fs.root().unwrap();
        let sector = fs.create_file(&root, "note.txt", 0).unwrap();
        let inode = fs.inodes().open(fs.cache(), fs.freemap(), sector).unwrap();
        fs.inodes().close(inode);
        root.remove(fs.inodes(), fs.cache(), fs.freemap(), "note.txt").unwrap();
        assert_eq!(fs.freemap().free_count(), before);
    }

    #[test]
    fn nested_directories_resolve_parent_sector() {
        let fs = fresh_fs(512);
        let root = fs.root().unwrap();
        let sub = fs.create_dir(&root, "sub").unwrap();
        assert_eq!(sub.inode().parent_sector(), root.inode().sector());
    }
}

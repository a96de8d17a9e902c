//! Literal end-to-end scenarios exercising the cache, inode, and VM layers
//! together through the public API.

use std::sync::{Arc, Barrier};
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use corefs::{
    BufferCache, CacheConfig, FileSystem, MemBlockDevice, Owner, PageAllocator, SupplementalEntry,
    TestPageAllocator, TestPageDirectory, VirtualMemory, PAGE_SIZE,
};

fn format_fs(sectors: u32) -> (Arc<MemBlockDevice>, Arc<FileSystem>) {
    let _ = env_logger::try_init();
    let dev = Arc::new(MemBlockDevice::new(sectors));
    let cache = Arc::new(BufferCache::init(dev.clone(), CacheConfig::default()));
    let fs = Arc::new(FileSystem::format(cache, sectors).unwrap());
    (dev, fs)
}

#[test]
fn cache_hit_then_seven_hits_on_reread() {
    let (dev, fs) = format_fs(256);
    let root = fs.root().unwrap();
    let sector = fs.create_file(&root, "a.bin", 4096).unwrap();
    let inode = fs.inodes().open(fs.cache(), fs.freemap(), sector).unwrap();
    inode.write_at(&[0xAAu8; 4096], 0).unwrap();
    fs.inodes().close(inode);
    fs.sync().unwrap();

    // Reboot: mount a fresh cache over the same device ("from cold").
    let cache = Arc::new(BufferCache::init(dev.clone(), CacheConfig::default()));
    let fs = FileSystem::mount(cache.clone(), 256).unwrap();
    let baseline = dev.read_count();

    let inode = fs.inodes().open(fs.cache(), fs.freemap(), sector).unwrap();
    let mut byte = [0u8; 1];
    for _ in 0..8 {
        inode.read_at(&mut byte, 0).unwrap();
        assert_eq!(byte[0], 0xAA);
    }
    fs.inodes().close(inode);

    assert_eq!(dev.read_count() - baseline, 1);
}

#[test]
fn write_back_on_shutdown_survives_reboot() {
    let (dev, fs) = format_fs(256);
    let root = fs.root().unwrap();
    let sector = fs.create_file(&root, "note.txt", 0).unwrap();
    let inode = fs.inodes().open(fs.cache(), fs.freemap(), sector).unwrap();
    inode.write_at(b"hello", 100).unwrap();
    fs.inodes().close(inode);
    fs.sync().unwrap();

    // shutdown() flushes every dirty slot and joins the background threads;
    // it takes &self so it can be called straight through the shared Arc.
    fs.cache().shutdown().unwrap();

    let cache = Arc::new(BufferCache::init(dev, CacheConfig::default()));
    let fs = FileSystem::mount(cache, 256).unwrap();
    let inode = fs.inodes().open(fs.cache(), fs.freemap(), sector).unwrap();
    let mut buf = [0u8; 5];
    inode.read_at(&mut buf, 100).unwrap();
    assert_eq!(&buf, b"hello");
}

#[test]
fn file_growth_zero_fills_and_updates_length() {
    let (_dev, fs) = format_fs(512);
    let root = fs.root().unwrap();
    let sector = fs.create_file(&root, "grown.bin", 0).unwrap();
    let inode = fs.inodes().open(fs.cache(), fs.freemap(), sector).unwrap();

    let payload = vec![0x5Au8; 8193];
    assert_eq!(inode.write_at(&payload, 0).unwrap(), 8193);
    assert_eq!(inode.length(), 8193);

    let mut byte = [0u8; 1];
    inode.read_at(&mut byte, 600).unwrap();
    assert_eq!(byte[0], 0x5A);
    inode.read_at(&mut byte, 8192).unwrap();
    assert_eq!(byte[0], 0x5A);
}

#[test]
fn concurrent_readers_never_observe_torn_content() {
    let (_dev, fs) = format_fs(1024);
    let root = fs.root().unwrap();
    let sector = fs.create_file(&root, "shared.bin", 0).unwrap();
    let inode = fs.inodes().open(fs.cache(), fs.freemap(), sector).unwrap();
    let content: Vec<u8> = (0..65536).map(|i| (i % 251) as u8).collect();
    inode.write_at(&content, 0).unwrap();
    fs.inodes().close(inode);

    let threads = 8;
    let reads_per_thread = 500;
    let barrier = Arc::new(Barrier::new(threads));
    let content = Arc::new(content);
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let fs = fs.clone();
            let barrier = barrier.clone();
            let content = content.clone();
            thread::spawn(move || {
                let inode = fs.inodes().open(fs.cache(), fs.freemap(), sector).unwrap();
                barrier.wait();
                let mut rng = StdRng::seed_from_u64(t as u64);
                let mut byte = [0u8; 1];
                for _ in 0..reads_per_thread {
                    let offset = rng.gen_range(0..65536u64);
                    inode.read_at(&mut byte, offset).unwrap();
                    assert_eq!(byte[0], content[offset as usize]);
                }
                fs.inodes().close(inode);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn stack_growth_exact_offsets() {
    let allocator = Arc::new(TestPageAllocator::new(4));
    let pagedir = Arc::new(TestPageDirectory::new());
    let swap_device = Arc::new(MemBlockDevice::new(64));
    let vm = VirtualMemory::new(allocator, pagedir, swap_device);

    let owner = Owner(1);
    let user_sp = 0xBFFF_FE00u64;

    // 28 bytes below SP: within the widest push instruction's reach.
    assert!(vm.handle_fault(owner, 0xBFFF_FDFC, user_sp).unwrap());

    // 260 bytes below SP, with no supplemental entry backing it: refused.
    assert!(!vm.handle_fault(owner, 0xBFFF_FCFC, user_sp).unwrap());
}

#[test]
fn mmap_round_trip_through_munmap_and_reopen() {
    let (_dev, fs) = format_fs(512);
    let root = fs.root().unwrap();
    let sector = fs.create_file(&root, "mapped.bin", 6144).unwrap();

    let allocator = Arc::new(TestPageAllocator::new(4));
    let pagedir = Arc::new(TestPageDirectory::new());
    let swap_device = Arc::new(MemBlockDevice::new(64));
    let vm = VirtualMemory::new(allocator.clone(), pagedir.clone(), swap_device);
    vm.bind_fs(fs.clone());

    let owner = Owner(2);
    let base_vpage = 0x7000_0000u64;
    let id = vm.mmap(owner, sector, base_vpage, 6144).unwrap();

    let write_offset = 3000u64;
    let vpage = base_vpage + (write_offset / PAGE_SIZE as u64) * PAGE_SIZE as u64;
    assert!(vm.handle_fault(owner, vpage, 0).unwrap());

    let frame = match vm.get_supplemental(owner, vpage) {
        Some(SupplementalEntry::Resident { frame, .. }) => frame,
        other => panic!("expected resident entry, got {other:?}"),
    };
    let mut page = [0u8; PAGE_SIZE];
    allocator.read(frame, &mut page);
    page[(write_offset % PAGE_SIZE as u64) as usize] = 0xFF;
    allocator.write(frame, &page);
    pagedir.mark_dirty(owner, vpage);

    vm.munmap(owner, id).unwrap();

    let inode = fs.inodes().open(fs.cache(), fs.freemap(), sector).unwrap();
    let mut byte = [0u8; 1];
    inode.read_at(&mut byte, write_offset).unwrap();
    assert_eq!(byte[0], 0xFF);
}

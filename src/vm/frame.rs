//! The frame table (component C7): every user-pool physical page currently
//! handed out, keyed by physical frame, with clock-hand (second-chance)
//! eviction over a persistent cursor.

use std::sync::Mutex;

use crate::hal::{Frame, Owner, PageDirectory};

#[derive(Clone, Copy)]
struct FrameEntry {
    frame: Frame,
    owner: Owner,
    vpage: u64,
}

struct Inner {
    entries: Vec<FrameEntry>,
    cursor: usize,
}

/// Tracks the frame → (owner, virtual page) mapping for every resident
/// user page, and selects an eviction victim by a single clock hand swept
/// across the entries in insertion order.
pub struct FrameTable {
    inner: Mutex<Inner>,
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { entries: Vec::new(), cursor: 0 }) }
    }

    /// Records a newly allocated frame belonging to `owner`'s `vpage`.
    pub fn add(&self, frame: Frame, owner: Owner, vpage: u64) {
        self.inner.lock().unwrap().entries.push(FrameEntry { frame, owner, vpage });
    }

    /// Returns the owner and virtual page a frame is currently mapped to.
    pub fn get(&self, frame: Frame) -> Option<(Owner, u64)> {
        self.inner.lock().unwrap().entries.iter().find(|e| e.frame == frame).map(|e| (e.owner, e.vpage))
    }

    /// Removes a frame from the table, e.g. once it has been freed back to
    /// the allocator.
    pub fn remove(&self, frame: Frame) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.entries.iter().position(|e| e.frame == frame) {
            inner.entries.remove(pos);
            if inner.cursor > pos {
                inner.cursor -= 1;
            }
        }
    }

    /// Sweeps the clock hand for the first entry whose hardware accessed
    /// bit is clear, clearing the bit on every entry it passes over and
    /// wrapping around at most once. Returns `None` only when the table is
    /// empty.
    pub fn evict_victim(&self, pagedir: &dyn PageDirectory) -> Option<(Frame, Owner, u64)> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.entries.len();
        if len == 0 {
            return None;
        }
        for _ in 0..=len {
            if inner.cursor >= len {
                inner.cursor = 0;
            }
            let idx = inner.cursor;
            let entry = inner.entries[idx];
            if pagedir.is_accessed(entry.owner, entry.vpage) {
                pagedir.set_accessed(entry.owner, entry.vpage, false);
                inner.cursor += 1;
            } else {
                inner.entries.remove(idx);
                return Some((entry.frame, entry.owner, entry.vpage));
            }
        }
        // Every entry had its accessed bit set and has now been cleared;
        // take the one the cursor currently points at as the victim.
        let idx = inner.cursor % len;
        let entry = inner.entries.remove(idx);
        Some((entry.frame, entry.owner, entry.vpage))
    }

    pub fn resident_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::TestPageDirectory;

    #[test]
    fn evicts_the_entry_with_accessed_bit_clear() {
        let table = FrameTable::new();
        let dir = TestPageDirectory::new();
        let owner = Owner(1);
        dir.set_mapping(owner, 0x1000, Frame(0), crate::hal::Permission::READ);
        dir.set_mapping(owner, 0x2000, Frame(1), crate::hal::Permission::READ);
        dir.set_accessed(owner, 0x1000, true);
        dir.set_accessed(owner, 0x2000, false);
        table.add(Frame(0), owner, 0x1000);
        table.add(Frame(1), owner, 0x2000);

        let (frame, _, vpage) = table.evict_victim(&dir).unwrap();
        assert_eq!(frame, Frame(1));
        assert_eq!(vpage, 0x2000);
        assert_eq!(table.resident_count(), 1);
    }

    #[test]
    fn second_chance_clears_accessed_bits_before_wrapping() {
        let table = FrameTable::new();
        let dir = TestPageDirectory::new();
        let owner = Owner(1);
        dir.set_mapping(owner, 0x1000, Frame(0), crate::hal::Permission::READ);
        dir.set_accessed(owner, 0x1000, true);
        table.add(Frame(0), owner, 0x1000);

        let (frame, _, _) = table.evict_victim(&dir).unwrap();
        assert_eq!(frame, Frame(0));
    }
}

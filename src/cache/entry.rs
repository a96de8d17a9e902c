//! The per-entry reader/writer/evict lock.
//!
//! Grounded on the hand-rolled `RwLock` in the teacher's `keos::sync` module
//! (`UnsafeCell` + a small state struct guarded by a `Mutex`, with condition
//! variables standing in for the teacher's semaphore-based parking): this
//! crate needs a third mode beyond read/write, since eviction must exclude
//! both readers and writers of the *current* contents while it writes the
//! block back and before it is free to be reassigned to a new sector.
//!
//! The cache-wide lock (see [`super::BufferCache`]) serializes which entry a
//! sector maps to; this lock serializes access to one entry's content once
//! found. Dropping the cache-wide lock before acquiring this one opens the
//! victim-flag race described in the cache module: a caller must recheck the
//! entry's sector and victim flag after acquiring either guard here and retry
//! `get_block` on mismatch.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct State {
    readers: u32,
    writer: bool,
    evictor: bool,
}

impl State {
    fn read_available(&self) -> bool {
        !self.writer && !self.evictor
    }

    fn exclusive_available(&self) -> bool {
        self.readers == 0 && !self.writer && !self.evictor
    }
}

/// A lock with three mutually exclusive modes: shared read, exclusive write,
/// and exclusive evict. Write and evict are both exclusive against readers
/// and each other; the distinction exists only so callers can name intent
/// (`write` for ordinary content mutation, `evict` for the writeback-then-
/// reassign sequence).
pub struct EntryRwLock<T> {
    state: Mutex<State>,
    cv: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever handed out through a guard obtained
// while holding `state`, and the guard types enforce the read/write/evict
// exclusion the state machine promises.
unsafe impl<T: Send> Send for EntryRwLock<T> {}
unsafe impl<T: Send> Sync for EntryRwLock<T> {}

impl<T> EntryRwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(State::default()),
            cv: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn read(&self) -> EntryReadGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while !state.read_available() {
            state = self.cv.wait(state).unwrap();
        }
        state.readers += 1;
        EntryReadGuard { lock: self }
    }

    pub fn write(&self) -> EntryWriteGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while !state.exclusive_available() {
            state = self.cv.wait(state).unwrap();
        }
        state.writer = true;
        EntryWriteGuard { lock: self }
    }

    pub fn evict(&self) -> EntryEvictGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while !state.exclusive_available() {
            state = self.cv.wait(state).unwrap();
        }
        state.evictor = true;
        EntryEvictGuard { lock: self }
    }

    /// Attempts to acquire the evict mode without blocking; used by the
    /// eviction scan so it never waits behind an in-flight reader or writer
    /// for an entry it might skip in favor of another victim.
    pub fn try_evict(&self) -> Option<EntryEvictGuard<'_, T>> {
        let mut state = self.state.lock().unwrap();
        if state.exclusive_available() {
            state.evictor = true;
            Some(EntryEvictGuard { lock: self })
        } else {
            None
        }
    }

    /// Attempts to acquire the write mode without blocking; used by the
    /// periodic flush so it skips a slot currently held by a reader, writer,
    /// or evictor rather than stalling behind it.
    pub fn try_write(&self) -> Option<EntryWriteGuard<'_, T>> {
        let mut state = self.state.lock().unwrap();
        if state.exclusive_available() {
            state.writer = true;
            Some(EntryWriteGuard { lock: self })
        } else {
            None
        }
    }
}

pub struct EntryReadGuard<'a, T> {
    lock: &'a EntryRwLock<T>,
}

impl<T> Deref for EntryReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: readers is > 0 and no writer/evictor holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for EntryReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.readers -= 1;
        if state.readers == 0 {
            self.lock.cv.notify_all();
        }
    }
}

pub struct EntryWriteGuard<'a, T> {
    lock: &'a EntryRwLock<T>,
}

impl<T> Deref for EntryWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for EntryWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for EntryWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.writer = false;
        self.lock.cv.notify_all();
    }
}

pub struct EntryEvictGuard<'a, T> {
    lock: &'a EntryRwLock<T>,
}

impl<T> Deref for EntryEvictGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for EntryEvictGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for EntryEvictGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.evictor = false;
        self.lock.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_run_concurrently() {
        let lock = Arc::new(EntryRwLock::new(0u32));
        let g1 = lock.read();
        let g2 = lock.read();
        assert_eq!(*g1, 0);
        assert_eq!(*g2, 0);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(EntryRwLock::new(0u32));
        {
            let mut w = lock.write();
            *w = 7;
        }
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn try_evict_fails_while_read_held() {
        let lock = EntryRwLock::new(0u32);
        let _r = lock.read();
        assert!(lock.try_evict().is_none());
    }

    #[test]
    fn try_write_fails_while_read_held_and_succeeds_once_free() {
        let lock = EntryRwLock::new(0u32);
        let r = lock.read();
        assert!(lock.try_write().is_none());
        drop(r);
        let mut w = lock.try_write().unwrap();
        *w = 5;
        drop(w);
        assert_eq!(*lock.read(), 5);
    }

    #[test]
    fn evict_then_write_round_trips() {
        let lock = Arc::new(EntryRwLock::new(1u32));
        let lock2 = lock.clone();
        let handle = thread::spawn(move || {
            let mut e = lock2.evict();
            *e = 2;
        });
        handle.join().unwrap();
        assert_eq!(*lock.read(), 2);
    }
}

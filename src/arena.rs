//! Interface to the raw memory arena that pages and big objects come from
//!
//! The slab allocator never talks to the operating system directly. Whole
//! pages and big objects are requested from a `MemoryArena`, which is also
//! notified whenever a block changes hands inside of a page, so that debug
//! builds can detect use-after-free and double-free bugs.

use crate::WORD;

use std::{
    alloc::{self, Layout},
    ptr::{self, NonNull},
};


/// Byte pattern written over free blocks in debug builds
pub const POISON_BYTE: u8 = 0xDF;


/// Raw byte-range allocation primitive
///
/// An arena is shared by every thread-local allocator of a heap, so it must be
/// usable from several threads at once. Any internal locking that this
/// requires is the arena's own business.
pub trait MemoryArena: Send + Sync {
    /// Allocate `size` bytes aligned on a machine word
    ///
    /// Returns `None` if the arena is out of memory. The contents of the
    /// returned range are unspecified, callers must not expect zeroes.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Signal that `size` bytes at `ptr` were handed over to a client
    ///
    /// This is debug-mode bookkeeping, which optimized builds may skip.
    fn mark_in_use(&self, _ptr: NonNull<u8>, _size: usize) {}

    /// Signal that `size` bytes at `ptr` were given back by a client
    ///
    /// This is debug-mode bookkeeping, which optimized builds may skip.
    fn mark_free(&self, _ptr: NonNull<u8>, _size: usize) {}

    /// Return a range of `size` bytes to the system
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate(size)` on this arena, and
    /// must not be released twice or used after this call.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

/// Arenas may be shared by several heaps through a reference
impl<A: MemoryArena + ?Sized> MemoryArena for &A {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        (**self).allocate(size)
    }

    fn mark_in_use(&self, ptr: NonNull<u8>, size: usize) {
        (**self).mark_in_use(ptr, size)
    }

    fn mark_free(&self, ptr: NonNull<u8>, size: usize) {
        (**self).mark_free(ptr, size)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        (**self).release(ptr, size)
    }
}


/// Memory arena backed by the global Rust allocator
///
/// In debug builds, this arena poisons blocks as they are freed, and poisons
/// the stale free list link of blocks as they are handed out again, so that
/// dangling accesses read an easily recognizable pattern.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemArena;

impl SystemArena {
    /// Layout of a range of `size` bytes, as handed out by this arena
    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, WORD).ok()
    }
}

impl MemoryArena for SystemArena {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        debug_assert_ne!(size, 0, "Zero-sized arena requests are not supported");
        let layout = Self::layout(size)?;

        // This is safe because the layout has a nonzero size, as checked above
        // and by every caller in this crate.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    fn mark_in_use(&self, ptr: NonNull<u8>, size: usize) {
        if cfg!(debug_assertions) {
            // Everything but the free list link was poisoned when the block
            // was freed, and nobody should have touched it since. This is safe
            // because every block is at least one word long, and exclusively
            // owned by the caller at this point.
            unsafe {
                let body = NonNull::new_unchecked(ptr.as_ptr().add(WORD));
                assert!(is_poisoned(body, size.saturating_sub(WORD)),
                        "Free block at {:p} was written to after being freed",
                        ptr);
                ptr::write_bytes(ptr.as_ptr(), POISON_BYTE, size.min(WORD));
            }
        }
    }

    fn mark_free(&self, ptr: NonNull<u8>, size: usize) {
        if cfg!(debug_assertions) {
            // This is safe because the caller passes the full extent of a block
            // that it exclusively owns and no longer uses.
            unsafe { ptr::write_bytes(ptr.as_ptr(), POISON_BYTE, size); }
        }
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        let layout = Self::layout(size)
                         .expect("Released range was not allocated by us");
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}


/// Check that a range of memory still contains nothing but poison bytes
///
/// # Safety
///
/// `ptr` must be valid for reads of `size` bytes.
pub unsafe fn is_poisoned(ptr: NonNull<u8>, size: usize) -> bool {
    std::slice::from_raw_parts(ptr.as_ptr(), size)
        .iter()
        .all(|&byte| byte == POISON_BYTE)
}


/// Arena wrapper used by tests to observe and disturb arena traffic
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    /// System arena which counts requests and can be told to run dry
    #[derive(Debug, Default)]
    pub struct CountingArena {
        allocations: AtomicUsize,
        releases: AtomicUsize,
        allocated_bytes: AtomicUsize,
        remaining_successes: AtomicUsize,
    }

    impl CountingArena {
        /// Counting arena which never fails
        pub fn new() -> Self {
            Self::failing_after(usize::MAX)
        }

        /// Counting arena which fails every request after `successes` of them
        /// were served
        pub fn failing_after(successes: usize) -> Self {
            Self {
                remaining_successes: AtomicUsize::new(successes),
                ..Self::default()
            }
        }

        /// Number of successful `allocate` calls so far
        pub fn allocations(&self) -> usize {
            self.allocations.load(Ordering::Relaxed)
        }

        /// Number of `release` calls so far
        pub fn releases(&self) -> usize {
            self.releases.load(Ordering::Relaxed)
        }

        /// Total bytes handed out by successful `allocate` calls so far
        pub fn allocated_bytes(&self) -> usize {
            self.allocated_bytes.load(Ordering::Relaxed)
        }

        /// Let `successes` more requests through before failing again
        pub fn refill(&self, successes: usize) {
            self.remaining_successes.store(successes, Ordering::Relaxed);
        }
    }

    impl MemoryArena for CountingArena {
        fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
            let granted = self.remaining_successes
                              .fetch_update(Ordering::Relaxed,
                                            Ordering::Relaxed,
                                            |left| left.checked_sub(1))
                              .is_ok();
            if !granted {
                return None;
            }
            let ptr = SystemArena.allocate(size)?;
            self.allocations.fetch_add(1, Ordering::Relaxed);
            self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
            Some(ptr)
        }

        fn mark_in_use(&self, ptr: NonNull<u8>, size: usize) {
            SystemArena.mark_in_use(ptr, size)
        }

        fn mark_free(&self, ptr: NonNull<u8>, size: usize) {
            SystemArena.mark_free(ptr, size)
        }

        unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
            self.releases.fetch_add(1, Ordering::Relaxed);
            SystemArena.release(ptr, size)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::CountingArena, *};

    #[test]
    fn system_arena_round_trip() {
        let arena = SystemArena;
        let ptr = arena.allocate(4 * WORD).unwrap();
        assert_eq!(ptr.as_ptr() as usize % WORD, 0);

        // Poisoning is only performed in debug builds
        arena.mark_free(ptr, 4 * WORD);
        if cfg!(debug_assertions) {
            assert!(unsafe { is_poisoned(ptr, 4 * WORD) });
        }
        unsafe { ptr.as_ptr().cast::<usize>().write(0); }
        arena.mark_in_use(ptr, 4 * WORD);
        if cfg!(debug_assertions) {
            assert!(unsafe { is_poisoned(ptr, 4 * WORD) });
        }

        unsafe { arena.release(ptr, 4 * WORD) };
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "written to after being freed"))]
    fn write_after_free_is_caught_in_debug_builds() {
        let arena = SystemArena;
        let ptr = arena.allocate(4 * WORD).unwrap();
        arena.mark_free(ptr, 4 * WORD);
        unsafe { ptr.as_ptr().add(3 * WORD).write(42); }
        arena.mark_in_use(ptr, 4 * WORD);
        unsafe { arena.release(ptr, 4 * WORD) };
    }

    #[test]
    fn counting_arena_runs_dry() {
        let arena = CountingArena::failing_after(1);
        let ptr = arena.allocate(WORD).unwrap();
        assert!(arena.allocate(WORD).is_none());
        assert_eq!(arena.allocations(), 1);
        assert_eq!(arena.allocated_bytes(), WORD);

        arena.refill(1);
        let other = arena.allocate(WORD).unwrap();
        unsafe {
            arena.release(ptr, WORD);
            arena.release(other, WORD);
        }
        assert_eq!(arena.allocations(), 2);
        assert_eq!(arena.releases(), 2);
    }
}

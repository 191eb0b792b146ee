//! This crate provides the small object allocator of a garbage-collected heap
//! that is shared by several threads, where each thread allocates from memory
//! that it owns privately, so that the allocation fast path needs neither a
//! lock nor an atomic operation.
//!
//! # Slab allocation primer
//!
//! Objects are sorted into **size classes** by their size, header included.
//! Size class `n` serves objects of `(n-1) * WORD + 1` to `n * WORD` bytes,
//! so no object ever wastes more than one machine word, and finding the class
//! of an object is a single rounded division. Objects above a configurable
//! **small object threshold** are **big objects**, which are requested from
//! the underlying memory arena one by one.
//!
//! Small objects are carved from **pages**, fixed-size chunks of memory that
//! start with a short header. The remainder of a page is cut into equally
//! sized **blocks** of a single size class. A thread-local allocator keeps one
//! list of free blocks per size class, threaded through the free blocks
//! themselves, and only requests a new page from the arena when that list
//! runs dry.
//!
//! The heap-wide **shared area** holds the configuration, which every thread
//! reads without synchronization, and a lock-protected pool of pages with low
//! usage, which is how pages move from one thread to another.
//!
//! # Example
//!
//! ```
//! use gcslab::{HeaderWords, SharedArea, ThreadLocalAllocator, WORD};
//!
//! let area = SharedArea::builder().build().unwrap();
//! let mut allocator = ThreadLocalAllocator::<_, HeaderWords>::new(&area);
//!
//! // Allocate an object of 4 words, header included, and register it
//! let obj = allocator.malloc_object(4 * WORD).unwrap();
//! unsafe {
//!     allocator.model().init(obj, 4 * WORD);
//!     allocator.add_regular(obj);
//! }
//!
//! // Free every registered object at once
//! assert_eq!(unsafe { allocator.free_and_clear() }, 1);
//! ```

mod allocator;
mod arena;
mod builder;
mod error;
mod free_slot;
mod object;
mod page;
mod shared_area;
mod size_class;

// Re-export the public interface at the crate root
pub use crate::{
    allocator::{Stats, ThreadLocalAllocator},
    arena::{is_poisoned, MemoryArena, SystemArena, POISON_BYTE},
    builder::{Builder, DEFAULT_PAGE_SIZE, DEFAULT_SMALL_OBJECT_THRESHOLD},
    error::{AllocError, ConfigError},
    object::{HeaderWords, ObjectModel, ObjectRef},
    page::{PageRef, Pages},
    shared_area::SharedArea,
    size_class::SizeClass,
};


/// Size of a machine word in bytes, the granularity of all size classes
pub const WORD: usize = std::mem::size_of::<usize>();


/// Small utility to divide two integers, rounding the result up
pub(crate) fn div_round_up(x: usize, y: usize) -> usize {
    // Check interface preconditions in debug builds
    debug_assert!(y != 0, "Attempted to divide by zero");

    // Return rounded division result
    (x / y) + (x % y != 0) as usize
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounded_division() {
        assert_eq!(div_round_up(0, WORD), 0);
        assert_eq!(div_round_up(1, WORD), 1);
        assert_eq!(div_round_up(WORD, WORD), 1);
        assert_eq!(div_round_up(WORD + 1, WORD), 2);
    }

    #[test]
    fn word_is_pointer_sized() {
        assert_eq!(WORD, std::mem::size_of::<*mut u8>());
    }
}

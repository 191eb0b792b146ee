//! Heap-wide state shared by all thread-local allocators
//!
//! There is one `SharedArea` per managed heap. It holds the immutable size
//! class configuration, which every thread-local allocator reads without any
//! synchronization, and a pool of pages with low usage, which is the only
//! way for a page to move from one thread to another.
//!
//! Deciding when a page has low usage, and how an adopting thread integrates a
//! page from the pool into its own lists, is left to the garbage collector.
//! This module only provides the lock-protected pool itself.

use crate::{
    arena::{MemoryArena, SystemArena},
    builder::Builder,
    error::ConfigError,
    page::{PageList, PageRef, HEADER_SIZE},
    size_class::{self, SizeClass},
    WORD,
};

use parking_lot::Mutex;
use tracing::debug;


/// Configuration and cross-thread page pool of a managed heap
#[derive(Debug)]
pub struct SharedArea<A: MemoryArena = SystemArena> {
    /// Where pages and big objects come from
    arena: A,

    /// Size of a page in bytes, header included
    page_size: usize,

    /// Largest object size (in bytes) that is served from pages
    small_object_threshold: usize,

    /// Number of blocks per page, indexed by `SizeClass::index()`
    blocks_per_class: Box<[usize]>,

    /// Pages with low usage, available to any thread, indexed like
    /// `blocks_per_class`
    low_usage_pages: Mutex<Box<[PageList]>>,
}

impl SharedArea {
    /// Start configuring a shared area
    ///
    /// See the `Builder` documentation for the available parameters.
    pub const fn builder() -> Builder {
        Builder::new()
    }

    /// Set up a shared area on top of the system allocator
    pub fn new(page_size: usize,
               small_object_threshold: usize) -> Result<Self, ConfigError> {
        Self::with_arena(SystemArena, page_size, small_object_threshold)
    }
}

impl<A: MemoryArena> SharedArea<A> {
    /// Set up a shared area on top of a custom memory arena
    ///
    /// This computes the number of blocks per page of every size class, and
    /// fails if the page is too small to hold even one block of the largest
    /// size class next to its header.
    pub fn with_arena(arena: A,
                      page_size: usize,
                      small_object_threshold: usize) -> Result<Self, ConfigError> {
        // Check that the size classes are well-defined
        if small_object_threshold < WORD {
            return Err(ConfigError::ThresholdTooSmall {
                threshold: small_object_threshold,
            });
        }
        if small_object_threshold % WORD != 0 {
            return Err(ConfigError::MisalignedThreshold {
                threshold: small_object_threshold,
            });
        }
        let largest_class = SizeClass::for_size(small_object_threshold);

        // The largest class has the fewest blocks, make sure it has some. This
        // must be checked before any per-class table is sized.
        if page_size.saturating_sub(HEADER_SIZE) < largest_class.block_size() {
            return Err(ConfigError::PageTooSmall {
                page_size,
                header_size: HEADER_SIZE,
                largest_block: largest_class.block_size(),
            });
        }

        // Partition a page for every size class
        let blocks_per_class =
            SizeClass::up_to(largest_class)
                      .map(|class| size_class::blocks_per_page(page_size,
                                                               HEADER_SIZE,
                                                               class))
                      .collect::<Box<[_]>>();
        debug_assert!(blocks_per_class[largest_class.index()] >= 1,
                      "Page size check let an empty size class through");

        let low_usage_pages =
            std::iter::repeat_with(PageList::new)
                      .take(blocks_per_class.len())
                      .collect::<Box<[_]>>();

        debug!(page_size,
               small_object_threshold,
               size_classes = blocks_per_class.len(),
               "shared area initialized");
        Ok(Self {
            arena,
            page_size,
            small_object_threshold,
            blocks_per_class,
            low_usage_pages: Mutex::new(low_usage_pages),
        })
    }

    /// Memory arena which pages and big objects are requested from
    pub fn arena(&self) -> &A {
        &self.arena
    }

    /// Size of a page in bytes, header included
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Largest object size (in bytes) that is served from pages
    pub fn small_object_threshold(&self) -> usize {
        self.small_object_threshold
    }

    /// Number of bytes taken by the header of every page
    pub fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    /// Size class of the largest small objects
    pub fn largest_class(&self) -> SizeClass {
        SizeClass::for_size(self.small_object_threshold)
    }

    /// Size class of objects of `size` bytes, or `None` if objects of this
    /// size are big objects, which bypass the page system
    pub fn class_for(&self, size: usize) -> Option<SizeClass> {
        if size <= self.small_object_threshold {
            Some(SizeClass::for_size(size))
        } else {
            None
        }
    }

    /// Number of blocks of a certain size class that a page holds
    pub fn blocks_per_class(&self, class: SizeClass) -> usize {
        debug_assert!(class <= self.largest_class(),
                      "Size class is above the small object threshold");
        self.blocks_per_class[class.index()]
    }

    /// Number of size classes, which is also the largest class in words
    pub fn num_classes(&self) -> usize {
        self.blocks_per_class.len()
    }

    /// Hand a page over to the cross-thread pool of low-usage pages
    ///
    /// # Safety
    ///
    /// `page` must be a live page of this heap, whose blocks belong to size
    /// class `class`, and which was removed from the page list of its former
    /// owner. That owner must not touch the page or its blocks from now on.
    /// Pages that are still pooled when the shared area is dropped go back to
    /// the arena, so none of their blocks may outlive the area.
    pub unsafe fn push_low_usage(&self, page: PageRef, class: SizeClass) {
        debug_assert!(class <= self.largest_class(),
                      "Size class is above the small object threshold");
        self.low_usage_pages.lock()[class.index()].push(page);
    }

    /// Take a page of size class `class` out of the cross-thread pool of
    /// low-usage pages, if any, transferring its ownership to the caller
    pub fn pop_low_usage(&self, class: SizeClass) -> Option<PageRef> {
        debug_assert!(class <= self.largest_class(),
                      "Size class is above the small object threshold");
        self.low_usage_pages.lock()[class.index()].pop()
    }

    /// Number of pages of size class `class` in the low-usage pool
    ///
    /// This is only a snapshot, other threads may change it at any time.
    pub fn low_usage_len(&self, class: SizeClass) -> usize {
        self.low_usage_pages.lock()[class.index()].len()
    }
}

impl<A: MemoryArena> Drop for SharedArea<A> {
    fn drop(&mut self) {
        let page_size = self.page_size;
        let mut released = 0;
        for list in self.low_usage_pages.get_mut().iter_mut() {
            while let Some(page) = list.pop() {
                // This is safe because pooled pages belong to the area, were
                // just unlinked, and their blocks may not outlive the area.
                unsafe { page.release(&self.arena, page_size) };
                released += 1;
            }
        }
        debug!(released, "shared area dropped, pooled pages released");
    }
}

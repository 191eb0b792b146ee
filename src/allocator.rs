//! Per-thread allocator, serving small objects from privately owned pages
//!
//! Every worker thread owns one `ThreadLocalAllocator`. All pages that it
//! carves, and all free blocks within them, belong to this allocator alone,
//! which is why none of its operations need any synchronization. Only page
//! carving and big objects ever reach out to the shared memory arena.

use crate::{
    arena::{MemoryArena, SystemArena},
    error::AllocError,
    free_slot::{Block, FreeList},
    object::{HeaderWords, ObjectModel, ObjectRef},
    page::{PageList, PageRef, Pages},
    size_class::SizeClass,
    SharedArea,
};

use tracing::{debug, trace, warn};

use std::{
    collections::{BTreeMap, HashSet},
    ptr::NonNull,
};


/// Allocation statistics of a thread-local allocator
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Number of pages carved so far
    pub pages: usize,

    /// Number of small objects currently allocated
    pub small_objects: usize,

    /// Number of big objects currently allocated
    pub big_objects: usize,

    /// Number of objects currently registered in the live chain
    pub chained_objects: usize,
}


/// Thread-local allocator for a managed heap
///
/// Small objects, whose size is at most the shared area's threshold, come
/// from pages owned by this allocator, with one free list per size class. Big
/// objects are requested from the memory arena one by one.
///
/// Allocated objects may additionally be registered in a chain of live objects
/// (see `add_regular()`), which can later be freed in bulk.
pub struct ThreadLocalAllocator<'area, A: MemoryArena = SystemArena, M = HeaderWords> {
    /// Heap-wide configuration and memory arena
    area: &'area SharedArea<A>,

    /// Object model, used to find out object sizes and chain links
    model: M,

    /// Pages carved by this allocator, indexed by `SizeClass::index()`
    owned_pages: Box<[PageList]>,

    /// Free blocks within our pages, indexed by `SizeClass::index()`
    free_slots: Box<[FreeList]>,

    /// Most recently registered object, which links to the previous one
    live_chain: Option<ObjectRef>,

    /// Allocation statistics
    stats: Stats,

    /// Debug-mode record of our pages and free blocks
    ledger: Ledger,
}

impl<'area, A: MemoryArena, M: ObjectModel + Default> ThreadLocalAllocator<'area, A, M> {
    /// Set up an allocator for the current thread, with a default object model
    pub fn new(area: &'area SharedArea<A>) -> Self {
        Self::with_model(area, M::default())
    }
}

impl<'area, A: MemoryArena, M: ObjectModel> ThreadLocalAllocator<'area, A, M> {
    /// Set up an allocator for the current thread
    pub fn with_model(area: &'area SharedArea<A>, model: M) -> Self {
        let num_classes = area.num_classes();
        Self {
            area,
            model,
            owned_pages: std::iter::repeat_with(PageList::new)
                                   .take(num_classes)
                                   .collect(),
            free_slots: std::iter::repeat_with(FreeList::new)
                                  .take(num_classes)
                                  .collect(),
            live_chain: None,
            stats: Stats::default(),
            ledger: Ledger::default(),
        }
    }

    /// Shared area that this allocator draws its configuration from
    pub fn area(&self) -> &'area SharedArea<A> {
        self.area
    }

    /// Object model used by this allocator
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Allocation statistics
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Allocate storage for an object of `size` bytes, header included
    ///
    /// The returned object address points past the object header, which the
    /// caller is responsible for initializing. Memory is not zero-filled.
    ///
    /// You should also register the object with `add_regular()`, or keep track
    /// of it in some other way, so that it can be freed later on.
    pub fn malloc_object(&mut self, size: usize) -> Result<ObjectRef, AllocError> {
        let header_size = self.model.header_size();
        debug_assert!(size >= header_size,
                      "Object size should account for the object header");

        let block = match self.area.class_for(size) {
            Some(class) => self.malloc_size_class(class)?,
            None => self.malloc_big(size)?,
        };

        // This is safe because the block is at least `size` bytes long, which
        // is enough to hold the header, so the object address is in bounds.
        Ok(unsafe {
            ObjectRef::from_ptr(NonNull::new_unchecked(
                block.as_ptr().as_ptr().add(header_size)
            ))
        })
    }

    /// Register an allocated object in the chain of live objects
    ///
    /// # Safety
    ///
    /// `obj` must have been allocated by this allocator, its header must have
    /// been initialized, and it must not be registered already.
    pub unsafe fn add_regular(&mut self, obj: ObjectRef) {
        self.model.set_link(obj, self.live_chain);
        self.live_chain = Some(obj);
        self.stats.chained_objects += 1;
    }

    /// Free an object
    ///
    /// The size class of the object is recomputed from its current size, as
    /// reported by the object model.
    ///
    /// # Safety
    ///
    /// `obj` must have been allocated by this allocator, must not have been
    /// freed already, and the object model must report the size with which it
    /// was allocated (modulo size class rounding). `obj` must not be used
    /// after this call, and must not be reachable from the live chain, unless
    /// the chain is being freed.
    pub unsafe fn free_object(&mut self, obj: ObjectRef) {
        let size = self.model.size_of(obj);
        let block = Block::new(NonNull::new_unchecked(
            obj.as_ptr().as_ptr().sub(self.model.header_size())
        ));
        match self.area.class_for(size) {
            Some(class) => self.free_size_class(block, class),
            None => self.free_big(block, size),
        }
    }

    /// Free every object of the live chain, and empty the chain
    ///
    /// Returns the number of freed objects. Calling this again on an empty
    /// chain does nothing.
    ///
    /// # Safety
    ///
    /// Every registered object must satisfy the preconditions of
    /// `free_object()`.
    pub unsafe fn free_and_clear(&mut self) -> usize {
        let mut freed = 0;
        let mut cursor = self.live_chain.take();
        while let Some(obj) = cursor {
            cursor = self.model.link(obj);
            self.free_object(obj);
            freed += 1;
        }
        debug_assert_eq!(freed, self.stats.chained_objects,
                         "Live chain length does not match registrations");
        self.stats.chained_objects = 0;
        freed
    }

    /// Free every object of an external collection
    ///
    /// The live chain is left alone. Returns the number of freed objects.
    ///
    /// # Safety
    ///
    /// Every object of the collection must satisfy the preconditions of
    /// `free_object()`, and none of them may be in the live chain.
    pub unsafe fn free_and_clear_list<I>(&mut self, list: I) -> usize
        where I: IntoIterator<Item = ObjectRef>
    {
        let mut freed = 0;
        for obj in list {
            self.free_object(obj);
            freed += 1;
        }
        freed
    }

    /// Tear down this allocator, at thread exit
    ///
    /// This releases the per-class bookkeeping of the allocator, but neither
    /// its pages nor its live objects. Those must have been dealt with
    /// beforehand, for example with `free_and_clear()`, or are left to the
    /// garbage collector.
    pub fn delete(self) {
        std::mem::drop(self)
    }

    /// Iterate over the pages of a size class that this allocator owns, most
    /// recently carved first
    pub fn pages(&self, class: SizeClass) -> Pages<'_> {
        debug_assert!(class <= self.area.largest_class(),
                      "Size class is above the small object threshold");
        self.owned_pages[class.index()].iter()
    }

    /// Number of free blocks of a size class, found by walking the free list
    pub fn free_slot_count(&self, class: SizeClass) -> usize {
        debug_assert!(class <= self.area.largest_class(),
                      "Size class is above the small object threshold");
        // This is safe because free blocks are exclusively ours, nobody else
        // is allowed to write to them.
        unsafe { self.free_slots[class.index()].len() }
    }

    /// Number of objects currently registered in the live chain
    pub fn chain_len(&self) -> usize {
        self.stats.chained_objects
    }

    /// Take one block of a size class, carving a new page if needed
    fn malloc_size_class(&mut self, class: SizeClass) -> Result<Block, AllocError> {
        debug_assert!(class <= self.area.largest_class(),
                      "malloc_size_class: size class is too big");
        loop {
            // This is safe because free blocks are exclusively ours, and
            // clients may not touch them until we hand them out again.
            if let Some(block) = unsafe { self.free_slots[class.index()].pop() } {
                self.area.arena().mark_in_use(block.as_ptr(), class.block_size());
                if cfg!(debug_assertions) {
                    self.ledger.record_alloc(block);
                }
                self.stats.small_objects += 1;
                return Ok(block);
            }

            // A fresh page contributes at least one free block, so the next
            // iteration is guaranteed to succeed.
            self.carve_page(class)?;
        }
    }

    /// Allocate a new page for a size class and put all of its blocks on
    /// the (empty) free list of that class
    ///
    /// On failure, nothing is modified.
    #[cold]
    fn carve_page(&mut self, class: SizeClass) -> Result<(), AllocError> {
        let page_size = self.area.page_size();
        let page = match PageRef::allocate(self.area.arena(), page_size) {
            Some(page) => page,
            None => {
                warn!(page_size, class = class.words(),
                      "out of memory while carving a page");
                return Err(AllocError::OutOfMemory { requested: page_size });
            }
        };

        // Every block of the page body starts out free
        let num_blocks = self.area.blocks_per_class(class);
        let block_size = class.block_size();
        self.area.arena().mark_free(page.body(), num_blocks * block_size);

        // This is safe because we just got this page from the arena, so it is
        // not on any list and its body is ours to partition.
        unsafe {
            self.owned_pages[class.index()].push(page);
            self.free_slots[class.index()].fill_contiguous(page.body(),
                                                           block_size,
                                                           num_blocks);
        }

        if cfg!(debug_assertions) {
            self.ledger.record_page(page, class, num_blocks);
        }
        self.stats.pages += 1;
        trace!(page = page.addr(), class = class.words(), num_blocks,
               "carved a new page");
        Ok(())
    }

    /// Allocate a big object straight from the arena
    fn malloc_big(&mut self, size: usize) -> Result<Block, AllocError> {
        let ptr = match self.area.arena().allocate(size) {
            Some(ptr) => ptr,
            None => {
                warn!(size, "out of memory while allocating a big object");
                return Err(AllocError::OutOfMemory { requested: size });
            }
        };
        self.stats.big_objects += 1;
        trace!(addr = ptr.as_ptr() as usize, size, "allocated a big object");

        // This is safe because the arena gave us exclusive access to `size`
        // word-aligned bytes, which is more than one word.
        Ok(unsafe { Block::new(ptr) })
    }

    /// Put a small block back on the free list of its size class
    ///
    /// # Safety
    ///
    /// `block` must be an allocated block of size class `class`, coming from
    /// one of our pages, and must not be used anymore.
    unsafe fn free_size_class(&mut self, block: Block, class: SizeClass) {
        if cfg!(debug_assertions) {
            self.ledger.record_free(block, class, self.area.page_size());
        }
        self.area.arena().mark_free(block.as_ptr(), class.block_size());
        self.free_slots[class.index()].push(block);
        self.stats.small_objects -= 1;
    }

    /// Give a big object back to the arena
    ///
    /// # Safety
    ///
    /// `block` must be a big object of `size` bytes allocated by us, and must
    /// not be used anymore.
    unsafe fn free_big(&mut self, block: Block, size: usize) {
        trace!(addr = block.addr(), size, "releasing a big object");
        self.area.arena().release(block.as_ptr(), size);
        self.stats.big_objects -= 1;
    }
}

impl<A: MemoryArena, M> Drop for ThreadLocalAllocator<'_, A, M> {
    fn drop(&mut self) {
        // Pages and live objects outlive us, only our bookkeeping goes away
        debug!(pages = self.stats.pages,
               small_objects = self.stats.small_objects,
               big_objects = self.stats.big_objects,
               chained_objects = self.stats.chained_objects,
               "thread-local allocator deleted");
    }
}


/// Record of the pages and free blocks of an allocator, used to catch client
/// errors in debug builds
///
/// Release builds never fill it in.
#[derive(Debug, Default)]
struct Ledger {
    /// Pages carved by the allocator, keyed by start address, with their size
    /// class and number of blocks
    pages: BTreeMap<usize, (SizeClass, usize)>,

    /// Addresses of the blocks that are on a free list
    free_blocks: HashSet<usize>,
}

impl Ledger {
    /// Record the carving of a new page, all blocks of which are free
    fn record_page(&mut self, page: PageRef, class: SizeClass, num_blocks: usize) {
        let body = page.body().as_ptr() as usize;
        self.free_blocks.extend(
            (0..num_blocks).map(|idx| body + idx * class.block_size())
        );
        let previous = self.pages.insert(page.addr(), (class, num_blocks));
        assert!(previous.is_none(), "Page was carved twice");
    }

    /// Record that a free block was handed out
    fn record_alloc(&mut self, block: Block) {
        assert!(self.free_blocks.remove(&block.addr()),
                "Block at {:#x} was handed out without being free",
                block.addr());
    }

    /// Check and record that a block of a certain size class was freed
    fn record_free(&mut self, block: Block, class: SizeClass, page_size: usize) {
        let addr = block.addr();
        let (&page_addr, &(page_class, num_blocks)) =
            self.pages
                .range(..=addr)
                .next_back()
                .unwrap_or_else(|| panic!("Freed object at {:#x} does not come \
                                           from this allocator", addr));
        let body_start = page_addr + crate::page::HEADER_SIZE;
        assert!(addr >= body_start && addr < page_addr + page_size,
                "Freed object at {:#x} does not come from this allocator", addr);
        assert_eq!(page_class, class,
                   "Freed object at {:#x} has a size that does not match its \
                    size class", addr);
        let offset = addr - body_start;
        assert!(offset % class.block_size() == 0
                    && offset / class.block_size() < num_blocks,
                "Freed object at {:#x} is not at a block boundary", addr);
        assert!(self.free_blocks.insert(addr),
                "Double free of object at {:#x}", addr);
    }
}

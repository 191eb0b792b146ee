//! Pages, the unit of storage that small objects are carved from
//!
//! A page is a `page_size` bytes range obtained from the memory arena. It
//! starts with a `PageHeader`, and the rest of it (the page body) is cut into
//! equally sized blocks of a single size class.
//!
//! ```text
//! |next|rsvd|rsvd|block 0|block 1|...|block N-1|unused tail|
//!  <--header---->  <----------- body ---------->
//! ```

use crate::arena::MemoryArena;

use std::{
    mem,
    ptr::NonNull,
};


/// Header found at the start of every page
///
/// Three words is a good header size: `(1023 - 3) % n` is zero or very small
/// for most small word counts `n`, so little space is wasted at the end of a
/// default-sized page.
#[repr(C)]
struct PageHeader {
    /// Next page of the same size class on whatever list holds this page
    next_page: Option<PageRef>,

    /// Reserved for per-page usage metadata, not populated yet
    _usage_count: usize,

    /// Reserved for per-page usage metadata, not populated yet
    _usage_hint: usize,
}

/// Number of bytes taken by the header at the start of every page
pub const HEADER_SIZE: usize = mem::size_of::<PageHeader>();


/// Handle to a page
///
/// A page is always owned by exactly one page list, either in a thread-local
/// allocator or in the shared area's low-usage pool. The handle itself does
/// not own anything, so it can be freely copied, but only the list owner may
/// act upon it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PageRef(NonNull<PageHeader>);

// This is safe because pages are plain memory, which may be handed over from
// one thread to another as long as only one of them owns the page at a time.
unsafe impl Send for PageRef {}

impl PageRef {
    /// Allocate a fresh page from the arena and initialize its header
    ///
    /// The page is not linked to any list, and its body is left untouched.
    /// Returns `None` if the arena is out of memory.
    pub fn allocate<A>(arena: &A, page_size: usize) -> Option<Self>
        where A: MemoryArena + ?Sized
    {
        debug_assert!(page_size > HEADER_SIZE,
                      "Page should be larger than its own header");
        let start = arena.allocate(page_size)?.cast::<PageHeader>();

        // This is safe because the arena just gave us exclusive access to a
        // word-aligned range that is large enough to hold a header.
        unsafe {
            start.as_ptr().write(PageHeader {
                next_page: None,
                _usage_count: 0,
                _usage_hint: 0,
            });
        }
        Some(Self(start))
    }

    /// Give an unlinked page back to the arena
    ///
    /// # Safety
    ///
    /// The page must have been allocated from `arena` with the same
    /// `page_size`, must not be on any page list, and none of its blocks may
    /// still be in use or sitting on a free list.
    pub unsafe fn release<A>(self, arena: &A, page_size: usize)
        where A: MemoryArena + ?Sized
    {
        arena.release(self.0.cast(), page_size)
    }

    /// Address of the start of the page
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Start of the page body, where the first block lives
    pub fn body(self) -> NonNull<u8> {
        // This is safe because a page is always larger than its header
        unsafe { NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }

    /// Truth that `addr` lies within the body of this page
    pub fn body_contains(self, addr: usize, page_size: usize) -> bool {
        let body_start = self.body().as_ptr() as usize;
        addr >= body_start && addr < self.addr() + page_size
    }

    /// Page that follows this one on its list
    fn next(self) -> Option<PageRef> {
        // This is safe because the header of a live page is always initialized
        // and never exposed to clients, who only get to see the body.
        unsafe { (*self.0.as_ptr()).next_page }
    }

    /// Link this page to another one
    ///
    /// # Safety
    ///
    /// The caller must own the page, through the list that it is being
    /// inserted into.
    unsafe fn set_next(self, next: Option<PageRef>) {
        (*self.0.as_ptr()).next_page = next;
    }
}


/// Intrusive LIFO list of pages, linked through their headers
#[derive(Debug, Default)]
pub struct PageList {
    /// Most recently pushed page, if any
    head: Option<PageRef>,

    /// Number of pages on the list
    len: usize,
}

impl PageList {
    /// Create an empty page list
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Number of pages on the list
    pub fn len(&self) -> usize {
        self.len
    }

    /// Put a page at the head of the list, taking ownership of it
    ///
    /// # Safety
    ///
    /// `page` must be a live page which is not on any other list.
    pub unsafe fn push(&mut self, page: PageRef) {
        page.set_next(self.head);
        self.head = Some(page);
        self.len += 1;
    }

    /// Remove the most recently pushed page from the list, if any, handing
    /// its ownership over to the caller
    pub fn pop(&mut self) -> Option<PageRef> {
        let page = self.head?;
        self.head = page.next();
        self.len -= 1;

        // This is safe because we owned the page until now, and it is not on
        // our list anymore.
        unsafe { page.set_next(None) };
        Some(page)
    }

    /// Iterate over the pages of the list, most recent first
    pub fn iter(&self) -> Pages<'_> {
        Pages {
            cursor: self.head,
            _list: self,
        }
    }
}


/// Iterator over the pages of a `PageList`
#[derive(Clone, Debug)]
pub struct Pages<'list> {
    /// Next page to be yielded
    cursor: Option<PageRef>,

    /// The list must not be modified while it is being iterated over
    _list: &'list PageList,
}

impl Iterator for Pages<'_> {
    type Item = PageRef;

    fn next(&mut self) -> Option<PageRef> {
        let page = self.cursor?;
        self.cursor = page.next();
        Some(page)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arena::SystemArena, WORD};

    const PAGE_SIZE: usize = 1023 * WORD;

    #[test]
    fn header_takes_three_words() {
        assert_eq!(HEADER_SIZE, 3 * WORD);
    }

    #[test]
    fn body_follows_header() {
        let page = PageRef::allocate(&SystemArena, PAGE_SIZE).unwrap();
        assert_eq!(page.body().as_ptr() as usize, page.addr() + HEADER_SIZE);
        assert!(page.body_contains(page.addr() + HEADER_SIZE, PAGE_SIZE));
        assert!(page.body_contains(page.addr() + PAGE_SIZE - 1, PAGE_SIZE));
        assert!(!page.body_contains(page.addr(), PAGE_SIZE));
        assert!(!page.body_contains(page.addr() + PAGE_SIZE, PAGE_SIZE));
        unsafe { page.release(&SystemArena, PAGE_SIZE) };
    }

    #[test]
    fn list_is_lifo_and_counts_pages() {
        let pages = (0..3)
            .map(|_| PageRef::allocate(&SystemArena, PAGE_SIZE).unwrap())
            .collect::<Vec<_>>();
        let mut list = PageList::new();
        assert_eq!(list.len(), 0);
        for &page in &pages {
            unsafe { list.push(page) };
        }
        assert_eq!(list.len(), 3);
        assert!(list.iter().eq(pages.iter().rev().copied()));

        for &page in pages.iter().rev() {
            assert_eq!(list.pop(), Some(page));
        }
        assert_eq!(list.pop(), None);
        assert_eq!(list.len(), 0);

        for page in pages {
            unsafe { page.release(&SystemArena, PAGE_SIZE) };
        }
    }
}

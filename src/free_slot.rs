//! In-place free lists of blocks
//!
//! A block of a page is either in use by a client, in which case this crate
//! does not look at its contents, or sitting on a free list, in which case its
//! first word holds a link to the next free block of the same size class.
//!
//! These two views of the same storage are kept apart by the type system: a
//! `Block` is an opaque block address, and only becomes a `FreeSlot`, whose
//! first word may be read as a link, when it is pushed on a `FreeList`. It
//! turns back into a `Block` when it is popped from there.

use require_unsafe_in_body::require_unsafe_in_body;

use std::ptr::NonNull;


/// Address of a block which is not on any free list
///
/// This is what is handed out to and received back from clients (modulo the
/// object header offset). The allocator never reads from or writes to the
/// memory behind a `Block`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Block(NonNull<u8>);

impl Block {
    /// Wrap a block address
    ///
    /// # Safety
    ///
    /// `ptr` must be word-aligned and designate the start of a block of at
    /// least one word, that the caller owns exclusively.
    pub unsafe fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Address of the start of the block
    pub fn as_ptr(self) -> NonNull<u8> {
        self.0
    }

    /// Numerical address of the start of the block
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}


/// Contents of the first word of a free block
#[repr(C)]
struct SlotLink {
    /// Next free block of the same size class, if any
    next: Option<FreeSlot>,
}


/// Block which currently sits on a free list
///
/// `Option<FreeSlot>` has the layout of a nullable pointer, so a free list
/// link fits in the first word of a block, with `None` stored as null.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(transparent)]
struct FreeSlot(NonNull<SlotLink>);

impl FreeSlot {
    /// Turn a block into a free slot, linked to `next`
    ///
    /// # Safety
    ///
    /// `block` must uphold the `Block` invariants, and must not be used by
    /// anyone until it is turned back into a block by `into_block()`.
    unsafe fn from_block(block: Block, next: Option<FreeSlot>) -> Self {
        let link = block.0.cast::<SlotLink>();
        link.as_ptr().write(SlotLink { next });
        Self(link)
    }

    /// Free slot that follows this one on its list
    ///
    /// # Safety
    ///
    /// `self` must still be on a free list, i.e. must not have been turned
    /// back into a block.
    unsafe fn next(self) -> Option<FreeSlot> {
        (*self.0.as_ptr()).next
    }

    /// Leave the free slot view, the link is considered garbage from now on
    fn into_block(self) -> Block {
        Block(self.0.cast())
    }
}


/// Singly linked list of free blocks, all of the same size class
///
/// The list owns no memory of its own, its links live inside of the blocks.
#[derive(Debug, Default)]
pub struct FreeList {
    /// First free slot, if any
    head: Option<FreeSlot>,
}

impl FreeList {
    /// Create an empty free list
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Truth that no free block is available
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Put a block on top of the free list
    ///
    /// # Safety
    ///
    /// `block` must uphold the `Block` invariants, must be at least as large
    /// as the list's other blocks, and must not be used until popped again.
    pub unsafe fn push(&mut self, block: Block) {
        self.head = Some(FreeSlot::from_block(block, self.head));
    }

    /// Take the most recently pushed block out of the free list, if any
    ///
    /// # Safety
    ///
    /// Nobody may have written to the free blocks since they were pushed.
    pub unsafe fn pop(&mut self) -> Option<Block> {
        let slot = self.head?;
        self.head = slot.next();
        Some(slot.into_block())
    }

    /// Replace an empty free list with a chain of `count` contiguous blocks
    /// of `block_size` bytes starting at `start`, linked in address order
    ///
    /// This takes a single forward pass over the blocks.
    ///
    /// # Safety
    ///
    /// The whole `count * block_size` range must be exclusively owned by the
    /// caller, word-aligned, and `block_size` must be a nonzero multiple of
    /// the word size.
    pub unsafe fn fill_contiguous(&mut self,
                                  start: NonNull<u8>,
                                  block_size: usize,
                                  count: usize) {
        debug_assert!(self.is_empty(),
                      "Free list should be empty before carving a page");
        self.head = thread_blocks(start, block_size, count);
    }

    /// Number of blocks on the list, found by walking it
    ///
    /// # Safety
    ///
    /// Nobody may have written to the free blocks since they were pushed.
    pub unsafe fn len(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            len += 1;
            cursor = slot.next();
        }
        len
    }
}


/// Link `count` contiguous blocks into a null-terminated chain and return its
/// head, which is the block at `start`
#[require_unsafe_in_body]
unsafe fn thread_blocks(start: NonNull<u8>,
                        block_size: usize,
                        count: usize) -> Option<FreeSlot> {
    if count == 0 {
        return None;
    }

    // This is safe because the caller guarantees that `count` blocks of
    // `block_size` bytes starting at `start` are ours to write to, and that
    // they are aligned enough to hold a link.
    let block_at = |idx: usize| unsafe {
        Block::new(NonNull::new_unchecked(start.as_ptr().add(idx * block_size)))
    };

    // Each block points to the next one, and the last block ends the chain
    for idx in 0..count {
        let next = if idx + 1 < count {
            Some(FreeSlot(block_at(idx + 1).0.cast()))
        } else {
            None
        };
        unsafe { FreeSlot::from_block(block_at(idx), next) };
    }
    Some(FreeSlot(start.cast()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::WORD;

    /// Word-aligned scratch storage for free list experiments
    fn scratch(words: usize) -> Vec<usize> {
        vec![usize::MAX; words]
    }

    /// Carve scratch storage into blocks of `block_words` words
    fn blocks(storage: &mut [usize], block_words: usize) -> Vec<Block> {
        let base = storage.as_mut_ptr();
        (0..storage.len() / block_words)
            .map(|idx| unsafe {
                Block::new(NonNull::new_unchecked(base.add(idx * block_words).cast()))
            })
            .collect()
    }

    #[test]
    fn lifo_order() {
        let mut storage = scratch(4);
        let blocks = blocks(&mut storage, 1);
        let mut list = FreeList::new();
        assert!(list.is_empty());
        unsafe {
            for &block in &blocks {
                list.push(block);
            }
            assert_eq!(list.len(), 4);
            for &block in blocks.iter().rev() {
                assert_eq!(list.pop(), Some(block));
            }
            assert_eq!(list.pop(), None);
        }
        assert!(list.is_empty());
    }

    #[test]
    fn contiguous_fill_is_in_address_order() {
        const BLOCK_WORDS: usize = 3;
        const COUNT: usize = 5;
        let mut storage = scratch(BLOCK_WORDS * COUNT);
        let start = blocks(&mut storage, BLOCK_WORDS)[0].as_ptr();
        let mut list = FreeList::new();
        unsafe {
            list.fill_contiguous(start, BLOCK_WORDS * WORD, COUNT);
            assert_eq!(list.len(), COUNT);
            for idx in 0..COUNT {
                let block = list.pop().unwrap();
                assert_eq!(block.addr(),
                           start.as_ptr() as usize + idx * BLOCK_WORDS * WORD);
            }
            assert!(list.pop().is_none());
        }
        // The last block of the chain was terminated with a null link
        assert_eq!(storage[(COUNT - 1) * BLOCK_WORDS], 0);
    }

    #[test]
    fn empty_fill() {
        let mut storage = scratch(1);
        let mut list = FreeList::new();
        unsafe { list.fill_contiguous(blocks(&mut storage, 1)[0].as_ptr(), WORD, 0) };
        assert!(list.is_empty());
    }
}

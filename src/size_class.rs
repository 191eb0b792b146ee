//! Linear size classes and the associated page partition arithmetic
//!
//! Small objects are bucketed by their size in machine words: class `n` holds
//! blocks of exactly `n * WORD` bytes. Unlike power-of-two bucketing, this
//! wastes at most `WORD - 1` bytes per object and makes class lookup a single
//! rounded division.

use crate::{div_round_up, WORD};

use std::num::NonZeroUsize;


/// Size class of a small object, measured in machine words
///
/// A size class is never empty, since every block must at least be able to
/// hold the free list link that is stored inside of it while it is not in use.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SizeClass(NonZeroUsize);

impl SizeClass {
    /// Smallest size class, one word per block
    pub const MIN: Self = Self(unsafe { NonZeroUsize::new_unchecked(1) });

    /// Size class holding blocks of `words` machine words, if nonzero
    pub fn new(words: usize) -> Option<Self> {
        NonZeroUsize::new(words).map(Self)
    }

    /// Size class which objects of `size` bytes belong to
    ///
    /// This is `ceil(size / WORD)`, except that zero-sized requests are
    /// served from the smallest class.
    pub fn for_size(size: usize) -> Self {
        Self::new(div_round_up(size, WORD)).unwrap_or(Self::MIN)
    }

    /// Number of machine words in a block of this class
    pub const fn words(self) -> usize {
        self.0.get()
    }

    /// Number of bytes in a block of this class
    pub const fn block_size(self) -> usize {
        self.words() * WORD
    }

    /// Position of this class in per-class tables, which have no slot for the
    /// nonexistent zero-word class
    pub(crate) const fn index(self) -> usize {
        self.words() - 1
    }

    /// Iterate over all size classes from one word up to `max` (included)
    pub fn up_to(max: Self) -> impl Iterator<Item = Self> + Clone {
        (1..=max.words()).filter_map(Self::new)
    }
}


/// Number of blocks of a certain size class that fit in one page, once the
/// page header has been accounted for
///
/// Returns zero if the page cannot even hold its own header.
pub fn blocks_per_page(page_size: usize,
                       header_size: usize,
                       class: SizeClass) -> usize {
    page_size.saturating_sub(header_size) / class.block_size()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_up_to_words() {
        assert_eq!(SizeClass::for_size(1).words(), 1);
        assert_eq!(SizeClass::for_size(WORD).words(), 1);
        assert_eq!(SizeClass::for_size(WORD + 1).words(), 2);
        assert_eq!(SizeClass::for_size(2 * WORD).words(), 2);
        assert_eq!(SizeClass::for_size(35 * WORD).words(), 35);
        assert_eq!(SizeClass::for_size(35 * WORD - 1).words(), 35);
    }

    #[test]
    fn zero_sized_requests_use_smallest_class() {
        assert_eq!(SizeClass::for_size(0), SizeClass::MIN);
        assert_eq!(SizeClass::new(0), None);
    }

    #[test]
    fn internal_fragmentation_is_below_one_word() {
        for size in 1..=(35 * WORD) {
            let class = SizeClass::for_size(size);
            assert!(class.block_size() >= size);
            assert!(class.block_size() - size < WORD);
        }
    }

    #[test]
    fn class_enumeration() {
        let max = SizeClass::new(35).unwrap();
        let classes = SizeClass::up_to(max).collect::<Vec<_>>();
        assert_eq!(classes.len(), 35);
        assert_eq!(classes[0], SizeClass::MIN);
        assert_eq!(classes[34], max);
        assert!(classes.iter().enumerate().all(|(i, c)| c.index() == i));
    }

    #[test]
    fn page_partition() {
        let class = SizeClass::new(2).unwrap();
        assert_eq!(blocks_per_page(1023 * WORD, 3 * WORD, class),
                   (1023 - 3) / 2);
        assert_eq!(blocks_per_page(2 * WORD, 3 * WORD, class), 0);
    }
}

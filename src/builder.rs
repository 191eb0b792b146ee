//! Mechanism for configuring a `SharedArea`, with proper invariant checking

use crate::{
    arena::{MemoryArena, SystemArena},
    error::ConfigError,
    SharedArea,
    WORD,
};


/// Page size used when none is specified: 1023 words
///
/// The system allocator is good at serving requests of this size, since they
/// leave room for exactly one word of its own bookkeeping within 1024 words.
pub const DEFAULT_PAGE_SIZE: usize = 1023 * WORD;

/// Small object threshold used when none is specified: 35 words
pub const DEFAULT_SMALL_OBJECT_THRESHOLD: usize = 35 * WORD;


/// Builder for the shared area of a managed heap
//
// NOTE: Both parameters are fixed for the lifetime of the heap. Their mutual
//       consistency is only checked in `build()`, and reported as an error
//       rather than a panic, since it typically depends on user-provided
//       runtime configuration.
#[derive(Debug, Default)]
pub struct Builder {
    /// Size of a page in bytes, header included
    /// - Will be set to `DEFAULT_PAGE_SIZE` if unspecified
    /// - Must hold a page header plus one block of the largest size class
    page_size: Option<usize>,

    /// Largest object size (in bytes) that is served from pages
    /// - Will be set to `DEFAULT_SMALL_OBJECT_THRESHOLD` if unspecified
    /// - Must be a nonzero multiple of the word size
    small_object_threshold: Option<usize>,
}

impl Builder {
    /// Start configuring a shared area
    pub const fn new() -> Self {
        Self {
            page_size: None,
            small_object_threshold: None,
        }
    }

    /// Set the size of the pages that small objects are carved from (in bytes)
    ///
    /// Every page is requested from the memory arena as a single block of this
    /// size, and starts with a small header.
    pub fn page_size(&mut self, page_size: usize) -> &mut Self {
        assert!(self.page_size.replace(page_size).is_none(),
                "Page size must only be set once");
        self
    }

    /// Set the largest object size (in bytes) that is served from pages
    ///
    /// Objects above this size are requested one by one from the memory arena.
    pub fn small_object_threshold(&mut self, threshold: usize) -> &mut Self {
        assert!(self.small_object_threshold.replace(threshold).is_none(),
                "Small object threshold must only be set once");
        self
    }

    /// Build the configured shared area on top of the system allocator
    pub fn build(&self) -> Result<SharedArea, ConfigError> {
        self.build_with_arena(SystemArena)
    }

    /// Build the configured shared area on top of a custom memory arena
    pub fn build_with_arena<A: MemoryArena>(
        &self,
        arena: A
    ) -> Result<SharedArea<A>, ConfigError> {
        SharedArea::with_arena(
            arena,
            self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            self.small_object_threshold.unwrap_or(DEFAULT_SMALL_OBJECT_THRESHOLD),
        )
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::HEADER_SIZE;

    #[test]
    fn defaults() {
        let area = Builder::new().build().unwrap();
        assert_eq!(area.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(area.small_object_threshold(), DEFAULT_SMALL_OBJECT_THRESHOLD);
    }

    #[test]
    fn custom_configuration() {
        let area = Builder::new().page_size(4096)
                                 .small_object_threshold(16 * WORD)
                                 .build()
                                 .unwrap();
        assert_eq!(area.page_size(), 4096);
        assert_eq!(area.small_object_threshold(), 16 * WORD);
        assert_eq!(area.largest_class().words(), 16);
    }

    #[test]
    fn inconsistent_configuration_is_reported() {
        let result = Builder::new().page_size(HEADER_SIZE + 35 * WORD - 1)
                                   .build();
        assert_eq!(result.err(), Some(ConfigError::PageTooSmall {
            page_size: HEADER_SIZE + 35 * WORD - 1,
            header_size: HEADER_SIZE,
            largest_block: 35 * WORD,
        }));
    }

    #[test]
    #[should_panic(expected = "Page size must only be set once")]
    fn page_size_is_set_once() {
        Builder::new().page_size(4096).page_size(8192);
    }
}

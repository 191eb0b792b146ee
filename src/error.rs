//! Error types reported by the shared area and the thread-local allocators

use thiserror::Error;


/// Reasons why a `SharedArea` configuration was rejected
///
/// These are detected once, when the heap is initialized, and indicate that
/// the chosen page size and small object threshold cannot work together.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
    /// The small object threshold does not even cover one machine word
    #[error("small object threshold ({threshold} bytes) is below one word")]
    ThresholdTooSmall {
        /// Requested threshold, in bytes
        threshold: usize,
    },

    /// The small object threshold is not an integer number of words, so the
    /// largest size class would not be fully covered by the threshold
    #[error("small object threshold ({threshold} bytes) is not a multiple \
             of the word size")]
    MisalignedThreshold {
        /// Requested threshold, in bytes
        threshold: usize,
    },

    /// A page cannot hold its header plus a single block of the largest
    /// small size class
    #[error("page size ({page_size} bytes) cannot hold a {header_size} bytes \
             header plus one {largest_block} bytes block")]
    PageTooSmall {
        /// Requested page size, in bytes
        page_size: usize,

        /// Size of a page header, in bytes
        header_size: usize,

        /// Block size of the largest small size class, in bytes
        largest_block: usize,
    },
}


/// Failure to satisfy an allocation request
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum AllocError {
    /// The memory arena could not provide the requested number of bytes,
    /// either for a fresh page or for a big object
    #[error("memory arena is out of memory ({requested} bytes requested)")]
    OutOfMemory {
        /// Number of bytes that were requested from the arena
        requested: usize,
    },
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_sizes() {
        let err = ConfigError::PageTooSmall {
            page_size: 64,
            header_size: 24,
            largest_block: 280,
        };
        let message = err.to_string();
        assert!(message.contains("64"));
        assert!(message.contains("280"));

        let err = AllocError::OutOfMemory { requested: 8184 };
        assert_eq!(err.to_string(),
                   "memory arena is out of memory (8184 bytes requested)");
    }
}

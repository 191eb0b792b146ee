//! Interface to the client object model
//!
//! The allocator does not know what the objects it hands out contain. It only
//! needs the object model to tell it how large an object is when it gets
//! freed, and to lend it one scratch link field in the object header, which is
//! used to chain all registered objects of a thread together.

use crate::WORD;

use std::ptr::NonNull;


/// Address of a live object, as seen by clients
///
/// This points past the object header, at the start of the object payload.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectRef(NonNull<u8>);

impl ObjectRef {
    /// Wrap an object address
    ///
    /// # Safety
    ///
    /// `ptr` must have been produced by `ObjectRef::as_ptr()` on an object
    /// that is still alive.
    pub unsafe fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Address of the object payload
    pub fn as_ptr(self) -> NonNull<u8> {
        self.0
    }

    /// Numerical address of the object payload
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}


/// What the allocator needs to know about the objects that it manages
///
/// Sizes are always expressed with the object header included, both when
/// allocating and when reporting the size of an existing object.
pub trait ObjectModel {
    /// Number of header bytes in front of the payload of every object
    fn header_size(&self) -> usize;

    /// Current size of an object, header included
    ///
    /// This must match, once rounded up to a size class, the size that was
    /// requested when the object was allocated.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object whose header was initialized.
    unsafe fn size_of(&self, obj: ObjectRef) -> usize;

    /// Read the scratch link field of an object
    ///
    /// # Safety
    ///
    /// `obj` must be a live object, whose link was last set by `set_link()`.
    unsafe fn link(&self, obj: ObjectRef) -> Option<ObjectRef>;

    /// Overwrite the scratch link field of an object
    ///
    /// # Safety
    ///
    /// `obj` must be a live object whose header was initialized.
    unsafe fn set_link(&self, obj: ObjectRef, next: Option<ObjectRef>);
}


/// Minimal object model with a two-word header: object size, then link
///
/// ```text
/// |size|link|payload...|
///            ^ ObjectRef
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderWords;

impl HeaderWords {
    /// Size of the header, in bytes
    pub const HEADER_SIZE: usize = 2 * WORD;

    /// Address of one of the header words of an object
    fn header_word(obj: ObjectRef, idx: usize) -> *mut usize {
        debug_assert!(idx < 2, "Header only has two words");
        obj.as_ptr()
           .as_ptr()
           .wrapping_sub(Self::HEADER_SIZE)
           .cast::<usize>()
           .wrapping_add(idx)
    }

    /// Initialize the header of a freshly allocated object
    ///
    /// # Safety
    ///
    /// `obj` must come from `malloc_object(size)` on an allocator using this
    /// object model, and must not have been freed.
    pub unsafe fn init(&self, obj: ObjectRef, size: usize) {
        debug_assert!(size >= Self::HEADER_SIZE,
                      "Object size should account for the header");
        Self::header_word(obj, 0).write(size);
        self.set_link(obj, None);
    }
}

impl ObjectModel for HeaderWords {
    fn header_size(&self) -> usize {
        Self::HEADER_SIZE
    }

    unsafe fn size_of(&self, obj: ObjectRef) -> usize {
        Self::header_word(obj, 0).read()
    }

    unsafe fn link(&self, obj: ObjectRef) -> Option<ObjectRef> {
        let raw = Self::header_word(obj, 1).read() as *mut u8;
        NonNull::new(raw).map(ObjectRef)
    }

    unsafe fn set_link(&self, obj: ObjectRef, next: Option<ObjectRef>) {
        let raw = next.map_or(0, ObjectRef::addr);
        Self::header_word(obj, 1).write(raw);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_words_round_trip() {
        let mut storage = [usize::MAX; 4];
        let base = storage.as_mut_ptr();
        let obj = unsafe {
            ObjectRef::from_ptr(NonNull::new(base.add(2).cast()).unwrap())
        };
        let other = unsafe {
            ObjectRef::from_ptr(NonNull::new(base.add(3).cast()).unwrap())
        };

        let model = HeaderWords;
        assert_eq!(model.header_size(), 2 * WORD);
        unsafe {
            model.init(obj, 4 * WORD);
            assert_eq!(model.size_of(obj), 4 * WORD);
            assert_eq!(model.link(obj), None);

            model.set_link(obj, Some(other));
            assert_eq!(model.link(obj), Some(other));
            assert_eq!(model.size_of(obj), 4 * WORD);
        }
    }
}

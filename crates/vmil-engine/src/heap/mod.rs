//! Word-addressed managed heap: headers, handles, and typed views
//!
//! Everything above this layer reads and writes heap state only through
//! word-indexed accessors and handles. The production collector is consumed
//! through the same allocate/access contract [`Heap`] implements.

mod handle;
mod header;
#[allow(clippy::module_inception)]
mod heap;
mod views;

pub use handle::{Handle, HandleTable, WeakHandle};
pub use header::{Address, Header, TypeTag, Word};
pub use heap::Heap;
pub use views::{
    pack_units, packed_word_count, unpack_units, ArrayObject, Instance, StringObject,
};

use thiserror::Error;

/// Heap access errors
///
/// Bounds violations are recoverable, caller-catchable conditions; nothing
/// here silently truncates.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    /// Header carries a tag no object kind claims.
    #[error("unknown type tag {bits:#x} in header at {address}")]
    UnknownTag {
        /// The unrecognized tag bits
        bits: u8,
        /// Word address of the header
        address: Address,
    },

    /// Word access outside the object's header-declared extent.
    #[error("offset {offset} out of bounds at {address} (object spans {size_in_words} words)")]
    OutOfBounds {
        /// Word address of the object
        address: Address,
        /// Offending word offset
        offset: u32,
        /// Object extent per its header
        size_in_words: u32,
    },

    /// Allocation size of zero or beyond the header's size field.
    #[error("invalid allocation size of {size_in_words} words")]
    BadSize {
        /// Requested total extent
        size_in_words: u32,
    },

    /// No room left even after compaction.
    #[error("out of heap memory: requested {requested} words, {free} free")]
    OutOfMemory {
        /// Requested total extent
        requested: u32,
        /// Contiguous free words available
        free: u32,
    },

    /// Weak handle used after its target was freed.
    #[error("weak handle target has been freed")]
    StaleWeakHandle,

    /// Typed view applied to an object of another kind.
    #[error("expected a {expected:?} object, found {found:?}")]
    TagMismatch {
        /// Tag the view requires
        expected: TypeTag,
        /// Tag found in the header
        found: TypeTag,
    },

    /// Stored code units do not decode as a string.
    #[error("string object holds malformed code units")]
    MalformedString,

    /// Substring range outside the string.
    #[error("substring [{start}, {start}+{length}) out of range (length {char_length})")]
    SubstringOutOfRange {
        /// Starting code unit
        start: u32,
        /// Requested unit count
        length: u32,
        /// String's code unit length
        char_length: u32,
    },

    /// Array access outside the element region.
    #[error("array index {index} out of range (length {length})")]
    ArrayIndexOutOfRange {
        /// Offending index
        index: u32,
        /// Array length
        length: u32,
    },
}

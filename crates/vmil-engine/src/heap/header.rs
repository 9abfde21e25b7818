//! Heap object headers
//!
//! Every heap value occupies a whole number of fixed-size words. Word 0 of
//! every object is a header packing the object's type tag and its full word
//! extent (header included).

use super::HeapError;

/// The atomic unit of heap storage and of the bytecode stream.
pub type Word = u32;

/// A word index into heap storage.
///
/// Raw addresses are only valid between two allocations; anything longer-lived
/// must be held as a [`Handle`](super::Handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u32);

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

impl Address {
    /// Word index as a usize.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Type tag stored in the low bits of every object header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// Freed region awaiting compaction; skipped by heap traversal.
    Free = 0,
    /// Class instance: `[header][class id][field words…]`.
    Instance = 1,
    /// Immutable string: `[header][char length][packed code-unit words…]`.
    String = 2,
    /// Array: `[header][length][elements…][reference bitmap words…]`.
    Array = 3,
    /// Untyped raw words.
    Raw = 4,
}

impl TypeTag {
    /// Decode a tag from its bit pattern.
    pub fn from_bits(bits: u8) -> Option<TypeTag> {
        match bits {
            0 => Some(TypeTag::Free),
            1 => Some(TypeTag::Instance),
            2 => Some(TypeTag::String),
            3 => Some(TypeTag::Array),
            4 => Some(TypeTag::Raw),
            _ => None,
        }
    }
}

/// Object header: `(size_in_words << 4) | tag`
///
/// `size_in_words` always equals the object's actual word extent, header
/// included. Every heap traversal, the collector's included, depends on that
/// invariant holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header(Word);

impl Header {
    /// Number of low bits holding the type tag.
    pub const TAG_BITS: u32 = 4;
    /// Mask selecting the type tag.
    pub const TAG_MASK: Word = (1 << Self::TAG_BITS) - 1;
    /// Largest representable object extent in words.
    pub const MAX_SIZE_WORDS: u32 = (1 << (32 - Self::TAG_BITS)) - 1;

    /// Build a header for an object of `size_in_words` total words.
    pub fn new(tag: TypeTag, size_in_words: u32) -> Header {
        debug_assert!(size_in_words >= 1, "an object is at least its header");
        debug_assert!(size_in_words <= Self::MAX_SIZE_WORDS);
        Header((size_in_words << Self::TAG_BITS) | tag as Word)
    }

    /// Decode a header word, rejecting unknown tags.
    pub fn decode(word: Word, address: Address) -> Result<Header, HeapError> {
        let bits = (word & Self::TAG_MASK) as u8;
        match TypeTag::from_bits(bits) {
            Some(_) => Ok(Header(word)),
            None => Err(HeapError::UnknownTag { bits, address }),
        }
    }

    /// The object's type tag.
    #[inline]
    pub fn tag(self) -> TypeTag {
        // Only constructed through `new`/`decode`, so the tag bits are valid.
        TypeTag::from_bits((self.0 & Self::TAG_MASK) as u8).unwrap_or(TypeTag::Free)
    }

    /// Total extent of the object in words, header included.
    #[inline]
    pub fn size_in_words(self) -> u32 {
        self.0 >> Self::TAG_BITS
    }

    /// The raw header word.
    #[inline]
    pub fn word(self) -> Word {
        self.0
    }
}

//! Typed views over heap objects
//!
//! Instances, strings, and arrays are plain word runs; these views give them
//! their layouts and keep every access bounds-checked. All accessors go
//! through a handle and re-resolve the address per access, so they stay
//! correct across compaction.
//!
//! Layouts (word 0 is always the header):
//! - instance: `[header][class id][fields…]`
//! - string:   `[header][char length][ceil(len/2) packed words]`
//! - array:    `[header][length][elements…][ceil(len/32) bitmap words]`

use super::handle::Handle;
use super::header::{TypeTag, Word};
use super::heap::Heap;
use super::HeapError;

fn expect_tag(heap: &Heap, handle: &Handle, expected: TypeTag) -> Result<(), HeapError> {
    let found = heap.header(handle)?.tag();
    if found != expected {
        return Err(HeapError::TagMismatch { expected, found });
    }
    Ok(())
}

// ============================================================================
// Instances
// ============================================================================

/// Accessors for class instances.
pub struct Instance;

impl Instance {
    const FIELDS_BASE: u32 = 2;

    /// Allocate an instance with `field_count` zeroed field words.
    ///
    /// `class_word` is the arena index of the instance's class; the class
    /// graph itself does not live on the word heap.
    pub fn create(heap: &mut Heap, class_word: Word, field_count: u32) -> Result<Handle, HeapError> {
        let handle = heap.allocate(TypeTag::Instance, Self::FIELDS_BASE + field_count)?;
        heap.store(&handle, 1, class_word)?;
        Ok(handle)
    }

    /// The instance's class arena index.
    pub fn class_word(heap: &Heap, handle: &Handle) -> Result<Word, HeapError> {
        expect_tag(heap, handle, TypeTag::Instance)?;
        heap.load(handle, 1)
    }

    /// Number of field words.
    pub fn field_count(heap: &Heap, handle: &Handle) -> Result<u32, HeapError> {
        expect_tag(heap, handle, TypeTag::Instance)?;
        Ok(heap.header(handle)?.size_in_words() - Self::FIELDS_BASE)
    }

    /// Read a field by absolute field index (linearized layout).
    pub fn field(heap: &Heap, handle: &Handle, index: u32) -> Result<Word, HeapError> {
        expect_tag(heap, handle, TypeTag::Instance)?;
        heap.load(handle, Self::FIELDS_BASE + index)
    }

    /// Write a field by absolute field index.
    pub fn set_field(
        heap: &mut Heap,
        handle: &Handle,
        index: u32,
        value: Word,
    ) -> Result<(), HeapError> {
        expect_tag(heap, handle, TypeTag::Instance)?;
        heap.store(handle, Self::FIELDS_BASE + index, value)
    }
}

// ============================================================================
// Strings
// ============================================================================

/// Pack UTF-16 code units two per word, first unit in the high half.
///
/// An odd count leaves the final word's low half zero.
pub fn pack_units(units: &[u16]) -> Vec<Word> {
    units
        .chunks(2)
        .map(|pair| {
            let high = pair[0] as Word;
            let low = pair.get(1).copied().unwrap_or(0) as Word;
            (high << 16) | low
        })
        .collect()
}

/// Unpack `count` UTF-16 code units from packed words, masking the unused
/// low half of the final word for odd counts.
pub fn unpack_units(words: &[Word], count: usize) -> Vec<u16> {
    let mut units = Vec::with_capacity(count);
    for (i, &word) in words.iter().enumerate() {
        units.push((word >> 16) as u16);
        if 2 * i + 1 < count {
            units.push((word & 0xFFFF) as u16);
        }
    }
    units.truncate(count);
    units
}

/// Number of words needed to pack `count` code units.
pub fn packed_word_count(count: usize) -> usize {
    count.div_ceil(2)
}

/// Accessors for immutable heap strings.
pub struct StringObject;

impl StringObject {
    /// Allocate a string object holding `text`'s UTF-16 code units.
    pub fn create(heap: &mut Heap, text: &str) -> Result<Handle, HeapError> {
        let units: Vec<u16> = text.encode_utf16().collect();
        let packed = pack_units(&units);
        let handle = heap.allocate(TypeTag::String, 2 + packed.len() as u32)?;
        heap.store(&handle, 1, units.len() as Word)?;
        for (i, &word) in packed.iter().enumerate() {
            heap.store(&handle, 2 + i as u32, word)?;
        }
        Ok(handle)
    }

    /// Logical character (code unit) length.
    pub fn char_length(heap: &Heap, handle: &Handle) -> Result<u32, HeapError> {
        expect_tag(heap, handle, TypeTag::String)?;
        heap.load(handle, 1)
    }

    /// Decode the string's content.
    pub fn read(heap: &Heap, handle: &Handle) -> Result<String, HeapError> {
        let length = Self::char_length(heap, handle)? as usize;
        let mut words = Vec::with_capacity(packed_word_count(length));
        for i in 0..packed_word_count(length) {
            words.push(heap.load(handle, 2 + i as u32)?);
        }
        let units = unpack_units(&words, length);
        String::from_utf16(&units).map_err(|_| HeapError::MalformedString)
    }

    /// Content equality, masking the unused half of the final word so a
    /// dirty pad can never break comparison.
    pub fn content_eq(heap: &Heap, a: &Handle, b: &Handle) -> Result<bool, HeapError> {
        let len_a = Self::char_length(heap, a)?;
        if len_a != Self::char_length(heap, b)? {
            return Ok(false);
        }
        let words = packed_word_count(len_a as usize);
        for i in 0..words {
            let mut wa = heap.load(a, 2 + i as u32)?;
            let mut wb = heap.load(b, 2 + i as u32)?;
            if len_a % 2 == 1 && i == words - 1 {
                wa &= 0xFFFF_0000;
                wb &= 0xFFFF_0000;
            }
            if wa != wb {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Copy out `length` code units starting at `start` as a new string.
    pub fn substring(
        heap: &mut Heap,
        handle: &Handle,
        start: u32,
        length: u32,
    ) -> Result<Handle, HeapError> {
        let total = Self::char_length(heap, handle)?;
        let end = start.checked_add(length).ok_or(HeapError::SubstringOutOfRange {
            start,
            length,
            char_length: total,
        })?;
        if end > total {
            return Err(HeapError::SubstringOutOfRange {
                start,
                length,
                char_length: total,
            });
        }
        let mut words = Vec::with_capacity(packed_word_count(total as usize));
        for i in 0..packed_word_count(total as usize) {
            words.push(heap.load(handle, 2 + i as u32)?);
        }
        let units = unpack_units(&words, total as usize);
        let slice = &units[start as usize..end as usize];
        let packed = pack_units(slice);
        let out = heap.allocate(TypeTag::String, 2 + packed.len() as u32)?;
        heap.store(&out, 1, slice.len() as Word)?;
        for (i, &word) in packed.iter().enumerate() {
            heap.store(&out, 2 + i as u32, word)?;
        }
        Ok(out)
    }
}

// ============================================================================
// Arrays
// ============================================================================

/// Accessors for arrays with a per-slot reference bitmap.
pub struct ArrayObject;

impl ArrayObject {
    const ELEMENTS_BASE: u32 = 2;
    const BITS_PER_WORD: u32 = 32;

    fn bitmap_word_count(length: u32) -> u32 {
        length.div_ceil(Self::BITS_PER_WORD)
    }

    /// Allocate an array of `length` zeroed, non-reference slots.
    pub fn create(heap: &mut Heap, length: u32) -> Result<Handle, HeapError> {
        let size = Self::ELEMENTS_BASE + length + Self::bitmap_word_count(length);
        let handle = heap.allocate(TypeTag::Array, size)?;
        heap.store(&handle, 1, length)?;
        Ok(handle)
    }

    /// Element count.
    pub fn length(heap: &Heap, handle: &Handle) -> Result<u32, HeapError> {
        expect_tag(heap, handle, TypeTag::Array)?;
        heap.load(handle, 1)
    }

    fn checked_index(heap: &Heap, handle: &Handle, index: u32) -> Result<u32, HeapError> {
        let length = Self::length(heap, handle)?;
        if index >= length {
            return Err(HeapError::ArrayIndexOutOfRange { index, length });
        }
        Ok(length)
    }

    /// Read the element at `index`.
    pub fn get(heap: &Heap, handle: &Handle, index: u32) -> Result<Word, HeapError> {
        Self::checked_index(heap, handle, index)?;
        heap.load(handle, Self::ELEMENTS_BASE + index)
    }

    /// Write the element at `index`, recording whether it is a traced
    /// reference or a raw value in the bitmap.
    pub fn set(
        heap: &mut Heap,
        handle: &Handle,
        index: u32,
        value: Word,
        is_reference: bool,
    ) -> Result<(), HeapError> {
        let length = Self::checked_index(heap, handle, index)?;
        heap.store(handle, Self::ELEMENTS_BASE + index, value)?;
        let bitmap_offset = Self::ELEMENTS_BASE + length + index / Self::BITS_PER_WORD;
        let bit = 1u32 << (index % Self::BITS_PER_WORD);
        let word = heap.load(handle, bitmap_offset)?;
        let word = if is_reference { word | bit } else { word & !bit };
        heap.store(handle, bitmap_offset, word)
    }

    /// Whether the slot at `index` holds a traced reference.
    pub fn is_reference(heap: &Heap, handle: &Handle, index: u32) -> Result<bool, HeapError> {
        let length = Self::checked_index(heap, handle, index)?;
        let bitmap_offset = Self::ELEMENTS_BASE + length + index / Self::BITS_PER_WORD;
        let word = heap.load(handle, bitmap_offset)?;
        Ok(word & (1 << (index % Self::BITS_PER_WORD)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_odd_length_pads_low_half() {
        let packed = pack_units(&[0x0041, 0x0042, 0x0043]);
        assert_eq!(packed, vec![0x0041_0042, 0x0043_0000]);
        assert_eq!(unpack_units(&packed, 3), vec![0x41, 0x42, 0x43]);
    }

    #[test]
    fn test_string_round_trip_odd_length() {
        let mut heap = Heap::new(256);
        let s = StringObject::create(&mut heap, "hello").unwrap();
        assert_eq!(StringObject::char_length(&heap, &s).unwrap(), 5);
        assert_eq!(StringObject::read(&heap, &s).unwrap(), "hello");
    }

    #[test]
    fn test_string_content_eq_masks_final_half_word() {
        let mut heap = Heap::new(256);
        let a = StringObject::create(&mut heap, "abc").unwrap();
        let b = StringObject::create(&mut heap, "abc").unwrap();
        // Dirty the pad half of b's final word through the raw heap surface;
        // comparison must not see it.
        let raw = heap.load(&b, 3).unwrap();
        heap.store(&b, 3, raw | 0x0000_FFFF).unwrap();
        assert!(StringObject::content_eq(&heap, &a, &b).unwrap());
    }

    #[test]
    fn test_substring_bounds() {
        let mut heap = Heap::new(256);
        let s = StringObject::create(&mut heap, "linearize").unwrap();
        let sub = StringObject::substring(&mut heap, &s, 0, 6).unwrap();
        assert_eq!(StringObject::read(&heap, &sub).unwrap(), "linear");

        assert!(matches!(
            StringObject::substring(&mut heap, &s, 4, 9),
            Err(HeapError::SubstringOutOfRange { .. })
        ));
    }

    #[test]
    fn test_array_reference_bitmap() {
        let mut heap = Heap::new(256);
        let a = ArrayObject::create(&mut heap, 40).unwrap();
        ArrayObject::set(&mut heap, &a, 0, 11, false).unwrap();
        ArrayObject::set(&mut heap, &a, 33, 22, true).unwrap();

        assert_eq!(ArrayObject::get(&heap, &a, 0).unwrap(), 11);
        assert_eq!(ArrayObject::get(&heap, &a, 33).unwrap(), 22);
        assert!(!ArrayObject::is_reference(&heap, &a, 0).unwrap());
        assert!(ArrayObject::is_reference(&heap, &a, 33).unwrap());

        // Clearing the slot clears its reference bit.
        ArrayObject::set(&mut heap, &a, 33, 0, false).unwrap();
        assert!(!ArrayObject::is_reference(&heap, &a, 33).unwrap());
    }

    #[test]
    fn test_array_index_out_of_range() {
        let mut heap = Heap::new(64);
        let a = ArrayObject::create(&mut heap, 4).unwrap();
        assert!(matches!(
            ArrayObject::get(&heap, &a, 4),
            Err(HeapError::ArrayIndexOutOfRange { index: 4, length: 4 })
        ));
    }

    #[test]
    fn test_instance_fields() {
        let mut heap = Heap::new(64);
        let obj = Instance::create(&mut heap, 7, 3).unwrap();
        assert_eq!(Instance::class_word(&heap, &obj).unwrap(), 7);
        assert_eq!(Instance::field_count(&heap, &obj).unwrap(), 3);

        Instance::set_field(&mut heap, &obj, 2, 42).unwrap();
        assert_eq!(Instance::field(&heap, &obj, 2).unwrap(), 42);
        assert!(Instance::field(&heap, &obj, 3).is_err());
    }
}

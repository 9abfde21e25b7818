//! Literal pools for the image format
//!
//! The image opens with an integer pool and a string pool; a pool index is
//! an entry's read order. Strings use the same two-code-units-per-word
//! packing as heap strings, so an image string and its heap materialization
//! are word-for-word identical.

use super::encoder::{WordReader, WordWriter};
use super::image::LoadError;
use crate::heap::{pack_units, packed_word_count, unpack_units, Word};
use rustc_hash::FxHashMap;

/// Deduplicating integer pool.
#[derive(Debug, Default)]
pub struct IntegerPool {
    values: Vec<i32>,
    index: FxHashMap<i32, u32>,
}

impl IntegerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, reusing an existing entry.
    pub fn intern(&mut self, value: i32) -> u32 {
        if let Some(&index) = self.index.get(&value) {
            return index;
        }
        let index = self.values.len() as u32;
        self.values.push(value);
        self.index.insert(value, index);
        index
    }

    /// Look up a value by pool index.
    pub fn get(&self, index: u32) -> Option<i32> {
        self.values.get(index as usize).copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Emit count then raw values.
    pub fn encode(&self, writer: &mut WordWriter) {
        writer.emit(self.values.len() as Word);
        for &value in &self.values {
            writer.emit_i32(value);
        }
    }

    /// Read count then raw values.
    pub fn decode(reader: &mut WordReader<'_>) -> Result<Self, LoadError> {
        let count = reader.read()? as usize;
        if count > reader.remaining() {
            return Err(LoadError::CountTooLarge {
                what: "integer pool",
                count,
                remaining: reader.remaining(),
                position: reader.position(),
            });
        }
        let mut pool = IntegerPool::new();
        for _ in 0..count {
            pool.intern(reader.read_i32()?);
        }
        Ok(pool)
    }
}

/// Deduplicating string pool.
#[derive(Debug, Default)]
pub struct StringPool {
    values: Vec<String>,
    index: FxHashMap<String, u32>,
}

impl StringPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a string, reusing an existing entry.
    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(&index) = self.index.get(value) {
            return index;
        }
        let index = self.values.len() as u32;
        self.values.push(value.to_string());
        self.index.insert(value.to_string(), index);
        index
    }

    /// Look up a string by pool index.
    pub fn get(&self, index: u32) -> Option<&str> {
        self.values.get(index as usize).map(|s| s.as_str())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Emit count, then per string its character length and packed words.
    ///
    /// An odd length leaves the final word's low half zero.
    pub fn encode(&self, writer: &mut WordWriter) {
        writer.emit(self.values.len() as Word);
        for value in &self.values {
            let units: Vec<u16> = value.encode_utf16().collect();
            writer.emit(units.len() as Word);
            for word in pack_units(&units) {
                writer.emit(word);
            }
        }
    }

    /// Read count, then per string its character length and packed words,
    /// masking the unused half of the final word.
    pub fn decode(reader: &mut WordReader<'_>) -> Result<Self, LoadError> {
        let count = reader.read()? as usize;
        if count > reader.remaining() {
            return Err(LoadError::CountTooLarge {
                what: "string pool",
                count,
                remaining: reader.remaining(),
                position: reader.position(),
            });
        }
        let mut pool = StringPool::new();
        for _ in 0..count {
            let length = reader.read()? as usize;
            let word_count = packed_word_count(length);
            if word_count > reader.remaining() {
                return Err(LoadError::CountTooLarge {
                    what: "string entry",
                    count: word_count,
                    remaining: reader.remaining(),
                    position: reader.position(),
                });
            }
            let mut words = Vec::with_capacity(word_count);
            for _ in 0..word_count {
                words.push(reader.read()?);
            }
            let units = unpack_units(&words, length);
            let value = String::from_utf16(&units).map_err(|_| LoadError::MalformedString {
                position: reader.position(),
            })?;
            // Decoded entries keep their read order even when a hostile
            // stream repeats a value; interning would renumber later indices.
            let index = pool.values.len() as u32;
            pool.index.entry(value.clone()).or_insert(index);
            pool.values.push(value);
        }
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_pool_dedupes() {
        let mut pool = IntegerPool::new();
        let a = pool.intern(70_000_000);
        let b = pool.intern(-5);
        let c = pool.intern(70_000_000);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.get(b), Some(-5));
    }

    #[test]
    fn test_integer_pool_round_trip() {
        let mut pool = IntegerPool::new();
        pool.intern(i32::MIN);
        pool.intern(0);
        pool.intern(i32::MAX);

        let mut writer = WordWriter::new();
        pool.encode(&mut writer);
        let mut reader = WordReader::new(writer.words());
        let decoded = IntegerPool::decode(&mut reader).unwrap();

        assert_eq!(decoded.get(0), Some(i32::MIN));
        assert_eq!(decoded.get(1), Some(0));
        assert_eq!(decoded.get(2), Some(i32::MAX));
    }

    #[test]
    fn test_string_pool_round_trip_odd_length() {
        let mut pool = StringPool::new();
        pool.intern("foo:1");
        pool.intern("x");
        pool.intern("");

        let mut writer = WordWriter::new();
        pool.encode(&mut writer);
        let mut reader = WordReader::new(writer.words());
        let decoded = StringPool::decode(&mut reader).unwrap();

        assert_eq!(decoded.get(0), Some("foo:1"));
        assert_eq!(decoded.get(1), Some("x"));
        assert_eq!(decoded.get(2), Some(""));
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn test_string_pool_rejects_oversized_count() {
        // Claims 1000 strings with no words behind them.
        let words = [1000u32];
        let mut reader = WordReader::new(&words);
        assert!(matches!(
            StringPool::decode(&mut reader),
            Err(LoadError::CountTooLarge { .. })
        ));
    }

    #[test]
    fn test_truncated_string_entry() {
        // One string of 4 code units needs 2 packed words; only 1 present.
        let words = [1u32, 4, 0x0041_0042];
        let mut reader = WordReader::new(&words);
        assert!(StringPool::decode(&mut reader).is_err());
    }
}

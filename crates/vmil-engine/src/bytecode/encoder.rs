//! Word stream reader and writer
//!
//! The image format is a flat stream of 32-bit words; position defines
//! meaning. Byte order appears only at the file boundary, where words are
//! framed little-endian so images are portable between hosts.

use crate::heap::Word;
use std::io;
use thiserror::Error;

/// Raw word-stream decode errors
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Stream ended inside a structure.
    #[error("unexpected end of stream at word {position}")]
    UnexpectedEnd {
        /// Word position at which more input was required
        position: usize,
    },

    /// Byte length is not a whole number of words.
    #[error("stream of {bytes} bytes is not a whole number of words")]
    TruncatedStream {
        /// Total byte length observed
        bytes: usize,
    },
}

/// Append-only word buffer.
#[derive(Debug, Default)]
pub struct WordWriter {
    words: Vec<Word>,
}

impl WordWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one word.
    #[inline]
    pub fn emit(&mut self, word: Word) {
        self.words.push(word);
    }

    /// Append a signed value as its word bit pattern.
    #[inline]
    pub fn emit_i32(&mut self, value: i32) {
        self.words.push(value as Word);
    }

    /// Words emitted so far.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// The buffered words.
    pub fn words(&self) -> &[Word] {
        &self.words
    }

    /// Consume the writer, yielding its words.
    pub fn into_words(self) -> Vec<Word> {
        self.words
    }

    /// Write the buffered words little-endian to a byte sink.
    pub fn write_to(&self, sink: &mut impl io::Write) -> io::Result<()> {
        for &word in &self.words {
            sink.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }
}

/// Cursor over a word slice.
#[derive(Debug)]
pub struct WordReader<'a> {
    words: &'a [Word],
    position: usize,
}

impl<'a> WordReader<'a> {
    /// Read over an in-memory word slice.
    pub fn new(words: &'a [Word]) -> Self {
        Self { words, position: 0 }
    }

    /// Read the next word.
    pub fn read(&mut self) -> Result<Word, DecodeError> {
        let word = *self
            .words
            .get(self.position)
            .ok_or(DecodeError::UnexpectedEnd {
                position: self.position,
            })?;
        self.position += 1;
        Ok(word)
    }

    /// Read the next word as a signed value.
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read()? as i32)
    }

    /// Current word position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Words left to read.
    pub fn remaining(&self) -> usize {
        self.words.len() - self.position
    }

    /// Whether the whole stream has been consumed.
    pub fn at_end(&self) -> bool {
        self.position == self.words.len()
    }
}

/// Drain a byte source into words, rejecting partial trailing words.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<Word>, DecodeError> {
    if bytes.len() % 4 != 0 {
        return Err(DecodeError::TruncatedStream { bytes: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| Word::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

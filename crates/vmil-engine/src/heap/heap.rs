//! Reference heap implementing the allocator contract
//!
//! The production collector is an external collaborator; this heap implements
//! the same surface — zero-initialized word allocation, word-indexed access
//! through handles, relocation on compaction — so the handle discipline can
//! be exercised in-tree. Allocation may compact, which means any address held
//! across an allocating call must be held as a handle.

use super::handle::{Handle, HandleTable, WeakHandle};
use super::header::{Address, Header, TypeTag, Word};
use super::HeapError;
use rustc_hash::FxHashMap;

/// Bump-allocating, compacting word heap.
#[derive(Debug)]
pub struct Heap {
    words: Vec<Word>,
    /// Allocation cursor: everything below is object data (live or freed).
    top: usize,
    capacity: usize,
    handles: HandleTable,
    freed_words: usize,
}

impl Heap {
    /// Create a heap with a fixed capacity in words.
    pub fn new(capacity_words: usize) -> Self {
        Self {
            words: vec![0; capacity_words],
            top: 0,
            capacity: capacity_words,
            handles: HandleTable::new(),
            freed_words: 0,
        }
    }

    /// Allocate a zero-initialized object of `size_in_words` total words
    /// (header included) and return a strong handle to it.
    ///
    /// May compact the heap, relocating every existing object.
    pub fn allocate(&mut self, tag: TypeTag, size_in_words: u32) -> Result<Handle, HeapError> {
        if size_in_words == 0 || size_in_words > Header::MAX_SIZE_WORDS {
            return Err(HeapError::BadSize {
                size_in_words,
            });
        }
        let needed = size_in_words as usize;
        if self.capacity - self.top < needed && self.freed_words > 0 {
            self.compact();
        }
        if self.capacity - self.top < needed {
            return Err(HeapError::OutOfMemory {
                requested: size_in_words,
                free: (self.capacity - self.top) as u32,
            });
        }
        let address = Address(self.top as u32);
        self.words[self.top] = Header::new(tag, size_in_words).word();
        for word in &mut self.words[self.top + 1..self.top + needed] {
            *word = 0;
        }
        self.top += needed;
        Ok(self.handles.insert_strong(address))
    }

    /// Header of the object behind a strong handle.
    pub fn header(&self, handle: &Handle) -> Result<Header, HeapError> {
        let address = self.handles.address_of(handle);
        Header::decode(self.words[address.index()], address)
    }

    /// Read the word at `offset` within the object (offset 0 is the header).
    pub fn load(&self, handle: &Handle, offset: u32) -> Result<Word, HeapError> {
        let address = self.handles.address_of(handle);
        let header = Header::decode(self.words[address.index()], address)?;
        if offset >= header.size_in_words() {
            return Err(HeapError::OutOfBounds {
                address,
                offset,
                size_in_words: header.size_in_words(),
            });
        }
        Ok(self.words[address.index() + offset as usize])
    }

    /// Write the word at `offset` within the object.
    ///
    /// Offset 0 is the header and is only written by `allocate`; storing
    /// there is an out-of-bounds error.
    pub fn store(&mut self, handle: &Handle, offset: u32, value: Word) -> Result<(), HeapError> {
        let address = self.handles.address_of(handle);
        let header = Header::decode(self.words[address.index()], address)?;
        if offset == 0 || offset >= header.size_in_words() {
            return Err(HeapError::OutOfBounds {
                address,
                offset,
                size_in_words: header.size_in_words(),
            });
        }
        self.words[address.index() + offset as usize] = value;
        Ok(())
    }

    /// Register a weak handle aliasing a strong one.
    pub fn downgrade(&mut self, handle: &Handle) -> WeakHandle {
        let address = self.handles.address_of(handle);
        self.handles.insert_weak(address)
    }

    /// Re-validate a weak handle. `None` once the target has been freed.
    pub fn upgrade(&self, weak: WeakHandle) -> Option<Address> {
        self.handles.upgrade(weak)
    }

    /// Read a word through a weak handle, failing if the target died.
    pub fn load_weak(&self, weak: WeakHandle, offset: u32) -> Result<Word, HeapError> {
        let address = self.handles.upgrade(weak).ok_or(HeapError::StaleWeakHandle)?;
        let header = Header::decode(self.words[address.index()], address)?;
        if offset >= header.size_in_words() {
            return Err(HeapError::OutOfBounds {
                address,
                offset,
                size_in_words: header.size_in_words(),
            });
        }
        Ok(self.words[address.index() + offset as usize])
    }

    /// Release a weak handle's table slot.
    pub fn release_weak(&mut self, weak: WeakHandle) {
        self.handles.release_weak(weak);
    }

    /// Free the object, consuming its strong handle.
    ///
    /// The region keeps its extent under a `Free` tag so traversal stays
    /// intact until the next compaction reclaims it.
    pub fn free(&mut self, handle: Handle) -> Result<(), HeapError> {
        let address = self.handles.address_of(&handle);
        let header = Header::decode(self.words[address.index()], address)?;
        self.words[address.index()] = Header::new(TypeTag::Free, header.size_in_words()).word();
        self.freed_words += header.size_in_words() as usize;
        self.handles.release(handle);
        Ok(())
    }

    /// Slide live objects down over freed regions and fix up every handle.
    pub fn compact(&mut self) {
        if self.freed_words == 0 {
            return;
        }
        let mut relocation: FxHashMap<Address, Address> = FxHashMap::default();
        let mut cursor = 0usize;
        let mut dest = 0usize;
        while cursor < self.top {
            let header = Header::decode(self.words[cursor], Address(cursor as u32))
                .unwrap_or_else(|_| unreachable!("heap traversal hit a corrupt header"));
            let size = header.size_in_words() as usize;
            if header.tag() != TypeTag::Free {
                if dest != cursor {
                    self.words.copy_within(cursor..cursor + size, dest);
                }
                relocation.insert(Address(cursor as u32), Address(dest as u32));
                dest += size;
            }
            cursor += size;
        }
        log::debug!(
            "heap compaction reclaimed {} words ({} -> {})",
            self.top - dest,
            self.top,
            dest
        );
        self.top = dest;
        self.freed_words = 0;
        self.handles
            .retarget(|old| relocation.get(&old).copied());
    }

    /// Words currently occupied (live plus not-yet-reclaimed freed regions).
    pub fn used_words(&self) -> usize {
        self.top
    }

    /// Total heap capacity in words.
    pub fn capacity_words(&self) -> usize {
        self.capacity
    }

    /// The handle table, for collaborators that enumerate roots.
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_zero_initialized() {
        let mut heap = Heap::new(64);
        let h = heap.allocate(TypeTag::Raw, 4).unwrap();
        assert_eq!(heap.header(&h).unwrap().tag(), TypeTag::Raw);
        for offset in 1..4 {
            assert_eq!(heap.load(&h, offset).unwrap(), 0);
        }
    }

    #[test]
    fn test_load_store_bounds_checked() {
        let mut heap = Heap::new(64);
        let h = heap.allocate(TypeTag::Raw, 3).unwrap();
        heap.store(&h, 2, 99).unwrap();
        assert_eq!(heap.load(&h, 2).unwrap(), 99);

        assert!(matches!(
            heap.load(&h, 3),
            Err(HeapError::OutOfBounds { offset: 3, .. })
        ));
        // The header word is not writable through `store`.
        assert!(matches!(
            heap.store(&h, 0, 1),
            Err(HeapError::OutOfBounds { offset: 0, .. })
        ));
    }

    #[test]
    fn test_compaction_fixes_strong_handles() {
        let mut heap = Heap::new(64);
        let a = heap.allocate(TypeTag::Raw, 8).unwrap();
        let b = heap.allocate(TypeTag::Raw, 4).unwrap();
        heap.store(&b, 1, 0xBEEF).unwrap();

        heap.free(a).unwrap();
        heap.compact();

        // `b` slid down over the freed region and still reads its own words.
        assert_eq!(heap.load(&b, 1).unwrap(), 0xBEEF);
        assert_eq!(heap.used_words(), 4);
    }

    #[test]
    fn test_allocation_triggers_compaction() {
        let mut heap = Heap::new(16);
        let a = heap.allocate(TypeTag::Raw, 8).unwrap();
        let b = heap.allocate(TypeTag::Raw, 8).unwrap();
        heap.store(&b, 7, 7).unwrap();
        heap.free(a).unwrap();

        // No contiguous room without compacting first.
        let c = heap.allocate(TypeTag::Raw, 8).unwrap();
        assert_eq!(heap.load(&b, 7).unwrap(), 7);
        assert_eq!(heap.load(&c, 1).unwrap(), 0);
    }

    #[test]
    fn test_out_of_memory() {
        let mut heap = Heap::new(8);
        let _a = heap.allocate(TypeTag::Raw, 8).unwrap();
        assert!(matches!(
            heap.allocate(TypeTag::Raw, 2),
            Err(HeapError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_weak_handle_survives_compaction_but_not_free() {
        let mut heap = Heap::new(64);
        let a = heap.allocate(TypeTag::Raw, 8).unwrap();
        let b = heap.allocate(TypeTag::Raw, 4).unwrap();
        heap.store(&b, 1, 21).unwrap();
        let weak_b = heap.downgrade(&b);
        let weak_a = heap.downgrade(&a);

        heap.free(a).unwrap();
        heap.compact();

        // Best effort: the survivor was fixed up, the dead target cleared.
        assert_eq!(heap.load_weak(weak_b, 1).unwrap(), 21);
        assert!(matches!(
            heap.load_weak(weak_a, 1),
            Err(HeapError::StaleWeakHandle)
        ));
    }
}

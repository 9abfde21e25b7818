//! Handle indirection over heap addresses
//!
//! The heap may relocate objects between any two allocations, so raw
//! addresses must never live in long-lived state. A [`Handle`] is a slot in
//! the [`HandleTable`]; the table is the single place the heap fixes up when
//! compaction moves objects.
//!
//! Strong handles keep their target alive and are always fixed up. Weak
//! handles are best-effort: a weak slot whose target died is cleared, and the
//! holder must re-validate through [`HandleTable::upgrade`] before use.

use super::Address;

/// A strong reference to a heap object.
///
/// Not `Copy`: releasing a handle consumes it, so a slot cannot be freed
/// while an alias is still outstanding.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Slot index within the handle table.
    #[inline]
    pub fn slot(&self) -> u32 {
        self.0
    }
}

/// A weak reference to a heap object. Must be upgraded before every use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakHandle(u32);

#[derive(Debug, Clone, Copy)]
enum Slot {
    Strong(Address),
    Weak(Address),
    /// Weak slot whose target was freed.
    Dead,
    /// Free-list link.
    Free(Option<u32>),
}

/// Slot arena backing both handle flavors.
#[derive(Debug, Default)]
pub struct HandleTable {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    strong_count: usize,
}

impl HandleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&mut self, slot: Slot) -> u32 {
        match self.free_head {
            Some(index) => {
                let next = match self.slots[index as usize] {
                    Slot::Free(next) => next,
                    _ => unreachable!("free list points at a live slot"),
                };
                self.free_head = next;
                self.slots[index as usize] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Register a strong handle for `address`.
    pub fn insert_strong(&mut self, address: Address) -> Handle {
        self.strong_count += 1;
        Handle(self.claim(Slot::Strong(address)))
    }

    /// Register a weak handle for `address`.
    pub fn insert_weak(&mut self, address: Address) -> WeakHandle {
        WeakHandle(self.claim(Slot::Weak(address)))
    }

    /// Current address of a strong handle's target.
    #[inline]
    pub fn address_of(&self, handle: &Handle) -> Address {
        match self.slots[handle.0 as usize] {
            Slot::Strong(address) => address,
            _ => unreachable!("strong handle outlived its slot"),
        }
    }

    /// Current address of a weak handle's target, if it is still live.
    pub fn upgrade(&self, handle: WeakHandle) -> Option<Address> {
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Weak(address)) => Some(*address),
            _ => None,
        }
    }

    /// Release a strong handle, consuming it.
    pub fn release(&mut self, handle: Handle) -> Address {
        let address = self.address_of(&handle);
        self.slots[handle.0 as usize] = Slot::Free(self.free_head);
        self.free_head = Some(handle.0);
        self.strong_count -= 1;
        address
    }

    /// Release a weak handle's slot.
    pub fn release_weak(&mut self, handle: WeakHandle) {
        if let Some(Slot::Weak(_) | Slot::Dead) = self.slots.get(handle.0 as usize) {
            self.slots[handle.0 as usize] = Slot::Free(self.free_head);
            self.free_head = Some(handle.0);
        }
    }

    /// Apply a relocation to every slot.
    ///
    /// `relocate` maps an old address to its new one, or `None` if the target
    /// was freed. Strong targets are never freed while their handle lives, so
    /// `None` for a strong slot is a fatal heap invariant violation. Weak
    /// slots whose target died are cleared.
    pub fn retarget(&mut self, mut relocate: impl FnMut(Address) -> Option<Address>) {
        for slot in &mut self.slots {
            match *slot {
                Slot::Strong(old) => match relocate(old) {
                    Some(new) => *slot = Slot::Strong(new),
                    None => unreachable!("strong handle target collected"),
                },
                Slot::Weak(old) => {
                    *slot = match relocate(old) {
                        Some(new) => Slot::Weak(new),
                        None => Slot::Dead,
                    };
                }
                Slot::Dead | Slot::Free(_) => {}
            }
        }
    }

    /// Addresses of all strong slots (the root set for compaction).
    pub fn strong_addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Strong(address) => Some(*address),
            _ => None,
        })
    }

    /// Number of live strong handles.
    pub fn strong_count(&self) -> usize {
        self.strong_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strong_handle_tracks_relocation() {
        let mut table = HandleTable::new();
        let handle = table.insert_strong(Address(10));
        assert_eq!(table.address_of(&handle), Address(10));

        table.retarget(|old| Some(Address(old.0 - 4)));
        assert_eq!(table.address_of(&handle), Address(6));

        table.release(handle);
        assert_eq!(table.strong_count(), 0);
    }

    #[test]
    fn test_weak_handle_cleared_when_target_dies() {
        let mut table = HandleTable::new();
        let weak = table.insert_weak(Address(10));
        assert_eq!(table.upgrade(weak), Some(Address(10)));

        table.retarget(|_| None);
        assert_eq!(table.upgrade(weak), None);
    }

    #[test]
    fn test_slot_reuse_through_free_list() {
        let mut table = HandleTable::new();
        let a = table.insert_strong(Address(0));
        let first_slot = a.slot();
        table.release(a);

        let b = table.insert_strong(Address(2));
        assert_eq!(b.slot(), first_slot);
        assert_eq!(table.address_of(&b), Address(2));
    }

    #[test]
    fn test_stale_weak_slot_does_not_alias_reused_slot() {
        let mut table = HandleTable::new();
        let weak = table.insert_weak(Address(4));
        table.retarget(|_| None);
        // Dead slot stays dead until explicitly released.
        assert_eq!(table.upgrade(weak), None);
        table.release_weak(weak);

        let strong = table.insert_strong(Address(8));
        // The old weak handle now points at a reclaimed slot and must not
        // observe the new strong occupant.
        assert_eq!(table.upgrade(weak), None);
        table.release(strong);
    }
}

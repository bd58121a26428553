//! Handle table: small integer identifiers mapped to shared objects.
//!
//! A [`Handle`] is a slot index plus the generation the slot had when the
//! handle was issued. Deleting or replacing a slot bumps its generation, so a
//! handle kept past its object's lifetime is rejected with `BadHandle` instead
//! of resolving to whatever occupies the slot now.
//!
//! The table is internally synchronized. It hands out `Arc<T>` clones and
//! returns the object on delete; what happens to it afterwards is up to the
//! caller.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{ErrorKind, MxError, MxResult};

/// Index into a [`HandleTable`] plus the slot generation it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u64,
}

impl Handle {
    /// Slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    object: Option<Arc<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            generation: 0,
            object: None,
        }
    }
}

/// Slot table mapping small integer handles to shared objects.
/// // Freed slots are reused; their generation is bumped so old handles to
/// them resolve to `BadHandle` instead of the new occupant.
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T> HandleTable<T> {
    /// Table with `capacity` free slots. It grows on demand.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Number of slots, free or occupied.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| slot.object.is_some())
            .count()
    }

    /// True when no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `object` in the first free slot.
    pub fn allocate(&self, object: Arc<T>) -> Handle {
        let mut slots = self.slots.lock();
        let index = match slots.iter().position(|slot| slot.object.is_none()) {
            Some(index) => index,
            None => {
                slots.push(Slot::default());
                slots.len() - 1
            }
        };
        Self::fill(&mut slots[index], index, object)
    }

    /// Store `object` at exactly `index`, for identifiers chosen outside the
    /// table (an OS socket descriptor, for instance). An occupied slot is
    /// replaced and handles to the old object become stale.
    pub fn allocate_or_replace(&self, index: usize, object: Arc<T>) -> Handle {
        let mut slots = self.slots.lock();
        if index >= slots.len() {
            slots.resize_with(index + 1, Slot::default);
        }
        Self::fill(&mut slots[index], index, object)
    }

    fn fill(slot: &mut Slot<T>, index: usize, object: Arc<T>) -> Handle {
        slot.generation += 1;
        slot.object = Some(object);
        Handle {
            index,
            generation: slot.generation,
        }
    }

    /// Object behind `handle`, or `BadHandle` when the slot is free or reused.
    pub fn resolve(&self, handle: Handle) -> MxResult<Arc<T>> {
        let slots = self.slots.lock();
        let slot = Self::slot(&slots, handle, "handle_resolve")?;
        slot.object.clone().ok_or_else(|| free_slot(handle, "handle_resolve"))
    }

    /// Free the slot and give the object back to the caller.
    pub fn delete(&self, handle: Handle) -> MxResult<Arc<T>> {
        let mut slots = self.slots.lock();
        Self::slot(&slots, handle, "handle_delete")?;
        let slot = &mut slots[handle.index];
        let object = slot
            .object
            .take()
            .ok_or_else(|| free_slot(handle, "handle_delete"))?;
        slot.generation += 1;
        Ok(object)
    }

    fn slot<'s>(
        slots: &'s [Slot<T>],
        handle: Handle,
        operation: &'static str,
    ) -> MxResult<&'s Slot<T>> {
        let slot = slots.get(handle.index).ok_or_else(|| {
            MxError::new(
                ErrorKind::BadHandle,
                operation,
                format!(
                    "handle {} is outside a table of {} slots",
                    handle,
                    slots.len()
                ),
            )
        })?;
        if slot.object.is_some() && slot.generation != handle.generation {
            return Err(MxError::new(
                ErrorKind::BadHandle,
                operation,
                format!(
                    "handle {} is stale, slot is at generation {}",
                    handle, slot.generation
                ),
            ));
        }
        Ok(slot)
    }
}

fn free_slot(handle: Handle, operation: &'static str) -> MxError {
    MxError::not_found(operation, format!("handle {} refers to a free slot", handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_handle_no_longer_resolves() {
        let table = HandleTable::new(4);
        let handle = table.allocate(Arc::new("socket"));
        assert_eq!(*table.resolve(handle).unwrap(), "socket");

        let object = table.delete(handle).unwrap();
        assert_eq!(*object, "socket");
        assert_eq!(table.resolve(handle).unwrap_err().kind, ErrorKind::NotFound);
        assert_eq!(table.delete(handle).unwrap_err().kind, ErrorKind::NotFound);
    }

    #[test]
    fn reallocating_a_deleted_index_yields_a_fresh_handle() {
        let table = HandleTable::new(0);
        let first = table.allocate_or_replace(7, Arc::new(1));
        table.delete(first).unwrap();

        let second = table.allocate_or_replace(7, Arc::new(2));
        assert_eq!(second.index(), 7);
        assert_eq!(*table.resolve(second).unwrap(), 2);
        assert_eq!(table.resolve(first).unwrap_err().kind, ErrorKind::BadHandle);
    }

    #[test]
    fn replacing_an_occupied_slot_invalidates_the_old_handle() {
        let table = HandleTable::new(2);
        let old = table.allocate_or_replace(1, Arc::new("a"));
        let new = table.allocate_or_replace(1, Arc::new("b"));
        assert_eq!(table.resolve(old).unwrap_err().kind, ErrorKind::BadHandle);
        assert_eq!(*table.resolve(new).unwrap(), "b");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn out_of_range_is_a_bad_handle() {
        let table: HandleTable<u8> = HandleTable::new(1);
        let handle = Handle {
            index: 5,
            generation: 1,
        };
        assert_eq!(table.resolve(handle).unwrap_err().kind, ErrorKind::BadHandle);
    }

    #[test]
    fn allocate_reuses_free_slots_and_grows_when_full() {
        let table = HandleTable::new(1);
        let a = table.allocate(Arc::new('a'));
        let b = table.allocate(Arc::new('b'));
        assert_eq!((a.index(), b.index()), (0, 1));
        table.delete(a).unwrap();
        let c = table.allocate(Arc::new('c'));
        assert_eq!(c.index(), 0);
        assert_eq!(table.capacity(), 2);
    }
}

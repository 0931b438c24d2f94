//! Generic generation-tagged slot table backing the resource tables in
//! [`crate::resource`]. Kept independent of any particular resource kind so
//! buffers, images and samplers all reuse the same allocation/reclamation
//! logic.

use crate::types::GenerationalId;

struct Slot<T> {
    generation: u32,
    payload: Option<T>,
}

/// A sparse, generation-tagged vector. Allocating reuses a freed index when
/// one is available; freeing bumps that index's generation so stale ids
/// stop resolving.
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a slot, returning its id and a mutable reference to store
    /// the payload into.
    pub fn allocate(&mut self, payload: T) -> (GenerationalId, &mut T) {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    payload: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.payload = Some(payload);
        let id = GenerationalId::new(index, slot.generation);
        (id, slot.payload.as_mut().unwrap())
    }

    /// Returns a slot's payload to the caller and clears the slot, bumping
    /// its generation so any outstanding id becomes stale.
    pub fn free(&mut self, id: GenerationalId) -> Option<T> {
        let index = id.index() as usize;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != id.generation() {
            return None;
        }
        let payload = slot.payload.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(index as u32);
        payload
    }

    pub fn get(&self, id: GenerationalId) -> Option<&T> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.payload.as_ref()
    }

    pub fn get_mut(&mut self, id: GenerationalId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.payload.as_mut()
    }

    pub fn is_valid(&self, id: GenerationalId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_free_reuses_index_and_bumps_generation() {
        let mut table: SlotTable<u32> = SlotTable::new();
        let (id_a, _) = table.allocate(1);
        assert_eq!(id_a.index(), 0);
        assert_eq!(id_a.generation(), 0);

        table.free(id_a);
        assert!(!table.is_valid(id_a));

        let (id_b, _) = table.allocate(2);
        assert_eq!(id_b.index(), 0);
        assert_eq!(id_b.generation(), 1);
        assert!(!table.is_valid(id_a));
        assert!(table.is_valid(id_b));
    }

    #[test]
    fn stale_id_does_not_resolve_after_reuse() {
        let mut table: SlotTable<u32> = SlotTable::new();
        let (id_a, _) = table.allocate(10);
        table.free(id_a);
        let (_id_b, _) = table.allocate(20);
        assert_eq!(table.get(id_a), None);
    }

    #[test]
    fn freeing_unknown_generation_is_noop() {
        let mut table: SlotTable<u32> = SlotTable::new();
        let (id_a, _) = table.allocate(1);
        let stale = GenerationalId::new(id_a.index(), id_a.generation().wrapping_add(5));
        assert_eq!(table.free(stale), None);
        assert!(table.is_valid(id_a));
    }
}

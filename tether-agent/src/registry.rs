//! Fixed-capacity client slab.
//!
//! Every slot sits on exactly one of three intrusive, index-linked lists:
//! free, connected, or pending-disconnect. Slots are allocated once at
//! startup and recycled; a per-slot generation makes [`ClientId`]s of
//! recycled slots stale.

use std::fmt;

/// Upper bound on the registry capacity.
pub const MAX_CLIENTS: usize = 4096;

/// Stable handle to an occupied slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    /// Slot index.
    index: usize,
    /// Slot generation at allocation time.
    generation: u32,
}

impl ClientId {
    /// Slot index.
    pub const fn index(self) -> usize {
        self.index
    }

    /// Slot generation this handle was issued for.
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// The list a slot currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    /// Available for allocation.
    Free = 0,
    /// Serving a peer.
    Connected = 1,
    /// Disconnected, awaiting end-of-pass cleanup.
    Pending = 2,
}

/// One slot and its list links.
#[derive(Debug)]
struct Slot<T> {
    /// Slot payload, reused across generations.
    value: T,
    /// Bumped every time the slot returns to the free list.
    generation: u32,
    /// Owning list.
    list: List,
    /// Previous slot on the same list.
    prev: Option<usize>,
    /// Next slot on the same list.
    next: Option<usize>,
}

/// Fixed-capacity slab of `T` with free, connected and pending lists.
#[derive(Debug)]
pub struct Registry<T> {
    /// All slots, allocated up front.
    slots: Vec<Slot<T>>,
    /// List heads, indexed by [`List`].
    heads: [Option<usize>; 3],
    /// List lengths, indexed by [`List`].
    lens: [usize; 3],
}

impl<T> Registry<T> {
    /// Creates a registry of `capacity` slots, all free.
    pub fn new(capacity: usize, mut init: impl FnMut() -> T) -> Self {
        let mut registry = Self {
            slots: Vec::with_capacity(capacity),
            heads: [None; 3],
            lens: [0; 3],
        };
        for _ in 0..capacity {
            registry.slots.push(Slot {
                value: init(),
                generation: 0,
                list: List::Free,
                prev: None,
                next: None,
            });
        }
        // Pushed in reverse so the lowest index is allocated first.
        for index in (0..capacity).rev() {
            registry.push(index, List::Free);
        }
        registry
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of connected clients.
    pub const fn connected_len(&self) -> usize {
        self.lens[List::Connected as usize]
    }

    /// Number of clients awaiting cleanup.
    pub const fn pending_len(&self) -> usize {
        self.lens[List::Pending as usize]
    }

    /// Number of free slots.
    pub const fn free_len(&self) -> usize {
        self.lens[List::Free as usize]
    }

    /// Takes a free slot and moves it to the connected list.
    pub fn alloc(&mut self) -> Option<ClientId> {
        let index = self.pop(List::Free)?;
        self.push(index, List::Connected);
        Some(self.id_of(index))
    }

    /// Resolves an occupied slot, connected or pending.
    pub fn get(&self, id: ClientId) -> Option<&T> {
        let slot = self.slots.get(id.index)?;
        (slot.generation == id.generation && slot.list != List::Free).then_some(&slot.value)
    }

    /// Mutable variant of [`Registry::get`].
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index)?;
        (slot.generation == id.generation && slot.list != List::Free).then_some(&mut slot.value)
    }

    /// Resolves a slot only while it is on the connected list.
    pub fn connected_mut(&mut self, id: ClientId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index)?;
        (slot.generation == id.generation && slot.list == List::Connected)
            .then_some(&mut slot.value)
    }

    /// Whether `id` is live and connected.
    pub fn is_connected(&self, id: ClientId) -> bool {
        self.slots
            .get(id.index)
            .is_some_and(|slot| slot.generation == id.generation && slot.list == List::Connected)
    }

    /// Current handle of an occupied slot.
    pub fn resolve(&self, index: usize) -> Option<ClientId> {
        let slot = self.slots.get(index)?;
        (slot.list != List::Free).then(|| self.id_of(index))
    }

    /// Moves a connected client to the pending-disconnect list. Returns
    /// `false` if `id` was not connected.
    pub fn mark_pending(&mut self, id: ClientId) -> bool {
        if !self.is_connected(id) {
            return false;
        }
        self.unlink(id.index);
        self.push(id.index, List::Pending);
        true
    }

    /// Returns an occupied slot straight to the free list.
    pub fn release(&mut self, id: ClientId) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        self.unlink(id.index);
        self.free(id.index);
        true
    }

    /// Runs `finish` once for every pending client, then frees its slot.
    pub fn reclaim(&mut self, mut finish: impl FnMut(ClientId, &mut T)) {
        while let Some(index) = self.pop(List::Pending) {
            let id = self.id_of(index);
            finish(id, &mut self.slots[index].value);
            self.free(index);
        }
    }

    /// Handles of every connected client.
    pub fn connected_ids(&self) -> Vec<ClientId> {
        let mut ids = Vec::with_capacity(self.connected_len());
        let mut cursor = self.heads[List::Connected as usize];
        while let Some(index) = cursor {
            ids.push(self.id_of(index));
            cursor = self.slots[index].next;
        }
        ids
    }

    /// Handle for the slot's current generation.
    fn id_of(&self, index: usize) -> ClientId {
        ClientId {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Puts an unlinked slot on the free list under a new generation.
    fn free(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        self.push(index, List::Free);
    }

    /// Links `index` at the head of `list`.
    fn push(&mut self, index: usize, list: List) {
        let head = self.heads[list as usize];
        let slot = &mut self.slots[index];
        slot.list = list;
        slot.prev = None;
        slot.next = head;
        if let Some(head) = head {
            self.slots[head].prev = Some(index);
        }
        self.heads[list as usize] = Some(index);
        self.lens[list as usize] += 1;
    }

    /// Unlinks the head of `list`.
    fn pop(&mut self, list: List) -> Option<usize> {
        let index = self.heads[list as usize]?;
        self.unlink(index);
        Some(index)
    }

    /// Unlinks `index` from whichever list holds it.
    fn unlink(&mut self, index: usize) {
        let slot = &self.slots[index];
        let (list, prev, next) = (slot.list, slot.prev, slot.next);
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.heads[list as usize] = next,
        }
        if let Some(next) = next {
            self.slots[next].prev = prev;
        }
        self.lens[list as usize] -= 1;
        let slot = &mut self.slots[index];
        slot.prev = None;
        slot.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(capacity: usize) -> Registry<u32> {
        Registry::new(capacity, || 0)
    }

    fn assert_partitioned(r: &Registry<u32>) {
        assert_eq!(r.free_len() + r.connected_len() + r.pending_len(), r.capacity());
    }

    #[test]
    fn allocates_until_exhausted() {
        let mut r = registry(2);
        let a = r.alloc().unwrap();
        let b = r.alloc().unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert!(r.alloc().is_none());
        assert_eq!(r.connected_len(), 2);
        assert_partitioned(&r);
    }

    #[test]
    fn stale_id_never_resolves() {
        let mut r = registry(1);
        let old = r.alloc().unwrap();
        *r.get_mut(old).unwrap() = 7;
        assert!(r.mark_pending(old));
        r.reclaim(|_, _| {});

        let new = r.alloc().unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);
        assert!(r.get(old).is_none());
        assert!(!r.is_connected(old));
        assert!(!r.mark_pending(old));
        assert_eq!(r.get(new), Some(&7));
    }

    #[test]
    fn pending_slot_is_not_reused_before_reclaim() {
        let mut r = registry(1);
        let id = r.alloc().unwrap();
        assert!(r.mark_pending(id));
        assert!(!r.mark_pending(id));
        assert!(r.alloc().is_none());
        assert!(r.connected_mut(id).is_none());
        assert!(r.get(id).is_some());
        assert_partitioned(&r);

        let mut finished = Vec::new();
        r.reclaim(|id, _| finished.push(id));
        r.reclaim(|id, _| finished.push(id));
        assert_eq!(finished, vec![id]);
        assert!(r.alloc().is_some());
    }

    #[test]
    fn removal_from_the_middle_keeps_lists_intact() {
        let mut r = registry(4);
        let ids: Vec<_> = (0..4).map(|_| r.alloc().unwrap()).collect();
        assert!(r.mark_pending(ids[1]));
        assert!(r.release(ids[2]));

        let mut connected = r.connected_ids();
        connected.sort_by_key(|id| id.index());
        assert_eq!(connected, vec![ids[0], ids[3]]);
        assert_eq!(r.pending_len(), 1);
        assert_eq!(r.free_len(), 1);
        assert_partitioned(&r);
        assert_eq!(r.resolve(3), Some(ids[3]));
        assert_eq!(r.resolve(2), None);
    }
}

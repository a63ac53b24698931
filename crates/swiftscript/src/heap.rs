//! Object registry with deterministic reference counting.
//!
//! The heap is a slot arena: every live object occupies a slot addressed by
//! [`HeapId`], freed slots are recycled through a free list, and the arena is
//! the sole deallocation authority. Strong counts start at zero on
//! allocation; the first stack push retains. A release that drops the count
//! to zero does not free inline — the id is queued on the *deferred release*
//! queue and drained at cleanup points (`Vm::run_cleanup`), which bounds
//! destructor recursion and keeps `deinit` side effects at predictable
//! points. The `is_collecting` flag guards the drain against reentrancy:
//! releases discovered while collecting are simply re-queued.
//!
//! Weak references carry no count; each is recorded in the target's
//! back-list as an `(owner, field)` pair and nulled when the target dies.
//! Unowned references carry no count and are never nulled.

use std::collections::{BTreeMap, VecDeque};

use crate::{
    object::HeapData,
    value::{RefKind, Value},
};

/// Unique identifier for a heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HeapId(u32);

impl HeapId {
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).expect("heap slot index exceeds u32"))
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Allocation statistics, updated at every allocate/free.
///
/// Invariant at every cleanup point:
/// `total_allocated - total_freed == live_bytes`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Cumulative bytes allocated over the heap's lifetime.
    pub total_allocated: u64,
    /// Cumulative bytes freed.
    pub total_freed: u64,
    /// Currently live object count.
    pub live_objects: usize,
    /// Currently live tracked bytes.
    pub live_bytes: u64,
}

impl HeapStats {
    /// Live object counts keyed by variant name; computed on demand.
    #[must_use]
    pub fn objects_by_type(heap: &Heap) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for id in heap.live_ids() {
            *counts.entry(heap.get(id).variant_name()).or_insert(0) += 1;
        }
        counts
    }
}

/// One occupied arena slot.
#[derive(Debug)]
struct HeapEntry {
    strong: u32,
    /// `(owner, field name)` pairs that hold weak references to this object.
    weak_backrefs: Vec<(HeapId, String)>,
    /// Already sitting in the deferred queue.
    queued: bool,
    size: u64,
    data: HeapData,
}

/// The object registry.
#[derive(Debug)]
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    free_list: Vec<HeapId>,
    deferred: VecDeque<HeapId>,
    /// Reentrancy guard for the cleanup drain.
    pub is_collecting: bool,
    /// Retain/release operations since the last cleanup.
    rc_operations: u32,
    /// Cleanup runs once this many RC operations have accumulated while the
    /// deferred queue is non-empty.
    cleanup_threshold: u32,
    stats: HeapStats,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub const DEFAULT_CLEANUP_THRESHOLD: u32 = 64;

    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            deferred: VecDeque::new(),
            is_collecting: false,
            rc_operations: 0,
            cleanup_threshold: Self::DEFAULT_CLEANUP_THRESHOLD,
            stats: HeapStats::default(),
        }
    }

    pub fn set_cleanup_threshold(&mut self, threshold: u32) {
        self.cleanup_threshold = threshold.max(1);
    }

    /// Allocates a new object. The initial strong count is zero; the caller
    /// is expected to push the resulting value, which retains it.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        let size = data.estimate_size() as u64;
        self.stats.total_allocated += size;
        self.stats.live_bytes += size;
        self.stats.live_objects += 1;

        let entry = HeapEntry {
            strong: 0,
            weak_backrefs: Vec::new(),
            queued: false,
            size,
            data,
        };

        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId::from_index(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    // ---- Reference counting ----

    pub fn retain(&mut self, id: HeapId) {
        self.rc_operations += 1;
        let entry = self
            .entries
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .expect("Heap::retain: object already freed");
        entry.strong += 1;
    }

    /// Decrements the strong count. At zero the object is queued for
    /// deferred release, not freed inline. Tolerates already-freed slots so
    /// the shutdown drain can release in any order.
    pub fn release(&mut self, id: HeapId) {
        self.rc_operations += 1;
        let Some(entry) = self.entries.get_mut(id.index()).and_then(Option::as_mut) else {
            return;
        };
        entry.strong = entry.strong.saturating_sub(1);
        if entry.strong == 0 && !entry.queued {
            entry.queued = true;
            self.deferred.push_back(id);
        }
    }

    /// Retains the value when it is a strong object reference.
    pub fn retain_value(&mut self, value: Value) {
        if let Some(id) = value.strong_id() {
            self.retain(id);
        }
    }

    /// Releases the value when it is a strong object reference.
    pub fn release_value(&mut self, value: Value) {
        if let Some(id) = value.strong_id() {
            self.release(id);
        }
    }

    #[must_use]
    pub fn strong_count(&self, id: HeapId) -> u32 {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .map_or(0, |e| e.strong)
    }

    // ---- Access ----

    /// # Panics
    /// Panics when the object has been freed; use [`Self::get_if_live`] when
    /// death is an expected state (weak/unowned access).
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self
            .entries
            .get(id.index())
            .and_then(Option::as_ref)
            .expect("Heap::get: object already freed")
            .data
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self
            .entries
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .expect("Heap::get_mut: object already freed")
            .data
    }

    #[must_use]
    pub fn get_if_live(&self, id: HeapId) -> Option<&HeapData> {
        self.entries.get(id.index()).and_then(Option::as_ref).map(|e| &e.data)
    }

    pub fn get_mut_if_live(&mut self, id: HeapId) -> Option<&mut HeapData> {
        self.entries
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .map(|e| &mut e.data)
    }

    #[must_use]
    pub fn is_live(&self, id: HeapId) -> bool {
        self.entries.get(id.index()).is_some_and(Option::is_some)
    }

    /// All currently live slot ids, in slot order.
    #[must_use]
    pub fn live_ids(&self) -> Vec<HeapId> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| HeapId::from_index(i)))
            .collect()
    }

    // ---- Weak reference back-list ----

    /// Records that `owner.field` holds a weak reference to `target`.
    pub fn register_weak_backref(&mut self, target: HeapId, owner: HeapId, field: &str) {
        if let Some(entry) = self.entries.get_mut(target.index()).and_then(Option::as_mut) {
            if !entry.weak_backrefs.iter().any(|(o, f)| *o == owner && f == field) {
                entry.weak_backrefs.push((owner, field.to_owned()));
            }
        }
    }

    /// Drops a recorded back-ref (the owner's field was overwritten).
    pub fn unregister_weak_backref(&mut self, target: HeapId, owner: HeapId, field: &str) {
        if let Some(entry) = self.entries.get_mut(target.index()).and_then(Option::as_mut) {
            entry.weak_backrefs.retain(|(o, f)| !(*o == owner && f == field));
        }
    }

    // ---- Deferred release queue ----

    #[must_use]
    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Whether a cleanup point has been reached.
    #[must_use]
    pub fn cleanup_due(&self) -> bool {
        !self.is_collecting && !self.deferred.is_empty() && self.rc_operations >= self.cleanup_threshold
    }

    pub fn reset_rc_counter(&mut self) {
        self.rc_operations = 0;
    }

    /// Pops the next dead candidate. Objects that were retained again after
    /// being queued are skipped (resurrection), with their queued flag
    /// cleared so a later release can re-queue them.
    pub fn pop_deferred(&mut self) -> Option<HeapId> {
        while let Some(id) = self.deferred.pop_front() {
            match self.entries.get_mut(id.index()).and_then(Option::as_mut) {
                Some(entry) if entry.strong == 0 => {
                    return Some(id);
                }
                Some(entry) => {
                    entry.queued = false;
                }
                None => {}
            }
        }
        None
    }

    /// Frees a dead object: nulls weak refs through the back-list, releases
    /// the object's strong children (which may queue further deaths), and
    /// recycles the slot. The caller is responsible for having run `deinit`
    /// first where applicable.
    pub fn destroy(&mut self, id: HeapId) {
        let Some(entry) = self.entries.get_mut(id.index()).and_then(Option::take) else {
            return;
        };

        self.stats.total_freed += entry.size;
        self.stats.live_bytes = self.stats.live_bytes.saturating_sub(entry.size);
        self.stats.live_objects = self.stats.live_objects.saturating_sub(1);
        self.free_list.push(id);

        // Null weak references before the slot can be reused.
        for (owner, field) in &entry.weak_backrefs {
            self.null_weak_field(*owner, field, id);
        }

        let mut children = Vec::new();
        entry.data.collect_child_ids(&mut children);
        drop(entry);
        for child in children {
            self.release(child);
        }
    }

    fn null_weak_field(&mut self, owner: HeapId, field: &str, dying: HeapId) {
        let fields = match self.get_mut_if_live(owner) {
            Some(HeapData::Instance(inst)) => &mut inst.fields,
            Some(HeapData::StructInstance(inst)) => &mut inst.fields,
            _ => return,
        };
        if let Some(slot) = fields.get_mut(field) {
            if matches!(*slot, Value::Obj(r) if r.id == dying && r.kind == RefKind::Weak) {
                *slot = Value::Nil;
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{object::ListObj, value::ObjRef};

    fn drain(heap: &mut Heap) {
        heap.is_collecting = true;
        while let Some(id) = heap.pop_deferred() {
            heap.destroy(id);
        }
        heap.is_collecting = false;
    }

    #[test]
    fn allocate_starts_at_zero_strong() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::Str("hi".to_owned()));
        assert_eq!(heap.strong_count(id), 0);
        heap.retain(id);
        assert_eq!(heap.strong_count(id), 1);
    }

    #[test]
    fn release_defers_instead_of_freeing() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::Str("hi".to_owned()));
        heap.retain(id);
        heap.release(id);
        // Still live until a cleanup point drains the queue.
        assert!(heap.is_live(id));
        assert!(heap.has_deferred());
        drain(&mut heap);
        assert!(!heap.is_live(id));
    }

    #[test]
    fn resurrected_objects_are_skipped() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::Str("hi".to_owned()));
        heap.retain(id);
        heap.release(id);
        heap.retain(id); // resurrected before cleanup
        drain(&mut heap);
        assert!(heap.is_live(id));
    }

    #[test]
    fn destroy_releases_children_transitively() {
        let mut heap = Heap::new();
        let child = heap.allocate(HeapData::Str("x".to_owned()));
        heap.retain(child); // held by the list below
        let list = heap.allocate(HeapData::List(ListObj {
            elements: vec![Value::Obj(ObjRef::strong(child))],
        }));
        heap.retain(list);
        heap.release(list);
        drain(&mut heap);
        assert!(!heap.is_live(list));
        assert!(!heap.is_live(child));
    }

    #[test]
    fn stats_balance_at_cleanup_points() {
        let mut heap = Heap::new();
        let a = heap.allocate(HeapData::Str("aaaa".to_owned()));
        heap.retain(a);
        let b = heap.allocate(HeapData::Str("bbbb".to_owned()));
        heap.retain(b);
        heap.release(a);
        drain(&mut heap);
        let stats = heap.stats();
        assert_eq!(stats.total_allocated - stats.total_freed, stats.live_bytes);
        assert_eq!(stats.live_objects, 1);
    }

    #[test]
    fn slot_reuse_after_destroy() {
        let mut heap = Heap::new();
        let a = heap.allocate(HeapData::Str("a".to_owned()));
        heap.retain(a);
        heap.release(a);
        drain(&mut heap);
        let b = heap.allocate(HeapData::Str("b".to_owned()));
        assert_eq!(a.index(), b.index());
    }
}

//! Array binary heap with handles that survive reordering.
//!
//! Every node carries the handle it was inserted under; `indexes[handle]`
//! tracks the node's current slot and is rewritten on every swap. Handles
//! are preassigned (`0..capacity`) and recycled: the slot vacated by
//! `extract_top` keeps its handle for the next `insert`.

/// Handle returned by [`BinaryHeap::insert`].
pub type Handle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapOrder {
    /// Largest key on top.
    Max,
    /// Smallest key on top.
    Min,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    key: u64,
    value: u64,
    h: Handle,
}

#[derive(Debug)]
pub struct BinaryHeap {
    nodes: Vec<Node>,
    indexes: Vec<u64>,
    count: usize,
    order: HeapOrder,
}

impl BinaryHeap {
    pub fn new(capacity: usize, order: HeapOrder) -> Self {
        let nodes = (0..capacity as u64).map(|h| Node { key: 0, value: 0, h }).collect();
        let indexes = (0..capacity as u64).collect();
        Self { nodes, indexes, count: 0, order }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.nodes.len()
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn order(&self) -> HeapOrder {
        self.order
    }

    /// `a` belongs above `b`.
    #[inline]
    fn above(&self, a: u64, b: u64) -> bool {
        match self.order {
            HeapOrder::Max => a > b,
            HeapOrder::Min => a < b,
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.nodes.swap(i, j);
        self.indexes[self.nodes[i].h as usize] = i as u64;
        self.indexes[self.nodes[j].h as usize] = j as u64;
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.above(self.nodes[i].key, self.nodes[parent].key) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let l = 2 * i + 1;
            let r = l + 1;
            let mut best = i;
            if l < self.count && self.above(self.nodes[l].key, self.nodes[best].key) {
                best = l;
            }
            if r < self.count && self.above(self.nodes[r].key, self.nodes[best].key) {
                best = r;
            }
            if best == i {
                break;
            }
            self.swap(i, best);
            i = best;
        }
    }

    /// `None` when full.
    pub fn insert(&mut self, key: u64, value: u64) -> Option<Handle> {
        if self.is_full() {
            return None;
        }
        let slot = self.count;
        let h = self.nodes[slot].h;
        self.nodes[slot].key = key;
        self.nodes[slot].value = value;
        self.indexes[h as usize] = slot as u64;
        self.count += 1;
        self.sift_up(slot);
        Some(h)
    }

    /// Value on top, without removing it.
    pub fn peek_top(&self) -> Option<u64> {
        (self.count > 0).then(|| self.nodes[0].value)
    }

    /// Remove the top element; returns its value.
    pub fn extract_top(&mut self) -> Option<u64> {
        if self.count == 0 {
            return None;
        }
        let value = self.nodes[0].value;
        self.count -= 1;
        self.swap(0, self.count);
        self.sift_down(0);
        Some(value)
    }

    /// Slot of a handle that is currently in the heap.
    fn slot_of(&self, h: Handle) -> Option<usize> {
        let slot = *self.indexes.get(h as usize)? as usize;
        (slot < self.count).then_some(slot)
    }

    pub fn get_key(&self, h: Handle) -> Option<u64> {
        self.slot_of(h).map(|s| self.nodes[s].key)
    }

    /// Raise a key; fails if `key` is lower than the current one.
    pub fn increase_key(&mut self, h: Handle, key: u64) -> bool {
        let Some(slot) = self.slot_of(h) else { return false };
        if key < self.nodes[slot].key {
            return false;
        }
        self.nodes[slot].key = key;
        match self.order {
            HeapOrder::Max => self.sift_up(slot),
            HeapOrder::Min => self.sift_down(slot),
        }
        true
    }

    /// Lower a key; fails if `key` is higher than the current one.
    pub fn decrease_key(&mut self, h: Handle, key: u64) -> bool {
        let Some(slot) = self.slot_of(h) else { return false };
        if key > self.nodes[slot].key {
            return false;
        }
        self.nodes[slot].key = key;
        match self.order {
            HeapOrder::Max => self.sift_down(slot),
            HeapOrder::Min => self.sift_up(slot),
        }
        true
    }

    /// Drop every element; all handles become free again.
    pub fn clear(&mut self) {
        self.count = 0;
    }
}

//! Bounded double-ended queue of `u64` indices, for free lists and message queues.
//!
//! Counters only grow or shrink by one per operation and are never reduced
//! modulo the capacity; slots are addressed as `counter & (size - 1)`. An empty
//! queue has `head == 1, tail == 0`, and the occupied count is always
//! `head - tail - 1` in wrapping arithmetic. Cross-queue moves rely on this.

use crate::reladdr::SelfRel;
use crate::spinlock::{LockGuard, ShmLock, SpinLock};
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory "no index" value.
pub const NONE: u64 = u64::MAX;

#[repr(C)]
pub struct IndexQueue {
    lock: SpinLock,
    head: AtomicU64,
    tail: AtomicU64,
    queue: SelfRel<AtomicU64>,
    size: AtomicU64,
}

impl IndexQueue {
    /// Slots available to a queue whose header and buffer share one block of `bytes`.
    pub const fn slots_for(bytes: u64) -> u64 {
        let hdr = size_of::<IndexQueue>() as u64;
        if bytes <= hdr {
            return 0;
        }
        crate::helpers::snap_pow2((bytes - hdr) / size_of::<u64>() as u64)
    }

    /// Bytes needed for a queue header followed by `slots` entries.
    pub const fn block_size(slots: u64) -> u64 {
        size_of::<IndexQueue>() as u64 + slots * size_of::<u64>() as u64
    }

    /// Make the queue empty with capacity `size` rounded down to a power of two.
    ///
    /// # Safety
    /// `mem` must point to at least `size` writable `u64` slots that stay
    /// valid, and at a fixed distance from `self`, for the queue's lifetime.
    pub unsafe fn init_empty(&self, size: u64, mem: *mut u64) {
        self.size.store(crate::helpers::snap_pow2(size), Ordering::Relaxed);
        self.head.store(1, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.queue.set(mem as *const AtomicU64);
        self.lock.init();
    }

    /// Like `init_empty`, pre-filled with `f(0) .. f(count - 1)`; `pop_head` yields `f(count - 1)` first.
    ///
    /// # Safety
    /// Same contract as [`IndexQueue::init_empty`].
    pub unsafe fn init_map(&self, size: u64, count: u64, mut f: impl FnMut(u64) -> u64, mem: *mut u64) {
        let size = crate::helpers::snap_pow2(size);
        let count = count.min(size);
        let mask = size.wrapping_sub(1);
        for t in 0..count {
            mem.add(((t + 1) & mask) as usize).write(f(t));
        }
        self.size.store(size, Ordering::Relaxed);
        self.head.store(count + 1, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.queue.set(mem as *const AtomicU64);
        self.lock.init();
    }

    /// Pre-filled with `0 .. count`.
    ///
    /// # Safety
    /// Same contract as [`IndexQueue::init_empty`].
    pub unsafe fn init_seq(&self, size: u64, count: u64, mem: *mut u64) {
        self.init_map(size, count, |t| t, mem)
    }

    /// Header and `slots` entries in one block, buffer immediately after the header.
    ///
    /// # Safety
    /// `this` must point to [`IndexQueue::block_size`]`(slots)` writable bytes, 8-aligned.
    pub unsafe fn init_in_block(this: *mut IndexQueue, slots: u64) -> &'static IndexQueue {
        std::ptr::write(
            this,
            IndexQueue {
                lock: SpinLock::new(),
                head: AtomicU64::new(1),
                tail: AtomicU64::new(0),
                queue: SelfRel::null(),
                size: AtomicU64::new(0),
            },
        );
        let q = &*this;
        q.init_empty(slots, this.add(1) as *mut u64);
        q
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Occupied slots. Unlocked reads are a snapshot only.
    #[inline]
    pub fn count(&self) -> u64 {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail).wrapping_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Take the queue's own lock.
    #[track_caller]
    pub fn lock(&self) -> Held<'_> {
        Held { q: self, _guard: Some(self.lock.lock()) }
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<Held<'_>> {
        self.lock.try_lock().map(|g| Held { q: self, _guard: Some(g) })
    }

    /// Operate without taking the queue's lock.
    ///
    /// # Safety
    /// The caller serializes every access to this queue by other means
    /// (an enclosing port lock, or exclusive ownership of the request).
    pub unsafe fn assume_held(&self) -> Held<'_> {
        Held { q: self, _guard: None }
    }

    #[track_caller]
    pub fn append_head(&self, x: u64) -> Option<u64> {
        self.lock().append_head(x)
    }

    #[track_caller]
    pub fn pop_head(&self) -> Option<u64> {
        self.lock().pop_head()
    }

    #[track_caller]
    pub fn append_tail(&self, x: u64) -> Option<u64> {
        self.lock().append_tail(x)
    }

    #[track_caller]
    pub fn pop_tail(&self) -> Option<u64> {
        self.lock().pop_tail()
    }

    #[track_caller]
    pub fn peek_head(&self) -> Option<u64> {
        self.lock().peek_head()
    }

    #[track_caller]
    pub fn peek_tail(&self) -> Option<u64> {
        self.lock().peek_tail()
    }

    #[track_caller]
    pub fn check(&self, idx: u64) -> bool {
        self.lock().check(idx)
    }

    /// Move `n` entries from `src`'s head onto `dst`'s tail in one step.
    /// Both locks are taken, higher address first. Fails without side
    /// effects if `src` holds fewer than `n` or `dst` lacks room.
    #[track_caller]
    pub fn move_head_to_tail(src: &IndexQueue, dst: &IndexQueue, n: u64) -> bool {
        if std::ptr::eq(src, dst) {
            return false;
        }
        let (_a, _b) = Self::lock_pair(src, dst);
        unsafe { src.assume_held().move_head_to_tail(&dst.assume_held(), n) }
    }

    /// Copy every entry of `old` into `new`, preserving pop order. `old` is
    /// left untouched. Returns the number moved, or `None` if `new` lacks room.
    #[track_caller]
    pub fn resize(old: &IndexQueue, new: &IndexQueue) -> Option<u64> {
        if std::ptr::eq(old, new) {
            return None;
        }
        let (_a, _b) = Self::lock_pair(old, new);
        unsafe { old.assume_held().transplant_into(&new.assume_held()) }
    }

    #[track_caller]
    fn lock_pair<'a>(
        x: &'a IndexQueue,
        y: &'a IndexQueue,
    ) -> (LockGuard<'a, SpinLock>, LockGuard<'a, SpinLock>) {
        if (x as *const IndexQueue) >= (y as *const IndexQueue) {
            let a = x.lock.lock();
            (a, y.lock.lock())
        } else {
            let a = y.lock.lock();
            (a, x.lock.lock())
        }
    }
}

/// Access to a queue whose lock is held (or whose access is otherwise serialized).
pub struct Held<'a> {
    q: &'a IndexQueue,
    _guard: Option<LockGuard<'a, SpinLock>>,
}

impl Held<'_> {
    #[inline]
    fn head(&self) -> u64 {
        self.q.head.load(Ordering::Relaxed)
    }

    #[inline]
    fn tail(&self) -> u64 {
        self.q.tail.load(Ordering::Relaxed)
    }

    #[inline]
    fn slot(&self, i: u64) -> &AtomicU64 {
        let mask = self.q.capacity().wrapping_sub(1);
        unsafe { &*self.q.queue.get().add((i & mask) as usize) }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.q.count()
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.q.capacity()
    }

    /// Raw slot read, `i` reduced modulo capacity.
    pub fn element(&self, i: u64) -> u64 {
        self.slot(i).load(Ordering::Relaxed)
    }

    pub fn append_head(&self, x: u64) -> Option<u64> {
        if self.count() >= self.capacity() {
            return None;
        }
        let head = self.head();
        self.slot(head).store(x, Ordering::Relaxed);
        self.q.head.store(head.wrapping_add(1), Ordering::Relaxed);
        Some(x)
    }

    pub fn pop_head(&self) -> Option<u64> {
        if self.count() == 0 {
            return None;
        }
        let head = self.head().wrapping_sub(1);
        self.q.head.store(head, Ordering::Relaxed);
        Some(self.slot(head).load(Ordering::Relaxed))
    }

    pub fn append_tail(&self, x: u64) -> Option<u64> {
        if self.count() + 1 > self.capacity() {
            return None;
        }
        let tail = self.tail();
        self.slot(tail).store(x, Ordering::Relaxed);
        self.q.tail.store(tail.wrapping_sub(1), Ordering::Relaxed);
        Some(x)
    }

    pub fn pop_tail(&self) -> Option<u64> {
        if self.count() == 0 {
            return None;
        }
        let tail = self.tail().wrapping_add(1);
        self.q.tail.store(tail, Ordering::Relaxed);
        Some(self.slot(tail).load(Ordering::Relaxed))
    }

    pub fn peek_head(&self) -> Option<u64> {
        if self.count() == 0 {
            return None;
        }
        Some(self.slot(self.head().wrapping_sub(1)).load(Ordering::Relaxed))
    }

    pub fn peek_tail(&self) -> Option<u64> {
        if self.count() == 0 {
            return None;
        }
        Some(self.slot(self.tail().wrapping_add(1)).load(Ordering::Relaxed))
    }

    /// O(n) scan for `idx` among the occupied slots.
    pub fn check(&self, idx: u64) -> bool {
        let head = self.head();
        let mut i = self.tail().wrapping_add(1);
        while i != head {
            if self.slot(i).load(Ordering::Relaxed) == idx {
                return true;
            }
            i = i.wrapping_add(1);
        }
        false
    }

    /// Move `n` entries from this queue's head onto `dst`'s tail.
    pub fn move_head_to_tail(&self, dst: &Held<'_>, n: u64) -> bool {
        if self.count() < n || dst.count() + n > dst.capacity() {
            return false;
        }
        let head = self.head().wrapping_sub(n);
        let tail = dst.tail().wrapping_sub(n);
        self.q.head.store(head, Ordering::Relaxed);
        dst.q.tail.store(tail, Ordering::Relaxed);
        for i in 0..n {
            let v = self.slot(head.wrapping_add(i)).load(Ordering::Relaxed);
            dst.slot(tail.wrapping_add(1).wrapping_add(i)).store(v, Ordering::Relaxed);
        }
        true
    }

    /// Append every entry onto `dst`'s tail so that `dst.pop_head` returns
    /// them in the order this queue would have.
    pub fn transplant_into(&self, dst: &Held<'_>) -> Option<u64> {
        let nr = self.count();
        if nr > dst.capacity() - dst.count() {
            return None;
        }
        let head = self.head();
        for i in 1..=nr {
            let v = self.slot(head.wrapping_sub(i)).load(Ordering::Relaxed);
            dst.append_tail(v)?;
        }
        Some(nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(size: u64) -> (Box<IndexQueue>, Vec<u64>) {
        let mut mem = vec![0u64; size as usize];
        let q = Box::new(IndexQueue {
            lock: SpinLock::new(),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            queue: SelfRel::null(),
            size: AtomicU64::new(0),
        });
        unsafe { q.init_empty(size, mem.as_mut_ptr()) };
        (q, mem)
    }

    #[test]
    fn empty_state_is_head_one_tail_zero() {
        let (q, _mem) = boxed(8);
        assert_eq!(q.head.load(Ordering::Relaxed), 1);
        assert_eq!(q.tail.load(Ordering::Relaxed), 0);
        assert_eq!(q.count(), 0);
        assert_eq!(q.pop_head(), None);
        assert_eq!(q.pop_tail(), None);
        assert_eq!(q.peek_head(), None);
    }

    #[test]
    fn capacity_snaps_down() {
        let (q, _mem) = boxed(12);
        assert_eq!(q.capacity(), 8);
    }

    #[test]
    fn seq_init_pops_highest_first() {
        let mut mem = vec![0u64; 8];
        let (q, _m) = boxed(1);
        unsafe { q.init_seq(8, 3, mem.as_mut_ptr()) };
        assert_eq!(q.count(), 3);
        assert_eq!(q.pop_head(), Some(2));
        assert_eq!(q.pop_tail(), Some(0));
        assert_eq!(q.pop_head(), Some(1));
        assert!(q.is_empty());
    }
}

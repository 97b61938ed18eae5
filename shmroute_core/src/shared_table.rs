//! Integer-keyed hash table placed in a single heap chunk.
//!
//! Linear probing with backward-shift deletion; key `0` marks an empty
//! slot. The table never reallocates itself: a full table answers
//! [`TableError::NeedsResize`] and the owner carves a bigger chunk, moves
//! the entries with [`SharedTable::resize_into`], and retries. Callers
//! serialize access.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// Load factor would exceed 3/4; grow to `grow_size_shift()` and retry.
    NeedsResize,
    /// `0` is reserved for empty slots.
    InvalidKey,
}

#[repr(C)]
struct Entry {
    key: AtomicU64,
    val: AtomicU64,
}

#[repr(C)]
pub struct SharedTable {
    size_shift: AtomicU64,
    used: AtomicU64,
}

const GOLDEN: u64 = 0x9e37_79b9_7f4a_7c15;
pub const MIN_SIZE_SHIFT: u64 = 3;

impl SharedTable {
    /// Bytes for a table of `2^size_shift` slots.
    pub const fn alloc_size(size_shift: u64) -> u64 {
        (size_of::<SharedTable>() + (size_of::<Entry>() << size_shift)) as u64
    }

    /// Largest shift whose table fits in `bytes`.
    pub fn shift_for(bytes: u64) -> u64 {
        let mut s = MIN_SIZE_SHIFT;
        while Self::alloc_size(s + 1) <= bytes {
            s += 1;
        }
        s
    }

    /// # Safety
    /// `this` must be 8-aligned and writable for `alloc_size(size_shift)` bytes.
    pub unsafe fn init(this: *mut SharedTable, size_shift: u64) {
        std::ptr::write(
            this,
            SharedTable { size_shift: AtomicU64::new(size_shift), used: AtomicU64::new(0) },
        );
        std::ptr::write_bytes(this.add(1) as *mut Entry, 0, 1usize << size_shift);
    }

    #[inline]
    fn shift(&self) -> u64 {
        self.size_shift.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        1 << self.shift()
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn grow_size_shift(&self) -> u64 {
        self.shift() + 1
    }

    pub fn shrink_size_shift(&self) -> u64 {
        self.shift().saturating_sub(1).max(MIN_SIZE_SHIFT)
    }

    /// Below 1/8 load a smaller table would do.
    pub fn wants_shrink(&self) -> bool {
        self.shift() > MIN_SIZE_SHIFT && self.len() * 8 < self.capacity()
    }

    #[inline]
    fn entry(&self, i: u64) -> &Entry {
        let mask = self.capacity() - 1;
        unsafe { &*((self as *const Self).add(1) as *const Entry).add((i & mask) as usize) }
    }

    #[inline]
    fn home(&self, key: u64) -> u64 {
        key.wrapping_mul(GOLDEN) >> (64 - self.shift())
    }

    fn find(&self, key: u64) -> Option<u64> {
        let mut i = self.home(key);
        for _ in 0..self.capacity() {
            match self.entry(i).key.load(Ordering::Relaxed) {
                0 => return None,
                k if k == key => return Some(i),
                _ => i += 1,
            }
        }
        None
    }

    /// Insert or overwrite.
    pub fn insert(&self, key: u64, val: u64) -> Result<(), TableError> {
        if key == 0 {
            return Err(TableError::InvalidKey);
        }
        if let Some(i) = self.find(key) {
            self.entry(i).val.store(val, Ordering::Relaxed);
            return Ok(());
        }
        if (self.len() + 1) * 4 > self.capacity() * 3 {
            return Err(TableError::NeedsResize);
        }
        let mut i = self.home(key);
        while self.entry(i).key.load(Ordering::Relaxed) != 0 {
            i += 1;
        }
        let e = self.entry(i);
        e.key.store(key, Ordering::Relaxed);
        e.val.store(val, Ordering::Relaxed);
        self.used.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn lookup(&self, key: u64) -> Option<u64> {
        if key == 0 {
            return None;
        }
        self.find(key).map(|i| self.entry(i).val.load(Ordering::Relaxed))
    }

    /// Remove `key`; returns its value if present.
    pub fn delete(&self, key: u64) -> Option<u64> {
        let mut hole = self.find(key)?;
        let val = self.entry(hole).val.load(Ordering::Relaxed);
        let mask = self.capacity() - 1;
        let mut j = hole;
        loop {
            j = (j + 1) & mask;
            let k = self.entry(j).key.load(Ordering::Relaxed);
            if k == 0 {
                break;
            }
            let home = self.home(k);
            // move j back into the hole unless its home lies cyclically in (hole, j]
            let dist_home = j.wrapping_sub(home) & mask;
            let dist_hole = j.wrapping_sub(hole) & mask;
            if dist_home >= dist_hole {
                let (src, dst) = (self.entry(j), self.entry(hole));
                dst.key.store(k, Ordering::Relaxed);
                dst.val.store(src.val.load(Ordering::Relaxed), Ordering::Relaxed);
                hole = j;
            }
        }
        self.entry(hole).key.store(0, Ordering::Relaxed);
        self.used.fetch_sub(1, Ordering::Relaxed);
        Some(val)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        (0..self.capacity()).filter_map(move |i| {
            let e = self.entry(i);
            match e.key.load(Ordering::Relaxed) {
                0 => None,
                k => Some((k, e.val.load(Ordering::Relaxed))),
            }
        })
    }

    /// Rebuild every entry into a freshly initialised table at `new`.
    ///
    /// # Safety
    /// `new` must satisfy [`SharedTable::init`]'s contract for `new_shift`
    /// and must not overlap `self`.
    pub unsafe fn resize_into(&self, new: *mut SharedTable, new_shift: u64) -> Result<(), TableError> {
        SharedTable::init(new, new_shift);
        let t = &*new;
        for (k, v) in self.iter() {
            t.insert(k, v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(shift: u64) -> (Vec<u64>, *mut SharedTable) {
        let mut buf = vec![0u64; (SharedTable::alloc_size(shift) / 8) as usize];
        let t = buf.as_mut_ptr() as *mut SharedTable;
        unsafe { SharedTable::init(t, shift) };
        (buf, t)
    }

    #[test]
    fn insert_lookup_delete() {
        let (_buf, t) = table(4);
        let t = unsafe { &*t };
        for k in 1..=10u64 {
            t.insert(k * 4096, k).unwrap();
        }
        assert_eq!(t.len(), 10);
        assert_eq!(t.lookup(4096 * 7), Some(7));
        assert_eq!(t.delete(4096 * 7), Some(7));
        assert_eq!(t.lookup(4096 * 7), None);
        for k in (1..=10u64).filter(|k| *k != 7) {
            assert_eq!(t.lookup(k * 4096), Some(k), "key {k} lost after delete");
        }
        assert_eq!(t.iter().count(), 9);
    }

    #[test]
    fn full_table_asks_for_resize() {
        let (_buf, t) = table(3);
        let t = unsafe { &*t };
        for k in 1..=6u64 {
            t.insert(k, k).unwrap();
        }
        assert_eq!(t.insert(99, 99), Err(TableError::NeedsResize));
        let (_nbuf, n) = table(t.grow_size_shift());
        unsafe { t.resize_into(n, t.grow_size_shift()) }.unwrap();
        let n = unsafe { &*n };
        n.insert(99, 99).unwrap();
        assert_eq!(n.len(), 7);
        assert_eq!(t.insert(0, 1), Err(TableError::InvalidKey));
    }
}

//! Fixed-size object pool carved from a [`HeapAllocator`].
//!
//! Objects are handed out from an intrusive free list linked by
//! container-relative offsets. When the list runs dry the pool takes one
//! heap chunk of [`OBJ_BATCH`] objects, splits it, and records the chunk
//! base in a [`SharedTable`] so every object can later be enumerated or
//! tested for membership.

use crate::constants::OBJ_BATCH;
use crate::errors::{Error, Result};
use crate::heap::HeapAllocator;
use crate::reladdr::{make, take, SelfRel};
use crate::shared_table::{SharedTable, TableError, MIN_SIZE_SHIFT};
use crate::spinlock::{LockGuard, ShmLock, SpinLock};
use log::{debug, warn};
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Overlay written into every free object.
#[repr(C)]
struct FreeObject {
    magic: u32,
    _pad: u32,
    size: u64,
    next: u64,
}

pub const MIN_OBJ_SIZE: u64 = size_of::<FreeObject>() as u64;

#[repr(C)]
pub struct ObjectHandler {
    lock: SpinLock,
    magic: AtomicU32,
    flags: AtomicU32,
    obj_size: AtomicU64,
    container: SelfRel<u8>,
    heap: AtomicU64,
    allocated: AtomicU64,
    nr_allocated: AtomicU64,
    allocated_space: AtomicU64,
    list: AtomicU64,
    nr_free: AtomicU64,
}

impl ObjectHandler {
    /// Set up an empty pool of `size`-byte objects. Offsets are taken
    /// relative to `container`, which must enclose the heap and the handler.
    ///
    /// # Safety
    /// `this` must be valid for writes, 8-aligned, and must not move while
    /// the pool is in use; `heap` must outlive it.
    pub unsafe fn init_in_place(
        this: *mut ObjectHandler,
        container: *const u8,
        magic: u32,
        size: u64,
        heap: &HeapAllocator,
    ) -> Result<()> {
        let obj_size = crate::helpers::align_up(size.max(MIN_OBJ_SIZE) as usize, 8) as u64;
        let table = heap
            .allocate(SharedTable::alloc_size(MIN_SIZE_SHIFT))
            .ok_or_else(|| Error::exhausted("object pool: no heap space for batch table"))?;
        let shift = SharedTable::shift_for(HeapAllocator::chunk_size(table));
        SharedTable::init(table.as_ptr() as *mut SharedTable, shift);

        std::ptr::write(
            this,
            ObjectHandler {
                lock: SpinLock::new(),
                magic: AtomicU32::new(magic),
                flags: AtomicU32::new(0),
                obj_size: AtomicU64::new(obj_size),
                container: SelfRel::null(),
                heap: AtomicU64::new(make(heap, container)),
                allocated: AtomicU64::new(make(table.as_ptr(), container)),
                nr_allocated: AtomicU64::new(0),
                allocated_space: AtomicU64::new(0),
                list: AtomicU64::new(0),
                nr_free: AtomicU64::new(0),
            },
        );
        (*this).container.set(container);
        Ok(())
    }

    #[inline]
    fn container(&self) -> *mut u8 {
        self.container.get()
    }

    #[inline]
    fn heap(&self) -> &HeapAllocator {
        unsafe { &*take::<HeapAllocator>(self.heap.load(Ordering::Relaxed), self.container()) }
    }

    #[inline]
    fn table(&self) -> &SharedTable {
        unsafe { &*take::<SharedTable>(self.allocated.load(Ordering::Relaxed), self.container()) }
    }

    #[inline]
    pub fn magic(&self) -> u32 {
        self.magic.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn obj_size(&self) -> u64 {
        self.obj_size.load(Ordering::Relaxed)
    }

    pub fn nr_free(&self) -> u64 {
        self.nr_free.load(Ordering::Relaxed)
    }

    pub fn nr_allocated(&self) -> u64 {
        self.nr_allocated.load(Ordering::Relaxed)
    }

    pub fn allocated_space(&self) -> u64 {
        self.allocated_space.load(Ordering::Relaxed)
    }

    /// Objects currently handed out.
    pub fn live(&self) -> u64 {
        let _g = self.lock.lock();
        self.nr_allocated() - self.nr_free()
    }

    #[inline]
    fn obj_at(&self, off: u64) -> *mut FreeObject {
        take::<FreeObject>(off, self.container())
    }

    /// Carve one chunk into at least `nr` objects and push them. Lock held.
    fn alloc_batch_locked(&self, nr: u64) -> Result<()> {
        let size = self.obj_size();
        let heap = self.heap();
        let bytes = nr.checked_mul(size).ok_or_else(|| Error::invalid("object pool: batch too large"))?;
        let mem = heap
            .allocate(bytes)
            .ok_or_else(|| Error::exhausted(format!("object pool: heap cannot supply {bytes} bytes")))?;
        let chunk = unsafe { HeapAllocator::chunk_size(mem) };
        let count = chunk / size;
        let base = make(mem.as_ptr(), self.container());

        if let Err(e) = self.track_batch(base) {
            unsafe { HeapAllocator::free(mem) };
            return Err(e);
        }

        let magic = self.magic();
        let head = self.list.load(Ordering::Relaxed);
        for i in 0..count {
            let off = base + i * size;
            let next = if i + 1 == count { head } else { off + size };
            unsafe {
                std::ptr::write(
                    self.obj_at(off),
                    FreeObject { magic, _pad: 0, size, next },
                );
            }
        }
        self.allocated_space.fetch_add(chunk, Ordering::Relaxed);
        self.nr_free.fetch_add(count, Ordering::Relaxed);
        self.nr_allocated.fetch_add(count, Ordering::Relaxed);
        self.list.store(base, Ordering::Relaxed);
        debug!("[POOL] magic={magic:#x} +{count} objects of {size} bytes");
        Ok(())
    }

    /// Record a batch base, growing the table from the heap when it is full.
    fn track_batch(&self, base: u64) -> Result<()> {
        let table = self.table();
        match table.insert(base, base) {
            Ok(()) => return Ok(()),
            Err(TableError::InvalidKey) => return Err(Error::invalid("object pool: null batch")),
            Err(TableError::NeedsResize) => {}
        }
        let heap = self.heap();
        let shift = table.grow_size_shift();
        let new = heap
            .allocate(SharedTable::alloc_size(shift))
            .ok_or_else(|| Error::exhausted("object pool: no heap space to grow batch table"))?;
        let shift = SharedTable::shift_for(unsafe { HeapAllocator::chunk_size(new) });
        let new_table = new.as_ptr() as *mut SharedTable;
        let moved = unsafe { table.resize_into(new_table, shift) }
            .and_then(|_| unsafe { &*new_table }.insert(base, base));
        if moved.is_err() {
            unsafe { HeapAllocator::free(new) };
            return Err(Error::exhausted("object pool: batch table resize failed"));
        }
        let old = NonNull::from(table).cast::<u8>();
        self.allocated.store(make(new_table, self.container()), Ordering::Relaxed);
        unsafe { HeapAllocator::free(old) };
        Ok(())
    }

    /// Pre-fill with at least `nr` objects.
    #[track_caller]
    pub fn alloc_batch(&self, nr: u64) -> Result<()> {
        let _g = self.lock.lock();
        self.alloc_batch_locked(nr)
    }

    /// Take an object. With `allow_alloc`, an empty pool refills once from the heap.
    #[track_caller]
    pub fn get(&self, allow_alloc: bool) -> Option<NonNull<u8>> {
        let _g = self.lock.lock();
        let mut refilled = false;
        loop {
            let head = self.list.load(Ordering::Relaxed);
            if head != 0 {
                let obj = self.obj_at(head);
                self.list.store(unsafe { (*obj).next }, Ordering::Relaxed);
                self.nr_free.fetch_sub(1, Ordering::Relaxed);
                return NonNull::new(obj as *mut u8);
            }
            if !allow_alloc || refilled {
                return None;
            }
            if let Err(e) = self.alloc_batch_locked(OBJ_BATCH) {
                debug!("[POOL] refill failed: {e}");
                return None;
            }
            refilled = true;
        }
    }

    /// Return an object obtained from [`ObjectHandler::get`].
    ///
    /// # Safety
    /// `obj` must belong to this pool and must not be used afterwards.
    #[track_caller]
    pub unsafe fn put(&self, obj: NonNull<u8>) {
        let off = make(obj.as_ptr(), self.container());
        let _g = self.lock.lock();
        let next = self.list.load(Ordering::Relaxed);
        std::ptr::write(
            obj.as_ptr() as *mut FreeObject,
            FreeObject { magic: self.magic(), _pad: 0, size: self.obj_size(), next },
        );
        self.list.store(off, Ordering::Relaxed);
        self.nr_free.fetch_add(1, Ordering::Relaxed);
    }

    /// Iterate every object ever carved, free or not, holding the pool lock
    /// until the iterator is dropped. Do not call other pool methods meanwhile.
    #[track_caller]
    pub fn iter_locked(&self) -> PoolIter<'_> {
        let guard = self.lock.lock();
        let mut batches: Vec<u64> = self.table().iter().map(|(k, _)| k).collect();
        batches.sort_unstable();
        PoolIter { pool: self, _guard: guard, batches, batch: 0, idx: 0, count: 0 }
    }

    fn batch_len(&self, base: u64) -> u64 {
        let ptr = take::<u8>(base, self.container());
        match NonNull::new(ptr) {
            Some(p) => (unsafe { HeapAllocator::chunk_size(p) }) / self.obj_size(),
            None => 0,
        }
    }

    /// True when `ptr` is the start of an object of this pool.
    #[track_caller]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let _g = self.lock.lock();
        self.contains_locked(ptr)
    }

    fn contains_locked(&self, ptr: *const u8) -> bool {
        let off = make(ptr, self.container());
        let size = self.obj_size();
        self.table().iter().any(|(base, _)| {
            off >= base && off < base + self.batch_len(base) * size && (off - base) % size == 0
        })
    }

    /// True when `ptr` sits on the free list. O(free objects).
    #[track_caller]
    pub fn is_free(&self, ptr: *const u8) -> bool {
        let _g = self.lock.lock();
        if !self.contains_locked(ptr) {
            warn!("[POOL] {ptr:p} is not an object of pool {:#x}", self.magic());
            return false;
        }
        let target = make(ptr, self.container());
        let mut cur = self.list.load(Ordering::Relaxed);
        while cur != 0 {
            if cur == target {
                return true;
            }
            cur = unsafe { (*self.obj_at(cur)).next };
        }
        false
    }
}

/// Walks every object of a pool under its lock.
pub struct PoolIter<'a> {
    pool: &'a ObjectHandler,
    _guard: LockGuard<'a, SpinLock>,
    batches: Vec<u64>,
    batch: usize,
    idx: u64,
    count: u64,
}

impl Iterator for PoolIter<'_> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.idx < self.count {
                let base = self.batches[self.batch - 1];
                let off = base + self.idx * self.pool.obj_size();
                self.idx += 1;
                return NonNull::new(take::<u8>(off, self.pool.container()));
            }
            let base = *self.batches.get(self.batch)?;
            self.batch += 1;
            self.idx = 0;
            self.count = self.pool.batch_len(base);
        }
    }
}

//! Size-classed arena allocator living inside shared memory.
//!
//! One bump cursor carves chunks out of `mem`; freed chunks go onto one
//! intrusive free list per normalized size class. Requests are rounded in
//! three tiers, relative to the alignment unit `u`:
//!
//! | request            | rounded to     |
//! |--------------------|----------------|
//! | `< 2^(u+5)`        | `2^u`          |
//! | `< 2^(u+10)`       | `2^(u+2)`      |
//! | otherwise          | `2^(u+7)`      |
//!
//! so the slack beyond a medium or large request stays under 12.5%.
//! The free-list heads sit at the start of `mem` and hold arena offsets
//! of the chunk's user pointer; `0` terminates a list.

use crate::constants::CHUNK_MAGIC;
use crate::errors::{Error, Result};
use crate::helpers::align_shift;
use crate::reladdr::SelfRel;
use crate::spinlock::{ShmLock, SpinLock};
use log::{error, trace, warn};
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const SMALL_LIMIT: u32 = 5;
const MEDIUM_LIMIT: u32 = 10;
const MEDIUM_AL_UNIT: u32 = SMALL_LIMIT - 3;
const LARGE_AL_UNIT: u32 = MEDIUM_LIMIT - 3;

/// Precedes every chunk handed out by the heap.
#[repr(C)]
pub struct ChunkHeader {
    magic: u64,
    heap: SelfRel<HeapAllocator>,
    size: u64,
}

pub(crate) const HDR: u64 = size_of::<ChunkHeader>() as u64;
const _: () = assert!(HDR == 24);

#[repr(C)]
pub struct HeapAllocator {
    lock: SpinLock,
    alignment_unit: AtomicU32,
    size: AtomicU64,
    cur: AtomicU64,
    mem: SelfRel<u8>,
}

#[inline]
unsafe fn header_of(ptr: NonNull<u8>) -> *mut ChunkHeader {
    ptr.as_ptr().sub(HDR as usize) as *mut ChunkHeader
}

impl HeapAllocator {
    /// Build a heap over `mem[..size]` with `2^alignment_unit` granularity.
    ///
    /// # Safety
    /// `this` must be valid for writes and must not move afterwards; `mem`
    /// must be 8-aligned, writable for `size` bytes, and must stay at a fixed
    /// distance from `this`.
    pub unsafe fn init_in_place(this: *mut HeapAllocator, size: u64, alignment_unit: u32, mem: *mut u8) -> Result<()> {
        if alignment_unit >= 32 || (mem as usize) % size_of::<u64>() != 0 {
            return Err(Error::invalid(format!(
                "heap: bad alignment unit {alignment_unit} or unaligned arena {mem:p}"
            )));
        }
        std::ptr::write(
            this,
            HeapAllocator {
                lock: SpinLock::new(),
                alignment_unit: AtomicU32::new(alignment_unit),
                size: AtomicU64::new(size),
                cur: AtomicU64::new(0),
                mem: SelfRel::null(),
            },
        );
        let heap = &*this;
        heap.mem.set(mem);

        let heap_page = 1u64 << alignment_unit;
        if heap_page < HDR {
            return Err(Error::invalid(format!("heap: unit {heap_page} cannot hold a chunk header")));
        }

        // first chunk's user pointer lands on a unit boundary
        let al_mem = align_shift(mem as u64, alignment_unit);
        let mut cur = al_mem - mem as u64;
        if cur < HDR {
            cur += heap_page;
        }
        cur -= HDR;

        let r = heap.class_index(size);
        let index_bytes = (r + 1) * size_of::<u64>() as u64;
        while cur < index_bytes {
            cur += heap_page;
        }
        std::ptr::write_bytes(mem as *mut u64, 0, (r + 1) as usize);

        if size < heap_page || cur >= size - heap_page {
            return Err(Error::exhausted(format!(
                "heap: {size} bytes leave no free unit after a {index_bytes}-byte class index"
            )));
        }
        heap.cur.store(cur, Ordering::Release);
        trace!("[HEAP] init size={size} unit={alignment_unit} classes={} cur={cur}", r + 1);
        Ok(())
    }

    #[inline]
    fn unit(&self) -> u32 {
        self.alignment_unit.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Bump-cursor space still uncarved.
    pub fn free_bytes(&self) -> u64 {
        self.size().saturating_sub(self.cur.load(Ordering::Relaxed))
    }

    /// Chunk footprint, header included, for a request of `bytes`.
    pub fn alloc_bytes(&self, bytes: u64) -> u64 {
        let u = self.unit();
        let b = bytes.saturating_add(HDR);
        if bytes < 1u64 << (u + SMALL_LIMIT) {
            align_shift(b, u)
        } else if bytes < 1u64 << (u + MEDIUM_LIMIT) {
            align_shift(b, u + MEDIUM_AL_UNIT)
        } else {
            align_shift(b, u + LARGE_AL_UNIT)
        }
    }

    /// Usable size granted for a request of `bytes`.
    #[inline]
    pub fn granted_size(&self, bytes: u64) -> u64 {
        self.alloc_bytes(bytes) - HDR
    }

    /// Free-list slot serving requests of `bytes`.
    pub fn class_index(&self, bytes: u64) -> u64 {
        let u = self.unit();
        let b = self.granted_size(bytes);
        if b < 1u64 << (u + SMALL_LIMIT) {
            b >> u
        } else if b < 1u64 << (u + MEDIUM_LIMIT) {
            (1u64 << SMALL_LIMIT) - (1u64 << (SMALL_LIMIT - MEDIUM_AL_UNIT)) + (b >> (u + MEDIUM_AL_UNIT))
        } else {
            (1u64 << SMALL_LIMIT) + (1u64 << MEDIUM_LIMIT)
                - (1u64 << (SMALL_LIMIT - MEDIUM_AL_UNIT))
                - (1u64 << (MEDIUM_LIMIT - (LARGE_AL_UNIT - MEDIUM_AL_UNIT)))
                + (b >> (u + LARGE_AL_UNIT))
        }
    }

    #[inline]
    fn free_list(&self) -> *mut u64 {
        self.mem.get() as *mut u64
    }

    /// Carve or recycle a chunk of at least `bytes`. `None` when exhausted.
    #[track_caller]
    pub fn allocate(&self, bytes: u64) -> Option<NonNull<u8>> {
        if bytes >= self.size() {
            return None;
        }
        let r = self.class_index(bytes) as usize;
        let mem = self.mem.get();
        let list = self.free_list();

        let addr = {
            let _g = self.lock.lock();
            let cur = self.cur.load(Ordering::Relaxed);
            let head = unsafe { *list.add(r) };
            if head != 0 {
                if head > cur {
                    warn!("[HEAP] invalid free-list head {head:#x} (cursor {cur:#x}) in class {r}");
                    return None;
                }
                unsafe {
                    let chunk = mem.add(head as usize);
                    *list.add(r) = *(chunk as *const u64);
                    chunk
                }
            } else {
                let ab = self.alloc_bytes(bytes);
                if cur + ab > self.size() {
                    return None;
                }
                unsafe {
                    let h = mem.add(cur as usize) as *mut ChunkHeader;
                    std::ptr::write(
                        h,
                        ChunkHeader { magic: CHUNK_MAGIC, heap: SelfRel::null(), size: ab - HDR },
                    );
                    (*h).heap.set(self);
                    self.cur.store(cur + ab, Ordering::Relaxed);
                    mem.add((cur + HDR) as usize)
                }
            }
        };

        let addr = NonNull::new(addr)?;
        let got = unsafe { Self::chunk_size(addr) };
        if got < bytes {
            warn!("[HEAP] requested {bytes} bytes but chunk holds {got}");
            return None;
        }
        if got != self.granted_size(bytes) {
            warn!(
                "[HEAP] chunk size {got} differs from class size {} (requested {bytes})",
                self.granted_size(bytes)
            );
            return None;
        }
        Some(addr)
    }

    /// Usable bytes of a chunk.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`HeapAllocator::allocate`].
    #[inline]
    pub unsafe fn chunk_size(ptr: NonNull<u8>) -> u64 {
        (*header_of(ptr)).size
    }

    /// The heap a chunk was carved from.
    ///
    /// # Safety
    /// As for [`HeapAllocator::chunk_size`].
    pub unsafe fn owner_of<'a>(ptr: NonNull<u8>) -> Option<&'a HeapAllocator> {
        (*header_of(ptr)).heap.get().as_ref()
    }

    /// Return a chunk to its size class.
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on a live heap and must not be used afterwards.
    #[track_caller]
    pub unsafe fn free(ptr: NonNull<u8>) {
        let h = header_of(ptr);
        if (*h).magic != CHUNK_MAGIC {
            warn!("[HEAP] free of {:p}: magic {:#x} != {:#x}", ptr, (*h).magic, CHUNK_MAGIC);
        }
        let Some(heap) = (*h).heap.get().as_ref() else {
            error!("[HEAP] free of {:p}: chunk has no owning heap", ptr);
            return;
        };
        let size = (*h).size;
        let r = heap.class_index(size) as usize;
        let mem = heap.mem.get();
        let off = ptr.as_ptr() as u64 - mem as u64;
        let list = heap.free_list();

        let _g = heap.lock.lock();
        *(ptr.as_ptr() as *mut u64) = *list.add(r);
        *list.add(r) = off;
    }
}

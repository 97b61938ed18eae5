//! Relocatable in-segment references.
//!
//! Every process maps a segment at its own address, so nothing stored in
//! shared memory may hold a raw pointer. Two encodings are used instead:
//!
//! * **base-relative**: an offset from the start of the segment mapping,
//!   used for the top-level fields of the segment header;
//! * **self-relative**: an offset from the address of the field holding it,
//!   used for intrusive links whose container base is not known at the use
//!   site (heap back-references, queue buffers).
//!
//! Offset `0` is the null reference in both encodings: the segment header
//! occupies base offset 0, and no field ever points at itself.

use crate::errors::{Error, Result};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Base-relative encode.
#[inline(always)]
pub fn make<T>(ptr: *const T, base: *const u8) -> u64 {
    (ptr as usize).wrapping_sub(base as usize) as u64
}

/// Base-relative decode.
#[inline(always)]
pub fn take<T>(offset: u64, base: *const u8) -> *mut T {
    (base as usize).wrapping_add(offset as usize) as *mut T
}

/// A self-relative reference stored inside shared memory.
#[repr(transparent)]
pub struct SelfRel<T> {
    off: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SelfRel<T> {
    pub const fn null() -> Self {
        Self { off: AtomicU64::new(0), _marker: PhantomData }
    }

    #[inline(always)]
    fn me(&self) -> usize {
        self as *const Self as usize
    }

    /// Point this field at `target` (null clears it).
    #[inline]
    pub fn set(&self, target: *const T) {
        let off = if target.is_null() {
            0
        } else {
            (target as usize).wrapping_sub(self.me()) as u64
        };
        self.off.store(off, Ordering::Release);
    }

    /// Resolve against this field's current address.
    #[inline]
    pub fn get(&self) -> *mut T {
        match self.off.load(Ordering::Acquire) {
            0 => std::ptr::null_mut(),
            off => self.me().wrapping_add(off as usize) as *mut T,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.off.load(Ordering::Acquire) == 0
    }

    /// Raw stored offset.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.off.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for SelfRel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SelfRel({:#x})", self.raw())
    }
}

/// A process-local view of one mapped segment, resolving base-relative
/// offsets with bounds and alignment checks.
#[derive(Clone, Copy, Debug)]
pub struct SegmentView {
    base: NonNull<u8>,
    size: u64,
}

unsafe impl Send for SegmentView {}
unsafe impl Sync for SegmentView {}

impl SegmentView {
    /// # Safety
    /// `base..base+size` must stay mapped for as long as the view and the
    /// references it hands out are used.
    pub unsafe fn new(base: NonNull<u8>, size: u64) -> Self {
        Self { base, size }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True when `[ptr, ptr+len)` lies inside the mapping.
    #[inline]
    pub fn contains(&self, ptr: *const u8, len: usize) -> bool {
        let start = self.base() as usize;
        let p = ptr as usize;
        p >= start && (p - start) as u64 + len as u64 <= self.size
    }

    /// Resolve a non-null offset to a `T` that fits entirely in the segment.
    pub fn resolve<T>(&self, offset: u64) -> Result<NonNull<T>> {
        if offset == 0 {
            return Err(Error::invalid("null segment offset"));
        }
        let end = offset.checked_add(size_of::<T>() as u64);
        if end.map_or(true, |e| e > self.size) {
            return Err(Error::corruption(format!(
                "offset {offset:#x} (+{}) outside segment of {} bytes",
                size_of::<T>(),
                self.size
            )));
        }
        let ptr = take::<T>(offset, self.base());
        if (ptr as usize) % align_of::<T>() != 0 {
            return Err(Error::corruption(format!("offset {offset:#x} misaligned")));
        }
        // non-null: base is non-null and offset is in range
        NonNull::new(ptr).ok_or_else(|| Error::corruption("null translation"))
    }

    /// Like `resolve`, with `0` mapping to `None`.
    pub fn resolve_opt<T>(&self, offset: u64) -> Result<Option<NonNull<T>>> {
        if offset == 0 {
            Ok(None)
        } else {
            self.resolve(offset).map(Some)
        }
    }

    /// Encode a pointer into this segment; fails outside the mapping.
    pub fn offset_of<T>(&self, ptr: *const T) -> Result<u64> {
        if !self.contains(ptr as *const u8, size_of::<T>()) {
            return Err(Error::invalid(format!("{ptr:p} is not inside segment at {:p}", self.base())));
        }
        Ok(make(ptr, self.base()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_rel_follows_field_address() {
        let target = 7u64;
        let link: SelfRel<u64> = SelfRel::null();
        assert!(link.get().is_null());
        link.set(&target);
        assert_eq!(unsafe { *link.get() }, 7);
        link.set(std::ptr::null());
        assert!(link.is_null());
    }

    #[test]
    fn view_rejects_out_of_range() {
        let mut buf = vec![0u64; 64];
        let base = NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap();
        let view = unsafe { SegmentView::new(base, 512) };
        assert!(view.resolve::<u64>(8).is_ok());
        assert!(matches!(view.resolve::<u64>(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(view.resolve::<u64>(508), Err(Error::Corruption(_))));
        assert!(matches!(view.resolve::<u64>(3), Err(Error::Corruption(_))));
        assert!(view.offset_of(&buf[63] as *const u64).is_ok());
        let outside = 5u64;
        assert!(view.offset_of(&outside as *const u64).is_err());
    }
}

//! Segment backends: where segment memory comes from and how it is mapped.

use crate::constants::{MIN_PAGE_SIZE, PREFIX};
use crate::errors::{Error, Result};
use crate::helpers::fnv1a_64;
#[cfg(unix)]
use crate::platform::unix::{make_os_id, platform_drop};
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// Provider of named, mappable memory regions.
pub trait SegmentBackend: Send + Sync {
    /// Registry key, at most 31 bytes.
    fn name(&self) -> &str;

    /// Create a region of `size` bytes; fails if `name` exists.
    fn allocate(&self, name: &str, size: u64) -> Result<()>;

    /// Remove a region. Live mappings stay valid until unmapped.
    fn deallocate(&self, name: &str) -> Result<()>;

    /// Map at least `size` bytes of an existing region. `hint` is a
    /// preferred address and may be ignored.
    fn map(&self, name: &str, size: u64, hint: Option<NonNull<u8>>) -> Result<NonNull<u8>>;

    /// Undo one `map`.
    fn unmap(&self, base: NonNull<u8>, size: u64) -> Result<()>;
}

// ───────────────────────────── posix ───────────────────────────────────── //

struct Mapping(Shmem);

// SAFETY: the mapping is only unmapped through `unmap`, which removes it
// from the table first; the raw pointer inside is never dereferenced here.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Named POSIX shared memory, one OS object per segment.
#[derive(Default)]
pub struct PosixBackend {
    mappings: DashMap<usize, Mapping>,
}

impl PosixBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn os_id(name: &str) -> String {
        make_os_id(PREFIX, fnv1a_64(name))
    }
}

impl SegmentBackend for PosixBackend {
    fn name(&self) -> &str {
        "posix"
    }

    fn allocate(&self, name: &str, size: u64) -> Result<()> {
        let os_id = Self::os_id(name);
        let mut shmem = match ShmemConf::new().os_id(&os_id).size(size as usize).create() {
            Ok(m) => m,
            Err(ShmemError::MappingIdExists) => {
                return Err(Error::invalid(format!("segment {name:?} already exists")))
            }
            Err(e) => return Err(e.into()),
        };
        // region outlives this handle; deallocate unlinks it
        shmem.set_owner(false);
        info!("[POSIX] allocated {name:?} as {os_id} ({size} bytes)");
        Ok(())
    }

    fn deallocate(&self, name: &str) -> Result<()> {
        let os_id = Self::os_id(name);
        platform_drop(&os_id)?;
        info!("[POSIX] unlinked {name:?} ({os_id})");
        Ok(())
    }

    fn map(&self, name: &str, size: u64, hint: Option<NonNull<u8>>) -> Result<NonNull<u8>> {
        if let Some(h) = hint {
            trace!("[POSIX] ignoring address hint {h:p} for {name:?}");
        }
        let os_id = Self::os_id(name);
        let shmem = match ShmemConf::new().os_id(&os_id).open() {
            Ok(m) => m,
            Err(ShmemError::MapOpenFailed(_)) | Err(ShmemError::NoLinkOrOsId) => {
                return Err(Error::not_found(format!("segment {name:?}")))
            }
            Err(e) => return Err(e.into()),
        };
        if (shmem.len() as u64) < size {
            return Err(Error::invalid(format!(
                "segment {name:?} holds {} bytes, {size} requested",
                shmem.len()
            )));
        }
        let base = NonNull::new(shmem.as_ptr()).ok_or_else(|| Error::Backend("null mapping".into()))?;
        self.mappings.insert(base.as_ptr() as usize, Mapping(shmem));
        debug!("[POSIX] mapped {name:?} at {base:p}");
        Ok(base)
    }

    fn unmap(&self, base: NonNull<u8>, _size: u64) -> Result<()> {
        match self.mappings.remove(&(base.as_ptr() as usize)) {
            Some(_) => {
                debug!("[POSIX] unmapped {base:p}");
                Ok(())
            }
            None => Err(Error::not_found(format!("no posix mapping at {base:p}"))),
        }
    }
}

// ───────────────────────────── local ───────────────────────────────────── //

struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is plain heap memory; concurrent access goes through
// the segment's own locks.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Process-private memory for threads of a single process, and for tests.
#[derive(Default)]
pub struct LocalBackend {
    regions: DashMap<String, Arc<Region>>,
    mapped: DashMap<usize, (Arc<Region>, usize)>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SegmentBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn allocate(&self, name: &str, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::invalid("zero-sized segment"));
        }
        let layout = Layout::from_size_align(size as usize, MIN_PAGE_SIZE as usize)
            .map_err(|e| Error::invalid(format!("segment layout: {e}")))?;
        match self.regions.entry(name.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::invalid(format!("segment {name:?} already exists")))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
                    .ok_or_else(|| Error::exhausted(format!("cannot allocate {size} bytes")))?;
                v.insert(Arc::new(Region { ptr, layout }));
                info!("[LOCAL] allocated {name:?} ({size} bytes)");
                Ok(())
            }
        }
    }

    fn deallocate(&self, name: &str) -> Result<()> {
        self.regions
            .remove(name)
            .map(|_| info!("[LOCAL] released {name:?}"))
            .ok_or_else(|| Error::not_found(format!("segment {name:?}")))
    }

    fn map(&self, name: &str, size: u64, _hint: Option<NonNull<u8>>) -> Result<NonNull<u8>> {
        let region = self
            .regions
            .get(name)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| Error::not_found(format!("segment {name:?}")))?;
        if (region.layout.size() as u64) < size {
            return Err(Error::invalid(format!(
                "segment {name:?} holds {} bytes, {size} requested",
                region.layout.size()
            )));
        }
        let base = region.ptr;
        self.mapped.entry(base.as_ptr() as usize).or_insert((region, 0)).1 += 1;
        Ok(base)
    }

    fn unmap(&self, base: NonNull<u8>, _size: u64) -> Result<()> {
        let key = base.as_ptr() as usize;
        let last = match self.mapped.get_mut(&key) {
            Some(mut e) => {
                e.1 -= 1;
                e.1 == 0
            }
            None => {
                warn!("[LOCAL] unmap of unknown base {base:p}");
                return Err(Error::not_found(format!("no local mapping at {base:p}")));
            }
        };
        if last {
            self.mapped.remove_if(&key, |_, (_, n)| *n == 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_region_survives_deallocate_until_unmapped() {
        let b = LocalBackend::new();
        b.allocate("r", 8192).unwrap();
        assert!(b.allocate("r", 8192).is_err());
        let p = b.map("r", 8192, None).unwrap();
        unsafe { p.as_ptr().write(7) };
        b.deallocate("r").unwrap();
        assert_eq!(unsafe { p.as_ptr().read() }, 7);
        b.unmap(p, 8192).unwrap();
        assert!(b.map("r", 8192, None).is_err());
    }

    #[test]
    fn local_map_rejects_oversized_request() {
        let b = LocalBackend::new();
        b.allocate("small", 4096).unwrap();
        assert!(matches!(b.map("small", 8192, None), Err(Error::InvalidArgument(_))));
        b.deallocate("small").unwrap();
    }
}

//! Segment creation, joining, and the per-process view of a mapped segment.
//!
//! Layout: page 0 holds the [`SegmentHeader`], page 1 the heap allocator,
//! and the heap arena starts at page 2. Everything else (object handlers,
//! port tables, the shared driver table) is carved from the heap during
//! creation. The header is written last, so a joiner that finds the magic
//! sees a fully initialised segment.

use crate::backend::SegmentBackend;
use crate::config::SegmentConfig;
use crate::constants::*;
use crate::ensure_logging;
use crate::errors::{Error, Result};
use crate::heap::{HeapAllocator, HDR};
use crate::helpers::{read_name, write_name};
use crate::object_pool::ObjectHandler;
use crate::peer::PeerDriver;
use crate::registry::Registry;
use crate::reladdr::{make, SegmentView};
use crate::spinlock::ShmLock;
use crate::types::*;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use memoffset::offset_of;
use metrics::gauge;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub struct Segment {
    pub(crate) registry: Arc<Registry>,
    pub(crate) backend: Arc<dyn SegmentBackend>,
    pub(crate) view: SegmentView,
    pub(crate) config: SegmentConfig,
    header: NonNull<SegmentHeader>,
    heap: NonNull<HeapAllocator>,
    object_handlers: NonNull<ObjectHandler>,
    request_h: NonNull<ObjectHandler>,
    port_h: NonNull<ObjectHandler>,
    ports: NonNull<AtomicU64>,
    path_next: NonNull<AtomicU32>,
    dst_gw: NonNull<AtomicU32>,
    shared: NonNull<SharedState>,
    peer_type_names: NonNull<u8>,
    peer_type_data: NonNull<AtomicU64>,
    max_peer_types: u64,
    peer_serial: Serial,
    drivers: RwLock<Vec<Option<Arc<dyn PeerDriver>>>>,
    pub(crate) req_data: DashMap<u64, usize>,
}

// SAFETY: every pointer refers into the shared mapping, which stays mapped
// while the segment lives; all mutation goes through atomics and spin locks.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

/// Carve every top-level structure out of a freshly mapped segment.
unsafe fn initialize(base: NonNull<u8>, size: u64, cfg: &SegmentConfig) -> Result<()> {
    let page = cfg.page_size();
    if page < MIN_PAGE_SIZE {
        return Err(Error::invalid(format!("page size {page} below {MIN_PAGE_SIZE}")));
    }
    let b = base.as_ptr();
    let heap_ptr = b.add(page as usize) as *mut HeapAllocator;
    HeapAllocator::init_in_place(heap_ptr, cfg.heap_size, cfg.page_shift, b.add(2 * page as usize))?;
    let heap = &*heap_ptr;
    let alloc = |bytes: u64, what: &str| {
        heap.allocate(bytes)
            .ok_or_else(|| Error::exhausted(format!("segment init: no heap space for {what}")))
    };

    let objh_mem = alloc(size_of::<ObjectHandler>() as u64, "object handlers")?;
    let objh_ptr = objh_mem.as_ptr() as *mut ObjectHandler;
    ObjectHandler::init_in_place(objh_ptr, b, MAGIC_OBJH, size_of::<ObjectHandler>() as u64, heap)?;
    let objh = &*objh_ptr;
    let handler = |magic: u32, obj_size: usize| -> Result<*mut ObjectHandler> {
        let mem = objh
            .get(true)
            .ok_or_else(|| Error::exhausted("segment init: no object handler"))?;
        let p = mem.as_ptr() as *mut ObjectHandler;
        ObjectHandler::init_in_place(p, b, magic, obj_size as u64, heap)?;
        Ok(p)
    };
    let request_h = handler(MAGIC_REQ, size_of::<Request>())?;
    let port_h = handler(MAGIC_PORT, size_of::<Port>())?;

    let nr = cfg.nr_ports as usize;
    let ports = alloc((nr * size_of::<u64>()) as u64, "port table")?;
    std::ptr::write_bytes(ports.as_ptr(), 0, nr * size_of::<u64>());
    // NO_PORT is all ones
    let path_next = alloc((nr * size_of::<u32>()) as u64, "next-hop table")?;
    std::ptr::write_bytes(path_next.as_ptr(), 0xff, nr * size_of::<u32>());
    let dst_gw = alloc((nr * size_of::<u32>()) as u64, "destination table")?;
    std::ptr::write_bytes(dst_gw.as_ptr(), 0xff, nr * size_of::<u32>());

    let shared = alloc(size_of::<SharedState>() as u64, "shared state")?;
    std::ptr::write(
        shared.as_ptr() as *mut SharedState,
        SharedState {
            segment_lock: crate::spinlock::SpinLock::new(),
            flags: AtomicU64::new(0),
            nr_peer_types: AtomicU64::new(0),
        },
    );

    let names = alloc(page, "peer type names")?;
    let names_len = HeapAllocator::chunk_size(names);
    std::ptr::write_bytes(names.as_ptr(), 0, names_len as usize);
    let max_peer_types = names_len / TYPE_NAME_LEN as u64;
    let data = alloc(max_peer_types * size_of::<u64>() as u64, "peer type data")?;
    std::ptr::write_bytes(data.as_ptr(), 0, HeapAllocator::chunk_size(data) as usize);

    std::ptr::write(
        b as *mut SegmentHeader,
        SegmentHeader {
            magic: 0,
            version: SEGMENT_VERSION,
            segment_size: size,
            config: RawConfig::from_config(cfg),
            heap: make(heap_ptr, b),
            object_handlers: make(objh_ptr, b),
            request_h: make(request_h, b),
            port_h: make(port_h, b),
            ports: make(ports.as_ptr(), b),
            path_next: make(path_next.as_ptr(), b),
            dst_gw: make(dst_gw.as_ptr(), b),
            shared: make(shared.as_ptr(), b),
            peer_types: make(names.as_ptr(), b),
            peer_type_data: make(data.as_ptr(), b),
            max_peer_types,
            counters: Counters { req_cnt: AtomicU64::new(0), total_req_lat: AtomicU64::new(0) },
        },
    );
    std::sync::atomic::fence(Ordering::Release);
    (*(b as *mut SegmentHeader)).magic = SEGMENT_MAGIC;
    Ok(())
}

/// Read (magic, version, size) from a header page.
unsafe fn probe_header(base: NonNull<u8>) -> Result<u64> {
    let b = base.as_ptr();
    let magic = (b.add(offset_of!(SegmentHeader, magic)) as *const u64).read_volatile();
    let version = (b.add(offset_of!(SegmentHeader, version)) as *const u64).read_volatile();
    let size = (b.add(offset_of!(SegmentHeader, segment_size)) as *const u64).read_volatile();
    if magic != SEGMENT_MAGIC {
        return Err(Error::corruption(format!("bad segment magic {magic:#x}")));
    }
    if version != SEGMENT_VERSION {
        return Err(Error::ProtocolMismatch { expected: SEGMENT_VERSION, found: version });
    }
    if size < MIN_PAGE_SIZE {
        return Err(Error::corruption(format!("segment size {size} below one page")));
    }
    Ok(size)
}

impl Segment {
    /// Allocate, map, initialise and unmap a new segment.
    pub fn create(registry: &Registry, cfg: &SegmentConfig) -> Result<()> {
        ensure_logging();
        cfg.validate()?;
        let backend = registry.find_or_load_backend(&cfg.backend)?;
        let size = cfg.segment_size()?;
        if cfg.page_size() < MIN_PAGE_SIZE {
            return Err(Error::invalid(format!("page size {} below {MIN_PAGE_SIZE}", cfg.page_size())));
        }

        backend.allocate(&cfg.name, size)?;
        let base = match backend.map(&cfg.name, size, None) {
            Ok(b) => b,
            Err(e) => {
                error!("[CREATE] cannot map {}: {e}", cfg.name);
                let _ = backend.deallocate(&cfg.name);
                return Err(e);
            }
        };
        let r = unsafe { initialize(base, size, cfg) };
        if let Err(e) = backend.unmap(base, size) {
            warn!("[CREATE] unmap of {} failed: {e}", cfg.name);
        }
        if let Err(e) = r {
            error!("[CREATE] cannot initialise {}: {e}", cfg.name);
            let _ = backend.deallocate(&cfg.name);
            return Err(e);
        }
        info!("[CREATE] {cfg} ({size} bytes)");
        Ok(())
    }

    /// Remove a segment through its backend. Joined handles must be gone first.
    pub fn destroy(registry: &Registry, backend_type: &str, name: &str) -> Result<()> {
        let backend = registry.find_or_load_backend(backend_type)?;
        backend.deallocate(name)?;
        info!("[DESTROY] {backend_type}:{name}");
        Ok(())
    }

    /// Map an existing segment and attach as `peer_type`.
    pub fn join(registry: &Arc<Registry>, backend_type: &str, name: &str, peer_type: &str) -> Result<Self> {
        ensure_logging();
        let backend = registry.find_or_load_backend(backend_type)?;
        registry.find_or_load_peer(peer_type)?;

        let probe = backend.map(name, MIN_PAGE_SIZE, None)?;
        let probed = unsafe { probe_header(probe) };
        if let Err(e) = backend.unmap(probe, MIN_PAGE_SIZE) {
            warn!("[JOIN] unmap of header probe failed: {e}");
        }
        let size = probed?;

        let base = registry.acquire_mapping(&backend, name, size)?;
        let mut seg = match unsafe { Self::attach(registry, &backend, base, size) } {
            Ok(s) => s,
            Err(e) => {
                error!("[JOIN] {backend_type}:{name}: {e}");
                registry.release_mapping(&backend, name);
                return Err(e);
            }
        };
        // from here on Drop releases the mapping
        seg.peer_serial = seg.enable_driver(peer_type)?;
        info!(
            "[JOIN] {backend_type}:{name} at {:p} as {peer_type} (serial {})",
            base, seg.peer_serial
        );
        Ok(seg)
    }

    /// Translate and bounds-check every top-level reference.
    unsafe fn attach(
        registry: &Arc<Registry>,
        backend: &Arc<dyn SegmentBackend>,
        base: NonNull<u8>,
        size: u64,
    ) -> Result<Self> {
        let view = SegmentView::new(base, size);
        let header = base.cast::<SegmentHeader>();
        let hdr = header.as_ref();
        if hdr.segment_size != size {
            return Err(Error::corruption("segment size changed while joining"));
        }
        let config = hdr.config.to_config();
        let nr = config.nr_ports as usize;
        let max_peer_types = hdr.max_peer_types;

        let array = |off: u64, elem: usize, len: usize, what: &str| -> Result<NonNull<u8>> {
            let p = view.resolve::<u64>(off)?.cast::<u8>();
            if !view.contains(p.as_ptr(), elem * len) {
                return Err(Error::corruption(format!("{what} runs past the segment end")));
            }
            Ok(p)
        };

        let seg = Segment {
            registry: Arc::clone(registry),
            backend: Arc::clone(backend),
            view,
            header,
            heap: view.resolve(hdr.heap)?,
            object_handlers: view.resolve(hdr.object_handlers)?,
            request_h: view.resolve(hdr.request_h)?,
            port_h: view.resolve(hdr.port_h)?,
            ports: array(hdr.ports, size_of::<u64>(), nr, "port table")?.cast(),
            path_next: array(hdr.path_next, size_of::<u32>(), nr, "next-hop table")?.cast(),
            dst_gw: array(hdr.dst_gw, size_of::<u32>(), nr, "destination table")?.cast(),
            shared: view.resolve(hdr.shared)?,
            peer_type_names: array(hdr.peer_types, TYPE_NAME_LEN, max_peer_types as usize, "peer names")?,
            peer_type_data: array(hdr.peer_type_data, size_of::<u64>(), max_peer_types as usize, "peer data")?
                .cast(),
            max_peer_types,
            peer_serial: u64::MAX,
            drivers: RwLock::new(vec![None; max_peer_types as usize]),
            req_data: DashMap::new(),
            config,
        };
        Ok(seg)
    }

    /// Detach from the segment.
    pub fn leave(self) {
        drop(self)
    }

    // ───────────────────────── accessors ─────────────────────────────── //

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn base(&self) -> *mut u8 {
        self.view.base()
    }

    pub fn size(&self) -> u64 {
        self.view.size()
    }

    pub fn nr_ports(&self) -> u32 {
        self.config.nr_ports
    }

    pub fn dynports(&self) -> u32 {
        self.config.dynports
    }

    /// Serial of this process's peer type.
    pub fn peer_serial(&self) -> Serial {
        self.peer_serial
    }

    pub fn max_peer_types(&self) -> u64 {
        self.max_peer_types
    }

    pub(crate) fn header(&self) -> &SegmentHeader {
        unsafe { self.header.as_ref() }
    }

    pub fn heap(&self) -> &HeapAllocator {
        unsafe { self.heap.as_ref() }
    }

    pub(crate) fn object_handlers(&self) -> &ObjectHandler {
        unsafe { self.object_handlers.as_ref() }
    }

    /// Pool of request objects.
    pub fn request_pool(&self) -> &ObjectHandler {
        unsafe { self.request_h.as_ref() }
    }

    pub(crate) fn port_pool(&self) -> &ObjectHandler {
        unsafe { self.port_h.as_ref() }
    }

    pub(crate) fn shared(&self) -> &SharedState {
        unsafe { self.shared.as_ref() }
    }

    pub(crate) fn port_slots(&self) -> &[AtomicU64] {
        unsafe { std::slice::from_raw_parts(self.ports.as_ptr(), self.config.nr_ports as usize) }
    }

    pub(crate) fn path_next(&self) -> &[AtomicU32] {
        unsafe { std::slice::from_raw_parts(self.path_next.as_ptr(), self.config.nr_ports as usize) }
    }

    pub(crate) fn dst_gw(&self) -> &[AtomicU32] {
        unsafe { std::slice::from_raw_parts(self.dst_gw.as_ptr(), self.config.nr_ports as usize) }
    }

    fn peer_data_slots(&self) -> &[AtomicU64] {
        unsafe { std::slice::from_raw_parts(self.peer_type_data.as_ptr(), self.max_peer_types as usize) }
    }

    fn peer_name_slot(&self, serial: u64) -> *mut u8 {
        unsafe { self.peer_type_names.as_ptr().add(serial as usize * TYPE_NAME_LEN) }
    }

    /// Resolve an offset to a shared reference.
    pub fn resolve<T>(&self, offset: u64) -> Result<&T> {
        self.view.resolve::<T>(offset).map(|p| unsafe { &*p.as_ptr() })
    }

    pub fn resolve_ptr<T>(&self, offset: u64) -> Result<NonNull<T>> {
        self.view.resolve::<T>(offset)
    }

    pub fn offset_of<T>(&self, ptr: *const T) -> Result<u64> {
        self.view.offset_of(ptr)
    }

    // ───────────────────────── heap ──────────────────────────────────── //

    /// Raw heap memory, for payloads outside requests.
    pub fn alloc_buffer(&self, bytes: u64) -> Option<NonNull<u8>> {
        self.heap().allocate(bytes)
    }

    fn own_chunk(&self, ptr: NonNull<u8>) -> Result<()> {
        let hdr = (ptr.as_ptr() as usize).wrapping_sub(HDR as usize) as *const u8;
        if !self.view.contains(hdr, HDR as usize) {
            return Err(Error::invalid(format!("{ptr:p} is not inside this segment")));
        }
        match unsafe { HeapAllocator::owner_of(ptr) } {
            Some(h) if std::ptr::eq(h, self.heap()) => Ok(()),
            _ => Err(Error::corruption(format!("{ptr:p} was not allocated from this heap"))),
        }
    }

    pub fn free_buffer(&self, ptr: NonNull<u8>) -> Result<()> {
        self.own_chunk(ptr)?;
        unsafe { HeapAllocator::free(ptr) };
        Ok(())
    }

    pub fn buffer_size(&self, ptr: NonNull<u8>) -> Result<u64> {
        self.own_chunk(ptr)?;
        Ok(unsafe { HeapAllocator::chunk_size(ptr) })
    }

    // ───────────────────────── object handlers ───────────────────────── //

    /// New object handler for `size`-byte objects; returns its offset.
    pub fn get_objh(&self, magic: u32, size: u64) -> Result<u64> {
        let handlers = self.object_handlers();
        let mem = handlers
            .get(true)
            .ok_or_else(|| Error::exhausted("no object handler available"))?;
        let p = mem.as_ptr() as *mut ObjectHandler;
        if let Err(e) = unsafe { ObjectHandler::init_in_place(p, self.base(), magic, size, self.heap()) } {
            unsafe { handlers.put(mem) };
            return Err(e);
        }
        self.offset_of(p as *const ObjectHandler)
    }

    pub fn put_objh(&self, offset: u64) -> Result<()> {
        let p = self.resolve_ptr::<ObjectHandler>(offset)?;
        let handlers = self.object_handlers();
        if !handlers.contains(p.as_ptr() as *const u8) {
            return Err(Error::invalid(format!("{offset:#x} is not an object handler")));
        }
        unsafe { handlers.put(p.cast()) };
        Ok(())
    }

    pub fn objh_at(&self, offset: u64) -> Result<&ObjectHandler> {
        self.resolve::<ObjectHandler>(offset)
    }

    // ───────────────────────── drivers ───────────────────────────────── //

    /// Publish a peer type in the shared name table (once) and make sure
    /// its per-segment data exists. Returns the type's serial.
    pub fn enable_driver(&self, name: &str) -> Result<Serial> {
        let driver = self.registry.find_or_load_peer(name)?;
        let shared = self.shared();
        let serial = {
            let _g = shared.segment_lock.lock();
            let n = shared.nr_peer_types.load(Ordering::Acquire);
            let found = (0..n).find(|&i| self.peer_type_name(i).as_deref() == Some(name));
            let serial = match found {
                Some(s) => s,
                None => {
                    if n >= self.max_peer_types {
                        return Err(Error::exhausted("segment peer type table full"));
                    }
                    let slot =
                        unsafe { std::slice::from_raw_parts_mut(self.peer_name_slot(n), TYPE_NAME_LEN) };
                    write_name(slot, name);
                    shared.nr_peer_types.store(n + 1, Ordering::Release);
                    debug!("[DRIVER] {name:?} published as serial {n}");
                    n
                }
            };
            let data = &self.peer_data_slots()[serial as usize];
            if data.load(Ordering::Acquire) == 0 {
                let d = driver.alloc_data(self)?;
                data.store(d, Ordering::Release);
            }
            serial
        };
        let mut drivers = self.drivers.write().unwrap_or_else(|p| p.into_inner());
        drivers[serial as usize] = Some(driver);
        Ok(serial)
    }

    /// Forget a driver in this process. The shared table is append-only.
    pub fn disable_driver(&self, name: &str) -> Result<()> {
        let driver = self
            .registry
            .find_peer(name)
            .ok_or_else(|| Error::not_found(format!("peer type {name:?}")))?;
        let mut drivers = self.drivers.write().unwrap_or_else(|p| p.into_inner());
        for d in drivers.iter_mut() {
            if d.as_ref().is_some_and(|x| Arc::ptr_eq(x, &driver)) {
                *d = None;
            }
        }
        Ok(())
    }

    /// Name published under `serial`.
    pub fn peer_type_name(&self, serial: Serial) -> Option<String> {
        if serial >= self.shared().nr_peer_types.load(Ordering::Acquire) {
            return None;
        }
        let slot = unsafe { std::slice::from_raw_parts(self.peer_name_slot(serial), TYPE_NAME_LEN) };
        Some(read_name(slot))
    }

    /// Driver for `serial`, loaded into this process on first use.
    pub fn peer_type(&self, serial: Serial) -> Option<Arc<dyn PeerDriver>> {
        if serial >= self.max_peer_types {
            return None;
        }
        if let Some(d) = self.drivers.read().unwrap_or_else(|p| p.into_inner())[serial as usize].clone() {
            return Some(d);
        }
        let name = self.peer_type_name(serial)?;
        let driver = match self.registry.find_or_load_peer(&name) {
            Ok(d) => d,
            Err(e) => {
                warn!("[DRIVER] serial {serial} ({name:?}) unavailable: {e}");
                return None;
            }
        };
        let mut drivers = self.drivers.write().unwrap_or_else(|p| p.into_inner());
        drivers[serial as usize] = Some(Arc::clone(&driver));
        Some(driver)
    }

    /// Per-segment private data offset of `serial`, or 0.
    pub fn peer_type_data(&self, serial: Serial) -> u64 {
        self.peer_data_slots()
            .get(serial as usize)
            .map_or(0, |d| d.load(Ordering::Acquire))
    }

    pub(crate) fn driver(&self) -> Result<Arc<dyn PeerDriver>> {
        self.peer_type(self.peer_serial)
            .ok_or_else(|| Error::not_found("this process's peer type"))
    }

    fn port_driver(&self, portno: PortNo) -> Result<Arc<dyn PeerDriver>> {
        let port = self
            .get_port(portno)
            .ok_or_else(|| Error::not_found(format!("port {portno}")))?;
        self.peer_type(port.peer_type())
            .ok_or_else(|| Error::not_found(format!("driver of port {portno}")))
    }

    // ───────────────────────── signals ───────────────────────────────── //

    pub fn init_local_signal(&self, portno: PortNo) -> Result<()> {
        self.port_driver(portno)?.local_signal_init(self, portno)
    }

    pub fn quit_local_signal(&self, portno: PortNo) -> Result<()> {
        self.port_driver(portno)?.local_signal_quit(self, portno)
    }

    pub fn prepare_wait(&self, portno: PortNo) -> Result<()> {
        self.port_driver(portno)?.prepare_wait(self, portno)
    }

    pub fn cancel_wait(&self, portno: PortNo) -> Result<()> {
        self.port_driver(portno)?.cancel_wait(self, portno)
    }

    /// Block on `portno`'s descriptor; `true` when woken by a signal.
    pub fn wait_signal(&self, portno: PortNo, timeout: Duration) -> Result<bool> {
        let port = self
            .get_port(portno)
            .ok_or_else(|| Error::not_found(format!("port {portno}")))?;
        self.port_driver(portno)?
            .wait_signal(self, port.signal_desc(), timeout)
    }

    /// Wake whoever waits on `portno`.
    pub fn signal(&self, portno: PortNo) -> Result<()> {
        self.port_driver(portno)?.signal(self, portno)
    }

    // ───────────────────────── counters ──────────────────────────────── //

    pub(crate) fn record_latency(&self, micros: u64) {
        let c = &self.header().counters;
        c.req_cnt.fetch_add(1, Ordering::Relaxed);
        c.total_req_lat.fetch_add(micros, Ordering::Relaxed);
    }

    /// Completed timed requests and their average latency in microseconds.
    pub fn request_stats(&self) -> (u64, u64) {
        let c = &self.header().counters;
        let n = c.req_cnt.load(Ordering::Relaxed);
        let total = c.total_req_lat.load(Ordering::Relaxed);
        (n, if n == 0 { 0 } else { total / n })
    }

    /// Emit gauges (caller decides cadence).
    pub fn report_metrics(&self) {
        gauge!("shmroute_heap_free_bytes").set(self.heap().free_bytes() as f64);
        gauge!("shmroute_free_requests").set(self.request_pool().nr_free() as f64);
        let (n, avg) = self.request_stats();
        gauge!("shmroute_completed_requests").set(n as f64);
        gauge!("shmroute_avg_request_latency_us").set(avg as f64);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.registry.release_mapping(&self.backend, &self.config.name);
        debug!("[LEAVE] {}:{}", self.backend.name(), self.config.name);
    }
}

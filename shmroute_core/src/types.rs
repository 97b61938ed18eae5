//! Structures laid out inside a segment


use crate::constants::{MAX_PATH_LEN, SEGMENT_NAME_LEN, TYPE_NAME_LEN};
use crate::heap::HeapAllocator;
use crate::helpers::{now_micros, read_name, write_name};
use crate::index_queue::IndexQueue;
use crate::reladdr::SelfRel;
use crate::spinlock::SpinLock;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Port number; [`NO_PORT`] means "none".
pub type PortNo = u32;
pub const NO_PORT: PortNo = u32::MAX;
pub use crate::spinlock::NO_OWNER;
/// Peer-type serial; index into the segment's driver name table.
pub type Serial = u64;

/// Request flags.
pub const X_ALLOC: u32 = 1 << 0;
pub const X_LOCAL: u32 = 1 << 1;
pub const X_NONBLOCK: u32 = 1 << 2;

/// Port capability flags.
pub const CAN_ACCEPT: u32 = 1 << 0;
pub const CAN_RECEIVE: u32 = 1 << 1;

/// Config as stored in the header.
#[repr(C)]
pub struct RawConfig {
    pub backend: [u8; TYPE_NAME_LEN],
    pub name: [u8; SEGMENT_NAME_LEN],
    pub dynports: u32,
    pub nr_ports: u32,
    pub heap_size: u64,
    pub page_shift: u32,
    pub _pad: u32,
}

impl RawConfig {
    pub fn from_config(cfg: &crate::config::SegmentConfig) -> Self {
        let mut raw = RawConfig {
            backend: [0; TYPE_NAME_LEN],
            name: [0; SEGMENT_NAME_LEN],
            dynports: cfg.dynports,
            nr_ports: cfg.nr_ports,
            heap_size: cfg.heap_size,
            page_shift: cfg.page_shift,
            _pad: 0,
        };
        write_name(&mut raw.backend, &cfg.backend);
        write_name(&mut raw.name, &cfg.name);
        raw
    }

    pub fn to_config(&self) -> crate::config::SegmentConfig {
        crate::config::SegmentConfig {
            backend: read_name(&self.backend),
            name: read_name(&self.name),
            dynports: self.dynports,
            nr_ports: self.nr_ports,
            heap_size: self.heap_size,
            page_shift: self.page_shift,
        }
    }
}

#[repr(C)]
pub struct Counters {
    pub req_cnt: AtomicU64,
    /// Sum of request latencies in microseconds.
    pub total_req_lat: AtomicU64,
}

/// Page 0 of every segment. All references are base-relative offsets.
#[repr(C, align(64))]
pub struct SegmentHeader {
    pub magic: u64,
    pub version: u64,
    pub segment_size: u64,
    pub config: RawConfig,
    pub heap: u64,
    pub object_handlers: u64,
    pub request_h: u64,
    pub port_h: u64,
    pub ports: u64,
    pub path_next: u64,
    pub dst_gw: u64,
    pub shared: u64,
    pub peer_types: u64,
    pub peer_type_data: u64,
    pub max_peer_types: u64,
    pub counters: Counters,
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() <= crate::constants::MIN_PAGE_SIZE as usize);
const _: () = assert!(std::mem::size_of::<HeapAllocator>() <= crate::constants::MIN_PAGE_SIZE as usize);

/// Segment-wide mutable state.
#[repr(C)]
pub struct SharedState {
    pub segment_lock: SpinLock,
    pub flags: AtomicU64,
    pub nr_peer_types: AtomicU64,
}

#[repr(C)]
pub struct Port {
    pub(crate) fq_lock: SpinLock,
    pub(crate) rq_lock: SpinLock,
    pub(crate) pq_lock: SpinLock,
    pub(crate) port_lock: SpinLock,
    pub(crate) free_queue: AtomicU64,
    pub(crate) request_queue: AtomicU64,
    pub(crate) reply_queue: AtomicU64,
    pub(crate) signal_desc: AtomicU64,
    pub(crate) peer_type: AtomicU64,
    pub(crate) owner: AtomicU64,
    pub(crate) alloc_reqs: AtomicU64,
    pub(crate) max_alloc_reqs: AtomicU64,
    pub(crate) portno: AtomicU32,
    pub(crate) flags: AtomicU32,
}

impl Port {
    pub fn portno(&self) -> PortNo {
        self.portno.load(Ordering::Relaxed)
    }

    pub fn owner(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Replace the capability flags (`CAN_ACCEPT`, `CAN_RECEIVE`).
    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Release);
    }

    pub fn can_accept(&self) -> bool {
        self.flags() & CAN_ACCEPT != 0
    }

    pub fn can_receive(&self) -> bool {
        self.flags() & CAN_RECEIVE != 0
    }

    pub fn peer_type(&self) -> Serial {
        self.peer_type.load(Ordering::Relaxed)
    }

    pub fn signal_desc(&self) -> u64 {
        self.signal_desc.load(Ordering::Acquire)
    }

    pub fn alloc_reqs(&self) -> u64 {
        self.alloc_reqs.load(Ordering::Relaxed)
    }

    pub fn max_alloc_reqs(&self) -> u64 {
        self.max_alloc_reqs.load(Ordering::Relaxed)
    }
}

/// A routed message. Buffers are carved from the segment heap; the path
/// stack records the ports a request passed through so replies can find
/// their way back.
#[repr(C)]
pub struct Request {
    pub(crate) buffer: SelfRel<u8>,
    pub(crate) bufferlen: AtomicU64,
    pub(crate) target: SelfRel<u8>,
    pub(crate) targetlen: AtomicU64,
    pub(crate) data: SelfRel<u8>,
    pub(crate) datalen: AtomicU64,
    pub(crate) offset: AtomicU64,
    pub(crate) size: AtomicU64,
    pub(crate) serviced: AtomicU64,
    pub(crate) timestamp: AtomicU64,
    pub(crate) elapsed: AtomicU64,
    pub(crate) op: AtomicU32,
    pub(crate) state: AtomicU32,
    pub(crate) flags: AtomicU32,
    pub(crate) src_portno: AtomicU32,
    pub(crate) transit_portno: AtomicU32,
    pub(crate) dst_portno: AtomicU32,
    pub(crate) effective_dst_portno: AtomicU32,
    pub(crate) _pad: u32,
    pub(crate) path: IndexQueue,
    pub(crate) path_bufs: [AtomicU64; MAX_PATH_LEN],
}

macro_rules! req_field {
    ($get:ident, $set:ident, $field:ident, $ty:ty) => {
        pub fn $get(&self) -> $ty {
            self.$field.load(Ordering::Acquire)
        }
        pub fn $set(&self, v: $ty) {
            self.$field.store(v, Ordering::Release)
        }
    };
}

impl Request {
    req_field!(op, set_op, op, u32);
    req_field!(state, set_state, state, u32);
    req_field!(flags, set_flags, flags, u32);
    req_field!(offset, set_offset, offset, u64);
    req_field!(size, set_size, size, u64);
    req_field!(serviced, set_serviced, serviced, u64);
    req_field!(src_portno, set_src_portno, src_portno, PortNo);
    req_field!(transit_portno, set_transit_portno, transit_portno, PortNo);
    req_field!(dst_portno, set_dst_portno, dst_portno, PortNo);
    req_field!(effective_dst_portno, set_effective_dst_portno, effective_dst_portno, PortNo);

    /// Microseconds spent in transit so far.
    pub fn elapsed(&self) -> u64 {
        self.elapsed.load(Ordering::Relaxed)
    }

    pub fn bufferlen(&self) -> u64 {
        self.bufferlen.load(Ordering::Relaxed)
    }

    pub fn targetlen(&self) -> u64 {
        self.targetlen.load(Ordering::Relaxed)
    }

    pub fn datalen(&self) -> u64 {
        self.datalen.load(Ordering::Relaxed)
    }

    /// Entries on the path stack.
    pub fn path_len(&self) -> u64 {
        self.path.count()
    }

    pub(crate) fn buffer_ptr(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.buffer.get())
    }

    /// Target name bytes.
    ///
    /// # Safety
    /// The caller must own the request (no other party may be writing it).
    pub unsafe fn target(&self) -> &[u8] {
        match NonNull::new(self.target.get()) {
            Some(p) => std::slice::from_raw_parts(p.as_ptr(), self.targetlen() as usize),
            None => &[],
        }
    }

    /// Data bytes.
    ///
    /// # Safety
    /// As for [`Request::target`].
    pub unsafe fn data(&self) -> &[u8] {
        match NonNull::new(self.data.get()) {
            Some(p) => std::slice::from_raw_parts(p.as_ptr(), self.datalen() as usize),
            None => &[],
        }
    }

    /// Mutable data bytes.
    ///
    /// # Safety
    /// As for [`Request::target`]; no other slice of this request may be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut [u8] {
        match NonNull::new(self.data.get()) {
            Some(p) => std::slice::from_raw_parts_mut(p.as_ptr(), self.datalen() as usize),
            None => &mut [],
        }
    }

    /// Copy `src` into the target area; fails if it does not fit.
    pub fn write_target(&self, src: &[u8]) -> bool {
        let Some(p) = NonNull::new(self.target.get()) else { return src.is_empty() };
        if src.len() as u64 > self.targetlen() {
            return false;
        }
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), p.as_ptr(), src.len()) };
        true
    }

    /// Copy `src` into the data area; fails if it does not fit.
    pub fn write_data(&self, src: &[u8]) -> bool {
        let Some(p) = NonNull::new(self.data.get()) else { return src.is_empty() };
        if src.len() as u64 > self.datalen() {
            return false;
        }
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), p.as_ptr(), src.len()) };
        true
    }

    pub fn read_target(&self) -> Vec<u8> {
        unsafe { self.target().to_vec() }
    }

    pub fn read_data(&self) -> Vec<u8> {
        unsafe { self.data().to_vec() }
    }

    /// Clear routing state and buffers references; the path stack is emptied.
    pub(crate) fn reset(&self) {
        self.buffer.set(std::ptr::null());
        self.bufferlen.store(0, Ordering::Relaxed);
        self.target.set(std::ptr::null());
        self.targetlen.store(0, Ordering::Relaxed);
        self.data.set(std::ptr::null());
        self.datalen.store(0, Ordering::Relaxed);
        self.offset.store(0, Ordering::Relaxed);
        self.size.store(0, Ordering::Relaxed);
        self.serviced.store(0, Ordering::Relaxed);
        self.timestamp.store(0, Ordering::Relaxed);
        self.elapsed.store(0, Ordering::Relaxed);
        self.op.store(0, Ordering::Relaxed);
        self.state.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        for p in [&self.src_portno, &self.transit_portno, &self.dst_portno, &self.effective_dst_portno] {
            p.store(NO_PORT, Ordering::Relaxed);
        }
        unsafe {
            self.path
                .init_empty(MAX_PATH_LEN as u64, self.path_bufs.as_ptr() as *mut u64);
        }
    }

    /// Add the time since the last stamp to `elapsed` and restamp.
    pub(crate) fn touch(&self) {
        let now = now_micros();
        let prev = self.timestamp.swap(now, Ordering::Relaxed);
        if prev != 0 && now > prev {
            self.elapsed.fetch_add(now - prev, Ordering::Relaxed);
        }
    }
}

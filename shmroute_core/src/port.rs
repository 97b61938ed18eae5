//! Port lifecycle: binding, unbinding, routing tables and request limits.

use crate::constants::{DEF_MAX_ALLOCATED_REQS, DEF_PORT_QUEUE_SLOTS};
use crate::errors::{Error, Result};
use crate::heap::HeapAllocator;
use crate::index_queue::IndexQueue;
use crate::peer::PeerDriver;
use crate::platform::unix::current_identity;
use crate::segment::Segment;
use crate::spinlock::{ShmLock, SpinLock};
use crate::types::*;
use log::{debug, info, warn};
use metrics::counter;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Port state captured before a bind takes it over.
#[derive(Clone, Copy)]
struct Prior {
    sd: u64,
    serial: Serial,
    owner: u64,
    flags: u32,
}

impl Segment {
    /// Port bound at `portno`, if any.
    pub fn get_port(&self, portno: PortNo) -> Option<&Port> {
        let off = self.port_slots().get(portno as usize)?.load(Ordering::Acquire);
        if off == 0 {
            return None;
        }
        match self.resolve::<Port>(off) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("[PORT] slot {portno}: {e}");
                None
            }
        }
    }

    pub fn portno_of(&self, port: &Port) -> PortNo {
        port.portno()
    }

    pub(crate) fn validate_port(&self, portno: PortNo) -> bool {
        portno < self.nr_ports()
    }

    pub(crate) fn queue_at(&self, offset: u64) -> Result<&IndexQueue> {
        self.resolve::<IndexQueue>(offset)
    }

    /// A queue with at least `slots` entries, header and buffer in one chunk.
    pub(crate) fn alloc_queue(&self, slots: u64) -> Result<u64> {
        let mem = self
            .heap()
            .allocate(IndexQueue::block_size(slots))
            .ok_or_else(|| Error::exhausted(format!("no heap space for a {slots}-slot queue")))?;
        let slots = IndexQueue::slots_for(unsafe { HeapAllocator::chunk_size(mem) });
        unsafe { IndexQueue::init_in_block(mem.as_ptr() as *mut IndexQueue, slots) };
        self.offset_of(mem.as_ptr() as *const u8)
    }

    pub(crate) fn free_queue_block(&self, offset: u64) {
        match self.resolve_ptr::<u8>(offset) {
            Ok(p) => unsafe { HeapAllocator::free(p) },
            Err(e) => warn!("[PORT] cannot free queue at {offset:#x}: {e}"),
        }
    }

    fn alloc_port(&self) -> Result<&Port> {
        let mem = self
            .port_pool()
            .get(true)
            .ok_or_else(|| Error::exhausted("no memory for a port"))?;
        let mut queues = Vec::with_capacity(3);
        for _ in 0..3 {
            match self.alloc_queue(DEF_PORT_QUEUE_SLOTS) {
                Ok(q) => queues.push(q),
                Err(e) => {
                    queues.into_iter().for_each(|q| self.free_queue_block(q));
                    unsafe { self.port_pool().put(mem) };
                    return Err(e);
                }
            }
        }
        let p = mem.as_ptr() as *mut Port;
        unsafe {
            std::ptr::write(
                p,
                Port {
                    fq_lock: SpinLock::new(),
                    rq_lock: SpinLock::new(),
                    pq_lock: SpinLock::new(),
                    port_lock: SpinLock::new(),
                    free_queue: AtomicU64::new(queues[0]),
                    request_queue: AtomicU64::new(queues[1]),
                    reply_queue: AtomicU64::new(queues[2]),
                    signal_desc: AtomicU64::new(0),
                    peer_type: AtomicU64::new(0),
                    owner: AtomicU64::new(NO_OWNER),
                    alloc_reqs: AtomicU64::new(0),
                    max_alloc_reqs: AtomicU64::new(DEF_MAX_ALLOCATED_REQS),
                    portno: AtomicU32::new(NO_PORT),
                    flags: AtomicU32::new(0),
                },
            );
            Ok(&*p)
        }
    }

    fn free_port(&self, port: &Port) {
        for q in [&port.free_queue, &port.request_queue, &port.reply_queue] {
            let off = q.swap(0, Ordering::AcqRel);
            if off != 0 {
                self.free_queue_block(off);
            }
        }
        unsafe { self.port_pool().put(NonNull::from(port).cast()) };
    }

    /// Bind a port for this process.
    ///
    /// `Some(n)` with `n < dynports` binds exactly `n`, taking it over if it
    /// exists. `None` binds the first unowned port in `[dynports, nr_ports)`.
    /// A failure leaves the port as it was, or unallocated if it was new.
    #[track_caller]
    pub fn bind_port(&self, req: Option<PortNo>) -> Result<&Port> {
        let driver = self.driver()?;
        let serial = self.peer_serial();
        let data = self.peer_type_data(serial);
        let (dynports, nr) = (self.dynports(), self.nr_ports());

        let (port, prior) = {
            let _g = self.shared().segment_lock.lock();
            let portno = match req {
                Some(p) if p < dynports => p,
                Some(p) => {
                    return Err(Error::invalid(format!(
                        "port {p} is not below dynports ({dynports}); bind it dynamically"
                    )))
                }
                None => (dynports..nr)
                    .find(|&p| self.get_port(p).map_or(true, |port| port.owner() == NO_OWNER))
                    .ok_or_else(|| Error::exhausted("no free dynamic port"))?,
            };
            self.bind_locked(portno, &driver, serial, data)?
        };

        let portno = port.portno();
        if let Err(e) = driver.local_signal_init(self, portno) {
            warn!("[BIND] port {portno}: local signal init failed: {e}");
            let _g = self.shared().segment_lock.lock();
            self.unwind_bind(port, prior, &driver, data);
            return Err(e);
        }
        if let Some(Prior { sd, serial: old_serial, .. }) = prior {
            if sd != 0 && sd != port.signal_desc() {
                self.drop_signal_desc(portno, old_serial, sd);
            }
        }
        counter!("shmroute_binds_total").increment(1);
        info!("[BIND] port {portno} as {} (serial {serial})", driver.name());
        Ok(port)
    }

    /// Bind the first free dynamic port.
    #[track_caller]
    pub fn bind_dynport(&self) -> Result<&Port> {
        self.bind_port(None)
    }

    /// Claim `portno` under the segment lock. Returns the port and, when it
    /// already existed, its state before the claim. A descriptor replaced
    /// here stays allocated until the caller commits or unwinds.
    fn bind_locked(
        &self,
        portno: PortNo,
        driver: &Arc<dyn PeerDriver>,
        serial: Serial,
        data: u64,
    ) -> Result<(&Port, Option<Prior>)> {
        let (port, prior) = match self.get_port(portno) {
            Some(p) => (
                p,
                Some(Prior {
                    sd: p.signal_desc(),
                    serial: p.peer_type(),
                    owner: p.owner(),
                    flags: p.flags(),
                }),
            ),
            None => (self.alloc_port()?, None),
        };

        let reuse = prior.is_some_and(|p| p.sd != 0 && p.serial == serial);
        if reuse {
            debug!("[BIND] port {portno}: reusing signal descriptor {:#x}", port.signal_desc());
        } else {
            let fresh_sd = driver.alloc_signal_desc(self, data).and_then(|sd| {
                driver.init_signal_desc(self, sd).map(|_| sd).map_err(|e| {
                    let _ = driver.free_signal_desc(self, data, sd);
                    e
                })
            });
            match fresh_sd {
                Ok(sd) => port.signal_desc.store(sd, Ordering::Release),
                Err(e) => {
                    if prior.is_none() {
                        self.free_port(port);
                    }
                    return Err(e);
                }
            }
        }

        port.peer_type.store(serial, Ordering::Relaxed);
        port.portno.store(portno, Ordering::Relaxed);
        port.owner.store(current_identity(), Ordering::Release);
        port.set_flags(CAN_ACCEPT | CAN_RECEIVE);
        if prior.is_none() {
            match self.offset_of(port as *const Port) {
                Ok(off) => self.port_slots()[portno as usize].store(off, Ordering::Release),
                Err(e) => {
                    let sd = port.signal_desc.swap(0, Ordering::AcqRel);
                    let _ = driver.free_signal_desc(self, data, sd);
                    self.free_port(port);
                    return Err(e);
                }
            }
        }
        Ok((port, prior))
    }

    /// Undo `bind_locked` after a later step failed. Segment lock held.
    fn unwind_bind(&self, port: &Port, prior: Option<Prior>, driver: &Arc<dyn PeerDriver>, data: u64) {
        let portno = port.portno();
        let sd = port.signal_desc();
        match prior {
            Some(p) => {
                if sd != p.sd {
                    let _ = driver.quit_signal_desc(self, sd);
                    if let Err(e) = driver.free_signal_desc(self, data, sd) {
                        warn!("[BIND] port {portno}: freeing new descriptor failed: {e}");
                    }
                    port.signal_desc.store(p.sd, Ordering::Release);
                }
                port.peer_type.store(p.serial, Ordering::Relaxed);
                port.owner.store(p.owner, Ordering::Release);
                port.set_flags(p.flags);
            }
            None => {
                self.port_slots()[portno as usize].store(0, Ordering::Release);
                self.discard_port(port);
            }
        }
        debug!("[BIND] port {portno}: bind rolled back");
    }

    /// Quit and free a descriptor through the driver that made it.
    fn drop_signal_desc(&self, portno: PortNo, serial: Serial, sd: u64) {
        match self.peer_type(serial) {
            Some(d) => {
                let _ = d.quit_signal_desc(self, sd);
                if let Err(e) = d.free_signal_desc(self, self.peer_type_data(serial), sd) {
                    warn!("[PORT] port {portno}: freeing descriptor failed: {e}");
                }
            }
            None => warn!("[PORT] port {portno}: driver {serial} gone, descriptor leaked"),
        }
    }

    /// Release everything a port holds once it is out of its slot: free
    /// requests, signal descriptor, queues and the port object.
    fn discard_port(&self, port: &Port) {
        let portno = port.portno();
        {
            let _fq = port.fq_lock.lock();
            match self.queue_at(port.free_queue.load(Ordering::Acquire)) {
                Ok(fq) => {
                    let held = unsafe { fq.assume_held() };
                    while let Some(off) = held.pop_head() {
                        match self.resolve_ptr::<u8>(off) {
                            Ok(p) => unsafe { self.request_pool().put(p) },
                            Err(e) => warn!("[PORT] port {portno}: bad free request {off:#x}: {e}"),
                        }
                    }
                }
                Err(e) => warn!("[PORT] port {portno}: free queue unreadable: {e}"),
            }
        }
        let sd = port.signal_desc.swap(0, Ordering::AcqRel);
        if sd != 0 {
            self.drop_signal_desc(portno, port.peer_type(), sd);
        }
        port.owner.store(NO_OWNER, Ordering::Release);
        self.free_port(port);
    }

    /// Give up ownership of a port, keeping it (and its descriptor) for reuse.
    #[track_caller]
    pub fn leave_dynport(&self, portno: PortNo) -> Result<()> {
        let port = self
            .get_port(portno)
            .ok_or_else(|| Error::not_found(format!("port {portno}")))?;
        if let Err(e) = self.quit_local_signal(portno) {
            warn!("[LEAVE] port {portno}: local signal quit failed: {e}");
        }
        let _g = self.shared().segment_lock.lock();
        port.set_flags(0);
        port.owner.store(NO_OWNER, Ordering::Release);
        debug!("[LEAVE] port {portno}");
        Ok(())
    }

    /// Destroy a port whose request and reply queues are empty.
    #[track_caller]
    pub fn unbind_port(&self, portno: PortNo) -> Result<()> {
        let port = self
            .get_port(portno)
            .ok_or_else(|| Error::not_found(format!("port {portno}")))?;
        let _g = self.shared().segment_lock.lock();
        {
            let _rq = port.rq_lock.lock();
            let _pq = port.pq_lock.lock();
            let rq = self.queue_at(port.request_queue.load(Ordering::Acquire))?;
            let pq = self.queue_at(port.reply_queue.load(Ordering::Acquire))?;
            if !rq.is_empty() || !pq.is_empty() {
                return Err(Error::invalid(format!("port {portno} still has queued requests")));
            }
            port.set_flags(0);
        }
        if let Err(e) = self.quit_local_signal(portno) {
            warn!("[UNBIND] port {portno}: local signal quit failed: {e}");
        }
        self.port_slots()[portno as usize].store(0, Ordering::Release);
        self.discard_port(port);
        info!("[UNBIND] port {portno}");
        Ok(())
    }

    // ───────────────────────── routing tables ────────────────────────── //

    /// Route requests leaving `portno` through `next` (`NO_PORT` clears).
    pub fn set_next_hop(&self, portno: PortNo, next: PortNo) -> Result<()> {
        if !self.validate_port(portno) || (next != NO_PORT && !self.validate_port(next)) {
            return Err(Error::invalid(format!("next hop {portno} -> {next} out of range")));
        }
        self.path_next()[portno as usize].store(next, Ordering::Release);
        Ok(())
    }

    pub fn next_hop(&self, portno: PortNo) -> Option<PortNo> {
        let next = self.path_next().get(portno as usize)?.load(Ordering::Acquire);
        (next != NO_PORT).then_some(next)
    }

    /// Destination used by `get_request` when called with `NO_PORT`.
    pub fn set_default_destination(&self, portno: PortNo, dst: PortNo) -> Result<()> {
        if !self.validate_port(portno) || (dst != NO_PORT && !self.validate_port(dst)) {
            return Err(Error::invalid(format!("default destination {portno} -> {dst} out of range")));
        }
        self.dst_gw()[portno as usize].store(dst, Ordering::Release);
        Ok(())
    }

    pub fn default_destination(&self, portno: PortNo) -> Option<PortNo> {
        let dst = self.dst_gw().get(portno as usize)?.load(Ordering::Acquire);
        (dst != NO_PORT).then_some(dst)
    }

    // ───────────────────────── request limits ────────────────────────── //

    /// Cap the requests `portno` may hold from the global pool.
    pub fn set_max_requests(&self, portno: PortNo, max: u64) -> Result<u64> {
        let port = self
            .get_port(portno)
            .ok_or_else(|| Error::not_found(format!("port {portno}")))?;
        let _g = port.port_lock.lock();
        port.max_alloc_reqs.store(max, Ordering::Relaxed);
        Ok(max)
    }

    pub fn max_requests(&self, portno: PortNo) -> Option<u64> {
        self.get_port(portno).map(Port::max_alloc_reqs)
    }

    pub fn allocated_requests(&self, portno: PortNo) -> Option<u64> {
        self.get_port(portno).map(Port::alloc_reqs)
    }

    /// Replace the free queue with one of at least `slots` entries, keeping
    /// its contents in order. Returns the new capacity.
    #[track_caller]
    pub fn set_freequeue_size(&self, portno: PortNo, slots: u64) -> Result<u64> {
        let port = self
            .get_port(portno)
            .ok_or_else(|| Error::not_found(format!("port {portno}")))?;
        let new_off = self.alloc_queue(slots)?;
        let new = self.queue_at(new_off)?;
        let _g = port.fq_lock.lock();
        let old_off = port.free_queue.load(Ordering::Acquire);
        let old = self.queue_at(old_off)?;
        let moved = unsafe { old.assume_held().transplant_into(&new.assume_held()) };
        if moved.is_none() {
            self.free_queue_block(new_off);
            return Err(Error::exhausted(format!(
                "{} free requests do not fit in {} slots",
                old.count(),
                new.capacity()
            )));
        }
        port.free_queue.store(new_off, Ordering::Release);
        self.free_queue_block(old_off);
        Ok(new.capacity())
    }
}

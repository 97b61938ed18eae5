//! Request allocation, buffers and per-process side data.

use crate::errors::{Error, Result};
use crate::segment::Segment;
use crate::spinlock::ShmLock;
use crate::types::*;
use log::{debug, trace, warn};
use metrics::counter;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

impl Segment {
    fn port_or_err(&self, portno: PortNo) -> Result<&Port> {
        self.get_port(portno)
            .ok_or_else(|| Error::invalid(format!("port {portno} is not bound")))
    }

    /// Move up to `nr` pool objects onto `portno`'s free queue. Returns how
    /// many were moved; zero is an error.
    pub fn alloc_requests(&self, portno: PortNo, nr: u64) -> Result<u64> {
        let port = self.port_or_err(portno)?;
        let pool = self.request_pool();
        let mut moved = 0;
        {
            let _g = port.fq_lock.lock();
            let fq = unsafe { self.queue_at(port.free_queue.load(Ordering::Acquire))?.assume_held() };
            while moved < nr && fq.count() < fq.capacity() {
                let Some(obj) = pool.get(true) else { break };
                let off = self.offset_of(obj.as_ptr() as *const u8)?;
                if fq.append_tail(off).is_none() {
                    unsafe { pool.put(obj) };
                    break;
                }
                moved += 1;
            }
        }
        if moved == 0 {
            return Err(Error::exhausted(format!("no requests could be added to port {portno}")));
        }
        let _g = port.port_lock.lock();
        port.alloc_reqs.fetch_add(moved, Ordering::Relaxed);
        Ok(moved)
    }

    /// Return up to `nr` requests from `portno`'s free queue to the pool.
    pub fn free_requests(&self, portno: PortNo, nr: u64) -> Result<u64> {
        let port = self.port_or_err(portno)?;
        let pool = self.request_pool();
        let mut freed = 0;
        {
            let _g = port.fq_lock.lock();
            let fq = unsafe { self.queue_at(port.free_queue.load(Ordering::Acquire))?.assume_held() };
            while freed < nr {
                let Some(off) = fq.pop_head() else { break };
                unsafe { pool.put(self.resolve_ptr::<u8>(off)?) };
                freed += 1;
            }
        }
        if freed == 0 {
            return Err(Error::not_found(format!("port {portno} has no free requests")));
        }
        let _g = port.port_lock.lock();
        let _ = port
            .alloc_reqs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(freed)));
        Ok(freed)
    }

    /// A fresh request from `src` toward `dst`.
    ///
    /// Taken from the port's free queue first. Otherwise, unless `X_LOCAL` is
    /// set, from the global pool while the port is under its cap; `X_ALLOC`
    /// lets the pool grow. `NO_PORT` as `dst` means the port's default
    /// destination.
    pub fn get_request(&self, src: PortNo, dst: PortNo, flags: u32) -> Result<&Request> {
        let port = self.port_or_err(src)?;

        let from_queue = {
            let _g = port.fq_lock.lock();
            let fq = self.queue_at(port.free_queue.load(Ordering::Acquire))?;
            unsafe { fq.assume_held() }.pop_head()
        };
        let req = match from_queue {
            Some(off) => self.resolve::<Request>(off)?,
            None if flags & X_LOCAL != 0 => {
                return Err(Error::exhausted(format!("port {src} has no local requests")))
            }
            None => {
                let _g = port.port_lock.lock();
                if port.alloc_reqs() >= port.max_alloc_reqs() {
                    return Err(Error::exhausted(format!(
                        "port {src} holds {} of {} requests",
                        port.alloc_reqs(),
                        port.max_alloc_reqs()
                    )));
                }
                let obj = self
                    .request_pool()
                    .get(flags & X_ALLOC != 0)
                    .ok_or_else(|| Error::exhausted("request pool is empty"))?;
                port.alloc_reqs.fetch_add(1, Ordering::Relaxed);
                unsafe { &*(obj.as_ptr() as *const Request) }
            }
        };

        let dst = if dst == NO_PORT { self.default_destination(src).unwrap_or(NO_PORT) } else { dst };
        req.reset();
        req.set_src_portno(src);
        if dst != NO_PORT && !self.validate_port(dst) {
            let _ = self.put_request(req);
            return Err(Error::invalid(format!("destination {dst} out of range")));
        }
        req.set_transit_portno(src);
        req.set_dst_portno(dst);
        req.set_effective_dst_portno(dst);
        req.touch();
        counter!("shmroute_request_allocs_total").increment(1);
        trace!("[REQ] {src} -> {dst} at {:#x}", self.request_offset(req)?);
        Ok(req)
    }

    /// Release `req`'s buffer and hand it back to the port that allocated it,
    /// or to the pool if that port's free queue is full or the port is gone.
    pub fn put_request(&self, req: &Request) -> Result<()> {
        let off = self.request_offset(req)?;
        let owner = req.src_portno();

        if let Some(buf) = req.buffer_ptr() {
            if let Err(e) = self.free_buffer(buf) {
                warn!("[REQ] {off:#x}: buffer release failed: {e}");
            }
        }
        if req.timestamp.load(Ordering::Relaxed) != 0 {
            req.touch();
        }
        let elapsed = req.elapsed();
        if elapsed != 0 {
            self.record_latency(elapsed);
        }
        self.req_data.remove(&off);
        req.reset();

        let Some(port) = self.get_port(owner) else {
            debug!("[REQ] {off:#x}: owner {owner} is gone, releasing to the pool");
            unsafe { self.request_pool().put(NonNull::from(req).cast()) };
            return Ok(());
        };
        let queued = {
            let _g = port.fq_lock.lock();
            let fq = self.queue_at(port.free_queue.load(Ordering::Acquire))?;
            unsafe { fq.assume_held() }.append_head(off)
        };
        if queued.is_some() {
            return Ok(());
        }
        unsafe { self.request_pool().put(NonNull::from(req).cast()) };
        let _g = port.port_lock.lock();
        let _ = port
            .alloc_reqs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        Ok(())
    }

    /// Give `req` a buffer of `targetlen + datalen` bytes: data at the start,
    /// target at the end. Any previous buffer is released.
    pub fn prep_request(&self, req: &Request, targetlen: u64, datalen: u64) -> Result<()> {
        if let Some(old) = req.buffer_ptr() {
            self.free_buffer(old)?;
        }
        req.buffer.set(std::ptr::null());
        req.bufferlen.store(0, Ordering::Relaxed);

        let want = targetlen
            .checked_add(datalen)
            .ok_or_else(|| Error::invalid("request buffer size overflows"))?;
        let buf = self
            .alloc_buffer(want)
            .ok_or_else(|| Error::exhausted(format!("no heap space for a {want}-byte buffer")))?;
        let len = self.buffer_size(buf)?;
        req.buffer.set(buf.as_ptr());
        req.bufferlen.store(len, Ordering::Relaxed);
        self.carve(req, targetlen, datalen);
        Ok(())
    }

    /// Re-carve the buffer if it is big enough, otherwise replace it.
    pub fn resize_request(&self, req: &Request, targetlen: u64, datalen: u64) -> Result<()> {
        match targetlen.checked_add(datalen) {
            Some(n) if req.buffer_ptr().is_some() && req.bufferlen() >= n => {
                self.carve(req, targetlen, datalen);
                Ok(())
            }
            _ => self.prep_request(req, targetlen, datalen),
        }
    }

    fn carve(&self, req: &Request, targetlen: u64, datalen: u64) {
        let buf = req.buffer.get();
        let len = req.bufferlen();
        req.data.set(buf);
        req.target.set(unsafe { buf.add((len - targetlen) as usize) });
        req.datalen.store(datalen, Ordering::Relaxed);
        req.targetlen.store(targetlen, Ordering::Relaxed);
    }

    pub fn request_offset(&self, req: &Request) -> Result<u64> {
        self.offset_of(req as *const Request)
    }

    /// The request object at `offset`, which must belong to the request pool.
    pub fn request_at(&self, offset: u64) -> Result<&Request> {
        let req = self.resolve::<Request>(offset)?;
        if !self.request_pool().contains(req as *const Request as *const u8) {
            return Err(Error::invalid(format!("{offset:#x} is not a request")));
        }
        Ok(req)
    }

    // ───────────────────────── side data ─────────────────────────────── //

    /// Attach a per-process value to `req`; replaces any earlier one.
    pub fn set_req_data(&self, req: &Request, data: usize) -> Result<()> {
        self.req_data.insert(self.request_offset(req)?, data);
        Ok(())
    }

    pub fn get_req_data(&self, req: &Request) -> Option<usize> {
        let off = self.request_offset(req).ok()?;
        self.req_data.get(&off).map(|v| *v)
    }

    pub fn take_req_data(&self, req: &Request) -> Option<usize> {
        let off = self.request_offset(req).ok()?;
        self.req_data.remove(&off).map(|(_, v)| v)
    }
}

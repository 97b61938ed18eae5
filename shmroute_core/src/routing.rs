//! Store-and-forward routing between ports.
//!
//! A request travels as its segment offset. Every hop it passes through is
//! pushed onto the request's own path stack on submit and popped on the way
//! back, so `respond` needs no routing table. Failures are logged and reported
//! as `None`; queue-full is ordinary backpressure.

use crate::index_queue::IndexQueue;
use crate::segment::Segment;
use crate::spinlock::{ShmLock, SpinLock};
use crate::types::*;
use log::{debug, trace, warn};
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

impl Segment {
    /// Append `off` to the queue stored in `slot`, which `lock` guards. With
    /// `X_ALLOC` a full queue is replaced by one twice its size first.
    fn enqueue(&self, lock: &SpinLock, slot: &AtomicU64, off: u64, flags: u32) -> bool {
        let _g = lock.lock();
        let Ok(q) = self.queue_at(slot.load(Ordering::Acquire)) else {
            warn!("[ROUTE] queue reference {:#x} is invalid", slot.load(Ordering::Relaxed));
            return false;
        };
        let held = unsafe { q.assume_held() };
        if held.append_tail(off).is_some() {
            return true;
        }
        if flags & X_ALLOC == 0 {
            trace!("[ROUTE] queue full ({} slots)", q.capacity());
            return false;
        }
        self.grow_locked(slot, q).is_some_and(|new| unsafe { new.assume_held() }.append_tail(off).is_some())
    }

    fn grow_locked(&self, slot: &AtomicU64, old: &IndexQueue) -> Option<&IndexQueue> {
        let want = old.capacity() * 2;
        let new_off = match self.alloc_queue(want) {
            Ok(o) => o,
            Err(e) => {
                debug!("[ROUTE] cannot grow queue to {want}: {e}");
                return None;
            }
        };
        let new = self.queue_at(new_off).ok()?;
        let moved = unsafe { old.assume_held().transplant_into(&new.assume_held()) };
        if moved.is_none() {
            self.free_queue_block(new_off);
            return None;
        }
        let old_off = slot.swap(new_off, Ordering::AcqRel);
        self.free_queue_block(old_off);
        counter!("shmroute_queue_grow_total").increment(1);
        debug!("[ROUTE] queue grown to {} slots", new.capacity());
        Some(new)
    }

    /// Send `req` one hop toward its effective destination.
    ///
    /// The walk starts at the transit port and follows the next-hop table,
    /// falling back to the destination itself, until it finds a port that
    /// accepts. Returns the port the request was queued on.
    pub fn submit(&self, req: &Request, flags: u32) -> Option<PortNo> {
        let cur = req.transit_portno();
        let dst = req.effective_dst_portno();
        if !self.validate_port(cur) || !self.validate_port(dst) {
            warn!("[SUBMIT] invalid transit {cur} or destination {dst}");
            return None;
        }

        let mut next = cur;
        let mut hops = 0;
        let port = loop {
            if next == dst {
                warn!("[SUBMIT] path from {cur} ended with no one willing to accept");
                return None;
            }
            hops += 1;
            if hops > self.nr_ports() {
                warn!("[SUBMIT] next-hop cycle from {cur} toward {dst}");
                return None;
            }
            next = self.next_hop(next).unwrap_or(dst);
            let Some(port) = self.get_port(next) else {
                warn!("[SUBMIT] hop {next} is not bound");
                return None;
            };
            if port.can_accept() {
                break port;
            }
            trace!("[SUBMIT] port {next} does not accept, moving on");
        };

        let Ok(off) = self.request_offset(req) else {
            warn!("[SUBMIT] request is outside this segment");
            return None;
        };
        let path = unsafe { req.path.assume_held() };
        if path.append_head(u64::from(cur)).is_none() {
            warn!("[SUBMIT] path stack full at {cur}");
            return None;
        }
        if !self.enqueue(&port.rq_lock, &port.request_queue, off, flags) {
            path.pop_head();
            debug!("[SUBMIT] request queue of {next} is full");
            return None;
        }
        req.touch();
        counter!("shmroute_submits_total").increment(1);
        trace!("[SUBMIT] {off:#x}: {cur} -> {next} (dst {dst})");
        Some(next)
    }

    /// Pop the next request queued on `portno`; it now transits there.
    pub fn accept(&self, portno: PortNo, flags: u32) -> Option<&Request> {
        let port = self.get_port(portno)?;
        let off = {
            let _g = if flags & X_NONBLOCK != 0 { port.rq_lock.try_lock()? } else { port.rq_lock.lock() };
            let q = self.queue_at(port.request_queue.load(Ordering::Acquire)).ok()?;
            unsafe { q.assume_held() }.pop_head()?
        };
        let req = match self.resolve::<Request>(off) {
            Ok(r) => r,
            Err(e) => {
                warn!("[ACCEPT] port {portno}: {e}");
                return None;
            }
        };
        req.set_transit_portno(portno);
        req.touch();
        counter!("shmroute_accepts_total").increment(1);
        Some(req)
    }

    /// Send `req` back to the nearest port on its path that still receives.
    pub fn respond(&self, req: &Request, flags: u32) -> Option<PortNo> {
        let Ok(off) = self.request_offset(req) else {
            warn!("[RESPOND] request is outside this segment");
            return None;
        };
        let path = unsafe { req.path.assume_held() };
        let (dst, port) = loop {
            let Some(hop) = path.peek_head() else {
                debug!("[RESPOND] {off:#x}: path exhausted");
                return None;
            };
            let dst = hop as PortNo;
            let Some(port) = self.get_port(dst) else {
                warn!("[RESPOND] {off:#x}: hop {dst} is not bound");
                return None;
            };
            if port.can_receive() {
                break (dst, port);
            }
            trace!("[RESPOND] port {dst} cannot receive, skipping");
            path.pop_head();
        };
        if !self.enqueue(&port.pq_lock, &port.reply_queue, off, flags) {
            debug!("[RESPOND] reply queue of {dst} is full");
            return None;
        }
        req.touch();
        counter!("shmroute_responds_total").increment(1);
        Some(dst)
    }

    /// Point `req` at `new_dst` and submit it from where it is now.
    pub fn forward(&self, req: &Request, new_dst: PortNo, flags: u32) -> Option<PortNo> {
        if !self.validate_port(new_dst) {
            warn!("[FORWARD] invalid destination {new_dst}");
            return None;
        }
        req.set_effective_dst_portno(new_dst);
        self.submit(req, flags)
    }

    /// Pop the next reply queued on `portno` and unwind one path entry.
    pub fn receive(&self, portno: PortNo, flags: u32) -> Option<&Request> {
        let port = self.get_port(portno)?;
        let off = {
            let _g = if flags & X_NONBLOCK != 0 { port.pq_lock.try_lock()? } else { port.pq_lock.lock() };
            let q = self.queue_at(port.reply_queue.load(Ordering::Acquire)).ok()?;
            unsafe { q.assume_held() }.pop_head()?
        };
        let req = match self.resolve::<Request>(off) {
            Ok(r) => r,
            Err(e) => {
                warn!("[RECEIVE] port {portno}: {e}");
                return None;
            }
        };
        if unsafe { req.path.assume_held() }.pop_head().is_none() {
            warn!("[RECEIVE] {off:#x} reached {portno} with an empty path");
        }
        req.touch();
        counter!("shmroute_receives_total").increment(1);
        Some(req)
    }

    /// `accept`, parking on the port's signal for up to `timeout`.
    pub fn accept_timeout(&self, portno: PortNo, flags: u32, timeout: Duration) -> Option<&Request> {
        self.park(portno, timeout, "[ACCEPT]", |s| s.accept(portno, flags))
    }

    /// `receive`, parking on the port's signal for up to `timeout`.
    pub fn receive_timeout(&self, portno: PortNo, flags: u32, timeout: Duration) -> Option<&Request> {
        self.park(portno, timeout, "[RECEIVE]", |s| s.receive(portno, flags))
    }

    fn park<'a>(
        &'a self,
        portno: PortNo,
        timeout: Duration,
        tag: &str,
        op: impl Fn(&'a Self) -> Option<&'a Request>,
    ) -> Option<&'a Request> {
        if let Some(r) = op(self) {
            return Some(r);
        }
        if let Err(e) = self.prepare_wait(portno) {
            warn!("{tag} port {portno}: cannot wait: {e}");
            return None;
        }
        // a signal sent before prepare_wait is lost, so look once more
        if let Some(r) = op(self) {
            let _ = self.cancel_wait(portno);
            return Some(r);
        }
        if let Err(e) = self.wait_signal(portno, timeout) {
            warn!("{tag} port {portno}: wait failed: {e}");
        }
        let _ = self.cancel_wait(portno);
        op(self)
    }
}

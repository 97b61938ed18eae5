//! Peer drivers: per-port signaling between processes.
//!
//! A driver owns an opaque signal descriptor for every port bound through
//! it. Descriptors live in segment memory (so any process can signal any
//! port); whatever per-process state a driver needs to act on one stays in
//! the driver.

use crate::constants::{MAGIC_EVENT_SD, MAGIC_SPIN_SD};
use crate::errors::{Error, Result};
use crate::platform::unix::current_identity;
use crate::segment::Segment;
use crate::types::PortNo;
use dashmap::DashMap;
use log::trace;
use raw_sync::events::{Event as RawEvent, EventImpl, EventInit, EventState};
use raw_sync::Timeout;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait PeerDriver: Send + Sync {
    /// Registry key, at most 31 bytes.
    fn name(&self) -> &str;

    /// Called once when the driver is registered.
    fn remote_signal_init(&self) -> Result<()> {
        Ok(())
    }

    fn remote_signal_quit(&self) {}

    /// Attach this process to the signal descriptor of a port it just bound.
    fn local_signal_init(&self, seg: &Segment, portno: PortNo) -> Result<()>;

    fn local_signal_quit(&self, seg: &Segment, portno: PortNo) -> Result<()>;

    /// Per-segment driver data; returns its segment offset.
    fn alloc_data(&self, seg: &Segment) -> Result<u64>;

    fn free_data(&self, seg: &Segment, data: u64) -> Result<()>;

    fn alloc_signal_desc(&self, seg: &Segment, data: u64) -> Result<u64>;

    fn free_signal_desc(&self, seg: &Segment, data: u64, sd: u64) -> Result<()>;

    fn init_signal_desc(&self, seg: &Segment, sd: u64) -> Result<()>;

    fn quit_signal_desc(&self, _seg: &Segment, _sd: u64) -> Result<()> {
        Ok(())
    }

    /// Announce that the caller is about to wait on `portno`.
    fn prepare_wait(&self, seg: &Segment, portno: PortNo) -> Result<()>;

    fn cancel_wait(&self, seg: &Segment, portno: PortNo) -> Result<()>;

    /// Block until signaled or `timeout` elapses. `true` means signaled.
    fn wait_signal(&self, seg: &Segment, sd: u64, timeout: Duration) -> Result<bool>;

    /// Wake a waiter on `portno`, if any.
    fn signal(&self, seg: &Segment, portno: PortNo) -> Result<()>;
}

/// Descriptor prefix common to the built-in drivers.
#[repr(C, align(8))]
struct WaitCue {
    /// Identity of the waiter, or 0.
    waitcue: AtomicU64,
    signaled: AtomicU64,
}

fn signal_desc_of(seg: &Segment, portno: PortNo) -> Result<u64> {
    let port = seg
        .get_port(portno)
        .ok_or_else(|| Error::not_found(format!("port {portno}")))?;
    match port.signal_desc() {
        0 => Err(Error::invalid(format!("port {portno} has no signal descriptor"))),
        sd => Ok(sd),
    }
}

fn alloc_desc(seg: &Segment, data: u64) -> Result<u64> {
    let objh = seg.objh_at(data)?;
    let obj = objh
        .get(true)
        .ok_or_else(|| Error::exhausted("no memory for a signal descriptor"))?;
    seg.offset_of(obj.as_ptr() as *const u8)
}

fn free_desc(seg: &Segment, data: u64, sd: u64) -> Result<()> {
    let objh = seg.objh_at(data)?;
    let obj = seg.resolve_ptr::<u8>(sd)?;
    unsafe { objh.put(obj) };
    Ok(())
}

// ───────────────────────────── posix ───────────────────────────────────── //

const EVENT_BUF: usize = 256;

#[repr(C, align(8))]
struct EventDesc {
    cue: WaitCue,
    event: [u8; EVENT_BUF],
}

struct EventHandle(Box<dyn EventImpl>);

// SAFETY: the event lives in shared memory and is built for cross-process
// use; the handle only holds its address.
unsafe impl Send for EventHandle {}
unsafe impl Sync for EventHandle {}

/// Process-shared condition events, one per port.
#[derive(Default)]
pub struct EventPeer {
    handles: DashMap<usize, Arc<EventHandle>>,
}

impl EventPeer {
    pub fn new() -> Self {
        Self::default()
    }

    fn desc<'a>(&self, seg: &'a Segment, sd: u64) -> Result<&'a EventDesc> {
        seg.resolve::<EventDesc>(sd)
    }

    fn handle(&self, desc: &EventDesc) -> Result<Arc<EventHandle>> {
        let key = desc as *const EventDesc as usize;
        if let Some(h) = self.handles.get(&key) {
            return Ok(Arc::clone(&h));
        }
        let ptr = desc.event.as_ptr() as *mut u8;
        let (ev, _) = unsafe { RawEvent::from_existing(ptr) }
            .map_err(|e| Error::Backend(format!("event attach failed: {e}")))?;
        let h = Arc::new(EventHandle(ev));
        self.handles.insert(key, Arc::clone(&h));
        Ok(h)
    }
}

impl PeerDriver for EventPeer {
    fn name(&self) -> &str {
        "posix"
    }

    fn remote_signal_init(&self) -> Result<()> {
        let need = RawEvent::size_of(None);
        if need > EVENT_BUF {
            return Err(Error::Backend(format!("event needs {need} bytes, descriptor holds {EVENT_BUF}")));
        }
        Ok(())
    }

    fn local_signal_init(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        let sd = signal_desc_of(seg, portno)?;
        self.handle(self.desc(seg, sd)?).map(|_| ())
    }

    fn local_signal_quit(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        let sd = signal_desc_of(seg, portno)?;
        let key = self.desc(seg, sd)? as *const EventDesc as usize;
        self.handles.remove(&key);
        Ok(())
    }

    fn alloc_data(&self, seg: &Segment) -> Result<u64> {
        seg.get_objh(MAGIC_EVENT_SD, size_of::<EventDesc>() as u64)
    }

    fn free_data(&self, seg: &Segment, data: u64) -> Result<()> {
        seg.put_objh(data)
    }

    fn alloc_signal_desc(&self, seg: &Segment, data: u64) -> Result<u64> {
        alloc_desc(seg, data)
    }

    fn free_signal_desc(&self, seg: &Segment, data: u64, sd: u64) -> Result<()> {
        let key = self.desc(seg, sd)? as *const EventDesc as usize;
        self.handles.remove(&key);
        free_desc(seg, data, sd)
    }

    fn init_signal_desc(&self, seg: &Segment, sd: u64) -> Result<()> {
        let desc = self.desc(seg, sd)?;
        desc.cue.waitcue.store(0, Ordering::SeqCst);
        desc.cue.signaled.store(0, Ordering::SeqCst);
        let ptr = desc.event.as_ptr() as *mut u8;
        let (ev, _) = unsafe { RawEvent::new(ptr, true) }
            .map_err(|e| Error::Backend(format!("event init failed: {e}")))?;
        let key = desc as *const EventDesc as usize;
        self.handles.insert(key, Arc::new(EventHandle(ev)));
        trace!("[SIGNAL] event descriptor at {sd:#x} initialised");
        Ok(())
    }

    fn quit_signal_desc(&self, seg: &Segment, sd: u64) -> Result<()> {
        let key = self.desc(seg, sd)? as *const EventDesc as usize;
        self.handles.remove(&key);
        Ok(())
    }

    fn prepare_wait(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        let desc = self.desc(seg, signal_desc_of(seg, portno)?)?;
        desc.cue.waitcue.store(current_identity(), Ordering::SeqCst);
        Ok(())
    }

    fn cancel_wait(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        let desc = self.desc(seg, signal_desc_of(seg, portno)?)?;
        desc.cue.waitcue.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn wait_signal(&self, seg: &Segment, sd: u64, timeout: Duration) -> Result<bool> {
        let desc = self.desc(seg, sd)?;
        let h = self.handle(desc)?;
        match h.0.wait(Timeout::Val(timeout)) {
            Ok(()) => Ok(true),
            Err(e) => {
                trace!("[SIGNAL] wait on {sd:#x} ended: {e}");
                Ok(false)
            }
        }
    }

    fn signal(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        let desc = self.desc(seg, signal_desc_of(seg, portno)?)?;
        if desc.cue.waitcue.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        let h = self.handle(desc)?;
        h.0.set(EventState::Signaled)
            .map_err(|e| Error::Backend(format!("event signal failed: {e}")))
    }
}

// ───────────────────────────── spin ────────────────────────────────────── //

/// Busy-waiting driver: the descriptor is a flag polled by the waiter.
#[derive(Default)]
pub struct SpinPeer;

impl SpinPeer {
    const POLL: Duration = Duration::from_micros(50);

    pub fn new() -> Self {
        SpinPeer
    }
}

impl PeerDriver for SpinPeer {
    fn name(&self) -> &str {
        "spin"
    }

    fn local_signal_init(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        signal_desc_of(seg, portno).map(|_| ())
    }

    fn local_signal_quit(&self, _seg: &Segment, _portno: PortNo) -> Result<()> {
        Ok(())
    }

    fn alloc_data(&self, seg: &Segment) -> Result<u64> {
        seg.get_objh(MAGIC_SPIN_SD, size_of::<WaitCue>() as u64)
    }

    fn free_data(&self, seg: &Segment, data: u64) -> Result<()> {
        seg.put_objh(data)
    }

    fn alloc_signal_desc(&self, seg: &Segment, data: u64) -> Result<u64> {
        alloc_desc(seg, data)
    }

    fn free_signal_desc(&self, seg: &Segment, data: u64, sd: u64) -> Result<()> {
        free_desc(seg, data, sd)
    }

    fn init_signal_desc(&self, seg: &Segment, sd: u64) -> Result<()> {
        let cue = seg.resolve::<WaitCue>(sd)?;
        cue.waitcue.store(0, Ordering::SeqCst);
        cue.signaled.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn prepare_wait(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        let cue = seg.resolve::<WaitCue>(signal_desc_of(seg, portno)?)?;
        cue.waitcue.store(current_identity(), Ordering::SeqCst);
        Ok(())
    }

    fn cancel_wait(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        let cue = seg.resolve::<WaitCue>(signal_desc_of(seg, portno)?)?;
        cue.waitcue.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn wait_signal(&self, seg: &Segment, sd: u64, timeout: Duration) -> Result<bool> {
        let cue = seg.resolve::<WaitCue>(sd)?;
        let deadline = Instant::now() + timeout;
        loop {
            if cue.signaled.swap(0, Ordering::SeqCst) != 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Self::POLL);
        }
    }

    fn signal(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        let cue = seg.resolve::<WaitCue>(signal_desc_of(seg, portno)?)?;
        if cue.waitcue.load(Ordering::SeqCst) != 0 {
            cue.signaled.store(1, Ordering::SeqCst);
        } else {
            trace!("[SIGNAL] port {portno} has no waiter");
        }
        Ok(())
    }
}

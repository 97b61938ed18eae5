#![allow(dead_code)]

use shmroute_core::{Registry, Segment, SegmentConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static SEQ: AtomicUsize = AtomicUsize::new(0);

/// Unique segment name for this test process.
pub fn unique_name(tag: &str) -> String {
    format!("{tag}_{}_{}", std::process::id(), SEQ.fetch_add(1, Ordering::Relaxed))
}

/// A created and joined `local` segment, destroyed on drop.
pub struct Fixture {
    pub reg: Arc<Registry>,
    pub seg: Segment,
    pub name: String,
}

impl Fixture {
    pub fn new(tag: &str, dynports: u32, nr_ports: u32, heap_mb: u64) -> Self {
        Self::with_peer(tag, dynports, nr_ports, heap_mb, "spin")
    }

    pub fn with_peer(tag: &str, dynports: u32, nr_ports: u32, heap_mb: u64, peer: &str) -> Self {
        let reg = Arc::new(Registry::with_builtins().unwrap());
        let name = unique_name(tag);
        let cfg: SegmentConfig = format!("local:{name}:{dynports}:{nr_ports}:{heap_mb}:12")
            .parse()
            .unwrap();
        Segment::create(&reg, &cfg).unwrap();
        let seg = Segment::join(&reg, "local", &name, peer).unwrap();
        Fixture { reg, seg, name }
    }

    /// Another join of the same segment.
    pub fn join(&self, peer: &str) -> Segment {
        Segment::join(&self.reg, "local", &self.name, peer).unwrap()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = Segment::destroy(&self.reg, "local", &self.name);
    }
}

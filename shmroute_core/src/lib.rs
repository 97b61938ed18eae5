//! Shared-memory request routing between processes.
//!
//! A segment is one named memory region holding a slab heap, object pools and
//! a table of ports. Peers join it, bind ports, and pass requests to each
//! other by segment offset through bounded index queues.

pub mod backend;
pub mod binheap;
pub mod config;
pub mod constants;
pub mod errors;
pub mod handle_registry;
pub mod heap;
pub mod helpers;
pub mod index_queue;
pub mod object_pool;
pub mod peer;
pub mod platform;
mod port;
pub mod public_api;
pub mod registry;
pub mod reladdr;
mod request;
mod routing;
pub mod segment;
pub mod shared_table;
pub mod spinlock;
pub mod telemetry;
pub mod types;

pub use backend::{LocalBackend, PosixBackend, SegmentBackend};
pub use binheap::{BinaryHeap, Handle, HeapOrder};
pub use config::SegmentConfig;
pub use errors::{Error, ErrorCode, Result};
pub use peer::{EventPeer, PeerDriver, SpinPeer};
pub use registry::{PluginLoader, Registry};
pub use segment::Segment;
pub use types::{
    Port, PortNo, Request, Serial, CAN_ACCEPT, CAN_RECEIVE, NO_PORT, X_ALLOC, X_LOCAL, X_NONBLOCK,
};

use once_cell::sync::OnceCell;

// Install metrics recorder when the crate is loaded
#[doc(hidden)]
#[inline(always)]
fn _telemetry_bootstrap() {
    telemetry::init();
}

// NB: reference forces the function to run during `.so` load
#[used]
static _BOOTSTRAP: fn() = _telemetry_bootstrap;

// ---- logging bootstraper -----------------------------------------------------
pub(crate) fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}

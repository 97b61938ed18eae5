//! Layout constants shared by every process mapping a segment.

/// OS object name prefix for segments created through the posix backend.
pub const PREFIX: &str = "shmroute_";

pub const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
pub const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub const CACHE_LINE: usize = 64;

/// Identifies a valid segment header ("SHMROUTE" in ASCII).
pub const SEGMENT_MAGIC: u64 = 0x5348_4d52_4f55_5445;
/// Bumped whenever the in-segment layout changes. Joiners require an exact match.
pub const SEGMENT_VERSION: u64 = 2014_0001;

/// Heap chunk header tag.
pub const CHUNK_MAGIC: u64 = 0xdead_beaf;

pub const MAGIC_OBJH: u32 = 0xcafe_0001;
pub const MAGIC_REQ: u32 = 0xcafe_0002;
pub const MAGIC_PORT: u32 = 0xcafe_0003;
pub const MAGIC_EVENT_SD: u32 = 0xcafe_0004;
pub const MAGIC_SPIN_SD: u32 = 0xcafe_0005;

/// Capacity of backend and peer type names, NUL included.
pub const TYPE_NAME_LEN: usize = 32;
/// Capacity of a segment name, NUL included.
pub const SEGMENT_NAME_LEN: usize = 256;

/// Process-local registry limits.
pub const MAX_BACKEND_TYPES: usize = 16;
pub const MAX_PEER_TYPES: usize = 64;

/// Smallest mapping granularity a backend must support; also the header probe size on join.
pub const MIN_PAGE_SIZE: u64 = 4096;
pub const MIN_PAGE_SHIFT: u32 = 9;

/// Objects carved from the heap per pool refill.
pub const OBJ_BATCH: u64 = 64;

/// Depth of the per-request path stack.
pub const MAX_PATH_LEN: usize = 32;
/// Default cap on requests a port may hold from the global pool.
pub const DEF_MAX_ALLOCATED_REQS: u64 = 1024;
/// Slots of a freshly bound port's free, request and reply queues.
pub const DEF_PORT_QUEUE_SLOTS: u64 = 64;

/// Spec-string defaults: `posix:shmroute_global:64:128:256:12`.
pub const DEFAULT_BACKEND: &str = "posix";
pub const DEFAULT_SEGMENT_NAME: &str = "shmroute_global";
pub const DEFAULT_DYNPORTS: u32 = 64;
pub const DEFAULT_NR_PORTS: u32 = 128;
pub const DEFAULT_HEAP_MB: u64 = 256;
pub const DEFAULT_PAGE_SHIFT: u32 = 12;

/// Environment variable consulted by `SegmentConfig::from_env`.
pub const SEGMENT_ENV: &str = "SHMROUTE_SEGMENT";

//! Error handling and C-ABI error codes for shmroute

use std::cell::RefCell;
use std::os::raw::c_char;
use thiserror::Error as ThisError;

/// Failure taxonomy of the fabric.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Null or out-of-range segment, port or request reference.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Segment version disagreement on join.
    #[error("protocol mismatch: expected version {expected}, found {found}")]
    ProtocolMismatch { expected: u64, found: u64 },

    /// Heap, pool or queue full. Retryable.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unknown backend, peer type or port.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad chunk magic, out-of-bounds translated pointer, invalid lock owner.
    #[error("corruption: {0}")]
    Corruption(String),

    #[error("lock error: {0}")]
    Lock(String),

    /// Failure reported by a segment backend or peer driver.
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Error::ResourceExhausted(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Queue-full and allocation failures; callers may retry or reroute.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Backend(s)
    }
}

impl From<shared_memory::ShmemError> for Error {
    fn from(e: shared_memory::ShmemError) -> Self {
        Error::Backend(format!("shared memory: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidArgument = 1,
    ProtocolMismatch = 2,
    ResourceExhausted = 3,
    NotFound = 4,
    Corruption = 5,
    LockFailed = 6,
    BackendFailed = 7,
    InvalidHandle = 8,
    Utf8Error = 9,
    NoPort = 10,
    Unknown = 255,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::InvalidArgument => "Invalid argument",
            ErrorCode::ProtocolMismatch => "Protocol version mismatch",
            ErrorCode::ResourceExhausted => "Resource exhausted",
            ErrorCode::NotFound => "Not found",
            ErrorCode::Corruption => "Segment corruption detected",
            ErrorCode::LockFailed => "Lock failure",
            ErrorCode::BackendFailed => "Backend failure",
            ErrorCode::InvalidHandle => "Invalid handle",
            ErrorCode::Utf8Error => "UTF-8 conversion error",
            ErrorCode::NoPort => "No port",
            ErrorCode::Unknown => "Unknown error",
        }
    }

    fn as_c_str(self) -> &'static [u8] {
        match self {
            ErrorCode::Success => b"Success\0",
            ErrorCode::InvalidArgument => b"Invalid argument\0",
            ErrorCode::ProtocolMismatch => b"Protocol version mismatch\0",
            ErrorCode::ResourceExhausted => b"Resource exhausted\0",
            ErrorCode::NotFound => b"Not found\0",
            ErrorCode::Corruption => b"Segment corruption detected\0",
            ErrorCode::LockFailed => b"Lock failure\0",
            ErrorCode::BackendFailed => b"Backend failure\0",
            ErrorCode::InvalidHandle => b"Invalid handle\0",
            ErrorCode::Utf8Error => b"UTF-8 conversion error\0",
            ErrorCode::NoPort => b"No port\0",
            ErrorCode::Unknown => b"Unknown error\0",
        }
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

#[no_mangle]
pub extern "C" fn shmroute_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn shmroute_strerror(code: ErrorCode) -> *const c_char {
    code.as_c_str().as_ptr() as *const c_char
}

// Map internal Error to ErrorCode
pub fn map_error(e: &Error) -> ErrorCode {
    match e {
        Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
        Error::ProtocolMismatch { .. } => ErrorCode::ProtocolMismatch,
        Error::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
        Error::NotFound(_) => ErrorCode::NotFound,
        Error::Corruption(_) => ErrorCode::Corruption,
        Error::Lock(_) => ErrorCode::LockFailed,
        Error::Backend(_) => ErrorCode::BackendFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn strerror_matches_as_str() {
        for code in [
            ErrorCode::Success,
            ErrorCode::InvalidArgument,
            ErrorCode::ProtocolMismatch,
            ErrorCode::ResourceExhausted,
            ErrorCode::NotFound,
            ErrorCode::Corruption,
            ErrorCode::NoPort,
            ErrorCode::Unknown,
        ] {
            let s = unsafe { CStr::from_ptr(shmroute_strerror(code)) };
            assert_eq!(s.to_str().unwrap(), code.as_str());
        }
    }

    #[test]
    fn last_error_is_thread_local() {
        set_last_error(ErrorCode::NotFound);
        let other = std::thread::spawn(get_last_error).join().unwrap();
        assert_eq!(other, ErrorCode::Success);
        assert_eq!(get_last_error(), ErrorCode::NotFound);
    }

    #[test]
    fn only_exhaustion_is_retryable() {
        assert!(Error::exhausted("queue full").is_retryable());
        assert!(!Error::corruption("bad magic").is_retryable());
        assert_eq!(
            map_error(&Error::ProtocolMismatch { expected: 1, found: 2 }),
            ErrorCode::ProtocolMismatch
        );
    }
}

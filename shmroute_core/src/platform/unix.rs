//! Unix-specific platform code for shmroute

use log::debug;

/// Remove a POSIX shared-memory object. A missing object is not an error.
#[cfg(unix)]
pub fn platform_drop(os_id: &str) -> Result<(), crate::errors::Error> {
    use std::ffi::CString;
    let c_name = CString::new(os_id)
        .map_err(|_| crate::errors::Error::invalid(format!("os id {os_id:?} contains NUL")))?;
    let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
    if rc != 0 {
        let e = errno::errno();
        if e.0 == libc::ENOENT {
            debug!("[UNLINK] {os_id} already gone");
            return Ok(());
        }
        return Err(crate::errors::Error::Backend(format!("shm_unlink({os_id}) failed: {e}")));
    }
    debug!("[UNLINK] {os_id}");
    Ok(())
}

/// Build the shm_open name for a segment: `/<prefix><hash>`.
pub fn make_os_id(prefix: &str, hash: u64) -> String {
    format!("/{prefix}{hash:016x}")
}

#[inline]
pub fn current_pid() -> u32 {
    std::process::id()
}

#[cfg(target_os = "linux")]
#[inline]
pub fn current_tid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(not(target_os = "linux"))]
#[inline]
pub fn current_tid() -> u32 {
    thread_local! {
        static TID: u32 = {
            use std::hash::{Hash, Hasher};
            let mut h = std::collections::hash_map::DefaultHasher::new();
            std::thread::current().id().hash(&mut h);
            h.finish() as u32
        };
    }
    TID.with(|t| *t)
}

/// Identity recorded as a port owner: pid in the high half, tid in the low half.
#[inline]
pub fn current_identity() -> u64 {
    ((current_pid() as u64) << 32) | current_tid() as u64
}

//! Platform-specific module for shmroute

#[cfg(unix)]
pub mod unix;

//! Segment configuration and the `type:name:dynports:nr_ports:heap_MB:page_shift` spec string.

use crate::constants::*;
use crate::errors::{Error, Result};
use crate::helpers::{align_shift, truncate_name};
use log::debug;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Backend type name (`posix`, `local`, ...).
    pub backend: String,
    pub name: String,
    /// Ports below this number are bound by explicit request only.
    pub dynports: u32,
    pub nr_ports: u32,
    /// Heap size in bytes.
    pub heap_size: u64,
    pub page_shift: u32,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_owned(),
            name: DEFAULT_SEGMENT_NAME.to_owned(),
            dynports: DEFAULT_DYNPORTS,
            nr_ports: DEFAULT_NR_PORTS,
            heap_size: DEFAULT_HEAP_MB << 20,
            page_shift: DEFAULT_PAGE_SHIFT,
        }
    }
}

/// Leading decimal digits, `strtoul` style: no digits yields 0.
fn leading_u64(s: &str) -> u64 {
    let s = s.trim_start();
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    s[..digits].parse().unwrap_or(if digits == 0 { 0 } else { u64::MAX })
}

impl SegmentConfig {
    /// Parse a spec string; fields left out (or empty) keep their defaults.
    pub fn parse_spec(spec: &str) -> Self {
        let mut cfg = SegmentConfig::default();
        let mut fields = spec.split(':');
        let mut next = || fields.next().filter(|f| !f.is_empty());

        if let Some(t) = next() {
            cfg.backend = truncate_name(t, TYPE_NAME_LEN - 1);
        }
        if let Some(n) = next() {
            cfg.name = truncate_name(n, SEGMENT_NAME_LEN - 1);
        }
        if let Some(d) = next() {
            cfg.dynports = leading_u64(d).min(u32::MAX as u64) as u32;
        }
        if let Some(p) = next() {
            cfg.nr_ports = leading_u64(p).min(u32::MAX as u64) as u32;
        }
        if let Some(h) = next() {
            cfg.heap_size = leading_u64(h).saturating_mul(1 << 20);
        }
        if let Some(s) = next() {
            cfg.page_shift = leading_u64(s).min(63) as u32;
        }
        debug!("[CONFIG] {spec:?} -> {cfg}");
        cfg
    }

    /// Spec string from `SHMROUTE_SEGMENT`, else the defaults.
    pub fn from_env() -> Self {
        match std::env::var(SEGMENT_ENV) {
            Ok(spec) => Self::parse_spec(&spec),
            Err(_) => Self::default(),
        }
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        1u64 << self.page_shift
    }

    pub fn validate(&self) -> Result<()> {
        if self.dynports >= self.nr_ports {
            return Err(Error::invalid(format!(
                "dynports ({}) must be below nr_ports ({})",
                self.dynports, self.nr_ports
            )));
        }
        if self.page_shift < MIN_PAGE_SHIFT || self.page_shift > 30 {
            return Err(Error::invalid(format!("page shift {} out of range", self.page_shift)));
        }
        if self.name.is_empty() || self.backend.is_empty() {
            return Err(Error::invalid("empty segment or backend name"));
        }
        Ok(())
    }

    /// Two header pages plus the heap, rounded to a whole page.
    pub fn segment_size(&self) -> Result<u64> {
        if self.page_shift < MIN_PAGE_SHIFT || self.page_shift > 30 {
            return Err(Error::invalid(format!("page shift {} out of range", self.page_shift)));
        }
        let size = self
            .heap_size
            .checked_add(2 * self.page_size())
            .ok_or_else(|| Error::invalid("segment size overflows"))?;
        Ok(align_shift(size, self.page_shift))
    }
}

impl FromStr for SegmentConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let cfg = Self::parse_spec(s);
        cfg.validate()?;
        Ok(cfg)
    }
}

impl fmt::Display for SegmentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            self.backend,
            self.name,
            self.dynports,
            self.nr_ports,
            self.heap_size >> 20,
            self.page_shift
        )
    }
}

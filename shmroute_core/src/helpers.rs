//! Small arithmetic and identity helpers

use std::time::{SystemTime, UNIX_EPOCH};

pub fn fnv1a_64(s: &str) -> u64 {
    use crate::constants::{FNV_OFFSET, FNV_PRIME};
    let mut h = FNV_OFFSET;
    for &b in s.as_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[inline(always)]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Round `x` up to a multiple of `1 << shift`. Zero stays zero.
#[inline(always)]
pub const fn align_shift(x: u64, shift: u32) -> u64 {
    if x == 0 {
        return 0;
    }
    (((x - 1) >> shift) + 1) << shift
}

/// Largest power of two not above `n`; zero for zero.
#[inline]
pub const fn snap_pow2(n: u64) -> u64 {
    if n == 0 {
        0
    } else {
        1u64 << (63 - n.leading_zeros())
    }
}

// Owner word layout: bit 63 clear, pid in 62..41, tid in 40..16, caller site in 15..0.
const PID_SHIFT: u32 = 41;
const PID_BITS: u32 = 22;
const TID_SHIFT: u32 = 16;
const TID_BITS: u32 = 25;

/// Packs a lock owner identity. The result never collides with the
/// no-owner sentinel (`u64::MAX`), whose top bit is set.
#[inline]
pub fn pack_owner(pid: u32, tid: u32, site: u16) -> u64 {
    let pid = (pid as u64) & ((1 << PID_BITS) - 1);
    let tid = (tid as u64) & ((1 << TID_BITS) - 1);
    (pid << PID_SHIFT) | (tid << TID_SHIFT) | site as u64
}

#[inline]
pub fn unpack_owner(owner: u64) -> (u32, u32, u16) {
    (
        ((owner >> PID_SHIFT) & ((1 << PID_BITS) - 1)) as u32,
        ((owner >> TID_SHIFT) & ((1 << TID_BITS) - 1)) as u32,
        owner as u16,
    )
}

/// True for values `pack_owner` can produce with a non-zero pid.
#[inline]
pub fn is_valid_owner(owner: u64) -> bool {
    owner >> 63 == 0 && unpack_owner(owner).0 != 0
}

/// 16-bit digest of a source location, kept in the lock word for diagnostics.
pub fn site_hash(loc: &std::panic::Location<'_>) -> u16 {
    let h = fnv1a_64(loc.file()) ^ (loc.line() as u64).wrapping_mul(crate::constants::FNV_PRIME);
    (h ^ (h >> 16) ^ (h >> 32) ^ (h >> 48)) as u16
}

/// Copy `s` into a fixed NUL-terminated buffer, truncating on overflow.
pub fn write_name(dst: &mut [u8], s: &str) {
    dst.iter_mut().for_each(|b| *b = 0);
    let n = s.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// Read a NUL-terminated name out of a fixed buffer.
pub fn read_name(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

/// Truncate to at most `max` bytes on a char boundary.
pub fn truncate_name(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_shift_rounds_up() {
        assert_eq!(align_shift(1, 12), 4096);
        assert_eq!(align_shift(4096, 12), 4096);
        assert_eq!(align_shift(4097, 12), 8192);
        assert_eq!(align_shift(0, 12), 0);
    }

    #[test]
    fn snap_keeps_powers_of_two() {
        assert_eq!(snap_pow2(0), 0);
        assert_eq!(snap_pow2(1), 1);
        assert_eq!(snap_pow2(64), 64);
        assert_eq!(snap_pow2(100), 64);
        assert_eq!(snap_pow2(u64::MAX), 1 << 63);
    }

    #[test]
    fn owner_pack_roundtrip() {
        let w = pack_owner(4242, 777, 0xbeef);
        assert_eq!(unpack_owner(w), (4242, 777, 0xbeef));
        assert!(is_valid_owner(w));
        assert!(!is_valid_owner(u64::MAX));
        assert!(!is_valid_owner(pack_owner(0, 1, 1)));
    }

    #[test]
    fn names_truncate_with_nul() {
        let mut buf = [0xffu8; 8];
        write_name(&mut buf, "abcdefghij");
        assert_eq!(buf[7], 0);
        assert_eq!(read_name(&buf), "abcdefg");
        assert_eq!(truncate_name("héllo", 2), "h");
    }
}

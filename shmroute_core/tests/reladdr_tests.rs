use proptest::prelude::*;
use shmroute_core::reladdr::{make, take, SegmentView};
use std::ptr::NonNull;

proptest! {
    #[test]
    fn base_relative_round_trip(slot in 0usize..512) {
        let mut buf = vec![0u64; 512];
        let base = buf.as_mut_ptr() as *const u8;
        let p = &buf[slot] as *const u64;
        let off = make(p, base);
        prop_assert_eq!(off, slot as u64 * 8);
        prop_assert_eq!(take::<u64>(off, base) as *const u64, p);
    }

    #[test]
    fn view_resolves_only_whole_aligned_objects(off in 0u64..5000) {
        let mut buf = vec![0u64; 512];
        let base = NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap();
        let view = unsafe { SegmentView::new(base, 4096) };
        let ok = off != 0 && off % 8 == 0 && off + 8 <= 4096;
        prop_assert_eq!(view.resolve::<u64>(off).is_ok(), ok);
        if ok {
            let p = view.resolve::<u64>(off).unwrap();
            prop_assert_eq!(view.offset_of(p.as_ptr() as *const u64).unwrap(), off);
        }
    }
}

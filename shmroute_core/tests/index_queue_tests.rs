use proptest::prelude::*;
use shmroute_core::index_queue::IndexQueue;
use std::collections::VecDeque;

/// A queue header and its slots in one 8-aligned buffer.
struct Block {
    mem: Vec<u64>,
}

impl Block {
    fn new(slots: u64) -> Self {
        let words = IndexQueue::block_size(slots).div_ceil(8) as usize;
        let mut mem = vec![0u64; words];
        unsafe { IndexQueue::init_in_block(mem.as_mut_ptr() as *mut IndexQueue, slots) };
        Block { mem }
    }

    fn q(&self) -> &IndexQueue {
        unsafe { &*(self.mem.as_ptr() as *const IndexQueue) }
    }
}

#[test]
fn fifo_two_appends_one_pop() {
    let b = Block::new(8);
    let q = b.q();
    q.append_tail(10).unwrap();
    q.append_tail(20).unwrap();
    assert_eq!(q.pop_head(), Some(10));
    assert_eq!(q.count(), 1);
    assert_eq!(q.pop_head(), Some(20));
    assert!(q.is_empty());
}

#[test]
fn append_beyond_capacity_fails_exactly_once_full() {
    let b = Block::new(16);
    let q = b.q();
    let cap = q.capacity();
    for i in 0..cap {
        assert_eq!(q.append_tail(i), Some(i), "append {i} of {cap}");
    }
    assert_eq!(q.append_tail(cap), None);
    assert_eq!(q.append_head(cap), None);
    assert_eq!(q.count(), cap);
}

#[test]
fn resize_keeps_order_and_move_splices() {
    let small = Block::new(4);
    let big = Block::new(16);
    for i in 0..4 {
        small.q().append_tail(i).unwrap();
    }
    assert_eq!(IndexQueue::resize(small.q(), big.q()), Some(4));
    assert!(big.q().append_tail(4).is_some());
    let drained: Vec<u64> = std::iter::from_fn(|| big.q().pop_head()).collect();
    assert_eq!(drained, vec![0, 1, 2, 3, 4]);

    let src = Block::new(8);
    let dst = Block::new(8);
    for i in 0..5 {
        src.q().append_head(i).unwrap();
    }
    assert!(IndexQueue::move_head_to_tail(src.q(), dst.q(), 3));
    assert_eq!(src.q().count(), 2);
    assert_eq!(dst.q().count(), 3);
    assert!(!IndexQueue::move_head_to_tail(src.q(), dst.q(), 3));
}

#[derive(Debug, Clone)]
enum Op {
    AppendHead(u64),
    AppendTail(u64),
    PopHead,
    PopTail,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..1000).prop_map(Op::AppendHead),
        (0u64..1000).prop_map(Op::AppendTail),
        Just(Op::PopHead),
        Just(Op::PopTail),
    ]
}

proptest! {
    // head is the back of the deque, tail the front
    #[test]
    fn behaves_like_a_bounded_deque(ops in prop::collection::vec(op(), 1..300)) {
        let b = Block::new(32);
        let q = b.q();
        let cap = q.capacity() as usize;
        let mut model: VecDeque<u64> = VecDeque::new();
        for op in ops {
            match op {
                Op::AppendHead(x) => {
                    let ok = model.len() < cap;
                    prop_assert_eq!(q.append_head(x).is_some(), ok);
                    if ok { model.push_back(x); }
                }
                Op::AppendTail(x) => {
                    let ok = model.len() < cap;
                    prop_assert_eq!(q.append_tail(x).is_some(), ok);
                    if ok { model.push_front(x); }
                }
                Op::PopHead => prop_assert_eq!(q.pop_head(), model.pop_back()),
                Op::PopTail => prop_assert_eq!(q.pop_tail(), model.pop_front()),
            }
            prop_assert_eq!(q.count() as usize, model.len());
            prop_assert_eq!(q.peek_head(), model.back().copied());
            prop_assert_eq!(q.peek_tail(), model.front().copied());
        }
    }
}

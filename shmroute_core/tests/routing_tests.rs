mod common;

use common::Fixture;
use shmroute_core::{Error, CAN_ACCEPT, X_ALLOC, X_LOCAL, X_NONBLOCK};
use std::time::{Duration, Instant};

#[test]
fn direct_delivery_and_reply() {
    let f = Fixture::new("route_direct", 4, 16, 4);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let d = seg.bind_port(Some(1)).unwrap().portno();

    let req = seg.get_request(a, d, X_ALLOC).unwrap();
    assert_eq!((req.src_portno(), req.transit_portno(), req.dst_portno()), (a, a, d));
    seg.prep_request(req, 4, 16).unwrap();
    assert!(req.write_target(b"disk"));
    assert!(req.write_data(b"hello"));
    assert!(!req.write_target(b"too long"));

    assert_eq!(seg.submit(req, 0), Some(d));
    assert_eq!(req.path_len(), 1);

    let got = seg.accept(d, 0).expect("request queued on d");
    assert!(std::ptr::eq(got, req));
    assert_eq!(got.transit_portno(), d);
    assert_eq!(got.read_target(), b"disk");
    assert_eq!(&got.read_data()[..5], b"hello");
    assert!(seg.accept(d, X_NONBLOCK).is_none());

    assert_eq!(seg.respond(got, 0), Some(a));
    let back = seg.receive(a, 0).expect("reply queued on a");
    assert!(std::ptr::eq(back, req));
    assert_eq!(back.path_len(), 0);
    seg.put_request(back).unwrap();
}

#[test]
fn submit_to_self_has_nowhere_to_go() {
    let f = Fixture::new("route_self", 2, 8, 2);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let req = seg.get_request(a, a, X_ALLOC).unwrap();
    assert_eq!(seg.submit(req, 0), None);
    assert_eq!(req.path_len(), 0);
}

#[test]
fn respond_skips_hops_that_cannot_receive() {
    let f = Fixture::new("route_skip", 4, 16, 4);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let b = seg.bind_port(Some(1)).unwrap();
    let d = seg.bind_port(Some(2)).unwrap().portno();
    seg.set_next_hop(a, b.portno()).unwrap();

    let req = seg.get_request(a, d, X_ALLOC).unwrap();
    assert_eq!(seg.submit(req, 0), Some(b.portno()));
    let at_b = seg.accept(b.portno(), 0).unwrap();
    assert_eq!(seg.submit(at_b, 0), Some(d));
    assert_eq!(at_b.path_len(), 2);

    b.set_flags(CAN_ACCEPT);
    let at_d = seg.accept(d, 0).unwrap();
    assert_eq!(seg.respond(at_d, 0), Some(a));
    assert!(seg.receive(b.portno(), X_NONBLOCK).is_none());
    let back = seg.receive(a, 0).unwrap();
    assert_eq!(back.path_len(), 0);
}

#[test]
fn multi_hop_reply_unwinds_in_order() {
    let f = Fixture::new("route_unwind", 4, 16, 4);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let b = seg.bind_port(Some(1)).unwrap().portno();
    let d = seg.bind_port(Some(2)).unwrap().portno();
    seg.set_next_hop(a, b).unwrap();

    let req = seg.get_request(a, d, X_ALLOC).unwrap();
    seg.submit(req, 0).unwrap();
    let r = seg.accept(b, 0).unwrap();
    seg.submit(r, 0).unwrap();
    let r = seg.accept(d, 0).unwrap();

    assert_eq!(seg.respond(r, 0), Some(b));
    let r = seg.receive(b, 0).unwrap();
    assert_eq!(seg.respond(r, 0), Some(a));
    let r = seg.receive(a, 0).unwrap();
    assert_eq!(seg.respond(r, 0), None, "path exhausted");
}

#[test]
fn forward_redirects_from_the_current_hop() {
    let f = Fixture::new("route_fwd", 4, 16, 4);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let b = seg.bind_port(Some(1)).unwrap().portno();
    let e = seg.bind_port(Some(3)).unwrap().portno();

    let req = seg.get_request(a, b, X_ALLOC).unwrap();
    seg.submit(req, 0).unwrap();
    let r = seg.accept(b, 0).unwrap();
    assert_eq!(seg.forward(r, 99, 0), None);
    assert_eq!(seg.forward(r, e, 0), Some(e));
    assert_eq!(r.effective_dst_portno(), e);
    assert_eq!(r.dst_portno(), b);

    let r = seg.accept(e, 0).unwrap();
    assert_eq!(seg.respond(r, 0), Some(b));
}

#[test]
fn next_hop_cycle_is_bounded() {
    let f = Fixture::new("route_cycle", 4, 16, 4);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap();
    let b = seg.bind_port(Some(1)).unwrap();
    let d = seg.bind_port(Some(2)).unwrap().portno();
    seg.set_next_hop(a.portno(), b.portno()).unwrap();
    seg.set_next_hop(b.portno(), a.portno()).unwrap();

    let req = seg.get_request(a.portno(), d, X_ALLOC).unwrap();
    a.set_flags(0);
    b.set_flags(0);
    assert_eq!(seg.submit(req, 0), None);
    assert_eq!(req.path_len(), 0);
}

#[test]
fn full_queue_grows_only_when_allowed() {
    let f = Fixture::new("route_grow", 2, 8, 16);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let d = seg.bind_port(Some(1)).unwrap().portno();
    seg.set_max_requests(a, 100_000).unwrap();

    let mut sent = 0u64;
    let overflow = loop {
        assert!(sent < 10_000, "request queue never filled");
        let req = seg.get_request(a, d, X_ALLOC).unwrap();
        req.set_offset(sent);
        if seg.submit(req, 0).is_none() {
            break req;
        }
        sent += 1;
    };
    assert_eq!(overflow.path_len(), 0, "failed submit leaves the path untouched");
    assert_eq!(seg.submit(overflow, X_ALLOC), Some(d));
    sent += 1;

    for i in 0..sent {
        let r = seg.accept(d, 0).expect("queued request");
        assert_eq!(r.offset(), i);
    }
    assert!(seg.accept(d, 0).is_none());
}

#[test]
fn local_free_queue_and_caps() {
    let f = Fixture::new("route_caps", 2, 8, 4);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let d = seg.bind_port(Some(1)).unwrap().portno();

    assert!(matches!(seg.get_request(a, d, X_LOCAL), Err(Error::ResourceExhausted(_))));
    assert_eq!(seg.alloc_requests(a, 3).unwrap(), 3);
    assert_eq!(seg.allocated_requests(a), Some(3));
    let local = seg.get_request(a, d, X_LOCAL).unwrap();
    seg.put_request(local).unwrap();
    assert_eq!(seg.free_requests(a, 10).unwrap(), 3);
    assert_eq!(seg.allocated_requests(a), Some(0));

    seg.set_max_requests(a, 2).unwrap();
    assert_eq!(seg.max_requests(a), Some(2));
    let r1 = seg.get_request(a, d, X_ALLOC).unwrap();
    let _r2 = seg.get_request(a, d, X_ALLOC).unwrap();
    assert!(matches!(seg.get_request(a, d, X_ALLOC), Err(Error::ResourceExhausted(_))));
    seg.put_request(r1).unwrap();
    assert!(seg.get_request(a, d, 0).is_ok(), "returned request is reused locally");
}

#[test]
fn default_destination_applies_to_no_port() {
    let f = Fixture::new("route_default", 2, 8, 2);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let d = seg.bind_port(Some(1)).unwrap().portno();
    seg.set_default_destination(a, d).unwrap();
    let req = seg.get_request(a, shmroute_core::NO_PORT, X_ALLOC).unwrap();
    assert_eq!(req.effective_dst_portno(), d);
    assert_eq!(seg.submit(req, 0), Some(d));
}

#[test]
fn side_data_and_buffers() {
    let f = Fixture::new("route_data", 2, 8, 2);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let req = seg.get_request(a, 1, X_ALLOC).unwrap();

    assert_eq!(seg.get_req_data(req), None);
    seg.set_req_data(req, 42).unwrap();
    assert_eq!(seg.get_req_data(req), Some(42));
    assert_eq!(seg.take_req_data(req), Some(42));
    assert_eq!(seg.get_req_data(req), None);

    seg.prep_request(req, 8, 100).unwrap();
    let cap = req.bufferlen();
    assert!(cap >= 108);
    seg.resize_request(req, 16, cap - 16).unwrap();
    assert_eq!(req.bufferlen(), cap, "fits in place");
    assert_eq!((req.targetlen(), req.datalen()), (16, cap - 16));
    seg.resize_request(req, 8, cap * 4).unwrap();
    assert!(req.bufferlen() >= cap * 4 + 8);

    let off = seg.request_offset(req).unwrap();
    assert!(std::ptr::eq(seg.request_at(off).unwrap(), req));
    assert!(seg.request_at(off + 8).is_err());
    seg.set_req_data(req, 7).unwrap();
    seg.put_request(req).unwrap();
    assert_eq!(seg.get_req_data(req), None, "put clears side data");
}

#[test]
fn set_freequeue_size_keeps_requests() {
    let f = Fixture::new("route_fq", 2, 8, 4);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    assert_eq!(seg.alloc_requests(a, 5).unwrap(), 5);
    let cap = seg.set_freequeue_size(a, 1024).unwrap();
    assert!(cap >= 1024);
    for _ in 0..5 {
        seg.get_request(a, 1, X_LOCAL).unwrap();
    }
    assert!(seg.get_request(a, 1, X_LOCAL).is_err());
}

#[test]
fn accept_timeout_wakes_on_signal() {
    let f = Fixture::new("route_wait", 2, 8, 2);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let d = seg.bind_port(Some(1)).unwrap().portno();

    let t = Instant::now();
    assert!(seg.accept_timeout(d, 0, Duration::from_millis(20)).is_none());
    assert!(t.elapsed() >= Duration::from_millis(20));

    std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
            let req = seg.get_request(a, d, X_ALLOC).unwrap();
            assert_eq!(seg.submit(req, 0), Some(d));
            seg.signal(d).unwrap();
        });
        let got = seg.accept_timeout(d, 0, Duration::from_secs(10));
        assert!(got.is_some());
    });
}

#[test]
fn posix_peer_signals_a_parked_receiver() {
    let f = Fixture::with_peer("route_event", 2, 8, 2, "posix");
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let d = seg.bind_port(Some(1)).unwrap().portno();

    let req = seg.get_request(a, d, X_ALLOC).unwrap();
    seg.submit(req, 0).unwrap();
    let at_d = seg.accept(d, 0).unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(seg.respond(at_d, 0), Some(a));
            seg.signal(a).unwrap();
        });
        let back = seg.receive_timeout(a, 0, Duration::from_secs(10));
        assert!(back.is_some());
    });
}

#[test]
fn put_returns_a_request_to_the_port_that_allocated_it() {
    let f = Fixture::new("route_owner", 2, 8, 2);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let b = seg.bind_port(Some(1)).unwrap().portno();
    seg.set_max_requests(a, 1).unwrap();

    let req = seg.get_request(a, b, X_ALLOC).unwrap();
    assert_eq!(seg.allocated_requests(a), Some(1));
    seg.submit(req, 0).unwrap();
    let at_b = seg.accept(b, 0).unwrap();
    // the receiving side frees it
    seg.put_request(at_b).unwrap();

    assert!(seg.get_request(b, a, X_LOCAL).is_err(), "b never owned it");
    let again = seg.get_request(a, b, X_LOCAL).expect("back on a's free queue");
    assert!(std::ptr::eq(again, req));
    assert_eq!(seg.allocated_requests(a), Some(1));
    assert_eq!(seg.allocated_requests(b), Some(0));
}

#[test]
fn put_after_the_owner_is_gone_releases_to_the_pool() {
    let f = Fixture::new("route_orphan", 2, 8, 2);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let b = seg.bind_dynport().unwrap().portno();

    let req = seg.get_request(b, a, X_ALLOC).unwrap();
    seg.submit(req, 0).unwrap();
    let at_a = seg.accept(a, 0).unwrap();
    seg.unbind_port(b).unwrap();

    let free_before = seg.request_pool().nr_free();
    seg.put_request(at_a).unwrap();
    assert_eq!(seg.request_pool().nr_free(), free_before + 1);
    assert!(seg.get_request(a, b, X_LOCAL).is_err());
}

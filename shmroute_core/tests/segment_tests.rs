mod common;

use common::{unique_name, Fixture};
use shmroute_core::{
    Error, PeerDriver, PortNo, Registry, Result, Segment, SegmentConfig, SpinPeer, CAN_ACCEPT,
    CAN_RECEIVE, NO_PORT, X_ALLOC,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Spin signaling under another name, optionally refusing to attach, and
/// counting detaches.
struct ScriptedPeer {
    name: &'static str,
    refuse_init: bool,
    quits: AtomicUsize,
    inner: SpinPeer,
}

impl ScriptedPeer {
    fn new(name: &'static str, refuse_init: bool) -> Arc<Self> {
        Arc::new(ScriptedPeer { name, refuse_init, quits: AtomicUsize::new(0), inner: SpinPeer::new() })
    }
}

impl PeerDriver for ScriptedPeer {
    fn name(&self) -> &str {
        self.name
    }
    fn local_signal_init(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        if self.refuse_init {
            return Err(Error::Backend("attach refused".into()));
        }
        self.inner.local_signal_init(seg, portno)
    }
    fn local_signal_quit(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        self.quits.fetch_add(1, Ordering::SeqCst);
        self.inner.local_signal_quit(seg, portno)
    }
    fn alloc_data(&self, seg: &Segment) -> Result<u64> {
        self.inner.alloc_data(seg)
    }
    fn free_data(&self, seg: &Segment, data: u64) -> Result<()> {
        self.inner.free_data(seg, data)
    }
    fn alloc_signal_desc(&self, seg: &Segment, data: u64) -> Result<u64> {
        self.inner.alloc_signal_desc(seg, data)
    }
    fn free_signal_desc(&self, seg: &Segment, data: u64, sd: u64) -> Result<()> {
        self.inner.free_signal_desc(seg, data, sd)
    }
    fn init_signal_desc(&self, seg: &Segment, sd: u64) -> Result<()> {
        self.inner.init_signal_desc(seg, sd)
    }
    fn prepare_wait(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        self.inner.prepare_wait(seg, portno)
    }
    fn cancel_wait(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        self.inner.cancel_wait(seg, portno)
    }
    fn wait_signal(&self, seg: &Segment, sd: u64, timeout: Duration) -> Result<bool> {
        self.inner.wait_signal(seg, sd, timeout)
    }
    fn signal(&self, seg: &Segment, portno: PortNo) -> Result<()> {
        self.inner.signal(seg, portno)
    }
}

#[test]
fn scenario_spec_is_parsed() {
    let cfg: SegmentConfig = "posix:test:2:4:1:12".parse().unwrap();
    assert_eq!(cfg.backend, "posix");
    assert_eq!(cfg.name, "test");
    assert_eq!((cfg.dynports, cfg.nr_ports), (2, 4));
    assert_eq!(cfg.heap_size, 1 << 20);
    assert_eq!(cfg.page_shift, 12);
    assert!("local:x:8:4".parse::<SegmentConfig>().is_err());
}

#[test]
fn create_join_leave_local() {
    let f = Fixture::new("seg_basic", 4, 16, 2);
    assert_eq!(f.seg.nr_ports(), 16);
    assert_eq!(f.seg.dynports(), 4);
    assert_eq!(f.seg.name(), f.name);
    assert_eq!(f.seg.config().heap_size, 2 << 20);
    assert!(f.seg.size() >= (2 << 20) + 2 * 4096);
    assert_eq!(f.seg.peer_type_name(f.seg.peer_serial()).as_deref(), Some("spin"));

    let cfg: SegmentConfig = format!("local:{}:4:16:2:12", f.name).parse().unwrap();
    assert!(matches!(Segment::create(&f.reg, &cfg), Err(Error::InvalidArgument(_))));
}

#[test]
fn joins_share_one_mapping() {
    let f = Fixture::new("seg_refs", 2, 8, 1);
    assert_eq!(f.reg.mapping_refs("local", &f.name), 1);
    let second = f.join("spin");
    assert_eq!(second.base(), f.seg.base());
    assert_eq!(f.reg.mapping_refs("local", &f.name), 2);
    second.leave();
    assert_eq!(f.reg.mapping_refs("local", &f.name), 1);
}

#[test]
fn join_of_missing_segment_is_not_found() {
    let reg = Arc::new(Registry::with_builtins().unwrap());
    let r = Segment::join(&reg, "local", &unique_name("nowhere"), "spin");
    assert!(matches!(r, Err(Error::NotFound(_))));
    assert!(matches!(
        Segment::join(&reg, "nosuchbackend", "x", "spin"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn version_mismatch_is_a_protocol_error() {
    let f = Fixture::new("seg_version", 2, 8, 1);
    // header layout: magic, version, size
    let version = unsafe { (f.seg.base() as *mut u64).add(1) };
    let good = unsafe { version.read_volatile() };
    unsafe { version.write_volatile(good + 1) };
    let r = Segment::join(&f.reg, "local", &f.name, "spin");
    unsafe { version.write_volatile(good) };
    match r {
        Err(Error::ProtocolMismatch { expected, found }) => {
            assert_eq!(expected, good);
            assert_eq!(found, good + 1);
        }
        Err(e) => panic!("expected protocol mismatch, got {e}"),
        Ok(_) => panic!("join succeeded with a bad version"),
    }
    assert!(Segment::join(&f.reg, "local", &f.name, "spin").is_ok());
}

#[test]
fn driver_table_is_shared_and_idempotent() {
    let f = Fixture::new("seg_drivers", 2, 8, 1);
    let spin = f.seg.peer_serial();
    let other = f.join("posix");
    assert_ne!(other.peer_serial(), spin);
    assert_eq!(f.seg.peer_type_name(other.peer_serial()).as_deref(), Some("posix"));
    assert_eq!(f.seg.enable_driver("spin").unwrap(), spin);
    let data = f.seg.peer_type_data(spin);
    assert_ne!(data, 0);
    assert_eq!(f.join("spin").peer_type_data(spin), data);
    assert!(f.seg.peer_type(other.peer_serial()).is_some());
}

#[test]
fn forced_and_dynamic_binds() {
    let f = Fixture::new("seg_bind", 2, 6, 2);
    let seg = &f.seg;
    assert_eq!(seg.bind_port(Some(1)).unwrap().portno(), 1);
    assert!(matches!(seg.bind_port(Some(4)), Err(Error::InvalidArgument(_))));

    let dyns: Vec<_> = (0..4).map(|_| seg.bind_dynport().unwrap().portno()).collect();
    assert_eq!(dyns, vec![2, 3, 4, 5]);
    assert!(matches!(seg.bind_dynport(), Err(Error::ResourceExhausted(_))));

    let sd = seg.get_port(3).unwrap().signal_desc();
    seg.leave_dynport(3).unwrap();
    assert!(!seg.get_port(3).unwrap().can_accept());
    let again = seg.bind_dynport().unwrap();
    assert_eq!(again.portno(), 3);
    assert_eq!(again.signal_desc(), sd, "descriptor reused for the same driver");

    // a forced bind takes over an existing port
    assert_eq!(seg.bind_port(Some(1)).unwrap().portno(), 1);
    assert!(seg.get_port(0).is_none());
}

#[test]
fn unbind_requires_empty_queues() {
    let f = Fixture::new("seg_unbind", 2, 8, 2);
    let seg = &f.seg;
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let b = seg.bind_dynport().unwrap().portno();
    let req = seg.get_request(a, b, shmroute_core::X_ALLOC).unwrap();
    assert_eq!(seg.submit(req, 0), Some(b));
    assert!(seg.unbind_port(b).is_err());

    let got = seg.accept(b, 0).unwrap();
    seg.put_request(got).unwrap();
    seg.unbind_port(b).unwrap();
    assert!(seg.get_port(b).is_none());
    assert!(seg.unbind_port(b).is_err());
    assert_eq!(seg.bind_dynport().unwrap().portno(), b);
}

#[test]
fn routing_tables_validate_ports() {
    let f = Fixture::new("seg_tables", 2, 8, 1);
    let seg = &f.seg;
    assert_eq!(seg.next_hop(3), None);
    seg.set_next_hop(3, 5).unwrap();
    assert_eq!(seg.next_hop(3), Some(5));
    seg.set_next_hop(3, NO_PORT).unwrap();
    assert_eq!(seg.next_hop(3), None);
    assert!(seg.set_next_hop(8, 1).is_err());
    assert!(seg.set_default_destination(1, 99).is_err());
    seg.set_default_destination(1, 4).unwrap();
    assert_eq!(seg.default_destination(1), Some(4));
}

#[test]
fn posix_backend_round_trip() {
    let reg = Arc::new(Registry::with_builtins().unwrap());
    let name = unique_name("shmroute_posix");
    let cfg: SegmentConfig = format!("posix:{name}:2:8:1:12").parse().unwrap();
    Segment::create(&reg, &cfg).unwrap();
    {
        let seg = Segment::join(&reg, "posix", &name, "spin").unwrap();
        let peer = Segment::join(&reg, "posix", &name, "spin").unwrap();
        assert_eq!(seg.size(), cfg.segment_size().unwrap());
        let p = seg.bind_dynport().unwrap().portno();
        assert_eq!(peer.get_port(p).map(|port| port.portno()), Some(p));
    }
    Segment::destroy(&reg, "posix", &name).unwrap();
    assert!(Segment::join(&reg, "posix", &name, "spin").is_err());
}

#[test]
fn failed_bind_of_a_new_port_leaves_nothing_behind() {
    let f = Fixture::new("seg_bindfail", 2, 8, 2);
    f.reg.register_peer(ScriptedPeer::new("flaky", true)).unwrap();
    let flaky = f.join("flaky");
    let descs = f.seg.objh_at(flaky.peer_type_data(flaky.peer_serial())).unwrap();

    assert!(matches!(flaky.bind_port(Some(0)), Err(Error::Backend(_))));
    assert!(f.seg.get_port(0).is_none());
    assert_eq!(descs.live(), 0);

    let settled = f.seg.heap().free_bytes();
    for _ in 0..16 {
        assert!(flaky.bind_dynport().is_err());
    }
    assert!((2..8).all(|p| f.seg.get_port(p).is_none()));
    assert_eq!(descs.live(), 0);
    assert_eq!(f.seg.heap().free_bytes(), settled, "queues and port objects are recycled");
}

#[test]
fn failed_takeover_restores_the_previous_binding() {
    let f = Fixture::new("seg_takeover", 2, 8, 2);
    f.reg.register_peer(ScriptedPeer::new("flaky", true)).unwrap();
    let flaky = f.join("flaky");
    let descs = f.seg.objh_at(flaky.peer_type_data(flaky.peer_serial())).unwrap();

    let port = f.seg.bind_port(Some(1)).unwrap();
    let (owner, sd, serial) = (port.owner(), port.signal_desc(), port.peer_type());

    assert!(flaky.bind_port(Some(1)).is_err());
    let port = f.seg.get_port(1).expect("port survives");
    assert_eq!(port.owner(), owner);
    assert_eq!(port.signal_desc(), sd);
    assert_eq!(port.peer_type(), serial);
    assert_eq!(port.flags(), CAN_ACCEPT | CAN_RECEIVE);
    assert_eq!(descs.live(), 0);

    let a = f.seg.bind_port(Some(0)).unwrap().portno();
    let req = f.seg.get_request(a, 1, X_ALLOC).unwrap();
    assert_eq!(f.seg.submit(req, 0), Some(1));
    f.seg.signal(1).unwrap();
}

#[test]
fn refused_unbind_keeps_the_local_signal() {
    let f = Fixture::new("seg_unbind_sig", 2, 8, 2);
    let peer = ScriptedPeer::new("counted", false);
    f.reg.register_peer(Arc::clone(&peer) as Arc<dyn PeerDriver>).unwrap();
    let seg = f.join("counted");
    let a = seg.bind_port(Some(0)).unwrap().portno();
    let b = seg.bind_dynport().unwrap().portno();

    let req = seg.get_request(a, b, X_ALLOC).unwrap();
    seg.submit(req, 0).unwrap();
    assert!(seg.unbind_port(b).is_err());
    assert_eq!(peer.quits.load(Ordering::SeqCst), 0);

    let got = seg.accept(b, 0).unwrap();
    seg.put_request(got).unwrap();
    seg.unbind_port(b).unwrap();
    assert_eq!(peer.quits.load(Ordering::SeqCst), 1);
}

use crate::{
    errors::{map_error, set_last_error, ErrorCode},
    handle_registry::{default_registry, register_handle, unregister_handle, with_handle, HandleId},
    types::{PortNo, NO_PORT},
    Segment, SegmentConfig,
};
use std::{ffi::CStr, os::raw::c_char};

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cstr<'a>(p: *const c_char) -> Result<&'a str, ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::Utf8Error);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ErrorCode::Utf8Error)
}

#[inline]
fn fail(code: ErrorCode) -> ErrorCode {
    set_last_error(code);
    code
}

#[inline]
fn flatten<T>(r: Result<Result<T, ErrorCode>, ErrorCode>) -> Result<T, ErrorCode> {
    r.and_then(|x| x)
}

// ─── small helper to turn Result<T,ErrorCode> into early-return ──────────
macro_rules! try_c { ($expr:expr) => { match $expr {
    Ok(v)  => v,
    Err(e) => return fail(e),
}}}

/// Route result for C: the port, or `NO_PORT` with `NoPort` as last error.
fn port_or_none(r: Result<Option<PortNo>, ErrorCode>) -> PortNo {
    match r {
        Ok(Some(p)) => {
            set_last_error(ErrorCode::Success);
            p
        }
        Ok(None) => {
            set_last_error(ErrorCode::NoPort);
            NO_PORT
        }
        Err(e) => {
            set_last_error(e);
            NO_PORT
        }
    }
}

/// Request result for C: its segment offset, or 0.
fn offset_or_zero(r: Result<Option<u64>, ErrorCode>) -> u64 {
    match r {
        Ok(Some(off)) => {
            set_last_error(ErrorCode::Success);
            off
        }
        Ok(None) => {
            set_last_error(ErrorCode::NotFound);
            0
        }
        Err(e) => {
            set_last_error(e);
            0
        }
    }
}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Create a segment from a spec string (`type:name:dynports:nr_ports:heap_MB:page_shift`).
/// NULL reads `SHMROUTE_SEGMENT`, falling back to defaults.
#[no_mangle]
pub extern "C" fn shmroute_create(spec_utf8: *const c_char) -> ErrorCode {
    let cfg = if spec_utf8.is_null() {
        SegmentConfig::from_env()
    } else {
        SegmentConfig::parse_spec(try_c!(cstr(spec_utf8)))
    };
    let reg = try_c!(default_registry());
    match Segment::create(&reg, &cfg) {
        Ok(()) => fail(ErrorCode::Success),
        Err(e) => fail(map_error(&e)),
    }
}

#[no_mangle]
pub extern "C" fn shmroute_destroy(type_utf8: *const c_char, name_utf8: *const c_char) -> ErrorCode {
    let ty = try_c!(cstr(type_utf8));
    let name = try_c!(cstr(name_utf8));
    let reg = try_c!(default_registry());
    match Segment::destroy(&reg, ty, name) {
        Ok(()) => fail(ErrorCode::Success),
        Err(e) => fail(map_error(&e)),
    }
}

/// Join a segment as `peer_type`; stores the handle in `*out`.
#[no_mangle]
pub extern "C" fn shmroute_join(
    type_utf8: *const c_char,
    name_utf8: *const c_char,
    peer_utf8: *const c_char,
    out: *mut HandleId,
) -> ErrorCode {
    if out.is_null() {
        return fail(ErrorCode::InvalidHandle);
    }
    let ty = try_c!(cstr(type_utf8));
    let name = try_c!(cstr(name_utf8));
    let peer = try_c!(cstr(peer_utf8));
    let reg = try_c!(default_registry());
    match Segment::join(&reg, ty, name, peer) {
        Ok(seg) => unsafe {
            *out = register_handle(seg);
            fail(ErrorCode::Success)
        },
        Err(e) => fail(map_error(&e)),
    }
}

#[no_mangle]
pub extern "C" fn shmroute_leave(h: HandleId) -> ErrorCode {
    match unregister_handle(h) {
        Ok(()) => fail(ErrorCode::Success),
        Err(e) => fail(e),
    }
}

// ───────────────────────── ports ─────────────────────────────────────── //

/// Bind `portno`, or the first free dynamic port when `portno` is `NO_PORT`.
#[no_mangle]
pub extern "C" fn shmroute_bind_port(h: HandleId, portno: PortNo, out: *mut PortNo) -> ErrorCode {
    if out.is_null() {
        return fail(ErrorCode::InvalidHandle);
    }
    let req = (portno != NO_PORT).then_some(portno);
    let bound = try_c!(flatten(with_handle(h, |seg| {
        seg.bind_port(req).map(|p| p.portno()).map_err(|e| map_error(&e))
    })));
    unsafe { *out = bound };
    fail(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn shmroute_leave_port(h: HandleId, portno: PortNo) -> ErrorCode {
    try_c!(flatten(with_handle(h, |seg| seg.leave_dynport(portno).map_err(|e| map_error(&e)))));
    fail(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn shmroute_signal(h: HandleId, portno: PortNo) -> ErrorCode {
    try_c!(flatten(with_handle(h, |seg| seg.signal(portno).map_err(|e| map_error(&e)))));
    fail(ErrorCode::Success)
}

// ───────────────────────── requests ──────────────────────────────────── //

/// Allocate a request from `src` to `dst`; stores its segment offset in `*out`.
#[no_mangle]
pub extern "C" fn shmroute_get_request(
    h: HandleId,
    src: PortNo,
    dst: PortNo,
    flags: u32,
    out: *mut u64,
) -> ErrorCode {
    if out.is_null() {
        return fail(ErrorCode::InvalidHandle);
    }
    let off = try_c!(flatten(with_handle(h, |seg| {
        seg.get_request(src, dst, flags)
            .and_then(|r| seg.request_offset(r))
            .map_err(|e| map_error(&e))
    })));
    unsafe { *out = off };
    fail(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn shmroute_prep_request(h: HandleId, req: u64, targetlen: u64, datalen: u64) -> ErrorCode {
    try_c!(flatten(with_handle(h, |seg| {
        seg.request_at(req)
            .and_then(|r| seg.prep_request(r, targetlen, datalen))
            .map_err(|e| map_error(&e))
    })));
    fail(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn shmroute_put_request(h: HandleId, req: u64) -> ErrorCode {
    try_c!(flatten(with_handle(h, |seg| {
        seg.request_at(req)
            .and_then(|r| seg.put_request(r))
            .map_err(|e| map_error(&e))
    })));
    fail(ErrorCode::Success)
}

// ───────────────────────── routing ───────────────────────────────────── //

#[no_mangle]
pub extern "C" fn shmroute_submit(h: HandleId, req: u64, flags: u32) -> PortNo {
    port_or_none(flatten(with_handle(h, |seg| {
        seg.request_at(req).map(|r| seg.submit(r, flags)).map_err(|e| map_error(&e))
    })))
}

#[no_mangle]
pub extern "C" fn shmroute_respond(h: HandleId, req: u64, flags: u32) -> PortNo {
    port_or_none(flatten(with_handle(h, |seg| {
        seg.request_at(req).map(|r| seg.respond(r, flags)).map_err(|e| map_error(&e))
    })))
}

#[no_mangle]
pub extern "C" fn shmroute_forward(h: HandleId, req: u64, new_dst: PortNo, flags: u32) -> PortNo {
    port_or_none(flatten(with_handle(h, |seg| {
        seg.request_at(req)
            .map(|r| seg.forward(r, new_dst, flags))
            .map_err(|e| map_error(&e))
    })))
}

/// Next request queued on `portno`, as a segment offset; 0 when there is none.
#[no_mangle]
pub extern "C" fn shmroute_accept(h: HandleId, portno: PortNo, flags: u32) -> u64 {
    offset_or_zero(with_handle(h, |seg| {
        seg.accept(portno, flags).and_then(|r| seg.request_offset(r).ok())
    }))
}

/// Next reply queued on `portno`, as a segment offset; 0 when there is none.
#[no_mangle]
pub extern "C" fn shmroute_receive(h: HandleId, portno: PortNo, flags: u32) -> u64 {
    offset_or_zero(with_handle(h, |seg| {
        seg.receive(portno, flags).and_then(|r| seg.request_offset(r).ok())
    }))
}

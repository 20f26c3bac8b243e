//! C FFI layer for owl.
//!
//! Provides an opaque handle-based API for C/C++ consumers. Parameter names
//! are passed as raw `u32` values. A command naming no known [`Param`] is
//! not sent; like any other rejected command it fails the next
//! `owl_get_status` with `InvalidEnum`. A query naming one fails at once.
//! The generated C header is written to `include/owl.h` by cbindgen.
//!
//! Functions returning `c_int` return `-1` on failure; `owl_last_error`
//! then describes it.

use crate::command::Command;
use crate::error::LastError;
use crate::id::{self, MarkerId};
use crate::session::Session;
use crate::types::{
    CameraSample, ErrorCode, Event, InitFlags, MarkerSample, Param, Payload, RigidSample, Target,
};
use crate::OwlError;
use std::ffi::{c_char, c_int, CStr};

static LAST_ERROR: LastError = LastError::new();

/// Opaque session handle for C consumers.
pub struct OwlSession(Session);

fn fail<T>(err: OwlError, value: T) -> T {
    LAST_ERROR.set(&err);
    value
}

/// Run `f` on the session behind `s`, mapping errors to `on_error`.
unsafe fn with_session<T>(
    s: *mut OwlSession,
    on_error: T,
    f: impl FnOnce(&mut Session) -> crate::Result<T>,
) -> T {
    if s.is_null() {
        return on_error;
    }
    let session = &mut (*s).0;
    match f(session) {
        Ok(value) => value,
        Err(e) => fail(e, on_error),
    }
}

/// Translate a raw query parameter name, recording `InvalidEnum` when unknown.
fn param(session: &mut Session, raw: u32) -> crate::Result<Param> {
    Param::from_raw(raw).ok_or_else(|| {
        log::debug!("unknown parameter 0x{:04x} not sent", raw);
        session.set_local_error(ErrorCode::InvalidEnum);
        OwlError::Protocol(ErrorCode::InvalidEnum)
    })
}

unsafe fn send(s: *mut OwlSession, target: Target, pname: u32, payload: Payload) -> c_int {
    with_session(s, -1, |session| {
        match Param::from_raw(pname) {
            Some(param) => session.command(Command::new(target, param, payload))?,
            None => {
                log::debug!("unknown parameter 0x{:04x} not sent", pname);
                session.reject_command(ErrorCode::InvalidEnum);
            }
        }
        Ok(0)
    })
}

unsafe fn slice<'a, T>(values: *const T, count: usize) -> &'a [T] {
    if values.is_null() || count == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(values, count)
    }
}

/// Copy up to `capacity` items into `out`, returning how many were written.
unsafe fn write_out<T: Copy>(items: &[T], out: *mut T, capacity: c_int) -> c_int {
    if out.is_null() || capacity <= 0 {
        return 0;
    }
    let count = items.len().min(capacity as usize);
    std::ptr::copy_nonoverlapping(items.as_ptr(), out, count);
    count as c_int
}

fn capacity(capacity: c_int) -> usize {
    capacity.max(0) as usize
}

// -- lifecycle --

/// Connect to `server` (`host` or `host:port`) and initialize with `flags`.
/// Returns NULL on error (check owl_last_error()).
///
/// # Safety
/// `server` must be a valid null-terminated string, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_init(server: *const c_char, flags: u32) -> *mut OwlSession {
    if server.is_null() {
        return fail(
            OwlError::Connect {
                address: String::new(),
                reason: "null server address".into(),
            },
            std::ptr::null_mut(),
        );
    }
    let address = CStr::from_ptr(server).to_string_lossy();
    match Session::open(&address, InitFlags::from_bits_retain(flags)) {
        Ok(session) => {
            LAST_ERROR.clear();
            Box::into_raw(Box::new(OwlSession(session)))
        }
        Err(e) => fail(e, std::ptr::null_mut()),
    }
}

/// Close a session and free its resources.
///
/// # Safety
/// `s` must be a pointer returned by `owl_init`, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_done(s: *mut OwlSession) {
    if !s.is_null() {
        drop(Box::from_raw(s));
    }
}

// -- global commands --

/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_set_float(s: *mut OwlSession, pname: u32, value: f32) -> c_int {
    send(s, Target::Global, pname, Payload::Float(value))
}

/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_set_integer(s: *mut OwlSession, pname: u32, value: i32) -> c_int {
    send(s, Target::Global, pname, Payload::Int(value))
}

/// # Safety
/// `s` must be a valid session pointer, or null. `values` must point to
/// `count` floats.
#[no_mangle]
pub unsafe extern "C" fn owl_set_floatv(
    s: *mut OwlSession,
    pname: u32,
    values: *const f32,
    count: usize,
) -> c_int {
    let values = slice(values, count).to_vec();
    send(s, Target::Global, pname, Payload::Floats(values))
}

/// # Safety
/// `s` must be a valid session pointer, or null. `values` must point to
/// `count` integers.
#[no_mangle]
pub unsafe extern "C" fn owl_set_integerv(
    s: *mut OwlSession,
    pname: u32,
    values: *const i32,
    count: usize,
) -> c_int {
    let values = slice(values, count).to_vec();
    send(s, Target::Global, pname, Payload::Ints(values))
}

/// # Safety
/// `s` must be a valid session pointer, or null. `value` must be a valid
/// null-terminated string, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_set_string(
    s: *mut OwlSession,
    pname: u32,
    value: *const c_char,
) -> c_int {
    let value = if value.is_null() {
        String::new()
    } else {
        CStr::from_ptr(value).to_string_lossy().into_owned()
    };
    send(s, Target::Global, pname, Payload::Str(value))
}

// -- tracker commands --

/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_tracker(s: *mut OwlSession, tracker: i32, pname: u32) -> c_int {
    send(s, Target::Tracker(tracker), pname, Payload::None)
}

/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_trackerf(
    s: *mut OwlSession,
    tracker: i32,
    pname: u32,
    value: f32,
) -> c_int {
    send(s, Target::Tracker(tracker), pname, Payload::Float(value))
}

/// `owl_trackeri(s, 0, OWL_CREATE, OWL_POINT_TRACKER)` creates a tracker.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_trackeri(
    s: *mut OwlSession,
    tracker: i32,
    pname: u32,
    value: i32,
) -> c_int {
    send(s, Target::Tracker(tracker), pname, Payload::Int(value))
}

/// # Safety
/// `s` must be a valid session pointer, or null. `values` must point to
/// `count` floats.
#[no_mangle]
pub unsafe extern "C" fn owl_trackerfv(
    s: *mut OwlSession,
    tracker: i32,
    pname: u32,
    values: *const f32,
    count: usize,
) -> c_int {
    let values = slice(values, count).to_vec();
    send(s, Target::Tracker(tracker), pname, Payload::Floats(values))
}

/// # Safety
/// `s` must be a valid session pointer, or null. `values` must point to
/// `count` integers.
#[no_mangle]
pub unsafe extern "C" fn owl_trackeriv(
    s: *mut OwlSession,
    tracker: i32,
    pname: u32,
    values: *const i32,
    count: usize,
) -> c_int {
    let values = slice(values, count).to_vec();
    send(s, Target::Tracker(tracker), pname, Payload::Ints(values))
}

// -- marker commands --

/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_marker(s: *mut OwlSession, marker: i32, pname: u32) -> c_int {
    send(s, Target::Marker(MarkerId(marker)), pname, Payload::None)
}

/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_markerf(
    s: *mut OwlSession,
    marker: i32,
    pname: u32,
    value: f32,
) -> c_int {
    send(s, Target::Marker(MarkerId(marker)), pname, Payload::Float(value))
}

/// `owl_markeri(s, owl_marker_id(0, i), OWL_SET_LED, i)` binds LED `i`.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_markeri(
    s: *mut OwlSession,
    marker: i32,
    pname: u32,
    value: i32,
) -> c_int {
    send(s, Target::Marker(MarkerId(marker)), pname, Payload::Int(value))
}

/// # Safety
/// `s` must be a valid session pointer, or null. `values` must point to
/// `count` floats.
#[no_mangle]
pub unsafe extern "C" fn owl_markerfv(
    s: *mut OwlSession,
    marker: i32,
    pname: u32,
    values: *const f32,
    count: usize,
) -> c_int {
    let values = slice(values, count).to_vec();
    send(s, Target::Marker(MarkerId(marker)), pname, Payload::Floats(values))
}

/// # Safety
/// `s` must be a valid session pointer, or null. `values` must point to
/// `count` integers.
#[no_mangle]
pub unsafe extern "C" fn owl_markeriv(
    s: *mut OwlSession,
    marker: i32,
    pname: u32,
    values: *const i32,
    count: usize,
) -> c_int {
    let values = slice(values, count).to_vec();
    send(s, Target::Marker(MarkerId(marker)), pname, Payload::Ints(values))
}

// -- client-side transform --

/// Scale applied to reported positions.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_scale(s: *mut OwlSession, scale: f32) {
    with_session(s, (), |session| {
        session.set_scale(scale);
        Ok(())
    })
}

/// Load the reporting frame from 7 floats `[x, y, z, s, qx, qy, qz]`.
///
/// # Safety
/// `s` must be a valid session pointer, or null. `pose` must point to 7
/// floats, or be null.
#[no_mangle]
pub unsafe extern "C" fn owl_load_pose(s: *mut OwlSession, pose: *const f32) -> c_int {
    if pose.is_null() {
        return -1;
    }
    let mut values = [0.0f32; 7];
    values.copy_from_slice(slice(pose, 7));
    with_session(s, -1, |session| {
        session.load_pose(values);
        Ok(0)
    })
}

// -- queries --

/// Wait for every command sent so far. Returns 1 if all succeeded, 0 if one
/// failed (see owl_get_error()), -1 on transport failure.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_get_status(s: *mut OwlSession) -> c_int {
    with_session(s, -1, |session| Ok(session.get_status()? as c_int))
}

/// Error code of the most recent reply, `0` when none.
///
/// # Safety
/// `s` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_get_error(s: *const OwlSession) -> u32 {
    if s.is_null() {
        return ErrorCode::InvalidOperation.raw();
    }
    (*s).0.get_error().raw()
}

/// Returns 1 and fills `out` when an event is pending, 0 when none.
///
/// # Safety
/// `s` must be a valid session pointer, or null. `out` must be valid for
/// writes, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_peek_event(s: *mut OwlSession, out: *mut Event) -> c_int {
    let event = with_session(s, None, |session| session.peek_event().map(Some));
    write_event(event, out)
}

/// Like `owl_peek_event`, but consumes the event.
///
/// # Safety
/// `s` must be a valid session pointer, or null. `out` must be valid for
/// writes, or null.
#[no_mangle]
pub unsafe extern "C" fn owl_get_event(s: *mut OwlSession, out: *mut Event) -> c_int {
    let event = with_session(s, None, |session| session.get_event().map(Some));
    write_event(event, out)
}

unsafe fn write_event(event: Option<Event>, out: *mut Event) -> c_int {
    match event {
        None => -1,
        Some(event) => {
            if !out.is_null() {
                out.write(event);
            }
            (!event.is_none()) as c_int
        }
    }
}

/// Fill `out` with up to `capacity` markers of the newest frame. Returns the
/// count; 0 means no new frame yet.
///
/// # Safety
/// `s` must be a valid session pointer, or null. `out` must point to
/// `capacity` writable elements.
#[no_mangle]
pub unsafe extern "C" fn owl_get_markers(
    s: *mut OwlSession,
    out: *mut MarkerSample,
    cap: c_int,
) -> c_int {
    with_session(s, -1, |session| {
        let samples = session.get_markers(capacity(cap))?;
        Ok(write_out(&samples, out, cap))
    })
}

/// # Safety
/// `s` must be a valid session pointer, or null. `out` must point to
/// `capacity` writable elements.
#[no_mangle]
pub unsafe extern "C" fn owl_get_rigids(
    s: *mut OwlSession,
    out: *mut RigidSample,
    cap: c_int,
) -> c_int {
    with_session(s, -1, |session| {
        let samples = session.get_rigids(capacity(cap))?;
        Ok(write_out(&samples, out, cap))
    })
}

/// # Safety
/// `s` must be a valid session pointer, or null. `out` must point to
/// `capacity` writable elements.
#[no_mangle]
pub unsafe extern "C" fn owl_get_cameras(
    s: *mut OwlSession,
    out: *mut CameraSample,
    cap: c_int,
) -> c_int {
    with_session(s, -1, |session| {
        let samples = session.get_cameras(capacity(cap))?;
        Ok(write_out(&samples, out, cap))
    })
}

/// Returns the number of floats written into `out`.
///
/// # Safety
/// `s` must be a valid session pointer, or null. `out` must point to
/// `capacity` writable floats.
#[no_mangle]
pub unsafe extern "C" fn owl_get_floatv(
    s: *mut OwlSession,
    pname: u32,
    out: *mut f32,
    cap: c_int,
) -> c_int {
    with_session(s, -1, |session| {
        let param = param(session, pname)?;
        let values = session.get_floats(param)?;
        Ok(write_out(&values, out, cap))
    })
}

/// Returns the number of integers written into `out`.
///
/// # Safety
/// `s` must be a valid session pointer, or null. `out` must point to
/// `capacity` writable integers.
#[no_mangle]
pub unsafe extern "C" fn owl_get_integerv(
    s: *mut OwlSession,
    pname: u32,
    out: *mut i32,
    cap: c_int,
) -> c_int {
    with_session(s, -1, |session| {
        let param = param(session, pname)?;
        let values = session.get_ints(param)?;
        Ok(write_out(&values, out, cap))
    })
}

/// Copy a string parameter into `out` (null-terminated, truncated to fit).
/// Returns the number of bytes written, excluding the terminator.
///
/// # Safety
/// `s` must be a valid session pointer, or null. `out` must point to
/// `capacity` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn owl_get_string(
    s: *mut OwlSession,
    pname: u32,
    out: *mut c_char,
    cap: c_int,
) -> c_int {
    with_session(s, -1, |session| {
        let param = param(session, pname)?;
        let value = session.get_string(param)?;
        if out.is_null() || cap <= 0 {
            return Ok(0);
        }
        let bytes = value.as_bytes();
        let len = bytes.len().min(cap as usize - 1);
        std::ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, out, len);
        out.add(len).write(0);
        Ok(len as c_int)
    })
}

// -- marker id codec --

#[no_mangle]
pub extern "C" fn owl_marker_id(tracker: i32, index: i32) -> i32 {
    id::encode_marker(tracker, index)
}

#[no_mangle]
pub extern "C" fn owl_marker_index(marker: i32) -> i32 {
    id::decode_index(marker)
}

#[no_mangle]
pub extern "C" fn owl_marker_tracker(marker: i32) -> i32 {
    id::decode_tracker(marker)
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next owl API call.
#[no_mangle]
pub extern "C" fn owl_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}

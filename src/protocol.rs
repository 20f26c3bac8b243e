//! Wire encoding used by the bundled TCP transport and simulated server.
//!
//! Every message is a 12-byte header followed by a payload:
//!
//! ```text
//! ┌────────┬──────┬──────────┬──────────┬──────────┐
//! │ Magic  │ Kind │ Reserved │ Sequence │ Length   │
//! │ "OW"   │ u8   │ u8 (0)   │ u32 LE   │ u32 LE   │
//! └────────┴──────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The client numbers every request; the server echoes the number in the
//! response so late replies to abandoned requests can be discarded. All
//! multi-byte values are little-endian. Parameter names, error codes, event
//! types and init flags keep the numeric values of the server's C API.

use crate::command::Command;
use crate::id::MarkerId;
use crate::types::{
    CameraSample, ErrorCode, Event, InitFlags, MarkerSample, Param, Payload, Pose, RigidSample,
    Target,
};
use crate::{OwlError, Result};
use std::io::{Read, Write};

pub const MAGIC: [u8; 2] = [0x4F, 0x57];
pub const HEADER_SIZE: usize = 12;

/// Largest accepted payload (1 MiB).
pub const MAX_PAYLOAD: u32 = 1 << 20;

pub const MARKER_SAMPLE_SIZE: usize = 28;
pub const RIGID_SAMPLE_SIZE: usize = 44;
pub const CAMERA_SAMPLE_SIZE: usize = 40;

/// Message kinds. Requests have the high bit clear, responses set.
pub mod kind {
    pub const INIT: u8 = 0x01;
    pub const DONE: u8 = 0x02;
    pub const COMMAND: u8 = 0x10;
    pub const SYNC: u8 = 0x20;
    pub const PEEK_EVENT: u8 = 0x21;
    pub const GET_EVENT: u8 = 0x22;
    pub const GET_MARKERS: u8 = 0x30;
    pub const GET_RIGIDS: u8 = 0x31;
    pub const GET_CAMERAS: u8 = 0x32;
    pub const GET_VALUE: u8 = 0x40;

    pub const INIT_ACK: u8 = 0x81;
    pub const STATUS: u8 = 0xA0;
    pub const EVENT: u8 = 0xA1;
    pub const MARKERS: u8 = 0xB0;
    pub const RIGIDS: u8 = 0xB1;
    pub const CAMERAS: u8 = 0xB2;
    pub const VALUE: u8 = 0xC0;

    #[inline]
    pub fn is_response(kind: u8) -> bool {
        kind & 0x80 != 0
    }
}

mod payload_tag {
    pub const NONE: u8 = 0;
    pub const FLOAT: u8 = 1;
    pub const INT: u8 = 2;
    pub const FLOATS: u8 = 3;
    pub const INTS: u8 = 4;
    pub const STR: u8 = 5;
}

mod target_tag {
    pub const GLOBAL: u8 = 0;
    pub const TRACKER: u8 = 1;
    pub const MARKER: u8 = 2;
}

/// Type requested by a value query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    Float = 1,
    Int = 2,
    Str = 5,
}

impl ValueKind {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ValueKind::Float),
            2 => Some(ValueKind::Int),
            5 => Some(ValueKind::Str),
            _ => None,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: u8,
    pub seq: u32,
    pub len: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&MAGIC);
        buf[2] = self.kind;
        buf[4..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0..2] != MAGIC {
            return Err(OwlError::InvalidFrame(format!(
                "bad magic {:02x}{:02x}",
                buf[0], buf[1]
            )));
        }
        let len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if len > MAX_PAYLOAD {
            return Err(OwlError::InvalidFrame(format!("payload too large ({} bytes)", len)));
        }
        Ok(Self {
            kind: buf[2],
            seq: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            len,
        })
    }
}

/// Client-to-server message.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Init { flags: InitFlags },
    Done,
    Command(Command),
    Sync,
    PeekEvent,
    GetEvent,
    GetMarkers { capacity: u32 },
    GetRigids { capacity: u32 },
    GetCameras { capacity: u32 },
    GetValue { param: Param, kind: ValueKind },
}

impl Request {
    pub fn kind(&self) -> u8 {
        match self {
            Request::Init { .. } => kind::INIT,
            Request::Done => kind::DONE,
            Request::Command(_) => kind::COMMAND,
            Request::Sync => kind::SYNC,
            Request::PeekEvent => kind::PEEK_EVENT,
            Request::GetEvent => kind::GET_EVENT,
            Request::GetMarkers { .. } => kind::GET_MARKERS,
            Request::GetRigids { .. } => kind::GET_RIGIDS,
            Request::GetCameras { .. } => kind::GET_CAMERAS,
            Request::GetValue { .. } => kind::GET_VALUE,
        }
    }

    /// Whether the server answers this request.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Request::Command(_) | Request::Done)
    }
}

/// Server-to-client message.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    InitAck { accepted: bool, flags: InitFlags },
    Status { ok: bool, error: ErrorCode },
    Event { error: ErrorCode, event: Event },
    Markers { error: ErrorCode, samples: Vec<MarkerSample> },
    Rigids { error: ErrorCode, samples: Vec<RigidSample> },
    Cameras { error: ErrorCode, samples: Vec<CameraSample> },
    Value { error: ErrorCode, value: Payload },
}

impl Response {
    pub fn kind(&self) -> u8 {
        match self {
            Response::InitAck { .. } => kind::INIT_ACK,
            Response::Status { .. } => kind::STATUS,
            Response::Event { .. } => kind::EVENT,
            Response::Markers { .. } => kind::MARKERS,
            Response::Rigids { .. } => kind::RIGIDS,
            Response::Cameras { .. } => kind::CAMERAS,
            Response::Value { .. } => kind::VALUE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Response::InitAck { .. } => "init-ack",
            Response::Status { .. } => "status",
            Response::Event { .. } => "event",
            Response::Markers { .. } => "markers",
            Response::Rigids { .. } => "rigids",
            Response::Cameras { .. } => "cameras",
            Response::Value { .. } => "value",
        }
    }

    /// Error code carried by the response.
    pub fn error(&self) -> ErrorCode {
        match self {
            Response::InitAck { .. } => ErrorCode::NoError,
            Response::Status { error, .. }
            | Response::Event { error, .. }
            | Response::Markers { error, .. }
            | Response::Rigids { error, .. }
            | Response::Cameras { error, .. }
            | Response::Value { error, .. } => *error,
        }
    }
}

// -- encoding --

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_len(buf: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u16::try_from(len)
        .map_err(|_| OwlError::InvalidFrame(format!("sequence too long ({} items)", len)))?;
    put_u16(buf, len);
    Ok(())
}

fn put_pose(buf: &mut Vec<u8>, pose: &Pose) {
    for &v in pose {
        put_f32(buf, v);
    }
}

fn put_target(buf: &mut Vec<u8>, target: Target) {
    let (tag, id) = match target {
        Target::Global => (target_tag::GLOBAL, 0),
        Target::Tracker(id) => (target_tag::TRACKER, id),
        Target::Marker(id) => (target_tag::MARKER, id.raw()),
    };
    buf.push(tag);
    put_i32(buf, id);
}

fn put_payload(buf: &mut Vec<u8>, payload: &Payload) -> Result<()> {
    match payload {
        Payload::None => buf.push(payload_tag::NONE),
        Payload::Float(v) => {
            buf.push(payload_tag::FLOAT);
            put_f32(buf, *v);
        }
        Payload::Int(v) => {
            buf.push(payload_tag::INT);
            put_i32(buf, *v);
        }
        Payload::Floats(values) => {
            buf.push(payload_tag::FLOATS);
            put_len(buf, values.len())?;
            for &v in values {
                put_f32(buf, v);
            }
        }
        Payload::Ints(values) => {
            buf.push(payload_tag::INTS);
            put_len(buf, values.len())?;
            for &v in values {
                put_i32(buf, v);
            }
        }
        Payload::Str(s) => {
            buf.push(payload_tag::STR);
            put_len(buf, s.len())?;
            buf.extend_from_slice(s.as_bytes());
        }
    }
    Ok(())
}

fn frame(kind: u8, seq: u32, body: Vec<u8>) -> Result<Vec<u8>> {
    if body.len() > MAX_PAYLOAD as usize {
        return Err(OwlError::InvalidFrame(format!(
            "payload too large ({} bytes)",
            body.len()
        )));
    }
    let header = Header {
        kind,
        seq,
        len: body.len() as u32,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Encode a request into a complete frame.
pub fn encode_request(seq: u32, request: &Request) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    match request {
        Request::Init { flags } => put_u32(&mut body, flags.bits()),
        Request::Command(cmd) => {
            put_target(&mut body, cmd.target);
            put_u32(&mut body, cmd.param.raw());
            put_payload(&mut body, &cmd.payload)?;
        }
        Request::GetMarkers { capacity }
        | Request::GetRigids { capacity }
        | Request::GetCameras { capacity } => put_u32(&mut body, *capacity),
        Request::GetValue { param, kind } => {
            put_u32(&mut body, param.raw());
            body.push(*kind as u8);
        }
        Request::Done | Request::Sync | Request::PeekEvent | Request::GetEvent => {}
    }
    frame(request.kind(), seq, body)
}

/// Encode a response into a complete frame.
pub fn encode_response(seq: u32, response: &Response) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    match response {
        Response::InitAck { accepted, flags } => {
            body.push(*accepted as u8);
            put_u32(&mut body, flags.bits());
        }
        Response::Status { ok, error } => {
            body.push(*ok as u8);
            put_u32(&mut body, error.raw());
        }
        Response::Event { error, event } => {
            put_u32(&mut body, error.raw());
            put_i32(&mut body, event.kind);
            put_i32(&mut body, event.frame);
        }
        Response::Markers { error, samples } => {
            put_u32(&mut body, error.raw());
            put_u32(&mut body, samples.len() as u32);
            for s in samples {
                put_i32(&mut body, s.id);
                put_i32(&mut body, s.frame);
                put_f32(&mut body, s.x);
                put_f32(&mut body, s.y);
                put_f32(&mut body, s.z);
                put_f32(&mut body, s.confidence);
                put_u32(&mut body, s.flags);
            }
        }
        Response::Rigids { error, samples } => {
            put_u32(&mut body, error.raw());
            put_u32(&mut body, samples.len() as u32);
            for s in samples {
                put_i32(&mut body, s.id);
                put_i32(&mut body, s.frame);
                put_pose(&mut body, &s.pose);
                put_f32(&mut body, s.confidence);
                put_u32(&mut body, s.flags);
            }
        }
        Response::Cameras { error, samples } => {
            put_u32(&mut body, error.raw());
            put_u32(&mut body, samples.len() as u32);
            for s in samples {
                put_i32(&mut body, s.id);
                put_pose(&mut body, &s.pose);
                put_f32(&mut body, s.confidence);
                put_u32(&mut body, s.flags);
            }
        }
        Response::Value { error, value } => {
            put_u32(&mut body, error.raw());
            put_payload(&mut body, value)?;
        }
    }
    frame(response.kind(), seq, body)
}

// -- decoding --

/// Bounds-checked little-endian cursor over a payload.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        if end > self.data.len() {
            return Err(OwlError::InvalidFrame(format!(
                "truncated payload: need {} bytes at offset {}, have {}",
                N,
                self.pos,
                self.data.len()
            )));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    fn pose(&mut self) -> Result<Pose> {
        let mut pose = [0f32; 7];
        for v in pose.iter_mut() {
            *v = self.f32()?;
        }
        Ok(pose)
    }

    fn error_code(&mut self) -> Result<ErrorCode> {
        let raw = self.u32()?;
        ErrorCode::from_raw(raw)
            .ok_or_else(|| OwlError::InvalidFrame(format!("unknown error code 0x{:04x}", raw)))
    }

    fn param(&mut self) -> Result<Param> {
        let raw = self.u32()?;
        Param::from_raw(raw)
            .ok_or_else(|| OwlError::InvalidFrame(format!("unknown parameter 0x{:04x}", raw)))
    }

    fn target(&mut self) -> Result<Target> {
        let tag = self.u8()?;
        let id = self.i32()?;
        match tag {
            target_tag::GLOBAL => Ok(Target::Global),
            target_tag::TRACKER => Ok(Target::Tracker(id)),
            target_tag::MARKER => Ok(Target::Marker(MarkerId(id))),
            other => Err(OwlError::InvalidFrame(format!("unknown target tag {}", other))),
        }
    }

    fn payload(&mut self) -> Result<Payload> {
        match self.u8()? {
            payload_tag::NONE => Ok(Payload::None),
            payload_tag::FLOAT => Ok(Payload::Float(self.f32()?)),
            payload_tag::INT => Ok(Payload::Int(self.i32()?)),
            payload_tag::FLOATS => {
                let n = self.u16()? as usize;
                (0..n).map(|_| self.f32()).collect::<Result<_>>().map(Payload::Floats)
            }
            payload_tag::INTS => {
                let n = self.u16()? as usize;
                (0..n).map(|_| self.i32()).collect::<Result<_>>().map(Payload::Ints)
            }
            payload_tag::STR => {
                let n = self.u16()? as usize;
                let end = self.pos + n;
                if end > self.data.len() {
                    return Err(OwlError::InvalidFrame("truncated string".into()));
                }
                let s = String::from_utf8_lossy(&self.data[self.pos..end]).into_owned();
                self.pos = end;
                Ok(Payload::Str(s))
            }
            other => Err(OwlError::InvalidFrame(format!("unknown payload tag {}", other))),
        }
    }

    /// Sample count, checked against the bytes actually present.
    fn count(&mut self, sample_size: usize) -> Result<usize> {
        let n = self.u32()? as usize;
        let remaining = self.data.len() - self.pos;
        if n.saturating_mul(sample_size) > remaining {
            return Err(OwlError::InvalidFrame(format!(
                "{} samples do not fit in {} bytes",
                n, remaining
            )));
        }
        Ok(n)
    }
}

/// Decode a request payload of the given kind.
pub fn decode_request(kind: u8, payload: &[u8]) -> Result<Request> {
    let mut c = Cursor::new(payload);
    let request = match kind {
        kind::INIT => Request::Init {
            flags: InitFlags::from_bits_retain(c.u32()?),
        },
        kind::DONE => Request::Done,
        kind::COMMAND => {
            let target = c.target()?;
            let param = c.param()?;
            let payload = c.payload()?;
            Request::Command(Command::new(target, param, payload))
        }
        kind::SYNC => Request::Sync,
        kind::PEEK_EVENT => Request::PeekEvent,
        kind::GET_EVENT => Request::GetEvent,
        kind::GET_MARKERS => Request::GetMarkers { capacity: c.u32()? },
        kind::GET_RIGIDS => Request::GetRigids { capacity: c.u32()? },
        kind::GET_CAMERAS => Request::GetCameras { capacity: c.u32()? },
        kind::GET_VALUE => {
            let param = c.param()?;
            let raw = c.u8()?;
            let kind = ValueKind::from_raw(raw)
                .ok_or_else(|| OwlError::InvalidFrame(format!("unknown value kind {}", raw)))?;
            Request::GetValue { param, kind }
        }
        other => {
            return Err(OwlError::InvalidFrame(format!(
                "unknown request kind 0x{:02x}",
                other
            )))
        }
    };
    Ok(request)
}

/// Decode a response payload of the given kind.
pub fn decode_response(kind: u8, payload: &[u8]) -> Result<Response> {
    let mut c = Cursor::new(payload);
    let response = match kind {
        kind::INIT_ACK => Response::InitAck {
            accepted: c.u8()? != 0,
            flags: InitFlags::from_bits_retain(c.u32()?),
        },
        kind::STATUS => Response::Status {
            ok: c.u8()? != 0,
            error: c.error_code()?,
        },
        kind::EVENT => Response::Event {
            error: c.error_code()?,
            event: Event {
                kind: c.i32()?,
                frame: c.i32()?,
            },
        },
        kind::MARKERS => {
            let error = c.error_code()?;
            let n = c.count(MARKER_SAMPLE_SIZE)?;
            let mut samples = Vec::with_capacity(n);
            for _ in 0..n {
                samples.push(MarkerSample {
                    id: c.i32()?,
                    frame: c.i32()?,
                    x: c.f32()?,
                    y: c.f32()?,
                    z: c.f32()?,
                    confidence: c.f32()?,
                    flags: c.u32()?,
                });
            }
            Response::Markers { error, samples }
        }
        kind::RIGIDS => {
            let error = c.error_code()?;
            let n = c.count(RIGID_SAMPLE_SIZE)?;
            let mut samples = Vec::with_capacity(n);
            for _ in 0..n {
                samples.push(RigidSample {
                    id: c.i32()?,
                    frame: c.i32()?,
                    pose: c.pose()?,
                    confidence: c.f32()?,
                    flags: c.u32()?,
                });
            }
            Response::Rigids { error, samples }
        }
        kind::CAMERAS => {
            let error = c.error_code()?;
            let n = c.count(CAMERA_SAMPLE_SIZE)?;
            let mut samples = Vec::with_capacity(n);
            for _ in 0..n {
                samples.push(CameraSample {
                    id: c.i32()?,
                    pose: c.pose()?,
                    confidence: c.f32()?,
                    flags: c.u32()?,
                });
            }
            Response::Cameras { error, samples }
        }
        kind::VALUE => Response::Value {
            error: c.error_code()?,
            value: c.payload()?,
        },
        other => {
            return Err(OwlError::InvalidFrame(format!(
                "unknown response kind 0x{:02x}",
                other
            )))
        }
    };
    Ok(response)
}

/// Read one complete frame. A clean end of stream before the header is
/// reported as [`OwlError::ConnectionClosed`].
pub fn read_frame<R: Read>(reader: &mut R) -> Result<(Header, Vec<u8>)> {
    let mut head = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut head) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(OwlError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let header = Header::decode(&head)?;
    let mut payload = vec![0u8; header.len as usize];
    reader.read_exact(&mut payload).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => OwlError::ConnectionClosed,
        _ => OwlError::Io(e),
    })?;
    Ok((header, payload))
}

/// Write one complete, already encoded frame.
pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame)?;
    writer.flush()?;
    Ok(())
}

//! Minimal in-process tracking server.
//!
//! Speaks the framing in [`crate::protocol`] over TCP on localhost and
//! models the server behaviour clients rely on: trackers and markers must be
//! created before use, markers are only added to disabled trackers, command
//! errors are held until the next status request, and a frame clock driven
//! by the streaming frequency decides when a poll sees fresh data.
//!
//! Intended for tests and demos without tracking hardware.

use crate::command::Command;
use crate::protocol::{self, kind, Request, Response, ValueKind};
use crate::types::{
    CameraSample, CaptureMode, ErrorCode, Event, EventKind, InitFlags, MarkerSample, Param,
    Payload, Pose, RigidSample, Target, TrackerKind, IDENTITY_POSE, MAX_FREQUENCY,
};
use crate::{OwlError, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Behaviour knobs for [`SimServer`].
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Reported by `Param::Version`.
    pub version: String,
    /// Number of static cameras reported.
    pub cameras: usize,
    /// Stop the frame clock and raise a `Done` event at this frame, the way
    /// a replayed capture file ends.
    pub done_after_frames: Option<i32>,
    /// Init flags the server refuses.
    pub reject_flags: InitFlags,
    /// Streaming frequency before the client sets one.
    pub default_frequency: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            version: format!("owl-sim {}", env!("CARGO_PKG_VERSION")),
            cameras: 4,
            done_after_frames: None,
            reject_flags: InitFlags::empty(),
            default_frequency: 480.0,
        }
    }
}

/// Shared switches for a running [`SimServer`].
#[derive(Debug, Clone)]
pub struct SimHandle {
    paused: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl SimHandle {
    /// Stop answering requests until [`SimHandle::resume`]. Requests are
    /// still read and answered later, in order.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn wait_while_paused(&self) {
        while self.is_paused() && !self.is_shutdown() {
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

/// A simulated server listening on `127.0.0.1`.
pub struct SimServer {
    addr: SocketAddr,
    handle: SimHandle,
    connections: Arc<Mutex<Vec<TcpStream>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SimServer {
    /// Bind an ephemeral localhost port and start accepting sessions.
    pub fn start(config: SimConfig) -> Result<SimServer> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let handle = SimHandle {
            paused: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        let connections = Arc::new(Mutex::new(Vec::new()));

        let accept_handle = handle.clone();
        let accept_connections = connections.clone();
        let thread = std::thread::Builder::new()
            .name("owl-sim-accept".into())
            .spawn(move || accept_loop(listener, config, accept_handle, accept_connections))?;

        log::info!("Simulated server listening on {}", addr);

        Ok(SimServer {
            addr,
            handle,
            connections,
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address string suitable for [`Session::open`](crate::Session::open).
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }

    /// Drop every client connection and stop accepting new ones.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.shutdown.store(true, Ordering::Release);
        if let Ok(mut conns) = self.connections.lock() {
            for conn in conns.drain(..) {
                let _ = conn.shutdown(Shutdown::Both);
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    config: SimConfig,
    handle: SimHandle,
    connections: Arc<Mutex<Vec<TcpStream>>>,
) {
    while !handle.is_shutdown() {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("sim: client connected from {}", peer);
                if let Err(e) = stream.set_nonblocking(false) {
                    log::warn!("sim: cannot make {} blocking: {}", peer, e);
                    continue;
                }
                if let (Ok(clone), Ok(mut conns)) = (stream.try_clone(), connections.lock()) {
                    conns.push(clone);
                }
                let config = config.clone();
                let handle = handle.clone();
                let spawned = std::thread::Builder::new()
                    .name("owl-sim-conn".into())
                    .spawn(move || serve_connection(stream, config, handle));
                if let Err(e) = spawned {
                    log::warn!("sim: failed to spawn connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                log::warn!("sim: accept error: {}", e);
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }
    log::debug!("sim: accept loop stopped");
}

fn serve_connection(mut stream: TcpStream, config: SimConfig, handle: SimHandle) {
    let mut server = SimSession::new(config);

    loop {
        let (header, payload) = match protocol::read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(OwlError::ConnectionClosed) => break,
            Err(e) => {
                if !handle.is_shutdown() {
                    log::debug!("sim: connection ended: {}", e);
                }
                break;
            }
        };

        handle.wait_while_paused();
        if handle.is_shutdown() {
            break;
        }

        let request = match protocol::decode_request(header.kind, &payload) {
            Ok(request) => request,
            Err(e) if header.kind == kind::COMMAND => {
                log::debug!("sim: undecodable command: {}", e);
                server.fail(ErrorCode::InvalidEnum);
                continue;
            }
            Err(e) => {
                log::warn!("sim: dropping client after bad request: {}", e);
                break;
            }
        };

        if request == Request::Done {
            log::debug!("sim: client done");
            break;
        }

        if let Some(response) = server.handle(request) {
            let written = protocol::encode_response(header.seq, &response)
                .and_then(|frame| protocol::write_frame(&mut stream, &frame));
            if let Err(e) = written {
                log::debug!("sim: write failed: {}", e);
                break;
            }
        }
    }

    let _ = stream.shutdown(Shutdown::Both);
}

#[derive(Debug, Clone)]
struct SimMarker {
    led: i32,
    position: Option<[f32; 3]>,
}

#[derive(Debug, Clone)]
struct SimTracker {
    kind: TrackerKind,
    enabled: bool,
    markers: BTreeMap<i32, SimMarker>,
}

/// Server-side state of one client session.
struct SimSession {
    config: SimConfig,
    flags: InitFlags,
    initialized: bool,
    trackers: BTreeMap<i32, SimTracker>,
    settings: HashMap<Param, Payload>,
    frequency: f32,
    interpolation: i32,
    custom_string: String,
    transform: Pose,
    /// Last error since the previous status request.
    batch_error: Option<ErrorCode>,
    clock: FrameClock,
    last_marker_frame: i32,
    last_rigid_frame: i32,
    events: VecDeque<Event>,
    done_raised: bool,
}

/// Frame counter that advances at the streaming frequency while streaming.
struct FrameClock {
    running_since: Option<Instant>,
    frequency: f32,
    /// Frames counted before the current run.
    base: i32,
}

impl FrameClock {
    fn current(&self) -> i32 {
        match self.running_since {
            Some(since) => {
                let run = (since.elapsed().as_secs_f64() * self.frequency as f64) as i64;
                self.base
                    .saturating_add((run.min(i32::MAX as i64) as i32).saturating_add(1))
            }
            None => self.base,
        }
    }

    fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        self.base = self.current();
        self.running_since = None;
    }

    fn set_frequency(&mut self, frequency: f32) {
        let running = self.running_since.is_some();
        self.stop();
        self.frequency = frequency;
        if running {
            self.start();
        }
    }
}

impl SimSession {
    fn new(config: SimConfig) -> Self {
        let frequency = config.default_frequency;
        Self {
            config,
            flags: InitFlags::empty(),
            initialized: false,
            trackers: BTreeMap::new(),
            settings: HashMap::new(),
            frequency,
            interpolation: 0,
            custom_string: String::new(),
            transform: IDENTITY_POSE,
            batch_error: None,
            clock: FrameClock {
                running_since: None,
                frequency,
                base: 0,
            },
            last_marker_frame: 0,
            last_rigid_frame: 0,
            events: VecDeque::new(),
            done_raised: false,
        }
    }

    fn fail(&mut self, code: ErrorCode) {
        log::debug!("sim: command failed: {}", code);
        self.batch_error = Some(code);
    }

    fn handle(&mut self, request: Request) -> Option<Response> {
        if let Request::Init { flags } = request {
            return Some(self.init(flags));
        }
        if !self.initialized {
            return match request {
                Request::Command(_) => {
                    self.fail(ErrorCode::InvalidOperation);
                    None
                }
                other => Some(error_response(&other, ErrorCode::InvalidOperation)),
            };
        }

        self.tick();
        match request {
            Request::Init { .. } | Request::Done => None,
            Request::Command(cmd) => {
                if let Err(code) = self.apply(&cmd) {
                    self.fail(code);
                }
                None
            }
            Request::Sync => {
                let error = self.batch_error.take().unwrap_or(ErrorCode::NoError);
                Some(Response::Status {
                    ok: !error.is_error(),
                    error,
                })
            }
            Request::PeekEvent => Some(Response::Event {
                error: ErrorCode::NoError,
                event: self.events.front().copied().unwrap_or(Event::NONE),
            }),
            Request::GetEvent => Some(Response::Event {
                error: ErrorCode::NoError,
                event: self.events.pop_front().unwrap_or(Event::NONE),
            }),
            Request::GetMarkers { capacity } => Some(Response::Markers {
                error: ErrorCode::NoError,
                samples: self.markers(capacity as usize),
            }),
            Request::GetRigids { capacity } => Some(Response::Rigids {
                error: ErrorCode::NoError,
                samples: self.rigids(capacity as usize),
            }),
            Request::GetCameras { capacity } => Some(Response::Cameras {
                error: ErrorCode::NoError,
                samples: self.cameras(capacity as usize),
            }),
            Request::GetValue { param, kind } => Some(match self.value(param, kind) {
                Ok(value) => Response::Value {
                    error: ErrorCode::NoError,
                    value,
                },
                Err(error) => Response::Value {
                    error,
                    value: Payload::None,
                },
            }),
        }
    }

    fn init(&mut self, flags: InitFlags) -> Response {
        let unknown = flags.bits() & !InitFlags::all().bits();
        let accepted = unknown == 0
            && flags.mode().is_ok()
            && !flags.intersects(self.config.reject_flags);
        if accepted {
            self.flags = flags;
            self.initialized = true;
            log::debug!("sim: session initialized (flags=0x{:04x})", flags.bits());
        } else {
            log::debug!("sim: rejecting init flags 0x{:04x}", flags.bits());
        }
        Response::InitAck { accepted, flags }
    }

    fn calibrating(&self) -> bool {
        matches!(
            self.flags.mode(),
            Ok(Some(CaptureMode::Calib | CaptureMode::CalibPlanar))
        )
    }

    fn streaming(&self) -> bool {
        self.clock.running_since.is_some()
    }

    /// Cap the clock at the configured end frame and raise `Done` once.
    fn tick(&mut self) {
        let Some(end) = self.config.done_after_frames else {
            return;
        };
        if self.done_raised || self.clock.current() < end {
            return;
        }
        self.clock.running_since = None;
        self.clock.base = end;
        self.done_raised = true;
        self.events.push_back(Event {
            kind: EventKind::Done as i32,
            frame: end,
        });
        log::debug!("sim: replay finished at frame {}", end);
    }

    fn apply(&mut self, cmd: &Command) -> std::result::Result<(), ErrorCode> {
        match cmd.target {
            Target::Global => self.apply_global(cmd.param, &cmd.payload),
            Target::Tracker(id) => self.apply_tracker(id, cmd.param, &cmd.payload),
            Target::Marker(id) => {
                self.apply_marker(id.tracker(), id.index(), cmd.param, &cmd.payload)
            }
        }
    }

    fn apply_global(
        &mut self,
        param: Param,
        payload: &Payload,
    ) -> std::result::Result<(), ErrorCode> {
        match (param, payload) {
            (Param::Frequency, Payload::Float(hz)) => {
                if !(*hz > 0.0 && *hz <= MAX_FREQUENCY) {
                    return Err(ErrorCode::InvalidValue);
                }
                self.frequency = *hz;
                self.clock.set_frequency(*hz);
                Ok(())
            }
            (Param::Streaming, Payload::Int(raw)) => {
                match Param::from_raw(*raw as u32) {
                    Some(Param::Enable) => self.clock.start(),
                    Some(Param::Disable) => self.clock.stop(),
                    _ if *raw == 1 => self.clock.start(),
                    _ if *raw == 0 => self.clock.stop(),
                    _ => return Err(ErrorCode::InvalidEnum),
                }
                Ok(())
            }
            (Param::Interpolation, Payload::Int(frames)) => {
                if *frames < 0 {
                    return Err(ErrorCode::InvalidValue);
                }
                self.interpolation = *frames;
                Ok(())
            }
            (Param::CustomString, Payload::Str(s)) => {
                self.custom_string = s.clone();
                Ok(())
            }
            (Param::Transform, Payload::Floats(values)) if values.len() == 7 => {
                self.transform.copy_from_slice(values);
                Ok(())
            }
            (
                Param::Frequency
                | Param::Streaming
                | Param::Interpolation
                | Param::CustomString
                | Param::Transform,
                _,
            ) => Err(ErrorCode::InvalidValue),
            (p, Payload::Int(_) | Payload::Float(_)) if is_global_setting(p) => {
                self.settings.insert(p, payload.clone());
                Ok(())
            }
            (p, _) if is_global_setting(p) => Err(ErrorCode::InvalidValue),
            _ => Err(ErrorCode::InvalidEnum),
        }
    }

    fn apply_tracker(
        &mut self,
        id: i32,
        param: Param,
        payload: &Payload,
    ) -> std::result::Result<(), ErrorCode> {
        if param == Param::Create {
            let kind = match payload {
                Payload::Int(raw) => Param::from_raw(*raw as u32).and_then(TrackerKind::from_param),
                _ => None,
            }
            .ok_or(ErrorCode::InvalidEnum)?;
            if self.trackers.contains_key(&id) {
                return Err(ErrorCode::InvalidOperation);
            }
            self.trackers.insert(
                id,
                SimTracker {
                    kind,
                    enabled: false,
                    markers: BTreeMap::new(),
                },
            );
            return Ok(());
        }

        if param == Param::Destroy {
            return self
                .trackers
                .remove(&id)
                .map(|_| ())
                .ok_or(ErrorCode::InvalidOperation);
        }

        let calibrating = self.calibrating();
        let tracker = self.trackers.get_mut(&id).ok_or(ErrorCode::InvalidOperation)?;
        match param {
            Param::Enable => tracker.enabled = true,
            Param::Disable => tracker.enabled = false,
            Param::SetFilter => {}
            Param::CalibReset
            | Param::CalibLoad
            | Param::CalibSave
            | Param::Calibrate
            | Param::Recalibrate
            | Param::CaptureReset
            | Param::CaptureStart
            | Param::CaptureStop
            | Param::CalibActive => {
                let calib_tracker =
                    matches!(tracker.kind, TrackerKind::Calib | TrackerKind::CalibPlanar);
                if !calib_tracker || !calibrating {
                    return Err(ErrorCode::InvalidOperation);
                }
            }
            p if is_feature(p) => {}
            _ => return Err(ErrorCode::InvalidEnum),
        }
        Ok(())
    }

    fn apply_marker(
        &mut self,
        tracker_id: i32,
        index: i32,
        param: Param,
        payload: &Payload,
    ) -> std::result::Result<(), ErrorCode> {
        let tracker = self
            .trackers
            .get_mut(&tracker_id)
            .ok_or(ErrorCode::InvalidOperation)?;
        match (param, payload) {
            (Param::SetLed, Payload::Int(led)) => {
                if *led < 0 {
                    return Err(ErrorCode::InvalidValue);
                }
                if tracker.enabled {
                    return Err(ErrorCode::InvalidOperation);
                }
                tracker.markers.insert(
                    index,
                    SimMarker {
                        led: *led,
                        position: None,
                    },
                );
                Ok(())
            }
            (Param::SetPosition, Payload::Floats(p)) if p.len() == 3 => {
                let marker = tracker
                    .markers
                    .get_mut(&index)
                    .ok_or(ErrorCode::InvalidOperation)?;
                marker.position = Some([p[0], p[1], p[2]]);
                Ok(())
            }
            (Param::ClearMarker, _) => {
                if tracker.enabled {
                    return Err(ErrorCode::InvalidOperation);
                }
                tracker
                    .markers
                    .remove(&index)
                    .map(|_| ())
                    .ok_or(ErrorCode::InvalidOperation)
            }
            (Param::SetLed | Param::SetPosition, _) => Err(ErrorCode::InvalidValue),
            _ => Err(ErrorCode::InvalidEnum),
        }
    }

    /// Marker samples of enabled trackers, or nothing when no new frame has
    /// been produced since the last call.
    fn markers(&mut self, capacity: usize) -> Vec<MarkerSample> {
        let frame = self.clock.current();
        if capacity == 0 || frame == 0 || frame == self.last_marker_frame {
            return Vec::new();
        }
        self.last_marker_frame = frame;

        let t = self.seconds(frame);
        let mut samples = Vec::new();
        for (&tracker_id, tracker) in self.trackers.iter().filter(|(_, tr)| tr.enabled) {
            let body = rigid_pose(tracker_id, t);
            for (&index, marker) in &tracker.markers {
                let [x, y, z] = match (tracker.kind, marker.position) {
                    (TrackerKind::Rigid, Some(p)) => apply_pose(&body, p),
                    _ => orbit(tracker_id, marker.led, t),
                };
                samples.push(MarkerSample {
                    id: crate::id::encode_marker(tracker_id, index),
                    frame,
                    x,
                    y,
                    z,
                    confidence: 1.0,
                    flags: 0,
                });
                if samples.len() == capacity {
                    return samples;
                }
            }
        }
        samples
    }

    fn rigids(&mut self, capacity: usize) -> Vec<RigidSample> {
        let frame = self.clock.current();
        if capacity == 0 || frame == 0 || frame == self.last_rigid_frame {
            return Vec::new();
        }
        self.last_rigid_frame = frame;

        let t = self.seconds(frame);
        self.trackers
            .iter()
            .filter(|(_, tr)| tr.enabled && tr.kind == TrackerKind::Rigid)
            .take(capacity)
            .map(|(&id, _)| RigidSample {
                id,
                frame,
                pose: rigid_pose(id, t),
                confidence: 1.0,
                flags: 0,
            })
            .collect()
    }

    fn cameras(&self, capacity: usize) -> Vec<CameraSample> {
        let n = self.config.cameras;
        (0..n)
            .take(capacity)
            .map(|i| {
                let angle = std::f32::consts::TAU * i as f32 / n as f32;
                let half = (angle + std::f32::consts::PI) / 2.0;
                CameraSample {
                    id: i as i32,
                    // On a 3 m circle, 2.5 m up, turned to face the centre.
                    pose: [
                        3000.0 * angle.cos(),
                        2500.0,
                        3000.0 * angle.sin(),
                        half.cos(),
                        0.0,
                        half.sin(),
                        0.0,
                    ],
                    confidence: 1.0,
                    flags: 0,
                }
            })
            .collect()
    }

    fn value(&self, param: Param, kind: ValueKind) -> std::result::Result<Payload, ErrorCode> {
        let value = match param {
            Param::Version => Payload::Str(self.config.version.clone()),
            Param::StatusString => Payload::Str(format!(
                "trackers={} streaming={} frame={}",
                self.trackers.len(),
                self.streaming(),
                self.clock.current()
            )),
            Param::CustomString => Payload::Str(self.custom_string.clone()),
            Param::FrameNumber => Payload::Int(self.clock.current()),
            Param::Frequency => Payload::Float(self.frequency),
            Param::Interpolation => Payload::Int(self.interpolation),
            Param::Streaming => {
                let verb = if self.streaming() { Param::Enable } else { Param::Disable };
                Payload::param(verb)
            }
            Param::Transform => Payload::Floats(self.transform.to_vec()),
            Param::CalibStatus | Param::CalibError => {
                if !self.calibrating() {
                    return Err(ErrorCode::InvalidOperation);
                }
                match param {
                    Param::CalibStatus => Payload::Int(0),
                    _ => Payload::Float(0.0),
                }
            }
            p => self.settings.get(&p).cloned().ok_or(ErrorCode::InvalidEnum)?,
        };

        let matches_kind = matches!(
            (kind, &value),
            (ValueKind::Float, Payload::Float(_) | Payload::Floats(_))
                | (ValueKind::Int, Payload::Int(_) | Payload::Ints(_))
                | (ValueKind::Str, Payload::Str(_))
        );
        if matches_kind {
            Ok(value)
        } else {
            Err(ErrorCode::InvalidEnum)
        }
    }

    fn seconds(&self, frame: i32) -> f32 {
        if self.frequency > 0.0 {
            frame as f32 / self.frequency
        } else {
            0.0
        }
    }
}

fn is_feature(param: Param) -> bool {
    (Param::Feature0.raw()..=Param::FeatureLast.raw()).contains(&param.raw())
}

fn is_global_setting(param: Param) -> bool {
    matches!(
        param,
        Param::Broadcast
            | Param::Events
            | Param::Buttons
            | Param::Markers
            | Param::Rigids
            | Param::CommData
            | Param::Timestamp
            | Param::Planes
            | Param::Detectors
            | Param::Images
            | Param::Cameras
            | Param::FrameBufferSize
            | Param::MarkerStats
            | Param::CameraStats
            | Param::MarkerCovariance
            | Param::HwConfig
    ) || is_feature(param)
}

fn error_response(request: &Request, error: ErrorCode) -> Response {
    match request {
        Request::Sync => Response::Status { ok: false, error },
        Request::PeekEvent | Request::GetEvent => Response::Event {
            error,
            event: Event::NONE,
        },
        Request::GetMarkers { .. } => Response::Markers {
            error,
            samples: Vec::new(),
        },
        Request::GetRigids { .. } => Response::Rigids {
            error,
            samples: Vec::new(),
        },
        Request::GetCameras { .. } => Response::Cameras {
            error,
            samples: Vec::new(),
        },
        Request::GetValue { .. } | Request::Init { .. } | Request::Done | Request::Command(_) => {
            Response::Value {
                error,
                value: Payload::None,
            }
        }
    }
}

/// Point-tracker marker: a slow circle in millimetres, one radius per LED.
fn orbit(tracker: i32, led: i32, t: f32) -> [f32; 3] {
    let radius = 200.0 + 10.0 * led as f32;
    let phase = std::f32::consts::TAU * 0.25 * t + 0.1 * led as f32;
    [
        radius * phase.cos() + 500.0 * tracker as f32,
        1000.0 + 5.0 * led as f32,
        radius * phase.sin(),
    ]
}

/// Rigid body spinning about +Y while drifting along X.
fn rigid_pose(tracker: i32, t: f32) -> Pose {
    let half = std::f32::consts::TAU * 0.1 * t / 2.0;
    [
        100.0 * (0.5 * t).sin() + 500.0 * tracker as f32,
        1200.0,
        0.0,
        half.cos(),
        0.0,
        half.sin(),
        0.0,
    ]
}

fn apply_pose(pose: &Pose, p: [f32; 3]) -> [f32; 3] {
    let mut t = crate::transform::ClientTransform::default();
    t.set_pose(*pose);
    t.apply_point(p)
}

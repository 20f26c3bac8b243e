use crate::id::MarkerId;
use std::collections::BTreeMap;

/// Maximum streaming frequency accepted by the server, in Hz.
pub const MAX_FREQUENCY: f32 = 960.0;

/// Position + scalar-first quaternion: `[x, y, z, s, qx, qy, qz]`.
pub type Pose = [f32; 7];

/// The identity pose.
pub const IDENTITY_POSE: Pose = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0];

/// One tracked marker in one frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarkerSample {
    /// Encoded marker id, see [`MarkerId`].
    pub id: i32,
    pub frame: i32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Quality score. Negative when the marker is not currently seen.
    pub confidence: f32,
    pub flags: u32,
}

impl MarkerSample {
    pub fn marker_id(&self) -> MarkerId {
        MarkerId(self.id)
    }

    pub fn position(&self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn is_visible(&self) -> bool {
        self.confidence > 0.0
    }
}

/// Rigid-body pose in one frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidSample {
    /// Tracker id of the rigid body.
    pub id: i32,
    pub frame: i32,
    pub pose: Pose,
    pub confidence: f32,
    pub flags: u32,
}

impl Default for RigidSample {
    fn default() -> Self {
        Self {
            id: 0,
            frame: 0,
            pose: IDENTITY_POSE,
            confidence: 0.0,
            flags: 0,
        }
    }
}

impl RigidSample {
    pub fn is_visible(&self) -> bool {
        self.confidence > 0.0
    }
}

/// Pose of one camera.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSample {
    pub id: i32,
    pub pose: Pose,
    pub confidence: f32,
    pub flags: u32,
}

impl Default for CameraSample {
    fn default() -> Self {
        Self {
            id: 0,
            pose: IDENTITY_POSE,
            confidence: 0.0,
            flags: 0,
        }
    }
}

/// Known out-of-band event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EventKind {
    /// The server ended the session (end of replay file, shutdown, ...).
    Done = 0x0002,
}

impl EventKind {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0x0002 => Some(EventKind::Done),
            _ => None,
        }
    }
}

/// Out-of-band notification. `kind == 0` means no event is pending.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Event {
    pub kind: i32,
    pub frame: i32,
}

impl Event {
    pub const NONE: Event = Event { kind: 0, frame: 0 };

    pub fn is_none(&self) -> bool {
        self.kind == 0
    }

    pub fn known_kind(&self) -> Option<EventKind> {
        EventKind::from_raw(self.kind)
    }

    pub fn is_done(&self) -> bool {
        self.known_kind() == Some(EventKind::Done)
    }
}

/// Error codes reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ErrorCode {
    #[default]
    NoError = 0x0000,
    InvalidValue = 0x0020,
    InvalidEnum = 0x0021,
    InvalidOperation = 0x0022,
}

impl ErrorCode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x0000 => Some(ErrorCode::NoError),
            0x0020 => Some(ErrorCode::InvalidValue),
            0x0021 => Some(ErrorCode::InvalidEnum),
            0x0022 => Some(ErrorCode::InvalidOperation),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    pub fn is_error(self) -> bool {
        self != ErrorCode::NoError
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::NoError => "no error",
            ErrorCode::InvalidValue => "invalid value",
            ErrorCode::InvalidEnum => "invalid enum",
            ErrorCode::InvalidOperation => "invalid operation",
        };
        write!(f, "{} (0x{:04x})", name, self.raw())
    }
}

bitflags::bitflags! {
    /// Session initialization flags.
    ///
    /// The low bits are independent options. Bits `0x0F00` hold a capture
    /// mode selector; use [`InitFlags::mode`] rather than testing them
    /// individually.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(C)]
    pub struct InitFlags: u32 {
        const SLAVE        = 0x0001;
        const FILE         = 0x0002;
        const ASYNC        = 0x0008;
        const POSTPROCESS  = 0x0010;
        const MODE1        = 0x0100;
        const MODE2        = 0x0200;
        const MODE3        = 0x0300;
        const MODE4        = 0x0400;
        const LASER        = 0x0A00;
        const CALIB        = 0x0C00;
        const DIAGNOSTIC   = 0x0D00;
        const CALIBPLANAR  = 0x0F00;
    }
}

/// Capture mode selector stored in bits `0x0F00` of [`InitFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CaptureMode {
    Mode1 = 0x0100,
    Mode2 = 0x0200,
    Mode3 = 0x0300,
    Mode4 = 0x0400,
    Laser = 0x0A00,
    Calib = 0x0C00,
    Diagnostic = 0x0D00,
    CalibPlanar = 0x0F00,
}

impl InitFlags {
    pub const MODE_MASK: u32 = 0x0F00;

    /// Decoded capture mode, `None` when no mode is selected.
    ///
    /// `Err` carries the raw selector when it names no known mode.
    pub fn mode(self) -> std::result::Result<Option<CaptureMode>, u32> {
        match self.bits() & Self::MODE_MASK {
            0 => Ok(None),
            0x0100 => Ok(Some(CaptureMode::Mode1)),
            0x0200 => Ok(Some(CaptureMode::Mode2)),
            0x0300 => Ok(Some(CaptureMode::Mode3)),
            0x0400 => Ok(Some(CaptureMode::Mode4)),
            0x0A00 => Ok(Some(CaptureMode::Laser)),
            0x0C00 => Ok(Some(CaptureMode::Calib)),
            0x0D00 => Ok(Some(CaptureMode::Diagnostic)),
            0x0F00 => Ok(Some(CaptureMode::CalibPlanar)),
            other => Err(other),
        }
    }

    /// Replace the capture mode selector.
    pub fn with_mode(self, mode: CaptureMode) -> Self {
        Self::from_bits_retain((self.bits() & !Self::MODE_MASK) | mode as u32)
    }
}

macro_rules! params {
    ($($(#[$doc:meta])* $name:ident = $value:literal,)*) => {
        /// Closed set of parameter names, verbs and selectors understood by
        /// the server. Raw values are only used on the wire.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum Param {
            $($(#[$doc])* $name = $value,)*
        }

        impl Param {
            /// Every known parameter, in declaration order.
            pub const ALL: &'static [Param] = &[$(Param::$name,)*];

            pub fn from_raw(raw: u32) -> Option<Param> {
                match raw {
                    $($value => Some(Param::$name),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Param::$name => stringify!($name),)*
                }
            }
        }
    };
}

params! {
    // Lifecycle verbs
    Create = 0x0100,
    Destroy = 0x0101,
    Enable = 0x0102,
    Disable = 0x0103,

    // Global settings
    /// Streaming rate in Hz, at most [`MAX_FREQUENCY`].
    Frequency = 0x0200,
    Streaming = 0x0201,
    Interpolation = 0x0202,
    Broadcast = 0x0203,
    Events = 0x020F,
    Buttons = 0x0210,
    Markers = 0x0211,
    Rigids = 0x0212,
    CommData = 0x0220,
    Timestamp = 0x0221,
    Planes = 0x02A0,
    Detectors = 0x02A1,
    Images = 0x02A2,
    Cameras = 0x02A4,
    FrameBufferSize = 0x02B0,
    MarkerStats = 0x02D0,
    CameraStats = 0x02D1,
    MarkerCovariance = 0x02D5,
    HwConfig = 0x02F0,
    /// Camera transformation.
    Transform = 0xC200,

    // Tracker type selectors
    PointTracker = 0x0300,
    RigidTracker = 0x0301,
    PlanarTracker = 0x030A,
    SetFilter = 0x0310,

    // Undocumented tuning knobs
    /// Optical.
    Feature0 = 0x03F0,
    /// Offsets.
    Feature1 = 0x03F1,
    /// Projection.
    Feature2 = 0x03F2,
    /// Predicted.
    Feature3 = 0x03F3,
    /// Valid minimum.
    Feature4 = 0x03F4,
    /// Query minimum.
    Feature5 = 0x03F5,
    /// Store depth.
    Feature6 = 0x03F6,
    Feature7 = 0x03F7,
    /// Rejection.
    Feature8 = 0x03F8,
    /// Filtering.
    Feature9 = 0x03F9,
    /// Window size.
    Feature10 = 0x03FA,
    /// Least-squares cutoff.
    Feature11 = 0x03FB,
    /// Off-fill.
    Feature12 = 0x03FC,
    FeatureLast = 0x03FD,

    // Calibration only
    CalibTracker = 0x0C01,
    CalibReset = 0x0C10,
    CalibLoad = 0x0C11,
    CalibSave = 0x0C12,
    Calibrate = 0x0C13,
    Recalibrate = 0x0C14,
    CaptureReset = 0x0C20,
    CaptureStart = 0x0C21,
    CaptureStop = 0x0C22,
    CalibActive = 0x0C30,
    CalibPlanarTracker = 0x0CA1,

    // Marker verbs
    SetLed = 0x0400,
    SetPosition = 0x0401,
    ClearMarker = 0x0402,

    // Queries
    Version = 0x0500,
    FrameNumber = 0x0510,
    StatusString = 0x0520,
    CustomString = 0x05F0,
    CalibStatus = 0x0C51,
    CalibError = 0x0C52,
}

impl Param {
    pub fn raw(self) -> u32 {
        self as u32
    }
}

/// Tracker type passed as the payload of a `Create` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    Point,
    Rigid,
    Planar,
    Calib,
    CalibPlanar,
}

impl TrackerKind {
    pub fn param(self) -> Param {
        match self {
            TrackerKind::Point => Param::PointTracker,
            TrackerKind::Rigid => Param::RigidTracker,
            TrackerKind::Planar => Param::PlanarTracker,
            TrackerKind::Calib => Param::CalibTracker,
            TrackerKind::CalibPlanar => Param::CalibPlanarTracker,
        }
    }

    pub fn from_param(param: Param) -> Option<Self> {
        match param {
            Param::PointTracker => Some(TrackerKind::Point),
            Param::RigidTracker => Some(TrackerKind::Rigid),
            Param::PlanarTracker => Some(TrackerKind::Planar),
            Param::CalibTracker => Some(TrackerKind::Calib),
            Param::CalibPlanarTracker => Some(TrackerKind::CalibPlanar),
            _ => None,
        }
    }
}

/// What a command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Global,
    Tracker(i32),
    Marker(MarkerId),
}

/// Typed argument of a command, or the value of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Float(f32),
    Int(i32),
    Floats(Vec<f32>),
    Ints(Vec<i32>),
    Str(String),
}

impl Payload {
    /// Integer payload carrying a parameter name, e.g. `Streaming = Enable`.
    pub fn param(param: Param) -> Self {
        Payload::Int(param.raw() as i32)
    }

    pub fn as_floats(&self) -> Option<Vec<f32>> {
        match self {
            Payload::Float(v) => Some(vec![*v]),
            Payload::Floats(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<Vec<i32>> {
        match self {
            Payload::Int(v) => Some(vec![*v]),
            Payload::Ints(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Client-side mirror of a marker's requested configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerConfig {
    pub led: Option<i32>,
    pub position: Option<[f32; 3]>,
}

/// Client-side mirror of a tracker's requested configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerConfig {
    pub kind: Option<TrackerKind>,
    pub enabled: bool,
    pub markers: BTreeMap<i32, MarkerConfig>,
}

/// Configuration intent issued through a session.
///
/// Updated when commands are submitted, so it reflects what was asked for,
/// not what the server accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub connected: bool,
    pub scale: f32,
    /// Last requested streaming frequency. `0.0` until one is set.
    pub frequency: f32,
    pub streaming_enabled: bool,
    pub trackers: BTreeMap<i32, TrackerConfig>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connected: false,
            scale: 1.0,
            frequency: 0.0,
            streaming_enabled: false,
            trackers: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_raw_values_roundtrip() {
        for &p in Param::ALL {
            assert_eq!(Param::from_raw(p.raw()), Some(p), "{}", p.name());
        }
        assert_eq!(Param::Frequency.raw(), 0x0200);
        assert_eq!(Param::Transform.raw(), 0xC200);
        assert_eq!(Param::SetLed.raw(), 0x0400);
        assert_eq!(Param::from_raw(0x0999), None);
    }

    #[test]
    fn test_init_flags_mode() {
        let flags = InitFlags::SLAVE | InitFlags::POSTPROCESS;
        assert_eq!(flags.mode(), Ok(None));
        let flags = flags.with_mode(CaptureMode::Mode3);
        assert_eq!(flags.bits(), 0x0311);
        assert_eq!(flags.mode(), Ok(Some(CaptureMode::Mode3)));
        assert_eq!(InitFlags::CALIBPLANAR.mode(), Ok(Some(CaptureMode::CalibPlanar)));
        assert_eq!(InitFlags::from_bits_retain(0x0500).mode(), Err(0x0500));
    }

    #[test]
    fn test_error_code_raw() {
        assert_eq!(ErrorCode::from_raw(0x21), Some(ErrorCode::InvalidEnum));
        assert_eq!(ErrorCode::from_raw(0x23), None);
        assert!(!ErrorCode::NoError.is_error());
        assert!(ErrorCode::InvalidOperation.is_error());
    }

    #[test]
    fn test_event_kinds() {
        assert!(Event::NONE.is_none());
        let done = Event { kind: 0x2, frame: 10 };
        assert!(done.is_done());
        assert_eq!(Event { kind: 0x7, frame: 0 }.known_kind(), None);
    }

    #[test]
    fn test_tracker_kind_param() {
        for kind in [
            TrackerKind::Point,
            TrackerKind::Rigid,
            TrackerKind::Planar,
            TrackerKind::Calib,
            TrackerKind::CalibPlanar,
        ] {
            assert_eq!(TrackerKind::from_param(kind.param()), Some(kind));
        }
        assert_eq!(TrackerKind::from_param(Param::Frequency), None);
    }
}

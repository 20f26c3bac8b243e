use crate::id::MarkerId;
use crate::types::{Param, Payload, SessionState, Target, TrackerKind};

/// One client-to-server command.
///
/// Commands carry no reply. Whether the server accepted them is only known
/// after the next status barrier.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub target: Target,
    pub param: Param,
    pub payload: Payload,
}

impl Command {
    pub fn new(target: Target, param: Param, payload: Payload) -> Self {
        Self {
            target,
            param,
            payload,
        }
    }

    pub fn global(param: Param, payload: Payload) -> Self {
        Self::new(Target::Global, param, payload)
    }

    pub fn tracker(tracker: i32, param: Param, payload: Payload) -> Self {
        Self::new(Target::Tracker(tracker), param, payload)
    }

    pub fn marker(marker: MarkerId, param: Param, payload: Payload) -> Self {
        Self::new(Target::Marker(marker), param, payload)
    }

    /// Streaming rate in Hz. Values above the server maximum are forwarded
    /// unchanged and rejected by the server.
    pub fn set_frequency(hz: f32) -> Self {
        Self::global(Param::Frequency, Payload::Float(hz))
    }

    pub fn set_streaming(enabled: bool) -> Self {
        let verb = if enabled { Param::Enable } else { Param::Disable };
        Self::global(Param::Streaming, Payload::param(verb))
    }

    pub fn set_interpolation(frames: i32) -> Self {
        Self::global(Param::Interpolation, Payload::Int(frames))
    }

    pub fn set_string(param: Param, value: impl Into<String>) -> Self {
        Self::global(param, Payload::Str(value.into()))
    }

    pub fn create_tracker(tracker: i32, kind: TrackerKind) -> Self {
        Self::tracker(tracker, Param::Create, Payload::param(kind.param()))
    }

    pub fn destroy_tracker(tracker: i32) -> Self {
        Self::tracker(tracker, Param::Destroy, Payload::None)
    }

    pub fn enable_tracker(tracker: i32) -> Self {
        Self::tracker(tracker, Param::Enable, Payload::None)
    }

    pub fn disable_tracker(tracker: i32) -> Self {
        Self::tracker(tracker, Param::Disable, Payload::None)
    }

    pub fn set_filter(tracker: i32, values: &[f32]) -> Self {
        Self::tracker(tracker, Param::SetFilter, Payload::Floats(values.to_vec()))
    }

    /// Bind a physical LED to a marker slot.
    pub fn set_led(marker: MarkerId, led: i32) -> Self {
        Self::marker(marker, Param::SetLed, Payload::Int(led))
    }

    /// Fixed marker position inside a rigid body, in server units.
    pub fn set_marker_position(marker: MarkerId, position: [f32; 3]) -> Self {
        Self::marker(marker, Param::SetPosition, Payload::Floats(position.to_vec()))
    }

    pub fn clear_marker(marker: MarkerId) -> Self {
        Self::marker(marker, Param::ClearMarker, Payload::None)
    }

    /// Record this command's intent in the client-side configuration mirror.
    ///
    /// Commands addressed to trackers the mirror has never seen created are
    /// left for the server to reject.
    pub(crate) fn record(&self, state: &mut SessionState) {
        match (self.target, self.param, &self.payload) {
            (Target::Global, Param::Frequency, Payload::Float(hz)) => {
                state.frequency = *hz;
            }
            (Target::Global, Param::Streaming, Payload::Int(raw)) => {
                state.streaming_enabled = *raw != 0 && *raw != Param::Disable.raw() as i32;
            }
            (Target::Tracker(id), Param::Create, payload) => {
                let kind = match payload {
                    Payload::Int(raw) => Param::from_raw(*raw as u32).and_then(TrackerKind::from_param),
                    _ => None,
                };
                let entry = state.trackers.entry(id).or_default();
                entry.kind = kind;
                entry.enabled = false;
                entry.markers.clear();
            }
            (Target::Tracker(id), Param::Destroy, _) => {
                state.trackers.remove(&id);
            }
            (Target::Tracker(id), Param::Enable | Param::Disable, _) => {
                if let Some(tracker) = state.trackers.get_mut(&id) {
                    tracker.enabled = self.param == Param::Enable;
                }
            }
            (Target::Marker(id), param, payload) => {
                let Some(tracker) = state.trackers.get_mut(&id.tracker()) else {
                    return;
                };
                match (param, payload) {
                    (Param::SetLed, Payload::Int(led)) => {
                        tracker.markers.entry(id.index()).or_default().led = Some(*led);
                    }
                    (Param::SetPosition, Payload::Floats(p)) if p.len() >= 3 => {
                        tracker.markers.entry(id.index()).or_default().position =
                            Some([p[0], p[1], p[2]]);
                    }
                    (Param::ClearMarker, _) => {
                        tracker.markers.remove(&id.index());
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

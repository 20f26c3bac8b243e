use crate::command::Command;
use crate::config::SessionConfig;
use crate::id::MarkerId;
use crate::protocol::{Request, Response, ValueKind};
use crate::transform::ClientTransform;
use crate::transport::{CloseHandle, TcpTransport, Transport};
use crate::types::{
    CameraSample, ErrorCode, Event, InitFlags, MarkerSample, Param, Payload, Pose, RigidSample,
    SessionState, TrackerKind,
};
use crate::{OwlError, Result};
use std::time::{Duration, Instant};

/// A connection to a tracking server.
///
/// Commands are fire-and-forget: they are sent immediately, in order, and
/// their outcome is only known after the next [`Session::get_status`]
/// barrier. Queries are synchronous request/response calls.
///
/// A session is meant to be driven by one thread. Use
/// [`Session::close_handle`] to close it from elsewhere; any call blocked on
/// the server then returns [`OwlError::ConnectionClosed`].
pub struct Session {
    transport: Box<dyn Transport>,
    config: SessionConfig,
    flags: InitFlags,
    state: SessionState,
    transform: ClientTransform,
    last_error: ErrorCode,
    /// Command rejected on the client since the last status barrier.
    local_batch_error: Option<ErrorCode>,
    next_seq: u32,
    /// Commands issued since the last status barrier.
    pending: usize,
    closed: bool,
}

impl Session {
    /// Connect to `address` (`host` or `host:port`) with configuration from
    /// the environment. Blocks until the server accepts or rejects `flags`.
    pub fn open(address: &str, flags: InitFlags) -> Result<Session> {
        Self::open_with_config(address, flags, SessionConfig::from_env())
    }

    pub fn open_with_config(
        address: &str,
        flags: InitFlags,
        config: SessionConfig,
    ) -> Result<Session> {
        let transport = TcpTransport::connect(address, &config)?;
        let session = Self::with_transport(Box::new(transport), flags, config)?;
        log::info!("Opened session to {} (flags=0x{:04x})", address, flags.bits());
        Ok(session)
    }

    /// Run the init handshake over an already connected transport.
    pub fn with_transport(
        transport: Box<dyn Transport>,
        flags: InitFlags,
        config: SessionConfig,
    ) -> Result<Session> {
        let mut session = Session {
            transport,
            config,
            flags,
            state: SessionState::default(),
            transform: ClientTransform::default(),
            last_error: ErrorCode::NoError,
            local_batch_error: None,
            next_seq: 1,
            pending: 0,
            closed: false,
        };

        let timeout = session.config.connect_timeout;
        let accepted = match session.request(Request::Init { flags }, timeout) {
            Ok(Response::InitAck { accepted, flags }) => {
                session.flags = flags;
                accepted
            }
            Ok(other) => {
                session.close();
                return Err(OwlError::UnexpectedResponse {
                    expected: "init-ack",
                    got: other.name(),
                });
            }
            Err(e) => {
                session.close();
                return Err(e);
            }
        };

        if !accepted {
            session.close();
            return Err(OwlError::Rejected(flags));
        }

        session.state.connected = true;
        Ok(session)
    }

    /// Release the connection. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state.connected = false;
        // Best effort: the server may already be gone.
        let seq = self.bump_seq();
        let _ = self.transport.send(seq, &Request::Done);
        self.transport.close();
        log::info!("Session closed");
    }

    /// Handle that closes this session from another thread.
    pub fn close_handle(&self) -> CloseHandle {
        self.transport.close_handle()
    }

    pub fn is_connected(&self) -> bool {
        !self.closed && self.state.connected
    }

    /// Init flags as acknowledged by the server.
    pub fn flags(&self) -> InitFlags {
        self.flags
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Configuration intent issued so far.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Number of commands sent since the last status barrier.
    pub fn pending_commands(&self) -> usize {
        self.pending
    }

    // -- command channel --

    /// Send one command. Only transport failures are reported here; the
    /// server's verdict arrives with the next [`Session::get_status`].
    pub fn command(&mut self, command: Command) -> Result<()> {
        self.ensure_open()?;
        log::debug!(
            "command {:?} {} {:?}",
            command.target,
            command.param.name(),
            command.payload
        );
        let seq = self.bump_seq();
        let request = Request::Command(command);
        self.transport
            .send(seq, &request)
            .map_err(|e| self.on_transport_error(e))?;
        if let Request::Command(command) = &request {
            command.record(&mut self.state);
        }
        self.pending += 1;
        Ok(())
    }

    /// Start an explicit command batch.
    pub fn batch(&mut self) -> Batch<'_> {
        Batch {
            session: self,
            commands: Vec::new(),
        }
    }

    pub fn set_float(&mut self, param: Param, value: f32) -> Result<()> {
        self.command(Command::global(param, Payload::Float(value)))
    }

    pub fn set_int(&mut self, param: Param, value: i32) -> Result<()> {
        self.command(Command::global(param, Payload::Int(value)))
    }

    pub fn set_floats(&mut self, param: Param, values: &[f32]) -> Result<()> {
        self.command(Command::global(param, Payload::Floats(values.to_vec())))
    }

    pub fn set_ints(&mut self, param: Param, values: &[i32]) -> Result<()> {
        self.command(Command::global(param, Payload::Ints(values.to_vec())))
    }

    pub fn set_string(&mut self, param: Param, value: &str) -> Result<()> {
        self.command(Command::set_string(param, value))
    }

    pub fn tracker(&mut self, tracker: i32, param: Param) -> Result<()> {
        self.command(Command::tracker(tracker, param, Payload::None))
    }

    pub fn tracker_float(&mut self, tracker: i32, param: Param, value: f32) -> Result<()> {
        self.command(Command::tracker(tracker, param, Payload::Float(value)))
    }

    pub fn tracker_int(&mut self, tracker: i32, param: Param, value: i32) -> Result<()> {
        self.command(Command::tracker(tracker, param, Payload::Int(value)))
    }

    pub fn tracker_floats(&mut self, tracker: i32, param: Param, values: &[f32]) -> Result<()> {
        self.command(Command::tracker(tracker, param, Payload::Floats(values.to_vec())))
    }

    pub fn tracker_ints(&mut self, tracker: i32, param: Param, values: &[i32]) -> Result<()> {
        self.command(Command::tracker(tracker, param, Payload::Ints(values.to_vec())))
    }

    pub fn marker(&mut self, marker: MarkerId, param: Param) -> Result<()> {
        self.command(Command::marker(marker, param, Payload::None))
    }

    pub fn marker_float(&mut self, marker: MarkerId, param: Param, value: f32) -> Result<()> {
        self.command(Command::marker(marker, param, Payload::Float(value)))
    }

    pub fn marker_int(&mut self, marker: MarkerId, param: Param, value: i32) -> Result<()> {
        self.command(Command::marker(marker, param, Payload::Int(value)))
    }

    pub fn marker_floats(&mut self, marker: MarkerId, param: Param, values: &[f32]) -> Result<()> {
        self.command(Command::marker(marker, param, Payload::Floats(values.to_vec())))
    }

    pub fn marker_ints(&mut self, marker: MarkerId, param: Param, values: &[i32]) -> Result<()> {
        self.command(Command::marker(marker, param, Payload::Ints(values.to_vec())))
    }

    pub fn create_tracker(&mut self, tracker: i32, kind: TrackerKind) -> Result<()> {
        self.command(Command::create_tracker(tracker, kind))
    }

    pub fn destroy_tracker(&mut self, tracker: i32) -> Result<()> {
        self.command(Command::destroy_tracker(tracker))
    }

    pub fn enable_tracker(&mut self, tracker: i32) -> Result<()> {
        self.command(Command::enable_tracker(tracker))
    }

    pub fn disable_tracker(&mut self, tracker: i32) -> Result<()> {
        self.command(Command::disable_tracker(tracker))
    }

    pub fn set_led(&mut self, marker: MarkerId, led: i32) -> Result<()> {
        self.command(Command::set_led(marker, led))
    }

    pub fn set_marker_position(&mut self, marker: MarkerId, position: [f32; 3]) -> Result<()> {
        self.command(Command::set_marker_position(marker, position))
    }

    pub fn clear_marker(&mut self, marker: MarkerId) -> Result<()> {
        self.command(Command::clear_marker(marker))
    }

    pub fn set_frequency(&mut self, hz: f32) -> Result<()> {
        self.command(Command::set_frequency(hz))
    }

    pub fn set_streaming(&mut self, enabled: bool) -> Result<()> {
        let result = self.command(Command::set_streaming(enabled));
        if result.is_ok() {
            log::info!("Streaming {}", if enabled { "enabled" } else { "disabled" });
        }
        result
    }

    pub fn set_interpolation(&mut self, frames: i32) -> Result<()> {
        self.command(Command::set_interpolation(frames))
    }

    pub fn set_filter(&mut self, tracker: i32, values: &[f32]) -> Result<()> {
        self.command(Command::set_filter(tracker, values))
    }

    /// Scale applied to every reported position. Client-side only.
    pub fn set_scale(&mut self, scale: f32) {
        self.transform.set_scale(scale);
        self.state.scale = scale;
    }

    /// Frame in which reported samples are expressed, as
    /// `[x, y, z, s, qx, qy, qz]`. Client-side only.
    pub fn load_pose(&mut self, pose: Pose) {
        self.transform.set_pose(pose);
    }

    pub fn transform(&self) -> &ClientTransform {
        &self.transform
    }

    // -- query channel --

    /// Block until the server has processed every command sent so far.
    ///
    /// Returns `false` if any of them failed; [`Session::get_error`] then
    /// names the error.
    pub fn get_status(&mut self) -> Result<bool> {
        let timeout = self.config.status_timeout;
        let pending = self.pending;
        match self.request(Request::Sync, timeout)? {
            Response::Status { ok, error } => {
                // A command dropped on the client fails the batch even when
                // everything the server saw succeeded.
                let (ok, error) = match self.local_batch_error.take() {
                    Some(local) if !error.is_error() => (false, local),
                    Some(_) => (false, error),
                    None => (ok, error),
                };
                self.last_error = error;
                self.pending = 0;
                if ok {
                    log::debug!("status ok ({} commands)", pending);
                } else {
                    log::info!("status failed after {} commands: {}", pending, error);
                }
                Ok(ok)
            }
            other => Err(self.unexpected("status", &other)),
        }
    }

    /// Error code carried by the most recent server reply.
    pub fn get_error(&self) -> ErrorCode {
        self.last_error
    }

    /// Record an error detected before a query reached the server, such as
    /// an unknown enum value passed through the C API.
    pub(crate) fn set_local_error(&mut self, code: ErrorCode) {
        self.last_error = code;
    }

    /// Count a command that was rejected without being sent. Like a server
    /// rejection, it only shows up at the next [`Session::get_status`].
    pub(crate) fn reject_command(&mut self, code: ErrorCode) {
        log::debug!("command rejected locally: {}", code);
        self.local_batch_error = Some(code);
        self.pending += 1;
    }

    /// Look at the next pending event without consuming it.
    pub fn peek_event(&mut self) -> Result<Event> {
        self.event_query(Request::PeekEvent)
    }

    /// Consume the next pending event. [`Event::NONE`] when there is none.
    pub fn get_event(&mut self) -> Result<Event> {
        self.event_query(Request::GetEvent)
    }

    fn event_query(&mut self, request: Request) -> Result<Event> {
        let timeout = self.config.query_timeout;
        match self.request(request, timeout)? {
            Response::Event { error, event } => {
                self.check(error)?;
                if event.is_done() {
                    log::info!("Server reported done at frame {}", event.frame);
                }
                Ok(event)
            }
            other => Err(self.unexpected("event", &other)),
        }
    }

    /// Up to `capacity` marker samples of the newest frame.
    ///
    /// An empty result means no new frame since the last call. That is not
    /// an error; poll again.
    pub fn get_markers(&mut self, capacity: usize) -> Result<Vec<MarkerSample>> {
        let timeout = self.config.query_timeout;
        let capacity = clamp_capacity(capacity);
        match self.request(Request::GetMarkers { capacity }, timeout)? {
            Response::Markers { error, mut samples } => {
                self.check(error)?;
                samples.truncate(capacity as usize);
                self.transform.apply_markers(&mut samples);
                Ok(samples)
            }
            other => Err(self.unexpected("markers", &other)),
        }
    }

    /// Up to `capacity` rigid-body poses of the newest frame. Empty when
    /// there is no new frame.
    pub fn get_rigids(&mut self, capacity: usize) -> Result<Vec<RigidSample>> {
        let timeout = self.config.query_timeout;
        let capacity = clamp_capacity(capacity);
        match self.request(Request::GetRigids { capacity }, timeout)? {
            Response::Rigids { error, mut samples } => {
                self.check(error)?;
                samples.truncate(capacity as usize);
                self.transform.apply_rigids(&mut samples);
                Ok(samples)
            }
            other => Err(self.unexpected("rigids", &other)),
        }
    }

    pub fn get_cameras(&mut self, capacity: usize) -> Result<Vec<CameraSample>> {
        let timeout = self.config.query_timeout;
        let capacity = clamp_capacity(capacity);
        match self.request(Request::GetCameras { capacity }, timeout)? {
            Response::Cameras { error, mut samples } => {
                self.check(error)?;
                samples.truncate(capacity as usize);
                self.transform.apply_cameras(&mut samples);
                Ok(samples)
            }
            other => Err(self.unexpected("cameras", &other)),
        }
    }

    pub fn get_float(&mut self, param: Param) -> Result<f32> {
        let values = self.get_floats(param)?;
        values.first().copied().ok_or_else(|| self.empty_value())
    }

    pub fn get_floats(&mut self, param: Param) -> Result<Vec<f32>> {
        let value = self.value_query(param, ValueKind::Float)?;
        value.as_floats().ok_or_else(|| self.empty_value())
    }

    pub fn get_int(&mut self, param: Param) -> Result<i32> {
        let values = self.get_ints(param)?;
        values.first().copied().ok_or_else(|| self.empty_value())
    }

    pub fn get_ints(&mut self, param: Param) -> Result<Vec<i32>> {
        let value = self.value_query(param, ValueKind::Int)?;
        value.as_ints().ok_or_else(|| self.empty_value())
    }

    /// String parameter such as [`Param::Version`] or [`Param::StatusString`].
    pub fn get_string(&mut self, param: Param) -> Result<String> {
        match self.value_query(param, ValueKind::Str)? {
            Payload::Str(s) => Ok(s),
            _ => Err(self.empty_value()),
        }
    }

    fn value_query(&mut self, param: Param, kind: ValueKind) -> Result<Payload> {
        let timeout = self.config.query_timeout;
        match self.request(Request::GetValue { param, kind }, timeout)? {
            Response::Value { error, value } => {
                self.check(error)?;
                Ok(value)
            }
            other => Err(self.unexpected("value", &other)),
        }
    }

    // -- plumbing --

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(OwlError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn bump_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        seq
    }

    /// Send `request` and wait for the reply carrying the same sequence
    /// number. Replies to earlier, abandoned requests are dropped.
    fn request(&mut self, request: Request, timeout: Option<Duration>) -> Result<Response> {
        self.ensure_open()?;
        let seq = self.bump_seq();
        self.transport
            .send(seq, &request)
            .map_err(|e| self.on_transport_error(e))?;

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(OwlError::Timeout);
                    }
                    Some(left)
                }
                None => None,
            };
            let (got, response) = self
                .transport
                .recv(remaining)
                .map_err(|e| self.on_transport_error(e))?;
            if got == seq {
                return response;
            }
            match response {
                Ok(response) => log::warn!(
                    "discarding late {} response seq={} (waiting for {})",
                    response.name(),
                    got,
                    seq
                ),
                Err(e) => log::warn!(
                    "discarding undecodable late response seq={} (waiting for {}): {}",
                    got,
                    seq,
                    e
                ),
            }
        }
    }

    fn on_transport_error(&mut self, err: OwlError) -> OwlError {
        if err.is_connection_error() && self.state.connected {
            log::info!("Session lost connection: {}", err);
            self.state.connected = false;
            self.closed = true;
        }
        err
    }

    /// Record a reply's error code; non-zero codes become errors.
    fn check(&mut self, error: ErrorCode) -> Result<()> {
        self.last_error = error;
        if error.is_error() {
            Err(OwlError::Protocol(error))
        } else {
            Ok(())
        }
    }

    fn unexpected(&self, expected: &'static str, got: &Response) -> OwlError {
        log::warn!("expected {} response, got {}", expected, got.name());
        OwlError::UnexpectedResponse {
            expected,
            got: got.name(),
        }
    }

    fn empty_value(&self) -> OwlError {
        OwlError::InvalidFrame("value reply carries no value of the requested type".into())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn clamp_capacity(capacity: usize) -> u32 {
    u32::try_from(capacity).unwrap_or(u32::MAX)
}

/// Commands collected for one status barrier.
///
/// Nothing is sent until [`Batch::commit`], which sends the commands in the
/// order they were pushed and then waits for the server's verdict on all of
/// them together.
pub struct Batch<'a> {
    session: &'a mut Session,
    commands: Vec<Command>,
}

impl Batch<'_> {
    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Send every command, then block on the status barrier.
    ///
    /// `Err(OwlError::Protocol(code))` if the server rejected any of them.
    pub fn commit(self) -> Result<()> {
        let count = self.commands.len();
        for command in self.commands {
            self.session.command(command)?;
        }
        if self.session.get_status()? {
            log::info!("Batch of {} commands committed", count);
            Ok(())
        } else {
            let code = match self.session.get_error() {
                ErrorCode::NoError => ErrorCode::InvalidOperation,
                code => code,
            };
            Err(OwlError::Protocol(code))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{FramePoller, PollPolicy};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    type Reply = (u32, Result<Response>);
    type Handler = Box<dyn FnMut(u32, &Request) -> Vec<Reply> + Send>;

    /// In-memory transport answering through a closure. The closure may
    /// answer with any sequence number, including ones already abandoned.
    struct MockTransport {
        sent: Arc<Mutex<Vec<Request>>>,
        queue: VecDeque<Reply>,
        handler: Handler,
        closed: Arc<AtomicBool>,
    }

    impl MockTransport {
        fn new(
            handler: impl FnMut(u32, &Request) -> Vec<Reply> + Send + 'static,
        ) -> (Self, Arc<Mutex<Vec<Request>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let transport = MockTransport {
                sent: sent.clone(),
                queue: VecDeque::new(),
                handler: Box::new(handler),
                closed: Arc::new(AtomicBool::new(false)),
            };
            (transport, sent)
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, seq: u32, request: &Request) -> Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(OwlError::ConnectionClosed);
            }
            self.sent.lock().unwrap().push(request.clone());
            let replies = (self.handler)(seq, request);
            self.queue.extend(replies);
            Ok(())
        }

        fn recv(&mut self, _timeout: Option<Duration>) -> Result<Reply> {
            if self.closed.load(Ordering::Acquire) {
                return Err(OwlError::ConnectionClosed);
            }
            self.queue.pop_front().ok_or(OwlError::Timeout)
        }

        fn close_handle(&self) -> CloseHandle {
            let closed = self.closed.clone();
            CloseHandle::new(move || closed.store(true, Ordering::Release))
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    /// Adapt a handler that answers each request with its own sequence number.
    fn replying(
        mut f: impl FnMut(&Request) -> Option<Response> + Send + 'static,
    ) -> impl FnMut(u32, &Request) -> Vec<Reply> + Send + 'static {
        move |seq, request| f(request).map(|r| (seq, Ok(r))).into_iter().collect()
    }

    fn accept_all(request: &Request) -> Option<Response> {
        match request {
            Request::Init { flags } => Some(Response::InitAck {
                accepted: true,
                flags: *flags,
            }),
            Request::Sync => Some(Response::Status {
                ok: true,
                error: ErrorCode::NoError,
            }),
            Request::GetMarkers { .. } => Some(Response::Markers {
                error: ErrorCode::NoError,
                samples: Vec::new(),
            }),
            _ => None,
        }
    }

    fn open_mock(
        handler: impl FnMut(&Request) -> Option<Response> + Send + 'static,
    ) -> (Session, Arc<Mutex<Vec<Request>>>) {
        let (transport, sent) = MockTransport::new(replying(handler));
        let session =
            Session::with_transport(Box::new(transport), InitFlags::empty(), SessionConfig::default())
                .unwrap();
        (session, sent)
    }

    #[test]
    fn test_rejected_flags() {
        let (transport, _) = MockTransport::new(replying(|request| match request {
            Request::Init { flags } => Some(Response::InitAck {
                accepted: false,
                flags: *flags,
            }),
            _ => None,
        }));
        let err = Session::with_transport(
            Box::new(transport),
            InitFlags::SLAVE,
            SessionConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, OwlError::Rejected(flags) if flags == InitFlags::SLAVE));
    }

    #[test]
    fn test_commands_sent_in_order() {
        let (mut session, sent) = open_mock(accept_all);
        session.create_tracker(0, TrackerKind::Point).unwrap();
        for i in 0..3 {
            session.set_led(MarkerId::new(0, i), i).unwrap();
        }
        assert_eq!(session.pending_commands(), 4);
        assert!(session.get_status().unwrap());
        assert_eq!(session.pending_commands(), 0);

        let sent = sent.lock().unwrap();
        let commands: Vec<_> = sent
            .iter()
            .filter_map(|r| match r {
                Request::Command(c) => Some(c.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(commands[0], Command::create_tracker(0, TrackerKind::Point));
        for i in 0..3 {
            assert_eq!(commands[1 + i as usize], Command::set_led(MarkerId::new(0, i), i));
        }
        assert_eq!(sent.last(), Some(&Request::Sync));
    }

    #[test]
    fn test_failed_status_sets_error() {
        let (mut session, _) = open_mock(|request| match request {
            Request::Sync => Some(Response::Status {
                ok: false,
                error: ErrorCode::InvalidValue,
            }),
            other => accept_all(other),
        });
        session.set_frequency(2000.0).unwrap();
        assert!(!session.get_status().unwrap());
        assert_eq!(session.get_error(), ErrorCode::InvalidValue);
        // Intent is mirrored even though the server refused it.
        assert_eq!(session.state().frequency, 2000.0);
    }

    #[test]
    fn test_batch_commit_reports_code() {
        let (mut session, sent) = open_mock(|request| match request {
            Request::Sync => Some(Response::Status {
                ok: false,
                error: ErrorCode::InvalidOperation,
            }),
            other => accept_all(other),
        });
        let mut batch = session.batch();
        batch
            .push(Command::enable_tracker(4))
            .push(Command::set_streaming(true));
        assert_eq!(batch.len(), 2);
        let err = batch.commit().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidOperation));
        assert_eq!(sent.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_empty_markers_is_not_an_error() {
        let (mut session, _) = open_mock(accept_all);
        let markers = session.get_markers(72).unwrap();
        assert!(markers.is_empty());
        assert_eq!(session.get_error(), ErrorCode::NoError);
    }

    #[test]
    fn test_query_error_surfaces_at_call() {
        let (mut session, _) = open_mock(|request| match request {
            Request::GetValue { .. } => Some(Response::Value {
                error: ErrorCode::InvalidEnum,
                value: Payload::None,
            }),
            other => accept_all(other),
        });
        let err = session.get_string(Param::CalibStatus).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidEnum));
        assert_eq!(session.get_error(), ErrorCode::InvalidEnum);
    }

    #[test]
    fn test_late_response_discarded() {
        let mut abandoned = None;
        let (transport, _) = MockTransport::new(move |seq, request| match request {
            Request::GetMarkers { .. } => match abandoned.take() {
                // First query: stay silent so the caller times out.
                None => {
                    abandoned = Some(seq);
                    Vec::new()
                }
                // Second query: the stale reply arrives first.
                Some(old) => vec![
                    (
                        old,
                        Ok(Response::Markers {
                            error: ErrorCode::NoError,
                            samples: vec![MarkerSample::default(); 3],
                        }),
                    ),
                    (
                        seq,
                        Ok(Response::Markers {
                            error: ErrorCode::NoError,
                            samples: Vec::new(),
                        }),
                    ),
                ],
            },
            other => accept_all(other).map(|r| (seq, Ok(r))).into_iter().collect(),
        });
        let mut session =
            Session::with_transport(Box::new(transport), InitFlags::empty(), SessionConfig::default())
                .unwrap();

        assert!(matches!(session.get_markers(4), Err(OwlError::Timeout)));
        assert!(session.is_connected());
        assert!(session.get_markers(4).unwrap().is_empty());
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_further_calls() {
        let (mut session, sent) = open_mock(accept_all);
        session.close();
        session.close();
        assert!(!session.is_connected());
        assert!(matches!(session.get_status(), Err(OwlError::ConnectionClosed)));
        assert!(matches!(
            session.set_frequency(100.0),
            Err(OwlError::ConnectionClosed)
        ));
        let done_count = sent
            .lock()
            .unwrap()
            .iter()
            .filter(|r| **r == Request::Done)
            .count();
        assert_eq!(done_count, 1);
    }

    #[test]
    fn test_close_handle_fails_pending_query() {
        let (mut session, _) = open_mock(accept_all);
        session.close_handle().close();
        assert!(matches!(session.get_markers(8), Err(OwlError::ConnectionClosed)));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_scale_applied_to_markers() {
        let (mut session, _) = open_mock(|request| match request {
            Request::GetMarkers { .. } => Some(Response::Markers {
                error: ErrorCode::NoError,
                samples: vec![MarkerSample {
                    x: 1000.0,
                    y: 0.0,
                    z: -500.0,
                    confidence: 1.0,
                    ..Default::default()
                }],
            }),
            other => accept_all(other),
        });
        session.set_scale(0.001);
        assert_eq!(session.state().scale, 0.001);
        let markers = session.get_markers(1).unwrap();
        assert!((markers[0].x - 1.0).abs() < 1e-6);
        assert!((markers[0].z + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_undecodable_late_response_discarded() {
        let mut abandoned = None;
        let (transport, _) = MockTransport::new(move |seq, request| match request {
            Request::GetMarkers { .. } => match abandoned.take() {
                None => {
                    abandoned = Some(seq);
                    Vec::new()
                }
                // A truncated reply to the abandoned query, then the real one.
                Some(old) => vec![
                    (
                        old,
                        Err(OwlError::InvalidFrame("truncated payload".into())),
                    ),
                    (
                        seq,
                        Ok(Response::Markers {
                            error: ErrorCode::NoError,
                            samples: Vec::new(),
                        }),
                    ),
                ],
            },
            other => accept_all(other).map(|r| (seq, Ok(r))).into_iter().collect(),
        });
        let mut session =
            Session::with_transport(Box::new(transport), InitFlags::empty(), SessionConfig::default())
                .unwrap();

        assert!(matches!(session.get_markers(4), Err(OwlError::Timeout)));
        assert!(session.get_markers(4).unwrap().is_empty());
        assert_eq!(session.get_error(), ErrorCode::NoError);
    }

    #[test]
    fn test_undecodable_current_response_fails_call() {
        let (transport, _) = MockTransport::new(|seq, request| match request {
            Request::Sync => vec![(seq, Err(OwlError::InvalidFrame("bad status".into())))],
            other => accept_all(other).map(|r| (seq, Ok(r))).into_iter().collect(),
        });
        let mut session =
            Session::with_transport(Box::new(transport), InitFlags::empty(), SessionConfig::default())
                .unwrap();
        assert!(matches!(session.get_status(), Err(OwlError::InvalidFrame(_))));
    }

    #[test]
    fn test_local_rejection_fails_next_status() {
        let (mut session, sent) = open_mock(accept_all);
        session.create_tracker(0, TrackerKind::Point).unwrap();
        session.reject_command(ErrorCode::InvalidEnum);
        assert_eq!(session.pending_commands(), 2);
        // Only the create reached the transport.
        assert_eq!(
            sent.lock().unwrap().iter().filter(|r| matches!(r, Request::Command(_))).count(),
            1
        );

        assert!(!session.get_status().unwrap());
        assert_eq!(session.get_error(), ErrorCode::InvalidEnum);
        // The rejection belongs to one batch only.
        assert!(session.get_status().unwrap());
        assert_eq!(session.get_error(), ErrorCode::NoError);
    }

    #[test]
    fn test_server_error_wins_over_local_rejection() {
        let (mut session, _) = open_mock(|request| match request {
            Request::Sync => Some(Response::Status {
                ok: false,
                error: ErrorCode::InvalidValue,
            }),
            other => accept_all(other),
        });
        session.reject_command(ErrorCode::InvalidEnum);
        session.set_frequency(2000.0).unwrap();
        assert!(!session.get_status().unwrap());
        assert_eq!(session.get_error(), ErrorCode::InvalidValue);
    }

    #[test]
    fn test_failed_send_leaves_state_untouched() {
        let (mut session, _) = open_mock(accept_all);
        session.close_handle().close();
        assert!(session.create_tracker(0, TrackerKind::Point).is_err());
        assert!(session.state().trackers.is_empty());
        assert_eq!(session.pending_commands(), 0);
    }

    /// Markers query that answers empty `stale` times, then with `error`.
    fn failing_markers(
        stale: usize,
        error: ErrorCode,
    ) -> impl FnMut(&Request) -> Option<Response> + Send + 'static {
        let mut polls = 0;
        move |request| match request {
            Request::GetMarkers { .. } => {
                polls += 1;
                let error = if polls > stale { error } else { ErrorCode::NoError };
                Some(Response::Markers {
                    error,
                    samples: Vec::new(),
                })
            }
            other => accept_all(other),
        }
    }

    fn marker_polls(sent: &Mutex<Vec<Request>>) -> usize {
        sent.lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r, Request::GetMarkers { .. }))
            .count()
    }

    #[test]
    fn test_poller_stops_at_server_error() {
        let (mut session, sent) = open_mock(failing_markers(2, ErrorCode::InvalidOperation));
        let poller = FramePoller::new(&session, 8).with_policy(PollPolicy::Spin);

        let err = poller.next_frame(&mut session).unwrap_err();
        assert!(matches!(err, OwlError::Protocol(ErrorCode::InvalidOperation)));
        assert_eq!(session.get_error(), ErrorCode::InvalidOperation);
        // Two stale polls were retried, the failing one was not.
        assert_eq!(marker_polls(&sent), 3);
    }

    #[test]
    fn test_frames_end_after_error() {
        let (mut session, sent) = open_mock(failing_markers(0, ErrorCode::InvalidEnum));
        let poller = FramePoller::new(&session, 8).with_policy(PollPolicy::Spin);

        let mut frames = poller.frames(&mut session);
        assert!(matches!(
            frames.next(),
            Some(Err(OwlError::Protocol(ErrorCode::InvalidEnum)))
        ));
        assert!(frames.next().is_none());
        assert!(frames.next().is_none());
        drop(frames);
        assert_eq!(marker_polls(&sent), 1);
    }
}

//! End-to-end tests against the in-process simulated server.

use owl::sim::{SimConfig, SimServer};
use owl::{
    Command, ErrorCode, FramePoller, InitFlags, MarkerId, OwlError, Param, PollPolicy, Session,
    SessionConfig, TrackerKind,
};
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start(config: SimConfig) -> SimServer {
    init_logging();
    SimServer::start(config).expect("sim server")
}

fn open(server: &SimServer, flags: InitFlags) -> owl::Result<Session> {
    Session::open_with_config(&server.address(), flags, SessionConfig::default())
}

fn point_tracker(session: &mut Session, tracker: i32, leds: i32) {
    session.create_tracker(tracker, TrackerKind::Point).unwrap();
    for led in 0..leds {
        session.set_led(MarkerId::new(tracker, led), led).unwrap();
    }
    session.enable_tracker(tracker).unwrap();
}

#[test]
fn test_seventy_two_led_stream() {
    let server = start(SimConfig::default());
    let mut session = open(&server, InitFlags::empty()).unwrap();

    point_tracker(&mut session, 0, 72);
    assert!(session.get_status().unwrap());
    assert_eq!(session.state().trackers[&0].markers.len(), 72);

    session.set_frequency(owl::MAX_FREQUENCY).unwrap();
    session.set_streaming(true).unwrap();
    assert!(session.get_status().unwrap());
    assert!(session.state().streaming_enabled);

    let poller = FramePoller::new(&session, 72).with_max_wait(Some(Duration::from_secs(2)));
    let frames: Vec<_> = poller
        .frames(&mut session)
        .take(5)
        .collect::<owl::Result<_>>()
        .unwrap();

    let mut last = 0;
    for frame in &frames {
        assert!(frame.number > last);
        last = frame.number;
        assert_eq!(frame.markers.len(), 72);
        for (i, m) in frame.markers.iter().enumerate() {
            assert_eq!(owl::decode_tracker(m.id), 0);
            assert_eq!(owl::decode_index(m.id), i as i32);
            assert_eq!(m.frame, frame.number);
            assert!(m.is_visible());
        }
    }
}

#[test]
fn test_capacity_truncates() {
    let server = start(SimConfig::default());
    let mut session = open(&server, InitFlags::empty()).unwrap();
    point_tracker(&mut session, 0, 16);
    session.set_streaming(true).unwrap();
    assert!(session.get_status().unwrap());

    let frame = FramePoller::new(&session, 4)
        .with_max_wait(Some(Duration::from_secs(2)))
        .next_frame(&mut session)
        .unwrap();
    assert_eq!(frame.markers.len(), 4);
}

#[test]
fn test_frequency_above_max_fails_at_status() {
    let server = start(SimConfig::default());
    let mut session = open(&server, InitFlags::empty()).unwrap();

    session.set_frequency(2000.0).unwrap();
    assert_eq!(session.get_error(), ErrorCode::NoError);
    assert!(!session.get_status().unwrap());
    assert_eq!(session.get_error(), ErrorCode::InvalidValue);
    assert_eq!(session.get_float(Param::Frequency).unwrap(), 480.0);
}

#[test]
fn test_stale_poll_is_empty_without_error() {
    let server = start(SimConfig::default());
    let mut session = open(&server, InitFlags::empty()).unwrap();
    point_tracker(&mut session, 0, 4);
    // One frame per second: the second poll lands on the same frame.
    session.set_frequency(1.0).unwrap();
    session.set_streaming(true).unwrap();
    assert!(session.get_status().unwrap());

    let first = session.get_markers(4).unwrap();
    assert_eq!(first.len(), 4);
    let second = session.get_markers(4).unwrap();
    assert!(second.is_empty());
    assert_eq!(session.get_error(), ErrorCode::NoError);
}

#[test]
fn test_poller_times_out_when_not_streaming() {
    let server = start(SimConfig::default());
    let mut session = open(&server, InitFlags::empty()).unwrap();
    point_tracker(&mut session, 0, 4);
    assert!(session.get_status().unwrap());

    let err = FramePoller::new(&session, 4)
        .with_policy(PollPolicy::Sleep(Duration::from_millis(5)))
        .with_max_wait(Some(Duration::from_millis(100)))
        .next_frame(&mut session)
        .unwrap_err();
    assert!(matches!(err, OwlError::Timeout));
}

#[test]
fn test_close_handle_unblocks_poll() {
    let server = start(SimConfig::default());
    let mut session = open(&server, InitFlags::empty()).unwrap();
    point_tracker(&mut session, 0, 4);
    session.set_streaming(true).unwrap();
    assert!(session.get_status().unwrap());

    server.handle().pause();
    let handle = session.close_handle();
    let closer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        handle.close();
    });

    let started = Instant::now();
    let poller = FramePoller::new(&session, 4);
    let err = poller.next_frame(&mut session).unwrap_err();
    assert!(matches!(err, OwlError::ConnectionClosed), "got {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!session.is_connected());
    closer.join().unwrap();

    server.handle().resume();
}

#[test]
fn test_server_shutdown_reports_connection_loss() {
    let server = start(SimConfig::default());
    let mut session = open(&server, InitFlags::empty()).unwrap();
    server.shutdown();

    let err = session.get_status().unwrap_err();
    assert!(err.is_connection_error(), "got {:?}", err);
    assert!(!session.is_connected());
}

#[test]
fn test_done_event_after_replay() {
    let server = start(SimConfig {
        done_after_frames: Some(3),
        ..SimConfig::default()
    });
    let mut session = open(&server, InitFlags::FILE).unwrap();
    session.set_frequency(100.0).unwrap();
    session.set_streaming(true).unwrap();
    assert!(session.get_status().unwrap());

    let deadline = Instant::now() + Duration::from_secs(2);
    let event = loop {
        let event = session.peek_event().unwrap();
        if !event.is_none() {
            break event;
        }
        assert!(Instant::now() < deadline, "no done event");
        std::thread::sleep(Duration::from_millis(5));
    };
    assert!(event.is_done());
    assert_eq!(event.frame, 3);

    assert_eq!(session.get_event().unwrap(), event);
    assert!(session.get_event().unwrap().is_none());
}

#[test]
fn test_rejected_flags() {
    let server = start(SimConfig {
        reject_flags: InitFlags::SLAVE,
        ..SimConfig::default()
    });
    let err = open(&server, InitFlags::SLAVE).err().unwrap();
    assert!(matches!(err, OwlError::Rejected(flags) if flags == InitFlags::SLAVE));

    let err = open(&server, InitFlags::from_bits_retain(0x0004)).err().unwrap();
    assert!(matches!(err, OwlError::Rejected(_)));

    assert!(open(&server, InitFlags::POSTPROCESS).is_ok());
}

#[test]
fn test_batch_commit() {
    let server = start(SimConfig::default());
    let mut session = open(&server, InitFlags::empty()).unwrap();

    let mut batch = session.batch();
    batch
        .push(Command::create_tracker(1, TrackerKind::Rigid))
        .push(Command::set_led(MarkerId::new(1, 0), 10))
        .push(Command::set_marker_position(MarkerId::new(1, 0), [0.0, 50.0, 0.0]))
        .push(Command::enable_tracker(1))
        .push(Command::set_frequency(2000.0));
    assert_eq!(batch.len(), 5);
    let err = batch.commit().unwrap_err();
    assert!(matches!(err, OwlError::Protocol(ErrorCode::InvalidValue)));

    let mut batch = session.batch();
    batch.push(Command::set_frequency(240.0)).push(Command::set_streaming(true));
    batch.commit().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let rigids = loop {
        let rigids = session.get_rigids(8).unwrap();
        if !rigids.is_empty() {
            break rigids;
        }
        assert!(Instant::now() < deadline, "no rigid frame");
        std::thread::sleep(Duration::from_millis(2));
    };
    assert_eq!(rigids.len(), 1);
    assert_eq!(rigids[0].id, 1);
}

#[test]
fn test_marker_before_tracker_is_invalid_operation() {
    let server = start(SimConfig::default());
    let mut session = open(&server, InitFlags::empty()).unwrap();

    session.set_led(MarkerId::new(5, 0), 0).unwrap();
    assert!(!session.get_status().unwrap());
    assert_eq!(session.get_error(), ErrorCode::InvalidOperation);
}

#[test]
fn test_query_error_reported_at_call() {
    let server = start(SimConfig::default());
    let mut session = open(&server, InitFlags::empty()).unwrap();

    let err = session.get_int(Param::Broadcast).unwrap_err();
    assert!(matches!(err, OwlError::Protocol(ErrorCode::InvalidEnum)));
    assert_eq!(session.get_error(), ErrorCode::InvalidEnum);

    session.set_string(Param::CustomString, "lab-west").unwrap();
    assert!(session.get_status().unwrap());
    assert_eq!(session.get_string(Param::CustomString).unwrap(), "lab-west");
    assert!(session.get_string(Param::Version).unwrap().starts_with("owl-sim"));
}

#[test]
fn test_client_transform_applied() {
    let server = start(SimConfig::default());
    let mut session = open(&server, InitFlags::empty()).unwrap();
    assert_eq!(session.get_cameras(16).unwrap().len(), 4);
    let raw = session.get_cameras(16).unwrap();

    session.set_scale(0.001);
    session.load_pose([1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    let scaled = session.get_cameras(16).unwrap();
    for (a, b) in raw.iter().zip(&scaled) {
        assert!((b.pose[0] - (a.pose[0] * 0.001 + 1.0)).abs() < 1e-4);
        assert!((b.pose[1] - a.pose[1] * 0.001).abs() < 1e-4);
    }
}

//! Stream a 72-LED point tracker to stdout.
//!
//! Usage: OWL_SERVER=192.168.1.230 cargo run --example stream
//! Without OWL_SERVER a local simulated server is started.

use owl::sim::{SimConfig, SimServer};
use owl::{FramePoller, InitFlags, MarkerId, OwlError, Session, TrackerKind};
use std::time::{Duration, Instant};

const TRACKER: i32 = 0;
const LEDS: i32 = 72;
const FRAMES: usize = 500;

fn main() {
    env_logger::init();

    let (address, _sim) = match std::env::var("OWL_SERVER") {
        Ok(address) => (address, None),
        Err(_) => {
            let sim = match SimServer::start(SimConfig::default()) {
                Ok(sim) => sim,
                Err(e) => {
                    eprintln!("Failed to start simulated server: {}", e);
                    std::process::exit(1);
                }
            };
            println!("OWL_SERVER not set, using simulated server at {}", sim.address());
            (sim.address(), Some(sim))
        }
    };

    let mut session = match Session::open(&address, InitFlags::empty()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to connect to {}: {}", address, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = setup(&mut session) {
        eprintln!("Setup failed: {}", e);
        std::process::exit(1);
    }

    let poller = FramePoller::new(&session, LEDS as usize).with_max_wait(Some(Duration::from_secs(2)));
    println!("Streaming {} LEDs (tracker {})...", LEDS, TRACKER);

    let start = Instant::now();
    let mut count = 0usize;
    for frame in poller.frames(&mut session).take(FRAMES) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(OwlError::Timeout) => {
                eprintln!("Timeout waiting for frames");
                break;
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        };
        count += 1;

        // Print every ~50th frame to avoid flooding the terminal
        if count % 50 == 1 {
            println!("frame {} ({} stale polls)", frame.number, frame.stale_polls);
            for m in frame.markers.iter().filter(|m| m.is_visible()).take(4) {
                println!(
                    "  {}  pos=[{:+9.2}, {:+9.2}, {:+9.2}]  conf={:.2}",
                    m.marker_id(),
                    m.x,
                    m.y,
                    m.z,
                    m.confidence
                );
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "\nTotal: {} frames in {:.1}s ({:.1} Hz)",
        count,
        elapsed,
        count as f64 / elapsed
    );

    session.close();
}

fn setup(session: &mut Session) -> owl::Result<()> {
    session.create_tracker(TRACKER, TrackerKind::Point)?;
    for led in 0..LEDS {
        session.set_led(MarkerId::new(TRACKER, led), led)?;
    }
    session.enable_tracker(TRACKER)?;
    if !session.get_status()? {
        return Err(OwlError::Protocol(session.get_error()));
    }

    session.set_scale(0.001);
    session.set_frequency(owl::MAX_FREQUENCY)?;
    session.set_streaming(true)?;
    if !session.get_status()? {
        return Err(OwlError::Protocol(session.get_error()));
    }
    Ok(())
}

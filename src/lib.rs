//! # owl - client for OWL-protocol motion-capture servers
//!
//! Connects to a tracking server over TCP, configures trackers and markers,
//! and polls marker, rigid-body and camera samples. Provides:
//! - A [`Session`] with fire-and-forget commands and a status barrier
//! - Client-side scaling and frame transform of reported samples
//! - A [`FramePoller`] that skips stale frames
//! - A small in-process server ([`sim::SimServer`]) for tests and demos
//! - C FFI for integration with C/C++ consumers
//!
//! ## Quick Start
//! ```no_run
//! use owl::{InitFlags, MarkerId, Session, TrackerKind, FramePoller};
//!
//! let mut session = Session::open("192.168.1.230", InitFlags::empty()).unwrap();
//! session.create_tracker(0, TrackerKind::Point).unwrap();
//! for led in 0..8 {
//!     session.set_led(MarkerId::new(0, led), led).unwrap();
//! }
//! session.enable_tracker(0).unwrap();
//! session.set_frequency(480.0).unwrap();
//! session.set_streaming(true).unwrap();
//! assert!(session.get_status().unwrap());
//!
//! let poller = FramePoller::new(&session, 8);
//! let frame = poller.next_frame(&mut session).unwrap();
//! println!("frame {}: {} markers", frame.number, frame.markers.len());
//! ```

pub mod error;
pub mod id;
pub mod types;
pub mod command;
pub mod protocol;
pub mod config;
pub mod transport;
pub mod transform;
pub mod session;
pub mod poller;
pub mod sim;
pub mod ffi;

pub use command::Command;
pub use config::SessionConfig;
pub use error::OwlError;
pub use id::{decode_index, decode_tracker, encode_marker, MarkerId};
pub use poller::{Frame, FramePoller, PollPolicy};
pub use session::{Batch, Session};
pub use transform::ClientTransform;
pub use transport::{CloseHandle, TcpTransport, Transport};
pub use types::*;

/// Result type alias for owl operations.
pub type Result<T> = std::result::Result<T, OwlError>;

//! Print version and status of a tracking server.
//!
//! Usage: cargo run --example info -- <host[:port]>

use owl::{InitFlags, Param, Session};

fn main() {
    env_logger::init();

    let address = match std::env::args().nth(1).or_else(|| std::env::var("OWL_SERVER").ok()) {
        Some(address) => address,
        None => {
            eprintln!("Usage: info <host[:port]>  (or set OWL_SERVER)");
            std::process::exit(2);
        }
    };

    let mut session = match Session::open(&address, InitFlags::empty()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    for param in [Param::Version, Param::StatusString, Param::CustomString] {
        match session.get_string(param) {
            Ok(value) => println!("{:<14} {}", param.name(), value),
            Err(e) => println!("{:<14} <{}>", param.name(), e),
        }
    }
    match session.get_float(Param::Frequency) {
        Ok(hz) => println!("{:<14} {:.1} Hz", Param::Frequency.name(), hz),
        Err(e) => println!("{:<14} <{}>", Param::Frequency.name(), e),
    }
    match session.get_cameras(32) {
        Ok(cameras) => println!("{:<14} {}", "cameras", cameras.len()),
        Err(e) => println!("{:<14} <{}>", "cameras", e),
    }
}

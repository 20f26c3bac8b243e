use crate::config::SessionConfig;
use crate::protocol::{self, Request, Response};
use crate::{OwlError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Message channel between a session and a server.
///
/// Implementations deliver requests in submission order. `recv` must return
/// [`OwlError::ConnectionClosed`] promptly once the transport is closed,
/// including from another thread through a [`CloseHandle`].
pub trait Transport: Send {
    /// Send one request tagged with `seq`.
    fn send(&mut self, seq: u32, request: &Request) -> Result<()>;

    /// Wait for the next response and its sequence number.
    ///
    /// The outer error means the transport failed. The inner one is a reply
    /// that arrived for `seq` but could not be decoded.
    fn recv(&mut self, timeout: Option<Duration>) -> Result<(u32, Result<Response>)>;

    /// Handle that closes this transport from any thread.
    fn close_handle(&self) -> CloseHandle;

    /// Close the transport. Idempotent.
    fn close(&mut self);
}

/// Cloneable handle that closes a session's transport.
///
/// Calls blocked on the transport return [`OwlError::ConnectionClosed`].
#[derive(Clone)]
pub struct CloseHandle {
    close: Arc<dyn Fn() + Send + Sync>,
}

impl CloseHandle {
    pub fn new(close: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            close: Arc::new(close),
        }
    }

    pub fn close(&self) {
        (self.close)();
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CloseHandle")
    }
}

type Incoming = Result<(u32, Result<Response>)>;

/// TCP transport speaking the framing in [`protocol`].
///
/// A background reader thread decodes responses and hands them over a
/// channel, so a blocked `recv` can be woken by closing the socket.
pub struct TcpTransport {
    stream: TcpStream,
    receiver: Receiver<Incoming>,
    closed: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TcpTransport {
    /// Connect to `address` (`host` or `host:port`).
    pub fn connect(address: &str, config: &SessionConfig) -> Result<TcpTransport> {
        let addrs = resolve(address, config.default_port)?;

        let mut last_err = None;
        let mut connected = None;
        for addr in &addrs {
            let attempt = match config.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => {
                    log::debug!("connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        let stream = connected.ok_or_else(|| OwlError::Connect {
            address: address.to_string(),
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".into()),
        })?;

        stream.set_nodelay(config.tcp_nodelay)?;
        let reader = stream.try_clone()?;

        let (sender, receiver) = crossbeam_channel::unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        let closed_clone = closed.clone();

        let thread = std::thread::Builder::new()
            .name("owl-reader".into())
            .spawn(move || {
                reader_loop(reader, sender, closed_clone);
            })?;

        log::debug!("TCP transport connected to {}", stream.peer_addr()?);

        Ok(TcpTransport {
            stream,
            receiver,
            closed,
            thread: Some(thread),
        })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, seq: u32, request: &Request) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OwlError::ConnectionClosed);
        }
        let frame = protocol::encode_request(seq, request)?;
        protocol::write_frame(&mut self.stream, &frame).map_err(|e| {
            if self.closed.load(Ordering::Acquire) {
                OwlError::ConnectionClosed
            } else {
                e
            }
        })
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<(u32, Result<Response>)> {
        let incoming = match timeout {
            Some(timeout) => self.receiver.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => OwlError::Timeout,
                RecvTimeoutError::Disconnected => OwlError::ConnectionClosed,
            })?,
            None => self
                .receiver
                .recv()
                .map_err(|_| OwlError::ConnectionClosed)?,
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(OwlError::ConnectionClosed);
        }
        incoming
    }

    fn close_handle(&self) -> CloseHandle {
        let closed = self.closed.clone();
        let stream = self.stream.try_clone();
        CloseHandle::new(move || {
            closed.store(true, Ordering::Release);
            if let Ok(stream) = &stream {
                let _ = stream.shutdown(Shutdown::Both);
            }
        })
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolve `host` or `host:port`, falling back to `default_port`.
fn resolve(address: &str, default_port: u16) -> Result<Vec<SocketAddr>> {
    let connect_err = |reason: String| OwlError::Connect {
        address: address.to_string(),
        reason,
    };

    let with_port = if address.parse::<SocketAddr>().is_ok() || has_port(address) {
        address.to_string()
    } else if address.contains(':') && !address.starts_with('[') {
        // Bare IPv6 literal.
        format!("[{}]:{}", address, default_port)
    } else {
        format!("{}:{}", address, default_port)
    };

    let addrs: Vec<SocketAddr> = with_port
        .to_socket_addrs()
        .map_err(|e| connect_err(e.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(connect_err("no addresses resolved".into()));
    }
    Ok(addrs)
}

fn has_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    }
}

/// Reads response frames until the socket closes.
///
/// A bad header means the stream lost framing and ends the loop. A payload
/// that fails to decode is forwarded as an error under its sequence number
/// and reading continues.
fn reader_loop(mut stream: TcpStream, sender: Sender<Incoming>, closed: Arc<AtomicBool>) {
    log::debug!("reader started");

    loop {
        let (header, payload) = match protocol::read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(e) => {
                if closed.load(Ordering::Acquire) {
                    log::debug!("reader stopping (closed locally)");
                } else {
                    log::info!("connection lost: {}", e);
                    let err = match e {
                        OwlError::Io(_) => OwlError::ConnectionClosed,
                        other => other,
                    };
                    let _ = sender.send(Err(err));
                    let _ = stream.shutdown(Shutdown::Both);
                }
                break;
            }
        };

        if !protocol::kind::is_response(header.kind) {
            log::warn!("ignoring non-response frame kind 0x{:02x}", header.kind);
            continue;
        }

        let response = protocol::decode_response(header.kind, &payload);
        if let Err(e) = &response {
            log::warn!("undecodable response seq={}: {}", header.seq, e);
        }
        let incoming = Ok((header.seq, response));

        if sender.send(incoming).is_err() {
            log::debug!("receiver dropped, stopping reader");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorCode;
    use std::net::TcpListener;

    #[test]
    fn test_has_port() {
        assert!(has_port("localhost:8000"));
        assert!(has_port("[::1]:8000"));
        assert!(!has_port("localhost"));
        assert!(!has_port("::1"));
    }

    #[test]
    fn test_resolve_default_port() {
        let addrs = resolve("127.0.0.1", 8123).unwrap();
        assert_eq!(addrs[0].port(), 8123);
        let addrs = resolve("127.0.0.1:9000", 8123).unwrap();
        assert_eq!(addrs[0].port(), 9000);
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = TcpTransport::connect(&format!("127.0.0.1:{}", port), &SessionConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, OwlError::Connect { .. }));
    }

    #[test]
    fn test_send_recv_and_close_wakes_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let (header, payload) = protocol::read_frame(&mut conn).unwrap();
            assert_eq!(protocol::decode_request(header.kind, &payload).unwrap(), Request::Sync);
            let reply = protocol::encode_response(
                header.seq,
                &Response::Status {
                    ok: true,
                    error: ErrorCode::NoError,
                },
            )
            .unwrap();
            protocol::write_frame(&mut conn, &reply).unwrap();
            // Hold the connection open without replying again.
            let _ = protocol::read_frame(&mut conn);
        });

        let mut transport =
            TcpTransport::connect(&addr.to_string(), &SessionConfig::default()).unwrap();
        transport.send(5, &Request::Sync).unwrap();
        let (seq, response) = transport.recv(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(seq, 5);
        assert!(matches!(response, Ok(Response::Status { ok: true, .. })));

        let handle = transport.close_handle();
        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.close();
        });
        let err = transport.recv(None).unwrap_err();
        assert!(matches!(err, OwlError::ConnectionClosed));
        closer.join().unwrap();

        transport.close();
        server.join().unwrap();
    }
}

use crate::types::{ErrorCode, InitFlags};
use std::fmt;

/// Errors that can occur when talking to a tracking server.
#[derive(Debug, thiserror::Error)]
pub enum OwlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("Server rejected init flags 0x{:04x}", .0.bits())]
    Rejected(InitFlags),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server reported {0}")]
    Protocol(ErrorCode),

    #[error("Timeout waiting for server")]
    Timeout,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },
}

impl OwlError {
    /// True for errors after which the session cannot be used any more.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            OwlError::Io(_) | OwlError::Connect { .. } | OwlError::ConnectionClosed
        )
    }

    /// Server error code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            OwlError::Protocol(code) => Some(*code),
            _ => None,
        }
    }
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &OwlError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}

//! Error types surfaced by the RFB-over-WebSocket client.
//!
//! Grounded on `sorng-vnc::vnc::types::VncError`/`VncErrorKind`, extended
//! with the error kinds spec'd for this crate's session controller (§7).

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of failure behind a [`VncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VncErrorKind {
    /// Endpoint scheme is not `ws`/`wss`, or the URL failed to parse.
    InvalidEndpoint,
    /// `connect()` called while already `connecting` or `connected`.
    AlreadyActive,
    /// The connect deadline elapsed before reaching `Connected`.
    Timeout,
    /// Transport closed abnormally; carries the close code separately.
    TransportClosed,
    /// Malformed inbound record, or a security offer with no usable fallback.
    ProtocolError,
    /// Server demands VNC Authentication but no password was configured.
    AuthRequired,
    /// VNC Authentication failed (bad password, or server reported failure).
    AuthFailed,
    /// Underlying I/O or WebSocket transport error.
    Io,
    /// Anything else — a bug, or a state that should be unreachable.
    Internal,
}

impl fmt::Display for VncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The single error type returned by every fallible operation in this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VncError {
    pub kind: VncErrorKind,
    pub message: String,
}

impl fmt::Display for VncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for VncError {}

impl VncError {
    pub fn new(kind: VncErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
        }
    }

    pub fn invalid_endpoint(msg: impl Into<String>) -> Self {
        Self::new(VncErrorKind::InvalidEndpoint, msg)
    }

    pub fn already_active() -> Self {
        Self::new(
            VncErrorKind::AlreadyActive,
            "connect() called while already connecting or connected",
        )
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(VncErrorKind::Timeout, msg)
    }

    pub fn transport_closed(msg: impl Into<String>) -> Self {
        Self::new(VncErrorKind::TransportClosed, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(VncErrorKind::ProtocolError, msg)
    }

    pub fn auth_required() -> Self {
        Self::new(
            VncErrorKind::AuthRequired,
            "server requires VNC Authentication but no password was configured",
        )
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(VncErrorKind::AuthFailed, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(VncErrorKind::Io, msg)
    }
}

impl From<std::io::Error> for VncError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused => Self::new(VncErrorKind::Io, e.to_string()),
            std::io::ErrorKind::TimedOut => Self::new(VncErrorKind::Timeout, e.to_string()),
            _ => Self::new(VncErrorKind::Io, e.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::new(VncErrorKind::Io, e.to_string())
    }
}

impl From<url::ParseError> for VncError {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_endpoint(e.to_string())
    }
}

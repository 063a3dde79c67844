//! Session configuration and the observable state snapshot.
//!
//! Grounded on `sorng-vnc::vnc::types::VncConfig` (field set, defaults via
//! `#[serde(default = ...)]`) narrowed to spec.md §3's `SessionOptions`.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::VncError;

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_scale() -> f64 {
    1.0
}

/// Immutable session configuration (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// `ws://` or `wss://` endpoint of the WebSocket-to-RFB bridge.
    pub endpoint: String,
    /// Password used only if the server offers security type 2.
    #[serde(default)]
    pub password: Option<String>,
    /// When true, input-send operations become no-ops.
    #[serde(default)]
    pub view_only: bool,
    /// Divides client-supplied pointer coordinates before wire encoding.
    /// Clamped to 0.1–2.0.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Connect deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Enables trace-level emission of raw bytes.
    #[serde(default)]
    pub debug: bool,
    /// Maximum number of automatic reconnect attempts after an abnormal close.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl SessionOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            password: None,
            view_only: false,
            scale: default_scale(),
            timeout_ms: default_timeout_ms(),
            debug: false,
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }

    /// Parsed, scheme-validated endpoint URL. Only `ws`/`wss` are accepted
    /// (spec.md §3, §4.4).
    pub fn parsed_endpoint(&self) -> Result<Url, VncError> {
        let url = Url::parse(&self.endpoint)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(VncError::invalid_endpoint(format!(
                "unsupported scheme '{}', expected ws or wss",
                other
            ))),
        }
    }

    /// `scale` clamped to the valid 0.1–2.0 range (spec.md §3).
    pub fn clamped_scale(&self) -> f64 {
        self.scale.clamp(0.1, 2.0)
    }
}

/// Observable session snapshot (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub connected: bool,
    pub connecting: bool,
    pub error: Option<String>,
    pub server_name: Option<String>,
    pub width: u16,
    pub height: u16,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connected: false,
            connecting: false,
            error: None,
            server_name: None,
            width: 0,
            height: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_spec_defaults() {
        let opts = SessionOptions::new("ws://localhost:5900/");
        assert_eq!(opts.timeout_ms, 10_000);
        assert_eq!(opts.max_reconnect_attempts, 3);
        assert_eq!(opts.scale, 1.0);
        assert!(!opts.view_only);
    }

    #[test]
    fn parsed_endpoint_accepts_ws_and_wss() {
        assert!(SessionOptions::new("ws://host/").parsed_endpoint().is_ok());
        assert!(SessionOptions::new("wss://host/").parsed_endpoint().is_ok());
    }

    #[test]
    fn parsed_endpoint_rejects_other_schemes() {
        let err = SessionOptions::new("http://host/").parsed_endpoint().unwrap_err();
        assert_eq!(err.kind, crate::error::VncErrorKind::InvalidEndpoint);
    }

    #[test]
    fn clamped_scale_bounds() {
        let mut opts = SessionOptions::new("ws://host/");
        opts.scale = 0.0;
        assert_eq!(opts.clamped_scale(), 0.1);
        opts.scale = 10.0;
        assert_eq!(opts.clamped_scale(), 2.0);
        opts.scale = 1.5;
        assert_eq!(opts.clamped_scale(), 1.5);
    }

    #[test]
    fn session_state_default_is_idle() {
        let s = SessionState::default();
        assert!(!s.connected);
        assert!(!s.connecting);
        assert!(s.error.is_none());
    }

    #[test]
    fn serde_roundtrip_minimal_json() {
        let json = r#"{"endpoint":"wss://host/ws"}"#;
        let opts: SessionOptions = serde_json::from_str(json).unwrap();
        assert_eq!(opts.timeout_ms, 10_000);
        assert_eq!(opts.max_reconnect_attempts, 3);
    }
}

//! Client-side implementation of the Remote Framebuffer (RFB) protocol
//! carried over a WebSocket transport.
//!
//! This crate negotiates a session with an RFB server, authenticates
//! (optionally, using the legacy VNC DES challenge-response), exchanges
//! screen geometry and pixel format, and then runs as a bidirectional
//! message pump: it relays user input (keyboard/pointer) to the server and
//! consumes server-initiated framebuffer updates and side-channel events.
//!
//! # Layout
//!
//! - [`codec`] — stateless builders/parsers for every RFB wire message this
//!   client sends or receives, plus the X11 keysym table.
//! - [`des`] — the VNC Authentication (security type 2) challenge-response,
//!   standard DES-ECB under a bit-reversed key.
//! - [`state_machine`] — the five-phase handshake state machine: consumes
//!   an unframed inbound byte stream and emits outbound bytes, phase
//!   transitions, and semantic events.
//! - [`session`] — [`session::VncSession`], the public entry point: owns
//!   the transport, drives the state machine, and manages connect
//!   timeouts, reconnect backoff, and grace-period teardown.
//! - [`events`] — the typed event bus fanning out lifecycle/data events to
//!   subscribers.
//! - [`transport`] — the WebSocket transport this crate drives
//!   (`tokio-tungstenite`-backed), behind a small trait so the session
//!   controller's tests can substitute a mock.
//! - [`config`] — [`config::SessionOptions`] (immutable configuration) and
//!   [`config::SessionState`] (the observable snapshot).
//! - [`error`] — the single [`error::VncError`] type returned by every
//!   fallible operation.
//!
//! # Example
//!
//! ```no_run
//! use rfb_ws_client::config::SessionOptions;
//! use rfb_ws_client::session::VncSession;
//!
//! # async fn run() -> Result<(), rfb_ws_client::error::VncError> {
//! let mut options = SessionOptions::new("ws://localhost:6080/websockify");
//! options.password = Some("secret".into());
//!
//! let session = VncSession::new(options);
//! let mut events = session.subscribe();
//! session.connect().await?;
//!
//! session.send_key_event("Enter", true);
//! session.send_key_event("Enter", false);
//! session.send_pointer_event(100, 100, 1);
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Out of scope for this crate (spec'd as external collaborators): the
//! presentation layer (drawing surface, status UI, input capture), pixel
//! decoding for non-Raw encodings, and multi-connection pooling.

pub mod codec;
pub mod config;
pub mod des;
pub mod error;
pub mod events;
pub mod session;
pub mod state_machine;
pub mod transport;

pub use config::{SessionOptions, SessionState};
pub use error::{VncError, VncErrorKind};
pub use events::Event;
pub use session::VncSession;

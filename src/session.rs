//! The Session Controller (spec.md §2 component 4, §4.4): owns the
//! transport handle, drives the protocol state machine, manages timers
//! (connect timeout, reconnect backoff, grace-period teardown), enforces
//! the single-connection invariant, and fans out semantic events to
//! subscribers.
//!
//! Grounded on `sorng-vnc::vnc::session`'s `VncSessionHandle`/`session_task`
//! split (a thin public handle that sends commands over an `mpsc` channel to
//! a task owning all mutable state), generalized per spec.md §5: one logical
//! task serialises inbound bytes, timer fires, and user operations onto a
//! single `tokio::select!` loop, so no locks are needed around protocol
//! state. The one place a lock is still useful is the externally-observable
//! `SessionState` snapshot (`get_state()`), which a caller may read from a
//! different task/thread than the one driving the controller; a plain
//! `std::sync::Mutex` never held across an `.await` is enough for that,
//! mirroring the teacher's `SharedSessionState` without adopting its
//! `tokio::Mutex` (nothing here awaits while holding it).

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec;
use crate::config::{SessionOptions, SessionState};
use crate::error::{VncError, VncErrorKind};
use crate::events::{Event, EventBus};
use crate::state_machine::{ProtocolPhase, StateMachine};
use crate::transport::{Transport, TransportEvent, WebSocketTransport};

/// Grace period (spec.md §5/§9) a controller defers irreversible transport
/// teardown by after `disconnect()`, to tolerate a remount storm (an
/// immediate `connect()` that follows a `disconnect()`) without emitting an
/// actual WebSocket close frame for a connection about to be re-established.
/// See DESIGN.md's Open Question log for why this only delays the *close
/// frame*, not any externally-observable state transition.
const GRACE_PERIOD_MS: u64 = 100;

/// Operations a [`VncSession`] handle sends to its controller task.
enum Command {
    Connect(oneshot::Sender<Result<(), VncError>>),
    Disconnect(oneshot::Sender<()>),
    SendKeyEvent { key: String, down: bool },
    SendPointerEvent { x: i32, y: i32, button_mask: u8 },
    RequestFramebufferUpdate { incremental: bool },
    SetEncodings { encodings: Vec<i32> },
    SendClientCutText { text: String },
}

/// Everything that can wake the controller loop. `Opened` results come back
/// through the same channel as commands so the `select!` loop only ever
/// needs to watch one queue plus the transport/timers.
enum Msg {
    Cmd(Command),
    Opened {
        generation: u64,
        result: Result<(WebSocketTransport, mpsc::UnboundedReceiver<TransportEvent>), VncError>,
    },
}

/// The public handle to a running session. Cheap to clone-by-reference
/// (observers only need `subscribe`/`get_state`); the controller task lives
/// as long as this handle (or any clone of its channel) does.
pub struct VncSession {
    options: SessionOptions,
    msg_tx: mpsc::UnboundedSender<Msg>,
    state: Arc<StdMutex<SessionState>>,
    events: Arc<EventBus>,
    task: JoinHandle<()>,
}

impl VncSession {
    /// Create a new, idle session. No transport is opened until
    /// [`Self::connect`] is called.
    pub fn new(options: SessionOptions) -> Self {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let state = Arc::new(StdMutex::new(SessionState::default()));
        let events = Arc::new(EventBus::new());

        let task = {
            let state = state.clone();
            let events = events.clone();
            let options = options.clone();
            let msg_tx = msg_tx.clone();
            tokio::spawn(async move {
                let mut controller = Controller::new(options, state, events, msg_tx);
                controller.run(msg_rx).await;
            })
        };

        Self {
            options,
            msg_tx,
            state,
            events,
            task,
        }
    }

    /// The configuration this session was created with.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Open the transport and run the RFB handshake. Resolves once the
    /// state machine reaches `Connected` or hits the first terminal failure
    /// (spec.md §4.4: "exactly-once completion").
    pub async fn connect(&self) -> Result<(), VncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .msg_tx
            .send(Msg::Cmd(Command::Connect(reply_tx)))
            .is_err()
        {
            return Err(VncError::new(VncErrorKind::Internal, "session task is gone"));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Err(VncError::new(VncErrorKind::Internal, "session task dropped reply")))
    }

    /// Idempotent disconnect. Always completes with the session in
    /// `Disconnected` and the reconnect counter zeroed.
    pub async fn disconnect(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .msg_tx
            .send(Msg::Cmd(Command::Disconnect(reply_tx)))
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }

    /// Send a key event. Dropped unless `Connected` and not `view_only`
    /// (spec.md §4.4); the key name is mapped to an X11 keysym by
    /// [`codec::key_to_keysym`], with unmapped names discarded before
    /// emission.
    pub fn send_key_event(&self, key: impl Into<String>, down: bool) {
        let _ = self.msg_tx.send(Msg::Cmd(Command::SendKeyEvent {
            key: key.into(),
            down,
        }));
    }

    /// Send a pointer event. Coordinates are divided by `scale`, floored,
    /// and clamped to the server's framebuffer dimensions (spec.md §4.4).
    pub fn send_pointer_event(&self, x: i32, y: i32, button_mask: u8) {
        let _ = self.msg_tx.send(Msg::Cmd(Command::SendPointerEvent {
            x,
            y,
            button_mask,
        }));
    }

    /// Request a framebuffer update covering the whole known screen.
    /// Dropped unless `Connected`.
    pub fn request_framebuffer_update(&self, incremental: bool) {
        let _ = self
            .msg_tx
            .send(Msg::Cmd(Command::RequestFramebufferUpdate { incremental }));
    }

    /// Tell the server which encodings this client accepts (SPEC_FULL.md
    /// §4.1's `SetEncodings` companion). Dropped unless `Connected`; not
    /// gated on `view_only` since it negotiates the wire format rather than
    /// sending user input.
    pub fn set_encodings(&self, encodings: &[i32]) {
        let _ = self.msg_tx.send(Msg::Cmd(Command::SetEncodings {
            encodings: encodings.to_vec(),
        }));
    }

    /// Send local clipboard text to the server (the send-side companion to
    /// the `ServerCutText` event). Dropped unless `Connected` and not
    /// `view_only`, matching the other input-send operations (spec.md §4.4).
    pub fn send_client_cut_text(&self, text: impl Into<String>) {
        let _ = self.msg_tx.send(Msg::Cmd(Command::SendClientCutText {
            text: text.into(),
        }));
    }

    /// A snapshot copy of the observable session state.
    pub fn get_state(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    /// Subscribe to the typed event stream (spec.md §6).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

impl Drop for VncSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Controller task ──────────────────────────────────────────────────────

struct Controller {
    options: SessionOptions,
    state: Arc<StdMutex<SessionState>>,
    events: Arc<EventBus>,
    msg_tx: mpsc::UnboundedSender<Msg>,

    generation: u64,
    transport: Option<Box<dyn Transport>>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pending_teardown: Option<Box<dyn Transport>>,
    state_machine: Option<StateMachine>,

    reconnect_attempts: u32,
    connect_reply: Option<oneshot::Sender<Result<(), VncError>>>,

    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    grace_teardown_at: Option<Instant>,
}

impl Controller {
    fn new(
        options: SessionOptions,
        state: Arc<StdMutex<SessionState>>,
        events: Arc<EventBus>,
        msg_tx: mpsc::UnboundedSender<Msg>,
    ) -> Self {
        Self {
            options,
            state,
            events,
            msg_tx,
            generation: 0,
            transport: None,
            transport_rx: None,
            pending_teardown: None,
            state_machine: None,
            reconnect_attempts: 0,
            connect_reply: None,
            connect_deadline: None,
            reconnect_at: None,
            grace_teardown_at: None,
        }
    }

    async fn run(&mut self, mut msg_rx: mpsc::UnboundedReceiver<Msg>) {
        loop {
            tokio::select! {
                msg = msg_rx.recv() => {
                    match msg {
                        Some(m) => self.handle_msg(m).await,
                        None => break,
                    }
                }
                ev = recv_transport(&mut self.transport_rx) => {
                    self.on_transport_event(ev);
                }
                _ = wait_opt(self.connect_deadline) => {
                    self.on_connect_timeout();
                }
                _ = wait_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_connect_attempt(None);
                }
                _ = wait_opt(self.grace_teardown_at) => {
                    self.grace_teardown_at = None;
                    if let Some(t) = self.pending_teardown.take() {
                        t.close(1000, "client disconnect".to_string());
                    }
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: Msg) {
        match msg {
            Msg::Cmd(Command::Connect(reply)) => self.cmd_connect(reply),
            Msg::Cmd(Command::Disconnect(reply)) => self.cmd_disconnect(reply),
            Msg::Cmd(Command::SendKeyEvent { key, down }) => self.cmd_send_key_event(key, down),
            Msg::Cmd(Command::SendPointerEvent { x, y, button_mask }) => {
                self.cmd_send_pointer_event(x, y, button_mask)
            }
            Msg::Cmd(Command::RequestFramebufferUpdate { incremental }) => {
                self.cmd_request_fb_update(incremental)
            }
            Msg::Cmd(Command::SetEncodings { encodings }) => self.cmd_set_encodings(encodings),
            Msg::Cmd(Command::SendClientCutText { text }) => self.cmd_send_client_cut_text(text),
            Msg::Opened { generation, result } => self.on_transport_opened(generation, result),
        }
    }

    // ── connect / disconnect ────────────────────────────────────────

    fn cmd_connect(&mut self, reply: oneshot::Sender<Result<(), VncError>>) {
        let already_active = {
            let st = self.state.lock().unwrap();
            st.connecting || st.connected
        };
        if already_active {
            let _ = reply.send(Err(VncError::already_active()));
            return;
        }
        let url = match self.options.parsed_endpoint() {
            Ok(u) => u,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        // A connect() arriving inside another session's grace window
        // supersedes it: the stale transport is torn down now rather than
        // waiting out the timer, preserving the single-owner invariant.
        self.grace_teardown_at = None;
        if let Some(t) = self.pending_teardown.take() {
            t.close(1000, "superseded by new connect".to_string());
        }
        self.teardown_transport();

        // A manual connect() arriving during a post-1006 reconnect backoff
        // must cancel that pending attempt — otherwise it fires later, bumps
        // `generation` again, and tears down the connection this call just
        // established (spec.md §4.4's "exactly-once completion").
        self.reconnect_at = None;

        self.connect_reply = Some(reply);
        self.start_connect_attempt_with_url(url);
    }

    /// Used for the initial `connect()` and for the automatic reconnect
    /// path (`reply` is `None` there — spec.md §4.4's reconnect policy has
    /// no caller awaiting a result).
    fn start_connect_attempt(&mut self, reply: Option<oneshot::Sender<Result<(), VncError>>>) {
        if let Some(reply) = reply {
            self.connect_reply = Some(reply);
        }
        match self.options.parsed_endpoint() {
            Ok(url) => self.start_connect_attempt_with_url(url),
            Err(e) => self.fail_connect(e),
        }
    }

    fn start_connect_attempt_with_url(&mut self, url: url::Url) {
        self.generation += 1;
        let generation = self.generation;
        self.state_machine = Some(StateMachine::new(self.options.password.clone()));
        self.connect_deadline =
            Some(Instant::now() + Duration::from_millis(self.options.timeout_ms));

        {
            let mut st = self.state.lock().unwrap();
            st.connecting = true;
            st.connected = false;
            st.error = None;
        }
        self.events.emit(Event::Connecting);

        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            let result = WebSocketTransport::open(&url).await;
            let _ = msg_tx.send(Msg::Opened { generation, result });
        });
    }

    fn on_transport_opened(
        &mut self,
        generation: u64,
        result: Result<(WebSocketTransport, mpsc::UnboundedReceiver<TransportEvent>), VncError>,
    ) {
        if generation != self.generation {
            // A stale attempt (superseded by a later connect() or already
            // timed out) — if it actually succeeded, don't leak it.
            if let Ok((transport, _rx)) = result {
                transport.detach();
                transport.close(1000, "stale connect attempt superseded".to_string());
            }
            return;
        }
        match result {
            Ok((transport, rx)) => {
                self.transport = Some(Box::new(transport));
                self.transport_rx = Some(rx);
            }
            Err(e) => self.fail_connect(e),
        }
    }

    fn cmd_disconnect(&mut self, reply: oneshot::Sender<()>) {
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.reconnect_attempts = 0;
        self.state_machine = None;

        if let Some(r) = self.connect_reply.take() {
            let _ = r.send(Err(VncError::new(
                VncErrorKind::Internal,
                "disconnected before connect completed",
            )));
        }

        let was_idle_already = {
            let st = self.state.lock().unwrap();
            !st.connected && !st.connecting
        } && self.transport.is_none()
            && self.pending_teardown.is_none();

        if let Some(t) = self.transport.take() {
            // Detach before scheduling the close so the close doesn't
            // surface through a handler that might otherwise trigger
            // reconnection (spec.md §4.4/§9).
            t.detach();
            self.transport_rx = None;
            self.pending_teardown = Some(t);
            self.grace_teardown_at =
                Some(Instant::now() + Duration::from_millis(GRACE_PERIOD_MS));
        }

        {
            let mut st = self.state.lock().unwrap();
            st.connecting = false;
            st.connected = false;
        }

        if !was_idle_already {
            self.events.emit(Event::Disconnected);
        }

        let _ = reply.send(());
    }

    fn teardown_transport(&mut self) {
        if let Some(t) = self.transport.take() {
            t.detach();
        }
        self.transport_rx = None;
    }

    // ── transport event handling ─────────────────────────────────────

    fn on_transport_event(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::Open => {
                log::debug!("transport open; awaiting server RFB version string");
            }
            TransportEvent::Message(bytes) => self.on_inbound_bytes(bytes),
            TransportEvent::Closed { code, reason } => self.on_transport_closed(code, reason),
            TransportEvent::Error(info) => {
                log::warn!("transport error: {}", info);
                self.on_transport_closed(1006, info);
            }
        }
    }

    fn on_inbound_bytes(&mut self, bytes: Vec<u8>) {
        if self.options.debug {
            log::trace!("inbound {} bytes: {:02x?}", bytes.len(), bytes);
        }
        let Some(sm) = self.state_machine.as_mut() else {
            return;
        };
        let step = sm.feed(&bytes);

        for out in &step.outbound {
            if self.options.debug {
                log::trace!("outbound {} bytes: {:02x?}", out.len(), out);
            } else {
                log::debug!("outbound {} bytes", out.len());
            }
            if let Some(t) = &self.transport {
                let _ = t.send(out.clone());
            }
        }

        for ev in step.events {
            self.apply_event(&ev);
            self.events.emit(ev);
        }

        if let Some(err) = step.failure {
            self.terminal_handshake_failure(err);
        }
    }

    fn apply_event(&mut self, ev: &Event) {
        match ev {
            Event::Connected => {
                self.connect_deadline = None;
                self.reconnect_attempts = 0;
                {
                    let mut st = self.state.lock().unwrap();
                    st.connecting = false;
                    st.connected = true;
                    st.error = None;
                    if let Some(sm) = &self.state_machine {
                        st.width = sm.server_width();
                        st.height = sm.server_height();
                        st.server_name = sm.server_name().map(ToString::to_string);
                    }
                }
                if let Some(reply) = self.connect_reply.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            Event::Error { message } => {
                self.state.lock().unwrap().error = Some(message.clone());
            }
            _ => {}
        }
    }

    /// A malformed record or an auth failure/requirement mid-handshake:
    /// always terminal, never eligible for reconnection (spec.md §7).
    fn terminal_handshake_failure(&mut self, err: VncError) {
        log::error!("protocol failure: {}", err);
        self.events.emit(Event::Error {
            message: err.message.clone(),
        });
        self.teardown_transport();
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.state_machine = None;

        {
            let mut st = self.state.lock().unwrap();
            st.connecting = false;
            st.connected = false;
            st.error = Some(err.message.clone());
        }
        self.events.emit(Event::Disconnected);

        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(err));
        }
    }

    fn fail_connect(&mut self, err: VncError) {
        log::error!("connect failed: {}", err);
        self.events.emit(Event::Error {
            message: err.message.clone(),
        });
        self.connect_deadline = None;
        self.state_machine = None;

        {
            let mut st = self.state.lock().unwrap();
            st.connecting = false;
            st.connected = false;
            st.error = Some(err.message.clone());
        }
        self.events.emit(Event::Disconnected);

        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(err));
        }
    }

    fn on_connect_timeout(&mut self) {
        self.connect_deadline = None;
        let connecting = self.state.lock().unwrap().connecting;
        if !connecting {
            return;
        }
        let err = VncError::timeout("connect deadline elapsed before reaching Connected");
        self.teardown_transport();
        self.terminal_handshake_failure_without_transport(err);
    }

    fn terminal_handshake_failure_without_transport(&mut self, err: VncError) {
        self.events.emit(Event::Error {
            message: err.message.clone(),
        });
        self.state_machine = None;
        self.reconnect_at = None;
        {
            let mut st = self.state.lock().unwrap();
            st.connecting = false;
            st.connected = false;
            st.error = Some(err.message.clone());
        }
        self.events.emit(Event::Disconnected);
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(err));
        }
    }

    fn on_transport_closed(&mut self, code: u16, reason: String) {
        let was_connected = self.state.lock().unwrap().connected;
        let message = close_code_message(code, &reason);

        self.teardown_transport();
        self.state_machine = None;
        self.connect_deadline = None;

        {
            let mut st = self.state.lock().unwrap();
            st.connecting = false;
            st.connected = false;
            if let Some(m) = &message {
                st.error = Some(m.clone());
            }
        }
        if let Some(m) = &message {
            self.events.emit(Event::Error { message: m.clone() });
        }
        self.events.emit(Event::Disconnected);

        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(VncError::transport_closed(
                message.clone().unwrap_or_default(),
            )));
        }

        self.reconnect_at = match code {
            1006 if was_connected && self.reconnect_attempts < self.options.max_reconnect_attempts => {
                self.reconnect_attempts += 1;
                let backoff_ms = reconnect_backoff_ms(self.reconnect_attempts);
                log::info!(
                    "scheduling reconnect attempt {}/{} in {}ms",
                    self.reconnect_attempts,
                    self.options.max_reconnect_attempts,
                    backoff_ms
                );
                Some(Instant::now() + Duration::from_millis(backoff_ms))
            }
            _ => None,
        };
    }

    // ── input operations ─────────────────────────────────────────────

    fn is_connected(&self) -> bool {
        self.state_machine
            .as_ref()
            .map(|sm| sm.phase() == ProtocolPhase::Connected)
            .unwrap_or(false)
    }

    fn cmd_send_key_event(&mut self, key: String, down: bool) {
        if self.options.view_only || !self.is_connected() {
            return;
        }
        let keysym = codec::key_to_keysym(&key);
        if keysym == 0 {
            return;
        }
        if let Some(t) = &self.transport {
            let _ = t.send(codec::write_key_event(down, keysym));
        }
    }

    fn cmd_send_pointer_event(&mut self, x: i32, y: i32, button_mask: u8) {
        if self.options.view_only || !self.is_connected() {
            return;
        }
        let (w, h) = self
            .state_machine
            .as_ref()
            .map(|sm| (sm.server_width(), sm.server_height()))
            .unwrap_or((0, 0));
        let (cx, cy) = clamp_pointer(x, y, self.options.clamped_scale(), w, h);
        if let Some(t) = &self.transport {
            let _ = t.send(codec::write_pointer_event(button_mask, cx, cy));
        }
    }

    fn cmd_request_fb_update(&mut self, incremental: bool) {
        if !self.is_connected() {
            return;
        }
        let (w, h) = self
            .state_machine
            .as_ref()
            .map(|sm| (sm.server_width(), sm.server_height()))
            .unwrap_or((0, 0));
        if let Some(t) = &self.transport {
            let _ = t.send(codec::write_fb_update_request(incremental, 0, 0, w, h));
        }
    }

    fn cmd_set_encodings(&mut self, encodings: Vec<i32>) {
        if !self.is_connected() {
            return;
        }
        if let Some(t) = &self.transport {
            let _ = t.send(codec::write_set_encodings(&encodings));
        }
    }

    fn cmd_send_client_cut_text(&mut self, text: String) {
        if self.options.view_only || !self.is_connected() {
            return;
        }
        if let Some(t) = &self.transport {
            let _ = t.send(codec::write_client_cut_text(&text));
        }
    }
}

// ── free functions (pure, unit-testable without a live task) ────────────

/// Reconnect backoff for the `n`th attempt (1-indexed): `min(1000*2^(n-1), 10_000)`
/// milliseconds (spec.md §4.4).
fn reconnect_backoff_ms(attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(10);
    (1000u64.saturating_mul(1u64 << shift)).min(10_000)
}

/// Close-code → user-visible error mapping (spec.md §4.4's "stable contract").
fn close_code_message(code: u16, reason: &str) -> Option<String> {
    match code {
        1000 => None,
        1006 => Some("connection lost unexpectedly".to_string()),
        1002 => Some("protocol error".to_string()),
        1003 => Some("server rejected connection (invalid data)".to_string()),
        1008 => Some("rejected by policy".to_string()),
        1011 => Some("server internal error".to_string()),
        other => Some(format!("closed with code {}: {}", other, reason)),
    }
}

/// Divide by `scale`, floor, then clamp to the largest valid coordinate on
/// a `width`x`height` framebuffer (spec.md §4.4, §8's boundary example).
fn clamp_pointer(x: i32, y: i32, scale: f64, width: u16, height: u16) -> (u16, u16) {
    let sx = (x as f64 / scale).floor();
    let sy = (y as f64 / scale).floor();
    let max_x = width.saturating_sub(1) as f64;
    let max_y = height.saturating_sub(1) as f64;
    let cx = sx.clamp(0.0, max_x) as u16;
    let cy = sy.clamp(0.0, max_y) as u16;
    (cx, cy)
}

async fn recv_transport(rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> TransportEvent {
    match rx {
        Some(r) => match r.recv().await {
            Some(ev) => ev,
            None => {
                *rx = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}

async fn wait_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

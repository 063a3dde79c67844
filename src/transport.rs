//! The WebSocket transport (spec.md §6's "Transport interface", treated by
//! the rest of the crate as an external collaborator it merely consumes).
//!
//! Grounded directly on
//! `supermarsx-sortOfRemoteNG/src-tauri/src/proxy.rs`'s
//! `connect_websocket_tunnel_static`/`handle_websocket_tunnel`: `connect_async`
//! to open, a split `SplitSink`/`SplitStream` pair, `Message::Binary` for
//! outbound frames, `Message::Close` detection on the inbound side, and a
//! `tokio::select!` loop bridging the two directions. The spec's
//! callback-shaped interface (`on_message`/`on_close`/`on_error`) is realised
//! here the idiomatic async-Rust way: a forwarding task plus a
//! `TransportEvent` channel, rather than literal callback registration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::error::VncError;

/// Events a transport can push upstream. The `Open` event confirms the
/// handshake is readable/writable; `Closed`/`Error` are terminal.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Message(Vec<u8>),
    Closed { code: u16, reason: String },
    Error(String),
}

/// The send/close surface the session controller drives. `open()` is not
/// part of the trait because it produces both the handle and its event
/// stream together — see `WebSocketTransport::open` and, for tests,
/// `MockTransport::open`.
pub trait Transport: Send + Sync {
    /// Enqueue a binary frame. Fire-and-forget, matching spec.md §6.
    fn send(&self, bytes: Vec<u8>) -> Result<(), VncError>;
    /// Request a close with the given code/reason. Idempotent.
    fn close(&self, code: u16, reason: String);
    /// Detach: stop delivering further events without sending a close
    /// frame, so a subsequent `close()` (or drop) does not surface as an
    /// abnormal closure to anything still reading the event channel
    /// (spec.md §9's "single-owner transport").
    fn detach(&self);
}

enum Outbound {
    Send(Vec<u8>),
    Close(u16, String),
}

/// Production transport: a live `tokio-tungstenite` WebSocket connection.
pub struct WebSocketTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    detached: Arc<AtomicBool>,
}

impl WebSocketTransport {
    /// Open a WebSocket connection to `url` and spawn its forwarding task.
    /// Returns the handle plus the event stream the caller should poll.
    pub async fn open(
        url: &Url,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), VncError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let detached = Arc::new(AtomicBool::new(false));

        let _ = event_tx.send(TransportEvent::Open);

        let task_detached = detached.clone();
        // Forward an event only while not detached — `detach()` silences this
        // side without killing the task, so a subsequent `close()` sent over
        // `out_rx` can still reach the socket and flush a real close frame.
        let forward = move |event_tx: &mpsc::UnboundedSender<TransportEvent>, event: TransportEvent| {
            if !task_detached.load(Ordering::Relaxed) {
                let _ = event_tx.send(event);
            }
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    inbound = read.next() => {
                        match inbound {
                            Some(Ok(WsMessage::Binary(data))) => {
                                forward(&event_tx, TransportEvent::Message(data.to_vec()));
                            }
                            Some(Ok(WsMessage::Close(frame))) => {
                                let (code, reason) = frame
                                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                                    .unwrap_or((1000, String::new()));
                                forward(&event_tx, TransportEvent::Closed { code, reason });
                                break;
                            }
                            Some(Ok(_)) => {
                                // Text/Ping/Pong/Frame — not used by RFB-over-WS.
                            }
                            Some(Err(e)) => {
                                forward(&event_tx, TransportEvent::Error(e.to_string()));
                                break;
                            }
                            None => {
                                forward(&event_tx, TransportEvent::Closed {
                                    code: 1006,
                                    reason: "stream ended without a close frame".into(),
                                });
                                break;
                            }
                        }
                    }
                    outbound = out_rx.recv() => {
                        match outbound {
                            Some(Outbound::Send(bytes)) => {
                                if write.send(WsMessage::Binary(bytes.into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Outbound::Close(code, reason)) => {
                                let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
                                    code: code.into(),
                                    reason: reason.into(),
                                };
                                let _ = write.send(WsMessage::Close(Some(frame))).await;
                                let _ = write.close().await;
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Ok((
            Self {
                outbound: out_tx,
                detached,
            },
            event_rx,
        ))
    }
}

impl Transport for WebSocketTransport {
    fn send(&self, bytes: Vec<u8>) -> Result<(), VncError> {
        self.outbound
            .send(Outbound::Send(bytes))
            .map_err(|_| VncError::transport_closed("transport task already stopped"))
    }

    fn close(&self, code: u16, reason: String) {
        let _ = self.outbound.send(Outbound::Close(code, reason));
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Relaxed);
    }
}

// No `Drop` impl aborts the forwarding task: dropping `outbound` closes the
// channel the task's `out_rx.recv()` is selecting on, which resolves to
// `None` and lets the task break its loop and exit on its own — including
// after a just-sent `close()`, which is still queued ahead of that `None`
// and gets processed (and its close frame flushed) first. Aborting here
// would race an in-flight `close()` and could drop the frame before the
// task is ever polled again.

#[cfg(test)]
pub mod mock {
    //! A transport double for state-machine and session tests: records
    //! everything `send()`s to it and lets the test inject inbound
    //! `TransportEvent`s on demand, instead of driving a real socket.

    use super::*;
    use std::sync::{Arc, Mutex};

    pub struct MockTransport {
        pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
        detached: Arc<Mutex<bool>>,
        close_requests: Arc<Mutex<Vec<(u16, String)>>>,
    }

    impl MockTransport {
        /// Returns the mock handle plus an injector the test uses to push
        /// `TransportEvent`s as if they arrived from the wire.
        pub fn open() -> (Self, mpsc::UnboundedSender<TransportEvent>, mpsc::UnboundedReceiver<TransportEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    sent: Arc::new(Mutex::new(Vec::new())),
                    detached: Arc::new(Mutex::new(false)),
                    close_requests: Arc::new(Mutex::new(Vec::new())),
                },
                tx,
                rx,
            )
        }

        pub fn sent_messages(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        pub fn was_detached(&self) -> bool {
            *self.detached.lock().unwrap()
        }

        pub fn close_requests(&self) -> Vec<(u16, String)> {
            self.close_requests.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn send(&self, bytes: Vec<u8>) -> Result<(), VncError> {
            self.sent.lock().unwrap().push(bytes);
            Ok(())
        }

        fn close(&self, code: u16, reason: String) {
            self.close_requests.lock().unwrap().push((code, reason));
        }

        fn detach(&self) {
            *self.detached.lock().unwrap() = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn mock_transport_records_sent_bytes() {
        let (mock, _injector, _rx) = MockTransport::open();
        mock.send(vec![1, 2, 3]).unwrap();
        mock.send(vec![4]).unwrap();
        assert_eq!(mock.sent_messages(), vec![vec![1, 2, 3], vec![4]]);
    }

    #[test]
    fn mock_transport_tracks_detach_and_close() {
        let (mock, _injector, _rx) = MockTransport::open();
        assert!(!mock.was_detached());
        mock.detach();
        assert!(mock.was_detached());

        mock.close(1000, "bye".into());
        assert_eq!(mock.close_requests(), vec![(1000, "bye".to_string())]);
    }

    #[tokio::test]
    async fn mock_transport_delivers_injected_events_in_order() {
        let (_mock, injector, mut rx) = MockTransport::open();
        injector.send(TransportEvent::Open).unwrap();
        injector
            .send(TransportEvent::Message(vec![0xAA]))
            .unwrap();
        injector
            .send(TransportEvent::Closed {
                code: 1006,
                reason: String::new(),
            })
            .unwrap();

        assert!(matches!(rx.recv().await, Some(TransportEvent::Open)));
        assert!(matches!(rx.recv().await, Some(TransportEvent::Message(_))));
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Closed { code: 1006, .. })
        ));
    }
}

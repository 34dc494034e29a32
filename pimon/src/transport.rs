//! Duplex text stream to the host's terminal endpoint.
//!
//! A transport opens links without blocking. Each link reports its lifecycle
//! through an [`EventSink`] that stamps every event with the connection
//! attempt (epoch) it belongs to, so the consumer can drop events from
//! superseded attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};
use url::Url;

/// Close code sent when we end the session ourselves.
pub const NORMAL_CLOSURE: u16 = 1000;
// no close frame received / socket dropped without one
const NO_STATUS: u16 = 1005;
const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Closed { code: u16, reason: String },
    Failure(String),
}

/// Epoch-stamped event sender handed to a transport for one connection attempt.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false once the consumer is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.epoch, event)).is_ok()
    }
}

/// Handle to one live (or still connecting) connection.
pub trait TransportLink: Send + Sync {
    /// Queue a text frame; false if the link is not open.
    fn send(&self, text: &str) -> bool;
    /// Request a close handshake. Safe to call more than once.
    fn close(&self, code: u16, reason: &str);
}

pub trait TerminalTransport: Send + Sync + 'static {
    /// Start connecting to `url`; returns immediately.
    fn open(&self, url: &Url, sink: EventSink) -> Box<dyn TransportLink>;
}

/// Reassembles UTF-8 text from byte chunks that may split a character.
///
/// An incomplete trailing sequence is held back until the next chunk; bytes
/// that can never form a character become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` after any held-back tail; returns the complete text so far.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // cut mid-character: wait for the rest
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// Whatever is still held back, lossily decoded.
    pub fn flush(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

fn emit_text(sink: &EventSink, text: String) {
    if !text.is_empty() {
        sink.emit(TransportEvent::Message(text));
    }
}

// --- WebSocket transport ---

enum Outgoing {
    Text(String),
    Close(u16, String),
}

/// tokio-tungstenite transport with a periodic ping to keep idle shells alive.
#[derive(Debug, Clone)]
pub struct WsTransport {
    keepalive: Duration,
}

impl WsTransport {
    pub fn new(keepalive: Duration) -> Self {
        Self { keepalive }
    }
}

struct WsLink {
    cmd_tx: mpsc::UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
}

impl TransportLink for WsLink {
    fn send(&self, text: &str) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        self.cmd_tx.send(Outgoing::Text(text.to_string())).is_ok()
    }

    fn close(&self, code: u16, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Outgoing::Close(code, reason.to_string()));
    }
}

impl TerminalTransport for WsTransport {
    fn open(&self, url: &Url, sink: EventSink) -> Box<dyn TransportLink> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_link(
            url.clone(),
            sink,
            cmd_rx,
            open.clone(),
            self.keepalive,
        ));
        Box::new(WsLink { cmd_tx, open })
    }
}

async fn run_link(
    url: Url,
    sink: EventSink,
    mut cmd_rx: mpsc::UnboundedReceiver<Outgoing>,
    open: Arc<AtomicBool>,
    keepalive: Duration,
) {
    let epoch = sink.epoch();
    debug!(%url, epoch, "terminal connecting");

    // A close requested while the handshake is pending aborts it.
    let connecting = connect_async(url.as_str());
    tokio::pin!(connecting);
    let ws = loop {
        tokio::select! {
            res = &mut connecting => match res {
                Ok((ws, _)) => break ws,
                Err(e) => {
                    sink.emit(TransportEvent::Failure(e.to_string()));
                    return;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Outgoing::Close(code, reason)) => {
                    sink.emit(TransportEvent::Closed { code, reason });
                    return;
                }
                Some(Outgoing::Text(_)) => continue,
                None => return,
            },
        }
    };

    open.store(true, Ordering::SeqCst);
    info!(%url, epoch, "terminal connected");
    sink.emit(TransportEvent::Open);

    let (mut write, mut read) = ws.split();
    let mut utf8 = Utf8Stream::new();
    let mut ping = tokio::time::interval(keepalive);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    emit_text(&sink, utf8.flush());
                    sink.emit(TransportEvent::Message(text));
                }
                // the host's pty output arrives in fixed-size binary chunks
                Some(Ok(Message::Binary(bytes))) => {
                    emit_text(&sink, utf8.push(&bytes));
                }
                Some(Ok(Message::Close(frame))) => {
                    emit_text(&sink, utf8.flush());
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((NO_STATUS, String::new()));
                    sink.emit(TransportEvent::Closed { code, reason });
                    break;
                }
                Some(Ok(_)) => {} // ping/pong handled by tungstenite
                Some(Err(e)) => {
                    emit_text(&sink, utf8.flush());
                    sink.emit(TransportEvent::Failure(e.to_string()));
                    break;
                }
                None => {
                    emit_text(&sink, utf8.flush());
                    sink.emit(TransportEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "connection dropped".into(),
                    });
                    break;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        sink.emit(TransportEvent::Failure(e.to_string()));
                        break;
                    }
                }
                Some(Outgoing::Close(code, reason)) => {
                    emit_text(&sink, utf8.flush());
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    sink.emit(TransportEvent::Closed { code, reason });
                    break;
                }
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    sink.emit(TransportEvent::Failure(e.to_string()));
                    break;
                }
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    debug!(epoch, "terminal link finished");
}

//! Terminal session: one logical shell connection that survives target switches.
//!
//! ```text
//!   Connecting ──open──▶ Open ──closed──▶ Closed(code, reason)
//!        │                 │
//!        └────failure──────┴──────────▶ Failed(message)
//!
//!   any state ──reconnect──▶ Connecting (new epoch, empty transcript)
//! ```
//!
//! Every connection attempt gets a new epoch. The epoch is bumped
//! synchronously in `reconnect`/`close`, before the old link is torn down,
//! and the single event pump compares it again under the state lock before
//! applying anything. Events from a superseded attempt are dropped; a late
//! `Open` from one also closes its socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::sanitize::sanitize;
use crate::transport::{
    EventSink, TerminalTransport, TransportEvent, TransportLink, NORMAL_CLOSURE,
};
use crate::types::Resource;

const STATUS_CAPACITY: usize = 16;
const CLOSE_REASON: &str = "Normal closure";
const INTERRUPT: &str = "\u{3}";
const BACKSPACE: &str = "\u{7f}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Connecting,
    Open,
    Closed { code: u16, reason: String },
    Failed(String),
}

/// Published snapshot of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalState {
    pub epoch: u64,
    pub connection: Connection,
    /// Sanitized text received since the last connect.
    pub transcript: String,
    pub error: Option<String>,
    /// A submitted line has not been answered yet.
    pub awaiting_reply: bool,
}

impl TerminalState {
    fn connecting(epoch: u64) -> Self {
        Self {
            epoch,
            connection: Connection::Connecting,
            transcript: String::new(),
            error: None,
            awaiting_reply: false,
        }
    }

    pub fn output(&self) -> Resource<String> {
        if let Some(e) = &self.error {
            return Resource::Error(e.clone());
        }
        if self.awaiting_reply {
            return Resource::Loading;
        }
        Resource::Success(self.transcript.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.connection == Connection::Open
    }

    pub fn is_connecting(&self) -> bool {
        self.connection == Connection::Connecting
    }
}

/// Result of [`TerminalSession::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Sent,
    /// Blank input, nothing sent.
    Ignored,
    NotConnected,
}

#[derive(Default)]
struct Links {
    current: Option<(u64, Box<dyn TransportLink>)>,
    // superseded links that may still report in
    retired: HashMap<u64, Box<dyn TransportLink>>,
}

struct Inner {
    transport: Arc<dyn TerminalTransport>,
    epoch: AtomicU64,
    links: Mutex<Links>,
    state: watch::Sender<TerminalState>,
    status: broadcast::Sender<Connection>,
    message_subs: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl Inner {
    fn links(&self) -> std::sync::MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Apply `f` if `epoch` is still the published one; returns whether it was.
    fn apply(&self, epoch: u64, f: impl FnOnce(&mut TerminalState)) -> bool {
        self.state.send_if_modified(|s| {
            if s.epoch != epoch {
                return false;
            }
            f(s);
            true
        })
    }

    fn announce(&self, c: Connection) {
        // no subscribers is fine
        let _ = self.status.send(c);
    }

    fn forward_message(&self, raw: &str) {
        let mut subs = self.message_subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(raw.to_string()).is_ok());
    }

    fn drop_current(&self, epoch: u64) {
        let mut links = self.links();
        if links.current.as_ref().is_some_and(|(e, _)| *e == epoch) {
            links.current = None;
        }
    }

    fn handle(&self, epoch: u64, event: TransportEvent) {
        if !self.is_current(epoch) {
            self.handle_stale(epoch, event);
            return;
        }
        match event {
            TransportEvent::Open => {
                if self.apply(epoch, |s| {
                    s.connection = Connection::Open;
                    s.error = None;
                }) {
                    info!(epoch, "terminal open");
                    self.announce(Connection::Open);
                }
            }
            TransportEvent::Message(raw) => {
                let clean = sanitize(&raw);
                let mut current = false;
                self.state.send_if_modified(|s| {
                    if s.epoch != epoch {
                        return false;
                    }
                    current = true;
                    // keep-alive frames arrive empty
                    if clean.is_empty() {
                        return false;
                    }
                    s.transcript.push_str(&clean);
                    s.awaiting_reply = false;
                    true
                });
                if current {
                    self.forward_message(&raw);
                }
            }
            TransportEvent::Closed { code, reason } => {
                let c = Connection::Closed { code, reason };
                if self.apply(epoch, |s| {
                    s.connection = c.clone();
                    s.awaiting_reply = false;
                }) {
                    info!(epoch, ?c, "terminal closed");
                    self.drop_current(epoch);
                    self.announce(c);
                }
            }
            TransportEvent::Failure(message) => {
                if self.apply(epoch, |s| {
                    s.connection = Connection::Failed(message.clone());
                    s.error = Some(message.clone());
                    s.awaiting_reply = false;
                }) {
                    warn!(epoch, error = %message, "terminal failed");
                    self.drop_current(epoch);
                    self.announce(Connection::Failed(message));
                }
            }
        }
    }

    fn handle_stale(&self, epoch: u64, event: TransportEvent) {
        debug!(epoch, ?event, "dropping event from superseded connection");
        match event {
            TransportEvent::Open => {
                if let Some(link) = self.links().retired.remove(&epoch) {
                    link.close(NORMAL_CLOSURE, "superseded");
                }
            }
            TransportEvent::Closed { .. } | TransportEvent::Failure(_) => {
                self.links().retired.remove(&epoch);
            }
            TransportEvent::Message(_) => {}
        }
    }
}

pub struct TerminalSession {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl TerminalSession {
    /// Create an idle session in `Connecting` state. Must be called within a tokio runtime.
    pub fn new(transport: Arc<dyn TerminalTransport>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TerminalState::connecting(0));
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        let inner = Arc::new(Inner {
            transport,
            epoch: AtomicU64::new(0),
            links: Mutex::new(Links::default()),
            state,
            status,
            message_subs: Mutex::new(Vec::new()),
            events_tx,
        });
        let pump = tokio::spawn(pump(inner.clone(), events_rx));
        Self { inner, pump }
    }

    pub fn connect(&self, url: Url) {
        self.reconnect(url);
    }

    /// Replace the current connection with a new attempt against `url`.
    pub fn reconnect(&self, url: Url) {
        let inner = &self.inner;
        let mut links = inner.links();
        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        inner.state.send_replace(TerminalState::connecting(epoch));

        if let Some((old_epoch, old)) = links.current.take() {
            old.close(NORMAL_CLOSURE, "reconnecting");
            links.retired.insert(old_epoch, old);
        }
        info!(%url, epoch, "terminal connecting");
        let sink = EventSink::new(epoch, inner.events_tx.clone());
        let link = inner.transport.open(&url, sink);
        links.current = Some((epoch, link));
        drop(links);
        inner.announce(Connection::Connecting);
    }

    /// Write raw text to the live connection; false when nothing is open.
    pub fn send(&self, text: &str) -> bool {
        let links = self.inner.links();
        let Some((epoch, link)) = links.current.as_ref() else {
            return false;
        };
        let open = {
            let s = self.inner.state.borrow();
            s.epoch == *epoch && s.connection == Connection::Open
        };
        open && link.send(text)
    }

    /// Send one command line; the output shows Loading until the host answers.
    pub fn submit(&self, line: &str) -> Submit {
        let line = line.trim();
        if line.is_empty() {
            return Submit::Ignored;
        }
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        // flag first, so a reply racing the write clears it
        let marked = self.inner.state.send_if_modified(|s| {
            if s.epoch != epoch || s.connection != Connection::Open {
                return false;
            }
            s.awaiting_reply = true;
            true
        });
        if !marked {
            return Submit::NotConnected;
        }
        if !self.send(&format!("{line}\n")) {
            self.inner.apply(epoch, |s| s.awaiting_reply = false);
            return Submit::NotConnected;
        }
        Submit::Sent
    }

    /// Ctrl-C to the remote foreground process.
    pub fn send_interrupt(&self) -> bool {
        self.send(INTERRUPT)
    }

    /// DEL, erasing one character on the remote line.
    pub fn send_backspace(&self) -> bool {
        self.send(BACKSPACE)
    }

    /// Tear down the connection. Idempotent.
    pub fn close(&self) {
        let inner = &self.inner;
        let mut links = inner.links();
        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let closed = Connection::Closed {
            code: NORMAL_CLOSURE,
            reason: CLOSE_REASON.into(),
        };
        let had_link = links.current.take();
        inner.state.send_if_modified(|s| {
            s.epoch = epoch;
            if had_link.is_none() {
                return false;
            }
            s.connection = closed.clone();
            s.awaiting_reply = false;
            true
        });
        drop(links);
        if let Some((old_epoch, link)) = had_link {
            info!(epoch = old_epoch, "terminal closing");
            link.close(NORMAL_CLOSURE, CLOSE_REASON);
            inner.announce(closed);
        }
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TerminalState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TerminalState> {
        self.inner.state.subscribe()
    }

    /// Level-triggered connectivity changes; a slow reader loses the oldest ones.
    pub fn subscribe_status(&self) -> broadcast::Receiver<Connection> {
        self.inner.status.subscribe()
    }

    /// Raw inbound text of the current connection, in order, nothing dropped.
    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .message_subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.close();
        self.pump.abort();
    }
}

// Sole consumer of transport events: applies them strictly in delivery order.
async fn pump(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>) {
    while let Some((epoch, event)) = events.recv().await {
        inner.handle(epoch, event);
    }
}

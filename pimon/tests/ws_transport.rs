//! WebSocket transport and session against an in-process shell stand-in.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::routing::get;
use axum::Router;
use tokio::sync::{mpsc, watch};
use url::Url;

use pimon::session::{Connection, Submit, TerminalSession, TerminalState};
use pimon::transport::{EventSink, TerminalTransport, TransportEvent, Utf8Stream, WsTransport};

async fn shell(mut socket: WebSocket, pings: Arc<AtomicUsize>) {
    let banner = "\u{1b}]0;pi@raspberrypi: ~\u{7}\u{1b}[1mwelcome\u{1b}[0m\r\n";
    if socket.send(Message::Text(banner.into())).await.is_err() {
        return;
    }
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(t) if t == "exit\n" => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: 1000,
                        reason: "bye".into(),
                    })))
                    .await;
                break;
            }
            // pty output split mid-character, as the host's fixed-size reads do
            Message::Text(t) if t == "temp\n" => {
                let chunks: [&[u8]; 3] = [b"23.5\xC2", b"\xB0C \xE2\x94", b"\x80\n"];
                for chunk in chunks {
                    if socket.send(Message::Binary(chunk.to_vec())).await.is_err() {
                        return;
                    }
                }
            }
            Message::Text(t) => {
                if socket
                    .send(Message::Text(format!("echo: {t}")))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Ping(_) => {
                pings.fetch_add(1, Ordering::SeqCst);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn serve(pings: Arc<AtomicUsize>) -> SocketAddr {
    let router = Router::new().route(
        "/terminal/ws",
        get(move |ws: WebSocketUpgrade| {
            let pings = pings.clone();
            async move { ws.on_upgrade(move |socket| shell(socket, pings)) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn terminal_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("ws://{addr}/terminal/ws")).unwrap()
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<(u64, TransportEvent)>) -> (u64, TransportEvent) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event in time")
        .expect("link alive")
}

#[tokio::test]
async fn test_link_lifecycle() {
    let addr = serve(Arc::default()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = WsTransport::new(Duration::from_secs(30));
    let link = transport.open(&terminal_url(addr), EventSink::new(7, tx));

    assert!(!link.send("too early"));
    assert_eq!(next_event(&mut rx).await, (7, TransportEvent::Open));
    match next_event(&mut rx).await {
        (7, TransportEvent::Message(m)) => assert!(m.contains("welcome")),
        other => panic!("expected banner, got {other:?}"),
    }

    assert!(link.send("hi"));
    assert_eq!(
        next_event(&mut rx).await,
        (7, TransportEvent::Message("echo: hi".into()))
    );

    link.close(1000, "done");
    assert_eq!(
        next_event(&mut rx).await,
        (
            7,
            TransportEvent::Closed {
                code: 1000,
                reason: "done".into()
            }
        )
    );
    assert!(!link.send("after close"));
}

#[tokio::test]
async fn test_refused_connection_is_a_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _link = WsTransport::new(Duration::from_secs(30)).open(&terminal_url(dead), EventSink::new(1, tx));
    assert!(matches!(
        next_event(&mut rx).await,
        (1, TransportEvent::Failure(_))
    ));
}

#[tokio::test]
async fn test_keepalive_pings_idle_link() {
    let pings = Arc::new(AtomicUsize::new(0));
    let addr = serve(pings.clone()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = WsTransport::new(Duration::from_millis(100)).open(&terminal_url(addr), EventSink::new(1, tx));
    assert_eq!(next_event(&mut rx).await.1, TransportEvent::Open);

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(pings.load(Ordering::SeqCst) >= 2);
    link.close(1000, "done");
}

async fn wait_text(rx: &mut watch::Receiver<TerminalState>, needle: &str) -> TerminalState {
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.transcript.contains(needle)),
    )
    .await
    .expect("text in time")
    .expect("session alive")
    .clone()
}

#[tokio::test]
async fn test_session_over_websocket() {
    let addr = serve(Arc::default()).await;
    let session = TerminalSession::new(Arc::new(WsTransport::new(Duration::from_secs(30))));
    let mut rx = session.subscribe();
    session.connect(terminal_url(addr));

    let s = wait_text(&mut rx, "welcome").await;
    assert!(s.is_connected());
    assert_eq!(s.transcript, "welcome\n");

    assert_eq!(session.submit("uptime"), Submit::Sent);
    let s = wait_text(&mut rx, "echo: uptime").await;
    assert_eq!(s.transcript, "welcome\necho: uptime\n");
    assert!(!s.awaiting_reply);

    assert_eq!(session.submit("exit"), Submit::Sent);
    let s = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| matches!(s.connection, Connection::Closed { .. })),
    )
    .await
    .expect("close in time")
    .expect("session alive")
    .clone();
    assert_eq!(
        s.connection,
        Connection::Closed {
            code: 1000,
            reason: "bye".into()
        }
    );
    assert_eq!(session.submit("ls"), Submit::NotConnected);
}

#[tokio::test]
async fn test_binary_frames_split_inside_a_character() {
    let addr = serve(Arc::default()).await;
    let session = TerminalSession::new(Arc::new(WsTransport::new(Duration::from_secs(30))));
    let mut rx = session.subscribe();
    session.connect(terminal_url(addr));
    wait_text(&mut rx, "welcome").await;

    assert_eq!(session.submit("temp"), Submit::Sent);
    let s = wait_text(&mut rx, "─\n").await;
    assert_eq!(s.transcript, "welcome\n23.5°C ─\n");
    assert!(!s.transcript.contains(char::REPLACEMENT_CHARACTER));
}

#[test]
fn test_utf8_stream_holds_back_partial_characters() {
    let mut utf8 = Utf8Stream::new();
    assert_eq!(utf8.push(b"23.5\xC2"), "23.5");
    assert_eq!(utf8.push(b"\xB0C"), "°C");
    assert_eq!(utf8.push(b"\xE2"), "");
    assert_eq!(utf8.push(b"\x94"), "");
    assert_eq!(utf8.push(b"\x80!"), "─!");
    assert_eq!(utf8.flush(), "");
}

#[test]
fn test_utf8_stream_replaces_invalid_bytes() {
    let mut utf8 = Utf8Stream::new();
    assert_eq!(utf8.push(b"a\xFFb\xC3"), "a\u{FFFD}b");
    // a dangling lead byte at the end of the stream
    assert_eq!(utf8.flush(), "\u{FFFD}");
    assert_eq!(utf8.push(b"ok"), "ok");
}

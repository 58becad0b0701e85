//! Plain transport integration tests against loopback listeners.

mod common;

use common::*;
use sockd_session::{
    ErrorCode, Plain, ServerError, ServerEvent, ServerHandler, ServerOptions, Session,
    SessionError, SessionHandler, SessionOptions, TcpServer,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn options_with(session: SessionOptions) -> ServerOptions {
    ServerOptions {
        session,
        ..Default::default()
    }
}

async fn read_exact(client: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    tokio::time::timeout(EVENT_TIMEOUT, client.read_exact(&mut data))
        .await
        .expect("timed out reading from server")
        .unwrap();
    data
}

#[tokio::test]
async fn test_echo_roundtrip() {
    let (server, mut rx) = start_tcp(ServerOptions::default(), true);
    let mut client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;
    assert!(session.is_connected());
    assert_eq!(session.peer_addr(), Some(client.local_addr().unwrap()));

    client.write_all(b"hello sockd").await.unwrap();
    assert_eq!(read_exact(&mut client, 11).await, b"hello sockd");

    let sent = wait_for(&mut rx, |event| match event {
        Event::Sent(_, sent) => Some(sent),
        _ => None,
    })
    .await;
    assert_eq!(sent, 11);

    let stats = session.stats();
    assert_eq!(stats.bytes_received, 11);
    assert_eq!(stats.bytes_sent, 11);
    assert_eq!(server.stats().bytes_received, 11);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_send_limit_rejects_overflow() {
    let options = options_with(SessionOptions {
        send_buffer_limit: 100,
        ..Default::default()
    });
    let (server, mut rx) = start_tcp(options, false);
    let mut client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;

    session.enqueue(&[7u8; 60]).unwrap();
    assert_eq!(session.stats().bytes_pending, 60);

    let rejected = session.enqueue(&[8u8; 60]);
    assert!(matches!(
        rejected,
        Err(SessionError::NoBufferSpace {
            pending: 60,
            requested: 60,
            limit: 100
        })
    ));
    assert_eq!(session.stats().bytes_pending, 60);

    let code = wait_for(&mut rx, |event| match event {
        Event::Error(_, code) => Some(code),
        _ => None,
    })
    .await;
    assert_eq!(code, ErrorCode::NoBufferSpace);
    assert!(session.is_connected());

    assert_eq!(read_exact(&mut client, 60).await, vec![7u8; 60]);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unlimited_send_buffer_accepts_large_payloads() {
    let (server, mut rx) = start_tcp(ServerOptions::default(), false);
    let mut client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;

    let payload = vec![3u8; 256 * 1024];
    session.enqueue(&payload).unwrap();
    session.enqueue(&payload).unwrap();

    assert_eq!(read_exact(&mut client, payload.len() * 2).await.len(), payload.len() * 2);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_peer_close_disconnects_without_error() {
    let (server, mut rx) = start_tcp(ServerOptions::default(), false);
    let client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;
    drop(client);

    let events = collect_until_disconnected(&mut rx, session.id()).await;
    assert!(events.iter().all(|event| !matches!(event, Event::Error(..))));
    assert!(!session.is_connected());
    assert!(server.find(session.id()).is_none());
    assert_eq!(server.connected_sessions(), 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_receive_buffer_doubles_when_filled() {
    let options = options_with(SessionOptions {
        receive_buffer_size: 16,
        ..Default::default()
    });
    let (server, mut rx) = start_tcp(options, false);
    let mut client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;
    assert_eq!(session.receive_buffer_capacity(), 16);

    client.write_all(&[1u8; 16]).await.unwrap();
    let data = wait_for(&mut rx, |event| match event {
        Event::Received(_, data) => Some(data),
        _ => None,
    })
    .await;
    assert_eq!(data.len(), 16);
    assert_eq!(session.receive_buffer_capacity(), 32);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_receive_limit_disconnects() {
    let options = options_with(SessionOptions {
        receive_buffer_size: 16,
        receive_buffer_limit: 24,
        ..Default::default()
    });
    let (server, mut rx) = start_tcp(options, false);
    let mut client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;

    client.write_all(&[1u8; 16]).await.unwrap();
    let events = collect_until_disconnected(&mut rx, session.id()).await;

    let errors: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Error(_, code) => Some(*code),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![ErrorCode::NoBufferSpace]);
    assert_eq!(session.receive_buffer_capacity(), 16);
    assert!(server.find(session.id()).is_none());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_enqueue_preserves_byte_order() {
    let (server, mut rx) = start_tcp(ServerOptions::default(), false);
    let mut client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;

    let mut expected = Vec::new();
    for i in 0..200u32 {
        let chunk = format!("chunk-{:04};", i).into_bytes();
        session.enqueue(&chunk).unwrap();
        expected.extend_from_slice(&chunk);
        if i % 7 == 0 {
            tokio::task::yield_now().await;
        }
    }

    assert_eq!(read_exact(&mut client, expected.len()).await, expected);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_direct_send() {
    let (server, mut rx) = start_tcp(ServerOptions::default(), false);
    let mut client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;

    assert_eq!(session.send(b"direct").await.unwrap(), 6);
    assert_eq!(session.send(b"").await.unwrap(), 0);
    assert_eq!(read_exact(&mut client, 6).await, b"direct");
    assert_eq!(session.stats().bytes_sent, 6);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_disconnect_runs_once() {
    let (server, mut rx) = start_tcp(ServerOptions::default(), false);
    let _client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;

    let (first, second) = tokio::join!(session.disconnect(), session.disconnect());
    assert!(first ^ second, "exactly one disconnect must win");
    assert!(!session.disconnect().await);
    assert!(!session.disconnect_async());

    let events = drain_for(&mut rx, Duration::from_millis(200)).await;
    let disconnected = events
        .iter()
        .filter(|event| matches!(event, Event::Disconnected(_)))
        .count();
    assert_eq!(disconnected, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_state_cleared_after_disconnect() {
    let (server, mut rx) = start_tcp(ServerOptions::default(), false);
    let _client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;

    session.enqueue(&[9u8; 4096]).unwrap();
    assert!(session.is_sending());
    assert!(session.disconnect().await);

    let stats = session.stats();
    assert_eq!(stats.bytes_pending, 0);
    assert_eq!(stats.bytes_sending, 0);
    assert!(!session.is_connected());
    assert!(!session.is_sending());
    assert!(!session.is_receiving());
    assert!(server.find(session.id()).is_none());
    assert_eq!(server.stats().bytes_pending, 0);

    assert!(matches!(session.enqueue(b"late"), Err(SessionError::NotConnected)));
    assert!(matches!(session.send(b"late").await, Err(SessionError::NotConnected)));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_async_tears_down() {
    let (server, mut rx) = start_tcp(ServerOptions::default(), false);
    let mut client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;

    assert!(session.disconnect_async());
    collect_until_disconnected(&mut rx, session.id()).await;

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(EVENT_TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(read, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_multicast_reaches_every_session() {
    let (server, mut rx) = start_tcp(ServerOptions::default(), false);
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(server.endpoint()).await.unwrap());
        wait_connected(&mut rx).await;
    }
    assert_eq!(server.connected_sessions(), 3);

    assert_eq!(server.multicast(b"ping"), 3);
    assert_eq!(server.multicast(b""), 0);

    for client in clients.iter_mut() {
        assert_eq!(read_exact(client, 4).await, b"ping");
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_multicast_skips_departing_sessions() {
    let (server, mut rx) = start_tcp(ServerOptions::default(), false);
    let mut staying = TcpStream::connect(server.endpoint()).await.unwrap();
    wait_connected(&mut rx).await;
    let _leaving = TcpStream::connect(server.endpoint()).await.unwrap();
    let departing = wait_connected(&mut rx).await;

    assert!(departing.disconnect().await);
    assert_eq!(server.multicast(b"news"), 1);
    assert_eq!(read_exact(&mut staying, 4).await, b"news");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_disconnects_sessions() {
    let (server, mut rx) = start_tcp(ServerOptions::default(), false);
    let mut client = TcpStream::connect(server.endpoint()).await.unwrap();
    let session = wait_connected(&mut rx).await;

    server.stop().await.unwrap();
    collect_until_disconnected(&mut rx, session.id()).await;
    assert_eq!(server.connected_sessions(), 0);

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(EVENT_TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(read, 0);
}

#[tokio::test]
async fn test_start_stop_restart() {
    let (handler, _rx) = recording::<Plain>(false);
    let server = TcpServer::tcp(loopback(), ServerOptions::default(), handler);

    assert!(matches!(server.stop().await, Err(ServerError::NotStarted)));
    assert!(matches!(server.restart().await, Err(ServerError::NotStarted)));

    server.start().unwrap();
    assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));

    server.restart().await.unwrap();
    assert!(server.is_started());
    let client = TcpStream::connect(server.endpoint()).await;
    assert!(client.is_ok());

    server.stop().await.unwrap();
    assert!(matches!(server.stop().await, Err(ServerError::NotStarted)));
}

#[tokio::test]
async fn test_restart_on_fixed_port_after_serving_client() {
    let port = std::net::TcpListener::bind(loopback())
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let address = std::net::SocketAddr::new(loopback().ip(), port);

    let (handler, mut rx) = recording::<Plain>(true);
    let server = TcpServer::tcp(address, ServerOptions::default(), handler);
    server.start().unwrap();
    assert_eq!(server.endpoint(), address);

    let mut client = TcpStream::connect(address).await.unwrap();
    let session = wait_connected(&mut rx).await;
    client.write_all(b"first").await.unwrap();
    assert_eq!(read_exact(&mut client, 5).await, b"first");

    // The server closes first, leaving its side of the connection in TIME_WAIT
    server.restart().await.unwrap();
    assert!(!session.is_connected());
    assert_eq!(server.endpoint(), address);

    let mut client = TcpStream::connect(address).await.unwrap();
    wait_connected(&mut rx).await;
    client.write_all(b"second").await.unwrap();
    assert_eq!(read_exact(&mut client, 6).await, b"second");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let (first, _rx) = start_tcp(ServerOptions::default(), false);
    let (handler, _rx2) = recording::<Plain>(false);
    let second = TcpServer::tcp(first.endpoint(), ServerOptions::default(), handler);

    assert!(matches!(second.start(), Err(ServerError::Bind { .. })));
    assert!(!second.is_started());

    first.stop().await.unwrap();
}

/// Appends `<source>:<stage>` for every connected and disconnected notification
struct OrderLog {
    log: Arc<Mutex<Vec<String>>>,
}

impl SessionHandler<Plain> for OrderLog {
    fn on_connected(&self, _session: &Arc<Session<Plain>>) {
        self.log.lock().unwrap().push("session:connected".to_string());
    }

    fn on_disconnected(&self, _session: &Arc<Session<Plain>>) {
        self.log.lock().unwrap().push("session:disconnected".to_string());
    }
}

impl ServerHandler<Plain> for OrderLog {
    fn create_session_handler(&self) -> Arc<dyn SessionHandler<Plain>> {
        Arc::new(OrderLog {
            log: Arc::clone(&self.log),
        })
    }

    fn on_started(&self, _server: &TcpServer) {
        self.log.lock().unwrap().push("server:started".to_string());
    }

    fn on_connected(&self, _session: &Arc<Session<Plain>>) {
        self.log.lock().unwrap().push("server:connected".to_string());
    }

    fn on_disconnected(&self, _session: &Arc<Session<Plain>>) {
        self.log.lock().unwrap().push("server:disconnected".to_string());
    }
}

#[tokio::test]
async fn test_notification_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let server = TcpServer::tcp(
        loopback(),
        ServerOptions::default(),
        Arc::new(OrderLog {
            log: Arc::clone(&log),
        }),
    );

    let observed = Arc::clone(&log);
    let (tx, mut connected) = tokio::sync::mpsc::unbounded_channel();
    server.subscribe_fn(move |event| {
        let name = match event {
            ServerEvent::Started => "observer:started",
            ServerEvent::Connected(_) => "observer:connected",
            ServerEvent::Disconnected(_) => "observer:disconnected",
            _ => return,
        };
        observed.lock().unwrap().push(name.to_string());
        if let ServerEvent::Connected(id) = event {
            let _ = tx.send(*id);
        }
    });

    server.start().unwrap();
    let _client = TcpStream::connect(server.endpoint()).await.unwrap();
    let id = tokio::time::timeout(EVENT_TIMEOUT, connected.recv())
        .await
        .unwrap()
        .unwrap();
    let session = server.find(id).unwrap();
    assert!(session.disconnect().await);

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "server:started",
            "observer:started",
            "session:connected",
            "server:connected",
            "observer:connected",
            "session:disconnected",
            "server:disconnected",
            "observer:disconnected",
        ]
    );

    server.stop().await.unwrap();
}

struct PanickingHandler;

impl SessionHandler<Plain> for PanickingHandler {
    fn on_connected(&self, _session: &Arc<Session<Plain>>) {
        panic!("connected hook failure");
    }
}

impl ServerHandler<Plain> for PanickingHandler {
    fn create_session_handler(&self) -> Arc<dyn SessionHandler<Plain>> {
        Arc::new(PanickingHandler)
    }
}

#[tokio::test]
async fn test_panicking_hook_does_not_break_session() {
    tracing::subscriber::set_global_default(tracing::subscriber::NoSubscriber::default()).ok();

    let server = TcpServer::tcp(loopback(), ServerOptions::default(), Arc::new(PanickingHandler));
    let (tx, mut connected) = tokio::sync::mpsc::unbounded_channel();
    server.subscribe_fn(move |event| {
        if let ServerEvent::Connected(id) = event {
            let _ = tx.send(*id);
        }
    });
    server.start().unwrap();

    let mut client = TcpStream::connect(server.endpoint()).await.unwrap();
    let id = tokio::time::timeout(EVENT_TIMEOUT, connected.recv())
        .await
        .unwrap()
        .unwrap();
    let session = server.find(id).unwrap();
    assert!(session.is_connected());

    session.enqueue(b"alive").unwrap();
    assert_eq!(read_exact(&mut client, 5).await, b"alive");

    server.stop().await.unwrap();
}

use super::*;
use crate::auth::derive_key;
use crate::backend::{Backend, Transport};
use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::pool::IdlePool;
use crate::protocol::message::insert;
use crate::protocol::reply::response_flags;
use crate::protocol::{command, opcode, DecodeError, MessageHeader, ProtocolViolation, Reply, HEADER_LEN};
use async_trait::async_trait;
use bson::{doc, Document};
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::{assert_err, assert_ok};

const DATABASE: &str = "test";

/// Accepts connections forever, running `handler` on each socket.
async fn spawn_server<F, Fut>(handler: F) -> u16
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(handler(socket));
        }
    });

    port
}

/// A server that answers each command with whatever `respond` returns, and
/// closes the socket when it returns `None`. Command names are logged.
async fn command_server<F>(respond: F) -> (u16, Arc<Mutex<Vec<String>>>)
where
    F: Fn(&str, &Document) -> Option<Document> + Send + Sync + 'static,
{
    let log = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let server_log = log.clone();
    let port = spawn_server(move |mut socket| {
        let log = server_log.clone();
        let respond = respond.clone();
        async move {
            while let Ok((header, body)) = read_frame(&mut socket).await {
                let (_, query) = parse_query(&body);
                let name = query.keys().next().cloned().unwrap_or_default();
                log.lock().unwrap().push(name.clone());

                match respond(&name, &query) {
                    Some(document) => write_reply(&mut socket, header.request_id, vec![document]).await,
                    None => return,
                }
            }
        }
    })
    .await;

    (port, log)
}

fn ping_server_reply(name: &str, _query: &Document) -> Option<Document> {
    Some(doc! { "ok": 1, "command": name })
}

/// Answers the handshake for `user`/`password` with nonce "abc", then
/// acknowledges every other command.
fn authenticating_reply(user: &'static str, password: &'static str) -> impl Fn(&str, &Document) -> Option<Document> {
    move |name: &str, query: &Document| match name {
        "getnonce" => Some(doc! { "nonce": "abc", "ok": 1 }),
        "authenticate" => {
            let expected = derive_key("abc", user, password);
            if query.get_str("key") == Ok(expected.as_str()) && query.get_str("nonce") == Ok("abc") {
                Some(doc! { "ok": 1 })
            } else {
                Some(doc! { "ok": 0, "errmsg": "auth fails" })
            }
        }
        other => Some(doc! { "ok": 1, "command": other }),
    }
}

async fn read_frame(socket: &mut TcpStream) -> io::Result<(MessageHeader, Vec<u8>)> {
    let mut raw = [0u8; HEADER_LEN];
    socket.read_exact(&mut raw).await?;
    let header = MessageHeader::parse(&raw);
    let mut body = vec![0u8; header.message_length as usize - HEADER_LEN];
    socket.read_exact(&mut body).await?;
    Ok((header, body))
}

/// Splits an OP_QUERY body into its namespace and query document.
fn parse_query(body: &[u8]) -> (String, Document) {
    let rest = &body[4..];
    let nul = rest.iter().position(|&b| b == 0).unwrap();
    let namespace = String::from_utf8(rest[..nul].to_vec()).unwrap();
    let mut document = &rest[nul + 1 + 8..];
    (namespace, Document::from_reader(&mut document).unwrap())
}

fn frame_bytes(response_to: i32, op_code: i32, body: &[u8]) -> Vec<u8> {
    let header = MessageHeader {
        message_length: (HEADER_LEN + body.len()) as i32,
        request_id: 9000,
        response_to,
        op_code,
    };
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(body);
    buf
}

async fn write_frame(socket: &mut TcpStream, response_to: i32, op_code: i32, body: &[u8]) {
    socket.write_all(&frame_bytes(response_to, op_code, body)).await.unwrap();
}

async fn write_reply(socket: &mut TcpStream, response_to: i32, documents: Vec<Document>) {
    let body = Reply::with_documents(documents).encode_body().unwrap();
    write_frame(socket, response_to, opcode::REPLY, &body).await;
}

fn config(port: u16) -> ConnectionConfig {
    ConnectionConfig::new()
        .port(port)
        .connect_timeout(Some(Duration::from_secs(2)))
        .request_timeout(Some(Duration::from_secs(2)))
}

async fn open(config: ConnectionConfig) -> (Connection, Arc<IdlePool>) {
    let pool = Arc::new(IdlePool::new(DATABASE));
    let conn = assert_ok!(Connection::connect(config, pool.clone()).await);
    (conn, pool)
}

fn ping() -> crate::protocol::Message {
    command(DATABASE, &doc! { "ping": 1 }).unwrap()
}

/// Polls `condition` until it holds or two seconds pass.
async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_request_roundtrip() {
    let (port, log) = command_server(ping_server_reply).await;
    let (conn, pool) = open(config(port)).await;
    assert!(conn.is_alive());
    assert_eq!(conn.usage_count(), 0);

    let reply = assert_ok!(conn.send_message(ping()).unwrap().await);
    let first = reply.first().unwrap();
    assert_eq!(first.get_str("command"), Ok("ping"));

    assert!(!conn.is_busy());
    assert_eq!(conn.usage_count(), 1);
    assert!(eventually(|| pool.contains(&conn)).await);
    assert_eq!(*log.lock().unwrap(), vec!["ping".to_string()]);
}

#[tokio::test]
async fn test_second_request_while_busy_is_rejected() {
    let port = spawn_server(|mut socket| async move {
        while let Ok((header, _)) = read_frame(&mut socket).await {
            tokio::time::sleep(Duration::from_millis(200)).await;
            write_reply(&mut socket, header.request_id, vec![doc! { "ok": 1 }]).await;
        }
    })
    .await;
    let (conn, _pool) = open(config(port)).await;

    let first = conn.send_message(ping()).unwrap();
    assert!(conn.is_busy());

    let second = assert_err!(conn.send_message(ping()));
    assert!(second.is_programming());

    assert_ok!(first.await);
    assert!(!conn.is_busy());
    assert_ok!(conn.send_message(ping()).unwrap().await);
    assert_eq!(conn.usage_count(), 2);
}

#[tokio::test]
async fn test_correlator_mismatch_is_protocol_violation() {
    let port = spawn_server(|mut socket| async move {
        if let Ok((header, _)) = read_frame(&mut socket).await {
            write_reply(&mut socket, header.request_id + 1, vec![doc! { "ok": 1 }]).await;
            let _ = read_frame(&mut socket).await;
        }
    })
    .await;
    let (conn, pool) = open(config(port)).await;

    let message = ping();
    let expected = message.request_id;
    let err = assert_err!(conn.send_message(message).unwrap().await);

    match err {
        Error::Protocol(ProtocolViolation::CorrelatorMismatch { expected: e, actual }) => {
            assert_eq!(e, expected);
            assert_eq!(actual, expected + 1);
        }
        other => panic!("expected correlator mismatch, got {:?}", other),
    }
    assert!(!conn.is_alive());
    assert!(!conn.is_busy());
    assert!(!pool.contains(&conn));
}

#[tokio::test]
async fn test_non_reply_opcode_is_protocol_violation() {
    let port = spawn_server(|mut socket| async move {
        if let Ok((header, _)) = read_frame(&mut socket).await {
            write_frame(&mut socket, header.request_id, opcode::QUERY, &[0u8; 20]).await;
            let _ = read_frame(&mut socket).await;
        }
    })
    .await;
    let (conn, _pool) = open(config(port)).await;

    let err = assert_err!(conn.send_message(ping()).unwrap().await);
    assert!(matches!(
        err,
        Error::Protocol(ProtocolViolation::UnexpectedOpCode(opcode::QUERY))
    ));
    assert!(!conn.is_alive());
}

#[tokio::test]
async fn test_authentication_runs_before_first_request() {
    let (port, log) = command_server(authenticating_reply("user", "pencil")).await;
    let (conn, pool) = open(config(port).credentials("user", "pencil")).await;

    let reply = assert_ok!(conn.send_message(ping()).unwrap().await);
    assert_eq!(reply.first().unwrap().get_str("command"), Ok("ping"));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["getnonce".to_string(), "authenticate".to_string(), "ping".to_string()]
    );
    assert_eq!(conn.usage_count(), 3);
    assert!(eventually(|| pool.contains(&conn)).await);

    // Already authenticated: no second handshake
    pool.checkout();
    assert_ok!(conn.send_message(ping()).unwrap().await);
    assert_eq!(log.lock().unwrap().len(), 4);
    assert_eq!(conn.usage_count(), 4);
}

#[tokio::test]
async fn test_authentication_failure_reaches_caller() {
    let (port, log) = command_server(authenticating_reply("user", "pencil")).await;
    let (conn, pool) = open(config(port).credentials("user", "wrong")).await;

    let err = assert_err!(conn.send_message(ping()).unwrap().await);
    match err {
        Error::Authentication(message) => assert_eq!(message, "auth fails"),
        other => panic!("expected authentication error, got {:?}", other),
    }

    // The caller's request never reached the server
    assert_eq!(
        *log.lock().unwrap(),
        vec!["getnonce".to_string(), "authenticate".to_string()]
    );
    assert!(conn.is_alive());
    assert!(!conn.is_busy());
    assert!(eventually(|| pool.contains(&conn)).await);
}

#[tokio::test]
async fn test_failed_nonce_fetch_is_authentication_error() {
    let port = spawn_server(|mut socket| async move {
        if let Ok((header, _)) = read_frame(&mut socket).await {
            let mut reply = Reply::with_documents(vec![doc! { "$err": "not master" }]);
            reply.response_flags = response_flags::QUERY_FAILURE;
            let body = reply.encode_body().unwrap();
            write_frame(&mut socket, header.request_id, opcode::REPLY, &body).await;
            let _ = read_frame(&mut socket).await;
        }
    })
    .await;
    let (conn, _pool) = open(config(port).credentials("user", "pencil")).await;

    let err = assert_err!(conn.send_message(ping()).unwrap().await);
    match err {
        Error::Authentication(message) => assert!(message.contains("not master"), "{}", message),
        other => panic!("expected authentication error, got {:?}", other),
    }
    assert_eq!(conn.usage_count(), 1);
}

#[tokio::test]
async fn test_server_close_fails_pending_request() {
    let (port, _log) = command_server(|_, _| None).await;
    let (conn, pool) = open(config(port)).await;

    let err = assert_err!(conn.send_message(ping()).unwrap().await);
    assert!(err.is_interface());
    assert_eq!(err.to_string(), "interface error: connection closed");
    assert!(!conn.is_alive());
    assert!(!conn.is_busy());
    assert!(eventually(|| pool.contains(&conn)).await);
}

#[tokio::test]
async fn test_server_error_becomes_integrity_error() {
    let (port, _log) =
        command_server(|_, _| Some(doc! { "ok": 1, "err": "E11000 duplicate key", "code": 11000 })).await;
    let (conn, pool) = open(config(port)).await;

    let err = assert_err!(conn.send_message(ping()).unwrap().await);
    match &err {
        Error::Integrity { message, code, .. } => {
            assert_eq!(message, "E11000 duplicate key");
            assert_eq!(*code, 11000);
        }
        other => panic!("expected integrity error, got {:?}", other),
    }
    assert_eq!(err.reply().and_then(|r| r.first()).and_then(|d| d.get_i32("code").ok()), Some(11000));
    assert!(conn.is_alive());
    assert!(eventually(|| pool.contains(&conn)).await);
}

#[tokio::test]
async fn test_malformed_body_is_decode_error() {
    let port = spawn_server(|mut socket| async move {
        while let Ok((header, _)) = read_frame(&mut socket).await {
            let mut reply = Reply::with_documents(vec![doc! { "ok": 1 }]);
            reply.number_returned = 2;
            let body = reply.encode_body().unwrap();
            write_frame(&mut socket, header.request_id, opcode::REPLY, &body).await;
        }
    })
    .await;
    let (conn, pool) = open(config(port)).await;

    let err = assert_err!(conn.send_message(ping()).unwrap().await);
    assert!(matches!(
        err,
        Error::Decode(DecodeError::CountMismatch {
            declared: 2,
            actual: 1
        })
    ));
    assert!(conn.is_alive());
    assert!(eventually(|| pool.contains(&conn)).await);
}

#[tokio::test]
async fn test_request_timeout_closes_connection() {
    let port = spawn_server(|mut socket| async move {
        // Swallow requests without answering
        while read_frame(&mut socket).await.is_ok() {}
    })
    .await;
    let config = config(port).request_timeout(Some(Duration::from_millis(100)));
    let (conn, pool) = open(config).await;

    let err = assert_err!(conn.send_message(ping()).unwrap().await);
    assert_eq!(err.to_string(), "interface error: connection closed");
    assert!(!conn.is_alive());
    assert!(!conn.is_busy());
    assert!(eventually(|| pool.contains(&conn)).await);
}

#[derive(Debug)]
struct StallingBackend;

#[async_trait]
impl Backend for StallingBackend {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<Transport> {
        std::future::pending().await
    }

    fn name(&self) -> &'static str {
        "stalling"
    }
}

#[tokio::test]
async fn test_connect_timeout() {
    let pool = Arc::new(IdlePool::new(DATABASE));
    let config = ConnectionConfig::new()
        .connect_timeout(Some(Duration::from_millis(100)))
        .request_timeout(Some(Duration::from_secs(5)));

    let err = assert_err!(Connection::connect_with_backend(config, Arc::new(StallingBackend), pool).await);
    assert!(err.is_interface());
    assert!(err.to_string().contains("failed to connect"), "{}", err);
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let pool = Arc::new(IdlePool::new(DATABASE));
    let err = assert_err!(Connection::connect(config(port), pool).await);
    match err {
        Error::Interface { source, .. } => assert!(source.is_some()),
        other => panic!("expected interface error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unacknowledged_write_recaches_without_reading() {
    let opcodes = Arc::new(Mutex::new(Vec::new()));
    let seen = opcodes.clone();
    let port = spawn_server(move |mut socket| {
        let seen = seen.clone();
        async move {
            while let Ok((header, _)) = read_frame(&mut socket).await {
                seen.lock().unwrap().push(header.op_code);
                if header.op_code == opcode::INSERT {
                    // Unsolicited frame that arrives while the connection is idle
                    write_reply(&mut socket, 0, vec![doc! { "stray": true }]).await;
                } else {
                    write_reply(&mut socket, header.request_id, vec![doc! { "ok": 1 }]).await;
                }
            }
        }
    })
    .await;
    let (conn, pool) = open(config(port)).await;

    let message = insert("test.items", &[doc! { "x": 1 }], 0, None).unwrap();
    assert_ok!(conn.send_unacknowledged(message).unwrap().await);
    assert!(!conn.is_busy());
    assert!(eventually(|| pool.contains(&conn)).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.checkout();

    let reply = assert_ok!(conn.send_message(ping()).unwrap().await);
    assert_eq!(reply.first().and_then(|d| d.get_i32("ok").ok()), Some(1));
    assert_eq!(*opcodes.lock().unwrap(), vec![opcode::INSERT, opcode::QUERY]);
    assert_eq!(conn.usage_count(), 2);
}

#[tokio::test]
async fn test_closed_connection_without_autoreconnect_fails_synchronously() {
    let (port, _log) = command_server(ping_server_reply).await;
    let (conn, pool) = open(config(port).autoreconnect(false)).await;

    conn.close().await;
    assert!(!conn.is_alive());
    assert!(pool.contains(&conn));

    let err = assert_err!(conn.send_message(ping()));
    assert!(err.is_interface());
    assert!(err.to_string().contains("autoreconnect=false"));
    assert!(!conn.is_busy());
}

#[tokio::test]
async fn test_reconnect_authenticates_again() {
    let (port, log) = command_server(authenticating_reply("user", "pencil")).await;
    let (conn, _pool) = open(config(port).credentials("user", "pencil")).await;

    assert_ok!(conn.send_message(ping()).unwrap().await);
    conn.close().await;
    assert!(!conn.is_alive());

    assert_ok!(conn.send_message(ping()).unwrap().await);
    assert!(conn.is_alive());
    assert_eq!(conn.usage_count(), 3);

    let expected: Vec<String> = ["getnonce", "authenticate", "ping"]
        .iter()
        .cycle()
        .take(6)
        .map(|s| s.to_string())
        .collect();
    assert_eq!(*log.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_close_fails_outstanding_request() {
    let port = spawn_server(|mut socket| async move {
        while read_frame(&mut socket).await.is_ok() {}
    })
    .await;
    let (conn, pool) = open(config(port)).await;

    let pending = conn.send_message(ping()).unwrap();
    conn.close().await;

    let err = assert_err!(pending.await);
    assert_eq!(err.to_string(), "interface error: connection closed");
    assert!(!conn.is_busy());
    assert!(pool.contains(&conn));
}

#[tokio::test]
async fn test_handles_share_identity() {
    let (port, _log) = command_server(ping_server_reply).await;
    let (conn, _pool) = open(config(port)).await;
    let (other, _other_pool) = open(config(port)).await;

    let clone = conn.clone();
    assert_eq!(clone, conn);
    assert_ne!(other, conn);
    assert_ne!(other.id(), conn.id());

    assert_ok!(clone.send_message(ping()).unwrap().await);
    assert_eq!(conn.usage_count(), 1);
}

#[tokio::test]
async fn test_unacknowledged_write_to_stalled_peer_times_out() {
    let port = spawn_server(|socket| async move {
        // Accept but never read, so the client's send buffer fills up
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(socket);
    })
    .await;
    let config = config(port).request_timeout(Some(Duration::from_millis(200)));
    let (conn, pool) = open(config).await;

    let blob = "x".repeat(15 * 1024 * 1024);
    let message = insert("test.blobs", &[doc! { "blob": blob }], 0, None).unwrap();
    let pending = conn.send_unacknowledged(message).unwrap();

    let outcome = assert_ok!(tokio::time::timeout(Duration::from_secs(2), pending).await);
    let err = assert_err!(outcome);
    assert_eq!(err.to_string(), "interface error: connection closed");
    assert!(!conn.is_busy());
    assert!(!conn.is_alive());
    assert!(eventually(|| pool.contains(&conn)).await);

    assert_ok!(tokio::time::timeout(Duration::from_secs(2), conn.close()).await);
}

#[tokio::test]
async fn test_close_returns_while_write_is_stalled() {
    let port = spawn_server(|socket| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(socket);
    })
    .await;
    let config = config(port).request_timeout(Some(Duration::from_millis(200)));
    let (conn, _pool) = open(config).await;

    let blob = "x".repeat(15 * 1024 * 1024);
    let message = insert("test.blobs", &[doc! { "blob": blob }], 0, None).unwrap();
    let pending = conn.send_unacknowledged(message).unwrap();

    assert_ok!(tokio::time::timeout(Duration::from_secs(2), conn.close()).await);
    let err = assert_err!(pending.await);
    assert!(err.is_interface());
    assert!(!conn.is_busy());
}

#[tokio::test]
async fn test_timeout_during_handshake_fails_deferred_request() {
    let port = spawn_server(|mut socket| async move {
        if let Ok((header, _)) = read_frame(&mut socket).await {
            write_reply(&mut socket, header.request_id, vec![doc! { "nonce": "abc", "ok": 1 }]).await;
            // Swallow the authenticate command without answering
            while read_frame(&mut socket).await.is_ok() {}
        }
    })
    .await;
    let config = config(port)
        .credentials("user", "pencil")
        .request_timeout(Some(Duration::from_millis(200)));
    let (conn, pool) = open(config).await;

    let err = assert_err!(conn.send_message(ping()).unwrap().await);
    assert_eq!(err.to_string(), "interface error: connection closed");
    assert_eq!(conn.usage_count(), 2);
    assert!(!conn.is_alive());
    assert!(!conn.is_busy());
    assert!(eventually(|| pool.contains(&conn)).await);
}

#[tokio::test]
async fn test_server_close_during_handshake_fails_deferred_request() {
    let (port, log) = command_server(|name, _| match name {
        "getnonce" => Some(doc! { "nonce": "abc", "ok": 1 }),
        _ => None,
    })
    .await;
    let (conn, pool) = open(config(port).credentials("user", "pencil")).await;

    let err = assert_err!(conn.send_message(ping()).unwrap().await);
    assert_eq!(err.to_string(), "interface error: connection closed");
    assert_eq!(
        *log.lock().unwrap(),
        vec!["getnonce".to_string(), "authenticate".to_string()]
    );
    assert!(!conn.is_alive());
    assert!(!conn.is_busy());
    assert!(eventually(|| pool.contains(&conn)).await);
}

#[tokio::test]
async fn test_reply_split_across_reads() {
    let port = spawn_server(|mut socket| async move {
        socket.set_nodelay(true).unwrap();
        while let Ok((header, _)) = read_frame(&mut socket).await {
            let body = Reply::with_documents(vec![doc! { "ok": 1, "split": true }])
                .encode_body()
                .unwrap();
            for byte in frame_bytes(header.request_id, opcode::REPLY, &body) {
                socket.write_all(&[byte]).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    })
    .await;
    let (conn, pool) = open(config(port)).await;

    let reply = assert_ok!(conn.send_message(ping()).unwrap().await);
    assert_eq!(reply.first().and_then(|d| d.get_bool("split").ok()), Some(true));
    assert!(conn.is_alive());
    assert!(eventually(|| pool.contains(&conn)).await);

    pool.checkout();
    assert_ok!(conn.send_message(ping()).unwrap().await);
}

#[tokio::test]
async fn test_short_declared_length_is_protocol_violation() {
    let port = spawn_server(|mut socket| async move {
        if let Ok((header, _)) = read_frame(&mut socket).await {
            let mut raw = Vec::with_capacity(HEADER_LEN);
            MessageHeader {
                message_length: 8,
                request_id: 9000,
                response_to: header.request_id,
                op_code: opcode::REPLY,
            }
            .write_to(&mut raw);
            socket.write_all(&raw).await.unwrap();
            let _ = read_frame(&mut socket).await;
        }
    })
    .await;
    let (conn, pool) = open(config(port)).await;

    let err = assert_err!(conn.send_message(ping()).unwrap().await);
    assert!(matches!(
        err,
        Error::Protocol(ProtocolViolation::InvalidLength(8))
    ));
    assert!(!conn.is_alive());
    assert!(!conn.is_busy());
    assert!(!pool.contains(&conn));
}

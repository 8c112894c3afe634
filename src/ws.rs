//! WebSocket front door (§4.12): upgrade request validation, the RFC 6455
//! handshake, and the per-connection message loop that ties the wire
//! protocol of §6 to the subscription registry and watch bridge.
//!
//! The outer HTTP routing that accepts TCP connections and parses the
//! upgrade request's headers is out of scope (§1) — this module
//! validates whatever headers the embedding server hands it and, once a
//! connection has been upgraded to a [`tokio_tungstenite::WebSocketStream`],
//! owns the message loop end to end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::Engine;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::clock::SharedClock;
use crate::path;
use crate::watch::bridge::ConnectionSender;
use crate::watch::subscription::{ConnectionId, SubscriptionRegistry};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Why an upgrade request was rejected (§4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeRejection {
    MissingPath,
    InvalidPath,
    NotWebSocket,
    MissingKey,
    WrongVersion,
}

impl UpgradeRejection {
    /// HTTP status the embedding server should reply with (§4.12).
    pub fn status(self) -> u16 {
        match self {
            UpgradeRejection::MissingPath | UpgradeRejection::InvalidPath => 400,
            UpgradeRejection::NotWebSocket => 426,
            UpgradeRejection::MissingKey | UpgradeRejection::WrongVersion => 400,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            UpgradeRejection::MissingPath => "EINVAL",
            UpgradeRejection::InvalidPath => "EINVAL",
            UpgradeRejection::NotWebSocket => "UPGRADE_REQUIRED",
            UpgradeRejection::MissingKey => "EINVAL",
            UpgradeRejection::WrongVersion => "EINVAL",
        }
    }

    /// Extra response headers the embedding server should attach (§4.12).
    pub fn headers(self) -> Vec<(&'static str, &'static str)> {
        match self {
            UpgradeRejection::NotWebSocket => vec![("Upgrade", "websocket"), ("Connection", "Upgrade")],
            UpgradeRejection::WrongVersion => vec![("Sec-WebSocket-Version", "13")],
            _ => Vec::new(),
        }
    }
}

/// The subset of an HTTP upgrade request the front door needs, independent
/// of any concrete HTTP library (outer routing is out of scope, §1).
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub path_param: Option<String>,
    pub recursive: bool,
    pub upgrade_header: Option<String>,
    pub sec_websocket_key: Option<String>,
    pub sec_websocket_version: Option<String>,
}

/// A validated upgrade, ready for the handshake response (§4.12).
#[derive(Debug, Clone)]
pub struct ValidatedUpgrade {
    pub path: String,
    pub recursive: bool,
    pub accept_key: String,
}

/// Validates an upgrade request per §4.12 and computes the handshake's
/// `Sec-WebSocket-Accept` value.
pub fn validate_upgrade(req: &UpgradeRequest) -> Result<ValidatedUpgrade, UpgradeRejection> {
    let raw_path = req.path_param.as_deref().ok_or(UpgradeRejection::MissingPath)?;
    let path = path::normalize(raw_path).map_err(|_| UpgradeRejection::InvalidPath)?;

    let is_websocket = req
        .upgrade_header
        .as_deref()
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !is_websocket {
        return Err(UpgradeRejection::NotWebSocket);
    }

    let key = req.sec_websocket_key.as_deref().ok_or(UpgradeRejection::MissingKey)?;
    match req.sec_websocket_version.as_deref() {
        Some("13") => {}
        _ => return Err(UpgradeRejection::WrongVersion),
    }

    Ok(ValidatedUpgrade { path, recursive: req.recursive, accept_key: accept_key(key) })
}

/// RFC 6455 §1.3 `Sec-WebSocket-Accept` computation: SHA-1 of the client key
/// concatenated with the protocol's fixed GUID, base64-encoded.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// RFC 6455 close codes the front door distinguishes (§4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    UnsupportedData = 1003,
    PolicyViolation = 1008,
    UnexpectedCondition = 1011,
}

/// Outgoing-frame fan-out for live connections, handed to the watch bridge
/// as its [`ConnectionSender`] (§4.11); each upgraded connection registers
/// here for the lifetime of its message loop.
pub struct ConnectionTable {
    next_id: AtomicU64,
    senders: DashMap<ConnectionId, mpsc::UnboundedSender<Message>>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self { next_id: AtomicU64::new(1), senders: DashMap::new() }
    }
}

impl ConnectionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocates a fresh connection id and its outgoing-frame channel.
    fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(id, tx);
        (id, rx)
    }

    fn deregister(&self, id: ConnectionId) {
        self.senders.remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.senders.len()
    }
}

impl ConnectionSender for ConnectionTable {
    fn send(&self, conn: ConnectionId, payload: String) -> Result<(), String> {
        match self.senders.get(&conn) {
            Some(tx) => tx.send(Message::text(payload)).map_err(|e| e.to_string()),
            None => Err("connection closed".to_string()),
        }
    }
}

/// Drives one upgraded connection end to end: registers it in `connections`,
/// seeds the initial subscription named by the upgrade request, dispatches
/// every inbound text frame through [`SubscriptionRegistry::handle_message`],
/// forwards batched watch events queued by the bridge, and deregisters the
/// connection — idempotently — on close or I/O error (§4.12).
pub async fn serve_connection<S>(
    ws: WebSocketStream<S>,
    connections: Arc<ConnectionTable>,
    subscriptions: Arc<SubscriptionRegistry>,
    clock: SharedClock,
    upgrade: ValidatedUpgrade,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (conn_id, mut outgoing) = connections.register();
    let (mut sink, mut stream) = ws.split();

    if subscriptions.subscribe(conn_id, &upgrade.path, None, &clock).is_ok() {
        let ack = serde_json::json!({
            "type": "subscribed",
            "path": upgrade.path,
            "recursive": upgrade.recursive,
        });
        if sink.send(Message::text(ack.to_string())).await.is_err() {
            connections.deregister(conn_id);
            subscriptions.remove_connection(conn_id);
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match subscriptions.handle_message(conn_id, &text, &clock) {
                            Ok(ack) => ack,
                            Err(err) => serde_json::json!({"type": "error", "code": err.code(), "message": err.code()}),
                        };
                        if sink.send(Message::text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            queued = outgoing.recv() => {
                match queued {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    connections.deregister(conn_id);
    subscriptions.remove_connection(conn_id);
}

#[cfg(test)]
mod test {
    use super::*;

    fn req() -> UpgradeRequest {
        UpgradeRequest {
            path_param: Some("/home".into()),
            recursive: false,
            upgrade_header: Some("websocket".into()),
            sec_websocket_key: Some("dGhlIHNhbXBsZSBub25jZQ==".into()),
            sec_websocket_version: Some("13".into()),
        }
    }

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn valid_upgrade_is_accepted() {
        let validated = validate_upgrade(&req()).unwrap();
        assert_eq!(validated.path, "/home");
        assert_eq!(validated.accept_key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn missing_path_is_rejected_with_400() {
        let mut r = req();
        r.path_param = None;
        let err = validate_upgrade(&r).unwrap_err();
        assert_eq!(err, UpgradeRejection::MissingPath);
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn non_websocket_upgrade_is_rejected_with_426() {
        let mut r = req();
        r.upgrade_header = Some("h2c".into());
        let err = validate_upgrade(&r).unwrap_err();
        assert_eq!(err, UpgradeRejection::NotWebSocket);
        assert_eq!(err.status(), 426);
        assert!(err.headers().contains(&("Upgrade", "websocket")));
    }

    #[test]
    fn wrong_version_is_rejected_with_correct_version_header() {
        let mut r = req();
        r.sec_websocket_version = Some("8".into());
        let err = validate_upgrade(&r).unwrap_err();
        assert_eq!(err, UpgradeRejection::WrongVersion);
        assert!(err.headers().contains(&("Sec-WebSocket-Version", "13")));
    }

    #[test]
    fn connection_table_roundtrips_sends() {
        let table = ConnectionTable::new();
        let (id, mut rx) = table.register();
        table.send(id, "hello".into()).unwrap();
        let message = rx.try_recv().unwrap();
        match message {
            Message::Text(text) => assert_eq!(text.to_string(), "hello"),
            other => panic!("expected text frame, got {other:?}"),
        }
        table.deregister(id);
        assert!(table.send(id, "gone".into()).is_err());
    }
}

// =============================================================================
// Screener WebSocket — per-connection session multiplexer
// =============================================================================
//
// One `ScreenerConnection` per socket: an optional bearer token installed by
// AUTH, and a map of session_id → ScreenerSession. All outbound traffic
// funnels through a single writer task so sessions and protocol errors never
// interleave partial frames.
//
// Disconnect tears every session down; a malformed or unknown frame answers
// `{"error": ...}` on that message only and keeps the connection open.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::screener::protocol::{
    parse_client_message, ClientMessage, ServerMessage, NO_AUTH_TOKEN,
};
use crate::screener::quotes::QuoteFetcher;
use crate::screener::session::ScreenerSession;
use crate::screener::table::FeatureTable;

/// Outbound writer capacity per connection.
const OUTBOUND_CAPACITY: usize = 256;

/// Frames headed for the socket writer.
enum Outbound {
    Frame(Json),
    Pong(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

pub struct ScreenerConnection {
    token: Option<String>,
    sessions: HashMap<String, ScreenerSession>,
    table: Arc<FeatureTable>,
    fetcher: Arc<dyn QuoteFetcher>,
    out: mpsc::Sender<ServerMessage>,
}

impl ScreenerConnection {
    pub fn new(
        table: Arc<FeatureTable>,
        fetcher: Arc<dyn QuoteFetcher>,
        out: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            token: None,
            sessions: HashMap::new(),
            table,
            fetcher,
            out,
        }
    }

    /// Handle one inbound text frame. Returns an error frame to write when
    /// the message could not be dispatched.
    pub async fn handle_text(&mut self, text: &str) -> Option<Json> {
        let message = match parse_client_message(text) {
            Ok(message) => message,
            Err(msg) => return Some(serde_json::json!({ "error": msg })),
        };

        match message {
            ClientMessage::Auth { token } => {
                if token != NO_AUTH_TOKEN {
                    self.token = Some(token);
                }
            }
            ClientMessage::Subscribe(req) => {
                if self.sessions.contains_key(&req.session_id) {
                    let dup = ServerMessage::Duplicate {
                        session_id: req.session_id.clone(),
                    };
                    self.out.send(dup).await.ok();
                    return None;
                }

                let mut session = ScreenerSession::new(
                    req.session_id.clone(),
                    self.token.clone(),
                    self.table.clone(),
                    self.fetcher.clone(),
                    self.out.clone(),
                );
                session.subscribe(req).await;
                self.sessions
                    .insert(session.session_id().to_string(), session);
            }
            ClientMessage::Patch(req) => {
                if let Some(session) = self.sessions.get_mut(&req.session_id) {
                    session.patch(req).await;
                }
            }
            ClientMessage::Unsubscribe { session_id } => {
                if let Some(mut session) = self.sessions.remove(&session_id) {
                    session.unsubscribe();
                }
            }
            ClientMessage::SetUniverse {
                session_id,
                universe,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.set_universe(universe).await;
                }
            }
        }
        None
    }

    /// Tear down every session (connection closed).
    pub fn disconnect(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.unsubscribe();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }
}

// ---------------------------------------------------------------------------
// Socket plumbing
// ---------------------------------------------------------------------------

/// Drive one upgraded socket until it closes.
pub async fn handle_socket(
    socket: WebSocket,
    table: Arc<FeatureTable>,
    fetcher: Arc<dyn QuoteFetcher>,
) {
    info!("screener websocket connected");
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);

    // Single writer: everything outbound goes through here.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let msg = match frame {
                Outbound::Frame(v) => Message::Text(v.to_string()),
                Outbound::Pong(data) => Message::Pong(data.into()),
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Sessions speak typed messages; serialize them onto the writer.
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
    let forward_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(message) = msg_rx.recv().await {
            match serde_json::to_value(&message) {
                Ok(v) => {
                    if forward_tx.send(Outbound::Frame(v)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize server message"),
            }
        }
    });

    let mut connection = ScreenerConnection::new(table, fetcher, msg_tx);

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Some(error_frame) = connection.handle_text(&text).await {
                    if out_tx.send(Outbound::Frame(error_frame)).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                if out_tx.send(Outbound::Pong(data.to_vec())).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("screener websocket close frame");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "screener websocket read error");
                break;
            }
        }
    }

    connection.disconnect();
    drop(out_tx);
    writer.abort();
    forwarder.abort();
    info!("screener websocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    struct NullFetcher;

    #[async_trait]
    impl QuoteFetcher for NullFetcher {
        async fn fetch_batch(&self, _symbols: &[Json], _token: &str) -> Result<Vec<Json>> {
            Ok(Vec::new())
        }
    }

    fn table() -> Arc<FeatureTable> {
        let rows = serde_json::json!([
            {"ticker": "NSE:A", "name": "Alpha", "logo": "a.png", "day_close": 10.0, "isin": "IA", "type": "stock", "exchange": "NSE"},
            {"ticker": "NSE:B", "name": "Beta", "logo": "b.png", "day_close": 20.0, "isin": "IB", "type": "stock", "exchange": "NSE"}
        ]);
        let rows = match rows {
            Json::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    Json::Object(m) => m,
                    _ => unreachable!(),
                })
                .collect(),
            _ => unreachable!(),
        };
        Arc::new(FeatureTable::from_rows(rows).unwrap())
    }

    fn connection() -> (ScreenerConnection, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        (ScreenerConnection::new(table(), Arc::new(NullFetcher), tx), rx)
    }

    async fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn auth_installs_token_except_no_auth() {
        let (mut conn, _rx) = connection();
        conn.handle_text(r#"{"t": "AUTH", "token": "no_auth"}"#).await;
        assert!(!conn.has_token());

        conn.handle_text(r#"{"t": "AUTH", "token": "bearer-xyz"}"#).await;
        assert!(conn.has_token());
    }

    #[tokio::test]
    async fn duplicate_subscribe_keeps_the_existing_session() {
        let (mut conn, mut rx) = connection();
        let sub = r#"{"t": "SCREENER_SUBSCRIBE", "session_id": "s1", "range": [0, 1]}"#;

        assert!(conn.handle_text(sub).await.is_none());
        assert_eq!(conn.session_count(), 1);
        let first = drain(&mut rx).await;
        assert!(matches!(first[0], ServerMessage::Subscribed { .. }));

        assert!(conn.handle_text(sub).await.is_none());
        assert_eq!(conn.session_count(), 1);
        let second = drain(&mut rx).await;
        assert!(second
            .iter()
            .any(|m| matches!(m, ServerMessage::Duplicate { session_id } if session_id == "s1")));
    }

    #[tokio::test]
    async fn unknown_event_type_answers_error_frame() {
        let (mut conn, _rx) = connection();
        let err = conn
            .handle_text(r#"{"t": "NOT_A_THING"}"#)
            .await
            .expect("error frame");
        assert_eq!(err["error"], "Unknown event type");
        assert_eq!(conn.session_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_session() {
        let (mut conn, _rx) = connection();
        conn.handle_text(r#"{"t": "SCREENER_SUBSCRIBE", "session_id": "s1"}"#)
            .await;
        assert_eq!(conn.session_count(), 1);

        conn.handle_text(r#"{"t": "SCREENER_UNSUBSCRIBE", "session_id": "s1"}"#)
            .await;
        assert_eq!(conn.session_count(), 0);

        // Unsubscribing an unknown session is a no-op, not an error.
        let reply = conn
            .handle_text(r#"{"t": "SCREENER_UNSUBSCRIBE", "session_id": "ghost"}"#)
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn disconnect_clears_every_session() {
        let (mut conn, _rx) = connection();
        conn.handle_text(r#"{"t": "SCREENER_SUBSCRIBE", "session_id": "s1"}"#)
            .await;
        conn.handle_text(r#"{"t": "SCREENER_SUBSCRIBE", "session_id": "s2"}"#)
            .await;
        assert_eq!(conn.session_count(), 2);

        conn.disconnect();
        assert_eq!(conn.session_count(), 0);
    }

    #[tokio::test]
    async fn patch_and_set_universe_reach_the_session() {
        let (mut conn, mut rx) = connection();
        conn.handle_text(
            r#"{"t": "SCREENER_SUBSCRIBE", "session_id": "s1", "range": [0, 2], "columns": ["ticker"]}"#,
        )
        .await;
        drain(&mut rx).await;

        conn.handle_text(
            r#"{"t": "SCREENER_PATCH", "session_id": "s1", "range": [0, 1]}"#,
        )
        .await;
        let msgs = drain(&mut rx).await;
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::Patched { .. })));
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::Full { .. })));

        conn.handle_text(
            r#"{"t": "SCREENER_SET_UNIVERSE", "session_id": "s1", "universe": []}"#,
        )
        .await;
        let msgs = drain(&mut rx).await;
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::Full { total: 0, .. })));
    }
}

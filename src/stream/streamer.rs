// =============================================================================
// Quote Streamer — one upstream WebSocket connection
// =============================================================================
//
// Speaks the framed protocol from `codec` against the provider's quote
// socket. Partial field updates are merged into a per-ticker quote map; a
// ticker only starts emitting `QuoteUpdate` events after the upstream has
// acknowledged it with `quote_completed`.
//
// Reconnects run on a linear back-off (fixed delay, bounded attempts). Each
// reconnect wipes quote state — only the requested ticker list survives and
// is resubscribed.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::stream::codec::{classify_payload, decode_frames, encode_json, encode_payload, Payload};

const WEBSOCKET_URL: &str = "wss://data-wdc.tradingview.com/socket.io/websocket?type=chart";
const WS_ORIGIN: &str = "https://in.tradingview.com";

/// Read-side silence window before the connection is declared dead.
const PING_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
pub(crate) type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ---------------------------------------------------------------------------
// Events & commands
// ---------------------------------------------------------------------------

/// Event kinds surfaced to stream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStreamEvent {
    Connected,
    Disconnected,
    QuoteUpdate,
    QuoteCompleted,
    Error,
}

/// One event off a quote connection: kind, optional ticker, payload.
#[derive(Debug, Clone)]
pub struct QuoteEvent {
    pub kind: QuoteStreamEvent,
    pub ticker: Option<String>,
    pub data: Value,
}

impl QuoteEvent {
    fn lifecycle(kind: QuoteStreamEvent, data: Value) -> Self {
        Self {
            kind,
            ticker: None,
            data,
        }
    }
}

/// In-flight control for a running streamer.
#[derive(Debug)]
pub enum StreamerCommand {
    /// Drop symbols from the live session without reconnecting.
    RemoveSymbols(Vec<String>),
}

/// Generate a client-side session id: prefix + 12 alphanumeric characters.
pub fn generate_session_id(prefix: &str) -> String {
    let alnum = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &alnum[..12])
}

// ---------------------------------------------------------------------------
// Streamer
// ---------------------------------------------------------------------------

pub struct QuoteStreamer {
    fields: Vec<String>,
    reconnect_delay: Duration,
    reconnect_attempts: u32,

    session_id: Option<String>,
    quotes: HashMap<String, serde_json::Map<String, Value>>,
    completed: HashSet<String>,
}

impl QuoteStreamer {
    pub fn new(fields: Vec<String>) -> Self {
        Self::with_reconnect(fields, Duration::from_secs(5), 3)
    }

    pub fn with_reconnect(fields: Vec<String>, reconnect_delay: Duration, reconnect_attempts: u32) -> Self {
        Self {
            fields,
            reconnect_delay,
            reconnect_attempts,
            session_id: None,
            quotes: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    /// Stream quotes for `tickers` until the socket closes normally or the
    /// reconnect budget runs out. Events go to `events`; `commands` allows
    /// in-place symbol removal.
    pub async fn run(
        mut self,
        tickers: Vec<String>,
        events: mpsc::Sender<QuoteEvent>,
        mut commands: mpsc::Receiver<StreamerCommand>,
    ) {
        let mut attempts: u32 = 0;

        while attempts <= self.reconnect_attempts {
            if attempts > 0 {
                tokio::time::sleep(self.reconnect_delay).await;
            }

            match self.run_connection(&tickers, &events, &mut commands).await {
                Ok(()) => return, // normal close
                Err(ConnectionEnd::ConsumerGone) => return,
                Err(ConnectionEnd::Dropped(reason)) => {
                    let ev = QuoteEvent::lifecycle(
                        QuoteStreamEvent::Disconnected,
                        json!({ "reason": reason }),
                    );
                    if events.send(ev).await.is_err() {
                        return;
                    }
                    attempts += 1;
                }
                Err(ConnectionEnd::Failed(message)) => {
                    let ev =
                        QuoteEvent::lifecycle(QuoteStreamEvent::Error, json!({ "message": message }));
                    if events.send(ev).await.is_err() {
                        return;
                    }
                    attempts += 1;
                }
            }
        }

        let ev = QuoteEvent::lifecycle(
            QuoteStreamEvent::Error,
            json!({ "message": "Maximum reconnect attempts reached" }),
        );
        let _ = events.send(ev).await;
    }

    async fn run_connection(
        &mut self,
        tickers: &[String],
        events: &mpsc::Sender<QuoteEvent>,
        commands: &mut mpsc::Receiver<StreamerCommand>,
    ) -> std::result::Result<(), ConnectionEnd> {
        let (mut write, mut read) = connect_quote_socket()
            .await
            .map_err(|e| ConnectionEnd::Failed(e.to_string()))?;

        // Fresh connection — previous quote state is stale.
        self.quotes.clear();
        self.completed.clear();

        let connected = QuoteEvent::lifecycle(
            QuoteStreamEvent::Connected,
            json!({ "timestamp": chrono::Utc::now().to_rfc3339() }),
        );
        events
            .send(connected)
            .await
            .map_err(|_| ConnectionEnd::ConsumerGone)?;

        self.initialize_session(&mut write, tickers)
            .await
            .map_err(|e| ConnectionEnd::Failed(e.to_string()))?;

        let mut deadline = Instant::now() + PING_TIMEOUT;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ConnectionEnd::Dropped("ping timeout".into()));
                }

                cmd = commands.recv() => {
                    match cmd {
                        Some(StreamerCommand::RemoveSymbols(symbols)) => {
                            if let Err(e) = self.remove_symbols(&mut write, &symbols).await {
                                return Err(ConnectionEnd::Failed(e.to_string()));
                            }
                        }
                        // Command side dropped: node is being torn down.
                        None => return Ok(()),
                    }
                }

                msg = read.next() => {
                    deadline = Instant::now() + PING_TIMEOUT;
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.process_message(&text, &mut write, events).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await.ok();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(ConnectionEnd::Dropped(format!("closed: {frame:?}")));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(ConnectionEnd::Dropped(e.to_string()));
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Per-connection bring-up: auth, locale, quote session, symbols, fields.
    async fn initialize_session(&mut self, write: &mut WsSink, tickers: &[String]) -> Result<()> {
        let session_id = generate_session_id("qs");

        send_json(write, &json!({"m": "set_auth_token", "p": ["unauthorized_user_token"]})).await?;
        send_json(write, &json!({"m": "set_locale", "p": ["en", "IN"]})).await?;
        send_json(write, &json!({"m": "quote_create_session", "p": [session_id]})).await?;

        let mut add_params: Vec<Value> = vec![json!(session_id)];
        add_params.extend(tickers.iter().map(|t| json!(t)));
        send_json(write, &json!({"m": "quote_add_symbols", "p": add_params})).await?;

        if !self.fields.is_empty() {
            let mut field_params: Vec<Value> = vec![json!(session_id)];
            field_params.extend(self.fields.iter().map(|f| json!(f)));
            send_json(write, &json!({"m": "quote_set_fields", "p": field_params})).await?;
        }

        info!(session = %session_id, tickers = tickers.len(), "quote session initialized");
        self.session_id = Some(session_id);
        Ok(())
    }

    /// In-place symbol removal on the live session.
    async fn remove_symbols(&mut self, write: &mut WsSink, symbols: &[String]) -> Result<()> {
        let Some(session_id) = self.session_id.clone() else {
            warn!("cannot remove symbols: no active session");
            return Ok(());
        };

        let mut params: Vec<Value> = vec![json!(session_id)];
        params.extend(symbols.iter().map(|s| json!(s)));
        send_json(write, &json!({"m": "quote_remove_symbols", "p": params})).await?;

        for s in symbols {
            self.quotes.remove(s);
            self.completed.remove(s);
        }
        info!(session = %session_id, count = symbols.len(), "symbols removed from session");
        Ok(())
    }

    async fn process_message(
        &mut self,
        text: &str,
        write: &mut WsSink,
        events: &mpsc::Sender<QuoteEvent>,
    ) -> std::result::Result<(), ConnectionEnd> {
        for payload in decode_frames(text) {
            match classify_payload(&payload) {
                Some(Payload::Heartbeat(beat)) => {
                    debug!(beat = %beat, "heartbeat — echoing");
                    write
                        .send(Message::Text(encode_payload(&beat)))
                        .await
                        .map_err(|e| ConnectionEnd::Dropped(e.to_string()))?;
                }
                Some(Payload::Json(event)) => {
                    for out in self.process_event(&event) {
                        events
                            .send(out)
                            .await
                            .map_err(|_| ConnectionEnd::ConsumerGone)?;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Translate one upstream JSON event into zero-or-more consumer events.
    fn process_event(&mut self, event: &Value) -> Vec<QuoteEvent> {
        match event["m"].as_str() {
            Some("quote_completed") => {
                let Some(ticker) = event["p"].get(1).and_then(Value::as_str) else {
                    return Vec::new();
                };
                self.completed.insert(ticker.to_string());
                let data = self
                    .quotes
                    .get(ticker)
                    .cloned()
                    .map(Value::Object)
                    .unwrap_or_else(|| json!({}));
                vec![QuoteEvent {
                    kind: QuoteStreamEvent::QuoteCompleted,
                    ticker: Some(ticker.to_string()),
                    data,
                }]
            }
            Some("qsd") => self.merge_quote_delta(event).into_iter().collect(),
            Some("critical_error") | Some("protocol_error") => {
                let message = event["p"]
                    .get(0)
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error");
                vec![QuoteEvent::lifecycle(
                    QuoteStreamEvent::Error,
                    json!({ "message": message }),
                )]
            }
            _ => Vec::new(),
        }
    }

    /// Merge a `qsd` field delta into the stored quote. Only tickers past
    /// `quote_completed` emit forward events; earlier deltas merge silently.
    fn merge_quote_delta(&mut self, event: &Value) -> Option<QuoteEvent> {
        let quote = event["p"].get(1)?;
        let ticker = quote["n"].as_str()?;
        let values = quote["v"].as_object()?;
        if values.is_empty() {
            return None;
        }

        let current = self.quotes.entry(ticker.to_string()).or_default();
        for (k, v) in values {
            current.insert(k.clone(), v.clone());
        }

        if !self.completed.contains(ticker) {
            return None;
        }

        Some(QuoteEvent {
            kind: QuoteStreamEvent::QuoteUpdate,
            ticker: Some(ticker.to_string()),
            data: Value::Object(current.clone()),
        })
    }
}

/// Why a connection attempt ended.
#[derive(Debug)]
enum ConnectionEnd {
    /// Socket dropped mid-stream; counts against the reconnect budget.
    Dropped(String),
    /// Connect/handshake/protocol failure; also counts against the budget.
    Failed(String),
    /// The event consumer hung up; stop silently.
    ConsumerGone,
}

/// Connect to the provider socket with the expected Origin header.
pub(crate) async fn connect_quote_socket() -> Result<(WsSink, WsSource)> {
    let mut request = WEBSOCKET_URL
        .into_client_request()
        .context("bad websocket url")?;
    request
        .headers_mut()
        .insert(ORIGIN, HeaderValue::from_static(WS_ORIGIN));

    let (ws, _resp) = connect_async(request)
        .await
        .context("failed to connect quote websocket")?;
    Ok(ws.split())
}

pub(crate) async fn send_json(write: &mut WsSink, message: &Value) -> Result<()> {
    debug!(msg = %message, "SEND");
    write
        .send(Message::Text(encode_json(message)))
        .await
        .context("websocket send failed")?;
    Ok(())
}

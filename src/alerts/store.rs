// =============================================================================
// Alert Store Adapter — Supabase-compatible REST + realtime change feed
// =============================================================================
//
// The engine owns this adapter; the adapter holds no reference back. Reads
// and the trigger write go over PostgREST. Row changes arrive over the
// realtime WebSocket as `{data: {type, record}}` payloads; deletions are
// soft — they surface as UPDATEs carrying `deleted_at` or `is_active=false`
// and are classified here before the engine sees them.
//
// Per-row causal order is the only ordering the feed guarantees; the engine
// must not assume anything across rows.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::alerts::models::Alert;

/// HTTP timeout for store round-trips.
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Phoenix heartbeat interval required to keep the realtime socket open.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before re-attaching a dropped change feed.
const FEED_RECONNECT_DELAY: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Change classification
// ---------------------------------------------------------------------------

/// A classified row change from the store feed.
#[derive(Debug, Clone)]
pub enum StoreChange {
    Insert(Alert),
    Update(Alert),
    /// Soft delete — an UPDATE whose row is no longer live.
    Delete(Alert),
}

/// Classify a raw feed row. UPDATEs on rows that are no longer live
/// (soft-deleted or deactivated) are deletions from the engine's point of
/// view.
fn classify(change_type: &str, alert: Alert) -> Option<StoreChange> {
    match change_type {
        "INSERT" => Some(StoreChange::Insert(alert)),
        "UPDATE" => {
            if alert.is_live() {
                Some(StoreChange::Update(alert))
            } else {
                Some(StoreChange::Delete(alert))
            }
        }
        other => {
            debug!(change_type = other, "ignoring unhandled change type");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Store trait — the engine's seam (mockable in tests)
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// All live alerts (`is_active` and not soft-deleted).
    async fn fetch_active_alerts(&self) -> Result<Vec<Alert>>;

    /// Idempotent trigger write: deactivate and stamp the trigger price/time.
    async fn mark_triggered(&self, alert_id: &str, price: f64) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Supabase implementation
// ---------------------------------------------------------------------------

pub struct SupabaseAlertStore {
    base_url: String,
    service_key: String,
    client: reqwest::Client,
    table: &'static str,
}

impl SupabaseAlertStore {
    pub fn new(base_url: String, service_key: String) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&service_key) {
            headers.insert("apikey", val);
        }
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {service_key}")) {
            headers.insert("Authorization", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            client,
            table: "alerts",
        }
    }

    /// Attach the realtime change feed. Classified changes are forwarded to
    /// `tx`; the spawned task reconnects with a fixed delay until the
    /// receiver closes.
    pub fn subscribe_to_changes(&self, tx: mpsc::Sender<StoreChange>) -> tokio::task::JoinHandle<()> {
        let ws_url = realtime_url(&self.base_url, &self.service_key);
        let table = self.table;
        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    info!("change feed consumer gone — stopping feed task");
                    return;
                }
                if let Err(e) = run_change_feed(&ws_url, table, &tx).await {
                    warn!(error = %e, "alert change feed dropped — reconnecting");
                }
                tokio::time::sleep(FEED_RECONNECT_DELAY).await;
            }
        })
    }
}

#[async_trait]
impl AlertStore for SupabaseAlertStore {
    async fn fetch_active_alerts(&self) -> Result<Vec<Alert>> {
        let url = format!(
            "{}/rest/v1/{}?select=*&is_active=eq.true&deleted_at=is.null",
            self.base_url, self.table
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("fetch_active_alerts request failed")?
            .error_for_status()
            .context("fetch_active_alerts returned an error status")?;

        let alerts: Vec<Alert> = resp
            .json()
            .await
            .context("failed to decode active alerts")?;
        Ok(alerts)
    }

    async fn mark_triggered(&self, alert_id: &str, price: f64) -> Result<()> {
        let url = format!("{}/rest/v1/{}?id=eq.{}", self.base_url, self.table, alert_id);
        let now = Utc::now().to_rfc3339();
        let body = serde_json::json!({
            "is_active": false,
            "last_triggered_at": now,
            "last_triggered_price": price,
            "updated_at": now,
        });

        self.client
            .patch(&url)
            .json(&body)
            .send()
            .await
            .context("mark_triggered request failed")?
            .error_for_status()
            .context("mark_triggered returned an error status")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Realtime feed internals
// ---------------------------------------------------------------------------

fn realtime_url(base_url: &str, service_key: &str) -> String {
    let ws_base = base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{ws_base}/realtime/v1/websocket?apikey={service_key}&vsn=1.0.0")
}

async fn run_change_feed(
    ws_url: &str,
    table: &str,
    tx: &mpsc::Sender<StoreChange>,
) -> Result<()> {
    let (ws, _resp) = connect_async(ws_url)
        .await
        .context("failed to connect realtime websocket")?;
    info!("alert change feed connected");

    let (mut write, mut read) = ws.split();

    let topic = format!("realtime:public:{table}");
    let join = serde_json::json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {
            "config": {
                "postgres_changes": [
                    {"event": "INSERT", "schema": "public", "table": table},
                    {"event": "UPDATE", "schema": "public", "table": table}
                ]
            }
        },
        "ref": "1",
    });
    write
        .send(Message::Text(join.to_string()))
        .await
        .context("failed to join changes channel")?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately — skip it

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let beat = serde_json::json!({
                    "topic": "phoenix",
                    "event": "heartbeat",
                    "payload": {},
                    "ref": "hb",
                });
                write
                    .send(Message::Text(beat.to_string()))
                    .await
                    .context("heartbeat send failed")?;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        for change in parse_feed_message(&text) {
                            if tx.send(change).await.is_err() {
                                return Ok(()); // consumer gone
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await.ok();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("realtime socket closed");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("realtime socket read error"),
                }
            }
        }
    }
}

/// Extract classified changes from one realtime frame. The row payload lives
/// at `payload.data.record`; its change type at `payload.data.type`.
fn parse_feed_message(text: &str) -> Vec<StoreChange> {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparsable realtime frame");
            return Vec::new();
        }
    };

    let data = &root["payload"]["data"];
    let Some(record) = data.get("record") else {
        return Vec::new();
    };
    let change_type = data["type"].as_str().unwrap_or_default().to_string();

    let alert: Alert = match serde_json::from_value(record.clone()) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "change feed row failed validation");
            return Vec::new();
        }
    };

    classify(&change_type, alert).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::models::{Operator, RhsAttr, RhsType};

    fn feed_frame(change_type: &str, is_active: bool, deleted: bool) -> String {
        serde_json::json!({
            "topic": "realtime:public:alerts",
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "type": change_type,
                    "record": {
                        "id": "a1",
                        "user_id": "u1",
                        "symbol": "NSE:X",
                        "is_active": is_active,
                        "created_at": "2025-06-01T10:00:00Z",
                        "deleted_at": if deleted { serde_json::json!("2025-06-02T10:00:00Z") } else { serde_json::Value::Null },
                        "type": "simple",
                        "lhs_type": "last_price",
                        "operator": ">",
                        "rhs_type": "constant",
                        "rhs_attr": {"constant": 100.0}
                    }
                }
            },
            "ref": null
        })
        .to_string()
    }

    #[test]
    fn insert_frames_classify_as_insert() {
        let changes = parse_feed_message(&feed_frame("INSERT", true, false));
        assert!(matches!(changes.as_slice(), [StoreChange::Insert(a)] if a.id == "a1"));
    }

    #[test]
    fn live_update_classifies_as_update() {
        let changes = parse_feed_message(&feed_frame("UPDATE", true, false));
        assert!(matches!(changes.as_slice(), [StoreChange::Update(_)]));
    }

    #[test]
    fn soft_delete_and_deactivation_classify_as_delete() {
        let deleted = parse_feed_message(&feed_frame("UPDATE", true, true));
        assert!(matches!(deleted.as_slice(), [StoreChange::Delete(_)]));

        let deactivated = parse_feed_message(&feed_frame("UPDATE", false, false));
        assert!(matches!(deactivated.as_slice(), [StoreChange::Delete(_)]));
    }

    #[test]
    fn frames_without_record_are_ignored() {
        let ack = serde_json::json!({
            "topic": "realtime:public:alerts",
            "event": "phx_reply",
            "payload": {"status": "ok"},
            "ref": "1"
        })
        .to_string();
        assert!(parse_feed_message(&ack).is_empty());
        assert!(parse_feed_message("not json").is_empty());
    }

    #[test]
    fn realtime_url_swaps_scheme_and_appends_key() {
        let url = realtime_url("https://proj.supabase.co", "key123");
        assert_eq!(
            url,
            "wss://proj.supabase.co/realtime/v1/websocket?apikey=key123&vsn=1.0.0"
        );
    }

    #[test]
    fn unknown_change_types_are_dropped() {
        let alert = Alert {
            id: "a".into(),
            user_id: "u".into(),
            symbol: "NSE:X".into(),
            is_active: true,
            notes: None,
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
            alert_type: "simple".into(),
            lhs_type: "last_price".into(),
            lhs_attr: None,
            operator: Operator::Gt,
            rhs_type: RhsType::Constant,
            rhs_attr: RhsAttr::default(),
            last_triggered_at: None,
            last_triggered_price: None,
        };
        assert!(classify("DELETE", alert).is_none());
    }
}

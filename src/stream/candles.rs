// =============================================================================
// Candle Streamer — chart-session candle download over the quote wire
// =============================================================================
//
// Shares the framed protocol with the quote streamer but drives a chart
// session instead: one `cs_` session, one series slot, and a sequential walk
// over the requested tickers — `create_series` for the first, then
// `modify_series` after each `series_completed`. Candle rows arrive in
// `timescale_update` events as `{time, open, high, low, close, volume}`.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::stream::codec::{classify_payload, decode_frames, encode_payload, Payload};
use crate::stream::streamer::{connect_quote_socket, generate_session_id, send_json, WsSink};

/// Upper bound on one full candle download session.
const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Series slot and symbol-key prefixes inside the chart session.
const SERIES_ID: &str = "sds_1";

/// A single OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandleRow {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Download up to `bar_count` daily candles for every ticker. Tickers that
/// fail to resolve upstream are skipped with a warning; the rest of the batch
/// still completes.
pub async fn fetch_daily_candles(
    tickers: &[String],
    bar_count: u32,
) -> Result<HashMap<String, Vec<CandleRow>>> {
    tokio::time::timeout(FETCH_TIMEOUT, fetch_inner(tickers, bar_count))
        .await
        .context("candle download timed out")?
}

async fn fetch_inner(tickers: &[String], bar_count: u32) -> Result<HashMap<String, Vec<CandleRow>>> {
    let mut results: HashMap<String, Vec<CandleRow>> = HashMap::new();
    if tickers.is_empty() {
        return Ok(results);
    }

    let (mut write, mut read) = connect_quote_socket().await?;
    let chart_session = generate_session_id("cs");

    send_json(&mut write, &json!({"m": "set_auth_token", "p": ["unauthorized_user_token"]})).await?;
    send_json(&mut write, &json!({"m": "set_locale", "p": ["en", "IN"]})).await?;
    send_json(&mut write, &json!({"m": "chart_create_session", "p": [chart_session, ""]})).await?;
    send_json(&mut write, &json!({"m": "switch_timezone", "p": [chart_session, "Etc/UTC"]})).await?;

    // Resolve + create the first series; subsequent tickers reuse the slot.
    let mut index = 0usize;
    let symbol_key = resolve_key(index);
    send_json(
        &mut write,
        &json!({
            "m": "resolve_symbol",
            "p": [chart_session, symbol_key, symbol_spec(&tickers[index])]
        }),
    )
    .await?;
    send_json(
        &mut write,
        &json!({
            "m": "create_series",
            "p": [chart_session, SERIES_ID, format!("s{index}"), symbol_key, "1D", bar_count, ""]
        }),
    )
    .await?;

    let mut current_rows: Vec<CandleRow> = Vec::new();

    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        for payload in decode_frames(&text) {
            match classify_payload(&payload) {
                Some(Payload::Heartbeat(beat)) => {
                    write.send(Message::Text(encode_payload(&beat))).await?;
                }
                Some(Payload::Json(event)) => match event["m"].as_str() {
                    Some("timescale_update") => {
                        current_rows.extend(parse_timescale_rows(&event));
                    }
                    Some("series_completed") => {
                        let ticker = &tickers[index];
                        current_rows.sort_by_key(|r| r.time);
                        info!(ticker = %ticker, bars = current_rows.len(), "series complete");
                        results.insert(ticker.clone(), std::mem::take(&mut current_rows));

                        index += 1;
                        if index >= tickers.len() {
                            return Ok(results);
                        }
                        advance_series(&mut write, &chart_session, &tickers[index], index).await?;
                    }
                    Some("symbol_error") => {
                        warn!(ticker = %tickers[index], "symbol failed to resolve — skipping");
                        current_rows.clear();
                        index += 1;
                        if index >= tickers.len() {
                            return Ok(results);
                        }
                        advance_series(&mut write, &chart_session, &tickers[index], index).await?;
                    }
                    Some("critical_error") | Some("protocol_error") => {
                        anyhow::bail!(
                            "upstream protocol error during candle download: {}",
                            event["p"].get(0).and_then(Value::as_str).unwrap_or("unknown")
                        );
                    }
                    _ => {}
                },
                None => {}
            }
        }
    }

    // Socket closed before all series completed — return what we have.
    warn!(
        fetched = results.len(),
        requested = tickers.len(),
        "candle socket closed early"
    );
    Ok(results)
}

fn resolve_key(index: usize) -> String {
    format!("sds_sym_{index}")
}

/// Point the series slot at the next ticker.
async fn advance_series(
    write: &mut WsSink,
    chart_session: &str,
    ticker: &str,
    index: usize,
) -> Result<()> {
    let symbol_key = resolve_key(index);
    send_json(
        write,
        &json!({
            "m": "resolve_symbol",
            "p": [chart_session, symbol_key, symbol_spec(ticker)]
        }),
    )
    .await?;
    send_json(
        write,
        &json!({
            "m": "modify_series",
            "p": [chart_session, SERIES_ID, format!("s{index}"), symbol_key, "1D", ""]
        }),
    )
    .await?;
    Ok(())
}

/// Symbol spec string the chart session expects for resolution.
fn symbol_spec(ticker: &str) -> String {
    format!("={{\"adjustment\":\"splits\",\"symbol\":\"{ticker}\"}}")
}

/// Rows live at `p[1].<series_id>.s[*].v` as `[time, o, h, l, c, v]` arrays.
fn parse_timescale_rows(event: &Value) -> Vec<CandleRow> {
    let mut rows = Vec::new();
    let Some(series) = event["p"].get(1).and_then(|u| u.get(SERIES_ID)) else {
        return rows;
    };
    let Some(bars) = series["s"].as_array() else {
        return rows;
    };

    for bar in bars {
        let Some(v) = bar["v"].as_array() else {
            continue;
        };
        if v.len() < 6 {
            continue;
        }
        let nums: Vec<f64> = v.iter().filter_map(Value::as_f64).collect();
        if nums.len() < 6 {
            continue;
        }
        rows.push(CandleRow {
            time: nums[0] as i64,
            open: nums[1],
            high: nums[2],
            low: nums[3],
            close: nums[4],
            volume: nums[5],
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timescale_rows() {
        let event = json!({
            "m": "timescale_update",
            "p": ["cs_abc", {
                "sds_1": {
                    "s": [
                        {"i": 0, "v": [1700000000.0, 10.0, 12.0, 9.5, 11.0, 1500.0]},
                        {"i": 1, "v": [1700086400.0, 11.0, 13.0, 10.5, 12.5, 1800.0]}
                    ]
                }
            }]
        });
        let rows = parse_timescale_rows(&event);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].time, 1_700_000_000);
        assert_eq!(rows[1].close, 12.5);
        assert_eq!(rows[1].volume, 1800.0);
    }

    #[test]
    fn short_or_malformed_bars_are_skipped() {
        let event = json!({
            "m": "timescale_update",
            "p": ["cs_abc", {
                "sds_1": {
                    "s": [
                        {"i": 0, "v": [1.0, 2.0]},
                        {"i": 1, "v": "not an array"},
                        {"i": 2, "v": [1700000000.0, 10.0, 12.0, 9.5, 11.0, 1500.0]}
                    ]
                }
            }]
        });
        let rows = parse_timescale_rows(&event);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].open, 10.0);
    }

    #[test]
    fn events_without_series_yield_nothing() {
        assert!(parse_timescale_rows(&json!({"m": "timescale_update", "p": ["cs_abc"]})).is_empty());
        assert!(parse_timescale_rows(&json!({"m": "du", "p": ["cs", {"other": {}}]})).is_empty());
    }

    #[test]
    fn symbol_spec_embeds_ticker() {
        assert_eq!(
            symbol_spec("NSE:RELIANCE"),
            "={\"adjustment\":\"splits\",\"symbol\":\"NSE:RELIANCE\"}"
        );
    }
}

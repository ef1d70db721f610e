// =============================================================================
// Live Quote Fetcher — OHLC overlay for screener sessions
// =============================================================================
//
// Screener partial responses carry live OHLC quotes from the broker's REST
// quote API. Tickers translate to broker instrument keys through an explicit
// `InstrumentKeyMap` built from the feature table at startup — immutable
// while streaming, rebuilt on refresh.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value as Json;
use tracing::debug;

/// The broker quote endpoint.
const QUOTE_URL: &str = "https://api.upstox.com/v3/market-quote/ohlc";

/// HTTP timeout for quote calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Maximum instrument keys per quote request.
pub const QUOTE_BATCH_SIZE: usize = 500;

// ---------------------------------------------------------------------------
// Instrument key translation
// ---------------------------------------------------------------------------

/// Bidirectional ticker ↔ instrument-key map. Keys look like
/// `NSE_EQ|INE002A01018` — exchange + segment, then the ISIN.
#[derive(Debug, Default, Clone)]
pub struct InstrumentKeyMap {
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
}

impl InstrumentKeyMap {
    /// Build from feature-table rows. Rows without a ticker, exchange or
    /// ISIN cannot be translated and are skipped.
    pub fn from_rows(rows: &HashMap<String, HashMap<String, Json>>) -> Self {
        let mut map = Self::default();
        for (ticker, row) in rows {
            let Some(key) = instrument_key_of(row) else {
                continue;
            };
            map.forward.insert(ticker.clone(), key.clone());
            map.reverse.insert(key, ticker.clone());
        }
        map
    }

    pub fn to_key(&self, ticker: &str) -> Option<&str> {
        self.forward.get(ticker).map(String::as_str)
    }

    pub fn to_ticker(&self, instrument_key: &str) -> Option<&str> {
        self.reverse.get(instrument_key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

fn instrument_key_of(row: &HashMap<String, Json>) -> Option<String> {
    let exchange = row.get("exchange")?.as_str()?;
    let isin = row.get("isin")?.as_str()?;
    if exchange.is_empty() || isin.is_empty() {
        return None;
    }
    let segment = match row.get("type").and_then(Json::as_str) {
        Some("index") => "INDEX",
        _ => "EQ",
    };
    Some(format!("{exchange}_{segment}|{isin}"))
}

// ---------------------------------------------------------------------------
// Fetcher seam
// ---------------------------------------------------------------------------

/// One batch of live-symbol rows in, one batch of quote rows out. The trait
/// exists so sessions can run against a fake in tests.
#[async_trait]
pub trait QuoteFetcher: Send + Sync {
    async fn fetch_batch(&self, symbols: &[Json], token: &str) -> Result<Vec<Json>>;
}

/// Production fetcher against the broker OHLC endpoint.
pub struct OhlcQuoteFetcher {
    client: reqwest::Client,
    key_map: InstrumentKeyMap,
}

impl OhlcQuoteFetcher {
    pub fn new(key_map: InstrumentKeyMap) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self { client, key_map }
    }
}

#[async_trait]
impl QuoteFetcher for OhlcQuoteFetcher {
    async fn fetch_batch(&self, symbols: &[Json], token: &str) -> Result<Vec<Json>> {
        let keys: Vec<&str> = symbols
            .iter()
            .filter_map(|row| row.get("ticker"))
            .filter_map(Json::as_str)
            .filter_map(|t| self.key_map.to_key(t))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let resp = self
            .client
            .get(QUOTE_URL)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .query(&[("instrument_key", keys.join(",")), ("interval", "1d".into())])
            .send()
            .await
            .context("quote request failed")?
            .error_for_status()
            .context("quote request rejected")?;

        let body: Json = resp.json().await.context("quote response not JSON")?;
        let data = body.get("data").and_then(Json::as_object);

        let rows = data
            .map(|entries| {
                entries
                    .values()
                    .map(|v| {
                        let ticker = v
                            .get("instrument_token")
                            .and_then(Json::as_str)
                            .and_then(|k| self.key_map.to_ticker(k));
                        serde_json::json!({
                            "ticker": ticker,
                            "prev_ohlc": v.get("prev_ohlc"),
                            "live_ohlc": v.get("live_ohlc"),
                            "lp": v.get("last_price"),
                        })
                    })
                    .collect::<Vec<Json>>()
            })
            .unwrap_or_default();

        debug!(requested = keys.len(), received = rows.len(), "quote batch fetched");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> HashMap<String, HashMap<String, Json>> {
        let mut rows = HashMap::new();
        let mut a = HashMap::new();
        a.insert("ticker".into(), Json::from("NSE:RELIANCE"));
        a.insert("exchange".into(), Json::from("NSE"));
        a.insert("isin".into(), Json::from("INE002A01018"));
        a.insert("type".into(), Json::from("stock"));
        rows.insert("NSE:RELIANCE".to_string(), a);

        let mut idx = HashMap::new();
        idx.insert("ticker".into(), Json::from("NSE:NIFTY"));
        idx.insert("exchange".into(), Json::from("NSE"));
        idx.insert("isin".into(), Json::from("IDX001"));
        idx.insert("type".into(), Json::from("index"));
        rows.insert("NSE:NIFTY".to_string(), idx);

        let mut broken = HashMap::new();
        broken.insert("ticker".into(), Json::from("NSE:NOISIN"));
        broken.insert("exchange".into(), Json::from("NSE"));
        broken.insert("isin".into(), Json::Null);
        rows.insert("NSE:NOISIN".to_string(), broken);

        rows
    }

    #[test]
    fn key_map_round_trips_both_directions() {
        let map = InstrumentKeyMap::from_rows(&rows());
        assert_eq!(map.len(), 2);
        assert_eq!(map.to_key("NSE:RELIANCE"), Some("NSE_EQ|INE002A01018"));
        assert_eq!(map.to_ticker("NSE_EQ|INE002A01018"), Some("NSE:RELIANCE"));
        assert_eq!(map.to_key("NSE:NIFTY"), Some("NSE_INDEX|IDX001"));
    }

    #[test]
    fn untranslatable_rows_are_skipped() {
        let map = InstrumentKeyMap::from_rows(&rows());
        assert_eq!(map.to_key("NSE:NOISIN"), None);
        assert_eq!(map.to_key("NSE:UNKNOWN"), None);
    }
}

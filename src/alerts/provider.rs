// =============================================================================
// Alert Data Providers — tick sources behind one seam
// =============================================================================
//
// The engine talks to `AlertDataProvider` only: subscribe/unsubscribe by
// symbol, start a tick pump, stop. The production implementation rides the
// quote scaler; the mock emits synthetic ticks for local runs and tests.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::alerts::models::ChangeUpdate;
use crate::stream::scaler::QuoteScaler;
use crate::stream::streamer::QuoteStreamEvent;

/// Quote fields the alert path needs from the wire.
const ALERT_QUOTE_FIELDS: &[&str] = &["lp", "lp_time", "exchange", "pro_name", "short_name"];

#[async_trait]
pub trait AlertDataProvider: Send + Sync {
    /// Begin streaming ticks for a symbol. Idempotent.
    async fn subscribe(&self, symbol: &str);

    /// Stop streaming ticks for a symbol.
    async fn unsubscribe(&self, symbol: &str);

    /// Start the provider; ticks flow into `ticks` until stopped.
    async fn start(&self, ticks: mpsc::Sender<ChangeUpdate>) -> Result<()>;

    async fn stop(&self);
}

// ---------------------------------------------------------------------------
// Scaler-backed provider
// ---------------------------------------------------------------------------

/// Streams live ticks through the sharded quote connections.
pub struct StreamerProvider {
    scaler: Mutex<QuoteScaler>,
}

impl StreamerProvider {
    pub fn new(max_connections: usize, max_tickers_per_connection: usize) -> Self {
        let fields = ALERT_QUOTE_FIELDS.iter().map(|s| s.to_string()).collect();
        Self {
            scaler: Mutex::new(QuoteScaler::new(
                fields,
                max_connections,
                max_tickers_per_connection,
            )),
        }
    }
}

#[async_trait]
impl AlertDataProvider for StreamerProvider {
    async fn subscribe(&self, symbol: &str) {
        self.scaler
            .lock()
            .await
            .add_tickers(&[symbol.to_string()])
            .await;
    }

    async fn unsubscribe(&self, symbol: &str) {
        self.scaler
            .lock()
            .await
            .remove_tickers(&[symbol.to_string()])
            .await;
    }

    async fn start(&self, ticks: mpsc::Sender<ChangeUpdate>) -> Result<()> {
        let mut events = {
            let mut scaler = self.scaler.lock().await;
            scaler.start();
            scaler.quote_events()
        };

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event.kind {
                    QuoteStreamEvent::QuoteUpdate | QuoteStreamEvent::QuoteCompleted => {
                        let Some(ticker) = event.ticker else { continue };
                        match tick_from_quote(&ticker, &event.data) {
                            Some(update) => {
                                if ticks.send(update).await.is_err() {
                                    return; // engine gone
                                }
                            }
                            None => {
                                debug!(ticker = %ticker, "quote without lp/lp_time — skipped");
                            }
                        }
                    }
                    QuoteStreamEvent::Error => {
                        warn!(data = %event.data, "quote stream error event");
                    }
                    QuoteStreamEvent::Connected | QuoteStreamEvent::Disconnected => {
                        info!(kind = ?event.kind, "quote stream lifecycle event");
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        self.scaler.lock().await.stop().await;
    }
}

/// Build a tick from a merged quote. Requires `lp` and `lp_time`; quantity
/// falls back to zero when the wire omits volume.
fn tick_from_quote(ticker: &str, data: &Value) -> Option<ChangeUpdate> {
    let ltp = data.get("lp")?.as_f64()?;
    let lp_time = data.get("lp_time")?.as_f64()?;
    let ltt = Utc.timestamp_millis_opt((lp_time * 1000.0) as i64).single()?;
    let ltq = data.get("volume").and_then(Value::as_f64).unwrap_or(0.0);

    Some(ChangeUpdate {
        symbol: ticker.to_string(),
        ltp,
        ltt,
        ltq,
    })
}

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

/// Emits a synthetic tick per subscribed symbol every second. Useful for
/// wiring checks without upstream connectivity.
pub struct MockProvider {
    tickers: Arc<RwLock<HashSet<String>>>,
    running: Arc<RwLock<bool>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            tickers: Arc::new(RwLock::new(HashSet::new())),
            running: Arc::new(RwLock::new(true)),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertDataProvider for MockProvider {
    async fn subscribe(&self, symbol: &str) {
        info!(symbol = %symbol, "[mock feed] subscribed");
        self.tickers.write().insert(symbol.to_string());
    }

    async fn unsubscribe(&self, symbol: &str) {
        if self.tickers.write().remove(symbol) {
            info!(symbol = %symbol, "[mock feed] unsubscribed");
        }
    }

    async fn start(&self, ticks: mpsc::Sender<ChangeUpdate>) -> Result<()> {
        let tickers = self.tickers.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if !*running.read() {
                    return;
                }

                let now = Utc::now();
                // Deterministic wobble in the 100–200 band.
                let price = 100.0 + (now.timestamp() % 100) as f64 + 0.5;

                let symbols: Vec<String> = tickers.read().iter().cloned().collect();
                for symbol in symbols {
                    let update = ChangeUpdate {
                        symbol,
                        ltp: price,
                        ltt: now,
                        ltq: 10.0,
                    };
                    if ticks.send(update).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        *self.running.write() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tick_requires_price_and_time() {
        assert!(tick_from_quote("NSE:X", &json!({"lp": 101.5})).is_none());
        assert!(tick_from_quote("NSE:X", &json!({"lp_time": 1700000000})).is_none());

        let tick = tick_from_quote(
            "NSE:X",
            &json!({"lp": 101.5, "lp_time": 1700000000, "volume": 42.0}),
        )
        .unwrap();
        assert_eq!(tick.symbol, "NSE:X");
        assert_eq!(tick.ltp, 101.5);
        assert_eq!(tick.ltt.timestamp(), 1_700_000_000);
        assert_eq!(tick.ltq, 42.0);
    }

    #[test]
    fn missing_volume_defaults_to_zero() {
        let tick =
            tick_from_quote("NSE:X", &json!({"lp": 9.0, "lp_time": 1700000000})).unwrap();
        assert_eq!(tick.ltq, 0.0);
    }

    #[tokio::test]
    async fn mock_provider_tracks_subscriptions() {
        let provider = MockProvider::new();
        provider.subscribe("NSE:X").await;
        provider.subscribe("NSE:Y").await;
        provider.unsubscribe("NSE:X").await;
        assert!(provider.tickers.read().contains("NSE:Y"));
        assert!(!provider.tickers.read().contains("NSE:X"));
    }
}

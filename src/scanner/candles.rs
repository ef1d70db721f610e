// =============================================================================
// Candle Provider — per-market OHLCV tables for the scanner
// =============================================================================
//
// The scanner consumes columnar OHLCV tables keyed by ticker. The file
// provider reads the serialized per-ticker cache written by the last refresh
// and rebuilds it from the chart-session downloader on demand.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::stream::candles::{fetch_daily_candles, CandleRow};

/// Columnar OHLCV series for one symbol, oldest bar first.
#[derive(Debug, Clone, Default)]
pub struct OhlcvTable {
    pub time: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl OhlcvTable {
    pub fn from_rows(rows: &[CandleRow]) -> Self {
        let mut table = Self::default();
        for row in rows {
            table.time.push(row.time);
            table.open.push(row.open);
            table.high.push(row.high);
            table.low.push(row.low);
            table.close.push(row.close);
            table.volume.push(row.volume);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }
}

#[async_trait]
pub trait CandleProvider: Send + Sync {
    /// Load all cached symbol tables.
    fn load_data(&self) -> Result<HashMap<String, OhlcvTable>>;

    /// Re-download candles from the upstream and persist the cache.
    async fn refresh_data(&self) -> Result<HashMap<String, OhlcvTable>>;
}

// ---------------------------------------------------------------------------
// File-backed provider
// ---------------------------------------------------------------------------

/// Serves candles from a JSON snapshot on disk (`ticker → rows`), refreshed
/// through the chart-session downloader.
pub struct FileCandleProvider {
    path: PathBuf,
    tickers: Vec<String>,
    bar_count: u32,
}

impl FileCandleProvider {
    pub fn new(path: PathBuf, tickers: Vec<String>, bar_count: u32) -> Self {
        Self {
            path,
            tickers,
            bar_count,
        }
    }

    fn tables_from_rows(rows: HashMap<String, Vec<CandleRow>>) -> HashMap<String, OhlcvTable> {
        rows.into_iter()
            .map(|(ticker, rows)| (ticker, OhlcvTable::from_rows(&rows)))
            .collect()
    }
}

#[async_trait]
impl CandleProvider for FileCandleProvider {
    fn load_data(&self) -> Result<HashMap<String, OhlcvTable>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "candle cache missing — starting empty");
                return Ok(HashMap::new());
            }
        };
        let rows: HashMap<String, Vec<CandleRow>> = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt candle cache at {}", self.path.display()))?;
        info!(path = %self.path.display(), symbols = rows.len(), "candle cache loaded");
        Ok(Self::tables_from_rows(rows))
    }

    async fn refresh_data(&self) -> Result<HashMap<String, OhlcvTable>> {
        info!(tickers = self.tickers.len(), "refreshing candle cache");
        let rows = fetch_daily_candles(&self.tickers, self.bar_count).await?;

        let serialized = serde_json::to_string(&rows).context("failed to serialize candle cache")?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write candle cache at {}", self.path.display()))?;

        info!(path = %self.path.display(), symbols = rows.len(), "candle cache refreshed");
        Ok(Self::tables_from_rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(time: i64, close: f64) -> CandleRow {
        CandleRow {
            time,
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn table_from_rows_is_columnar() {
        let table = OhlcvTable::from_rows(&[row(1, 10.0), row(2, 11.0)]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.close, vec![10.0, 11.0]);
        assert_eq!(table.open, vec![9.0, 10.0]);
        assert_eq!(table.time, vec![1, 2]);
    }

    #[test]
    fn missing_cache_file_loads_empty() {
        let provider = FileCandleProvider::new(
            PathBuf::from("/nonexistent/candles.json"),
            vec![],
            300,
        );
        assert!(provider.load_data().unwrap().is_empty());
    }

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = std::env::temp_dir().join("pulseboard-candle-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("candles-india.json");

        let mut rows = HashMap::new();
        rows.insert("NSE:X".to_string(), vec![row(1, 10.0), row(2, 12.0)]);
        std::fs::write(&path, serde_json::to_string(&rows).unwrap()).unwrap();

        let provider = FileCandleProvider::new(path.clone(), vec!["NSE:X".into()], 300);
        let tables = provider.load_data().unwrap();
        assert_eq!(tables["NSE:X"].close, vec![10.0, 12.0]);

        std::fs::remove_file(path).ok();
    }
}

// =============================================================================
// Environment Configuration — typed view over process environment
// =============================================================================
//
// Every external endpoint and credential the platform touches is read here,
// once, at startup.  Modes validate only the variables they actually need:
// the alerts worker fails fast without a webhook URL or store credentials,
// while the scanner service runs without either.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Default HTTP bind port for the scanner/screener service.
const DEFAULT_PORT: u16 = 8000;

/// Shared configuration assembled from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Webhook target for triggered alerts. Required by the alerts worker.
    /// Variable name keeps the historical spelling `ALERT_WEBOOK_URL`.
    pub alert_webhook_url: Option<String>,

    /// Alert store endpoint (Supabase-compatible REST + realtime).
    pub supabase_url: Option<String>,
    /// Service-role credential for the alert store.
    pub supabase_service_key: Option<String>,

    /// HTTP bind port for the API service.
    pub port: u16,

    /// Base URL of the fundamentals feed used by the download modes.
    pub fundamental_base_url: Option<String>,

    /// Root directory for on-disk snapshots (feature table, candle cache,
    /// downloaded fundamentals). Defaults to the current directory.
    pub base_file_path: PathBuf,
}

impl Config {
    /// Read configuration from the environment. Never fails by itself —
    /// required variables are asserted per-mode via the accessors below.
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        Self {
            alert_webhook_url: std::env::var("ALERT_WEBOOK_URL").ok(),
            supabase_url: std::env::var("SUPABASE_URL").ok(),
            supabase_service_key: std::env::var("SUPABASE_SERVICE_KEY").ok(),
            port,
            fundamental_base_url: std::env::var("STOCK_FUNDAMENTAL_BASE_URL").ok(),
            base_file_path: std::env::var("BASE_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Webhook URL, required for alert dispatch.
    pub fn require_webhook_url(&self) -> Result<String> {
        self.alert_webhook_url
            .clone()
            .context("ALERT_WEBOOK_URL environment variable not set")
    }

    /// Store endpoint and credential, required for the alerts worker.
    pub fn require_store(&self) -> Result<(String, String)> {
        let url = self
            .supabase_url
            .clone()
            .context("SUPABASE_URL environment variable not set")?;
        let key = self
            .supabase_service_key
            .clone()
            .context("SUPABASE_SERVICE_KEY environment variable not set")?;
        Ok((url, key))
    }

    /// Fundamentals feed base URL, required for the download modes.
    pub fn require_fundamental_base_url(&self) -> Result<String> {
        self.fundamental_base_url
            .clone()
            .context("STOCK_FUNDAMENTAL_BASE_URL environment variable not set")
    }

    /// Path to the columnar feature-table snapshot.
    pub fn feature_table_path(&self) -> PathBuf {
        self.base_file_path.join("symbols-full.json")
    }

    /// Path to the serialized candle cache for a market.
    pub fn candle_cache_path(&self, market: &str) -> PathBuf {
        self.base_file_path.join(format!("candles-{market}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_cache_path_is_market_scoped() {
        let cfg = Config {
            alert_webhook_url: None,
            supabase_url: None,
            supabase_service_key: None,
            port: DEFAULT_PORT,
            fundamental_base_url: None,
            base_file_path: PathBuf::from("/tmp/data"),
        };
        assert_eq!(
            cfg.candle_cache_path("india"),
            PathBuf::from("/tmp/data/candles-india.json")
        );
        assert_eq!(
            cfg.feature_table_path(),
            PathBuf::from("/tmp/data/symbols-full.json")
        );
    }

    #[test]
    fn require_webhook_url_missing_is_descriptive() {
        let cfg = Config {
            alert_webhook_url: None,
            supabase_url: None,
            supabase_service_key: None,
            port: DEFAULT_PORT,
            fundamental_base_url: None,
            base_file_path: PathBuf::from("."),
        };
        let err = cfg.require_webhook_url().unwrap_err();
        assert!(err.to_string().contains("ALERT_WEBOOK_URL"));
    }
}

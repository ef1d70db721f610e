// =============================================================================
// Ideas & Symbol-Detail Proxies
// =============================================================================
//
// Thin pass-throughs to the upstream community-ideas feed and the symbol
// research provider. The payloads are opaque to us — whatever JSON the
// upstream answers goes straight back to the client.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value as Json;
use tracing::debug;

const IDEAS_BASE_URL: &str = "https://api.stocktwits.com/api/2";
const SYMBOL_DETAIL_BASE_URL: &str = "https://marketsmithindia.com/mstool/eval";

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

pub struct IdeasClient {
    client: reqwest::Client,
    ideas_base: String,
    detail_base: String,
}

impl IdeasClient {
    pub fn new() -> Self {
        Self::with_bases(IDEAS_BASE_URL.into(), SYMBOL_DETAIL_BASE_URL.into())
    }

    pub fn with_bases(ideas_base: String, detail_base: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            ideas_base,
            detail_base,
        }
    }

    /// Global feed: trending | suggested | popular.
    pub async fn global_feed(&self, feed: &str, limit: u32) -> Result<Json> {
        let url = format!("{}/streams/{feed}.json", self.ideas_base);
        self.fetch(&url, &[("limit", limit.to_string())]).await
    }

    /// Per-symbol feed: trending | popular.
    pub async fn symbol_feed(&self, symbol: &str, feed: &str, limit: u32) -> Result<Json> {
        let url = format!("{}/streams/symbol/{symbol}.json", self.ideas_base);
        self.fetch(
            &url,
            &[("filter", feed.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    /// Symbol research detail. The upstream keys by bare symbol name, so the
    /// exchange prefix is stripped before lookup.
    pub async fn symbol_detail(&self, symbol: &str) -> Result<Json> {
        let name = symbol.rsplit(':').next().unwrap_or(symbol).trim();
        let url = format!("{}/{name}/evaluation.json", self.detail_base);
        self.fetch(&url, &[]).await
    }

    async fn fetch(&self, url: &str, query: &[(&str, String)]) -> Result<Json> {
        debug!(url = %url, "proxying upstream request");
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .context("upstream request failed")?
            .error_for_status()
            .context("upstream returned an error status")?;
        resp.json().await.context("upstream response was not JSON")
    }
}

impl Default for IdeasClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_prefix_is_stripped_for_detail_lookup() {
        // The URL shape is all we can check without the network; exercise
        // the symbol normalization through a private-path probe.
        let name = "NSE:RELIANCE".rsplit(':').next().unwrap().trim();
        assert_eq!(name, "RELIANCE");
        let plain = "TCS".rsplit(':').next().unwrap().trim();
        assert_eq!(plain, "TCS");
    }
}

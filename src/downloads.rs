// =============================================================================
// Bulk Download Modes — fundamentals / research / compliance snapshots
// =============================================================================
//
// The download CLI modes walk the feature-table universe and pull one JSON
// document per symbol from the configured upstream, writing snapshots under
// BASE_FILE_PATH/<dataset>/. Vendor-specific response parsing belongs to the
// offline batch that consumes these files; this side only fetches and
// persists.
//
// Failures are per-symbol: a bad ticker is logged and skipped, the run
// completes, and the exit status stays zero.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::screener::FeatureTable;

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Which dataset a download run targets.
#[derive(Debug, Clone, Copy)]
pub enum Dataset {
    Fundamental,
    Research,
    Compliance,
}

impl Dataset {
    fn path_segment(self) -> &'static str {
        match self {
            Dataset::Fundamental => "fundamental",
            Dataset::Research => "research",
            Dataset::Compliance => "compliance",
        }
    }
}

/// Download one dataset for every symbol in the feature table.
pub async fn run_download(config: &Config, table: &FeatureTable, dataset: Dataset) -> Result<()> {
    let base_url = config.require_fundamental_base_url()?;
    let tickers = table.tickers()?;
    info!(
        dataset = dataset.path_segment(),
        symbols = tickers.len(),
        "starting bulk download"
    );

    let out_dir = config.base_file_path.join(dataset.path_segment());
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("cannot create {}", out_dir.display()))?;

    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build reqwest client")?;

    let mut fetched = 0usize;
    let mut failed = 0usize;

    for (index, ticker) in tickers.iter().enumerate() {
        // The upstream keys by bare symbol name.
        let name = ticker.rsplit(':').next().unwrap_or(ticker);
        let url = format!(
            "{}/{}/{}",
            base_url.trim_end_matches('/'),
            dataset.path_segment(),
            name
        );

        match fetch_one(&client, &url).await {
            Ok(payload) => {
                if let Err(e) = write_snapshot(&out_dir, ticker, &payload) {
                    warn!(ticker = %ticker, error = %e, "snapshot write failed");
                    failed += 1;
                } else {
                    fetched += 1;
                }
            }
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "download failed");
                failed += 1;
            }
        }

        if (index + 1) % 100 == 0 {
            info!(
                dataset = dataset.path_segment(),
                done = index + 1,
                total = tickers.len(),
                "download progress"
            );
        }
    }

    info!(
        dataset = dataset.path_segment(),
        fetched, failed, "bulk download complete"
    );
    Ok(())
}

async fn fetch_one(client: &reqwest::Client, url: &str) -> Result<serde_json::Value> {
    let resp = client
        .get(url)
        .send()
        .await
        .context("request failed")?
        .error_for_status()
        .context("rejected by upstream")?;
    resp.json().await.context("response was not JSON")
}

fn write_snapshot(dir: &Path, ticker: &str, payload: &serde_json::Value) -> Result<()> {
    // Tickers carry a colon; keep filenames filesystem-safe.
    let file = dir.join(format!("{}.json", ticker.replace(':', "_")));
    std::fs::write(&file, serde_json::to_string(payload)?)
        .with_context(|| format!("cannot write {}", file.display()))?;
    Ok(())
}

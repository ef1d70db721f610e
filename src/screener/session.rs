// =============================================================================
// Screener Session — filter/sort/columns/range state + live overlay
// =============================================================================
//
// One session per `session_id` on a connection. The session owns its view
// state, answers full responses from the feature table, and runs a realtime
// task that overlays live OHLC quotes every five seconds for the symbols
// currently matching the filter.
//
// Table queries are synchronous SQLite work and run on the blocking pool;
// outbound messages go through the connection's writer channel, which is
// what tests hook into.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::screener::protocol::{PatchRequest, ServerMessage, SubscribeRequest};
use crate::screener::quotes::{QuoteFetcher, QUOTE_BATCH_SIZE};
use crate::screener::sql::{FilterExpr, JoinOp, SortDir, SortField};
use crate::screener::table::FeatureTable;

/// Columns served when a subscriber does not ask for any.
const DEFAULT_COLUMNS: &[&str] = &["ticker", "name", "logo", "day_close"];

/// Projection backing the live-quote overlay.
const LIVE_SYMBOL_COLUMNS: &[&str] = &["ticker", "name", "isin", "type", "exchange"];

/// Cadence of the realtime overlay.
const REALTIME_INTERVAL: Duration = Duration::from_secs(5);

/// Pagination tiebreaker appended to every client sort so equal keys page
/// consistently.
fn name_tiebreaker() -> SortField {
    SortField {
        col_id: "name".into(),
        direction: SortDir::Asc,
    }
}

pub struct ScreenerSession {
    session_id: String,
    token: Option<String>,
    table: Arc<FeatureTable>,
    fetcher: Arc<dyn QuoteFetcher>,
    out: mpsc::Sender<ServerMessage>,

    universe: Option<Vec<String>>,
    filters: Vec<FilterExpr>,
    filter_merge: JoinOp,
    sort: Vec<SortField>,
    columns: Vec<String>,
    range: (i64, i64),

    live_symbols: Arc<RwLock<Vec<Json>>>,
    realtime_task: Option<JoinHandle<()>>,
}

impl ScreenerSession {
    pub fn new(
        session_id: String,
        token: Option<String>,
        table: Arc<FeatureTable>,
        fetcher: Arc<dyn QuoteFetcher>,
        out: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            session_id,
            token,
            table,
            fetcher,
            out,
            universe: None,
            filters: Vec::new(),
            filter_merge: JoinOp::Or,
            sort: Vec::new(),
            columns: DEFAULT_COLUMNS.iter().map(|s| s.to_string()).collect(),
            range: (0, -1),
            live_symbols: Arc::new(RwLock::new(Vec::new())),
            realtime_task: None,
        }
    }

    /// Adopt the subscribe request, acknowledge, answer the first page, and
    /// start the realtime overlay.
    pub async fn subscribe(&mut self, req: SubscribeRequest) {
        self.universe = req.universe;
        self.columns = if req.columns.is_empty() {
            DEFAULT_COLUMNS.iter().map(|s| s.to_string()).collect()
        } else {
            req.columns
        };
        self.range = if req.range.len() < 2 {
            (0, -1)
        } else {
            (req.range[0], req.range[1])
        };
        self.filters = req.filters;
        self.filter_merge = req.filter_merge;
        self.sort = with_tiebreaker(req.sort);

        self.prefetch_live_symbols().await;
        self.send(ServerMessage::Subscribed {
            session_id: self.session_id.clone(),
        })
        .await;
        self.dispatch_full_response().await;
        self.start_realtime();
    }

    /// Apply only the fields present. Any change acknowledges, re-answers
    /// the page and refreshes the live projection.
    pub async fn patch(&mut self, req: PatchRequest) {
        let mut patched = false;

        if let Some(merge) = req.filter_merge {
            self.filter_merge = merge;
            patched = true;
        }
        if let Some(columns) = req.columns {
            self.columns = if columns.is_empty() {
                vec!["name".to_string()]
            } else {
                columns
            };
            patched = true;
        }
        if let Some(filters) = req.filters {
            self.filters = filters;
            patched = true;
        }
        if let Some(range) = req.range {
            self.range = range;
            patched = true;
        }
        if let Some(sort) = req.sort {
            self.sort = with_tiebreaker(sort);
            patched = true;
        }

        if patched {
            self.send(ServerMessage::Patched {
                session_id: self.session_id.clone(),
            })
            .await;
            self.dispatch_full_response().await;
            self.prefetch_live_symbols().await;
        }
    }

    /// Replace the universe (None = full screener, list = watchlist).
    pub async fn set_universe(&mut self, universe: Option<Vec<String>>) {
        self.universe = universe;
        self.dispatch_full_response().await;
        self.prefetch_live_symbols().await;
    }

    /// Cancel the realtime overlay. Must leave no task behind.
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.realtime_task.take() {
            task.abort();
            debug!(session = %self.session_id, "realtime task cancelled");
        }
    }

    // ── Full response path ──────────────────────────────────────────────

    /// Answer the current page: `[start, end)` over the filtered, sorted
    /// projection, plus the unpaged total. An inverted or negative range is
    /// silently ignored.
    pub async fn dispatch_full_response(&self) {
        let (start, end) = self.range;
        if end < start || end < 0 {
            return;
        }

        let table = self.table.clone();
        let columns = self.columns.clone();
        let filters = self.filters.clone();
        let merge = self.filter_merge;
        let sort = self.sort.clone();
        let universe = self.universe.clone();

        type Page = (Vec<String>, Vec<Vec<Json>>, usize);
        let result = tokio::task::spawn_blocking(move || -> Result<Page> {
            let total = table.count_symbols(&filters, merge, universe.as_deref())?;
            let (c, d) = table.query_symbols(
                &columns,
                &filters,
                merge,
                &sort,
                universe.as_deref(),
                Some(start),
                Some(end - start),
            )?;
            Ok((c, d, total))
        })
        .await;

        match result {
            Ok(Ok((c, d, total))) => {
                self.send(ServerMessage::Full {
                    session_id: self.session_id.clone(),
                    c,
                    d,
                    range: (start, end),
                    total,
                })
                .await;
            }
            Ok(Err(e)) => {
                warn!(session = %self.session_id, error = %e, "full response query failed");
                self.send(ServerMessage::Error { msg: e.to_string() }).await;
            }
            Err(e) => error!(session = %self.session_id, error = %e, "full response task panicked"),
        }
    }

    /// Refresh the lightweight projection feeding the realtime overlay.
    pub async fn prefetch_live_symbols(&self) {
        let table = self.table.clone();
        let filters = self.filters.clone();
        let merge = self.filter_merge;
        let sort = self.sort.clone();
        let universe = self.universe.clone();

        let result = tokio::task::spawn_blocking(
            move || -> Result<(Vec<String>, Vec<Vec<Json>>)> {
                let columns: Vec<String> =
                    LIVE_SYMBOL_COLUMNS.iter().map(|s| s.to_string()).collect();
                table.query_symbols(&columns, &filters, merge, &sort, universe.as_deref(), None, None)
            },
        )
        .await;

        match result {
            Ok(Ok((columns, rows))) => {
                let records: Vec<Json> = rows
                    .into_iter()
                    .map(|row| {
                        Json::Object(columns.iter().cloned().zip(row).collect())
                    })
                    .collect();
                debug!(session = %self.session_id, live = records.len(), "live symbols refreshed");
                *self.live_symbols.write() = records;
            }
            Ok(Err(e)) => {
                warn!(session = %self.session_id, error = %e, "live symbol projection failed")
            }
            Err(e) => error!(session = %self.session_id, error = %e, "live symbol task panicked"),
        }
    }

    // ── Realtime overlay ────────────────────────────────────────────────

    /// Every five seconds, fetch live quotes for the current symbols in
    /// batches and emit each batch as a partial response. No reconciliation
    /// against the last full response happens server-side.
    fn start_realtime(&mut self) {
        // Replace a previous task if subscribe is somehow re-entered.
        self.unsubscribe();

        let session_id = self.session_id.clone();
        let token = self.token.clone();
        let live_symbols = self.live_symbols.clone();
        let fetcher = self.fetcher.clone();
        let out = self.out.clone();

        self.realtime_task = Some(tokio::spawn(async move {
            let Some(token) = token else {
                info!(session = %session_id, "no auth token — realtime overlay idle");
                return;
            };

            let mut interval = tokio::time::interval(REALTIME_INTERVAL);
            loop {
                interval.tick().await;

                let symbols: Vec<Json> = live_symbols.read().clone();
                if symbols.is_empty() {
                    continue;
                }

                for batch in symbols.chunks(QUOTE_BATCH_SIZE) {
                    match fetcher.fetch_batch(batch, &token).await {
                        Ok(rows) if !rows.is_empty() => {
                            let msg = ServerMessage::Partial {
                                session_id: session_id.clone(),
                                d: rows,
                            };
                            if out.send(msg).await.is_err() {
                                return; // connection gone
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(session = %session_id, error = %e, "quote overlay fetch failed");
                        }
                    }
                }
            }
        }));
    }

    async fn send(&self, msg: ServerMessage) {
        if self.out.send(msg).await.is_err() {
            debug!(session = %self.session_id, "outbound channel closed");
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for ScreenerSession {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn with_tiebreaker(mut sort: Vec<SortField>) -> Vec<SortField> {
    sort.push(name_tiebreaker());
    sort
}

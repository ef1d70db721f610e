// =============================================================================
// Feature Table — in-memory SQL over the per-symbol feature snapshot
// =============================================================================
//
// The offline batch publishes a columnar snapshot keyed by ticker; this
// module hosts it in an in-memory SQLite database so both the screener's
// generated queries and the verbatim `/scanner/scan` SQL run against the
// same table (`symbols`).
//
// Queries are synchronous; callers on the async runtime go through
// `spawn_blocking`. The periodic refresh simply rebuilds the table from the
// snapshot file.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value as Json;
use tracing::{info, warn};

use crate::screener::sql::{self, FilterExpr, JoinOp, SortField};

const TABLE_NAME: &str = "symbols";

pub struct FeatureTable {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl FeatureTable {
    /// Load the snapshot file (a JSON array of row objects) into a fresh
    /// in-memory database. A missing file yields an empty table.
    pub fn load(path: PathBuf) -> Result<Self> {
        let rows = read_rows(&path)?;
        let table = Self::from_rows(rows)?;
        Ok(Self {
            path: Some(path),
            ..table
        })
    }

    /// Build directly from rows (tests, fixtures).
    pub fn from_rows(rows: Vec<serde_json::Map<String, Json>>) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        populate(&conn, &rows)?;
        info!(rows = rows.len(), "feature table loaded");
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Rebuild the table from the snapshot file.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(()); // fixture-backed table, nothing to reload
        };
        let rows = read_rows(path)?;
        let conn = self.conn.lock();
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {TABLE_NAME};"))
            .context("failed to drop feature table")?;
        populate(&conn, &rows)?;
        info!(rows = rows.len(), "feature table reloaded");
        Ok(())
    }

    /// Run arbitrary SQL and shape the result as named columns + row-major
    /// values. This is the `/scanner/scan` surface.
    pub fn query(&self, sql: &str) -> Result<(Vec<String>, Vec<Vec<Json>>)> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| anyhow!("query failed: {e}"))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let column_count = columns.len();
        let mut rows = Vec::new();
        let mut result = stmt.query([]).map_err(|e| anyhow!("query failed: {e}"))?;
        while let Some(row) = result.next().map_err(|e| anyhow!("row fetch failed: {e}"))? {
            let mut out = Vec::with_capacity(column_count);
            for i in 0..column_count {
                out.push(json_from_sql(row.get_ref(i)?));
            }
            rows.push(out);
        }
        Ok((columns, rows))
    }

    /// Builder-backed projection used by the screener sessions.
    #[allow(clippy::too_many_arguments)]
    pub fn query_symbols(
        &self,
        columns: &[String],
        filters: &[FilterExpr],
        merge: JoinOp,
        sort: &[SortField],
        universe: Option<&[String]>,
        offset: Option<i64>,
        limit: Option<i64>,
    ) -> Result<(Vec<String>, Vec<Vec<Json>>)> {
        let sql = sql::build_select(
            TABLE_NAME, columns, filters, merge, sort, universe, offset, limit,
        )
        .map_err(|e| anyhow!(e))?;
        self.query(&sql)
    }

    /// Row count of the filter's projection, for `total` in full responses.
    pub fn count_symbols(
        &self,
        filters: &[FilterExpr],
        merge: JoinOp,
        universe: Option<&[String]>,
    ) -> Result<usize> {
        let mut sql = format!("SELECT COUNT(ticker) FROM {TABLE_NAME}");
        if let Some(where_clause) =
            sql::build_where(filters, merge, universe).map_err(|e| anyhow!(e))?
        {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
        }
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| anyhow!("count failed: {e}"))?;
        Ok(count as usize)
    }

    /// Every ticker in the table.
    pub fn tickers(&self) -> Result<Vec<String>> {
        let (_, rows) = self.query(&format!(
            "SELECT ticker FROM {TABLE_NAME} WHERE ticker IS NOT NULL ORDER BY ticker"
        ))?;
        Ok(rows
            .into_iter()
            .filter_map(|mut r| r.pop().and_then(|v| v.as_str().map(String::from)))
            .collect())
    }

    /// All rows as ticker-keyed property maps — the metadata projection the
    /// scanner consumes.
    pub fn rows_by_ticker(&self) -> Result<HashMap<String, HashMap<String, Json>>> {
        let (columns, rows) = self.query(&format!("SELECT * FROM {TABLE_NAME}"))?;
        let ticker_idx = columns
            .iter()
            .position(|c| c == "ticker")
            .context("feature table has no ticker column")?;

        let mut out = HashMap::new();
        for row in rows {
            let Some(ticker) = row[ticker_idx].as_str().map(String::from) else {
                continue;
            };
            let map: HashMap<String, Json> = columns
                .iter()
                .cloned()
                .zip(row.into_iter())
                .collect();
            out.insert(ticker, map);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

fn read_rows(path: &PathBuf) -> Result<Vec<serde_json::Map<String, Json>>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "feature snapshot missing — starting empty");
            return Ok(Vec::new());
        }
    };
    serde_json::from_str(&raw)
        .with_context(|| format!("corrupt feature snapshot at {}", path.display()))
}

/// Create and fill the `symbols` table. Column order and type affinity come
/// from the first row; later rows may omit columns (NULL) but never add new
/// ones.
fn populate(conn: &Connection, rows: &[serde_json::Map<String, Json>]) -> Result<()> {
    let columns: Vec<String> = match rows.first() {
        Some(first) => first.keys().cloned().collect(),
        None => vec!["ticker".to_string()],
    };

    let decls: Vec<String> = columns
        .iter()
        .map(|name| {
            let affinity = rows
                .first()
                .and_then(|r| r.get(name))
                .map(affinity_of)
                .unwrap_or("TEXT");
            format!("{} {affinity}", sql::quote_ident(name))
        })
        .collect();

    conn.execute_batch(&format!(
        "CREATE TABLE {TABLE_NAME} ({});",
        decls.join(", ")
    ))
    .context("failed to create feature table")?;

    if rows.is_empty() {
        return Ok(());
    }

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let insert = format!(
        "INSERT INTO {TABLE_NAME} ({}) VALUES ({})",
        columns
            .iter()
            .map(|c| sql::quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&insert).context("bad insert statement")?;
    for row in rows {
        let values: Vec<rusqlite::types::Value> = columns
            .iter()
            .map(|c| sql_from_json(row.get(c).unwrap_or(&Json::Null)))
            .collect();
        stmt.execute(rusqlite::params_from_iter(values))
            .context("row insert failed")?;
    }
    Ok(())
}

fn affinity_of(value: &Json) -> &'static str {
    match value {
        Json::Number(n) if n.is_i64() || n.is_u64() => "INTEGER",
        Json::Number(_) => "REAL",
        Json::Bool(_) => "INTEGER",
        _ => "TEXT",
    }
}

fn sql_from_json(value: &Json) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match value {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Integer(*b as i64),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

fn json_from_sql(value: ValueRef<'_>) -> Json {
    match value {
        ValueRef::Null => Json::Null,
        ValueRef::Integer(i) => Json::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        ValueRef::Text(t) => Json::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Json::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_rows() -> Vec<serde_json::Map<String, Json>> {
        let rows = serde_json::json!([
            {"ticker": "NSE:A", "name": "Alpha Ltd", "mcap": 50.0, "sector": "Energy", "day_close": 101.5, "isin": "INE0A", "type": "stock", "exchange": "NSE"},
            {"ticker": "NSE:B", "name": "Beta Ltd", "mcap": 30.0, "sector": "Tech", "day_close": 55.0, "isin": "INE0B", "type": "stock", "exchange": "NSE"},
            {"ticker": "NSE:C", "name": "Gamma Ltd", "mcap": 10.0, "sector": "Energy", "day_close": 12.0, "isin": "INE0C", "type": "stock", "exchange": "NSE"},
            {"ticker": "NSE:D", "name": "Delta Ltd", "mcap": null, "sector": "Tech", "day_close": 9.0, "isin": "INE0D", "type": "stock", "exchange": "NSE"}
        ]);
        match rows {
            Json::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    Json::Object(m) => m,
                    _ => unreachable!(),
                })
                .collect(),
            _ => unreachable!(),
        }
    }

    fn table() -> FeatureTable {
        FeatureTable::from_rows(sample_rows()).unwrap()
    }

    fn leaf(col: &str, kind: &str, filter: Json) -> FilterExpr {
        FilterExpr::Leaf {
            col_id: col.into(),
            kind: kind.into(),
            filter: Some(filter),
        }
    }

    #[test]
    fn verbatim_sql_round_trips() {
        let t = table();
        let (cols, rows) = t
            .query("SELECT ticker, mcap FROM symbols WHERE mcap > 20 ORDER BY mcap DESC")
            .unwrap();
        assert_eq!(cols, vec!["ticker", "mcap"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Json::from("NSE:A"));
        assert_eq!(rows[1][0], Json::from("NSE:B"));
    }

    #[test]
    fn bad_sql_is_an_error_not_a_panic() {
        let t = table();
        assert!(t.query("SELECT FROM nothing").is_err());
    }

    #[test]
    fn builder_query_with_filter_sort_and_page() {
        let t = table();
        let sort = vec![
            SortField {
                col_id: "mcap".into(),
                direction: crate::screener::sql::SortDir::Desc,
            },
            SortField {
                col_id: "name".into(),
                direction: crate::screener::sql::SortDir::Asc,
            },
        ];
        let (cols, rows) = t
            .query_symbols(
                &["ticker".to_string(), "mcap".to_string()],
                &[leaf("sector", "equals", Json::from("Energy"))],
                JoinOp::And,
                &sort,
                None,
                Some(0),
                Some(10),
            )
            .unwrap();
        assert_eq!(cols, vec!["ticker", "mcap"]);
        let tickers: Vec<&str> = rows.iter().map(|r| r[0].as_str().unwrap()).collect();
        assert_eq!(tickers, vec!["NSE:A", "NSE:C"]);
    }

    #[test]
    fn nulls_sort_last_in_both_directions() {
        let t = table();
        let desc = vec![SortField {
            col_id: "mcap".into(),
            direction: crate::screener::sql::SortDir::Desc,
        }];
        let (_, rows) = t
            .query_symbols(
                &["ticker".to_string()],
                &[],
                JoinOp::And,
                &desc,
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(rows.last().unwrap()[0], Json::from("NSE:D"));

        let asc = vec![SortField {
            col_id: "mcap".into(),
            direction: crate::screener::sql::SortDir::Asc,
        }];
        let (_, rows) = t
            .query_symbols(
                &["ticker".to_string()],
                &[],
                JoinOp::And,
                &asc,
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(rows.last().unwrap()[0], Json::from("NSE:D"));
    }

    #[test]
    fn universe_restricts_and_empty_universe_matches_nothing() {
        let t = table();
        let universe = vec!["NSE:B".to_string()];
        let count = t.count_symbols(&[], JoinOp::And, Some(&universe)).unwrap();
        assert_eq!(count, 1);

        let count = t.count_symbols(&[], JoinOp::And, Some(&[])).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn count_matches_filter_projection() {
        let t = table();
        let count = t
            .count_symbols(
                &[leaf("mcap", "greaterThan", Json::from(20))],
                JoinOp::And,
                None,
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn tickers_and_rows_by_ticker_project_the_table() {
        let t = table();
        assert_eq!(t.tickers().unwrap().len(), 4);

        let rows = t.rows_by_ticker().unwrap();
        assert_eq!(rows["NSE:A"]["sector"], Json::from("Energy"));
        assert!(rows["NSE:D"]["mcap"].is_null());
    }
}

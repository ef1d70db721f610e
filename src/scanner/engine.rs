// =============================================================================
// Scanner Engine — two-phase technical scan over candles + metadata
// =============================================================================
//
// Phase 1 filters the universe on static (metadata) conditions. Phase 2
// walks the survivors' OHLCV tables: boolean conditions reduce a per-bar
// series by their evaluation period, rank conditions percentile-rank the
// expression's last value across the phase-1 set. Pre-conditions, when
// present, run as a full scan first and restrict the universe the main scan
// sees.
//
// Failures stay local: a symbol whose expression blows up contributes null
// (values) or false (conditions) and the scan carries on.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::scanner::cache::{CacheStats, CachedResult, ExpressionCache};
use crate::scanner::candles::{CandleProvider, OhlcvTable};
use crate::scanner::expr::{self, Env};
use crate::scanner::metadata::{MetadataProvider, MetadataRow};
use crate::scanner::models::{
    ColumnDef, ColumnType, Condition, ConditionType, EvaluationPeriod, EvaluationType, Logic,
    Market, ScanRequest, ScanResponse, SortColumn, SortDirection,
};

// ---------------------------------------------------------------------------
// Expression evaluator with result caching
// ---------------------------------------------------------------------------

pub struct ExpressionEvaluator {
    cache: ExpressionCache,
}

impl ExpressionEvaluator {
    pub fn new(cache_enabled: bool) -> Self {
        Self {
            cache: ExpressionCache::new(cache_enabled),
        }
    }

    fn env_for(table: &OhlcvTable, metadata: &MetadataRow) -> Env {
        Env::new()
            .with_ohlcv(&table.open, &table.high, &table.low, &table.close, &table.volume)
            .with_metadata(metadata)
    }

    /// Evaluate an expression and keep its last scalar. Errors become null.
    pub fn evaluate_value_expression(
        &self,
        symbol: &str,
        table: &OhlcvTable,
        metadata: &MetadataRow,
        expression: &str,
    ) -> Json {
        let key = format!("{symbol}_val_{}", expr::expression_hash(expression));
        if let Some(CachedResult::Value(v)) = self.cache.get(&key) {
            return v;
        }

        let env = Self::env_for(table, metadata);
        let value = match expr::evaluate_str(expression, &env) {
            Ok(v) => v.last_scalar(),
            Err(e) => {
                debug!(symbol = %symbol, expression = %expression, error = %e, "value expression failed");
                Json::Null
            }
        };

        self.cache.set(key, CachedResult::Value(value.clone()));
        value
    }

    /// Evaluate a condition expression to a boolean series. Errors become an
    /// all-false series.
    pub fn evaluate_condition_expression(
        &self,
        symbol: &str,
        table: &OhlcvTable,
        metadata: &MetadataRow,
        expression: &str,
    ) -> Vec<bool> {
        let key = format!("{symbol}_cond_{}", expr::expression_hash(expression));
        if let Some(CachedResult::BoolSeries(b)) = self.cache.get(&key) {
            return b;
        }

        let env = Self::env_for(table, metadata);
        let series = expr::evaluate_str(expression, &env)
            .and_then(|v| v.into_bool_series(table.len()))
            .unwrap_or_else(|e| {
                debug!(symbol = %symbol, expression = %expression, error = %e, "condition expression failed");
                vec![false; table.len()]
            });

        self.cache.set(key, CachedResult::BoolSeries(series.clone()));
        series
    }

    /// Evaluate static conditions over the metadata table; returns the
    /// symbols that pass the combined filter. A parse failure rejects the
    /// whole expression set.
    pub fn evaluate_static_conditions(
        &self,
        symbols: &[String],
        metadata: &HashMap<String, MetadataRow>,
        expressions: &[String],
        logic: Logic,
    ) -> Vec<String> {
        if expressions.is_empty() {
            return symbols.to_vec();
        }

        let key = format!(
            "static_vectorized_{}_{}_{logic:?}",
            expr::expression_hash(&symbols.join(",")),
            expr::expression_hash(&expressions.join(";")),
        );
        if let Some(CachedResult::Symbols(s)) = self.cache.get(&key) {
            return s;
        }

        let parsed: Result<Vec<expr::Expr>> =
            expressions.iter().map(|e| expr::parse(e)).collect();
        let parsed = match parsed {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "static condition failed to parse — rejecting all symbols");
                self.cache.set(key, CachedResult::Symbols(Vec::new()));
                return Vec::new();
            }
        };

        let selected: Vec<String> = symbols
            .iter()
            .filter(|symbol| {
                let Some(row) = metadata.get(*symbol) else {
                    return false;
                };
                let env = Env::new().with_metadata(row);
                let results = parsed.iter().map(|ast| {
                    expr::evaluate(ast, &env)
                        .and_then(|v| v.into_bool_series(1))
                        .map(|b| b.iter().all(|x| *x) && !b.is_empty())
                        .unwrap_or(false)
                });
                combine(results, logic)
            })
            .cloned()
            .collect();

        self.cache.set(key, CachedResult::Symbols(selected.clone()));
        selected
    }

    /// Evaluate a condition column: nested conditions reduced to one bool.
    pub fn evaluate_condition_column(
        &self,
        symbol: &str,
        table: &OhlcvTable,
        metadata: &MetadataRow,
        conditions: &[Condition],
        logic: Logic,
    ) -> bool {
        let fingerprint: String = conditions
            .iter()
            .map(|c| {
                format!(
                    "{}|{:?}|{:?}|{:?};",
                    c.expression, c.condition_type, c.evaluation_period, c.value
                )
            })
            .collect();
        let key = format!(
            "{symbol}_condcol_{}_{logic:?}",
            expr::expression_hash(&fingerprint)
        );
        if let Some(CachedResult::Bool(b)) = self.cache.get(&key) {
            return b;
        }

        let results = conditions.iter().map(|condition| {
            if condition.condition_type == ConditionType::Static {
                let env = Env::new().with_metadata(metadata);
                expr::evaluate_str(&condition.expression, &env)
                    .and_then(|v| v.into_bool_series(1))
                    .map(|b| !b.is_empty() && b.iter().all(|x| *x))
                    .unwrap_or(false)
            } else {
                let series =
                    self.evaluate_condition_expression(symbol, table, metadata, &condition.expression);
                reduce_condition_by_period(&series, condition.evaluation_period, condition.value)
            }
        });
        let result = combine(results, logic);

        self.cache.set(key, CachedResult::Bool(result));
        result
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.cache.is_enabled()
    }
}

/// Collapse a per-bar boolean series to one verdict.
///
/// * `now` — last bar.
/// * `x_bar_ago(n)` — the bar `n` from the end, false when too short.
/// * `within_last(n)` — any of the last `n`.
/// * `in_row(n)` — all of the last `n`, false when the series is shorter.
pub fn reduce_condition_by_period(
    series: &[bool],
    period: EvaluationPeriod,
    value: Option<i64>,
) -> bool {
    if series.is_empty() {
        return false;
    }
    match period {
        EvaluationPeriod::Now => *series.last().unwrap_or(&false),
        EvaluationPeriod::XBarAgo => {
            let Some(n) = positive(value) else { return false };
            if series.len() >= n {
                series[series.len() - n]
            } else {
                false
            }
        }
        EvaluationPeriod::WithinLast => {
            let Some(n) = positive(value) else { return false };
            let start = series.len().saturating_sub(n);
            series[start..].iter().any(|b| *b)
        }
        EvaluationPeriod::InRow => {
            let Some(n) = positive(value) else { return false };
            if series.len() < n {
                return false;
            }
            series[series.len() - n..].iter().all(|b| *b)
        }
    }
}

fn positive(value: Option<i64>) -> Option<usize> {
    value.filter(|v| *v > 0).map(|v| v as usize)
}

fn combine(results: impl IntoIterator<Item = bool>, logic: Logic) -> bool {
    // An empty condition set passes under `and` and fails under `or`,
    // matching all()/any() over an empty list.
    match logic {
        Logic::And => results.into_iter().all(|r| r),
        Logic::Or => results.into_iter().any(|r| r),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Candle + metadata sources for one market, with the loaded symbol tables.
pub struct MarketState {
    candle_provider: Arc<dyn CandleProvider>,
    metadata_provider: Arc<dyn MetadataProvider>,
    symbol_data: RwLock<HashMap<String, OhlcvTable>>,
}

impl MarketState {
    pub fn new(
        candle_provider: Arc<dyn CandleProvider>,
        metadata_provider: Arc<dyn MetadataProvider>,
    ) -> Result<Self> {
        let symbol_data = candle_provider.load_data()?;
        Ok(Self {
            candle_provider,
            metadata_provider,
            symbol_data: RwLock::new(symbol_data),
        })
    }
}

pub struct ScannerEngine {
    markets: HashMap<Market, MarketState>,
    evaluator: ExpressionEvaluator,
}

impl ScannerEngine {
    pub fn new(markets: HashMap<Market, MarketState>, cache_enabled: bool) -> Self {
        let loaded: usize = markets
            .values()
            .map(|m| m.symbol_data.read().len())
            .sum();
        info!(markets = markets.len(), symbols = loaded, "scanner engine initialized");
        Self {
            markets,
            evaluator: ExpressionEvaluator::new(cache_enabled),
        }
    }

    fn market(&self, market: Market) -> Result<&MarketState> {
        self.markets
            .get(&market)
            .ok_or_else(|| anyhow!("market {market} is not configured"))
    }

    /// Execute a scan. The request must already be validated.
    pub fn scan(&self, request: &ScanRequest) -> Result<ScanResponse> {
        request.validate().map_err(|e| anyhow!(e))?;
        let state = self.market(request.market)?;

        let universe: Vec<String> = {
            let mut symbols: Vec<String> = state.symbol_data.read().keys().cloned().collect();
            symbols.sort();
            symbols
        };
        if universe.is_empty() {
            return Ok(empty_response(&request.columns));
        }

        // Pre-conditions restrict the universe the main scan sees.
        let universe = if request.pre_conditions.is_empty() {
            universe
        } else {
            self.run_phases(
                state,
                &universe,
                &request.pre_conditions,
                request.pre_condition_logic,
            )
        };
        if universe.is_empty() {
            return Ok(empty_response(&request.columns));
        }

        let selected = self.run_phases(state, &universe, &request.conditions, request.logic);
        if selected.is_empty() {
            return Ok(empty_response(&request.columns));
        }

        let rows = self.evaluate_columns(state, &selected, &request.columns);
        if rows.is_empty() {
            return Ok(empty_response(&request.columns));
        }

        Ok(shape_results(
            rows,
            &request.columns,
            request.sort_columns.as_deref(),
        ))
    }

    /// Static phase then computed phase, with the given combine logic.
    fn run_phases(
        &self,
        state: &MarketState,
        universe: &[String],
        conditions: &[Condition],
        logic: Logic,
    ) -> Vec<String> {
        let static_conditions: Vec<&Condition> = conditions
            .iter()
            .filter(|c| c.condition_type == ConditionType::Static)
            .collect();
        let computed_conditions: Vec<&Condition> = conditions
            .iter()
            .filter(|c| c.condition_type == ConditionType::Computed)
            .collect();

        let phase1 = if static_conditions.is_empty() {
            universe.to_vec()
        } else {
            let expressions: Vec<String> = static_conditions
                .iter()
                .map(|c| c.expression.clone())
                .collect();
            let metadata = state.metadata_provider.metadata_table(universe);
            self.evaluator
                .evaluate_static_conditions(universe, &metadata, &expressions, logic)
        };
        debug!(phase1 = phase1.len(), "static phase complete");

        if phase1.is_empty() || computed_conditions.is_empty() {
            return phase1;
        }

        self.evaluate_computed_phase(state, &phase1, &computed_conditions, logic)
    }

    /// Phase 2: boolean conditions reduce per symbol; rank conditions need
    /// the whole phase-1 set to percentile the expression's last value.
    fn evaluate_computed_phase(
        &self,
        state: &MarketState,
        symbols: &[String],
        conditions: &[&Condition],
        logic: Logic,
    ) -> Vec<String> {
        let boolean_conditions: Vec<&&Condition> = conditions
            .iter()
            .filter(|c| c.evaluation_type == EvaluationType::Boolean)
            .collect();
        let rank_conditions: Vec<&&Condition> = conditions
            .iter()
            .filter(|c| c.evaluation_type == EvaluationType::Rank)
            .collect();

        // Rank passes are computed across the whole candidate set first.
        let rank_passes: Vec<HashMap<String, bool>> = rank_conditions
            .iter()
            .map(|c| self.rank_condition_passes(state, symbols, c))
            .collect();

        let tables = state.symbol_data.read();
        symbols
            .iter()
            .filter(|symbol| {
                let Some(table) = tables.get(*symbol) else {
                    return false;
                };
                let metadata = state.metadata_provider.get_all_metadata(symbol);

                let boolean_results = boolean_conditions.iter().map(|condition| {
                    let series = self.evaluator.evaluate_condition_expression(
                        symbol,
                        table,
                        &metadata,
                        &condition.expression,
                    );
                    reduce_condition_by_period(
                        &series,
                        condition.evaluation_period,
                        condition.value,
                    )
                });
                let rank_results = rank_passes
                    .iter()
                    .map(|passes| passes.get(*symbol).copied().unwrap_or(false));

                combine(boolean_results.chain(rank_results), logic)
            })
            .cloned()
            .collect()
    }

    /// Percentile-rank the expression's last value over `symbols`; a symbol
    /// passes iff its rank lies inside `[rank_min, rank_max]`. Symbols with
    /// a null value never pass.
    fn rank_condition_passes(
        &self,
        state: &MarketState,
        symbols: &[String],
        condition: &Condition,
    ) -> HashMap<String, bool> {
        let tables = state.symbol_data.read();
        let mut values: Vec<(String, f64)> = Vec::new();
        for symbol in symbols {
            let Some(table) = tables.get(symbol) else { continue };
            let metadata = state.metadata_provider.get_all_metadata(symbol);
            let value = self.evaluator.evaluate_value_expression(
                symbol,
                table,
                &metadata,
                &condition.expression,
            );
            if let Some(v) = value.as_f64() {
                values.push((symbol.clone(), v));
            }
        }

        let ranks = percentile_ranks(&values);
        let min = condition.rank_min.unwrap_or(0.0);
        let max = condition.rank_max.unwrap_or(100.0);

        symbols
            .iter()
            .map(|s| {
                let pass = ranks
                    .get(s)
                    .map(|r| *r >= min && *r <= max)
                    .unwrap_or(false);
                (s.clone(), pass)
            })
            .collect()
    }

    /// Column values for every surviving symbol, keyed by column name.
    fn evaluate_columns(
        &self,
        state: &MarketState,
        symbols: &[String],
        columns: &[ColumnDef],
    ) -> Vec<(String, HashMap<String, Json>)> {
        let static_columns: Vec<&ColumnDef> = columns
            .iter()
            .filter(|c| c.column_type == ColumnType::Static)
            .collect();
        let other_columns: Vec<&ColumnDef> = columns
            .iter()
            .filter(|c| c.column_type != ColumnType::Static)
            .collect();

        let metadata_table = state.metadata_provider.metadata_table(symbols);
        let tables = state.symbol_data.read();

        symbols
            .iter()
            .map(|symbol| {
                let mut row: HashMap<String, Json> = HashMap::new();
                let metadata = metadata_table.get(symbol);

                // Static columns: vectorized lookup in the metadata table.
                for column in &static_columns {
                    let value = metadata
                        .and_then(|m| {
                            column
                                .property_name
                                .as_deref()
                                .and_then(|p| m.get(p).cloned())
                        })
                        .unwrap_or(Json::Null);
                    row.insert(column.name.clone(), value);
                }

                if let Some(table) = tables.get(symbol) {
                    let all_metadata = state.metadata_provider.get_all_metadata(symbol);
                    for column in &other_columns {
                        let value = match column.column_type {
                            ColumnType::Computed => column
                                .expression
                                .as_deref()
                                .map(|e| {
                                    self.evaluator
                                        .evaluate_value_expression(symbol, table, &all_metadata, e)
                                })
                                .unwrap_or(Json::Null),
                            ColumnType::Condition => column
                                .conditions
                                .as_deref()
                                .map(|conds| {
                                    Json::Bool(self.evaluator.evaluate_condition_column(
                                        symbol,
                                        table,
                                        &all_metadata,
                                        conds,
                                        column.logic.unwrap_or(Logic::And),
                                    ))
                                })
                                .unwrap_or(Json::Null),
                            ColumnType::Static => unreachable!("filtered above"),
                        };
                        row.insert(column.name.clone(), value);
                    }
                } else {
                    for column in &other_columns {
                        row.insert(column.name.clone(), Json::Null);
                    }
                }

                (symbol.clone(), row)
            })
            .collect()
    }

    /// Reload candles and metadata for one market and drop the cache.
    pub async fn refresh(&self, market: Market) -> Result<()> {
        let state = self.market(market)?;
        info!(market = %market, "refreshing scanner data");

        let fresh = state
            .candle_provider
            .refresh_data()
            .await
            .context("candle refresh failed")?;
        *state.symbol_data.write() = fresh;

        state
            .metadata_provider
            .refresh()
            .context("metadata refresh failed")?;
        self.evaluator.clear_cache();

        info!(
            market = %market,
            symbols = state.symbol_data.read().len(),
            "scanner data refreshed"
        );
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.evaluator.cache_stats()
    }

    pub fn loaded_symbol_count(&self) -> usize {
        self.markets.values().map(|m| m.symbol_data.read().len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Result shaping
// ---------------------------------------------------------------------------

fn empty_response(columns: &[ColumnDef]) -> ScanResponse {
    let mut names = vec!["symbol".to_string()];
    names.extend(columns.iter().map(|c| c.name.clone()));
    ScanResponse {
        count: 0,
        columns: names,
        data: Vec::new(),
        success: false,
    }
}

fn shape_results(
    mut rows: Vec<(String, HashMap<String, Json>)>,
    columns: &[ColumnDef],
    sort_columns: Option<&[SortColumn]>,
) -> ScanResponse {
    // Drop rows where every non-static column came out null.
    let non_static: Vec<&str> = columns
        .iter()
        .filter(|c| c.column_type != ColumnType::Static)
        .map(|c| c.name.as_str())
        .collect();
    if !non_static.is_empty() {
        rows.retain(|(_, row)| {
            non_static
                .iter()
                .any(|name| row.get(*name).map_or(false, |v| !v.is_null()))
        });
    }

    // Sort keys reference column ids; map them to output names and drop
    // anything unknown.
    if let Some(sort_columns) = sort_columns {
        let mut id_to_name: HashMap<&str, &str> = columns
            .iter()
            .map(|c| (c.id.as_str(), c.name.as_str()))
            .collect();
        id_to_name.insert("symbol", "symbol");

        let keys: Vec<(String, SortDirection)> = sort_columns
            .iter()
            .filter_map(|sc| {
                id_to_name
                    .get(sc.column.as_str())
                    .map(|name| (name.to_string(), sc.direction))
            })
            .collect();

        if !keys.is_empty() {
            // Rows with a null in any sort key are dropped, which doubles as
            // the nulls-last guarantee.
            rows.retain(|(symbol, row)| {
                keys.iter().all(|(name, _)| {
                    if name == "symbol" {
                        return !symbol.is_empty();
                    }
                    row.get(name).map_or(false, |v| !v.is_null())
                })
            });

            rows.sort_by(|(sym_a, a), (sym_b, b)| {
                for (name, direction) in &keys {
                    let (va, vb) = if name == "symbol" {
                        (Json::String(sym_a.clone()), Json::String(sym_b.clone()))
                    } else {
                        (
                            a.get(name).cloned().unwrap_or(Json::Null),
                            b.get(name).cloned().unwrap_or(Json::Null),
                        )
                    };
                    let ord = compare_json(&va, &vb);
                    let ord = match direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
    }

    // Column order: symbol first, then the requested order.
    let mut names = vec!["symbol".to_string()];
    names.extend(columns.iter().map(|c| c.name.clone()));

    let data: Vec<Vec<Json>> = rows
        .into_iter()
        .map(|(symbol, mut row)| {
            let mut out = Vec::with_capacity(names.len());
            out.push(Json::String(symbol));
            for name in names.iter().skip(1) {
                out.push(row.remove(name).unwrap_or(Json::Null));
            }
            out
        })
        .collect();

    ScanResponse {
        count: data.len(),
        columns: names,
        data,
        success: true,
    }
}

fn compare_json(a: &Json, b: &Json) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Json::String(x), Json::String(y)) => x.cmp(y),
        (Json::Bool(x), Json::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Average-rank percentiles in [0, 100] over the supplied values.
fn percentile_ranks(values: &[(String, f64)]) -> HashMap<String, f64> {
    let n = values.len();
    if n == 0 {
        return HashMap::new();
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .1
            .partial_cmp(&values[b].1)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ranks = HashMap::new();
    let mut i = 0;
    while i < n {
        // Ties share the average of their 1-based positions.
        let mut j = i;
        while j + 1 < n && values[order[j + 1]].1 == values[order[i]].1 {
            j += 1;
        }
        let avg_rank = (i + 1 + j + 1) as f64 / 2.0;
        for k in i..=j {
            let (symbol, _) = &values[order[k]];
            ranks.insert(symbol.clone(), avg_rank / n as f64 * 100.0);
        }
        i = j + 1;
    }
    ranks
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

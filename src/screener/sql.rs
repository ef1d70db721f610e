// =============================================================================
// Screener SQL Builder — restricted filter grammar → WHERE/ORDER BY
// =============================================================================
//
// Client filters arrive as a small JSON grammar: leaf operators over one
// column, plus `join` nodes combining children with AND/OR. They compile to
// a WHERE clause against the in-memory feature table. String literals escape
// single quotes by doubling; identifiers are double-quoted.
//
// The universe (watchlist) becomes `ticker IN (...)`; an explicitly empty
// universe short-circuits to `1=2`. Sorting emits NULLS LAST so null rows
// sink regardless of direction.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// How a session merges its top-level filters (and how `join` nodes merge
/// their children).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinOp {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

impl JoinOp {
    fn keyword(self) -> &'static str {
        match self {
            JoinOp::And => "AND",
            JoinOp::Or => "OR",
        }
    }
}

/// One filter tree node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterExpr {
    Join {
        operator: JoinOp,
        conditions: Vec<FilterExpr>,
    },
    Leaf {
        #[serde(rename = "colId")]
        col_id: String,
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        filter: Option<Json>,
    },
}

/// Sort entry: `{colId, sort}` on the wire, `direction` accepted as an alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortField {
    #[serde(rename = "colId")]
    pub col_id: String,
    #[serde(rename = "sort", alias = "direction")]
    pub direction: SortDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDir {
    #[serde(rename = "ASC", alias = "asc")]
    Asc,
    #[serde(rename = "DESC", alias = "desc")]
    Desc,
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a JSON scalar as a SQL literal. Strings double their single
/// quotes; booleans become TRUE/FALSE; null becomes NULL.
pub fn literal(value: &Json) -> String {
    match value {
        Json::Null => "NULL".to_string(),
        Json::Bool(true) => "TRUE".to_string(),
        Json::Bool(false) => "FALSE".to_string(),
        Json::Number(n) => n.to_string(),
        Json::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn string_of(value: &Option<Json>) -> String {
    match value {
        Some(Json::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

impl FilterExpr {
    /// Compile this node to a SQL predicate. Unknown leaf operators are an
    /// error surfaced to the client, not silently dropped.
    pub fn to_sql(&self) -> Result<String, String> {
        match self {
            FilterExpr::Join {
                operator,
                conditions,
            } => {
                if conditions.is_empty() {
                    return Ok("1=1".to_string());
                }
                let parts: Result<Vec<String>, String> =
                    conditions.iter().map(|c| c.to_sql()).collect();
                Ok(format!(
                    "({})",
                    parts?.join(&format!(" {} ", operator.keyword()))
                ))
            }
            FilterExpr::Leaf {
                col_id,
                kind,
                filter,
            } => {
                let col = quote_ident(col_id);
                let sql = match kind.as_str() {
                    "contains" => format!(
                        "{col} LIKE '%{}%'",
                        string_of(filter).replace('\'', "''")
                    ),
                    "notContains" => format!(
                        "{col} NOT LIKE '%{}%'",
                        string_of(filter).replace('\'', "''")
                    ),
                    "equals" => format!("{col} = {}", literal(filter.as_ref().unwrap_or(&Json::Null))),
                    "notEqual" => {
                        format!("{col} <> {}", literal(filter.as_ref().unwrap_or(&Json::Null)))
                    }
                    "startsWith" => format!(
                        "{col} LIKE '{}%'",
                        string_of(filter).replace('\'', "''")
                    ),
                    "endsWith" => format!(
                        "{col} LIKE '%{}'",
                        string_of(filter).replace('\'', "''")
                    ),
                    "blank" => format!("({col} IS NULL OR {col} = '')"),
                    "notBlank" => format!("({col} IS NOT NULL AND {col} <> '')"),
                    "greaterThan" => {
                        format!("{col} > {}", literal(filter.as_ref().unwrap_or(&Json::Null)))
                    }
                    "greaterThanOrEqual" => {
                        format!("{col} >= {}", literal(filter.as_ref().unwrap_or(&Json::Null)))
                    }
                    "lessThan" => {
                        format!("{col} < {}", literal(filter.as_ref().unwrap_or(&Json::Null)))
                    }
                    "lessThanOrEqual" => {
                        format!("{col} <= {}", literal(filter.as_ref().unwrap_or(&Json::Null)))
                    }
                    "true" => format!("{col} = TRUE"),
                    "false" => format!("{col} = FALSE"),
                    other => return Err(format!("unsupported filter type '{other}'")),
                };
                Ok(sql)
            }
        }
    }
}

/// Combine the session filters and the universe into one WHERE clause.
/// Returns `None` when there is nothing to filter on.
pub fn build_where(
    filters: &[FilterExpr],
    merge: JoinOp,
    universe: Option<&[String]>,
) -> Result<Option<String>, String> {
    let mut clauses: Vec<String> = Vec::new();

    if !filters.is_empty() {
        let parts: Result<Vec<String>, String> = filters.iter().map(|f| f.to_sql()).collect();
        clauses.push(format!(
            "({})",
            parts?.join(&format!(" {} ", merge.keyword()))
        ));
    }

    match universe {
        // A present-but-empty watchlist matches nothing.
        Some([]) => clauses.push("1=2".to_string()),
        Some(tickers) => {
            let quoted: Vec<String> = tickers
                .iter()
                .map(|t| format!("'{}'", t.replace('\'', "''")))
                .collect();
            clauses.push(format!("ticker IN ({})", quoted.join(", ")));
        }
        None => {}
    }

    if clauses.is_empty() {
        Ok(None)
    } else {
        Ok(Some(clauses.join(" AND ")))
    }
}

/// Build the ORDER BY tail from sort fields, NULLS LAST on every key.
pub fn build_order_by(sort: &[SortField]) -> Option<String> {
    if sort.is_empty() {
        return None;
    }
    let parts: Vec<String> = sort
        .iter()
        .map(|s| {
            let dir = match s.direction {
                SortDir::Asc => "ASC",
                SortDir::Desc => "DESC",
            };
            format!("{} {dir} NULLS LAST", quote_ident(&s.col_id))
        })
        .collect();
    Some(parts.join(", "))
}

/// Full SELECT over the feature table.
pub fn build_select(
    table: &str,
    columns: &[String],
    filters: &[FilterExpr],
    merge: JoinOp,
    sort: &[SortField],
    universe: Option<&[String]>,
    offset: Option<i64>,
    limit: Option<i64>,
) -> Result<String, String> {
    let cols = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut sql = format!("SELECT {cols} FROM {table}");
    if let Some(where_clause) = build_where(filters, merge, universe)? {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause);
    }
    if let Some(order) = build_order_by(sort) {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order);
    }
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(col: &str, kind: &str, filter: Json) -> FilterExpr {
        FilterExpr::Leaf {
            col_id: col.into(),
            kind: kind.into(),
            filter: Some(filter),
        }
    }

    #[test]
    fn text_operators_render_like_patterns() {
        assert_eq!(
            leaf("name", "contains", Json::from("oil")).to_sql().unwrap(),
            "\"name\" LIKE '%oil%'"
        );
        assert_eq!(
            leaf("name", "startsWith", Json::from("Rel")).to_sql().unwrap(),
            "\"name\" LIKE 'Rel%'"
        );
        assert_eq!(
            leaf("name", "endsWith", Json::from("Ltd")).to_sql().unwrap(),
            "\"name\" LIKE '%Ltd'"
        );
        assert_eq!(
            leaf("name", "notContains", Json::from("bank"))
                .to_sql()
                .unwrap(),
            "\"name\" NOT LIKE '%bank%'"
        );
    }

    #[test]
    fn quotes_in_strings_are_doubled() {
        assert_eq!(
            leaf("name", "equals", Json::from("O'Brien")).to_sql().unwrap(),
            "\"name\" = 'O''Brien'"
        );
        assert_eq!(
            leaf("name", "contains", Json::from("D'Mart")).to_sql().unwrap(),
            "\"name\" LIKE '%D''Mart%'"
        );
    }

    #[test]
    fn numeric_and_boolean_operators() {
        assert_eq!(
            leaf("mcap", "greaterThan", Json::from(1e10)).to_sql().unwrap(),
            "\"mcap\" > 10000000000.0"
        );
        assert_eq!(
            leaf("mcap", "lessThanOrEqual", Json::from(5)).to_sql().unwrap(),
            "\"mcap\" <= 5"
        );
        assert_eq!(
            leaf("is_fno", "true", Json::Null).to_sql().unwrap(),
            "\"is_fno\" = TRUE"
        );
        assert_eq!(
            leaf("is_fno", "false", Json::Null).to_sql().unwrap(),
            "\"is_fno\" = FALSE"
        );
    }

    #[test]
    fn blank_operators_cover_null_and_empty() {
        assert_eq!(
            leaf("isin", "blank", Json::Null).to_sql().unwrap(),
            "(\"isin\" IS NULL OR \"isin\" = '')"
        );
        assert_eq!(
            leaf("isin", "notBlank", Json::Null).to_sql().unwrap(),
            "(\"isin\" IS NOT NULL AND \"isin\" <> '')"
        );
    }

    #[test]
    fn join_nodes_nest_with_parentheses() {
        let expr = FilterExpr::Join {
            operator: JoinOp::Or,
            conditions: vec![
                leaf("sector", "equals", Json::from("Energy")),
                FilterExpr::Join {
                    operator: JoinOp::And,
                    conditions: vec![
                        leaf("mcap", "greaterThan", Json::from(100)),
                        leaf("is_fno", "true", Json::Null),
                    ],
                },
            ],
        };
        assert_eq!(
            expr.to_sql().unwrap(),
            "(\"sector\" = 'Energy' OR (\"mcap\" > 100 AND \"is_fno\" = TRUE))"
        );
    }

    #[test]
    fn unknown_operator_is_an_error() {
        assert!(leaf("x", "regex", Json::from(".*")).to_sql().is_err());
    }

    #[test]
    fn where_combines_filters_and_universe() {
        let filters = vec![leaf("mcap", "greaterThan", Json::from(10))];
        let universe = vec!["NSE:A".to_string(), "NSE:B".to_string()];
        let clause = build_where(&filters, JoinOp::And, Some(&universe))
            .unwrap()
            .unwrap();
        assert_eq!(
            clause,
            "(\"mcap\" > 10) AND ticker IN ('NSE:A', 'NSE:B')"
        );
    }

    #[test]
    fn empty_universe_short_circuits() {
        let clause = build_where(&[], JoinOp::Or, Some(&[])).unwrap().unwrap();
        assert_eq!(clause, "1=2");
    }

    #[test]
    fn no_filters_no_universe_yields_none() {
        assert!(build_where(&[], JoinOp::And, None).unwrap().is_none());
    }

    #[test]
    fn order_by_appends_nulls_last() {
        let sort = vec![
            SortField {
                col_id: "mcap".into(),
                direction: SortDir::Desc,
            },
            SortField {
                col_id: "name".into(),
                direction: SortDir::Asc,
            },
        ];
        assert_eq!(
            build_order_by(&sort).unwrap(),
            "\"mcap\" DESC NULLS LAST, \"name\" ASC NULLS LAST"
        );
    }

    #[test]
    fn full_select_statement() {
        let sql = build_select(
            "symbols",
            &["ticker".to_string(), "name".to_string()],
            &[leaf("mcap", "greaterThan", Json::from(10))],
            JoinOp::And,
            &[SortField {
                col_id: "mcap".into(),
                direction: SortDir::Desc,
            }],
            None,
            Some(50),
            Some(50),
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT \"ticker\", \"name\" FROM symbols WHERE (\"mcap\" > 10) ORDER BY \"mcap\" DESC NULLS LAST LIMIT 50 OFFSET 50"
        );
    }

    #[test]
    fn sort_field_accepts_both_wire_shapes() {
        let a: SortField = serde_json::from_value(serde_json::json!({
            "colId": "mcap", "sort": "DESC"
        }))
        .unwrap();
        assert_eq!(a.direction, SortDir::Desc);

        let b: SortField = serde_json::from_value(serde_json::json!({
            "colId": "mcap", "direction": "desc"
        }))
        .unwrap();
        assert_eq!(b.direction, SortDir::Desc);
    }

    #[test]
    fn filter_expr_deserializes_leaves_and_joins() {
        let leaf_json = serde_json::json!({"colId": "name", "type": "contains", "filter": "oil"});
        assert!(matches!(
            serde_json::from_value::<FilterExpr>(leaf_json).unwrap(),
            FilterExpr::Leaf { .. }
        ));

        let join_json = serde_json::json!({
            "operator": "AND",
            "conditions": [
                {"colId": "a", "type": "blank"},
                {"colId": "b", "type": "true"}
            ]
        });
        assert!(matches!(
            serde_json::from_value::<FilterExpr>(join_json).unwrap(),
            FilterExpr::Join { .. }
        ));
    }
}

// =============================================================================
// Scan Request / Response Models
// =============================================================================
//
// The `/v2/scan` wire shapes. Validation is up-front and descriptive:
// malformed requests (duplicate column ids, an `x_bar_ago` without a
// positive value) are rejected before any evaluation starts.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Market selector for candle and metadata sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    India,
    Us,
}

impl Default for Market {
    fn default() -> Self {
        Market::India
    }
}

impl std::str::FromStr for Market {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "india" => Ok(Market::India),
            "us" => Ok(Market::Us),
            other => Err(format!("unknown market '{other}' (expected india|us)")),
        }
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Market::India => write!(f, "india"),
            Market::Us => write!(f, "us"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    And,
    Or,
}

impl Default for Logic {
    fn default() -> Self {
        Logic::And
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Computed,
    Static,
}

impl Default for ConditionType {
    fn default() -> Self {
        ConditionType::Computed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationType {
    Boolean,
    Rank,
}

impl Default for EvaluationType {
    fn default() -> Self {
        EvaluationType::Boolean
    }
}

/// How a per-bar boolean series collapses to one verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPeriod {
    Now,
    XBarAgo,
    WithinLast,
    InRow,
}

impl Default for EvaluationPeriod {
    fn default() -> Self {
        EvaluationPeriod::Now
    }
}

/// One scan condition: an expression plus how to reduce and qualify it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub expression: String,
    #[serde(default)]
    pub condition_type: ConditionType,
    #[serde(default)]
    pub evaluation_type: EvaluationType,
    #[serde(default)]
    pub evaluation_period: EvaluationPeriod,
    #[serde(default)]
    pub value: Option<i64>,
    /// Percentile bounds for rank conditions, inclusive.
    #[serde(default)]
    pub rank_min: Option<f64>,
    #[serde(default)]
    pub rank_max: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Static,
    Computed,
    Condition,
}

/// An output column definition. The trichotomy mirrors conditions: static
/// columns read metadata, computed columns evaluate an expression, condition
/// columns reduce nested conditions to a boolean.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub property_name: Option<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default)]
    pub logic: Option<Logic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortColumn {
    /// References a column `id` (or the literal `symbol`).
    pub column: String,
    #[serde(default = "default_sort_direction")]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

fn default_sort_direction() -> SortDirection {
    SortDirection::Desc
}

/// Complete scan request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub market: Market,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub pre_conditions: Vec<Condition>,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub pre_condition_logic: Logic,
    #[serde(default)]
    pub sort_columns: Option<Vec<SortColumn>>,
}

/// Scan result: `columns` lead with `symbol`, `data` is row-major.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    pub count: usize,
    pub columns: Vec<String>,
    pub data: Vec<Vec<serde_json::Value>>,
    pub success: bool,
}

impl ScanRequest {
    /// Reject programmer errors before evaluation. Returns a descriptive
    /// message for the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            if !seen.insert(col.id.as_str()) {
                return Err(format!("duplicate column id '{}'", col.id));
            }
            match col.column_type {
                ColumnType::Static => {
                    if col.property_name.as_deref().unwrap_or("").is_empty() {
                        return Err(format!(
                            "static column '{}' requires property_name",
                            col.id
                        ));
                    }
                }
                ColumnType::Computed => {
                    if col.expression.as_deref().unwrap_or("").is_empty() {
                        return Err(format!("computed column '{}' requires expression", col.id));
                    }
                }
                ColumnType::Condition => {
                    let empty = col.conditions.as_ref().map_or(true, |c| c.is_empty());
                    if empty {
                        return Err(format!(
                            "condition column '{}' requires a conditions list",
                            col.id
                        ));
                    }
                    for c in col.conditions.as_deref().unwrap_or(&[]) {
                        validate_condition(c)?;
                    }
                }
            }
        }

        for c in self.conditions.iter().chain(&self.pre_conditions) {
            validate_condition(c)?;
        }
        Ok(())
    }
}

fn validate_condition(c: &Condition) -> Result<(), String> {
    if c.expression.trim().is_empty() {
        return Err("condition expression must not be empty".to_string());
    }

    if c.condition_type == ConditionType::Computed {
        match c.evaluation_period {
            EvaluationPeriod::XBarAgo | EvaluationPeriod::WithinLast | EvaluationPeriod::InRow => {
                if c.value.map_or(true, |v| v <= 0) {
                    return Err(format!(
                        "evaluation_period {:?} requires a positive value",
                        c.evaluation_period
                    ));
                }
            }
            EvaluationPeriod::Now => {}
        }
    }

    if c.evaluation_type == EvaluationType::Rank {
        let (min, max) = (c.rank_min.unwrap_or(0.0), c.rank_max.unwrap_or(100.0));
        if min > max {
            return Err(format!("rank bounds out of order: {min} > {max}"));
        }
    }
    Ok(())
}

// =============================================================================
// Alert Data Model
// =============================================================================
//
// Rows come straight from the alert store's change feed, so the serde shapes
// here mirror the stored JSON exactly. An alert is immutable except for
// `is_active`, `deleted_at` and the `last_triggered_*` pair, all of which are
// written by the trigger path only.
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Comparison operator
// ---------------------------------------------------------------------------

/// The comparison applied between the tick's last price and the RHS value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    /// Apply the operator to `(lhs, rhs)`. Float equality is taken as-is;
    /// `==`/`!=` on interpolated values are not expected to be reliable.
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Operator::Lt => lhs < rhs,
            Operator::Le => lhs <= rhs,
            Operator::Gt => lhs > rhs,
            Operator::Ge => lhs >= rhs,
            Operator::Eq => lhs == rhs,
            Operator::Ne => lhs != rhs,
        }
    }
}

// ---------------------------------------------------------------------------
// Trendline point
// ---------------------------------------------------------------------------

/// One anchor of a trendline. The store persists `time` as epoch seconds;
/// older rows carry RFC 3339 strings, so both are accepted on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(deserialize_with = "deserialize_point_time")]
    pub time: DateTime<Utc>,
    pub price: f64,
}

fn deserialize_point_time<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TimeRepr {
        Epoch(f64),
        Text(String),
    }

    match TimeRepr::deserialize(deserializer)? {
        TimeRepr::Epoch(secs) => {
            let millis = (secs * 1000.0) as i64;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| serde::de::Error::custom(format!("epoch out of range: {secs}")))
        }
        TimeRepr::Text(s) => s
            .parse::<DateTime<Utc>>()
            .map_err(|e| serde::de::Error::custom(format!("bad timestamp {s:?}: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// RHS attribute
// ---------------------------------------------------------------------------

/// Right-hand-side payload. Exactly one of the two fields is meaningful,
/// selected by `Alert::rhs_type`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RhsAttr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend_line: Option<Vec<Point>>,
}

/// Discriminator for the RHS payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RhsType {
    Constant,
    TrendLine,
}

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

/// A user-defined price alert. `type` and `lhs_type` are carried verbatim for
/// forward compatibility; evaluation only understands `simple`/`last_price`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub is_active: bool,
    #[serde(default)]
    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(rename = "type")]
    pub alert_type: String,
    pub lhs_type: String,
    /// Reserved for future LHS flexibility.
    #[serde(default)]
    pub lhs_attr: Option<serde_json::Value>,

    pub operator: Operator,
    pub rhs_type: RhsType,
    pub rhs_attr: RhsAttr,

    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_triggered_price: Option<f64>,
}

impl Alert {
    /// Live means the alert participates in evaluation: active and not
    /// soft-deleted.
    pub fn is_live(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }

    pub fn is_trendline(&self) -> bool {
        self.rhs_type == RhsType::TrendLine
    }

    /// The constant RHS value, if this is a constant alert.
    pub fn constant_value(&self) -> Option<f64> {
        match self.rhs_type {
            RhsType::Constant => self.rhs_attr.constant,
            RhsType::TrendLine => None,
        }
    }

    /// The trendline anchors, if present.
    pub fn trendline_points(&self) -> Option<&[Point]> {
        self.rhs_attr.trend_line.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// A single price update from the quote stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeUpdate {
    pub symbol: String,
    /// Last trade price.
    pub ltp: f64,
    /// Last trade time.
    pub ltt: DateTime<Utc>,
    /// Last trade quantity.
    pub ltq: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn constant_alert(id: &str, symbol: &str, op: Operator, value: f64) -> Alert {
        Alert {
            id: id.into(),
            user_id: "u1".into(),
            symbol: symbol.into(),
            is_active: true,
            notes: None,
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
            alert_type: "simple".into(),
            lhs_type: "last_price".into(),
            lhs_attr: None,
            operator: op,
            rhs_type: RhsType::Constant,
            rhs_attr: RhsAttr {
                constant: Some(value),
                trend_line: None,
            },
            last_triggered_at: None,
            last_triggered_price: None,
        }
    }

    #[test]
    fn parses_store_row() {
        let row = serde_json::json!({
            "id": "a1",
            "user_id": "u1",
            "symbol": "NSE:RELIANCE",
            "is_active": true,
            "notes": null,
            "created_at": "2025-06-01T10:00:00Z",
            "updated_at": null,
            "deleted_at": null,
            "type": "simple",
            "lhs_type": "last_price",
            "lhs_attr": null,
            "operator": ">",
            "rhs_type": "constant",
            "rhs_attr": {"constant": 2900.5}
        });
        let alert: Alert = serde_json::from_value(row).unwrap();
        assert!(alert.is_live());
        assert_eq!(alert.operator, Operator::Gt);
        assert_eq!(alert.constant_value(), Some(2900.5));
        assert!(!alert.is_trendline());
    }

    #[test]
    fn parses_trendline_with_epoch_points() {
        let row = serde_json::json!({
            "id": "a2",
            "user_id": "u1",
            "symbol": "NSE:TCS",
            "is_active": true,
            "created_at": "2025-06-01T10:00:00Z",
            "type": "simple",
            "lhs_type": "last_price",
            "operator": ">=",
            "rhs_type": "trend_line",
            "rhs_attr": {"trend_line": [
                {"time": 1700000000, "price": 100.0},
                {"time": 1700000100, "price": 200.0}
            ]}
        });
        let alert: Alert = serde_json::from_value(row).unwrap();
        let points = alert.trendline_points().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].time.timestamp(), 1_700_000_000);
        assert_eq!(alert.constant_value(), None);
    }

    #[test]
    fn soft_deleted_is_not_live() {
        let mut alert = constant_alert("a3", "NSE:X", Operator::Lt, 10.0);
        alert.deleted_at = Some(Utc::now());
        assert!(!alert.is_live());
    }

    #[test]
    fn operator_apply_matrix() {
        assert!(Operator::Gt.apply(2.0, 1.0));
        assert!(!Operator::Gt.apply(1.0, 1.0));
        assert!(Operator::Ge.apply(1.0, 1.0));
        assert!(Operator::Lt.apply(0.5, 1.0));
        assert!(Operator::Le.apply(1.0, 1.0));
        assert!(Operator::Eq.apply(1.0, 1.0));
        assert!(Operator::Ne.apply(1.0, 2.0));
    }
}

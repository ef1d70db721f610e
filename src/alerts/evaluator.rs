// =============================================================================
// Alert Evaluator — does a single (alert, tick) pair fire?
// =============================================================================
//
// Pure function, all arithmetic in f64. Trendlines interpolate linearly in
// wall-clock seconds and extrapolate without bounds; callers wanting strict
// span checks must pre-filter ticks themselves.
// =============================================================================

use tracing::debug;

use crate::alerts::models::{Alert, ChangeUpdate, Point, RhsType};

/// Evaluate whether `alert` fires on `update`.
///
/// Returns `false` for anything the evaluator does not understand — unknown
/// LHS types, missing constants, malformed trendlines — so a bad row can
/// never fire.
pub fn evaluate_alert(alert: &Alert, update: &ChangeUpdate) -> bool {
    if alert.lhs_type != "last_price" {
        debug!(alert_id = %alert.id, lhs_type = %alert.lhs_type, "unsupported lhs_type");
        return false;
    }

    let lhs = update.ltp;

    let rhs = match alert.rhs_type {
        RhsType::Constant => match alert.constant_value() {
            Some(v) => v,
            None => {
                debug!(alert_id = %alert.id, "constant alert without a constant value");
                return false;
            }
        },
        RhsType::TrendLine => {
            let points = match alert.trendline_points() {
                Some(p) if p.len() == 2 => p,
                _ => {
                    debug!(alert_id = %alert.id, "trendline alert without exactly two points");
                    return false;
                }
            };
            interpolate_trendline(&points[0], &points[1], update.ltt.timestamp() as f64)
        }
    };

    alert.operator.apply(lhs, rhs)
}

/// Price of the line through `p1`, `p2` at epoch-second `at`. Point order on
/// input does not matter. Two coincident timestamps degenerate to the
/// anchors' price. Extrapolation outside the span is intentional.
pub fn interpolate_trendline(p1: &Point, p2: &Point, at: f64) -> f64 {
    let (old, new) = if p2.time > p1.time {
        (p1, p2)
    } else {
        (p2, p1)
    };

    let t0 = old.time.timestamp() as f64;
    let t1 = new.time.timestamp() as f64;

    if t1 == t0 {
        return new.price;
    }

    let slope = (new.price - old.price) / (t1 - t0);
    old.price + slope * (at - t0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::models::{Operator, RhsAttr};
    use chrono::{TimeZone, Utc};

    fn tick(symbol: &str, ltp: f64, ltt_secs: i64) -> ChangeUpdate {
        ChangeUpdate {
            symbol: symbol.into(),
            ltp,
            ltt: Utc.timestamp_opt(ltt_secs, 0).unwrap(),
            ltq: 10.0,
        }
    }

    fn point(secs: i64, price: f64) -> Point {
        Point {
            time: Utc.timestamp_opt(secs, 0).unwrap(),
            price,
        }
    }

    fn base_alert(symbol: &str, op: Operator) -> Alert {
        Alert {
            id: "a1".into(),
            user_id: "u".into(),
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
            rhs_attr: RhsAttr::default(),
            last_triggered_at: None,
            last_triggered_price: None,
        }
    }

    fn constant_alert(op: Operator, value: f64) -> Alert {
        let mut a = base_alert("NSE:X", op);
        a.rhs_attr.constant = Some(value);
        a
    }

    fn trendline_alert(op: Operator, p1: Point, p2: Point) -> Alert {
        let mut a = base_alert("NSE:X", op);
        a.rhs_type = RhsType::TrendLine;
        a.rhs_attr = RhsAttr {
            constant: None,
            trend_line: Some(vec![p1, p2]),
        };
        a
    }

    #[test]
    fn constant_greater_than_boundary() {
        let a = constant_alert(Operator::Gt, 100.0);
        assert!(!evaluate_alert(&a, &tick("NSE:X", 99.0, 0)));
        assert!(!evaluate_alert(&a, &tick("NSE:X", 100.0, 0)));
        assert!(evaluate_alert(&a, &tick("NSE:X", 100.0001, 0)));
        assert!(evaluate_alert(&a, &tick("NSE:X", 101.0, 0)));
    }

    #[test]
    fn missing_constant_never_fires() {
        let a = base_alert("NSE:X", Operator::Gt);
        assert!(!evaluate_alert(&a, &tick("NSE:X", 1000.0, 0)));
    }

    #[test]
    fn unsupported_lhs_type_never_fires() {
        let mut a = constant_alert(Operator::Gt, 1.0);
        a.lhs_type = "volume".into();
        assert!(!evaluate_alert(&a, &tick("NSE:X", 1000.0, 0)));
    }

    #[test]
    fn trendline_interpolates_at_midpoint() {
        // (t=0, 100) -> (t=100, 200); midpoint is 150.
        let a = trendline_alert(Operator::Ge, point(0, 100.0), point(100, 200.0));
        assert!(evaluate_alert(&a, &tick("NSE:X", 150.0, 50)));
        assert!(!evaluate_alert(&a, &tick("NSE:X", 149.999, 50)));
    }

    #[test]
    fn trendline_endpoints_match_anchor_prices() {
        let p0 = point(1_000, 100.0);
        let p1 = point(2_000, 200.0);
        assert!((interpolate_trendline(&p0, &p1, 1_000.0) - 100.0).abs() < 1e-9);
        assert!((interpolate_trendline(&p0, &p1, 2_000.0) - 200.0).abs() < 1e-9);
        // Order of anchors must not matter.
        assert!((interpolate_trendline(&p1, &p0, 1_500.0) - 150.0).abs() < 1e-9);
    }

    #[test]
    fn trendline_extrapolates_beyond_span() {
        let a = trendline_alert(Operator::Ge, point(0, 100.0), point(100, 200.0));
        // At t=200 the extrapolated line sits at 300.
        assert!(evaluate_alert(&a, &tick("NSE:X", 300.0, 200)));
        assert!(!evaluate_alert(&a, &tick("NSE:X", 299.0, 200)));
    }

    #[test]
    fn degenerate_trendline_uses_anchor_price() {
        let a = trendline_alert(Operator::Eq, point(100, 150.0), point(100, 150.0));
        assert!(evaluate_alert(&a, &tick("NSE:X", 150.0, 9_999)));
    }

    #[test]
    fn trendline_with_wrong_point_count_never_fires() {
        let mut a = base_alert("NSE:X", Operator::Gt);
        a.rhs_type = RhsType::TrendLine;
        a.rhs_attr.trend_line = Some(vec![point(0, 1.0)]);
        assert!(!evaluate_alert(&a, &tick("NSE:X", 1000.0, 0)));

        a.rhs_attr.trend_line = None;
        assert!(!evaluate_alert(&a, &tick("NSE:X", 1000.0, 0)));
    }
}

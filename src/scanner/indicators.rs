// =============================================================================
// Technical Indicator Primitives
// =============================================================================
//
// The complete vocabulary callable from scan expressions. Every primitive is
// pure: a series in, a same-length series out, NaN marking the positions
// where a value is undefined. Rolling windows use min_periods=1 semantics —
// a partial window at the head still produces a value.
// =============================================================================

/// Rolling mean over `window` bars.
pub fn sma(series: &[f64], window: usize) -> Vec<f64> {
    rolling(series, window, |vals| {
        let finite: Vec<f64> = vals.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            f64::NAN
        } else {
            finite.iter().sum::<f64>() / finite.len() as f64
        }
    })
}

/// Exponential moving average with span semantics and no bias adjustment:
/// `alpha = 2 / (span + 1)`, seeded with the first observed value.
pub fn ema(series: &[f64], span: usize) -> Vec<f64> {
    if span == 0 {
        return vec![f64::NAN; series.len()];
    }
    let alpha = 2.0 / (span as f64 + 1.0);

    let mut out = Vec::with_capacity(series.len());
    let mut prev: Option<f64> = None;
    for &value in series {
        if !value.is_finite() {
            // NaN input leaves a NaN output but does not reset the average.
            out.push(f64::NAN);
            continue;
        }
        let next = match prev {
            None => value,
            Some(p) => value * alpha + p * (1.0 - alpha),
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// Value `lookback` bars ago; the first `lookback` positions are NaN.
pub fn prv(series: &[f64], lookback: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; series.len()];
    for i in lookback..series.len() {
        out[i] = series[i - lookback];
    }
    out
}

/// Rolling minimum over `window` bars.
pub fn rolling_min(series: &[f64], window: usize) -> Vec<f64> {
    rolling(series, window, |vals| {
        vals.iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::NAN, |acc, v| if acc.is_nan() || v < acc { v } else { acc })
    })
}

/// Rolling maximum over `window` bars.
pub fn rolling_max(series: &[f64], window: usize) -> Vec<f64> {
    rolling(series, window, |vals| {
        vals.iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::NAN, |acc, v| if acc.is_nan() || v > acc { v } else { acc })
    })
}

/// Rolling count of non-null values over `window` bars.
pub fn rolling_count(series: &[f64], window: usize) -> Vec<f64> {
    rolling(series, window, |vals| {
        vals.iter().filter(|v| v.is_finite()).count() as f64
    })
}

/// Rolling sum of a boolean series over `window` bars.
pub fn count_true(series: &[bool], window: usize) -> Vec<f64> {
    if window == 0 {
        return vec![f64::NAN; series.len()];
    }
    let mut out = Vec::with_capacity(series.len());
    for i in 0..series.len() {
        let start = (i + 1).saturating_sub(window);
        out.push(series[start..=i].iter().filter(|b| **b).count() as f64);
    }
    out
}

/// Percentage change over `periods` bars. Division blow-ups (±∞) become NaN.
pub fn change(series: &[f64], periods: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; series.len()];
    for i in periods..series.len() {
        let prev = series[i - periods];
        let pct = series[i] / prev - 1.0;
        out[i] = if pct.is_finite() { pct } else { f64::NAN };
    }
    out
}

fn rolling(series: &[f64], window: usize, f: impl Fn(&[f64]) -> f64) -> Vec<f64> {
    if window == 0 {
        return vec![f64::NAN; series.len()];
    }
    let mut out = Vec::with_capacity(series.len());
    for i in 0..series.len() {
        let start = (i + 1).saturating_sub(window);
        out.push(f(&series[start..=i]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "got {a}, expected {b}");
    }

    #[test]
    fn sma_partial_windows_at_head() {
        let out = sma(&[2.0, 4.0, 6.0, 8.0], 3);
        assert_close(out[0], 2.0);
        assert_close(out[1], 3.0);
        assert_close(out[2], 4.0);
        assert_close(out[3], 6.0);
    }

    #[test]
    fn sma_skips_nan_inside_window() {
        let out = sma(&[2.0, f64::NAN, 6.0], 3);
        assert_close(out[2], 4.0);
    }

    #[test]
    fn ema_span_recursion() {
        // span=3 -> alpha=0.5; seeded with the first value.
        let out = ema(&[2.0, 4.0, 8.0], 3);
        assert_close(out[0], 2.0);
        assert_close(out[1], 3.0);
        assert_close(out[2], 5.5);
    }

    #[test]
    fn ema_nan_does_not_reset_state() {
        let out = ema(&[2.0, f64::NAN, 2.0], 3);
        assert!(out[1].is_nan());
        assert_close(out[2], 2.0);
    }

    #[test]
    fn prv_shifts_with_nan_head() {
        let out = prv(&[1.0, 2.0, 3.0], 1);
        assert!(out[0].is_nan());
        assert_close(out[1], 1.0);
        assert_close(out[2], 2.0);

        let out2 = prv(&[1.0, 2.0, 3.0], 5);
        assert!(out2.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn rolling_min_max_track_the_window() {
        let data = [5.0, 1.0, 3.0, 8.0];
        let mins = rolling_min(&data, 2);
        let maxs = rolling_max(&data, 2);
        assert_close(mins[0], 5.0);
        assert_close(mins[1], 1.0);
        assert_close(mins[2], 1.0);
        assert_close(mins[3], 3.0);
        assert_close(maxs[3], 8.0);
    }

    #[test]
    fn rolling_count_ignores_nan() {
        let out = rolling_count(&[1.0, f64::NAN, 3.0], 2);
        assert_close(out[0], 1.0);
        assert_close(out[1], 1.0);
        assert_close(out[2], 1.0);
    }

    #[test]
    fn count_true_sums_booleans() {
        let out = count_true(&[true, false, true, true], 2);
        assert_close(out[0], 1.0);
        assert_close(out[1], 1.0);
        assert_close(out[2], 1.0);
        assert_close(out[3], 2.0);
    }

    #[test]
    fn change_is_pct_change() {
        let out = change(&[100.0, 110.0, 99.0], 1);
        assert!(out[0].is_nan());
        assert_close(out[1], 0.1);
        assert_close(out[2], -0.1);
    }

    #[test]
    fn change_from_zero_is_nan_not_inf() {
        let out = change(&[0.0, 5.0], 1);
        assert!(out[1].is_nan());
    }
}

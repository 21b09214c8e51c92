// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// ATR measures volatility by decomposing the entire range of a bar.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is then the smoothed average of TR using Wilder's method:
//   ATR_0 = SMA of first `window` TR values
//   ATR_t = (ATR_{t-1} * (window - 1) + TR_t) / window
//
// The overextension check built on ATR flags symbols whose price has run
// more than `atr × multiplier` above the recent swing low.
// =============================================================================

use crate::error::ScanError;
use crate::types::{Bar, Overextension};

/// Compute the full ATR series for `bars` with the given `window`.
///
/// The returned vector has one ATR value per bar starting at index `window`
/// (the first bar yields no true range; the next `window` TR values seed the
/// average), so its length is `bars.len() - window`.
///
/// # Errors
/// `ScanError::InsufficientData` when `window == 0` or there are fewer than
/// `window + 1` bars.
pub fn atr_series(bars: &[Bar], window: usize) -> Result<Vec<f64>, ScanError> {
    if window == 0 || bars.len() < window + 1 {
        return Err(ScanError::InsufficientData {
            have: bars.len(),
            need: window.max(1) + 1,
        });
    }

    // --- Step 1: True Range for each consecutive pair ------------------------
    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    // --- Step 2: Seed ATR with SMA of first `window` TR values ---------------
    let window_f = window as f64;
    let mut atr = tr_values[..window].iter().sum::<f64>() / window_f;

    let mut result = Vec::with_capacity(tr_values.len() - window + 1);
    result.push(atr);

    // --- Step 3: Wilder's smoothing for remaining TR values ------------------
    for &tr in &tr_values[window..] {
        atr = (atr * (window_f - 1.0) + tr) / window_f;
        result.push(atr);
    }

    Ok(result)
}

/// Measure how far the latest close has run above the swing low of the
/// previous `lookback` bars (the current bar is excluded from the swing).
///
/// Threshold = swing_low + atr × multiplier. A close above the threshold is
/// overextended. Proximity is reported on a 0–100 scale where 0 is the swing
/// low and 100 is the threshold.
///
/// Returns `None` when there are not enough bars to form the swing window or
/// `atr` is non-finite.
pub fn check_overextended(
    bars: &[Bar],
    atr: f64,
    lookback: usize,
    multiplier: f64,
) -> Option<Overextension> {
    if lookback == 0 || bars.len() < lookback + 1 || !atr.is_finite() {
        return None;
    }

    let recent = &bars[bars.len() - (lookback + 1)..];
    // Swing excludes the current bar: it is the level price ran away FROM.
    let swing = &recent[..recent.len() - 1];

    let swing_low = swing.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let swing_high = swing.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let current_price = bars[bars.len() - 1].close;

    let threshold = swing_low + atr * multiplier;
    let distance_from_threshold = current_price - threshold;
    let distance_pct = if threshold != 0.0 {
        distance_from_threshold / threshold * 100.0
    } else {
        0.0
    };

    let proximity_pct = if threshold > swing_low {
        ((current_price - swing_low) / (threshold - swing_low) * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    Some(Overextension {
        is_overextended: current_price > threshold,
        swing_low,
        swing_high,
        threshold,
        current_price,
        distance_from_threshold,
        distance_pct,
        proximity_pct,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    /// Build a test bar with the given OHLC values.
    fn bar(i: usize, open: f64, high: f64, low: f64, close: f64) -> Bar {
        let day0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Bar {
            symbol: "TEST".into(),
            timestamp: day0 + Duration::days(i as i64),
            open,
            high,
            low,
            close,
            volume: 1_000,
        }
    }

    #[test]
    fn atr_window_zero_is_insufficient() {
        let bars: Vec<Bar> = (0..20).map(|i| bar(i, 100.0, 105.0, 95.0, 102.0)).collect();
        assert!(atr_series(&bars, 0).is_err());
    }

    #[test]
    fn atr_insufficient_data() {
        // Need window + 1 = 15 bars for window=14, only have 10.
        let bars: Vec<Bar> = (0..10).map(|i| bar(i, 100.0, 105.0, 95.0, 102.0)).collect();
        let err = atr_series(&bars, 14).unwrap_err();
        assert!(matches!(err, ScanError::InsufficientData { have: 10, need: 15 }));
    }

    #[test]
    fn atr_exact_minimum_data() {
        // window=3, need 4 bars to get 3 TR values and one ATR.
        let bars = vec![
            bar(0, 100.0, 102.0, 98.0, 101.0),
            bar(1, 101.0, 104.0, 99.0, 103.0),
            bar(2, 103.0, 106.0, 100.0, 105.0),
            bar(3, 105.0, 108.0, 102.0, 107.0),
        ];
        let series = atr_series(&bars, 3).unwrap();
        assert_eq!(series.len(), 1);
        assert!(series[0] > 0.0 && series[0].is_finite());
    }

    #[test]
    fn atr_constant_range_converges_to_range() {
        // All bars share the same 10-point range; TR is constant so ATR must
        // sit at 10 regardless of drift.
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                bar(i, base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let series = atr_series(&bars, 14).unwrap();
        let last = *series.last().unwrap();
        assert!((last - 10.0).abs() < 1.0, "expected ATR near 10.0, got {last}");
    }

    #[test]
    fn atr_true_range_uses_prev_close_on_gaps() {
        // Gap up: |H - prevClose| = 20 dominates H - L = 7.
        let bars = vec![
            bar(0, 100.0, 105.0, 95.0, 95.0),
            bar(1, 110.0, 115.0, 108.0, 112.0),
            bar(2, 112.0, 118.0, 110.0, 115.0),
            bar(3, 115.0, 120.0, 113.0, 118.0),
        ];
        let series = atr_series(&bars, 3).unwrap();
        assert!(series[0] > 7.0, "ATR should reflect the gap, got {}", series[0]);
    }

    #[test]
    fn atr_is_deterministic_and_nonnegative() {
        let bars: Vec<Bar> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.5).sin() * 10.0;
                bar(i, base - 0.5, base + 2.0, base - 2.0, base + 0.5)
            })
            .collect();
        let a = atr_series(&bars, 14).unwrap();
        let b = atr_series(&bars, 14).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|v| *v >= 0.0));
    }

    // ---- check_overextended ----------------------------------------------

    #[test]
    fn overextended_when_price_runs_past_threshold() {
        // Swing low 95 over five flat bars, then a spike.
        let mut bars: Vec<Bar> = (0..5).map(|i| bar(i, 100.0, 102.0, 95.0, 100.0)).collect();
        bars.push(bar(5, 100.0, 112.0, 100.0, 111.0));

        // atr=3, multiplier=5 => threshold = 95 + 15 = 110 < 111.
        let o = check_overextended(&bars, 3.0, 5, 5.0).unwrap();
        assert!(o.is_overextended);
        assert!((o.swing_low - 95.0).abs() < f64::EPSILON);
        assert!((o.threshold - 110.0).abs() < f64::EPSILON);
        assert!((o.proximity_pct - 100.0).abs() < f64::EPSILON);
        assert!(o.distance_from_threshold > 0.0);
    }

    #[test]
    fn not_overextended_below_threshold() {
        let mut bars: Vec<Bar> = (0..5).map(|i| bar(i, 100.0, 102.0, 95.0, 100.0)).collect();
        bars.push(bar(5, 100.0, 105.0, 100.0, 104.0));

        let o = check_overextended(&bars, 3.0, 5, 5.0).unwrap();
        assert!(!o.is_overextended);
        assert!(o.proximity_pct < 100.0);
        assert!(o.distance_from_threshold < 0.0);
    }

    #[test]
    fn swing_excludes_current_bar() {
        // The current bar's low (80) must not become the swing low.
        let mut bars: Vec<Bar> = (0..5).map(|i| bar(i, 100.0, 102.0, 95.0, 100.0)).collect();
        bars.push(bar(5, 100.0, 101.0, 80.0, 100.0));

        let o = check_overextended(&bars, 2.0, 5, 5.0).unwrap();
        assert!((o.swing_low - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn overextended_requires_enough_bars() {
        let bars: Vec<Bar> = (0..5).map(|i| bar(i, 100.0, 102.0, 95.0, 100.0)).collect();
        // lookback 5 needs 6 bars.
        assert!(check_overextended(&bars, 3.0, 5, 5.0).is_none());
    }

    #[test]
    fn overextended_rejects_non_finite_atr() {
        let bars: Vec<Bar> = (0..7).map(|i| bar(i, 100.0, 102.0, 95.0, 100.0)).collect();
        assert!(check_overextended(&bars, f64::NAN, 5, 5.0).is_none());
    }
}

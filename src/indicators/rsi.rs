// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// RSI measures the speed and magnitude of recent price changes to evaluate
// whether a symbol is overbought or oversold.
//
// Step 1 — Compute price changes (deltas) from consecutive closes.
// Step 2 — Seed average gain / average loss with the SMA of the first `window`
//          gains / losses.
// Step 3 — Apply Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (window - 1) + current_gain) / window
//            avg_loss = (prev_avg_loss * (window - 1) + current_loss) / window
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// Edge values: avg_loss == 0 with gains present => 100; both averages zero
// (flat market) => 50.
// =============================================================================

use crate::error::ScanError;
use crate::types::Bar;

/// Compute the full RSI series for `bars` with the given `window`.
///
/// The returned vector has one RSI value for each bar starting at index
/// `window` (the first `window` deltas are consumed to seed the averages), so
/// its length is `bars.len() - window`.
///
/// # Errors
/// `ScanError::InsufficientData` when `window == 0` or there are fewer than
/// `window + 1` bars (each delta needs a predecessor).
pub fn rsi_series(bars: &[Bar], window: usize) -> Result<Vec<f64>, ScanError> {
    if window == 0 || bars.len() < window + 1 {
        return Err(ScanError::InsufficientData {
            have: bars.len(),
            need: window.max(1) + 1,
        });
    }

    // --- Compute close-to-close deltas ---------------------------------------
    let deltas: Vec<f64> = bars.windows(2).map(|w| w[1].close - w[0].close).collect();

    // --- Seed averages with SMA of first `window` deltas ---------------------
    let (sum_gain, sum_loss) = deltas[..window].iter().fold((0.0_f64, 0.0_f64), |(g, l), &d| {
        if d > 0.0 {
            (g + d, l)
        } else {
            (g, l + d.abs())
        }
    });

    let window_f = window as f64;
    let mut avg_gain = sum_gain / window_f;
    let mut avg_loss = sum_loss / window_f;

    let mut result = Vec::with_capacity(deltas.len() - window + 1);
    result.push(rsi_from_averages(avg_gain, avg_loss));

    // --- Wilder's smoothing for subsequent values ----------------------------
    for &delta in &deltas[window..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (window_f - 1.0) + gain) / window_f;
        avg_loss = (avg_loss * (window_f - 1.0) + loss) / window_f;

        result.push(rsi_from_averages(avg_gain, avg_loss));
    }

    Ok(result)
}

/// Outcome of the trailing extreme-RSI check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RsiExtremes {
    /// Highest RSI over the examined window.
    pub max_rsi: f64,
    /// Lowest RSI over the examined window.
    pub min_rsi: f64,
    /// `max_rsi >= high_threshold` (inclusive).
    pub hit_high: bool,
    /// `min_rsi <= low_threshold` (inclusive).
    pub hit_low: bool,
}

/// Examine the trailing `lookback` values of an RSI series for threshold
/// hits. Returns `None` for an empty series; a series shorter than
/// `lookback` is examined in full.
pub fn check_rsi_extremes(
    series: &[f64],
    lookback: usize,
    high_threshold: f64,
    low_threshold: f64,
) -> Option<RsiExtremes> {
    if series.is_empty() || lookback == 0 {
        return None;
    }

    let start = series.len().saturating_sub(lookback);
    let recent = &series[start..];

    let max_rsi = recent.iter().cloned().fold(f64::MIN, f64::max);
    let min_rsi = recent.iter().cloned().fold(f64::MAX, f64::min);

    Some(RsiExtremes {
        max_rsi,
        min_rsi,
        hit_high: max_rsi >= high_threshold,
        hit_low: min_rsi <= low_threshold,
    })
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Convert average gain / average loss into an RSI value in [0, 100].
///
/// - If both averages are zero, RSI is 50.0 (no movement).
/// - If average loss is zero (only gains), RSI is 100.0.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0 // No movement at all — neutral.
    } else if avg_loss == 0.0 {
        100.0 // All gains, no losses.
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

// =============================================================================
// Shared types used across the Vigil scan engine
// =============================================================================

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bars and intervals
// ---------------------------------------------------------------------------

/// A single OHLCV observation for one symbol and one bar interval.
/// Immutable once stored; timestamps are unique per (symbol, interval).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    /// Bar-open instant, aligned to the interval boundary (UTC).
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Bar granularity. Every cached series is keyed by (symbol, interval) and
/// every stored timestamp must sit exactly on an interval boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarInterval {
    Day1,
    Hour1,
    Min1,
}

impl BarInterval {
    /// Length of one bar.
    pub fn duration(&self) -> Duration {
        match self {
            Self::Day1 => Duration::days(1),
            Self::Hour1 => Duration::hours(1),
            Self::Min1 => Duration::minutes(1),
        }
    }

    /// Canonical string used as the cache key component and in vendor URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day1 => "1d",
            Self::Hour1 => "1h",
            Self::Min1 => "1m",
        }
    }

    /// Truncate `ts` down to the open of the bar that contains it.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        // duration_trunc only fails for zero/overflowing spans, which the
        // three fixed intervals above can never produce.
        ts.duration_trunc(self.duration()).unwrap_or(ts)
    }

    /// Whether `ts` sits exactly on a bar-open boundary for this interval.
    pub fn is_aligned(&self, ts: DateTime<Utc>) -> bool {
        self.truncate(ts) == ts
    }

    /// Open instant of the bar currently in progress at `now`.
    pub fn open_bar_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.truncate(now)
    }
}

impl std::fmt::Display for BarInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BarInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1d" => Ok(Self::Day1),
            "1h" => Ok(Self::Hour1),
            "1m" => Ok(Self::Min1),
            other => Err(format!("unknown bar interval '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Time ranges
// ---------------------------------------------------------------------------

/// Closed range of bar-open instants: both ends inclusive, both aligned to
/// the interval of the series being addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Trailing range covering the last `bars` intervals up to (and
    /// including) the bar open at `now`.
    pub fn trailing(interval: BarInterval, bars: i64, now: DateTime<Utc>) -> Self {
        let end = interval.truncate(now);
        Self {
            start: end - interval.duration() * (bars.max(1) as i32 - 1),
            end,
        }
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} .. {}]", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// RSI-based classification. Bounds are inclusive: RSI exactly at the
/// overbought threshold classifies as Overbought, likewise for Oversold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Overbought,
    Oversold,
    Normal,
}

impl Classification {
    pub fn from_rsi(rsi: f64, overbought: f64, oversold: f64) -> Self {
        if rsi >= overbought {
            Self::Overbought
        } else if rsi <= oversold {
            Self::Oversold
        } else {
            Self::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overbought => "OVERBOUGHT",
            Self::Oversold => "OVERSOLD",
            Self::Normal => "NORMAL",
        }
    }

    pub fn is_alert(&self) -> bool {
        !matches!(self, Self::Normal)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Per-symbol scan state machine
// ---------------------------------------------------------------------------

/// Lifecycle of one symbol within a scan pass.
///
/// `Pending → Fetching → Merging → Computing → Classified`, with Fetching and
/// Merging skipped when the cache already covers the requested range. Any
/// failure transitions to `Failed`; the batch continues with other symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolPhase {
    Pending,
    Fetching,
    Merging,
    Computing,
    Classified,
    Failed,
}

impl std::fmt::Display for SymbolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Fetching => "FETCHING",
            Self::Merging => "MERGING",
            Self::Computing => "COMPUTING",
            Self::Classified => "CLASSIFIED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Scan output
// ---------------------------------------------------------------------------

/// Derived indicator values for one bar. Never authoritative: recomputed on
/// demand from the bar series, persisted only for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorResult {
    pub timestamp: DateTime<Utc>,
    /// In [0, 100].
    pub rsi: f64,
    /// Non-negative.
    pub atr: f64,
}

/// Overextension measurement relative to the recent swing low: a symbol is
/// overextended when price has run more than `atr × multiplier` above the
/// lowest low of the trailing lookback window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Overextension {
    pub is_overextended: bool,
    pub swing_low: f64,
    pub swing_high: f64,
    pub threshold: f64,
    pub current_price: f64,
    pub distance_from_threshold: f64,
    pub distance_pct: f64,
    /// 0% = at the swing low, 100% = at (or beyond) the threshold.
    pub proximity_pct: f64,
}

/// One scan outcome for one symbol. Append-only: historical records are
/// retained for audit and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub scan_id: String,
    pub symbol: String,
    pub scanned_at: DateTime<Utc>,
    pub phase: SymbolPhase,
    pub classification: Option<Classification>,
    pub rsi: Option<f64>,
    pub atr: Option<f64>,
    /// Highest / lowest RSI over the trailing lookback window.
    pub max_rsi: Option<f64>,
    pub min_rsi: Option<f64>,
    pub hit_high: bool,
    pub hit_low: bool,
    pub overextension: Option<Overextension>,
    pub current_price: Option<f64>,
    /// Bars available for the computation.
    pub data_points: usize,
    /// True when the symbol was served entirely from cache.
    pub cached: bool,
    /// Failure detail when `phase == Failed`, or a skip reason such as
    /// insufficient history.
    pub status: String,
}

impl ScanRecord {
    pub fn is_alert(&self) -> bool {
        self.hit_high
            || self.hit_low
            || self.overextension.map(|o| o.is_overextended).unwrap_or(false)
    }
}

/// Aggregate outcome of one full scan pass.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub scan_id: String,
    pub total: usize,
    pub classified: usize,
    pub insufficient: usize,
    pub failed: usize,
    pub alerts: usize,
    pub cache_hits: usize,
    pub duration_secs: f64,
    pub aborted: bool,
}

impl ScanSummary {
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total as f64 * 100.0
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn daily_truncation_drops_time_of_day() {
        let noon = ts("2026-08-14T12:34:56Z");
        let day = BarInterval::Day1.truncate(noon);
        assert_eq!(day, ts("2026-08-14T00:00:00Z"));
        assert!(BarInterval::Day1.is_aligned(day));
        assert!(!BarInterval::Day1.is_aligned(noon));
    }

    #[test]
    fn hourly_alignment() {
        assert!(BarInterval::Hour1.is_aligned(ts("2026-08-14T09:00:00Z")));
        assert!(!BarInterval::Hour1.is_aligned(ts("2026-08-14T09:30:00Z")));
    }

    #[test]
    fn interval_round_trips_through_str() {
        for iv in [BarInterval::Day1, BarInterval::Hour1, BarInterval::Min1] {
            assert_eq!(iv.as_str().parse::<BarInterval>().unwrap(), iv);
        }
        assert!("5m".parse::<BarInterval>().is_err());
    }

    #[test]
    fn trailing_range_spans_requested_bar_count() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 15, 0, 0).unwrap();
        let r = TimeRange::trailing(BarInterval::Day1, 30, now);
        assert_eq!(r.end, ts("2026-08-30T00:00:00Z"));
        assert_eq!(r.start, ts("2026-08-01T00:00:00Z"));
        assert!(r.contains(ts("2026-08-15T00:00:00Z")));
        assert!(!r.contains(ts("2026-07-31T00:00:00Z")));
    }

    #[test]
    fn classification_bounds_are_inclusive() {
        assert_eq!(
            Classification::from_rsi(90.0, 90.0, 10.0),
            Classification::Overbought
        );
        assert_eq!(
            Classification::from_rsi(10.0, 90.0, 10.0),
            Classification::Oversold
        );
        assert_eq!(
            Classification::from_rsi(89.999, 90.0, 10.0),
            Classification::Normal
        );
        assert_eq!(
            Classification::from_rsi(10.001, 90.0, 10.0),
            Classification::Normal
        );
    }

    #[test]
    fn alert_flags() {
        assert!(Classification::Overbought.is_alert());
        assert!(Classification::Oversold.is_alert());
        assert!(!Classification::Normal.is_alert());
    }
}

// =============================================================================
// Scanner Configuration — explicit settings struct with atomic save
// =============================================================================
//
// Every tunable parameter of the scan engine lives here; nothing hides in a
// dynamic threshold map. All fields carry `#[serde(default)]` so that adding
// new fields never breaks loading an older config file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. Validation runs once at startup; invalid thresholds or windows are
// fatal (ScanError::Configuration).
// =============================================================================

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ScanError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_rsi_window() -> usize {
    14
}

fn default_atr_window() -> usize {
    14
}

fn default_rsi_overbought() -> f64 {
    90.0
}

fn default_rsi_oversold() -> f64 {
    10.0
}

fn default_rsi_lookback_bars() -> usize {
    7
}

fn default_overextended_lookback_bars() -> usize {
    5
}

fn default_overextended_atr_multiplier() -> f64 {
    5.0
}

fn default_hist_bars() -> i64 {
    30
}

fn default_freshness_hours() -> i64 {
    24
}

fn default_fetch_timeout_secs() -> u64 {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_concurrent_fetches() -> usize {
    8
}

fn default_prune_after_days() -> i64 {
    90
}

fn default_db_path() -> String {
    "data/scanner.db".to_string()
}

fn default_output_dir() -> String {
    "data/exports".to_string()
}

fn default_results_csv() -> String {
    "scan_results.csv".to_string()
}

fn default_alerts_csv() -> String {
    "rsi_alerts.csv".to_string()
}

fn default_universe_url() -> String {
    "https://datahub.io/core/s-and-p-500-companies/r/constituents.csv".to_string()
}

fn default_provider_base_url() -> String {
    "https://data.vigilmarkets.io".to_string()
}

fn default_excluded_tickers() -> HashSet<String> {
    // Symbols the vendor consistently rejects.
    ["BF-B", "BRK-B", "FI", "WBA"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_interval() -> String {
    "1d".to_string()
}

// =============================================================================
// ScannerConfig
// =============================================================================

/// Top-level configuration for the Vigil scan engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    // --- Indicator windows & thresholds --------------------------------------

    /// RSI look-back window (Wilder smoothing).
    #[serde(default = "default_rsi_window")]
    pub rsi_window: usize,

    /// ATR look-back window (Wilder smoothing).
    #[serde(default = "default_atr_window")]
    pub atr_window: usize,

    /// RSI at or above this value classifies as OVERBOUGHT (inclusive).
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,

    /// RSI at or below this value classifies as OVERSOLD (inclusive).
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,

    /// Trailing bars examined for extreme-RSI hits.
    #[serde(default = "default_rsi_lookback_bars")]
    pub rsi_lookback_bars: usize,

    /// Trailing bars examined for the swing low/high of the overextension
    /// check (the current bar is excluded).
    #[serde(default = "default_overextended_lookback_bars")]
    pub overextended_lookback_bars: usize,

    /// ATR multiplier above the swing low that marks a symbol overextended.
    #[serde(default = "default_overextended_atr_multiplier")]
    pub overextended_atr_multiplier: f64,

    // --- Data window & freshness ---------------------------------------------

    /// Number of historical bars requested per symbol.
    #[serde(default = "default_hist_bars")]
    pub hist_bars: i64,

    /// Bar interval for the scan ("1d", "1h", "1m").
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Cached data older than this (by watermark) is considered stale.
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: i64,

    /// Bars and indicators older than this many days are deleted after a
    /// scan to keep the database size bounded.
    #[serde(default = "default_prune_after_days")]
    pub prune_after_days: i64,

    // --- Provider behaviour --------------------------------------------------

    /// Hard timeout per vendor fetch request.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Retry attempts for transient provider failures before a symbol is
    /// marked Failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between retries (doubled per attempt).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound on symbols being fetched/processed at once.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Base URL of the historical-bar vendor endpoint.
    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,

    // --- Universe ------------------------------------------------------------

    /// Source URL for the constituents CSV.
    #[serde(default = "default_universe_url")]
    pub universe_url: String,

    /// Tickers excluded from every scan.
    #[serde(default = "default_excluded_tickers")]
    pub excluded_tickers: HashSet<String>,

    // --- Paths ---------------------------------------------------------------

    /// SQLite database file for the bar cache.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Directory for CSV exports.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// File name of the full-results CSV inside `output_dir`.
    #[serde(default = "default_results_csv")]
    pub results_csv: String,

    /// File name of the alerts-only CSV inside `output_dir`.
    #[serde(default = "default_alerts_csv")]
    pub alerts_csv: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            rsi_window: default_rsi_window(),
            atr_window: default_atr_window(),
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
            rsi_lookback_bars: default_rsi_lookback_bars(),
            overextended_lookback_bars: default_overextended_lookback_bars(),
            overextended_atr_multiplier: default_overextended_atr_multiplier(),
            hist_bars: default_hist_bars(),
            interval: default_interval(),
            freshness_hours: default_freshness_hours(),
            prune_after_days: default_prune_after_days(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            provider_base_url: default_provider_base_url(),
            universe_url: default_universe_url(),
            excluded_tickers: default_excluded_tickers(),
            db_path: default_db_path(),
            output_dir: default_output_dir(),
            results_csv: default_results_csv(),
            alerts_csv: default_alerts_csv(),
        }
    }
}

impl ScannerConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scanner config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse scanner config from {}", path.display()))?;

        info!(
            path = %path.display(),
            rsi_window = config.rsi_window,
            atr_window = config.atr_window,
            hist_bars = config.hist_bars,
            "scanner config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise scanner config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "scanner config saved (atomic)");
        Ok(())
    }

    /// Validate invariants that cannot be expressed in the type system.
    /// Called once at startup; any violation is fatal.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.rsi_window == 0 || self.atr_window == 0 {
            return Err(ScanError::Configuration(
                "indicator windows must be >= 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.rsi_overbought)
            || !(0.0..=100.0).contains(&self.rsi_oversold)
        {
            return Err(ScanError::Configuration(
                "RSI thresholds must lie in [0, 100]".into(),
            ));
        }
        if self.rsi_oversold >= self.rsi_overbought {
            return Err(ScanError::Configuration(format!(
                "oversold threshold {} must be below overbought threshold {}",
                self.rsi_oversold, self.rsi_overbought
            )));
        }
        let max_window = self.rsi_window.max(self.atr_window) as i64;
        if self.hist_bars <= max_window {
            return Err(ScanError::Configuration(format!(
                "hist_bars {} must exceed the largest indicator window {}",
                self.hist_bars, max_window
            )));
        }
        if self.interval.parse::<crate::types::BarInterval>().is_err() {
            return Err(ScanError::Configuration(format!(
                "unknown bar interval '{}'",
                self.interval
            )));
        }
        if self.freshness_hours <= 0 {
            return Err(ScanError::Configuration(
                "freshness_hours must be positive".into(),
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ScanError::Configuration(
                "max_concurrent_fetches must be >= 1".into(),
            ));
        }
        if self.db_path.trim().is_empty() || self.output_dir.trim().is_empty() {
            return Err(ScanError::Configuration(
                "db_path and output_dir must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Parsed bar interval. Call only after `validate`.
    pub fn bar_interval(&self) -> crate::types::BarInterval {
        self.interval.parse().unwrap_or(crate::types::BarInterval::Day1)
    }

    /// Freshness threshold as a chrono duration.
    pub fn freshness_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.freshness_hours)
    }

    /// Per-request fetch timeout.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = ScannerConfig::default();
        assert_eq!(cfg.rsi_window, 14);
        assert_eq!(cfg.atr_window, 14);
        assert!((cfg.rsi_overbought - 90.0).abs() < f64::EPSILON);
        assert!((cfg.rsi_oversold - 10.0).abs() < f64::EPSILON);
        assert_eq!(cfg.hist_bars, 30);
        assert_eq!(cfg.interval, "1d");
        assert_eq!(cfg.freshness_hours, 24);
        assert_eq!(cfg.max_retries, 3);
        assert!(cfg.excluded_tickers.contains("BRK-B"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: ScannerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.rsi_window, 14);
        assert_eq!(cfg.max_concurrent_fetches, 8);
        assert_eq!(cfg.results_csv, "scan_results.csv");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "rsi_overbought": 80.0, "hist_bars": 60 }"#;
        let cfg: ScannerConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.rsi_overbought - 80.0).abs() < f64::EPSILON);
        assert_eq!(cfg.hist_bars, 60);
        assert_eq!(cfg.atr_window, 14);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = ScannerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: ScannerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.rsi_window, cfg2.rsi_window);
        assert_eq!(cfg.db_path, cfg2.db_path);
        assert_eq!(cfg.excluded_tickers, cfg2.excluded_tickers);
    }

    #[test]
    fn zero_window_is_rejected() {
        let mut cfg = ScannerConfig::default();
        cfg.rsi_window = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ScanError::Configuration(_))
        ));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut cfg = ScannerConfig::default();
        cfg.rsi_oversold = 95.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn short_history_is_rejected() {
        let mut cfg = ScannerConfig::default();
        cfg.hist_bars = 14; // equal to the window: still not enough
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_interval_is_rejected() {
        let mut cfg = ScannerConfig::default();
        cfg.interval = "3w".into();
        assert!(cfg.validate().is_err());
    }
}

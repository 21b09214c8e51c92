// =============================================================================
// Scan Orchestrator — per-symbol pipeline with bounded concurrency
// =============================================================================
//
// For each symbol in the universe:
//
//   PENDING -> FETCHING (when the resolver reports stale ranges)
//           -> MERGING  (bars written into the cache, atomic per entry)
//           -> COMPUTING
//           -> CLASSIFIED
//
// or straight PENDING -> COMPUTING -> CLASSIFIED when the cache is fresh.
// Any failure lands in FAILED: the outcome is recorded, the symbol is
// skipped, and the batch continues. The whole scan may be aborted between
// symbols via the abort flag; a merge in flight is never interrupted.
//
// One task per symbol means one writer per (symbol, interval) key, which
// preserves the cache ordering invariant without extra locking.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStore, StalenessResolver};
use crate::config::ScannerConfig;
use crate::error::ScanError;
use crate::indicators::{atr_series, check_overextended, check_rsi_extremes, rsi_series};
use crate::provider::MarketDataProvider;
use crate::types::{
    Bar, BarInterval, Classification, IndicatorResult, ScanRecord, ScanSummary, SymbolPhase,
    TimeRange,
};

/// Full output of one scan pass.
pub struct ScanOutcome {
    pub records: Vec<ScanRecord>,
    pub summary: ScanSummary,
}

pub struct ScanOrchestrator {
    config: ScannerConfig,
    interval: BarInterval,
    resolver: StalenessResolver,
    store: Arc<CacheStore>,
    provider: Arc<dyn MarketDataProvider>,
    abort: Arc<AtomicBool>,
}

impl ScanOrchestrator {
    pub fn new(
        config: ScannerConfig,
        store: Arc<CacheStore>,
        provider: Arc<dyn MarketDataProvider>,
    ) -> Self {
        let interval = config.bar_interval();
        let resolver = StalenessResolver::new(interval, config.freshness_threshold());
        Self {
            config,
            interval,
            resolver,
            store,
            provider,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for cooperative abort. Setting it stops the scan between
    /// symbols; symbols already in flight run to completion.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    // -------------------------------------------------------------------------
    // Scan pass
    // -------------------------------------------------------------------------

    /// Run one full scan over `symbols` with bounded concurrency.
    pub async fn run(&self, symbols: &[String]) -> ScanOutcome {
        let scan_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let now = Utc::now();

        info!(
            scan_id = %scan_id,
            symbols = symbols.len(),
            interval = %self.interval,
            concurrency = self.config.max_concurrent_fetches,
            "scan started"
        );

        let records: Vec<ScanRecord> = stream::iter(
            symbols
                .iter()
                .map(|symbol| self.scan_symbol(symbol, &scan_id, now)),
        )
        .buffer_unordered(self.config.max_concurrent_fetches)
        .filter_map(|maybe| async move { maybe })
        .collect()
        .await;

        let aborted = self.abort.load(Ordering::Relaxed);
        let summary = self.summarise(&scan_id, symbols.len(), &records, started, aborted);
        self.log_summary(&summary, &records);

        ScanOutcome { records, summary }
    }

    /// Process one symbol end to end. Returns `None` when the scan was
    /// aborted before this symbol started; failures are folded into the
    /// returned record, never propagated.
    async fn scan_symbol(
        &self,
        symbol: &str,
        scan_id: &str,
        now: DateTime<Utc>,
    ) -> Option<ScanRecord> {
        if self.abort.load(Ordering::Relaxed) {
            debug!(symbol, "scan aborted — symbol not started");
            return None;
        }

        let mut phase = SymbolPhase::Pending;
        let mut cached = false;

        let record = match self
            .process_symbol(symbol, scan_id, now, &mut phase, &mut cached)
            .await
        {
            Ok(record) => record,
            Err(err) => {
                let status = match &err {
                    ScanError::InsufficientData { .. } => "insufficient_data".to_string(),
                    other => format!("error:{other}"),
                };
                if !matches!(err, ScanError::InsufficientData { .. }) {
                    warn!(symbol, error = %err, phase = %phase, "symbol failed");
                }
                let record = ScanRecord {
                    scan_id: scan_id.to_string(),
                    symbol: symbol.to_string(),
                    scanned_at: Utc::now(),
                    phase: SymbolPhase::Failed,
                    classification: None,
                    rsi: None,
                    atr: None,
                    max_rsi: None,
                    min_rsi: None,
                    hit_high: false,
                    hit_low: false,
                    overextension: None,
                    current_price: None,
                    data_points: 0,
                    cached,
                    status,
                };
                // Failures are audit-worthy too; a second failure here only
                // costs the persisted row, not the in-memory record.
                if let Err(e) = self.store.save_scan_record(&record).await {
                    warn!(symbol, error = %e, "failed to persist failure record");
                }
                record
            }
        };

        Some(record)
    }

    async fn process_symbol(
        &self,
        symbol: &str,
        scan_id: &str,
        now: DateTime<Utc>,
        phase: &mut SymbolPhase,
        cached: &mut bool,
    ) -> Result<ScanRecord, ScanError> {
        let requested = TimeRange::trailing(self.interval, self.config.hist_bars, now);

        // ── Resolve what must be fetched ─────────────────────────────────
        let coverage = self.store.coverage(symbol, self.interval).await?;
        let plan = self.resolver.resolve(requested, coverage.as_ref(), now);

        // "Cached" means the vendor owes us nothing beyond the provisional
        // open bar.
        let open_bar = self.interval.open_bar_start(now);
        *cached = plan.iter().all(|r| r.start >= open_bar);

        // ── Fetch + merge stale ranges ───────────────────────────────────
        for range in &plan {
            *phase = SymbolPhase::Fetching;
            let bars = self.fetch_with_retry(symbol, *range).await?;

            if bars.is_empty() {
                // Market closure inside the range; nothing to merge.
                debug!(symbol, range = %range, "vendor returned no bars for range");
                continue;
            }

            *phase = SymbolPhase::Merging;
            self.store.put(symbol, self.interval, &bars).await?;
        }

        // ── Compute indicators ───────────────────────────────────────────
        *phase = SymbolPhase::Computing;

        let entry = self.store.get(symbol, self.interval, requested).await?;
        let bars: Vec<Bar> = entry.map(|e| e.bars).unwrap_or_default();

        let need = self.config.rsi_window.max(self.config.atr_window) + 1;
        if bars.len() < need {
            return Err(ScanError::InsufficientData {
                have: bars.len(),
                need,
            });
        }

        let rsi = rsi_series(&bars, self.config.rsi_window)?;
        let atr = atr_series(&bars, self.config.atr_window)?;

        let latest_rsi = *rsi.last().ok_or(ScanError::InsufficientData {
            have: bars.len(),
            need,
        })?;
        let latest_atr = *atr.last().ok_or(ScanError::InsufficientData {
            have: bars.len(),
            need,
        })?;

        // Persist derived values for inspection; the bar series stays the
        // single source of truth.
        let offset = self.config.rsi_window.max(self.config.atr_window);
        let points: Vec<IndicatorResult> = (offset..bars.len())
            .map(|i| IndicatorResult {
                timestamp: bars[i].timestamp,
                rsi: rsi[i - self.config.rsi_window],
                atr: atr[i - self.config.atr_window],
            })
            .collect();
        self.store
            .save_indicators(symbol, self.interval, &points)
            .await?;

        // ── Classify ─────────────────────────────────────────────────────
        let extremes = check_rsi_extremes(
            &rsi,
            self.config.rsi_lookback_bars,
            self.config.rsi_overbought,
            self.config.rsi_oversold,
        );
        let overextension = check_overextended(
            &bars,
            latest_atr,
            self.config.overextended_lookback_bars,
            self.config.overextended_atr_multiplier,
        );
        let classification = Classification::from_rsi(
            latest_rsi,
            self.config.rsi_overbought,
            self.config.rsi_oversold,
        );

        let hit_high = extremes.map(|e| e.hit_high).unwrap_or(false);
        let hit_low = extremes.map(|e| e.hit_low).unwrap_or(false);
        let is_overextended = overextension.map(|o| o.is_overextended).unwrap_or(false);

        let mut status_parts: Vec<String> = Vec::new();
        if hit_high {
            status_parts.push(format!("RSI>={:.0}", self.config.rsi_overbought));
        }
        if hit_low {
            status_parts.push(format!("RSI<={:.0}", self.config.rsi_oversold));
        }
        if is_overextended {
            status_parts.push("overextended".to_string());
        }
        let status = if status_parts.is_empty() {
            "no_hit".to_string()
        } else {
            status_parts.join(";")
        };

        *phase = SymbolPhase::Classified;

        let record = ScanRecord {
            scan_id: scan_id.to_string(),
            symbol: symbol.to_string(),
            scanned_at: Utc::now(),
            phase: SymbolPhase::Classified,
            classification: Some(classification),
            rsi: Some(latest_rsi),
            atr: Some(latest_atr),
            max_rsi: extremes.map(|e| e.max_rsi),
            min_rsi: extremes.map(|e| e.min_rsi),
            hit_high,
            hit_low,
            overextension,
            current_price: bars.last().map(|b| b.close),
            data_points: bars.len(),
            cached: *cached,
            status,
        };

        self.store.save_scan_record(&record).await?;

        debug!(
            symbol,
            rsi = latest_rsi,
            atr = latest_atr,
            classification = %classification,
            cached = *cached,
            "symbol classified"
        );

        Ok(record)
    }

    /// Fetch one range with a hard timeout per attempt and exponential
    /// backoff between attempts. Non-transient errors are returned
    /// immediately; transient ones are retried up to `max_retries` times.
    async fn fetch_with_retry(
        &self,
        symbol: &str,
        range: TimeRange,
    ) -> Result<Vec<Bar>, ScanError> {
        let mut last_err = ScanError::Provider("no fetch attempted".into());

        for attempt in 0..=self.config.max_retries {
            let fetch = self.provider.fetch_bars(symbol, self.interval, range);
            let outcome = tokio::time::timeout(self.config.fetch_timeout(), fetch).await;

            match outcome {
                Ok(Ok(bars)) => return Ok(bars),
                Ok(Err(err)) => {
                    if !err.is_transient() {
                        return Err(err);
                    }
                    last_err = err;
                }
                Err(_elapsed) => {
                    last_err = ScanError::Provider(format!(
                        "fetch timed out after {:?} for {symbol} {range}",
                        self.config.fetch_timeout()
                    ));
                }
            }

            if attempt < self.config.max_retries {
                let backoff = self.config.retry_backoff_ms * (1u64 << attempt);
                debug!(
                    symbol,
                    attempt = attempt + 1,
                    backoff_ms = backoff,
                    error = %last_err,
                    "transient fetch failure — retrying"
                );
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }
        }

        Err(last_err)
    }

    // -------------------------------------------------------------------------
    // Summary
    // -------------------------------------------------------------------------

    fn summarise(
        &self,
        scan_id: &str,
        total: usize,
        records: &[ScanRecord],
        started: Instant,
        aborted: bool,
    ) -> ScanSummary {
        let classified = records.iter().filter(|r| r.classification.is_some()).count();
        let insufficient = records
            .iter()
            .filter(|r| r.status == "insufficient_data")
            .count();
        let failed = records
            .iter()
            .filter(|r| r.phase == SymbolPhase::Failed && r.status != "insufficient_data")
            .count();
        let alerts = records.iter().filter(|r| r.is_alert()).count();
        let cache_hits = records.iter().filter(|r| r.cached).count();

        ScanSummary {
            scan_id: scan_id.to_string(),
            total,
            classified,
            insufficient,
            failed,
            alerts,
            cache_hits,
            duration_secs: started.elapsed().as_secs_f64(),
            aborted,
        }
    }

    fn log_summary(&self, summary: &ScanSummary, records: &[ScanRecord]) {
        info!(
            scan_id = %summary.scan_id,
            total = summary.total,
            classified = summary.classified,
            insufficient = summary.insufficient,
            failed = summary.failed,
            alerts = summary.alerts,
            cache_hit_rate = format!("{:.1}%", summary.cache_hit_rate()),
            duration_secs = format!("{:.1}", summary.duration_secs),
            aborted = summary.aborted,
            "scan finished"
        );

        for record in records.iter().filter(|r| r.is_alert()) {
            info!(
                symbol = %record.symbol,
                rsi = record.rsi.unwrap_or(f64::NAN),
                atr = record.atr.unwrap_or(f64::NAN),
                status = %record.status,
                "alert"
            );
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;

    /// Provider fed from a fixture map; counts calls and can be told to fail
    /// for specific symbols.
    struct MockProvider {
        bars: HashMap<String, Vec<Bar>>,
        failing: HashSet<String>,
        calls: AtomicUsize,
        requested_ranges: Mutex<Vec<(String, TimeRange)>>,
    }

    impl MockProvider {
        fn new(bars: HashMap<String, Vec<Bar>>, failing: &[&str]) -> Self {
            Self {
                bars,
                failing: failing.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
                requested_ranges: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl MarketDataProvider for MockProvider {
        async fn fetch_bars(
            &self,
            symbol: &str,
            _interval: BarInterval,
            range: TimeRange,
        ) -> Result<Vec<Bar>, ScanError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.requested_ranges
                .lock()
                .push((symbol.to_string(), range));

            if self.failing.contains(symbol) {
                return Err(ScanError::Provider("simulated outage".into()));
            }

            Ok(self
                .bars
                .get(symbol)
                .map(|bars| {
                    bars.iter()
                        .filter(|b| range.contains(b.timestamp))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    /// `n` daily bars ending at the open bar for `now`, closes from `f`.
    fn daily_series(symbol: &str, n: usize, now: DateTime<Utc>, f: impl Fn(usize) -> f64) -> Vec<Bar> {
        let end = BarInterval::Day1.truncate(now);
        (0..n)
            .map(|i| {
                let close = f(i);
                Bar {
                    symbol: symbol.to_string(),
                    timestamp: end - chrono::Duration::days((n - 1 - i) as i64),
                    open: close - 0.5,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 1_000,
                }
            })
            .collect()
    }

    fn test_config() -> ScannerConfig {
        let mut cfg = ScannerConfig::default();
        cfg.max_retries = 0;
        cfg.retry_backoff_ms = 1;
        cfg.max_concurrent_fetches = 4;
        cfg
    }

    fn orchestrator(
        cfg: ScannerConfig,
        store: Arc<CacheStore>,
        provider: Arc<MockProvider>,
    ) -> ScanOrchestrator {
        ScanOrchestrator::new(cfg, store, provider)
    }

    #[tokio::test]
    async fn provider_failure_does_not_abort_batch() {
        let now = Utc::now();
        let mut fixtures = HashMap::new();
        fixtures.insert("GOOD".to_string(), daily_series("GOOD", 45, now, |i| 100.0 + i as f64));

        let store = Arc::new(CacheStore::open_in_memory().await.unwrap());
        let provider = Arc::new(MockProvider::new(fixtures, &["BAD"]));
        let orch = orchestrator(test_config(), store, provider);

        let outcome = orch
            .run(&["BAD".to_string(), "GOOD".to_string()])
            .await;

        assert_eq!(outcome.summary.total, 2);
        assert_eq!(outcome.summary.classified, 1);
        assert_eq!(outcome.summary.failed, 1);

        let bad = outcome.records.iter().find(|r| r.symbol == "BAD").unwrap();
        assert_eq!(bad.phase, SymbolPhase::Failed);
        assert!(bad.status.starts_with("error:"));
        assert!(bad.classification.is_none());

        let good = outcome.records.iter().find(|r| r.symbol == "GOOD").unwrap();
        assert_eq!(good.phase, SymbolPhase::Classified);
        assert!(good.classification.is_some());
    }

    #[tokio::test]
    async fn rising_closes_classify_overbought_with_inclusive_threshold() {
        let now = Utc::now();
        let mut fixtures = HashMap::new();
        // Strictly rising closes: RSI = 100 >= 90.
        fixtures.insert("UP".to_string(), daily_series("UP", 45, now, |i| 100.0 + i as f64));

        let store = Arc::new(CacheStore::open_in_memory().await.unwrap());
        let provider = Arc::new(MockProvider::new(fixtures, &[]));
        let orch = orchestrator(test_config(), store, provider);

        let outcome = orch.run(&["UP".to_string()]).await;
        let rec = &outcome.records[0];
        assert_eq!(rec.classification, Some(Classification::Overbought));
        assert!(rec.hit_high);
        assert!(!rec.hit_low);
        assert!(rec.status.contains("RSI>=90"));
        assert!(rec.rsi.unwrap() >= 90.0);
    }

    #[tokio::test]
    async fn fully_cached_symbol_only_refreshes_open_bar() {
        let now = Utc::now();
        let bars = daily_series("HOT", 45, now, |i| 100.0 + (i % 3) as f64);

        let store = Arc::new(CacheStore::open_in_memory().await.unwrap());
        store.put("HOT", BarInterval::Day1, &bars).await.unwrap();

        let mut fixtures = HashMap::new();
        fixtures.insert("HOT".to_string(), bars);
        let provider = Arc::new(MockProvider::new(fixtures, &[]));
        let orch = orchestrator(test_config(), store, provider.clone());

        let outcome = orch.run(&["HOT".to_string()]).await;
        let rec = &outcome.records[0];

        assert_eq!(rec.phase, SymbolPhase::Classified);
        assert!(rec.cached, "symbol should count as served from cache");
        assert_eq!(outcome.summary.cache_hits, 1);

        // Exactly one vendor call, and only for the provisional open bar.
        assert_eq!(provider.call_count(), 1);
        let ranges = provider.requested_ranges.lock();
        let open = BarInterval::Day1.truncate(now);
        assert_eq!(ranges[0].1, TimeRange::new(open, open));
    }

    #[tokio::test]
    async fn cold_symbol_fetches_whole_range_then_classifies() {
        let now = Utc::now();
        let mut fixtures = HashMap::new();
        fixtures.insert("COLD".to_string(), daily_series("COLD", 45, now, |i| 50.0 + i as f64));

        let store = Arc::new(CacheStore::open_in_memory().await.unwrap());
        let provider = Arc::new(MockProvider::new(fixtures, &[]));
        let orch = orchestrator(test_config(), store.clone(), provider.clone());

        let outcome = orch.run(&["COLD".to_string()]).await;
        let rec = &outcome.records[0];

        assert!(!rec.cached);
        assert_eq!(rec.phase, SymbolPhase::Classified);
        assert_eq!(provider.call_count(), 1);

        // The merge is persisted: coverage now spans the requested range.
        let cov = store.coverage("COLD", BarInterval::Day1).await.unwrap().unwrap();
        assert_eq!(cov.last_bar, BarInterval::Day1.truncate(now));
    }

    #[tokio::test]
    async fn short_history_is_reported_as_insufficient() {
        let now = Utc::now();
        let mut fixtures = HashMap::new();
        // Only 5 bars: far below window + 1.
        fixtures.insert("THIN".to_string(), daily_series("THIN", 5, now, |_| 100.0));

        let store = Arc::new(CacheStore::open_in_memory().await.unwrap());
        let provider = Arc::new(MockProvider::new(fixtures, &[]));
        let orch = orchestrator(test_config(), store, provider);

        let outcome = orch.run(&["THIN".to_string()]).await;
        let rec = &outcome.records[0];
        assert_eq!(rec.status, "insufficient_data");
        assert!(rec.classification.is_none());
        assert_eq!(outcome.summary.insufficient, 1);
        assert_eq!(outcome.summary.failed, 0);
    }

    #[tokio::test]
    async fn abort_before_run_produces_no_records() {
        let store = Arc::new(CacheStore::open_in_memory().await.unwrap());
        let provider = Arc::new(MockProvider::new(HashMap::new(), &[]));
        let orch = orchestrator(test_config(), store, provider.clone());

        orch.abort_handle().store(true, Ordering::Relaxed);
        let outcome = orch.run(&["A".to_string(), "B".to_string()]).await;

        assert!(outcome.records.is_empty());
        assert!(outcome.summary.aborted);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn scan_records_are_persisted_for_failures_too() {
        let store = Arc::new(CacheStore::open_in_memory().await.unwrap());
        let provider = Arc::new(MockProvider::new(HashMap::new(), &["BAD"]));
        let orch = orchestrator(test_config(), store.clone(), provider);

        orch.run(&["BAD".to_string()]).await;

        let history = store.scan_history(1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].phase, "FAILED");
    }
}

// =============================================================================
// Vigil Scan — Main Entry Point
// =============================================================================
//
// One invocation = one scan pass: load the ticker universe, refresh the
// local bar cache for anything stale, compute RSI/ATR, classify, export
// CSVs, prune old cache rows, exit. Ctrl-C aborts between symbols; a
// cache merge in flight always completes first.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod cache;
mod config;
mod error;
mod export;
mod indicators;
mod provider;
mod scanner;
mod types;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cache::CacheStore;
use crate::config::ScannerConfig;
use crate::export::CsvExporter;
use crate::provider::{ConstituentsUniverse, HttpMarketDataProvider, UniverseProvider};
use crate::scanner::ScanOrchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Vigil Scan — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("VIGIL_CONFIG").unwrap_or_else(|_| "scanner_config.json".to_string());
    let config = ScannerConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "Failed to load config, using defaults");
        let defaults = ScannerConfig::default();
        // Seed the file so the next run starts from something editable.
        if let Err(e) = defaults.save(&config_path) {
            warn!(error = %e, path = %config_path, "Could not write default config");
        }
        defaults
    });
    config.validate().context("invalid scanner configuration")?;

    info!(
        interval = %config.interval,
        rsi_window = config.rsi_window,
        atr_window = config.atr_window,
        thresholds = format!("{}/{}", config.rsi_overbought, config.rsi_oversold),
        hist_bars = config.hist_bars,
        "Scanner configured"
    );

    // ── 2. Open the bar cache ────────────────────────────────────────────
    let store = Arc::new(
        CacheStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open cache database at {}", config.db_path))?,
    );

    // ── 3. Resolve the ticker universe ───────────────────────────────────
    // Env override first, then the published constituents list.
    let symbols: Vec<String> = match std::env::var("VIGIL_SYMBOLS") {
        Ok(raw) => {
            let list: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            info!(symbols = list.len(), "Universe overridden from environment");
            list
        }
        Err(_) => {
            let universe = ConstituentsUniverse::new(
                config.universe_url.clone(),
                config.excluded_tickers.clone(),
                config.fetch_timeout(),
            )?;
            universe
                .list_symbols()
                .await
                .context("failed to load ticker universe")?
        }
    };

    if symbols.is_empty() {
        anyhow::bail!("ticker universe is empty — nothing to scan");
    }
    info!(symbols = symbols.len(), "Universe loaded");

    // ── 4. Build the scan pipeline ───────────────────────────────────────
    let provider = Arc::new(HttpMarketDataProvider::new(
        config.provider_base_url.clone(),
        config.fetch_timeout(),
    )?);

    let output_dir = config.output_dir.clone();
    let results_csv = config.results_csv.clone();
    let alerts_csv = config.alerts_csv.clone();
    let prune_after_days = config.prune_after_days;

    let orchestrator = ScanOrchestrator::new(config, store.clone(), provider);

    // Ctrl-C aborts between symbols; in-flight merges always complete.
    let abort = orchestrator.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received — aborting scan after in-flight symbols");
            abort.store(true, Ordering::Relaxed);
        }
    });

    // ── 5. Scan ──────────────────────────────────────────────────────────
    let outcome = orchestrator.run(&symbols).await;

    // ── 6. Export ────────────────────────────────────────────────────────
    let exporter = CsvExporter::new(&output_dir);
    let results_path = exporter.write_results(&results_csv, &outcome.records)?;
    let alerts_path = exporter.write_alerts(&alerts_csv, &outcome.records)?;
    info!(
        results = %results_path.display(),
        alerts = %alerts_path.display(),
        "Exports written"
    );

    // ── 7. Prune & report ────────────────────────────────────────────────
    let cutoff = chrono::Utc::now() - chrono::Duration::days(prune_after_days);
    match store.prune_older_than(cutoff).await {
        Ok(removed) if removed > 0 => info!(removed, "Pruned old cache rows"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Cache prune failed"),
    }

    let stats = store.stats().await?;
    info!(
        bar_rows = stats.bar_rows,
        indicator_rows = stats.indicator_rows,
        scan_rows = stats.scan_record_rows,
        symbols = stats.distinct_symbols,
        "Cache stats"
    );

    if outcome.summary.aborted {
        warn!("Scan aborted before completion");
    }

    Ok(())
}

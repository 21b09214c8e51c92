// =============================================================================
// Cache Store — SQLite persistence for bars, indicators, and scan records
// =============================================================================
//
// One database file holds four tables:
//   bars          — OHLCV history, PK (symbol, interval, ts)
//   indicators    — derived RSI/ATR per bar, recomputed on demand
//   scan_records  — append-only audit trail of scan outcomes
//   cache_meta    — per-key watermark: last merge time, last bar, row count
//
// `put` is the only mutation path for bars. It validates every bar before
// touching the database and applies the whole merge inside one transaction,
// so an entry is never partially written. Bars re-sent with an existing
// timestamp overwrite the stored row (vendor corrections win).
// =============================================================================

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::cache::{CacheEntry, Coverage};
use crate::error::ScanError;
use crate::types::{Bar, BarInterval, IndicatorResult, ScanRecord, TimeRange};

/// Row counts and date coverage for the whole database.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub bar_rows: i64,
    pub indicator_rows: i64,
    pub scan_record_rows: i64,
    pub distinct_symbols: i64,
    pub earliest_bar: Option<DateTime<Utc>>,
    pub latest_bar: Option<DateTime<Utc>>,
}

/// One row of the scan-record audit trail, as read back from the database.
#[derive(Debug, Clone)]
pub struct ScanHistoryRow {
    pub scan_id: String,
    pub symbol: String,
    pub scanned_at: DateTime<Utc>,
    pub phase: String,
    pub classification: Option<String>,
    pub rsi: Option<f64>,
    pub atr: Option<f64>,
    pub hit_high: bool,
    pub hit_low: bool,
    pub is_overextended: bool,
    pub current_price: Option<f64>,
    pub status: String,
}

/// SQLite-backed bar cache. Safe for concurrent use across tasks; the pool
/// serialises writers at the SQLite level, and the orchestrator additionally
/// guarantees a single in-flight `put` per (symbol, interval).
pub struct CacheStore {
    pool: SqlitePool,
}

impl CacheStore {
    /// Open (or create) the database at `path` and run the schema DDL.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| ScanError::Store(format!("create {}: {e}", dir.display())))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let store = Self { pool };
        store.create_tables().await?;
        info!(path = %path.display(), "bar cache opened");
        Ok(store)
    }

    /// In-memory database for tests. A single connection keeps the schema
    /// alive for the pool's lifetime.
    pub async fn open_in_memory() -> Result<Self, ScanError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> Result<(), ScanError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bars (
                symbol   TEXT NOT NULL,
                interval TEXT NOT NULL,
                ts       DATETIME NOT NULL,
                open     REAL NOT NULL,
                high     REAL NOT NULL,
                low      REAL NOT NULL,
                close    REAL NOT NULL,
                volume   INTEGER NOT NULL,
                PRIMARY KEY (symbol, interval, ts)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indicators (
                symbol   TEXT NOT NULL,
                interval TEXT NOT NULL,
                ts       DATETIME NOT NULL,
                rsi      REAL,
                atr      REAL,
                created_at DATETIME NOT NULL,
                PRIMARY KEY (symbol, interval, ts)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_id    TEXT NOT NULL,
                symbol     TEXT NOT NULL,
                scanned_at DATETIME NOT NULL,
                phase      TEXT NOT NULL,
                classification TEXT,
                rsi        REAL,
                atr        REAL,
                max_rsi    REAL,
                min_rsi    REAL,
                hit_high   INTEGER NOT NULL,
                hit_low    INTEGER NOT NULL,
                is_overextended INTEGER NOT NULL DEFAULT 0,
                swing_low  REAL,
                overextended_threshold REAL,
                current_price REAL,
                data_points INTEGER NOT NULL,
                cached     INTEGER NOT NULL,
                status     TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_meta (
                symbol       TEXT NOT NULL,
                interval     TEXT NOT NULL,
                last_updated DATETIME NOT NULL,
                last_bar     DATETIME,
                record_count INTEGER NOT NULL,
                PRIMARY KEY (symbol, interval)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bars_ts ON bars(ts)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scan_records_scanned_at ON scan_records(scanned_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bar series
    // -------------------------------------------------------------------------

    /// Return stored bars overlapping `range`, ascending by timestamp.
    /// Never fetches remotely. `None` when nothing overlaps.
    pub async fn get(
        &self,
        symbol: &str,
        interval: BarInterval,
        range: TimeRange,
    ) -> Result<Option<CacheEntry>, ScanError> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, f64, f64, f64, f64, i64)>(
            r#"
            SELECT ts, open, high, low, close, volume
            FROM bars
            WHERE symbol = ? AND interval = ? AND ts >= ? AND ts <= ?
            ORDER BY ts ASC
            "#,
        )
        .bind(symbol)
        .bind(interval.as_str())
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let bars: Vec<Bar> = rows
            .into_iter()
            .map(|(ts, open, high, low, close, volume)| Bar {
                symbol: symbol.to_string(),
                timestamp: ts,
                open,
                high,
                low,
                close,
                volume,
            })
            .collect();

        let last_updated = self
            .last_updated(symbol, interval)
            .await?
            .unwrap_or_else(|| bars.last().map(|b| b.timestamp).unwrap_or_else(Utc::now));

        Ok(Some(CacheEntry {
            symbol: symbol.to_string(),
            interval,
            bars,
            last_updated,
        }))
    }

    /// Merge `bars` into the entry for (symbol, interval).
    ///
    /// Validation happens before any write; a malformed bar rejects the whole
    /// call (nothing is partially applied). Existing timestamps are
    /// overwritten — a re-sent bar is assumed to be a correction.
    ///
    /// Returns the number of bars merged.
    pub async fn put(
        &self,
        symbol: &str,
        interval: BarInterval,
        bars: &[Bar],
    ) -> Result<usize, ScanError> {
        Self::validate_bars(symbol, interval, bars)?;
        if bars.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        for bar in bars {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO bars (symbol, interval, ts, open, high, low, close, volume)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(symbol)
            .bind(interval.as_str())
            .bind(bar.timestamp)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cache_meta (symbol, interval, last_updated, last_bar, record_count)
            VALUES (
                ?, ?, ?,
                (SELECT MAX(ts) FROM bars WHERE symbol = ? AND interval = ?),
                (SELECT COUNT(*) FROM bars WHERE symbol = ? AND interval = ?)
            )
            "#,
        )
        .bind(symbol)
        .bind(interval.as_str())
        .bind(Utc::now())
        .bind(symbol)
        .bind(interval.as_str())
        .bind(symbol)
        .bind(interval.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(symbol, interval = %interval, merged = bars.len(), "bars merged into cache");
        Ok(bars.len())
    }

    /// Reject malformed bars up front so `put` never partially applies.
    fn validate_bars(
        symbol: &str,
        interval: BarInterval,
        bars: &[Bar],
    ) -> Result<(), ScanError> {
        for bar in bars {
            if bar.symbol != symbol {
                return Err(ScanError::Validation(format!(
                    "bar symbol '{}' does not match series '{symbol}'",
                    bar.symbol
                )));
            }
            if !interval.is_aligned(bar.timestamp) {
                return Err(ScanError::Validation(format!(
                    "bar timestamp {} is not aligned to interval {interval}",
                    bar.timestamp.to_rfc3339()
                )));
            }
            let prices = [bar.open, bar.high, bar.low, bar.close];
            if prices.iter().any(|p| !p.is_finite()) {
                return Err(ScanError::Validation(format!(
                    "non-finite price in bar at {}",
                    bar.timestamp.to_rfc3339()
                )));
            }
            if bar.high < bar.low {
                return Err(ScanError::Validation(format!(
                    "high {} below low {} at {}",
                    bar.high,
                    bar.low,
                    bar.timestamp.to_rfc3339()
                )));
            }
            if bar.volume < 0 {
                return Err(ScanError::Validation(format!(
                    "negative volume at {}",
                    bar.timestamp.to_rfc3339()
                )));
            }
        }
        Ok(())
    }

    /// Watermark of the last merge for a key, if any.
    pub async fn last_updated(
        &self,
        symbol: &str,
        interval: BarInterval,
    ) -> Result<Option<DateTime<Utc>>, ScanError> {
        let row = sqlx::query_as::<_, (DateTime<Utc>,)>(
            "SELECT last_updated FROM cache_meta WHERE symbol = ? AND interval = ?",
        )
        .bind(symbol)
        .bind(interval.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    /// Coverage summary for the staleness resolver: first/last cached bar and
    /// the merge watermark. `None` when the key has no bars at all.
    pub async fn coverage(
        &self,
        symbol: &str,
        interval: BarInterval,
    ) -> Result<Option<Coverage>, ScanError> {
        let row = sqlx::query_as::<_, (Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(
            "SELECT MIN(ts), MAX(ts) FROM bars WHERE symbol = ? AND interval = ?",
        )
        .bind(symbol)
        .bind(interval.as_str())
        .fetch_one(&self.pool)
        .await?;

        let (first, last) = match row {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(None),
        };

        let last_updated = self.last_updated(symbol, interval).await?.unwrap_or(last);

        Ok(Some(Coverage {
            first_bar: first,
            last_bar: last,
            last_updated,
        }))
    }

    // -------------------------------------------------------------------------
    // Indicators
    // -------------------------------------------------------------------------

    /// Upsert derived indicator rows for a symbol. Purely informational;
    /// computations always start from the bar series.
    pub async fn save_indicators(
        &self,
        symbol: &str,
        interval: BarInterval,
        points: &[IndicatorResult],
    ) -> Result<(), ScanError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for p in points {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO indicators (symbol, interval, ts, rsi, atr, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(symbol)
            .bind(interval.as_str())
            .bind(p.timestamp)
            .bind(p.rsi)
            .bind(p.atr)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Scan records
    // -------------------------------------------------------------------------

    /// Append one scan outcome to the audit trail.
    pub async fn save_scan_record(&self, record: &ScanRecord) -> Result<(), ScanError> {
        let over = record.overextension;
        sqlx::query(
            r#"
            INSERT INTO scan_records
                (scan_id, symbol, scanned_at, phase, classification, rsi, atr,
                 max_rsi, min_rsi, hit_high, hit_low, is_overextended,
                 swing_low, overextended_threshold, current_price,
                 data_points, cached, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.scan_id)
        .bind(&record.symbol)
        .bind(record.scanned_at)
        .bind(record.phase.to_string())
        .bind(record.classification.map(|c| c.to_string()))
        .bind(record.rsi)
        .bind(record.atr)
        .bind(record.max_rsi)
        .bind(record.min_rsi)
        .bind(record.hit_high)
        .bind(record.hit_low)
        .bind(over.map(|o| o.is_overextended).unwrap_or(false))
        .bind(over.map(|o| o.swing_low))
        .bind(over.map(|o| o.threshold))
        .bind(record.current_price)
        .bind(record.data_points as i64)
        .bind(record.cached)
        .bind(&record.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Scan records from the trailing `days`, newest first.
    pub async fn scan_history(&self, days: i64) -> Result<Vec<ScanHistoryRow>, ScanError> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let rows = sqlx::query_as::<
            _,
            (
                String,
                String,
                DateTime<Utc>,
                String,
                Option<String>,
                Option<f64>,
                Option<f64>,
                bool,
                bool,
                bool,
                Option<f64>,
                String,
            ),
        >(
            r#"
            SELECT scan_id, symbol, scanned_at, phase, classification, rsi, atr,
                   hit_high, hit_low, is_overextended, current_price, status
            FROM scan_records
            WHERE scanned_at >= ?
            ORDER BY scanned_at DESC, symbol ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    scan_id,
                    symbol,
                    scanned_at,
                    phase,
                    classification,
                    rsi,
                    atr,
                    hit_high,
                    hit_low,
                    is_overextended,
                    current_price,
                    status,
                )| ScanHistoryRow {
                    scan_id,
                    symbol,
                    scanned_at,
                    phase,
                    classification,
                    rsi,
                    atr,
                    hit_high,
                    hit_low,
                    is_overextended,
                    current_price,
                    status,
                },
            )
            .collect())
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Delete bars and indicators older than `cutoff`, then drop watermark
    /// rows whose series no longer exist. Returns the number of bar rows
    /// removed.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, ScanError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM bars WHERE ts < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM indicators WHERE ts < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            DELETE FROM cache_meta
            WHERE NOT EXISTS (
                SELECT 1 FROM bars
                WHERE bars.symbol = cache_meta.symbol
                  AND bars.interval = cache_meta.interval
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if deleted > 0 {
            info!(deleted, cutoff = %cutoff.to_rfc3339(), "old cache rows pruned");
        }
        Ok(deleted)
    }

    /// Row counts and bar-date coverage across the whole database.
    pub async fn stats(&self) -> Result<CacheStats, ScanError> {
        let (bar_rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bars")
            .fetch_one(&self.pool)
            .await?;
        let (indicator_rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM indicators")
            .fetch_one(&self.pool)
            .await?;
        let (scan_record_rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scan_records")
            .fetch_one(&self.pool)
            .await?;
        let (distinct_symbols,): (i64,) =
            sqlx::query_as("SELECT COUNT(DISTINCT symbol) FROM bars")
                .fetch_one(&self.pool)
                .await?;
        let (earliest_bar, latest_bar): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT MIN(ts), MAX(ts) FROM bars")
                .fetch_one(&self.pool)
                .await?;

        Ok(CacheStats {
            bar_rows,
            indicator_rows,
            scan_record_rows,
            distinct_symbols,
            earliest_bar,
            latest_bar,
        })
    }
}

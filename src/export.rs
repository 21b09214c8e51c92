// =============================================================================
// CSV Export — scan results and alert shortlist
// =============================================================================
//
// Two files per scan, written under the configured output directory:
//
//   scan_results.csv — every record from the pass, including failures
//   rsi_alerts.csv   — only symbols whose classification or overextension
//                      warrants a look
//
// Files are written whole via a temp file + rename so a crash mid-export
// never leaves a half-written CSV behind. Floats are emitted with fixed
// precision; missing values become empty fields, not "NaN".
// =============================================================================

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::types::ScanRecord;

const RESULTS_HEADER: &str = "scan_id,symbol,scanned_at,phase,classification,rsi,atr,\
max_rsi,min_rsi,hit_high,hit_low,overextended,swing_low,overextension_threshold,\
current_price,distance_pct,proximity_pct,data_points,cached,status";

const ALERTS_HEADER: &str =
    "symbol,scanned_at,classification,rsi,atr,max_rsi,min_rsi,current_price,status";

pub struct CsvExporter {
    output_dir: PathBuf,
}

impl CsvExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Write the full result set. Returns the path written.
    pub fn write_results(&self, file_name: &str, records: &[ScanRecord]) -> Result<PathBuf> {
        let mut lines = Vec::with_capacity(records.len() + 1);
        lines.push(RESULTS_HEADER.to_string());

        for r in records {
            let over = r.overextension;
            lines.push(
                [
                    csv_field(&r.scan_id),
                    csv_field(&r.symbol),
                    r.scanned_at.to_rfc3339(),
                    r.phase.to_string(),
                    r.classification.map(|c| c.to_string()).unwrap_or_default(),
                    fmt_opt(r.rsi, 2),
                    fmt_opt(r.atr, 4),
                    fmt_opt(r.max_rsi, 2),
                    fmt_opt(r.min_rsi, 2),
                    r.hit_high.to_string(),
                    r.hit_low.to_string(),
                    over.map(|o| o.is_overextended.to_string()).unwrap_or_default(),
                    fmt_opt(over.map(|o| o.swing_low), 4),
                    fmt_opt(over.map(|o| o.threshold), 4),
                    fmt_opt(r.current_price, 4),
                    fmt_opt(over.map(|o| o.distance_pct), 2),
                    fmt_opt(over.map(|o| o.proximity_pct), 1),
                    r.data_points.to_string(),
                    r.cached.to_string(),
                    csv_field(&r.status),
                ]
                .join(","),
            );
        }

        self.write_file(file_name, &lines)
    }

    /// Write only the alert shortlist. Always written, header-only when no
    /// symbol alerted, so downstream consumers can rely on the file existing.
    pub fn write_alerts(&self, file_name: &str, records: &[ScanRecord]) -> Result<PathBuf> {
        let mut lines = vec![ALERTS_HEADER.to_string()];

        for r in records.iter().filter(|r| r.is_alert()) {
            lines.push(
                [
                    csv_field(&r.symbol),
                    r.scanned_at.to_rfc3339(),
                    r.classification.map(|c| c.to_string()).unwrap_or_default(),
                    fmt_opt(r.rsi, 2),
                    fmt_opt(r.atr, 4),
                    fmt_opt(r.max_rsi, 2),
                    fmt_opt(r.min_rsi, 2),
                    fmt_opt(r.current_price, 4),
                    csv_field(&r.status),
                ]
                .join(","),
            );
        }

        self.write_file(file_name, &lines)
    }

    fn write_file(&self, file_name: &str, lines: &[String]) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("failed to create output dir {}", self.output_dir.display())
        })?;

        let path = self.output_dir.join(file_name);
        let tmp = self.output_dir.join(format!("{file_name}.tmp"));

        let mut body = lines.join("\n");
        body.push('\n');

        fs::write(&tmp, body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move {} into place", tmp.display()))?;

        info!(path = %path.display(), rows = lines.len() - 1, "csv written");

        Ok(path)
    }
}

/// Quote a field only when it needs it (comma, quote, or newline inside).
fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{v:.precision$}"),
        _ => String::new(),
    }
}

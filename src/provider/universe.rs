// =============================================================================
// Ticker Universe — S&P 500 constituents over HTTP
// =============================================================================
//
// Downloads the constituents CSV (datahub layout: a header row containing a
// `Symbol` column), normalises class-share tickers (`.` => `-`), drops the
// configured exclusion set, and returns a sorted, de-duplicated list.
//
// The universe is refreshed at the start of every scan: symbols added since
// the last run enter as fresh Pending entries; removed symbols simply do not
// appear, and their cached bars age out through pruning.
// =============================================================================

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::error::ScanError;
use crate::provider::UniverseProvider;

/// HTTP-backed universe provider for a constituents CSV.
#[derive(Clone)]
pub struct ConstituentsUniverse {
    url: String,
    excluded: HashSet<String>,
    client: reqwest::Client,
}

impl ConstituentsUniverse {
    pub fn new(
        url: impl Into<String>,
        excluded: HashSet<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScanError::Provider(format!("failed to build http client: {e}")))?;

        Ok(Self {
            url: url.into(),
            excluded,
            client,
        })
    }

    /// Parse the constituents CSV into a normalised symbol list.
    ///
    /// Tolerates arbitrary column order as long as a `Symbol` header exists,
    /// including bare single-column files headed by `Symbol` alone.
    fn parse_constituents(csv: &str, excluded: &HashSet<String>) -> Result<Vec<String>, ScanError> {
        let mut lines = csv.lines().filter(|l| !l.trim().is_empty());

        let header = lines
            .next()
            .ok_or_else(|| ScanError::Provider("constituents CSV is empty".into()))?;

        let columns: Vec<&str> = header.split(',').map(str::trim).collect();
        let symbol_col = columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case("symbol"))
            .ok_or_else(|| {
                ScanError::Provider(format!("no Symbol column in CSV header '{header}'"))
            })?;

        let mut symbols: Vec<String> = lines
            .filter_map(|line| {
                let field = line.split(',').nth(symbol_col)?.trim();
                if field.is_empty() {
                    return None;
                }
                // Vendors write class shares as BRK.B; the data feed wants BRK-B.
                let normalised = field.replace('.', "-").to_uppercase();
                if excluded.contains(&normalised) {
                    None
                } else {
                    Some(normalised)
                }
            })
            .collect();

        symbols.sort();
        symbols.dedup();

        if symbols.is_empty() {
            return Err(ScanError::Provider("constituents CSV yielded no symbols".into()));
        }
        Ok(symbols)
    }
}

#[async_trait]
impl UniverseProvider for ConstituentsUniverse {
    #[instrument(skip(self), name = "universe::list_symbols")]
    async fn list_symbols(&self) -> Result<Vec<String>, ScanError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ScanError::Provider(format!("constituents fetch failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ScanError::Provider(format!(
                "constituents source returned {status}"
            )));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| ScanError::Provider(format!("constituents body unreadable: {e}")))?;

        let symbols = Self::parse_constituents(&text, &self.excluded)?;
        info!(
            count = symbols.len(),
            excluded = self.excluded.len(),
            "ticker universe loaded"
        );
        Ok(symbols)
    }
}

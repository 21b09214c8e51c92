// =============================================================================
// External provider ports
// =============================================================================
//
// The scanner talks to two remote collaborators through narrow, object-safe
// traits so that the orchestrator can run against mocks in tests:
//
//   MarketDataProvider — historical bars for one (symbol, interval, range)
//   UniverseProvider   — the ticker universe, refreshed at scan start
//
// Both surface failures as `ScanError::Provider`, which the orchestrator
// treats as transient (bounded retry with backoff, then FAILED).

pub mod http;
pub mod universe;

use async_trait::async_trait;

use crate::error::ScanError;
use crate::types::{Bar, BarInterval, TimeRange};

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Fetch bars for `symbol` covering `range` (both ends inclusive,
    /// interval-aligned). Implementations return bars in ascending
    /// timestamp order.
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: BarInterval,
        range: TimeRange,
    ) -> Result<Vec<Bar>, ScanError>;
}

#[async_trait]
pub trait UniverseProvider: Send + Sync {
    /// Return the ticker universe: normalised, de-duplicated, sorted.
    async fn list_symbols(&self) -> Result<Vec<String>, ScanError>;
}

pub use http::HttpMarketDataProvider;
pub use universe::ConstituentsUniverse;

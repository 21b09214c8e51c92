// =============================================================================
// Bar cache — persistent store plus the staleness resolver that drives it
// =============================================================================

pub mod staleness;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Bar, BarInterval};

/// One cached series: all bars for a (symbol, interval) key that overlap a
/// requested range, plus the watermark of the last merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub symbol: String,
    pub interval: BarInterval,
    /// Strictly increasing by timestamp, unique per timestamp.
    pub bars: Vec<Bar>,
    pub last_updated: DateTime<Utc>,
}

/// Summary of what the cache holds for a key, as consumed by the staleness
/// resolver. Cheap to compute (one aggregate query) compared to loading the
/// full series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coverage {
    /// Open instant of the earliest cached bar.
    pub first_bar: DateTime<Utc>,
    /// Open instant of the latest cached bar (the watermark bar).
    pub last_bar: DateTime<Utc>,
    /// When the entry was last merged into.
    pub last_updated: DateTime<Utc>,
}

pub use staleness::StalenessResolver;
pub use store::{CacheStats, CacheStore};

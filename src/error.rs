// =============================================================================
// Scanner error taxonomy
// =============================================================================
//
// Each variant maps to a distinct recovery policy:
//   Validation       — reject the write, nothing is partially applied.
//   InsufficientData — skip the symbol, no classification is produced.
//   Provider         — transient; retried with backoff, then the symbol is
//                      marked Failed and the batch continues.
//   Configuration    — fatal at startup, the process refuses to run.
//   Store            — local persistence failure (treated like Provider at
//                      the batch level: the symbol fails, the scan goes on).
// =============================================================================

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    /// Malformed bar data rejected before it reaches the cache.
    #[error("validation: {0}")]
    Validation(String),

    /// Not enough history for the requested indicator window.
    #[error("insufficient data: have {have} bars, need {need}")]
    InsufficientData { have: usize, need: usize },

    /// Market-data vendor failure (connectivity, auth, rate limit).
    #[error("provider: {0}")]
    Provider(String),

    /// Invalid threshold/window/path values detected at startup.
    #[error("configuration: {0}")]
    Configuration(String),

    /// SQLite cache failure.
    #[error("store: {0}")]
    Store(String),
}

impl From<sqlx::Error> for ScanError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl ScanError {
    /// Whether the orchestrator should retry the operation that produced
    /// this error. Only vendor-side failures are considered transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_provider_errors_are_transient() {
        assert!(ScanError::Provider("429".into()).is_transient());
        assert!(!ScanError::Validation("bad ts".into()).is_transient());
        assert!(!ScanError::InsufficientData { have: 3, need: 15 }.is_transient());
        assert!(!ScanError::Configuration("window=0".into()).is_transient());
        assert!(!ScanError::Store("locked".into()).is_transient());
    }

    #[test]
    fn insufficient_data_message_names_both_counts() {
        let msg = ScanError::InsufficientData { have: 10, need: 15 }.to_string();
        assert!(msg.contains("10") && msg.contains("15"));
    }
}

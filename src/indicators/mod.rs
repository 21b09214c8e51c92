// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators the scanner
// classifies on. Every public function is deterministic and order-sensitive:
// the same bar sequence always produces bit-for-bit identical output.
// Insufficient history is a typed error (`ScanError::InsufficientData`), not
// a silently shorter series.

pub mod atr;
pub mod rsi;

pub use atr::{atr_series, check_overextended};
pub use rsi::{check_rsi_extremes, rsi_series, RsiExtremes};

// =============================================================================
// HTTP Market Data Provider — historical bars over the vendor REST API
// =============================================================================
//
// GET {base_url}/v1/bars?symbol=&interval=&start=&end=
//
// The vendor answers with an array of arrays, one per bar:
//   [0] openTime (ms since epoch), [1] open, [2] high, [3] low, [4] close,
//   [5] volume
// Prices arrive as strings to avoid float formatting drift on the vendor
// side; volume is an integer.
//
// Connectivity, auth, and rate-limit problems all map to
// `ScanError::Provider` so the orchestrator can apply its retry policy
// uniformly.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::error::ScanError;
use crate::provider::MarketDataProvider;
use crate::types::{Bar, BarInterval, TimeRange};

/// REST client for the historical-bar vendor endpoint.
#[derive(Clone)]
pub struct HttpMarketDataProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMarketDataProvider {
    /// Build a provider with a hard per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScanError::Provider(format!("failed to build http client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Parse one numeric field that the vendor encodes as a JSON string.
    fn parse_str_f64(value: &serde_json::Value) -> Result<f64, ScanError> {
        match value {
            serde_json::Value::String(s) => s
                .parse::<f64>()
                .map_err(|e| ScanError::Provider(format!("bad numeric field '{s}': {e}"))),
            serde_json::Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| ScanError::Provider("non-finite numeric field".into())),
            other => Err(ScanError::Provider(format!(
                "unexpected field type in bar payload: {other}"
            ))),
        }
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketDataProvider {
    #[instrument(skip(self), name = "provider::fetch_bars")]
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: BarInterval,
        range: TimeRange,
    ) -> Result<Vec<Bar>, ScanError> {
        let url = format!(
            "{}/v1/bars?symbol={}&interval={}&start={}&end={}",
            self.base_url,
            symbol,
            interval,
            range.start.timestamp_millis(),
            range.end.timestamp_millis(),
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ScanError::Provider(format!("GET /v1/bars failed for {symbol}: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ScanError::Provider(format!("bad bars response for {symbol}: {e}")))?;

        if !status.is_success() {
            return Err(ScanError::Provider(format!(
                "vendor returned {status} for {symbol}: {body}"
            )));
        }

        let raw = body
            .as_array()
            .ok_or_else(|| ScanError::Provider("bars response is not an array".into()))?;

        let mut bars = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry
                .as_array()
                .ok_or_else(|| ScanError::Provider("bar entry is not an array".into()))?;

            if arr.len() < 6 {
                warn!(symbol, "skipping malformed bar entry with {} elements", arr.len());
                continue;
            }

            let open_time_ms = arr[0]
                .as_i64()
                .ok_or_else(|| ScanError::Provider("bar openTime is not an integer".into()))?;
            let timestamp: DateTime<Utc> = DateTime::from_timestamp_millis(open_time_ms)
                .ok_or_else(|| {
                    ScanError::Provider(format!("bar openTime {open_time_ms} out of range"))
                })?;

            bars.push(Bar {
                symbol: symbol.to_string(),
                timestamp,
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
                volume: arr[5].as_i64().unwrap_or(0),
            });
        }

        debug!(symbol, interval = %interval, count = bars.len(), "bars fetched");
        Ok(bars)
    }
}

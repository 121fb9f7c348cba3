//! HTTP adapter for the primary market data vendor.
//!
//! # Endpoint
//! `GET {base_url}/daily?codes=600519.SH,000001.SZ&start=2024-01-02&end=2024-01-05&fields=close,pe_ratio`
//!
//! Query values are percent-encoded, so instrument codes may carry any
//! character.
//!
//! Response envelope:
//!
//! ```json
//! { "code": 0, "msg": null, "data": [ { "code": "600519.SH", "date": "2024-01-02", "close": 1700.0 } ] }
//! ```
//!
//! Every transport, status or payload failure maps to `DataUnavailable`;
//! the completion stage decides what to do about it.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::time::Duration;
use stockpool_common::config::VendorConfig;
use tracing::debug;

use super::vendor::{DataVendor, VendorError, VendorRow};
use super::{DailyRow, Field, RowSource};

// ============================================================================
// Constants
// ============================================================================

/// Daily bars endpoint
const DAILY_ENDPOINT: &str = "/daily";

const VENDOR_NAME: &str = "primary";

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct VendorResponse {
    code: i32,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<Vec<VendorBar>>,
}

#[derive(Debug, Deserialize)]
struct VendorBar {
    code: String,
    date: NaiveDate,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    close: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    turnover: Option<f64>,
    #[serde(default)]
    pe_ratio: Option<f64>,
    #[serde(default)]
    pb_ratio: Option<f64>,
    #[serde(default)]
    market_cap: Option<f64>,
    #[serde(default)]
    turnover_rate: Option<f64>,
}

impl VendorBar {
    fn into_vendor_row(self, fields: &[Field]) -> VendorRow {
        let mut row = DailyRow::empty(RowSource::vendor(VENDOR_NAME));
        row.set(Field::Open, self.open);
        row.set(Field::High, self.high);
        row.set(Field::Low, self.low);
        row.set(Field::Close, self.close);
        row.set(Field::Volume, self.volume);
        row.set(Field::Turnover, self.turnover);
        row.set(Field::PeRatio, self.pe_ratio);
        row.set(Field::PbRatio, self.pb_ratio);
        row.set(Field::MarketCap, self.market_cap);
        row.set(Field::TurnoverRate, self.turnover_rate);
        VendorRow {
            instrument: self.code,
            date: self.date,
            row: row.restricted_to(fields),
        }
    }
}

// ============================================================================
// HTTP Vendor
// ============================================================================

/// Primary vendor reached over HTTP.
pub struct HttpVendor {
    base_url: String,
    api_token: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpVendor {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
            timeout,
            client,
        }
    }

    /// Create from config. `None` when no base URL is configured.
    pub fn from_config(config: &VendorConfig) -> Option<Self> {
        let base_url = config.base_url.as_ref()?;
        Some(Self::new(
            base_url.clone(),
            config.api_token.clone(),
            Duration::from_secs(config.timeout_secs),
        ))
    }

    fn daily_url(&self) -> String {
        format!("{}{}", self.base_url, DAILY_ENDPOINT)
    }

    /// Query pairs for the daily endpoint, encoded by the client.
    fn daily_query(
        instruments: &[String],
        start: NaiveDate,
        end: NaiveDate,
        fields: &[Field],
    ) -> [(&'static str, String); 4] {
        let fields: Vec<&str> = fields.iter().map(|f| f.as_str()).collect();
        [
            ("codes", instruments.join(",")),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("fields", fields.join(",")),
        ]
    }

    fn unavailable(reason: impl Into<String>) -> VendorError {
        VendorError::unavailable(VENDOR_NAME, reason)
    }
}

#[async_trait]
impl DataVendor for HttpVendor {
    fn name(&self) -> &str {
        VENDOR_NAME
    }

    async fn fetch(
        &self,
        instruments: &[String],
        start: NaiveDate,
        end: NaiveDate,
        fields: &[Field],
    ) -> Result<Vec<VendorRow>, VendorError> {
        let url = self.daily_url();
        debug!(url = %url, instruments = instruments.len(), start = %start, end = %end, "Fetching daily bars");

        let mut request = self
            .client
            .get(&url)
            .query(&Self::daily_query(instruments, start, end, fields))
            .header("accept", "application/json");
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                VendorError::Timeout {
                    vendor: VENDOR_NAME.into(),
                    secs: self.timeout.as_secs(),
                }
            } else if e.is_connect() {
                Self::unavailable("connection failed")
            } else {
                Self::unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::unavailable(format!("HTTP {}: {}", status, body)));
        }

        let result: VendorResponse = response
            .json()
            .await
            .map_err(|e| Self::unavailable(format!("failed to parse response: {}", e)))?;

        if result.code != 0 {
            let msg = result.msg.unwrap_or_else(|| "unknown error".to_string());
            return Err(Self::unavailable(msg));
        }

        let rows: Vec<VendorRow> = result
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|bar| bar.into_vendor_row(fields))
            .collect();

        debug!(rows = rows.len(), "Parsed daily bars");
        Ok(rows)
    }
}

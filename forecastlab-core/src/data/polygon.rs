//! Polygon.io aggregates source.
//!
//! Fetches `/v2/aggs/ticker/{symbol}/range/1/{timespan}/{from}/{to}` with retry,
//! exponential backoff and the shared circuit breaker. A response without a
//! `results` array means "no bars in range" and yields an empty fetch.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{
    check_range, normalize_order, DataError, FetchResult, MarketDataSource, SourceKind,
};
use crate::domain::{Granularity, RawRecord};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.polygon.io";

#[derive(Debug, Deserialize)]
struct AggsResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    results: Option<Vec<AggBar>>,
}

#[derive(Debug, Deserialize)]
struct AggBar {
    t: i64,
    o: Option<f64>,
    h: Option<f64>,
    l: Option<f64>,
    c: Option<f64>,
    v: Option<f64>,
    vw: Option<f64>,
    n: Option<f64>,
}

pub struct PolygonSource {
    client: reqwest::blocking::Client,
    api_key: String,
    base_url: String,
    circuit_breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
}

impl PolygonSource {
    pub fn new(
        api_key: impl Into<String>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DataError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            circuit_breaker,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    /// Read the API key from the environment variable `var`.
    pub fn from_env(var: &str, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, DataError> {
        let key = std::env::var(var).map_err(|_| {
            DataError::AuthenticationRequired(format!("environment variable {var} is not set"))
        })?;
        if key.trim().is_empty() {
            return Err(DataError::AuthenticationRequired(format!(
                "environment variable {var} is empty"
            )));
        }
        Self::new(key, circuit_breaker)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    fn aggs_url(&self, symbol: &str, granularity: Granularity, start: NaiveDate, end: NaiveDate) -> String {
        format!(
            "{}/v2/aggs/ticker/{symbol}/range/1/{}/{}/{}?adjusted=true&sort=asc&limit=50000",
            self.base_url,
            granularity.as_str(),
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d"),
        )
    }

    fn fetch_with_retry(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRecord>, DataError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(DataError::CircuitBreakerTripped);
        }

        let url = self.aggs_url(symbol, granularity, start, end);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                debug!(symbol, attempt, delay_ms = delay.as_millis() as u64, "retrying aggregates request");
                std::thread::sleep(delay);
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(DataError::CircuitBreakerTripped);
            }

            let sent = self
                .client
                .get(&url)
                .bearer_auth(&self.api_key)
                .send();

            match sent {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::FORBIDDEN {
                        self.circuit_breaker.trip();
                        return Err(DataError::CircuitBreakerTripped);
                    }

                    if status == reqwest::StatusCode::UNAUTHORIZED {
                        return Err(DataError::AuthenticationRequired(
                            "polygon rejected the API key".into(),
                        ));
                    }

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        self.circuit_breaker.record_failure();
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(60);
                        warn!(symbol, retry_after, "rate limited by polygon");
                        last_error = Some(DataError::RateLimited {
                            retry_after_secs: retry_after,
                        });
                        continue;
                    }

                    if !status.is_success() {
                        self.circuit_breaker.record_failure();
                        last_error = Some(DataError::Other(format!("HTTP {status} for {symbol}")));
                        continue;
                    }

                    let body = resp.text().map_err(|e| {
                        DataError::NetworkUnreachable(format!("reading body for {symbol}: {e}"))
                    })?;
                    let records = parse_aggregates(symbol, &body)?;
                    self.circuit_breaker.record_success();
                    return Ok(records);
                }
                Err(e) => {
                    if e.is_connect() || e.is_timeout() {
                        last_error = Some(DataError::NetworkUnreachable(e.to_string()));
                        continue;
                    }
                    return Err(DataError::NetworkUnreachable(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DataError::Other("max retries exceeded".into())))
    }
}

/// Parse an aggregates response body into ordered records.
pub(crate) fn parse_aggregates(symbol: &str, body: &str) -> Result<Vec<RawRecord>, DataError> {
    let resp: AggsResponse = serde_json::from_str(body).map_err(|e| {
        DataError::ResponseFormatChanged(format!("failed to parse response for {symbol}: {e}"))
    })?;

    if resp.status.as_deref() == Some("ERROR") {
        return Err(DataError::ResponseFormatChanged(
            resp.error.unwrap_or_else(|| "provider reported ERROR".into()),
        ));
    }

    let Some(bars) = resp.results else {
        warn!(symbol, "no results found");
        return Ok(Vec::new());
    };

    let mut records = Vec::with_capacity(bars.len());
    for bar in bars {
        let timestamp = chrono::DateTime::from_timestamp_millis(bar.t)
            .map(|dt| dt.naive_utc())
            .ok_or_else(|| DataError::ResponseFormatChanged(format!("invalid timestamp: {}", bar.t)))?;
        records.push(RawRecord {
            timestamp,
            open: bar.o.unwrap_or(f64::NAN),
            high: bar.h.unwrap_or(f64::NAN),
            low: bar.l.unwrap_or(f64::NAN),
            close: bar.c.unwrap_or(f64::NAN),
            volume: bar.v.unwrap_or(f64::NAN),
            vwap: bar.vw.unwrap_or(f64::NAN),
            trade_count: bar.n.unwrap_or(f64::NAN),
        });
    }
    normalize_order(&mut records);
    Ok(records)
}

impl MarketDataSource for PolygonSource {
    fn name(&self) -> &str {
        "polygon"
    }

    fn fetch(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchResult, DataError> {
        check_range(start, end)?;
        let records = self.fetch_with_retry(symbol, granularity, start, end)?;
        Ok(FetchResult {
            symbol: symbol.to_string(),
            granularity,
            records,
            source: SourceKind::Polygon,
        })
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

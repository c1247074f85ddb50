use std::time::Duration;

use axum::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// The most recent price published by the feed, as of a certain moment in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PriceSample {
    pub(crate) observed_at: DateTime<Utc>,
    pub(crate) cents_per_kwh: f64,
}

impl PriceSample {
    /// Returns `None` when `millis` cannot be represented as a UTC instant.
    pub(crate) fn from_epoch_millis(millis: i64, cents_per_kwh: f64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp_millis(millis).map(|observed_at| Self {
            observed_at,
            cents_per_kwh,
        })
    }
}

#[async_trait]
pub(crate) trait PriceFetcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// A single attempt, no retries.
    async fn fetch_latest(&self) -> Result<PriceSample, FetchError>;
}

/// Where the scheduler publishes what it observed.
pub(crate) trait MetricsSink: Send + Sync {
    fn set_price(&self, cents_per_kwh: f64);

    fn increment_failures(&self, kind: &str);
}

#[derive(Debug, Error)]
pub(crate) enum FetchError {
    #[error("failed to reach the price feed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unable to decode the price feed: {source}\n{body}")]
    MalformedBody {
        source: serde_json::Error,
        body: String,
    },

    #[error("no prices available: {body}")]
    EmptyFeed { body: String },

    #[error("bad millisUTC format: {entry}\n{body}")]
    MalformedTimestamp { entry: String, body: String },

    #[error("bad price format: {entry}\n{body}")]
    MalformedPrice { entry: String, body: String },
}

impl FetchError {
    /// Label used for the `type` dimension of the failure counter.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            FetchError::Transport(_) => "transport",
            FetchError::MalformedBody { .. } => "malformed_body",
            FetchError::EmptyFeed { .. } => "empty_feed",
            FetchError::MalformedTimestamp { .. } => "malformed_timestamp",
            FetchError::MalformedPrice { .. } => "malformed_price",
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum ExporterError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("unable to build the http client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("web server failed: {0}")]
    Server(String),

    #[error("web server did not drain within {0:?}")]
    ShutdownTimeout(Duration),
}

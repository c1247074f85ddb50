use axum::async_trait;
use reqwest::Client;
use serde_derive::Deserialize;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::domain::{FetchError, PriceFetcher, PriceSample};
use crate::metrics::{Metrics, RequestRecord};

/// ComEd's hourly pricing api.
pub(crate) const ADDRESS: &str = "https://hourlypricing.comed.com/api";

const FEED_TYPE: (&str, &str) = ("type", "5minutefeed");
const CLIENT_HANDLER: &str = "client_query";

/// The ComEd hourly pricing feed as a `PriceFetcher`, recording every request it makes.
#[derive(Clone)]
pub(crate) struct ComEd {
    client: Client,
    endpoint: String,
    metrics: Metrics,
}

impl ComEd {
    pub(crate) fn new(client: Client, endpoint: impl Into<String>, metrics: Metrics) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            metrics,
        }
    }
}

#[async_trait]
impl PriceFetcher for ComEd {
    fn name(&self) -> &'static str {
        "comed"
    }

    async fn fetch_latest(&self) -> Result<PriceSample, FetchError> {
        self.metrics.request_started();
        let started = Instant::now();

        let outcome = fetch_latest_price(&self.client, &self.endpoint).await;

        // Anything but a transport failure means upstream answered with a success status.
        let code = match &outcome {
            Err(FetchError::Transport(e)) => e
                .status()
                .map(|status| status.as_u16().to_string())
                .unwrap_or_else(|| "error".to_string()),
            _ => "200".to_string(),
        };
        self.metrics.request_finished(&RequestRecord {
            handler: CLIENT_HANDLER,
            code: &code,
            method: "GET",
            elapsed: started.elapsed(),
        });

        outcome
    }
}

/// Request the feed once and extract its most recent price.
pub(crate) async fn fetch_latest_price(
    client: &Client,
    endpoint: &str,
) -> Result<PriceSample, FetchError> {
    let body = fetch_body(client, endpoint).await?;
    parse_feed(&body)
}

#[instrument(skip(client))]
async fn fetch_body(client: &Client, endpoint: &str) -> Result<String, FetchError> {
    debug!("querying the price feed");

    let response = client
        .get(endpoint)
        .query(&[FEED_TYPE])
        .send()
        .await?
        .error_for_status()?;

    Ok(response.text().await?)
}

/// The feed lists entries oldest first, so the last one is the current price.
/// A `null` body counts as an empty feed.
pub(crate) fn parse_feed(body: &str) -> Result<PriceSample, FetchError> {
    let entries = serde_json::from_str::<Option<Vec<RawFeedEntry>>>(body)
        .map_err(|source| FetchError::MalformedBody {
            source,
            body: body.to_string(),
        })?
        .unwrap_or_default();

    let last = entries.last().ok_or_else(|| FetchError::EmptyFeed {
        body: body.to_string(),
    })?;

    let malformed_timestamp = || FetchError::MalformedTimestamp {
        entry: format!("{:?}", last),
        body: body.to_string(),
    };

    let millis = last
        .millis_utc
        .as_deref()
        .unwrap_or_default()
        .parse::<i64>()
        .map_err(|_| malformed_timestamp())?;

    let cents_per_kwh = last
        .price
        .as_deref()
        .unwrap_or_default()
        .parse::<f64>()
        .map_err(|_| FetchError::MalformedPrice {
            entry: format!("{:?}", last),
            body: body.to_string(),
        })?;

    PriceSample::from_epoch_millis(millis, cents_per_kwh).ok_or_else(malformed_timestamp)
}

/// Both fields may be missing or `null`; only the entry that gets used is validated.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct RawFeedEntry {
    #[serde(rename = "millisUTC")]
    millis_utc: Option<String>,
    price: Option<String>,
}

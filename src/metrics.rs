use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::domain::MetricsSink;

const DURATION_BUCKETS: [f64; 6] = [0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const SIZE_BUCKETS: [f64; 4] = [200.0, 500.0, 900.0, 1500.0];

/// All metric families exposed on the scrape endpoint, backed by one registry.
#[derive(Clone)]
pub(crate) struct Metrics {
    registry: Registry,
    price: Gauge,
    errors: IntCounterVec,
    in_flight_requests: IntGauge,
    requests: IntCounterVec,
    request_duration: HistogramVec,
    request_size: HistogramVec,
    response_size: HistogramVec,
}

/// What is known about one completed request, server or client side.
pub(crate) struct RequestRecord<'a> {
    pub(crate) handler: &'a str,
    pub(crate) code: &'a str,
    pub(crate) method: &'a str,
    pub(crate) elapsed: Duration,
}

impl Metrics {
    pub(crate) fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let labels = ["handler", "code", "method"];

        let price = register(
            &registry,
            Gauge::new("price", "A gauge of the last seen price.")?,
        )?;
        let errors = register(
            &registry,
            IntCounterVec::new(Opts::new("errors", "Count of non-fatal errors"), &["type"])?,
        )?;
        let in_flight_requests = register(
            &registry,
            IntGauge::new(
                "in_flight_requests",
                "A gauge of requests currently being served.",
            )?,
        )?;
        let requests = register(
            &registry,
            IntCounterVec::new(
                Opts::new("api_requests_total", "Count of api requests"),
                &labels,
            )?,
        )?;
        let request_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "request_duration_seconds",
                    "A histogram of latencies for requests.",
                )
                .buckets(DURATION_BUCKETS.to_vec()),
                &labels,
            )?,
        )?;
        let request_size = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "request_size_bytes",
                    "A histogram of request sizes for requests.",
                )
                .buckets(SIZE_BUCKETS.to_vec()),
                &labels,
            )?,
        )?;
        let response_size = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "response_size_bytes",
                    "A histogram of response sizes for requests.",
                )
                .buckets(SIZE_BUCKETS.to_vec()),
                &labels,
            )?,
        )?;

        Ok(Self {
            registry,
            price,
            errors,
            in_flight_requests,
            requests,
            request_duration,
            request_size,
            response_size,
        })
    }

    /// Text exposition of every registered family.
    pub(crate) fn render(&self) -> Vec<u8> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %err, "failed to encode prometheus metrics");
        }
        buffer
    }

    pub(crate) fn request_started(&self) {
        self.in_flight_requests.inc();
    }

    pub(crate) fn request_finished(&self, record: &RequestRecord<'_>) {
        let labels = [record.handler, record.code, record.method];

        self.in_flight_requests.dec();
        self.requests.with_label_values(&labels).inc();
        self.request_duration
            .with_label_values(&labels)
            .observe(record.elapsed.as_secs_f64());
    }

    pub(crate) fn observe_sizes(
        &self,
        record: &RequestRecord<'_>,
        request_bytes: u64,
        response_bytes: Option<u64>,
    ) {
        let labels = [record.handler, record.code, record.method];

        self.request_size
            .with_label_values(&labels)
            .observe(request_bytes as f64);
        if let Some(bytes) = response_bytes {
            self.response_size
                .with_label_values(&labels)
                .observe(bytes as f64);
        }
    }
}

impl MetricsSink for Metrics {
    fn set_price(&self, cents_per_kwh: f64) {
        self.price.set(cents_per_kwh);
    }

    fn increment_failures(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }
}

fn register<M>(registry: &Registry, metric: M) -> Result<M, prometheus::Error>
where
    M: Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

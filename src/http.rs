use axum::{
    body::{Body, HttpBody},
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    serve, Router,
};
use axum_macros::debug_handler;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::info;

use crate::metrics::{Metrics, RequestRecord};
use crate::shutdown::Shutdown;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

pub(crate) fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route_layer(middleware::from_fn_with_state(
            metrics.clone(),
            instrument_handler,
        ))
        .with_state(metrics)
}

/// Serves scrapes on `listener` until `shutdown` is cancelled, then drains open requests.
pub(crate) async fn start_http_server(
    listener: TcpListener,
    metrics: Metrics,
    shutdown: Shutdown,
) -> Result<(), std::io::Error> {
    if let Ok(address) = listener.local_addr() {
        info!("now listening on {}", address);
    }

    serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown.wait())
        .await
}

#[debug_handler(state = Metrics)]
async fn get_metrics(State(metrics): State<Metrics>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT))],
        metrics.render(),
    )
}

async fn instrument_handler(
    State(metrics): State<Metrics>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let request_bytes = approximate_request_size(&request);

    metrics.request_started();
    let started = Instant::now();

    let response = next.run(request).await;

    let code = response.status().as_u16().to_string();
    let record = RequestRecord {
        handler: "metrics",
        code: &code,
        method: &method,
        elapsed: started.elapsed(),
    };
    metrics.request_finished(&record);
    metrics.observe_sizes(&record, request_bytes, response_size(&response));

    response
}

/// Request line, headers (host included) and the body when its length is known.
fn approximate_request_size(request: &Request) -> u64 {
    let line = request.method().as_str().len()
        + request.uri().to_string().len()
        + format!("{:?}", request.version()).len();
    let headers: usize = request
        .headers()
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum();

    (line + headers) as u64 + request.body().size_hint().exact().unwrap_or(0)
}

fn response_size(response: &Response<Body>) -> Option<u64> {
    response.body().size_hint().exact()
}

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use lib_markers::core::admission::Decision;
use std::net::SocketAddr;
use tracing::info;

use crate::markers_logic::state::{AppState, client_addr, now_ms};

/// Consults the admission controller before any row-producing work.
///
/// `Reject` answers 429 with a `Retry-After` hint for the current window;
/// `Banned` answers 429 naming the ban expiry and no hint.
pub async fn admission_layer(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let addr = client_addr(request.headers(), peer, state.trust_proxy);
    match state.admission.admit(addr, now_ms()) {
        Decision::Admit => {
            let response = next.run(request).await;
            let status = response.status();
            if status.is_client_error() || status.is_server_error() {
                state.admission.refund(addr);
            }
            response
        }
        Decision::Reject { retry_after_ms } => {
            info!(%addr, retry_after_ms, "Rate limited.");
            let retry_after_secs = retry_after_ms.div_ceil(1000).max(1);
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                "Too many requests",
            )
                .into_response()
        }
        Decision::Banned { until_ms } => (
            StatusCode::TOO_MANY_REQUESTS,
            format!("IP banned until {until_ms}"),
        )
            .into_response(),
    }
}

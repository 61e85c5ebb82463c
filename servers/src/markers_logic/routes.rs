use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::handler::HandlerWithoutStateExt;
use axum::http::{StatusCode, Uri, header};
use axum::middleware;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get};
use lib_markers::core::anonymize::Anonymizer;
use lib_markers::core::codec::ColumnSpec;
use lib_markers::core::encoder::{EncodeOptions, OutputFormat, RowTransform, encode_stream};
use lib_markers::core::error::ExportError;
use lib_markers::store::{
    ANALYSIS_COLUMNS, ListQuery, RowStream, StoreError, SubmitError, Submission, parse_submission,
};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{debug, error, warn};

use crate::markers_logic::limiter::admission_layer;
use crate::markers_logic::state::AppState;

/// # Application Error
///
/// Everything a handler can fail with, mapped onto an HTTP response.
#[derive(Debug, Error)]
pub enum AppError {
    /// A bare status code with no body.
    #[error("{0}")]
    Status(StatusCode),
    /// A refused submission; the message goes back to the client.
    #[error(transparent)]
    Submit(#[from] SubmitError),
    /// A marker could not be written.
    #[error("register failed: {0}")]
    Register(StoreError),
    /// A read against the store failed before streaming started.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// An export could not be set up.
    #[error(transparent)]
    Export(#[from] ExportError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Status(status) => status.into_response(),
            AppError::Submit(e) => {
                debug!("Submission refused: {}", e);
                (StatusCode::BAD_REQUEST, e.to_string()).into_response()
            }
            AppError::Register(e) => {
                warn!("Failed to store marker: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Error writing to the database. May be due to wrongly formatted input. Try again.",
                )
                    .into_response()
            }
            AppError::Store(e) => {
                error!("Store error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            AppError::Export(e) => {
                error!("Export setup failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Query parameters shared by the export and submit routes.
#[derive(Debug, Default, Deserialize)]
pub struct ExportParams {
    levelid: Option<String>,
    platformer: Option<String>,
    practice: Option<String>,
    response: Option<String>,
}

/// Builds the full application router.
pub fn build_router(state: AppState, static_dir: &Path) -> Router {
    let limited = Router::new()
        .route("/list", get(list_handler))
        .route("/analysis", get(analysis_handler))
        .route("/submit", any(submit_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), admission_layer));

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .merge(limited)
        .route("/robots.txt", get(robots_handler))
        .route("/health", get(health_handler))
        .fallback_service(ServeDir::new(static_dir).fallback(not_found.into_service()))
        .layer(cors)
        .with_state(state)
}

/// 400 when absent, empty or out of range; 418 when not all digits.
fn parse_level_id(levelid: Option<&str>) -> Result<i32, AppError> {
    let levelid = levelid
        .filter(|id| !id.is_empty())
        .ok_or(AppError::Status(StatusCode::BAD_REQUEST))?;
    if !levelid.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::Status(StatusCode::IM_A_TEAPOT));
    }
    levelid
        .parse()
        .map_err(|_| AppError::Status(StatusCode::BAD_REQUEST))
}

fn parse_response_format(response: Option<&str>) -> Result<OutputFormat, AppError> {
    match response {
        None => Ok(OutputFormat::Csv),
        Some(value) => OutputFormat::parse(value).ok_or(AppError::Status(StatusCode::BAD_REQUEST)),
    }
}

/// Streams `rows` as the response body, one encoded batch per chunk.
fn export(
    state: &AppState,
    rows: RowStream,
    columns: ColumnSpec,
    format: OutputFormat,
    transform: Option<RowTransform>,
) -> Response {
    let options = EncodeOptions {
        batch_rows: state.batch_rows,
        transform,
        cancel: Some(state.shutdown.child_token()),
    };
    let body = Body::from_stream(encode_stream(rows, columns, format, options));
    ([(header::CONTENT_TYPE, format.content_type())], body).into_response()
}

async fn list_handler(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Response, AppError> {
    let level_id = parse_level_id(params.levelid.as_deref())?;
    let platformer = match params.platformer.as_deref() {
        Some("true") => true,
        Some("false") => false,
        _ => return Err(AppError::Status(StatusCode::BAD_REQUEST)),
    };
    let include_practice = params.practice.as_deref() != Some("false");
    let format = parse_response_format(params.response.as_deref())?;

    let listing = state
        .store
        .list(ListQuery {
            level_id,
            platformer,
            include_practice,
        })
        .await?;
    Ok(export(&state, listing.rows, listing.columns, format, None))
}

async fn analysis_handler(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Response, AppError> {
    let level_id = parse_level_id(params.levelid.as_deref())?;
    let format = parse_response_format(params.response.as_deref())?;

    let columns = ColumnSpec::parse(ANALYSIS_COLUMNS)?;
    let rows = state.store.analyze(level_id, &columns).await?;
    let anonymizer = Anonymizer::new();
    Ok(export(&state, rows, columns, format, Some(anonymizer.into_transform())))
}

async fn submit_handler(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    match parse_submission(&body, params.levelid.as_deref(), &state.excluded_levels)? {
        Submission::Excluded(level_id) => {
            debug!(level_id, "Skipped marker for excluded level.");
        }
        Submission::Store(marker) => {
            state.store.register(&marker).await.map_err(AppError::Register)?;
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn robots_handler(State(state): State<AppState>) -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], state.robots.to_string()).into_response()
}

/// # Health Check Endpoint
///
/// "OK" while the store answers, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => "OK".into_response(),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "Store unavailable").into_response()
        }
    }
}

/// Unknown paths go back to the front page; the front page itself 404s when
/// the static directory has no index.
async fn not_found(uri: Uri) -> Response {
    if uri.path() == "/" {
        StatusCode::NOT_FOUND.into_response()
    } else {
        Redirect::to("/").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use lib_markers::core::admission::{AdmissionConfig, AdmissionController, DEFAULT_BAN_MS, Decision};
    use lib_markers::store::DummyStore;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::markers_logic::state::{DEFAULT_ROBOTS, now_ms};

    const PEER: [u8; 4] = [10, 0, 0, 1];

    fn state_with(admission: AdmissionConfig) -> AppState {
        AppState {
            store: Arc::new(DummyStore),
            admission: Arc::new(AdmissionController::new(admission, 0)),
            excluded_levels: Arc::from(vec![666]),
            trust_proxy: false,
            batch_rows: 500,
            robots: Arc::from(DEFAULT_ROBOTS),
            shutdown: CancellationToken::new(),
        }
    }

    fn app(state: AppState, static_dir: &Path) -> Router {
        build_router(state, static_dir).layer(MockConnectInfo(SocketAddr::from((PEER, 4000))))
    }

    fn open_app() -> Router {
        let dir = std::env::temp_dir().join("markers-no-static");
        app(state_with(AdmissionConfig::fixed_window(8_000, 1_000).with_grace(0)), &dir)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, Vec<u8>, Response) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap().to_vec();
        (status, bytes, Response::from_parts(parts, Body::empty()))
    }

    async fn get_path(app: &Router, uri: &str) -> (StatusCode, Vec<u8>, Response) {
        send(app, "GET", uri, "").await
    }

    #[tokio::test]
    async fn test_list_csv() {
        let app = open_app();
        let (status, body, response) = get_path(&app, "/list?levelid=1&platformer=false").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/csv");
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "userident,levelversion,practice,x,y,percentage\n\
             0123456789abcdef0123456789abcdef01234567,0,0,100,200,37"
        );
    }

    #[tokio::test]
    async fn test_list_binary_platformer() {
        let app = open_app();
        let (status, body, response) = get_path(&app, "/list?levelid=1&platformer=true&response=bin").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/octet-stream");
        // version byte + ident, levelversion, practice, x, y
        assert_eq!(body.len(), 1 + 20 + 1 + 1 + 4 + 4);
        assert_eq!(body[0], 1);
        assert_eq!(&body[23..27], &100.0f32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_list_parameter_errors() {
        let app = open_app();
        for (uri, expected) in [
            ("/list?platformer=false", StatusCode::BAD_REQUEST),
            ("/list?levelid=&platformer=false", StatusCode::BAD_REQUEST),
            ("/list?levelid=12a&platformer=false", StatusCode::IM_A_TEAPOT),
            ("/list?levelid=-1&platformer=false", StatusCode::IM_A_TEAPOT),
            ("/list?levelid=99999999999&platformer=false", StatusCode::BAD_REQUEST),
            ("/list?levelid=1", StatusCode::BAD_REQUEST),
            ("/list?levelid=1&platformer=yes", StatusCode::BAD_REQUEST),
            ("/list?levelid=1&platformer=true&response=xml", StatusCode::BAD_REQUEST),
        ] {
            assert_eq!(get_path(&app, uri).await.0, expected, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_analysis_is_header_only_on_dummy_store() {
        let app = open_app();
        let (status, body, _) = get_path(&app, "/analysis?levelid=3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, ANALYSIS_COLUMNS.as_bytes());

        let (status, body, _) = get_path(&app, "/analysis?levelid=3&response=bin").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, vec![1]);

        assert_eq!(get_path(&app, "/analysis?levelid=x").await.0, StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn test_submit() {
        let app = open_app();
        let ident = "0123456789abcdef0123456789abcdef01234567";
        let valid = format!(r#"{{"format":1,"levelid":4,"userident":"{ident}","percentage":50,"x":1,"y":2}}"#);
        assert_eq!(send(&app, "POST", "/submit", &valid).await.0, StatusCode::NO_CONTENT);
        assert_eq!(send(&app, "PUT", "/submit", &valid).await.0, StatusCode::NO_CONTENT);

        let (status, body, _) = send(&app, "POST", "/submit", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, b"Wrongly formatted JSON");

        let excluded = r#"{"format":1}"#;
        assert_eq!(send(&app, "POST", "/submit?levelid=666", excluded).await.0, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_with_retry_after() {
        let app = app(
            state_with(AdmissionConfig::fixed_window(60_000, 2).with_grace(0)),
            &std::env::temp_dir(),
        );
        let uri = "/list?levelid=1&platformer=false";
        assert_eq!(get_path(&app, uri).await.0, StatusCode::OK);
        assert_eq!(get_path(&app, uri).await.0, StatusCode::OK);
        let (status, body, response) = get_path(&app, uri).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body, b"Too many requests");
        let retry: u64 = response.headers()[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&retry));

        // Unlimited routes stay reachable.
        assert_eq!(get_path(&app, "/health").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_banned_client_gets_expiry_and_no_hint() {
        let state = state_with(AdmissionConfig::escalating(8_000, 1).with_grace(0));
        let ip = IpAddr::from(PEER);
        let t0 = now_ms() - 10_000;
        state.admission.admit(ip, t0);
        state.admission.admit(ip, t0);
        state.admission.admit(ip, t0 + 9_500);
        // The escalating request itself is an ordinary rejection.
        assert!(matches!(state.admission.admit(ip, t0 + 9_500), Decision::Reject { .. }));

        let app = app(state, &std::env::temp_dir());
        let (status, body, response) = get_path(&app, "/list?levelid=1&platformer=false").await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(String::from_utf8(body).unwrap(), format!("IP banned until {}", t0 + 9_500 + DEFAULT_BAN_MS));
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_failed_requests_are_refunded_when_configured() {
        let mut config = AdmissionConfig::fixed_window(60_000, 1).with_grace(0);
        config.skip_failed_requests = true;
        let app = app(state_with(config), &std::env::temp_dir());
        assert_eq!(get_path(&app, "/list?levelid=1").await.0, StatusCode::BAD_REQUEST);
        assert_eq!(get_path(&app, "/list?levelid=1&platformer=true").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_static_files_robots_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("guide.html"), "<h1>guide</h1>").unwrap();
        let app = app(state_with(AdmissionConfig::default()), dir.path());

        let (status, body, _) = get_path(&app, "/guide.html").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"<h1>guide</h1>");

        let (status, body, _) = get_path(&app, "/robots.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, DEFAULT_ROBOTS.as_bytes());

        let (status, _, response) = get_path(&app, "/no/such/page").await;
        assert_eq!(status, StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");
    }
}

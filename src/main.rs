mod config;
mod http;
mod idempotency;
mod jobs;
mod marketplace;
mod metrics;
mod models;
mod pipeline;
mod profit;
mod report;
mod rows;
mod security;
mod sourcing;
mod surface;
mod watch;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use config::Settings;
use idempotency::{Claim, TriggerLedger};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ResearchRequest, TriggerInput};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use report::Verdict;
use rows::{RowError, RowStatus, Transition};
use security::{Caller, CallerKeys, authorize};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, process::ExitCode, sync::Arc, time::Duration};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "research-pipeline", version, about = "Marketplace research pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the trigger and row-status API (default).
    Serve {
        #[arg(long, env = "PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Research one item in this process and exit 0 on done, 1 on error.
    Run {
        item_reference: String,
        #[arg(long)]
        row_key: Option<String>,
        #[arg(long)]
        correlation_id: Option<String>,
        /// Offline collaborators only.
        #[arg(long)]
        demo: bool,
    },
    /// Poll a row on a running server until it finishes.
    Watch {
        row_key: String,
        #[arg(long, env = "RESEARCH_API_URL", default_value = "http://127.0.0.1:8000")]
        base_url: String,
        #[arg(long, env = "RESEARCH_API_KEY")]
        api_key: Option<String>,
        #[arg(long, default_value_t = watch::DEFAULT_INTERVAL.as_secs())]
        interval_secs: u64,
        #[arg(long, default_value_t = watch::DEFAULT_ATTEMPTS)]
        attempts: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(target = "research.api", "fatal: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> eyre::Result<ExitCode> {
    let settings = Settings::load()?;
    let command = cli.command.unwrap_or_else(|| Command::Serve {
        port: config::env_parse("PORT").unwrap_or(8000),
    });
    match command {
        Command::Serve { port } => {
            serve(settings, port).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            item_reference,
            row_key,
            correlation_id,
            demo,
        } => {
            let pipeline = if demo {
                Pipeline::demo(&settings)?
            } else {
                Pipeline::from_settings(&settings, redis_from_env())?
            };
            let row_key = row_key.unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4()));
            let mut request = ResearchRequest::new(item_reference, row_key);
            request.correlation_id = correlation_id;
            match pipeline.run(request).await {
                Ok(outcome) => {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    error!(
                        target = "research.api",
                        stage = err.stage(),
                        "research failed: {}",
                        err.detail()
                    );
                    Ok(ExitCode::from(1))
                }
            }
        }
        Command::Watch {
            row_key,
            base_url,
            api_key,
            interval_secs,
            attempts,
        } => {
            let source = watch::HttpRowSource::new(base_url, api_key);
            let outcome = watch::watch(
                &source,
                &row_key,
                Duration::from_secs(interval_secs),
                attempts,
            )
            .await?;
            match outcome {
                watch::WatchOutcome::Finished(row) => {
                    println!("{}", serde_json::to_string_pretty(&row)?);
                    Ok(if row.status == RowStatus::Done {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(1)
                    })
                }
                watch::WatchOutcome::SoftTimeout { .. } => Ok(ExitCode::from(2)),
            }
        }
    }
}

fn redis_from_env() -> Option<redis::Client> {
    let url = std::env::var("REDIS_URL").ok()?;
    match redis::Client::open(url) {
        Ok(client) => Some(client),
        Err(err) => {
            warn!(target = "research.api", error = %err, "REDIS_URL is invalid; running without redis");
            None
        }
    }
}

async fn serve(settings: Settings, port: u16) -> eyre::Result<()> {
    let redis = redis_from_env();
    let pipeline = Pipeline::from_settings(&settings, redis.clone())?;
    let (queue, _worker) = jobs::JobQueue::spawn(
        pipeline.clone(),
        settings.pipeline.queue_capacity,
        settings.pipeline.job_concurrency,
    );
    let ledger_ttl = config::env_parse::<u64>("IDEMPOTENCY_TTL_SECS").unwrap_or(24 * 3600);
    let state = AppState {
        pipeline,
        queue,
        ledger: TriggerLedger::new(redis, Duration::from_secs(ledger_ttl)),
        openapi: Arc::new(load_openapi()),
        prometheus_handle: PrometheusBuilder::new().install_recorder()?,
    };
    let app = router(state, CallerKeys::from_env()?);

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "research.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    ledger: TriggerLedger,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn router(state: AppState, keys: CallerKeys) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/research", post(trigger_research))
        .route("/rows/{row_key}", get(get_row))
        .route("/jobs/{id}", get(get_job_status))
        .route_layer(middleware::from_fn_with_state(keys, authorize));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "research-pipeline-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized);
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Research Pipeline API</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

fn body_limit_from_env() -> usize {
    config::env_parse::<usize>("REQUEST_MAX_BYTES")
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct TriggerAccepted {
    request_id: String,
    job_id: String,
    row_key: String,
}

/// Accept a research trigger for one row.
///
/// - Method: `POST`
/// - Path: `/research`
/// - Auth: `Authorization: Bearer <key>` or `X-Research-Key: <key>`
/// - Body: `TriggerInput`
/// - Response: `202` with the request id; `200 {duplicate: true}` for a
///   repeated `correlation_id`; `409` when the row is active or finished.
async fn trigger_research(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(payload): Json<TriggerInput>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/research");
    let request = ResearchRequest::from(payload);
    if request.row_key.is_empty() {
        return Err(PipelineError::validation("trigger", "row_key is required").into());
    }
    if request.item_reference.is_empty() {
        return Err(PipelineError::validation("trigger", "item_reference is required").into());
    }
    info!(
        target = "research.api",
        caller = %caller.name,
        key = %caller.key_hint,
        row_key = %request.row_key,
        "research triggered",
    );

    if let Some(correlation_id) = &request.correlation_id
        && let Claim::Duplicate { row_key } =
            state.ledger.claim(correlation_id, &request.row_key).await
    {
        info!(target = "research.api", correlation_id = %correlation_id, "duplicate trigger ignored");
        return Ok((
            StatusCode::OK,
            Json(json!({ "duplicate": true, "row_key": row_key })),
        )
            .into_response());
    }

    let rows = state.pipeline.rows();
    let existing = rows
        .load(&request.row_key)
        .await
        .map_err(|err| PipelineError::internal("rows", err.to_string()))?;
    if existing.is_some_and(|row| row.status == RowStatus::Pending) {
        return Err(AppError::Conflict(format!(
            "row {} is already pending",
            request.row_key
        )));
    }
    rows.transition(
        &request.row_key,
        Transition::Accept {
            correlation_id: request.correlation_id.clone(),
        },
    )
    .await
    .map_err(|err| match err {
        RowError::Transition(err) => AppError::Conflict(err.to_string()),
        RowError::Store(err) => PipelineError::internal("rows", err.to_string()).into(),
    })?;

    let row_key = request.row_key.clone();
    let correlation_id = request.correlation_id.clone();
    let id = match state.queue.enqueue(request).await {
        Ok(id) => id,
        Err(err) => {
            withdraw_trigger(&state, &row_key, correlation_id.as_deref()).await;
            return Err(PipelineError::internal("enqueue", err.error).into());
        }
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerAccepted {
            request_id: id.to_string(),
            job_id: id.to_string(),
            row_key,
        }),
    )
        .into_response())
}

/// Undoes the `Accept` and the ledger claim of a trigger that could not be
/// queued, so a retry is not refused as pending or duplicate.
async fn withdraw_trigger(state: &AppState, row_key: &str, correlation_id: Option<&str>) {
    match state.pipeline.rows().withdraw(row_key).await {
        Ok(true) => {}
        Ok(false) => warn!(
            target = "research.api",
            row_key, "row left its pending state before it could be withdrawn"
        ),
        Err(err) => error!(
            target = "research.api",
            row_key,
            error = %err,
            "failed to withdraw pending row"
        ),
    }
    if let Some(correlation_id) = correlation_id {
        state.ledger.release(correlation_id).await;
    }
}

/// Row status for pollers. `done` rows also carry the fixed result columns.
async fn get_row(
    State(state): State<AppState>,
    Path(row_key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let row = state
        .pipeline
        .rows()
        .load(&row_key)
        .await
        .map_err(|err| PipelineError::internal("rows", err.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("row {row_key}")))?;
    let mut body =
        serde_json::to_value(&row).map_err(|err| PipelineError::internal("rows", err.to_string()))?;
    if let (RowStatus::Done, Some(result)) = (row.status, &row.result) {
        let memo = match &result.verdict {
            Verdict::Profit(profit) => profit.source.as_str(),
            Verdict::NoSourcingFound => "no sourcing found",
        };
        body["headers"] = json!(report::ROW_HEADERS);
        body["columns"] = json!(result.to_row(row.updated_at.date_naive(), "done", memo));
    }
    Ok(Json(body))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(PipelineError::validation("jobs", "invalid_job_id").into());
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {id}")))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    Conflict(String),
    NotFound(String),
    Unauthorized,
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::Validation => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::AlreadyRunning => StatusCode::CONFLICT,
                    PipelineErrorKind::Lookup => StatusCode::BAD_GATEWAY,
                    PipelineErrorKind::Exhausted => StatusCode::UNPROCESSABLE_ENTITY,
                    PipelineErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.stage().to_string(), Some(err.detail().to_string()))
            }
            AppError::Conflict(detail) => (StatusCode::CONFLICT, "conflict".into(), Some(detail)),
            AppError::NotFound(detail) => (StatusCode::NOT_FOUND, "not_found".into(), Some(detail)),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".into(), None),
        };
        (status, Json(ApiError { error, detail })).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    fn test_app() -> (Router, Pipeline) {
        let (app, pipeline, _worker) = test_app_with_worker();
        (app, pipeline)
    }

    fn test_app_with_worker() -> (Router, Pipeline, tokio::task::JoinHandle<()>) {
        let mut settings = Settings::default();
        settings.surface.poll_interval = Duration::from_millis(5);
        settings.surface.simulated_propagation = Duration::from_millis(10);
        let pipeline = Pipeline::demo(&settings).expect("demo pipeline");
        let (queue, worker) = jobs::JobQueue::spawn(pipeline.clone(), 8, 2);
        let state = AppState {
            pipeline: pipeline.clone(),
            queue,
            ledger: TriggerLedger::new(None, Duration::from_secs(60)),
            openapi: Arc::new(load_openapi()),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        };
        let keys = format!("tests:{KEY}");
        (
            router(state, keys.parse().expect("caller keys")),
            pipeline,
            worker,
        )
    }

    fn trigger(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/research")
            .header(header::CONTENT_TYPE, "application/json")
            .header(security::API_KEY_HEADER, KEY)
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get_row_request(row_key: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("/rows/{row_key}"))
            .header(header::AUTHORIZATION, format!("Bearer {KEY}"))
            .body(Body::empty())
            .expect("request")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_is_public() {
        let (app, _) = test_app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_requires_a_key() {
        let (app, _) = test_app();
        let response = app
            .oneshot(
                Request::post("/research")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"item_reference":"1","row_key":"1"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn trigger_runs_the_row_to_done() {
        let (app, _) = test_app();
        let response = app
            .clone()
            .oneshot(trigger(json!({
                "item_reference": "https://www.ebay.com/itm/256789012345",
                "row_key": "14",
                "correlation_id": "evt-14",
            })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let duplicate = app
            .clone()
            .oneshot(trigger(json!({
                "item_reference": "https://www.ebay.com/itm/256789012345",
                "row_key": "14",
                "correlation_id": "evt-14",
            })))
            .await
            .expect("response");
        assert_eq!(duplicate.status(), StatusCode::OK);
        assert_eq!(json_body(duplicate).await["duplicate"], json!(true));

        let mut last = json!(null);
        for _ in 0..200 {
            let response = app
                .clone()
                .oneshot(get_row_request("14"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
            last = json_body(response).await;
            if last["status"] == json!("done") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(last["status"], json!("done"));
        let columns = last["columns"].as_array().expect("columns");
        assert_eq!(columns.len(), report::ROW_COLUMNS);
        assert_eq!(columns[18], json!("done"));
    }

    #[tokio::test]
    async fn active_or_finished_rows_conflict() {
        let (app, pipeline) = test_app();
        pipeline
            .rows()
            .transition("busy", Transition::Begin)
            .await
            .expect("begin");
        let response = app
            .oneshot(trigger(json!({"item_reference": "1234567890", "row_key": "busy"})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unqueued_trigger_does_not_strand_the_row() {
        let (app, pipeline, worker) = test_app_with_worker();
        worker.abort();
        let _ = worker.await;

        let body = json!({
            "item_reference": "1234567890",
            "row_key": "7",
            "correlation_id": "evt-7",
        });
        let first = app
            .clone()
            .oneshot(trigger(body.clone()))
            .await
            .expect("response");
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(pipeline.rows().load("7").await.expect("load").is_none());

        // neither pending nor duplicate: the retry reaches the queue again
        let retry = app.oneshot(trigger(body)).await.expect("response");
        assert_eq!(retry.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(pipeline.rows().load("7").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn unknown_rows_are_404_and_blank_rows_400() {
        let (app, _) = test_app();
        let response = app
            .clone()
            .oneshot(get_row_request("missing"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(trigger(json!({"item_reference": "1234567890", "row_key": "  "})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

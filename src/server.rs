//! HTTP surface for the dashboard UI.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::alerts;
use crate::config::Config;
use crate::db;
use crate::error::ApiError;
use crate::ingest::{self, ParseError};
use crate::models::{Alert, Athlete, IngestSummary, Measurement, Metric};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
}

pub async fn run(pool: PgPool, config: Config, addr: SocketAddr) -> anyhow::Result<()> {
    let state = Arc::new(AppState { pool, config });
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/health", get(|| async { "OK" }))
        .route("/api/measurements/upload", post(upload_measurements))
        .route("/api/alerts/generate", post(generate_alerts))
        .route("/api/alerts", get(list_alerts))
        .route("/api/alerts/:alert_id/ack", patch(acknowledge_alert))
        .route("/api/players", get(list_players))
        .route(
            "/api/players/:player_id/measurements",
            get(player_measurements),
        )
        .route("/api/players/:player_id/metrics", get(player_metrics))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024));

    tracing::info!("listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// # POST /api/measurements/upload
///
/// Multipart upload of one CSV file. Always answers with a structured
/// summary, even when some rows were rejected.
async fn upload_measurements(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<IngestSummary>, ApiError> {
    let mut file: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() == Some("file") || file.is_none() {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?;
            file = Some(bytes.to_vec());
        }
    }

    let bytes =
        file.ok_or_else(|| ApiError::BadRequest("multipart body carries no file".to_string()))?;
    let text = String::from_utf8(bytes).map_err(|_| ApiError::Validation(ParseError::NotUtf8))?;

    let summary = ingest::ingest_csv(&state.pool, &state.config, &text).await?;
    Ok(Json(summary))
}

#[derive(Debug, Default, Deserialize)]
struct GenerateRequest {
    player_id: Option<Uuid>,
}

/// # POST /api/alerts/generate
///
/// Runs the evaluator for one athlete or the whole squad. Success is 204
/// whether or not any alert fired; alerts are fetched separately.
async fn generate_alerts(
    State(state): State<Arc<AppState>>,
    body: Option<Json<GenerateRequest>>,
) -> Result<StatusCode, ApiError> {
    let player_id = body.and_then(|Json(request)| request.player_id);
    if let Some(id) = player_id {
        if db::get_athlete(&state.pool, id).await?.is_none() {
            return Err(ApiError::NotFound(format!("player {id} does not exist")));
        }
    }

    let submitted = alerts::generate(&state.pool, &state.config, player_id).await?;
    tracing::info!(submitted, "alert generation run finished");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    #[serde(default = "default_alert_limit")]
    limit: i64,
    player_id: Option<Uuid>,
}

fn default_alert_limit() -> i64 {
    50
}

/// # GET /api/alerts?limit=N&player_id=
async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let limit = query.limit.clamp(1, 500);
    let alerts = db::list_alerts(&state.pool, query.player_id, limit).await?;
    Ok(Json(alerts))
}

#[derive(Debug, Deserialize)]
struct AckRequest {
    acknowledged: bool,
}

/// # PATCH /api/alerts/:alert_id/ack
///
/// Acknowledging twice is a no-op success; an unknown id is a 404.
async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(alert_id): Path<Uuid>,
    Json(body): Json<AckRequest>,
) -> Result<Json<Alert>, ApiError> {
    if !body.acknowledged {
        return Err(ApiError::BadRequest(
            "acknowledgement is one-way; send {\"acknowledged\": true}".to_string(),
        ));
    }
    match db::acknowledge_alert(&state.pool, alert_id).await? {
        Some(alert) => Ok(Json(alert)),
        None => Err(ApiError::NotFound(format!("alert {alert_id} does not exist"))),
    }
}

/// # GET /api/players
async fn list_players(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Athlete>>, ApiError> {
    let athletes = db::list_athletes(&state.pool).await?;
    Ok(Json(athletes))
}

#[derive(Debug, Deserialize)]
struct MeasurementsQuery {
    metric: Option<String>,
    since_days: Option<i64>,
}

/// # GET /api/players/:player_id/measurements?metric=
async fn player_measurements(
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<Uuid>,
    Query(query): Query<MeasurementsQuery>,
) -> Result<Json<Vec<Measurement>>, ApiError> {
    let metric = match &query.metric {
        Some(name) => Some(
            Metric::parse(name)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown metric '{name}'")))?,
        ),
        None => None,
    };
    if db::get_athlete(&state.pool, player_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("player {player_id} does not exist")));
    }

    let since = query
        .since_days
        .map(|days| Utc::now() - Duration::days(days.max(1)));
    let measurements = db::fetch_measurements(&state.pool, player_id, metric, since).await?;
    Ok(Json(measurements))
}

/// # GET /api/players/:player_id/metrics
///
/// Distinct metrics observed for the athlete; drives the UI filters.
async fn player_metrics(
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<Uuid>,
) -> Result<Json<Vec<Metric>>, ApiError> {
    if db::get_athlete(&state.pool, player_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("player {player_id} does not exist")));
    }
    let metrics = db::list_metrics(&state.pool, player_id).await?;
    Ok(Json(metrics))
}

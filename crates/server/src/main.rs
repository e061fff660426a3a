use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use shared::{
    domain::{CounterRecord, UserId},
    error::{ApiError, ErrorCode},
    protocol::{IncrementRequest, IncrementResponse, LoginRequest, LoginResponse},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;
mod ws;

use api::ApiContext;
use app_state::{AppState, RecordChanged};
use config::{load_settings, normalize_database_url};

const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024;

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct ActorQuery {
    user_id: Option<i64>,
}

impl ActorQuery {
    fn actor(&self) -> Result<UserId, HttpError> {
        self.user_id
            .map(UserId)
            .ok_or_else(|| reject(ApiError::unauthorized("missing user_id query parameter")))
    }
}

#[derive(Debug, Deserialize)]
struct ListRecordsQuery {
    order_by: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState::new(ApiContext { storage }, settings.event_buffer);
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/records", get(http_list_records))
        .route("/records/:user_id", get(http_load_record))
        .route(
            "/records/:user_id/counters/:field/increment",
            post(http_increment_counter),
        )
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

fn reject(error: ApiError) -> HttpError {
    let status = match error.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| reject(ApiError::internal(e.to_string())))?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HttpError> {
    let user = api::login(&state.api, &req).await.map_err(reject)?;
    info!(user_id = user.user_id.0, "user signed in");
    Ok(Json(LoginResponse { user }))
}

async fn http_load_record(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<CounterRecord>, HttpError> {
    let record = api::load_record(&state.api, UserId(user_id))
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

async fn http_list_records(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListRecordsQuery>,
) -> Result<Json<Vec<CounterRecord>>, HttpError> {
    let order_by = api::parse_order_field(q.order_by.as_deref()).map_err(reject)?;
    let records = api::list_records(&state.api, &order_by)
        .await
        .map_err(reject)?;
    Ok(Json(records))
}

async fn http_increment_counter(
    State(state): State<Arc<AppState>>,
    Path((owner_id, field)): Path<(i64, String)>,
    Query(actor): Query<ActorQuery>,
    Json(req): Json<IncrementRequest>,
) -> Result<Json<IncrementResponse>, HttpError> {
    let actor = actor.actor()?;
    let response = api::increment_counter(
        &state.api,
        actor,
        UserId(owner_id),
        &field,
        req.delta,
    )
    .await
    .map_err(|error| {
        warn!(
            owner_id,
            actor_id = actor.0,
            %field,
            code = ?error.code,
            message = %error.message,
            "increment rejected"
        );
        reject(error)
    })?;

    // No receivers simply means nobody is subscribed right now.
    let _ = state.changes.send(RecordChanged {
        user_id: response.user_id,
    });
    Ok(Json(response))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ActorQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let actor = q.actor()?;
    Ok(ws.on_upgrade(move |socket| ws::ws_connection(state, socket, actor)))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

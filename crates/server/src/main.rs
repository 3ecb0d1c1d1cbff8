use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use server_api::{clear_room, list_messages, list_rooms, mark_read, send_message, ApiContext};
use shared::{
    domain::RoomId,
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, RoomSummary, ServerEvent},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod auth;
mod config;
mod room_bus;
mod ws;

use auth::AuthConfig;
use config::{load_settings, prepare_database_url};
use room_bus::{RoomBus, RoomFanout};

struct AppState {
    api: ApiContext,
    auth: AuthConfig,
    bus: RoomBus,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    display_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginResponse {
    user_id: i64,
    token: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    receiver_id: i64,
    body: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkReadResponse {
    updated: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClearRoomResponse {
    deleted: u64,
}

const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        api: ApiContext { storage },
        auth: AuthConfig {
            secret: settings.auth_secret,
            ttl_seconds: settings.auth_token_ttl_seconds,
        },
        bus: RoomBus::new(),
    };
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
        .route("/messages", post(http_send_message))
        .route("/rooms", get(http_list_rooms))
        .route(
            "/rooms/:room_id/messages",
            get(http_list_messages).delete(http_clear_room),
        )
        .route("/rooms/:room_id/read", post(http_mark_read))
        .route("/ws", get(ws::ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn error_response(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let display_name = req.display_name.trim();
    if display_name.is_empty() {
        return Err(error_response(ApiError::new(
            ErrorCode::Validation,
            "display name cannot be empty",
        )));
    }

    let user_id = state
        .api
        .storage
        .create_user(display_name)
        .await
        .map_err(|e| error_response(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    let token = auth::mint_token(&state.auth, user_id)
        .map_err(|e| error_response(ApiError::new(ErrorCode::Internal, e.to_string())))?;

    Ok(Json(LoginResponse {
        user_id: user_id.0,
        token,
    }))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, (StatusCode, Json<ApiError>)> {
    let sender_id = auth::bearer_user(&state.auth, &headers).map_err(error_response)?;
    let message = send_message(
        &state.api,
        sender_id,
        shared::domain::UserId(req.receiver_id),
        &req.body,
    )
    .await
    .map_err(error_response)?;

    state
        .bus
        .publish(
            &message.room_id,
            ServerEvent::MessageReceived {
                message: message.clone(),
            },
        )
        .await;
    Ok(Json(message))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let caller_id = auth::bearer_user(&state.auth, &headers).map_err(error_response)?;
    let messages = list_messages(&state.api, caller_id, &RoomId(room_id))
        .await
        .map_err(error_response)?;
    Ok(Json(messages))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<MarkReadResponse>, (StatusCode, Json<ApiError>)> {
    let caller_id = auth::bearer_user(&state.auth, &headers).map_err(error_response)?;
    let updated = mark_read(&state.api, caller_id, &RoomId(room_id))
        .await
        .map_err(error_response)?;
    Ok(Json(MarkReadResponse { updated }))
}

async fn http_clear_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ClearRoomResponse>, (StatusCode, Json<ApiError>)> {
    let caller_id = auth::bearer_user(&state.auth, &headers).map_err(error_response)?;
    let room_id = RoomId(room_id);
    let deleted = clear_room(&state.api, caller_id, &room_id)
        .await
        .map_err(error_response)?;

    state
        .bus
        .publish(
            &room_id,
            ServerEvent::RoomCleared {
                room_id: room_id.clone(),
            },
        )
        .await;
    Ok(Json(ClearRoomResponse { deleted }))
}

async fn http_list_rooms(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<RoomSummary>>, (StatusCode, Json<ApiError>)> {
    let caller_id = auth::bearer_user(&state.auth, &headers).map_err(error_response)?;
    let rooms = list_rooms(&state.api, caller_id)
        .await
        .map_err(error_response)?;
    Ok(Json(rooms))
}

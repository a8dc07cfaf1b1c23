//! HTTP routes and the push channel.

use crate::auth::{self, TokenStore};
use crate::broadcaster::Broadcaster;
use crate::error::ApiError;
use crate::indexer::{FileEntry, Indexer};
use crate::models::{SessionSnapshot, Snapshot};
use crate::registry::SessionRegistry;
use crate::streaming::{self, StreamSource, DEFAULT_BINARY_TYPE, DEFAULT_VIDEO_TYPE};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Form, Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Everything the handlers share.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub indexer: Arc<Indexer>,
    pub tokens: Arc<TokenStore>,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(remove_session))
        .route("/sessions/:id/select/:index", post(select_file))
        .route("/sessions/:id/stream", get(stream_session))
        .route("/sessions/:id/thumbnail", get(session_thumbnail))
        .route("/files", get(list_files))
        .route("/files/*path", get(stream_file).delete(delete_file))
        .route("/ws", get(push_channel))
        .route_layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/api/login", post(login))
        .merge(protected)
        .with_state(state)
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = state
        .tokens
        .login(&body.username, &body.password)
        .ok_or(ApiError::Unauthorized)?;
    Ok(Json(json!({ "token": token })))
}

#[derive(Deserialize)]
struct CreateRequest {
    magnet: Option<String>,
}

/// Accepts `{magnet}` as JSON or form data, or a multipart upload with a
/// `torrent` descriptor file and/or a `magnet` field.
async fn create_session(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let (magnet, descriptor) = if content_type.starts_with("multipart/form-data") {
        read_multipart(
            Multipart::from_request(request, &state)
                .await
                .map_err(|e| ApiError::InvalidSource(e.body_text()))?,
        )
        .await?
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(body) = Form::<CreateRequest>::from_request(request, &state)
            .await
            .map_err(|e| ApiError::InvalidSource(e.body_text()))?;
        (body.magnet, None)
    } else if content_type.starts_with("application/json") {
        let Json(body) = Json::<CreateRequest>::from_request(request, &state)
            .await
            .map_err(|e| ApiError::InvalidSource(e.body_text()))?;
        (body.magnet, None)
    } else {
        (None, None)
    };

    let session = state.registry.create(magnet, descriptor).await?;
    Ok(Json(state.registry.get(&session.id).await?))
}

async fn read_multipart(
    mut multipart: Multipart,
) -> Result<(Option<String>, Option<Vec<u8>>), ApiError> {
    let invalid = |e: axum::extract::multipart::MultipartError| ApiError::InvalidSource(e.body_text());
    let (mut magnet, mut descriptor) = (None, None);
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("torrent") => descriptor = Some(field.bytes().await.map_err(invalid)?.to_vec()),
            Some("magnet") => magnet = Some(field.text().await.map_err(invalid)?),
            _ => {}
        }
    }
    Ok((magnet, descriptor))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.registry.list().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.registry.get(&id).await?))
}

async fn remove_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Non-numeric indices select the first file, like out-of-range ones.
async fn select_file(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let index = index.parse().unwrap_or(0);
    let selected = state.registry.select(&id, index).await?;
    Ok(Json(json!({ "selectedIndex": selected })))
}

#[derive(Deserialize)]
struct StreamQuery {
    index: Option<String>,
}

fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::RANGE).and_then(|v| v.to_str().ok())
}

async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let index = query.index.and_then(|i| i.parse().ok());
    let source = state.registry.open_stream(&id, index).await?;
    streaming::respond(source, range_header(&headers), DEFAULT_VIDEO_TYPE).await
}

async fn session_thumbnail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let path = state.registry.thumbnail_path(&id).await?;
    streaming::respond(StreamSource::Disk { path }, range_header(&headers), "image/jpeg").await
}

async fn list_files(State(state): State<AppState>) -> Result<Json<Vec<FileEntry>>, ApiError> {
    Ok(Json(state.indexer.list().await?))
}

async fn stream_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let path = state.indexer.resolve(&path)?;
    streaming::respond(StreamSource::Disk { path }, range_header(&headers), DEFAULT_BINARY_TYPE).await
}

/// Deletes a file or directory; a session whose storage root it was goes too.
async fn delete_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.indexer.delete(&path).await?;
    let sessions = state.registry.remove_by_storage_path(&removed).await;
    info!(path = %path, sessions = sessions.len(), "deleted from download tree");
    Ok(Json(json!({ "deleted": path, "sessions": sessions })))
}

async fn push_channel(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| forward_frames(socket, state))
}

async fn forward_frames(socket: WebSocket, state: AppState) {
    let mut observer = state.broadcaster.connect(&state.registry).await;
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = observer.recv() => {
                let Some(frame) = frame else { break };
                if sender.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(observer = observer.id(), "push channel closed");
}

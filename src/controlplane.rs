use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use serenity::cache::Cache;
use serenity::model::id::{GuildId, UserId};
use tower_http::trace::TraceLayer;

use crate::error::{BoxError, MusicError};
use crate::player::Player;
use crate::queue::Track;
use crate::session::SessionKey;
use crate::surface::SurfaceSync;

/// Request/response boundary the web dashboard process drives the bot
/// through. The two processes never share memory; everything goes over
/// these authenticated endpoints.
#[derive(Clone)]
pub struct ApiState {
    pub player: Arc<Player>,
    pub surfaces: Arc<SurfaceSync>,
    pub cache: Arc<Cache>,
    pub secret: Arc<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/guild_count", get(guild_count))
        .route("/api/guild_ids", get(guild_ids))
        .route("/api/get_queue", get(get_queue))
        .route("/api/get_user_voice_state", get(get_user_voice_state))
        .route("/api/add_to_queue", post(add_to_queue))
        .route("/api/add_many", post(add_many))
        .route("/api/clear_queue", post(clear_queue))
        .route("/api/shuffle_queue", post(shuffle_queue))
        .route("/api/reorder_queue", post(reorder_queue))
        .route("/api/skip", post(skip))
        .route("/api/pause", post(pause))
        .route("/api/resume", post(resume))
        .route("/api/join", post(join))
        .route("/api/disconnect", post(disconnect))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: ApiState, bind: String) -> Result<(), BoxError> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "control plane listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Requests without a valid bearer credential are rejected the same way
/// regardless of operation.
fn authorized(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {secret}"))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized" })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn parse_session_key(guild_id: &str, channel_id: &str) -> Option<SessionKey> {
    let guild: u64 = guild_id.parse().ok()?;
    let channel: u64 = channel_id.parse().ok()?;
    Some(SessionKey::new(guild, channel))
}

fn parse_guild(guild_id: &str) -> Option<GuildId> {
    guild_id.parse::<u64>().ok().map(GuildId::new)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub success: bool,
    pub message: String,
}

/// Domain failures stay structured: a 200 with `success: false` and a
/// pre-written message, never a raw error body.
fn write_result(result: Result<String, MusicError>) -> Response {
    let body = match result {
        Ok(message) => WriteResponse {
            success: true,
            message,
        },
        Err(e) => WriteResponse {
            success: false,
            message: e.user_message().to_string(),
        },
    };
    (StatusCode::OK, Json(body)).into_response()
}

// Ids travel as strings: guild/channel snowflakes overflow the integers
// JavaScript dashboards can represent.

#[derive(Deserialize)]
struct SessionParams {
    guild_id: String,
    channel_id: String,
}

#[derive(Deserialize)]
struct AddTrackRequest {
    guild_id: String,
    channel_id: String,
    video_id: String,
    #[serde(default = "unknown_title")]
    video_title: String,
}

fn unknown_title() -> String {
    "Unknown title".into()
}

#[derive(Deserialize)]
struct TrackItem {
    video_id: String,
    #[serde(default = "unknown_title")]
    video_title: String,
}

#[derive(Deserialize)]
struct AddManyRequest {
    guild_id: String,
    channel_id: String,
    tracks: Vec<TrackItem>,
}

#[derive(Deserialize)]
struct ClearRequest {
    guild_id: String,
    channel_id: Option<String>,
}

#[derive(Deserialize)]
struct ReorderRequest {
    guild_id: String,
    channel_id: String,
    old_index: usize,
    new_index: usize,
}

#[derive(Deserialize)]
struct JoinRequest {
    guild_id: String,
    channel_id: String,
    #[serde(default = "default_true")]
    preserve_queue: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct DisconnectRequest {
    guild_id: String,
    #[serde(default)]
    preserve_queue: bool,
}

#[derive(Deserialize)]
struct UserVoiceQuery {
    guild_id: String,
    user_id: String,
}

async fn guild_count(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    Json(json!({ "count": state.cache.guild_count() })).into_response()
}

async fn guild_ids(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let ids: Vec<String> = state
        .cache
        .guilds()
        .iter()
        .map(|g| g.get().to_string())
        .collect();
    Json(json!({ "guild_ids": ids })).into_response()
}

async fn get_queue(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<SessionParams>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let Some(key) = parse_session_key(&params.guild_id, &params.channel_id) else {
        return bad_request("Missing or invalid parameters");
    };
    let snapshot = state.surfaces.snapshot(&key).await;
    Json(snapshot).into_response()
}

async fn get_user_voice_state(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<UserVoiceQuery>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let (Some(guild), Ok(user)) = (
        parse_guild(&params.guild_id),
        params.user_id.parse::<u64>().map(UserId::new),
    ) else {
        return bad_request("Missing or invalid parameters");
    };

    let voice_state = {
        match state.cache.guild(guild) {
            Some(guild_ref) => guild_ref
                .voice_states
                .get(&user)
                .and_then(|vs| vs.channel_id.map(|cid| (cid, vs.clone())))
                .map(|(cid, vs)| {
                    let channel_name = guild_ref
                        .channels
                        .get(&cid)
                        .map(|c| c.name.clone())
                        .unwrap_or_default();
                    json!({
                        "channel_id": cid.get().to_string(),
                        "channel_name": channel_name,
                        "mute": vs.mute,
                        "deaf": vs.deaf,
                        "self_mute": vs.self_mute,
                        "self_deaf": vs.self_deaf,
                    })
                }),
            None => None,
        }
    };
    Json(json!({ "voice_state": voice_state })).into_response()
}

// Not idempotent: a retried request queues the track twice. Callers must
// not blindly retry this or add_many.
async fn add_to_queue(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<AddTrackRequest>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let Some(key) = parse_session_key(&req.guild_id, &req.channel_id) else {
        return bad_request("Missing or invalid parameters");
    };
    let track = Track::from_video(req.video_id, req.video_title.clone());
    let result = state
        .player
        .add_to_queue(&key, track, true)
        .await
        .map(|len| format!("Added to queue: {} (position {len})", req.video_title));
    write_result(result)
}

async fn add_many(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<AddManyRequest>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let Some(key) = parse_session_key(&req.guild_id, &req.channel_id) else {
        return bad_request("Missing or invalid parameters");
    };
    let tracks: Vec<Track> = req
        .tracks
        .into_iter()
        .map(|t| Track::from_video(t.video_id, t.video_title))
        .collect();
    let result = state
        .player
        .enqueue_many(&key, tracks)
        .await
        .map(|summary| summary.message());
    write_result(result)
}

async fn clear_queue(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<ClearRequest>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let Some(guild) = parse_guild(&req.guild_id) else {
        return bad_request("Missing or invalid parameters");
    };

    if let Some(channel_id) = req.channel_id {
        let Some(key) = parse_session_key(&req.guild_id, &channel_id) else {
            return bad_request("Missing or invalid parameters");
        };
        let result = state
            .player
            .clear(&key)
            .await
            .map(|_| "Queue cleared".to_string());
        return write_result(result);
    }

    // no channel given: clear every queue registered under the guild
    let keys = state.player.registry.keys_for_guild(guild);
    let cleared = keys.len();
    for key in keys {
        if let Err(e) = state.player.clear(&key).await {
            tracing::warn!(key = %key, error = %e, "guild-wide clear failed for key");
        }
    }
    write_result(Ok(format!("Cleared {cleared} queue(s)")))
}

async fn shuffle_queue(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<SessionParams>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let Some(key) = parse_session_key(&req.guild_id, &req.channel_id) else {
        return bad_request("Missing or invalid parameters");
    };
    let result = state
        .player
        .shuffle(&key)
        .await
        .map(|_| "Queue shuffled".to_string());
    write_result(result)
}

async fn reorder_queue(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<ReorderRequest>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let Some(key) = parse_session_key(&req.guild_id, &req.channel_id) else {
        return bad_request("Missing or invalid parameters");
    };
    let result = state
        .player
        .move_track(&key, req.old_index, req.new_index)
        .await
        .map(|_| format!("Moved track {} to {}", req.old_index, req.new_index));
    write_result(result)
}

async fn skip(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<SessionParams>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let Some(key) = parse_session_key(&req.guild_id, &req.channel_id) else {
        return bad_request("Missing or invalid parameters");
    };
    let result = state
        .player
        .skip(&key)
        .await
        .map(|_| "Skipped to next track".to_string());
    write_result(result)
}

async fn pause(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<SessionParams>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let Some(key) = parse_session_key(&req.guild_id, &req.channel_id) else {
        return bad_request("Missing or invalid parameters");
    };
    let result = state
        .player
        .pause(&key)
        .await
        .map(|_| "Paused playback".to_string());
    write_result(result)
}

async fn resume(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<SessionParams>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let Some(key) = parse_session_key(&req.guild_id, &req.channel_id) else {
        return bad_request("Missing or invalid parameters");
    };
    let result = state
        .player
        .resume(&key)
        .await
        .map(|_| "Resumed playback".to_string());
    write_result(result)
}

async fn join(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<JoinRequest>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let Some(key) = parse_session_key(&req.guild_id, &req.channel_id) else {
        return bad_request("Missing or invalid parameters");
    };
    if !req.preserve_queue {
        // drop whatever the guild was holding before moving in
        let _ = state.player.disconnect_guild(key.guild, false).await;
    }
    let result = state
        .player
        .join(&key)
        .await
        .map(|_| format!("Joined channel {}", key.channel.get()));
    write_result(result)
}

async fn disconnect(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<DisconnectRequest>,
) -> Response {
    if !authorized(&headers, &state.secret) {
        return unauthorized();
    }
    let Some(guild) = parse_guild(&req.guild_id) else {
        return bad_request("Missing or invalid parameters");
    };
    let result = state
        .player
        .disconnect_guild(guild, req.preserve_queue)
        .await
        .map(|_| {
            if req.preserve_queue {
                "Disconnected from voice channel".to_string()
            } else {
                "Disconnected from voice channel and cleared queue".to_string()
            }
        });
    write_result(result)
}

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use staffroom_types::api::ReactionRequest;
use staffroom_types::events::{EventKind, ReactionPayload};

use crate::error::ApiResult;
use crate::{AppState, blocking, publish};

pub async fn add_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<ReactionRequest>,
) -> ApiResult<impl IntoResponse> {
    let user_id = req.user_id;
    let emoji = req.emoji.clone();
    let (channel_id, added) = blocking(&state, move |chat| {
        chat.add_reaction(message_id, req.user_id, &req.emoji)
    })
    .await?;

    let payload = ReactionPayload { message_id, emoji };
    if !added {
        return Ok((StatusCode::OK, Json(payload)));
    }
    publish(&state, channel_id, user_id, EventKind::ReactionAdded, &payload).await;
    Ok((StatusCode::CREATED, Json(payload)))
}

/// Removing a reaction that is not there succeeds without an event.
pub async fn remove_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<ReactionRequest>,
) -> ApiResult<impl IntoResponse> {
    let user_id = req.user_id;
    let emoji = req.emoji.clone();
    let (channel_id, removed) = blocking(&state, move |chat| {
        chat.remove_reaction(message_id, req.user_id, &req.emoji)
    })
    .await?;

    if removed {
        let payload = ReactionPayload { message_id, emoji };
        publish(&state, channel_id, user_id, EventKind::ReactionRemoved, &payload).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

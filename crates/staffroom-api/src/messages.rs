use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use staffroom_types::api::{EditMessageRequest, MarkReadRequest, SendMessageRequest};
use staffroom_types::events::EventKind;

use crate::error::ApiResult;
use crate::{AppState, blocking, publish};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub user_id: Uuid,
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
) -> ApiResult<impl IntoResponse> {
    let messages = blocking(&state, move |chat| {
        chat.get_channel_messages(channel_id, query.user_id)
    })
    .await?;
    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let user_id = req.user_id;
    let message = blocking(&state, move |chat| {
        chat.create_message(channel_id, req.user_id, &req.content, req.parent_message_id)
    })
    .await?;

    publish(&state, channel_id, user_id, EventKind::Text, &message).await;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let user_id = req.user_id;
    let message = blocking(&state, move |chat| {
        chat.edit_message(message_id, req.user_id, &req.content)
    })
    .await?;

    publish(&state, message.channel_id, user_id, EventKind::MessageEdited, &message).await;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
) -> ApiResult<impl IntoResponse> {
    let user_id = query.user_id;
    let message = blocking(&state, move |chat| chat.delete_message(message_id, user_id)).await?;

    publish(&state, message.channel_id, user_id, EventKind::MessageDeleted, &message).await;
    Ok(Json(message))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<impl IntoResponse> {
    let marked = blocking(&state, move |chat| {
        chat.mark_messages_as_read(channel_id, req.user_id)
    })
    .await?;
    Ok(Json(serde_json::json!({ "marked": marked })))
}

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use staffroom_chat::service::{ProfilePatch, UserProfile};
use staffroom_types::api::{CreateUserRequest, LoginRequest, PresenceRequest, UpdateUserRequest};

use crate::error::ApiResult;
use crate::{AppState, blocking};

#[derive(Debug, Deserialize)]
pub struct EmailQuery {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct CallerQuery {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    pub user_id: Uuid,
}

pub async fn register_or_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = blocking(&state, move |chat| {
        chat.register_or_login(&req.username, &req.email)
    })
    .await?;
    Ok(Json(user))
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<impl IntoResponse> {
    let profile = UserProfile {
        email: req.email,
        username: req.username,
        display_name: req.display_name,
        avatar_url: req.avatar_url,
    };
    let user = blocking(&state, move |chat| chat.create_user(&profile)).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let user = blocking(&state, move |chat| chat.get_user(user_id)).await?;
    Ok(Json(user))
}

pub async fn get_user_by_email(
    State(state): State<AppState>,
    Query(query): Query<EmailQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = blocking(&state, move |chat| chat.get_user_by_email(&query.email)).await?;
    Ok(Json(user))
}

pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult<impl IntoResponse> {
    let patch = ProfilePatch {
        username: req.username,
        display_name: req.display_name,
        avatar_url: req.avatar_url,
    };
    let user = blocking(&state, move |chat| chat.update_user(user_id, &patch)).await?;
    Ok(Json(user))
}

pub async fn update_presence(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<PresenceRequest>,
) -> ApiResult<impl IntoResponse> {
    blocking(&state, move |chat| {
        chat.update_user_presence(user_id, req.is_online)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn online_users(
    State(state): State<AppState>,
    Query(query): Query<CallerQuery>,
) -> ApiResult<impl IntoResponse> {
    let users = blocking(&state, move |chat| chat.get_online_users(query.user_id)).await?;
    Ok(Json(users))
}

pub async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<impl IntoResponse> {
    let users = blocking(&state, move |chat| {
        chat.search_users(&query.q, query.user_id)
    })
    .await?;
    Ok(Json(users))
}

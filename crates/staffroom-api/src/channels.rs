use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use staffroom_types::api::{CreateChannelRequest, DirectChannelResponse, JoinChannelRequest};

use crate::error::ApiResult;
use crate::{AppState, blocking};

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    40
}

#[derive(Debug, Deserialize)]
pub struct DirectQuery {
    pub user1_id: Uuid,
    pub user2_id: Uuid,
}

pub async fn public_messages(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let page = blocking(&state, move |chat| {
        chat.get_public_channel_messages(query.page, query.limit)
    })
    .await?;
    Ok(Json(page))
}

pub async fn create_channel(
    State(state): State<AppState>,
    Json(req): Json<CreateChannelRequest>,
) -> ApiResult<impl IntoResponse> {
    let channel = blocking(&state, move |chat| {
        chat.create_channel(
            req.user_id,
            &req.name,
            req.description.as_deref(),
            req.is_private,
        )
    })
    .await?;
    Ok((StatusCode::CREATED, Json(channel)))
}

pub async fn join_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Json(req): Json<JoinChannelRequest>,
) -> ApiResult<impl IntoResponse> {
    let member = blocking(&state, move |chat| chat.join_channel(channel_id, req.user_id)).await?;
    Ok(Json(member))
}

pub async fn channel_members(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let members = blocking(&state, move |chat| chat.get_channel_members(channel_id)).await?;
    Ok(Json(members))
}

pub async fn user_channels(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let channels = blocking(&state, move |chat| chat.get_user_channels(user_id)).await?;
    Ok(Json(channels))
}

/// Unread totals keyed by channel id.
pub async fn unread_count(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let counts = blocking(&state, move |chat| chat.get_unread_count(user_id)).await?;
    Ok(Json(counts))
}

pub async fn direct_channel(
    State(state): State<AppState>,
    Query(query): Query<DirectQuery>,
) -> ApiResult<impl IntoResponse> {
    let channel_id = blocking(&state, move |chat| {
        chat.get_or_create_direct_message_channel(query.user1_id, query.user2_id)
    })
    .await?;
    Ok(Json(DirectChannelResponse { channel_id }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::{Value, json};

    use crate::AppState;
    use crate::test_support::{call, state};

    async fn login(state: &AppState, name: &str) -> String {
        let (_, user) = call(
            state,
            "POST",
            "/users/login",
            Some(json!({ "email": format!("{name}@example.com"), "username": name })),
        )
        .await;
        user["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn public_feed_defaults_and_missing_channel() {
        let state = state();
        let (status, _) = call(&state, "GET", "/channels/public", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.chat.bootstrap().unwrap();
        let (status, page) = call(&state, "GET", "/channels/public", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["page"], 1);
        assert_eq!(page["limit"], 40);
        assert_eq!(page["total"], 0);
        assert_eq!(page["has_more"], false);
    }

    #[tokio::test]
    async fn direct_channel_is_shared_by_the_pair() {
        let state = state();
        let a = login(&state, "ann").await;
        let b = login(&state, "ben").await;

        let (status, first) = call(
            &state,
            "GET",
            &format!("/channels/direct?user1_id={a}&user2_id={b}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, second) = call(
            &state,
            "GET",
            &format!("/channels/direct?user1_id={b}&user2_id={a}"),
            None,
        )
        .await;
        assert_eq!(first["channel_id"], second["channel_id"]);

        let (status, _) = call(
            &state,
            "GET",
            &format!("/channels/direct?user1_id={a}&user2_id={a}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_join_and_list_members() {
        let state = state();
        let owner = login(&state, "olga").await;
        let guest = login(&state, "gus").await;

        let (status, channel) = call(
            &state,
            "POST",
            "/channels",
            Some(json!({ "user_id": owner, "name": "general" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let cid = channel["id"].as_str().unwrap().to_string();

        let (status, member) = call(
            &state,
            "POST",
            &format!("/channels/{cid}/join"),
            Some(json!({ "user_id": guest })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(member["role"], "member");
        assert_eq!(member["user_id"], guest.as_str());

        let (_, members) = call(&state, "GET", &format!("/channels/{cid}/members"), None).await;
        let ids: Vec<&str> = members
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|u| u["id"].as_str())
            .collect();
        assert_eq!(ids, vec![owner.as_str(), guest.as_str()]);

        let (_, channels) = call(&state, "GET", &format!("/users/{guest}/channels"), None).await;
        assert_eq!(channels.as_array().map(Vec::len), Some(1));

        let (_, unread) = call(&state, "GET", &format!("/users/{guest}/unread"), None).await;
        assert_eq!(unread[&cid], Value::from(0));
    }

    #[tokio::test]
    async fn private_channel_cannot_be_joined() {
        let state = state();
        let owner = login(&state, "pia").await;
        let guest = login(&state, "quinn").await;
        let (_, channel) = call(
            &state,
            "POST",
            "/channels",
            Some(json!({ "user_id": owner, "name": "staff", "is_private": true })),
        )
        .await;
        let cid = channel["id"].as_str().unwrap();

        let (status, _) = call(
            &state,
            "POST",
            &format!("/channels/{cid}/join"),
            Some(json!({ "user_id": guest })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}

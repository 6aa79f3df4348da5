pub mod channels;
pub mod error;
pub mod messages;
pub mod reactions;
pub mod users;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, patch, post},
};
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use staffroom_chat::{ChatError, ChatService};
use staffroom_gateway::hub::Hub;
use staffroom_types::events::{ChatEvent, EventKind};

use crate::error::{ApiError, ApiResult};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub chat: ChatService,
    pub hub: Hub,
}

/// Run a blocking chat-service call off the async runtime.
pub(crate) async fn blocking<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    F: FnOnce(&ChatService) -> Result<T, ChatError> + Send + 'static,
    T: Send + 'static,
{
    let chat = state.chat.clone();
    tokio::task::spawn_blocking(move || f(&chat))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError(ChatError::Storage {
                op: "spawn_blocking",
                source: e.into(),
            })
        })?
        .map_err(ApiError)
}

/// Fan a mutation out to the channel's live sessions. Delivery is best
/// effort; the write has already been committed.
pub(crate) async fn publish<T: Serialize>(
    state: &AppState,
    channel_id: Uuid,
    user_id: Uuid,
    kind: EventKind,
    payload: &T,
) {
    match ChatEvent::new(channel_id, user_id, kind, payload) {
        Ok(event) => {
            let delivered = state.hub.publish(&event).await;
            debug!("{:?} in {} delivered to {} connections", kind, channel_id, delivered);
        }
        Err(e) => error!("failed to encode {:?} event: {}", kind, e),
    }
}

/// Forum routes, mounted by the server under `/api/forum`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/users", post(users::create_user))
        .route("/users/login", post(users::register_or_login))
        .route("/users/search", get(users::search_users))
        .route("/users/online", get(users::online_users))
        .route("/users/email", get(users::get_user_by_email))
        .route("/users/{id}", get(users::get_user).patch(users::update_user))
        .route("/users/{id}/presence", patch(users::update_presence))
        .route("/users/{id}/channels", get(channels::user_channels))
        .route("/users/{id}/unread", get(channels::unread_count))
        .route("/channels", post(channels::create_channel))
        .route("/channels/public", get(channels::public_messages))
        .route("/channels/direct", get(channels::direct_channel))
        .route("/channels/{id}/join", post(channels::join_channel))
        .route("/channels/{id}/members", get(channels::channel_members))
        .route(
            "/channels/{id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/channels/{id}/read", patch(messages::mark_read))
        .route(
            "/messages/{id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route(
            "/messages/{id}/reactions",
            post(reactions::add_reaction).delete(reactions::remove_reaction),
        )
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use staffroom_db::Database;
    use tower::ServiceExt;

    pub fn state() -> AppState {
        let chat = ChatService::new(Arc::new(Database::open_in_memory().unwrap()));
        Arc::new(AppStateInner { chat, hub: Hub::new(8) })
    }

    pub async fn call(
        state: &AppState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let res = router(state.clone()).oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }
}

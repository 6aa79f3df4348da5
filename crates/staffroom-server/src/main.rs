mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::HeaderValue,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use staffroom_api::{AppState, AppStateInner};
use staffroom_chat::ChatService;
use staffroom_gateway::hub::Hub;
use staffroom_gateway::session;

use crate::config::ServerConfig;

#[derive(Debug, Deserialize)]
struct SessionQuery {
    user_id: Uuid,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "staffroom=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let db = Arc::new(staffroom_db::Database::open(&config.db_path)?);
    let chat = ChatService::new(db);
    let public = {
        let chat = chat.clone();
        tokio::task::spawn_blocking(move || chat.bootstrap()).await??
    };
    info!("public channel ready: {}", public.id);

    let hub = Hub::new(config.outbound_queue);
    let state: AppState = Arc::new(AppStateInner { chat: chat.clone(), hub: hub.clone() });

    let ws_route = Router::new()
        .route("/ws/channels/{channel_id}", get(ws_upgrade))
        .with_state(state.clone());

    let app = Router::new()
        .nest("/api/forum", staffroom_api::router(state))
        .merge(ws_route)
        .layer(cors_layer(&config))
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!("Staffroom server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    drain(&hub, &chat).await;
    info!("server stopped");
    Ok(())
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<SessionQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    let chat = state.chat.clone();
    ws.on_upgrade(move |socket| session::handle_session(socket, hub, chat, query.user_id, channel_id))
}

/// Close every live session, then mark all users offline. Session tasks
/// are cancelled with the runtime, so their own teardown cannot be relied on.
async fn drain(hub: &Hub, chat: &ChatService) {
    hub.shutdown().await;
    let chat = chat.clone();
    match tokio::task::spawn_blocking(move || chat.reset_presence()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("failed to reset presence on shutdown: {}", e),
        Err(e) => error!("spawn_blocking join error: {}", e),
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let Some(origins) = &config.allowed_origins else {
        return CorsLayer::permissive();
    };
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    CorsLayer::permissive().allow_origin(AllowOrigin::list(origins))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use staffroom_db::Database;
    use staffroom_gateway::hub::Connection;

    #[tokio::test]
    async fn drain_closes_sessions_and_clears_presence() {
        let chat = ChatService::new(Arc::new(Database::open_in_memory().unwrap()));
        let public = chat.bootstrap().unwrap();
        let user = chat.register_or_login("ann", "ann@example.com").unwrap();
        assert!(user.is_online);

        let hub = Hub::new(4);
        let (conn, mut outbound) = Connection::new(user.id, public.id, 4);
        hub.register(conn).await;

        drain(&hub, &chat).await;
        assert_eq!(outbound.recv().await, None);
        assert_eq!(hub.user_connection_count(user.id).await, 0);
        assert!(!chat.get_user(user.id).unwrap().is_online);
    }
}

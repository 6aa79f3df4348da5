use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use staffroom_chat::{ChatError, ChatService};
use staffroom_types::events::{ChatEvent, ClientFrame, EventKind};
use staffroom_types::models::Message as ChatMessage;

use crate::hub::{Connection, Hub};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the session is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Bridge one WebSocket to the hub for `channel_id`. The caller has already
/// resolved `user_id`; membership is checked here before registering.
pub async fn handle_session(
    socket: WebSocket,
    hub: Hub,
    chat: ChatService,
    user_id: Uuid,
    channel_id: Uuid,
) {
    let (sender, receiver) = socket.split();
    serve_session(sender, receiver, hub, chat, user_id, channel_id).await;
}

/// Full session lifecycle over any frame sink and stream: membership check,
/// registration, the read/write loop, then teardown. Presence goes offline
/// only when the user's last live connection ends.
pub async fn serve_session<S, R, E>(
    mut sender: S,
    receiver: R,
    hub: Hub,
    chat: ChatService,
    user_id: Uuid,
    channel_id: Uuid,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Send + 'static,
{
    let check = chat.clone();
    let allowed = tokio::task::spawn_blocking(move || check.is_channel_member(channel_id, user_id)).await;
    match allowed {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            warn!("{} is not a member of {}, closing session", user_id, channel_id);
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
        Ok(Err(e)) => {
            error!("membership check for {} on {} failed: {}", user_id, channel_id, e);
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            return;
        }
    }

    let (conn, outbound) = Connection::new(user_id, channel_id, hub.queue_capacity());
    let info = conn.info();
    {
        let _presence = hub.presence_lock().await;
        hub.register(conn).await;
        set_presence(&chat, user_id, true).await;
    }
    info!("{} connected to channel {} ({})", user_id, channel_id, info.id);

    run_session_loop(sender, receiver, outbound, hub.clone(), chat.clone(), user_id, channel_id).await;

    let remaining = {
        let _presence = hub.presence_lock().await;
        let remaining = hub.release(info).await;
        if remaining == 0 {
            set_presence(&chat, user_id, false).await;
        }
        remaining
    };
    info!(
        "{} disconnected from channel {} ({}), {} connections left",
        user_id, channel_id, info.id, remaining
    );
}

/// Writer drains the outbound queue until the hub closes it; reader feeds
/// inbound frames to the chat service. Whichever ends first stops the other.
async fn run_session_loop<S, R, E>(
    mut sender: S,
    mut receiver: R,
    mut outbound: mpsc::Receiver<Bytes>,
    hub: Hub,
    chat: ChatService,
    user_id: Uuid,
    channel_id: Uuid,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Send + 'static,
{
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                payload = outbound.recv() => {
                    let Some(payload) = payload else {
                        // Hub dropped us (slow consumer or shutdown).
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    };
                    if sender.send(to_frame(payload)).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping session", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Err(e) = handle_frame(&chat, &hub, user_id, channel_id, text.as_str()).await {
                        warn!(
                            "{} frame rejected on {}: {} -- raw: {}",
                            user_id,
                            channel_id,
                            e,
                            truncate(text.as_str(), 200)
                        );
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

/// Persist one inbound chat frame and fan the stored message out to the
/// channel, sender included.
pub async fn handle_frame(
    chat: &ChatService,
    hub: &Hub,
    user_id: Uuid,
    channel_id: Uuid,
    text: &str,
) -> Result<ChatMessage, FrameError> {
    let frame: ClientFrame = serde_json::from_str(text)?;

    let chat = chat.clone();
    let message = tokio::task::spawn_blocking(move || {
        chat.create_message(channel_id, user_id, &frame.content, frame.parent_message_id)
    })
    .await??;

    let event = ChatEvent::new(channel_id, user_id, EventKind::Text, &message)?;
    let delivered = hub.publish(&event).await;
    debug!("message {} delivered to {} connections", message.id, delivered);
    Ok(message)
}

async fn set_presence(chat: &ChatService, user_id: Uuid, online: bool) {
    let chat = chat.clone();
    match tokio::task::spawn_blocking(move || chat.update_user_presence(user_id, online)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("presence update for {} failed: {}", user_id, e),
        Err(e) => error!("spawn_blocking join error: {}", e),
    }
}

fn to_frame(payload: Bytes) -> Message {
    match std::str::from_utf8(&payload) {
        Ok(text) => Message::Text(text.to_owned().into()),
        Err(_) => Message::Binary(payload),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use staffroom_db::Database;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
    use tokio::time::timeout;

    /// Client end of an in-memory socket.
    struct Peer {
        tx: UnboundedSender<Result<Message, Infallible>>,
        rx: UnboundedReceiver<Message>,
    }

    fn socket() -> (
        impl Sink<Message> + Unpin + Send + 'static,
        impl Stream<Item = Result<Message, Infallible>> + Unpin + Send + 'static,
        Peer,
    ) {
        let (to_peer, from_server) = unbounded_channel::<Message>();
        let (to_server, from_peer) = unbounded_channel::<Result<Message, Infallible>>();
        let sink = Box::pin(futures_util::sink::unfold(to_peer, |tx, msg: Message| async move {
            tx.send(msg).map_err(|_| "peer gone")?;
            Ok::<_, &'static str>(tx)
        }));
        let stream = Box::pin(futures_util::stream::unfold(from_peer, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        }));
        (sink, stream, Peer { tx: to_server, rx: from_server })
    }

    struct Fixture {
        chat: ChatService,
        hub: Hub,
        channel: Uuid,
        author: Uuid,
        outsider: Uuid,
    }

    fn fixture() -> Fixture {
        let chat = ChatService::new(Arc::new(Database::open_in_memory().unwrap()));
        let author = chat.register_or_login("author", "author@x.io").unwrap().id;
        let outsider = chat.register_or_login("outsider", "outsider@x.io").unwrap().id;
        let channel = chat.create_channel(author, "general", None, false).unwrap().id;
        Fixture { chat, hub: Hub::new(8), channel, author, outsider }
    }

    #[tokio::test]
    async fn frame_is_persisted_and_echoed_to_sender() {
        let f = fixture();
        let (conn, mut rx) = Connection::new(f.author, f.channel, 8);
        f.hub.register(conn).await;

        let stored = handle_frame(&f.chat, &f.hub, f.author, f.channel, r#"{"content":"hi"}"#)
            .await
            .unwrap();
        assert_eq!(stored.content, "hi");

        let event: ChatEvent = serde_json::from_slice(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(event.kind, EventKind::Text);
        assert_eq!(event.channel_id, f.channel);
        assert_eq!(event.user_id, f.author);
        assert_eq!(event.payload["content"], "hi");
        assert_eq!(event.payload["id"], stored.id.to_string());
    }

    #[tokio::test]
    async fn malformed_frame_is_rejected_without_broadcast() {
        let f = fixture();
        let (conn, mut rx) = Connection::new(f.author, f.channel, 8);
        f.hub.register(conn).await;

        let err = handle_frame(&f.chat, &f.hub, f.author, f.channel, "not json")
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn outsider_frame_is_denied() {
        let f = fixture();
        let err = handle_frame(&f.chat, &f.hub, f.outsider, f.channel, r#"{"content":"hey"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Chat(ChatError::AccessDenied)));
        assert!(f.chat.get_channel_messages(f.channel, f.author).unwrap().is_empty());
    }

    #[test]
    fn utf8_payload_becomes_text_frame() {
        assert!(matches!(to_frame(Bytes::from_static(b"{}")), Message::Text(_)));
        assert!(matches!(to_frame(Bytes::from_static(&[0xff, 0xfe])), Message::Binary(_)));
        assert_eq!(truncate("héllo", 2), "hé");
    }

    #[tokio::test]
    async fn hub_closing_queue_sends_close_and_ends_loop() {
        let f = fixture();
        let (conn, outbound) = Connection::new(f.author, f.channel, 8);
        f.hub.register(conn).await;
        let (sink, stream, mut peer) = socket();
        let session = tokio::spawn(run_session_loop(
            sink,
            stream,
            outbound,
            f.hub.clone(),
            f.chat.clone(),
            f.author,
            f.channel,
        ));

        f.hub.broadcast(f.channel, Bytes::from_static(b"{\"n\":1}")).await;
        assert!(matches!(peer.rx.recv().await, Some(Message::Text(t)) if t.as_str() == "{\"n\":1}"));

        f.hub.shutdown().await;
        assert!(matches!(peer.rx.recv().await, Some(Message::Close(None))));
        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_hangup_stops_the_writer() {
        let f = fixture();
        let (conn, outbound) = Connection::new(f.author, f.channel, 8);
        let info = conn.info();
        f.hub.register(conn).await;
        let (sink, stream, peer) = socket();
        let session = tokio::spawn(run_session_loop(
            sink,
            stream,
            outbound,
            f.hub.clone(),
            f.chat.clone(),
            f.author,
            f.channel,
        ));

        drop(peer.tx);
        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        assert_eq!(f.hub.release(info).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn two_missed_pongs_drop_the_session() {
        let f = fixture();
        let (conn, outbound) = Connection::new(f.author, f.channel, 8);
        let (sink, stream, mut peer) = socket();
        let started = tokio::time::Instant::now();
        let session = tokio::spawn(run_session_loop(
            sink,
            stream,
            outbound,
            f.hub.clone(),
            f.chat.clone(),
            f.author,
            f.channel,
        ));

        timeout(Duration::from_secs(60), session).await.unwrap().unwrap();
        assert!(started.elapsed() >= HEARTBEAT_INTERVAL * 3);

        let mut pings = 0;
        while let Ok(msg) = peer.rx.try_recv() {
            if matches!(msg, Message::Ping(_)) {
                pings += 1;
            }
        }
        assert_eq!(pings, 2);
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_the_session_alive() {
        let f = fixture();
        let (conn, outbound) = Connection::new(f.author, f.channel, 8);
        let (sink, stream, mut peer) = socket();
        let session = tokio::spawn(run_session_loop(
            sink,
            stream,
            outbound,
            f.hub.clone(),
            f.chat.clone(),
            f.author,
            f.channel,
        ));

        let responder = tokio::spawn(async move {
            let mut pings = 0u32;
            while let Some(msg) = peer.rx.recv().await {
                if matches!(msg, Message::Ping(_)) {
                    pings += 1;
                    peer.tx.send(Ok(Message::Pong(Bytes::new()))).unwrap();
                    if pings == 5 {
                        break;
                    }
                }
            }
            (pings, peer)
        });
        let (pings, peer) = responder.await.unwrap();
        assert_eq!(pings, 5);
        assert!(!session.is_finished());

        drop(conn);
        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        drop(peer);
    }

    #[tokio::test]
    async fn presence_stays_online_until_last_session_ends() {
        let f = fixture();
        let other = f.chat.create_channel(f.author, "random", None, false).unwrap().id;
        let (sink_a, stream_a, peer_a) = socket();
        let (sink_b, stream_b, peer_b) = socket();
        let a = tokio::spawn(serve_session(
            sink_a,
            stream_a,
            f.hub.clone(),
            f.chat.clone(),
            f.author,
            f.channel,
        ));
        let b = tokio::spawn(serve_session(
            sink_b,
            stream_b,
            f.hub.clone(),
            f.chat.clone(),
            f.author,
            other,
        ));

        timeout(Duration::from_secs(5), async {
            while f.hub.user_connection_count(f.author).await < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        drop(peer_a);
        timeout(Duration::from_secs(5), a).await.unwrap().unwrap();
        assert_eq!(f.hub.user_connection_count(f.author).await, 1);
        assert!(f.chat.get_user(f.author).unwrap().is_online);

        drop(peer_b);
        timeout(Duration::from_secs(5), b).await.unwrap().unwrap();
        assert_eq!(f.hub.user_connection_count(f.author).await, 0);
        assert!(!f.chat.get_user(f.author).unwrap().is_online);
    }

    #[tokio::test]
    async fn outsider_session_is_closed_without_registering() {
        let f = fixture();
        let (sink, stream, mut peer) = socket();
        serve_session(sink, stream, f.hub.clone(), f.chat.clone(), f.outsider, f.channel).await;

        assert!(matches!(peer.rx.recv().await, Some(Message::Close(None))));
        assert_eq!(f.hub.connection_count(f.channel).await, 0);
        assert_eq!(f.hub.user_connection_count(f.outsider).await, 0);
    }
}

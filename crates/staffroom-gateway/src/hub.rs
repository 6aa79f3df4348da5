use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use staffroom_types::events::ChatEvent;

/// Default per-connection outbound queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Identity of a live connection, kept by its session to unregister later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel_id: Uuid,
}

/// A live connection as held by the hub. The hub owns the only sender of
/// the outbound queue, so removing the connection closes the queue.
#[derive(Debug)]
pub struct Connection {
    info: ConnectionInfo,
    tx: mpsc::Sender<Bytes>,
}

impl Connection {
    /// Create a connection and the receiving end of its bounded outbound queue.
    pub fn new(user_id: Uuid, channel_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        Self::with_id(Uuid::new_v4(), user_id, channel_id, capacity)
    }

    pub fn with_id(
        id: Uuid,
        user_id: Uuid,
        channel_id: Uuid,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let info = ConnectionInfo { id, user_id, channel_id };
        (Self { info, tx }, rx)
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info
    }
}

/// Fans payloads out to every connection registered on a channel.
///
/// All registry access goes through one mutex, which linearizes register,
/// unregister and broadcast. Broadcasts to a channel are therefore seen by
/// each subscriber in call order. A subscriber whose queue is full is
/// dropped instead of stalling the broadcaster.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    registry: Mutex<Registry>,
    /// Serializes presence transitions so a reconnect cannot interleave
    /// with the teardown of the user's previous session.
    presence: Mutex<()>,
    queue_capacity: usize,
}

#[derive(Default)]
struct Registry {
    /// channel_id -> (connection_id -> connection)
    channels: HashMap<Uuid, HashMap<Uuid, Connection>>,
    /// user_id -> live connections across all channels
    users: HashMap<Uuid, usize>,
}

impl Registry {
    fn insert(&mut self, conn: Connection) -> bool {
        let info = conn.info;
        *self.users.entry(info.user_id).or_default() += 1;
        let previous = self.channels.entry(info.channel_id).or_default().insert(info.id, conn);
        if let Some(previous) = &previous {
            release_user(&mut self.users, previous.info.user_id);
        }
        previous.is_some()
    }

    fn remove(&mut self, channel_id: Uuid, connection_id: Uuid) -> bool {
        let Some(bucket) = self.channels.get_mut(&channel_id) else {
            return false;
        };
        let removed = bucket.remove(&connection_id);
        if bucket.is_empty() {
            self.channels.remove(&channel_id);
        }
        match removed {
            Some(conn) => {
                release_user(&mut self.users, conn.info.user_id);
                true
            }
            None => false,
        }
    }

    fn user_connections(&self, user_id: Uuid) -> usize {
        self.users.get(&user_id).copied().unwrap_or(0)
    }
}

fn release_user(users: &mut HashMap<Uuid, usize>, user_id: Uuid) {
    if let Some(count) = users.get_mut(&user_id) {
        *count -= 1;
        if *count == 0 {
            users.remove(&user_id);
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: Mutex::new(Registry::default()),
                presence: Mutex::new(()),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.inner.queue_capacity
    }

    /// Hold while changing a user's stored presence together with their
    /// registration, so that "last connection gone" and "new connection
    /// online" are applied in the order they happened.
    pub async fn presence_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.presence.lock().await
    }

    /// Insert a connection under its channel. A connection with the same id
    /// replaces (and closes) the previous one.
    pub async fn register(&self, conn: Connection) {
        let info = conn.info;
        if self.inner.registry.lock().await.insert(conn) {
            debug!("connection {} re-registered on {}", info.id, info.channel_id);
        }
        debug!("{} joined channel {} as {}", info.user_id, info.channel_id, info.id);
    }

    /// Remove a connection and close its queue. Returns false if it was
    /// already gone, so repeated calls are harmless.
    pub async fn unregister(&self, channel_id: Uuid, connection_id: Uuid) -> bool {
        self.inner.registry.lock().await.remove(channel_id, connection_id)
    }

    /// Unregister `info` (if still present) and report how many live
    /// connections its user has left on any channel. The connection may
    /// already be gone if a broadcast dropped it.
    pub async fn release(&self, info: ConnectionInfo) -> usize {
        let mut registry = self.inner.registry.lock().await;
        registry.remove(info.channel_id, info.id);
        registry.user_connections(info.user_id)
    }

    pub async fn user_connection_count(&self, user_id: Uuid) -> usize {
        self.inner.registry.lock().await.user_connections(user_id)
    }

    /// Deliver `payload` to every connection on `channel_id`. Returns how
    /// many connections accepted it. Full or closed queues get their
    /// connection dropped.
    pub async fn broadcast(&self, channel_id: Uuid, payload: Bytes) -> usize {
        let mut registry = self.inner.registry.lock().await;
        let Registry { channels, users } = &mut *registry;
        let Some(bucket) = channels.get_mut(&channel_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();
        bucket.retain(|id, conn| match conn.tx.try_send(payload.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("dropping slow connection {} ({}) on {}", id, conn.info.user_id, channel_id);
                dropped.push(conn.info.user_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("dropping closed connection {} on {}", id, channel_id);
                dropped.push(conn.info.user_id);
                false
            }
        });

        if bucket.is_empty() {
            channels.remove(&channel_id);
        }
        for user_id in dropped {
            release_user(users, user_id);
        }
        delivered
    }

    /// Encode an event and broadcast it to its channel.
    pub async fn publish(&self, event: &ChatEvent) -> usize {
        match event.encode() {
            Ok(bytes) => self.broadcast(event.channel_id, Bytes::from(bytes)).await,
            Err(e) => {
                warn!("failed to encode {:?} event for {}: {}", event.kind, event.channel_id, e);
                0
            }
        }
    }

    pub async fn connection_count(&self, channel_id: Uuid) -> usize {
        self.inner
            .registry
            .lock()
            .await
            .channels
            .get(&channel_id)
            .map_or(0, HashMap::len)
    }

    /// Drop every connection, closing all queues so writers wind down.
    pub async fn shutdown(&self) {
        let drained = std::mem::take(&mut *self.inner.registry.lock().await);
        let total: usize = drained.channels.values().map(HashMap::len).sum();
        drop(drained);
        info!("hub shut down, closed {} connections", total);
    }
}

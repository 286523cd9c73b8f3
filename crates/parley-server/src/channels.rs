use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_core::events::ServerEvent;
use parley_core::identity::{Identity, Role};
use parley_core::ids::ParticipantId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CHANNEL_TIMEOUT: Duration = Duration::from_secs(90);

/// Unique identifier for one WebSocket connection. A participant may hold
/// several at once (multiple tabs, phone + desktop).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(pub String);

impl Default for ChannelId {
    fn default() -> Self {
        Self(format!("chan_{}", Uuid::now_v7()))
    }
}

impl ChannelId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One connected channel. The identity is fixed at registration; role
/// group membership never changes for the life of the connection.
pub struct Channel {
    pub id: ChannelId,
    pub identity: Identity,
    pub tx: mpsc::Sender<String>,
    pub connected: AtomicBool,
    pub last_pong: AtomicU64,
}

impl Channel {
    fn new(id: ChannelId, identity: Identity, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            identity,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CHANNEL_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected channels, indexed for identity-directed and
/// role-group delivery.
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, Arc<Channel>>,
    max_send_queue: usize,
}

impl ChannelRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            channels: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new channel for an authenticated identity.
    pub fn register(&self, identity: Identity) -> (ChannelId, mpsc::Receiver<String>) {
        let id = ChannelId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let channel = Arc::new(Channel::new(id.clone(), identity, tx));
        self.channels.insert(id.clone(), channel);
        (id, rx)
    }

    /// Remove a channel. Returns true when its identity now has no
    /// remaining connections at all.
    pub fn unregister(&self, id: &ChannelId) -> bool {
        let Some((_, channel)) = self.channels.remove(id) else {
            return false;
        };
        channel.connected.store(false, Ordering::Relaxed);
        !self.is_online(&channel.identity.id)
    }

    pub fn identity_of(&self, id: &ChannelId) -> Option<Identity> {
        self.channels.get(id).map(|c| c.identity.clone())
    }

    pub fn is_online(&self, participant: &ParticipantId) -> bool {
        self.channels
            .iter()
            .any(|entry| entry.identity.id == *participant && entry.is_connected())
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }

    /// Send a raw frame to one channel. Full queues drop the frame with a
    /// warn rather than blocking the caller.
    pub fn send_raw(&self, id: &ChannelId, frame: String) -> bool {
        let Some(channel) = self.channels.get(id) else {
            return false;
        };
        match channel.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(
                    channel_id = %id,
                    frame_len = frame.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver an event to every channel of one identity. Returns false
    /// when the participant is fully offline.
    pub fn emit_to_identity(&self, participant: &ParticipantId, event: &ServerEvent) -> bool {
        let Ok(frame) = serde_json::to_string(event) else {
            return false;
        };
        let mut delivered = false;
        for entry in self.channels.iter() {
            if entry.identity.id == *participant && entry.is_connected() {
                delivered |= entry.tx.try_send(frame.clone()).is_ok();
            }
        }
        delivered
    }

    /// Broadcast an event to every channel registered under a role.
    pub fn emit_to_group(&self, role: Role, event: &ServerEvent) {
        let Ok(frame) = serde_json::to_string(event) else {
            return;
        };
        for entry in self.channels.iter() {
            if entry.identity.role == role && entry.is_connected() {
                let _ = entry.tx.try_send(frame.clone());
            }
        }
    }

    /// Agents and admins together: the audience for escalation traffic.
    pub fn emit_to_staff(&self, event: &ServerEvent) {
        self.emit_to_group(Role::Agent, event);
        self.emit_to_group(Role::Admin, event);
    }

    /// Drop channels that stopped answering pings.
    pub fn cleanup_dead_channels(&self) -> usize {
        let dead: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|entry| !entry.is_alive())
            .map(|entry| entry.id.clone())
            .collect();

        let removed = dead.len();
        for id in dead {
            self.unregister(&id);
            tracing::info!(channel_id = %id, "cleaned up dead channel");
        }
        removed
    }

    fn record_pong(&self, id: &ChannelId) {
        if let Some(channel) = self.channels.get(id) {
            channel.record_pong();
        }
    }

    fn mark_disconnected(&self, id: &ChannelId) {
        if let Some(channel) = self.channels.get(id) {
            channel.connected.store(false, Ordering::Relaxed);
        }
    }
}

/// Drive a WebSocket connection: writer forwards queued frames and pings,
/// reader feeds inbound frames to the dispatcher and tracks pongs.
pub async fn handle_ws_connection(
    socket: WebSocket,
    channel_id: ChannelId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ChannelRegistry>,
    on_frame: mpsc::Sender<(ChannelId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = channel_id.clone();
    let writer_registry = Arc::clone(&registry);
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        writer_registry.mark_disconnected(&writer_cid);
    });

    let reader_cid = channel_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_frame.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_cid),
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    let fully_offline = registry.unregister(&channel_id);
    tracing::info!(channel_id = %channel_id, fully_offline, "channel closed");
}

/// Periodically sweep channels that stopped answering pings.
pub fn start_cleanup_task(
    registry: Arc<ChannelRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_channels();
            if removed > 0 {
                tracing::info!(removed, "dead channel cleanup");
            }
        }
    })
}

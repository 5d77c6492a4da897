use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    User(Ulid),
    /// Everyone on the team.
    Team,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// An assigned task was unblocked.
    TaskReady,
    /// An unassigned task was unblocked and can be claimed.
    TaskAvailable,
    TaskCompleted,
}

impl NotificationKind {
    pub fn label(self) -> &'static str {
        match self {
            NotificationKind::TaskReady => "task_ready",
            NotificationKind::TaskAvailable => "task_available",
            NotificationKind::TaskCompleted => "task_completed",
        }
    }
}

/// A notification the engine wants delivered. Produced by state transitions,
/// delivered after they commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub task_id: Ulid,
    pub event_id: Ulid,
    pub title: String,
}

impl NotificationIntent {
    /// Body handed to push delivery.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind.label(),
            "task_id": self.task_id.to_string(),
            "event_id": self.event_id.to_string(),
            "title": self.title,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Rejected(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Rejected(e) => write!(f, "dispatch rejected: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Fire-and-forget delivery. Must not block.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, intent: &NotificationIntent) -> Result<(), DispatchError>;
}

/// Broadcast hub with one channel per recipient.
pub struct NotifyHub {
    channels: DashMap<Recipient, broadcast::Sender<NotificationIntent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: Recipient) -> broadcast::Receiver<NotificationIntent> {
        let sender = self
            .channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Remove a channel (e.g. when a user leaves the team).
    pub fn remove(&self, recipient: &Recipient) {
        self.channels.remove(recipient);
    }
}

impl Dispatcher for NotifyHub {
    /// No-op if nobody is listening.
    fn dispatch(&self, intent: &NotificationIntent) -> Result<(), DispatchError> {
        if let Some(sender) = self.channels.get(&intent.recipient) {
            let _ = sender.send(intent.clone());
        }
        Ok(())
    }
}

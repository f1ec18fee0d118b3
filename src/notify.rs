use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::model::{SpotId, UserId};

const CHANNEL_CAPACITY: usize = 256;

/// A push notification addressed to one device token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub user_id: UserId,
    pub token: String,
    pub spot_id: SpotId,
    pub spot_name: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push delivery failed: {0}")]
    Delivery(String),
}

/// Delivery seam for push messages. Provider integrations plug in here.
pub trait PushSender: Send + Sync {
    fn send(&self, message: &PushMessage) -> Result<(), PushError>;
}

/// In-process push delivery: one broadcast channel per user.
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<PushMessage>>,
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

    /// Listen for a user's push messages. Creates the channel if needed.
    pub fn subscribe(&self, user_id: UserId) -> broadcast::Receiver<PushMessage> {
        self.channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

impl PushSender for NotifyHub {
    /// Never fails; a user nobody listens for just gets the log line.
    fn send(&self, message: &PushMessage) -> Result<(), PushError> {
        info!("push to user {} ({}): {}", message.user_id, message.token, message.body);
        if let Some(sender) = self.channels.get(&message.user_id) {
            let _ = sender.send(message.clone());
        }
        Ok(())
    }
}

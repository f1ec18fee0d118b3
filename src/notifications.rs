use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{PushMessage, PushSender};
use crate::store::{StorageError, Store};

/// Fan-out hook invoked once per successful sync cycle.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_all(&self);
}

/// Push tokens, spot subscriptions, and the "spot is free" fan-out.
pub struct NotificationService {
    store: Arc<Store>,
    sender: Arc<dyn PushSender>,
    /// Occupancy of each subscribed spot at the previous fan-out.
    last_seen: DashMap<SpotId, bool>,
}

impl NotificationService {
    pub fn new(store: Arc<Store>, sender: Arc<dyn PushSender>) -> Self {
        Self {
            store,
            sender,
            last_seen: DashMap::new(),
        }
    }

    pub async fn save_push_token(&self, user_id: UserId, token: String) -> Result<(), StorageError> {
        self.store.save_push_token(user_id, token).await?;
        info!("registered push token for user {user_id}");
        Ok(())
    }

    pub async fn delete_push_token(&self, user_id: UserId) -> Result<(), StorageError> {
        if self.store.delete_push_token(user_id).await? {
            info!("deleted push token for user {user_id}");
        }
        Ok(())
    }

    pub async fn subscribe(&self, user_id: UserId, spot_id: SpotId) -> Result<Subscription, StorageError> {
        let sub = self.store.subscribe(user_id, spot_id).await?;
        info!("user {user_id} subscribed to spot {spot_id} ({})", sub.notification_id);
        Ok(sub)
    }

    pub fn user_notifications(&self, user_id: &UserId) -> Vec<Subscription> {
        self.store.user_subscriptions(user_id)
    }

    pub async fn unsubscribe(&self, notification_id: Ulid) -> Result<(), StorageError> {
        if self.store.unsubscribe(notification_id).await? {
            info!("unsubscribed notification {notification_id}");
        }
        Ok(())
    }

    pub async fn unsubscribe_user_from_spot(&self, user_id: UserId, spot_id: SpotId) -> Result<(), StorageError> {
        if self.store.unsubscribe_user_from_spot(user_id, spot_id).await? {
            info!("user {user_id} unsubscribed from spot {spot_id}");
        }
        Ok(())
    }

    /// Message every subscriber of a spot that is vacant now but was not
    /// vacant at the previous fan-out. Returns how many messages went out.
    pub fn fan_out(&self) -> usize {
        let mut by_spot: BTreeMap<SpotId, Vec<Subscription>> = BTreeMap::new();
        for sub in self.store.subscriptions() {
            by_spot.entry(sub.spot_id).or_default().push(sub);
        }

        let mut sent = 0;
        for (spot_id, subs) in by_spot {
            let Some(spot) = self.store.spot(&spot_id) else {
                continue;
            };
            let previous = self.last_seen.insert(spot_id, spot.occupied);
            if spot.occupied || previous == Some(false) {
                continue;
            }
            for sub in subs {
                let Some(token) = self.store.push_token(&sub.user_id) else {
                    debug!("user {} has no push token, skipping", sub.user_id);
                    continue;
                };
                let message = PushMessage {
                    user_id: sub.user_id,
                    token,
                    spot_id,
                    spot_name: spot.name.clone(),
                    body: format!("Parking spot {} is now available", spot.name),
                };
                match self.sender.send(&message) {
                    Ok(()) => {
                        sent += 1;
                        metrics::counter!(crate::observability::PUSH_MESSAGES_TOTAL, "status" => "ok")
                            .increment(1);
                    }
                    Err(e) => {
                        warn!("push to user {} failed: {e}", sub.user_id);
                        metrics::counter!(crate::observability::PUSH_MESSAGES_TOTAL, "status" => "error")
                            .increment(1);
                    }
                }
            }
        }
        sent
    }
}

#[async_trait]
impl Notifier for NotificationService {
    async fn notify_all(&self) {
        let sent = self.fan_out();
        info!("notification fan-out: {sent} messages");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{NotifyHub, PushError};
    use crate::store::SpotDirectory;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("spotwatch_test_notifications");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    struct FailingSender;

    impl PushSender for FailingSender {
        fn send(&self, _message: &PushMessage) -> Result<(), PushError> {
            Err(PushError::Delivery("provider down".into()))
        }
    }

    async fn setup(name: &str) -> (Arc<Store>, Arc<NotifyHub>, NotificationService) {
        let store = Arc::new(Store::open(test_wal_path(name)).unwrap());
        let hub = Arc::new(NotifyHub::new());
        let service = NotificationService::new(store.clone(), hub.clone());
        (store, hub, service)
    }

    #[tokio::test]
    async fn vacant_spot_notifies_subscriber_once() {
        let (store, hub, service) = setup("once.wal").await;
        let spot = store.register_spot("A1", None).await.unwrap();
        let user = Ulid::new();
        service.save_push_token(user, "device-1".into()).await.unwrap();
        service.subscribe(user, spot.spot_id).await.unwrap();
        let mut rx = hub.subscribe(user);

        assert_eq!(service.fan_out(), 1);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.spot_name, "A1");
        assert_eq!(msg.token, "device-1");

        // Still vacant: nothing new to say.
        assert_eq!(service.fan_out(), 0);
    }

    #[tokio::test]
    async fn spot_freeing_up_again_notifies_again() {
        let (store, _hub, service) = setup("again.wal").await;
        let spot = store.register_spot("A1", None).await.unwrap();
        let user = Ulid::new();
        service.save_push_token(user, "device-1".into()).await.unwrap();
        service.subscribe(user, spot.spot_id).await.unwrap();

        store.update_occupancy(spot.spot_id, true).await.unwrap();
        assert_eq!(service.fan_out(), 0);
        store.update_occupancy(spot.spot_id, false).await.unwrap();
        assert_eq!(service.fan_out(), 1);
    }

    #[tokio::test]
    async fn users_without_token_are_skipped() {
        let (store, _hub, service) = setup("no_token.wal").await;
        let spot = store.register_spot("A1", None).await.unwrap();
        let with_token = Ulid::new();
        service.save_push_token(with_token, "device-1".into()).await.unwrap();
        service.subscribe(with_token, spot.spot_id).await.unwrap();
        service.subscribe(Ulid::new(), spot.spot_id).await.unwrap();

        assert_eq!(service.fan_out(), 1);
    }

    #[tokio::test]
    async fn delivery_failures_are_swallowed() {
        let store = Arc::new(Store::open(test_wal_path("failing.wal")).unwrap());
        let service = NotificationService::new(store.clone(), Arc::new(FailingSender));
        let spot = store.register_spot("A1", None).await.unwrap();
        let user = Ulid::new();
        service.save_push_token(user, "device-1".into()).await.unwrap();
        service.subscribe(user, spot.spot_id).await.unwrap();

        service.notify_all().await;
        assert_eq!(service.fan_out(), 0);
    }

    #[tokio::test]
    async fn unsubscribed_users_get_nothing() {
        let (store, _hub, service) = setup("unsubscribed.wal").await;
        let spot = store.register_spot("A1", None).await.unwrap();
        let user = Ulid::new();
        service.save_push_token(user, "device-1".into()).await.unwrap();
        let sub = service.subscribe(user, spot.spot_id).await.unwrap();
        assert_eq!(service.user_notifications(&user), vec![sub.clone()]);

        service.unsubscribe(sub.notification_id).await.unwrap();
        assert!(service.user_notifications(&user).is_empty());
        assert_eq!(service.fan_out(), 0);
    }
}

use ulid::Ulid;

use crate::model::*;

use super::{StorageError, Store};

impl Store {
    pub async fn save_push_token(&self, user_id: UserId, token: String) -> Result<(), StorageError> {
        self.persist_and_apply(Event::PushTokenSaved { user_id, token })
            .await
    }

    /// Returns false when the user had no token.
    pub async fn delete_push_token(&self, user_id: UserId) -> Result<bool, StorageError> {
        if !self.push_tokens.contains_key(&user_id) {
            return Ok(false);
        }
        self.persist_and_apply(Event::PushTokenDeleted { user_id })
            .await?;
        Ok(true)
    }

    pub fn push_token(&self, user_id: &UserId) -> Option<String> {
        self.push_tokens.get(user_id).map(|e| e.value().clone())
    }

    /// Subscribe a user to a spot. Idempotent per (user, spot).
    pub async fn subscribe(
        &self,
        user_id: UserId,
        spot_id: SpotId,
    ) -> Result<Subscription, StorageError> {
        if !self.spots.contains_key(&spot_id) {
            return Err(StorageError::UnknownSpot(spot_id));
        }
        let _serial = self.subscription_lock.lock().await;
        if let Some(existing) = self
            .subscriptions
            .iter()
            .find(|e| e.user_id == user_id && e.spot_id == spot_id)
        {
            return Ok(existing.value().clone());
        }
        let sub = Subscription {
            notification_id: Ulid::new(),
            user_id,
            spot_id,
            created_at: now_ms(),
        };
        self.persist_and_apply(Event::NotificationSubscribed(sub.clone()))
            .await?;
        Ok(sub)
    }

    /// A user's subscriptions, oldest first.
    pub fn user_subscriptions(&self, user_id: &UserId) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|e| e.user_id == *user_id)
            .map(|e| e.value().clone())
            .collect();
        subs.sort_by_key(|s| (s.created_at, s.notification_id));
        subs
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.iter().map(|e| e.value().clone()).collect()
    }

    /// Returns false when no such subscription exists.
    pub async fn unsubscribe(&self, notification_id: Ulid) -> Result<bool, StorageError> {
        let _serial = self.subscription_lock.lock().await;
        if !self.subscriptions.contains_key(&notification_id) {
            return Ok(false);
        }
        self.persist_and_apply(Event::NotificationUnsubscribed { id: notification_id })
            .await?;
        Ok(true)
    }

    pub async fn unsubscribe_user_from_spot(
        &self,
        user_id: UserId,
        spot_id: SpotId,
    ) -> Result<bool, StorageError> {
        let _serial = self.subscription_lock.lock().await;
        let ids: Vec<Ulid> = self
            .subscriptions
            .iter()
            .filter(|e| e.user_id == user_id && e.spot_id == spot_id)
            .map(|e| *e.key())
            .collect();
        for id in &ids {
            self.persist_and_apply(Event::NotificationUnsubscribed { id: *id })
                .await?;
        }
        Ok(!ids.is_empty())
    }
}

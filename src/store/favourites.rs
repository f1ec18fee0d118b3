use crate::model::*;

use super::{StorageError, Store};

impl Store {
    /// Set or clear a user's favourite spot. One favourite per user; setting
    /// a new one replaces the old.
    pub async fn set_favourite_spot(
        &self,
        user_id: UserId,
        spot_id: Option<SpotId>,
    ) -> Result<(), StorageError> {
        if let Some(spot_id) = spot_id {
            if !self.spots.contains_key(&spot_id) {
                return Err(StorageError::UnknownSpot(spot_id));
            }
        }
        self.persist_and_apply(Event::FavouriteSpotSet { user_id, spot_id })
            .await
    }

    pub fn favourite_spot(&self, user_id: &UserId) -> Option<SpotId> {
        self.favourites.get(user_id).map(|e| *e.value())
    }

    /// Everyone whose favourite is `spot_id`, in id order.
    pub fn users_with_favourite_spot(&self, spot_id: &SpotId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .favourites
            .iter()
            .filter(|e| e.value() == spot_id)
            .map(|e| *e.key())
            .collect();
        users.sort();
        users
    }
}

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub type SpotId = Ulid;
pub type UserId = Ulid;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub longitude: f64,
    pub latitude: f64,
}

/// A physical parking location with its live occupancy flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spot {
    pub spot_id: SpotId,
    pub name: String,
    pub coordinates: Option<Coordinates>,
    pub occupied: bool,
}

/// History entry as it is persisted in the WAL. Never handed out directly:
/// every read goes through `HistoryRecord::try_from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub history_id: Ulid,
    pub spot_id: SpotId,
    pub occupied: bool,
    pub occupied_since: Option<Ms>,
    pub updated_at: Ms,
}

/// One immutable occupancy observation for a spot.
///
/// `occupied_since` is present iff `occupied`, and holds the start of the
/// current unbroken occupied streak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub history_id: Ulid,
    pub spot_id: SpotId,
    pub occupied: bool,
    pub occupied_since: Option<Ms>,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("history row {history_id}: occupied={occupied} with occupied_since={occupied_since:?}")]
pub struct InvalidRecord {
    pub history_id: Ulid,
    pub occupied: bool,
    pub occupied_since: Option<Ms>,
}

impl TryFrom<HistoryRow> for HistoryRecord {
    type Error = InvalidRecord;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        if row.occupied != row.occupied_since.is_some() {
            return Err(InvalidRecord {
                history_id: row.history_id,
                occupied: row.occupied,
                occupied_since: row.occupied_since,
            });
        }
        Ok(Self {
            history_id: row.history_id,
            spot_id: row.spot_id,
            occupied: row.occupied,
            occupied_since: row.occupied_since,
            updated_at: row.updated_at,
        })
    }
}

impl From<&HistoryRecord> for HistoryRow {
    fn from(record: &HistoryRecord) -> Self {
        Self {
            history_id: record.history_id,
            spot_id: record.spot_id,
            occupied: record.occupied,
            occupied_since: record.occupied_since,
            updated_at: record.updated_at,
        }
    }
}

/// A user's request to be told when a spot frees up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub notification_id: Ulid,
    pub user_id: UserId,
    pub spot_id: SpotId,
    pub created_at: Ms,
}

/// Raw aggregation row: one per registered spot.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyCountRow {
    pub name: String,
    pub times_occupied: u64,
    pub coordinates: Option<Coordinates>,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SpotRegistered {
        id: SpotId,
        name: String,
        coordinates: Option<Coordinates>,
    },
    OccupancyUpdated {
        spot_id: SpotId,
        occupied: bool,
    },
    HistoryAppended(HistoryRow),
    PushTokenSaved {
        user_id: UserId,
        token: String,
    },
    PushTokenDeleted {
        user_id: UserId,
    },
    NotificationSubscribed(Subscription),
    NotificationUnsubscribed {
        id: Ulid,
    },
    /// `None` clears the user's favourite.
    FavouriteSpotSet {
        user_id: UserId,
        spot_id: Option<SpotId>,
    },
}

mod error;
mod favourites;
mod history;
mod notifications;
mod spots;

pub use error::StorageError;
pub use spots::SpotSeed;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

/// History of one spot, ascending by `updated_at`.
pub type SharedHistory = Arc<RwLock<Vec<HistoryRecord>>>;

/// Append-only occupancy history keyed by spot.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert a new record stamped with the current time. Never overwrites.
    async fn append(
        &self,
        spot_id: SpotId,
        occupied: bool,
        occupied_since: Option<Ms>,
    ) -> Result<HistoryRecord, StorageError>;

    /// The record with the greatest `updated_at`, if any.
    async fn latest(&self, spot_id: SpotId) -> Result<Option<HistoryRecord>, StorageError>;

    /// Every record, most recent first. `None` when the spot has no history.
    async fn all(&self, spot_id: SpotId) -> Result<Option<Vec<HistoryRecord>>, StorageError>;

    /// One row per registered spot: occupied-record count plus coordinates.
    async fn aggregate_occupancy_counts(&self) -> Result<Vec<OccupancyCountRow>, StorageError>;
}

#[async_trait]
pub trait SpotDirectory: Send + Sync {
    async fn spot_by_name(&self, name: &str) -> Result<Option<Spot>, StorageError>;

    async fn update_occupancy(&self, spot_id: SpotId, occupied: bool) -> Result<(), StorageError>;
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Blocks for the first append, drains whatever else is already
/// queued, then commits the batch with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // All or nothing: a failed batch must not leave partial frames behind
    // for the next one to land on.
    if let Err(e) = &result {
        tracing::error!("WAL batch of {} failed: {e}", batch.len());
        if let Err(rollback) = wal.rollback() {
            tracing::error!("WAL rollback failed: {rollback}");
            result = Err(rollback);
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// WAL-backed state: spots, occupancy history, push tokens, subscriptions
/// and favourite spots.
pub struct Store {
    pub(super) spots: DashMap<SpotId, Spot>,
    pub(super) names: DashMap<String, SpotId>,
    pub(super) histories: DashMap<SpotId, SharedHistory>,
    pub(super) push_tokens: DashMap<UserId, String>,
    pub(super) favourites: DashMap<UserId, SpotId>,
    pub(super) subscriptions: DashMap<Ulid, Subscription>,
    /// Serializes subscription check-then-write sequences. Taken before `gate`.
    pub(super) subscription_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation and exclusively by compaction, so a
    /// snapshot never misses a concurrent write. Always taken before any
    /// per-spot history lock.
    pub(super) gate: RwLock<()>,
}

impl Store {
    /// Replay the WAL at `wal_path` and start the background writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> Result<Self, StorageError> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            spots: DashMap::new(),
            names: DashMap::new(),
            histories: DashMap::new(),
            push_tokens: DashMap::new(),
            favourites: DashMap::new(),
            subscriptions: DashMap::new(),
            subscription_lock: Mutex::new(()),
            wal_tx,
            gate: RwLock::new(()),
        };

        let replayed = events.len();
        for event in events {
            store.apply_replayed(event)?;
        }
        tracing::info!(
            "store opened: {replayed} events, {} spots, {} subscriptions",
            store.spots.len(),
            store.subscriptions.len()
        );
        Ok(store)
    }

    /// Rebuild state from one logged event. Nothing else holds the history
    /// locks yet, so `try_write` never contends.
    fn apply_replayed(&self, event: Event) -> Result<(), StorageError> {
        match event {
            Event::HistoryAppended(row) => {
                let record = HistoryRecord::try_from(row)
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?;
                let history = self.history_for(record.spot_id);
                let mut guard = history
                    .try_write()
                    .map_err(|_| StorageError::Corrupt("history locked during replay".into()))?;
                guard.push(record);
                Ok(())
            }
            other => {
                self.apply(other);
                Ok(())
            }
        }
    }

    /// Apply a non-history event to in-memory state (caller already logged it).
    pub(super) fn apply(&self, event: Event) {
        match event {
            Event::SpotRegistered { id, name, coordinates } => {
                self.names.insert(name.clone(), id);
                self.spots.insert(
                    id,
                    Spot {
                        spot_id: id,
                        name,
                        coordinates,
                        occupied: false,
                    },
                );
            }
            Event::OccupancyUpdated { spot_id, occupied } => {
                if let Some(mut spot) = self.spots.get_mut(&spot_id) {
                    spot.occupied = occupied;
                }
            }
            Event::PushTokenSaved { user_id, token } => {
                self.push_tokens.insert(user_id, token);
            }
            Event::PushTokenDeleted { user_id } => {
                self.push_tokens.remove(&user_id);
            }
            Event::NotificationSubscribed(sub) => {
                self.subscriptions.insert(sub.notification_id, sub);
            }
            Event::NotificationUnsubscribed { id } => {
                self.subscriptions.remove(&id);
            }
            Event::FavouriteSpotSet { user_id, spot_id } => match spot_id {
                Some(spot_id) => {
                    self.favourites.insert(user_id, spot_id);
                }
                None => {
                    self.favourites.remove(&user_id);
                }
            },
            // History goes through the per-spot lock, never through here.
            Event::HistoryAppended(_) => {}
        }
    }

    pub(super) fn history_for(&self, spot_id: SpotId) -> SharedHistory {
        self.histories.entry(spot_id).or_default().value().clone()
    }

    /// Write an event through the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StorageError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StorageError::Wal(e.to_string()))
    }

    /// Log then apply, under the shared compaction gate.
    pub(super) async fn persist_and_apply(&self, event: Event) -> Result<(), StorageError> {
        let _gate = self.gate.read().await;
        self.wal_append(&event).await?;
        self.apply(event);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as the minimal event set reproducing current state.
    /// History is append-only, so every record is carried over.
    pub async fn compact_wal(&self) -> Result<usize, StorageError> {
        let _gate = self.gate.write().await;

        let mut events = Vec::new();
        for entry in self.spots.iter() {
            let spot = entry.value();
            events.push(Event::SpotRegistered {
                id: spot.spot_id,
                name: spot.name.clone(),
                coordinates: spot.coordinates,
            });
            if spot.occupied {
                events.push(Event::OccupancyUpdated {
                    spot_id: spot.spot_id,
                    occupied: true,
                });
            }
        }

        let histories: Vec<SharedHistory> =
            self.histories.iter().map(|e| e.value().clone()).collect();
        for history in histories {
            let guard = history.read().await;
            events.extend(guard.iter().map(|r| Event::HistoryAppended(HistoryRow::from(r))));
        }

        for entry in self.push_tokens.iter() {
            events.push(Event::PushTokenSaved {
                user_id: *entry.key(),
                token: entry.value().clone(),
            });
        }
        for entry in self.subscriptions.iter() {
            events.push(Event::NotificationSubscribed(entry.value().clone()));
        }
        for entry in self.favourites.iter() {
            events.push(Event::FavouriteSpotSet {
                user_id: *entry.key(),
                spot_id: Some(*entry.value()),
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StorageError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::Wal("WAL writer dropped response".into()))??;
        Ok(count)
    }
}

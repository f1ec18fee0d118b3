//! Parking-spot occupancy tracking.
//!
//! A periodic sync pulls live occupancy from the external provider, folds each
//! reading into an append-only per-spot history (`reconcile`), and tells
//! subscribed users when a spot frees up. History, spots, push tokens and
//! subscriptions live in a WAL-backed in-memory store.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod model;
pub mod notifications;
pub mod notify;
pub mod observability;
pub mod provider;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod tasks;
pub mod wal;

//! Cache d'inventaire vSphere : lectures hiérarchiques (datacenters → clusters →
//! ressources d'un cluster) servies depuis la mémoire, Redis, un snapshot disque
//! ou vCenter, avec synchronisation de fond et repli simulé.

pub mod coalesce;
pub mod config;
pub mod delta;
pub mod events;
pub mod fetchers;
pub mod health;
pub mod http;
pub mod loader;
pub mod models;
pub mod mqtt;
pub mod retry;
pub mod scope;
pub mod simulation;
pub mod snapshot;
pub mod state;
pub mod status;
pub mod store;
pub mod sync;
pub mod vcenter;

pub use events::{CacheEvent, EventKind, ListenerId};
pub use loader::{InventoryCache, InventorySettings, LoadError, TtlPolicy};
pub use models::{ClusterInventory, DataSource, Listing, ResourceKind};
pub use scope::{scope_key, Credentials, ScopeKey};
pub use store::{CacheStore, StoreSettings};
pub use sync::{SyncOutcome, SyncSettings, SyncWorker};

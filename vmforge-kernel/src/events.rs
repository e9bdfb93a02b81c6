/**
 * EVENTS - Bus de notifications du cache d'inventaire
 *
 * RÔLE :
 * Prévient les abonnés (endpoint de statut, pont MQTT, tests) des étapes de
 * chargement : cache relu depuis le disque, chargement démarré / terminé /
 * en erreur, progression et fin d'une synchro de fond, purge du cache.
 *
 * FONCTIONNEMENT :
 * - `add_listener(callback) -> ListenerId`, `remove_listener(id)`
 * - `emit` ne bloque jamais : l'événement part dans un canal, une tâche
 *   unique de dispatch appelle les listeners dans l'ordre d'émission
 * - Un listener qui panique est isolé (loggé), les autres continuent
 */

use crate::state::{new_state, Shared};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CacheLoadedFromDisk,
    LoadingStarted,
    LoadingCompleted,
    LoadingError,
    SyncProgress,
    BackgroundSyncCompleted,
    CacheCleared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListenerId(Uuid);

pub type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Clone)]
pub struct EventBus {
    listeners: Shared<BTreeMap<ListenerId, Listener>>,
    tx: mpsc::UnboundedSender<CacheEvent>,
}

impl EventBus {
    /// Doit être appelé dans un runtime tokio (spawn de la tâche de dispatch)
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CacheEvent>();
        let listeners: Shared<BTreeMap<ListenerId, Listener>> = new_state(BTreeMap::new());

        let dispatch_listeners = listeners.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // copie hors verrou : un listener peut (dé)inscrire sans deadlock
                let current: Vec<(ListenerId, Listener)> = dispatch_listeners
                    .lock()
                    .iter()
                    .map(|(id, l)| (*id, l.clone()))
                    .collect();
                for (id, listener) in current {
                    if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                        error!(listener = ?id, kind = ?event.kind, "event listener panicked");
                    }
                }
            }
            debug!("event dispatch loop stopped");
        });

        Self { listeners, tx }
    }

    pub fn add_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(Uuid::new_v4());
        self.listeners.lock().insert(id, Arc::new(callback));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn emit(&self, kind: EventKind, data: serde_json::Value) {
        if self.tx.send(CacheEvent::new(kind, data)).is_err() {
            debug!(?kind, "event dropped, dispatch loop gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_listeners_receive_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.add_listener(move |e| sink.lock().push(e.kind));

        bus.emit(EventKind::LoadingStarted, json!({"type": "datacenter"}));
        bus.emit(EventKind::LoadingCompleted, json!({"type": "datacenter"}));
        settle().await;

        assert_eq!(*seen.lock(), vec![EventKind::LoadingStarted, EventKind::LoadingCompleted]);
    }

    #[tokio::test]
    async fn test_removed_listener_stops_receiving() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0u32));
        let sink = seen.clone();
        let id = bus.add_listener(move |_| *sink.lock() += 1);

        bus.emit(EventKind::CacheCleared, json!({}));
        settle().await;
        assert!(bus.remove_listener(id));
        bus.emit(EventKind::CacheCleared, json!({}));
        settle().await;

        assert_eq!(*seen.lock(), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0u32));
        let sink = seen.clone();
        bus.add_listener(|_| panic!("listener bug"));
        bus.add_listener(move |_| *sink.lock() += 1);

        bus.emit(EventKind::SyncProgress, json!({}));
        bus.emit(EventKind::SyncProgress, json!({}));
        settle().await;

        assert_eq!(*seen.lock(), 2);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = CacheEvent::new(EventKind::BackgroundSyncCompleted, json!({"scopes": 2}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "background_sync_completed");
        assert_eq!(value["data"]["scopes"], 2);
        assert!(value["timestamp"].is_string());
    }
}

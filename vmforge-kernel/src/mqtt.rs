/**
 * PONT MQTT - Publication des événements du cache et du health kernel
 *
 * RÔLE :
 * Relaie chaque événement du bus (chargements, synchro, purge) en JSON sur
 * `vmforge/inventory/events@v1` et publie le health du kernel toutes les 30s
 * sur `vmforge/kernel/health@v1`.
 *
 * FONCTIONNEMENT :
 * - Listener enregistré sur le cache : `try_publish` non bloquant (la file
 *   du client absorbe les rafales, au-delà l'événement est perdu et loggé)
 * - Une tâche pilote l'eventloop rumqttc + le timer health (select!)
 * - Erreur MQTT => compteur de reconnexions + pause 2s, jamais fatal
 */

use crate::config::MqttConf;
use crate::events::ListenerId;
use crate::health::HealthTracker;
use crate::loader::InventoryCache;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

pub const EVENTS_TOPIC: &str = "vmforge/inventory/events@v1";
pub const HEALTH_TOPIC: &str = "vmforge/kernel/health@v1";

pub struct MqttBridge {
    listener: ListenerId,
    task: JoinHandle<()>,
}

impl MqttBridge {
    pub fn stop(self, cache: &InventoryCache) {
        cache.remove_listener(self.listener);
        self.task.abort();
    }
}

pub fn create_mqtt_client(cfg: &MqttConf) -> (AsyncClient, rumqttc::EventLoop) {
    let mut opts = MqttOptions::new("vmforge-kernel", &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(15));
    AsyncClient::new(opts, 64)
}

pub fn spawn_mqtt_bridge(
    cfg: &MqttConf,
    cache: InventoryCache,
    health: HealthTracker,
) -> MqttBridge {
    let (client, mut eventloop) = create_mqtt_client(cfg);
    health.mark_mqtt_connecting();

    let publisher = client.clone();
    let listener = cache.add_listener(move |event| match serde_json::to_vec(event) {
        Ok(payload) => {
            if let Err(e) = publisher.try_publish(EVENTS_TOPIC, QoS::AtLeastOnce, false, payload) {
                warn!(kind = ?event.kind, error = %e, "inventory event not published");
            }
        }
        Err(e) => warn!(error = %e, "inventory event not serializable"),
    });

    info!(host = %cfg.host, port = cfg.port, topic = EVENTS_TOPIC, "MQTT bridge started");
    let task = task::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = health.get_health(&cache);
                    match serde_json::to_vec(&snapshot) {
                        Ok(payload) => {
                            let published = client
                                .publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload)
                                .await;
                            if let Err(e) = published {
                                warn!(error = ?e, "failed to publish kernel health");
                            } else {
                                debug!(uptime = snapshot.uptime_seconds, "published kernel health");
                            }
                        }
                        Err(e) => warn!(error = %e, "kernel health not serializable"),
                    }
                },
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("MQTT connected");
                            health.mark_mqtt_connected();
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = ?e, "MQTT error");
                            health.increment_reconnects();
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }
    });

    MqttBridge { listener, task }
}

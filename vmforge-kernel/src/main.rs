/**
 * VMFORGE KERNEL - Point d'entrée du service de cache d'inventaire vSphere
 *
 * RÔLE : config → cache store → service d'inventaire → snapshot (démarrage à
 * chaud) → synchro de fond → pont MQTT optionnel → API HTTP.
 *
 * ARRÊT : Ctrl-C => fin du serveur HTTP, arrêt borné de la synchro et des
 * tâches templates, dernier snapshot écrit sur disque.
 */

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vmforge_kernel::config::load_config;
use vmforge_kernel::health::HealthTracker;
use vmforge_kernel::http::{build_router, AppState};
use vmforge_kernel::mqtt::spawn_mqtt_bridge;
use vmforge_kernel::vcenter::RestConnector;
use vmforge_kernel::{CacheStore, InventoryCache, SyncWorker};

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vmforge_kernel=info")),
        )
        .init();

    let cfg = load_config().await;
    let addr = cfg.http_addr().context("invalid HTTP listen address")?;

    let store = CacheStore::connect(&cfg.store_settings()).await;
    let connector = Arc::new(RestConnector::new(cfg.vsphere.insecure_tls, cfg.vcenter_timeout()));
    let cache = InventoryCache::new(cfg.inventory_settings(), connector, store);
    cache.warm_start().await;

    let health_tracker = HealthTracker::new();
    let mqtt = cfg
        .mqtt
        .as_ref()
        .map(|mqtt_cfg| spawn_mqtt_bridge(mqtt_cfg, cache.clone(), health_tracker.clone()));

    let sync = SyncWorker::new(cache.clone(), cfg.sync_settings());
    let sync_handle = sync.spawn();

    let app = build_router(AppState {
        cache: cache.clone(),
        sync,
        health_tracker,
        api_key: Arc::from(cfg.http.api_key.as_str()),
    });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(
        %addr,
        scope = %cache.scope(),
        simulated = cache.is_simulated(),
        "vmforge kernel listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    sync_handle.shutdown(Duration::from_secs(10)).await;
    if let Some(bridge) = mqtt {
        bridge.stop(&cache);
    }
    cache.shutdown().await;
    Ok(())
}

/**
 * API REST VMFORGE - Surface HTTP du cache d'inventaire
 *
 * RÔLE :
 * Adaptateur fin au-dessus du service `InventoryCache` pour le portail de
 * provisioning (formulaires de sélection) et l'administration du cache.
 *
 * FONCTIONNEMENT :
 * - Lectures : datacenters, clusters d'un datacenter, ressources d'un cluster
 *   (`?force=true` => chargement synchrone)
 * - Administration : statut, synchro manuelle, purge, invalidation
 * - Les lectures renvoient toujours 200 avec un `Listing` étiqueté ; seul un
 *   paramètre invalide donne une erreur HTTP
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health* quand une clé
 *   est configurée
 */

use crate::health::{HealthTracker, KernelHealth};
use crate::loader::InventoryCache;
use crate::models::{Cluster, ClusterInventory, Datacenter, Listing, ResourceKind};
use crate::status::CacheStatus;
use crate::sync::{SyncOutcome, SyncWorker};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub cache: InventoryCache,
    pub sync: SyncWorker,
    pub health_tracker: HealthTracker,
    /// Vide = pas d'authentification
    pub api_key: Arc<str>,
}

#[derive(Debug, Default, Deserialize)]
struct ForceParams {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceParams {
    name: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
struct KindParams {
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl KindParams {
    /// `None` = tous les types ; type inconnu => 400
    fn parse(&self) -> Result<Option<ResourceKind>, StatusCode> {
        match self.kind.as_deref().map(str::trim).filter(|k| !k.is_empty() && *k != "all") {
            None => Ok(None),
            Some(kind) => ResourceKind::parse(kind).map(Some).ok_or(StatusCode::BAD_REQUEST),
        }
    }
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    if path.starts_with("/health") || app.api_key.is_empty() {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == &*app.api_key)
        .unwrap_or(false);

    if !ok {
        warn!(path, "rejected request without valid x-api-key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/inventory/datacenters", get(get_datacenters))
        .route("/inventory/datacenters/{name}/clusters", get(get_clusters))
        .route("/inventory/clusters/{id}/resources", get(get_resources))
        .route("/inventory/status", get(get_status))
        .route("/inventory/sync", post(trigger_sync))
        .route("/inventory/cache", delete(clear_cache))
        .route("/inventory/invalidate", post(invalidate))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.cache))
}

// GET /inventory/datacenters?force=
async fn get_datacenters(
    State(app): State<AppState>,
    Query(params): Query<ForceParams>,
) -> Json<Listing<Datacenter>> {
    Json(app.cache.get_datacenters(params.force).await)
}

// GET /inventory/datacenters/{name}/clusters?force=
async fn get_clusters(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<ForceParams>,
) -> Json<Listing<Cluster>> {
    Json(app.cache.get_clusters(&name, params.force).await)
}

// GET /inventory/clusters/{id}/resources?name=&force=
async fn get_resources(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ResourceParams>,
) -> Json<ClusterInventory> {
    Json(app.cache.get_resources(&id, params.name.as_deref(), params.force).await)
}

// GET /inventory/status
async fn get_status(State(app): State<AppState>) -> Json<CacheStatus> {
    Json(app.cache.get_status())
}

// POST /inventory/sync?force= (réponse immédiate, la passe tourne en fond)
async fn trigger_sync(
    State(app): State<AppState>,
    Query(params): Query<ForceParams>,
) -> (StatusCode, Json<SyncOutcome>) {
    let outcome = app.sync.start(params.force);
    let code = match outcome {
        SyncOutcome::Started => StatusCode::ACCEPTED,
        SyncOutcome::AlreadyRunning { .. } | SyncOutcome::CoolingDown { .. } => {
            StatusCode::CONFLICT
        }
        SyncOutcome::Completed(_) | SyncOutcome::NothingToSync => StatusCode::OK,
    };
    (code, Json(outcome))
}

// DELETE /inventory/cache?type=
async fn clear_cache(
    State(app): State<AppState>,
    Query(params): Query<KindParams>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let kind = params.parse()?;
    let removed = app.cache.clear_cache(kind).await;
    let label = kind.map_or("all", |k| k.name());
    Ok(Json(json!({ "ok": true, "type": label, "removed_keys": removed })))
}

// POST /inventory/invalidate?type=
async fn invalidate(
    State(app): State<AppState>,
    Query(params): Query<KindParams>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let kind = params.parse()?;
    let expired = app.cache.invalidate(kind).await;
    let label = kind.map_or("all", |k| k.name());
    Ok(Json(json!({ "ok": true, "type": label, "expired": expired })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::InventorySettings;
    use crate::simulation::SimulatedConnector;
    use crate::store::CacheStore;
    use crate::sync::SyncSettings;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn app(api_key: &str) -> (Router, InventoryCache) {
        let cache = InventoryCache::new(
            InventorySettings { simulate: true, ..InventorySettings::default() },
            Arc::new(SimulatedConnector),
            CacheStore::memory(),
        );
        let state = AppState {
            cache: cache.clone(),
            sync: SyncWorker::new(cache.clone(), SyncSettings::default()),
            health_tracker: HealthTracker::new(),
            api_key: Arc::from(api_key),
        };
        (build_router(state), cache)
    }

    async fn call(
        router: Router,
        method: &str,
        uri: &str,
        key: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        let response = router.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_api_key_guards_everything_but_health() {
        let (router, _) = app("s3cret");
        assert_eq!(call(router.clone(), "GET", "/health", None).await.0, StatusCode::OK);
        let (denied, _) = call(router.clone(), "GET", "/inventory/status", None).await;
        assert_eq!(denied, StatusCode::UNAUTHORIZED);
        let (allowed, _) = call(router, "GET", "/inventory/status", Some("s3cret")).await;
        assert_eq!(allowed, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_forced_datacenter_listing() {
        let (router, _) = app("");
        let (status, body) = call(router, "GET", "/inventory/datacenters?force=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "simulated");
        assert_eq!(body["kind"], "datacenter");
        assert!(!body["items"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let (router, _) = app("");
        let (status, _) = call(router.clone(), "DELETE", "/inventory/cache?type=vms", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) =
            call(router, "POST", "/inventory/invalidate?type=datastores", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "datastore");
    }

    #[tokio::test]
    async fn test_sync_with_nothing_loaded() {
        let (router, _) = app("");
        let (status, body) = call(router, "POST", "/inventory/sync", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "nothing_to_sync");
    }
}

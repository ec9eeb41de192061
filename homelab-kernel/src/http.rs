/**
 * API STATUT HOMELAB - surface HTTP en lecture seule du kernel
 *
 * RÔLE :
 * Expose l'état du kernel (uptime, inventaire, outils, caches) pour supervision.
 * Les appels d'outils passent par le Dispatcher, pas par cette API.
 *
 * ROUTES :
 * - GET /health         : "ok", sans authentification
 * - GET /system/health  : KernelHealth en JSON
 *
 * SÉCURITÉ :
 * - Header x-api-key comparé à HOMELAB_API_KEY sur toutes les routes sauf /health
 * - Clé absente de l'environnement = accès refusé
 */

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::health::{HealthTracker, KernelHealth};
use crate::servers::AnsibleServer;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub ansible: Arc<AnsibleServer>,
    pub health_tracker: HealthTracker,
    pub api_key: Option<String>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("HOMELAB_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let provided = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    if provided != Some(expected) {
        warn!(path = %req.uri().path(), "rejected request without valid x-api-key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

// GET /system/health (état du kernel)
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let inventory = app.ansible.inventory();
    Json(app.health_tracker.get_health(&app.dispatcher, &inventory))
}

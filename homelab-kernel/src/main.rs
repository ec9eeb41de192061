/**
 * HOMELAB KERNEL - point d'entrée du serveur de supervision
 *
 * RÔLE : config -> instantané env -> inventaire (résolu en premier) -> sous-serveurs
 * -> Dispatcher -> API statut HTTP.
 *
 * Les logs partent sur stderr ; niveau via RUST_LOG (défaut homelab_kernel=info).
 */

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use homelab_kernel::config::load_config;
use homelab_kernel::endpoints::ResolutionContext;
use homelab_kernel::env::EnvSnapshot;
use homelab_kernel::health::HealthTracker;
use homelab_kernel::http::{build_router, AppState};
use homelab_kernel::servers::{
    AnsibleServer, DockerServer, OllamaServer, PiholeServer, PingServer, UnifiServer, UpsServer,
};
use homelab_kernel::Dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("homelab_kernel=info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = load_config().await;
    let env = Arc::new(EnvSnapshot::capture(cfg.env_file.as_deref()));
    info!(vars = env.len(), "environment snapshot captured");

    let ctx = ResolutionContext::from_config(&cfg, env.clone());

    // l'inventaire d'abord : les autres domaines en dépendent
    let ansible = Arc::new(AnsibleServer::new(ctx.clone()));
    let inventory = ansible.inventory();
    info!(
        path = ?ctx.inventory_path,
        hosts = inventory.hosts.len(),
        groups = inventory.groups.len(),
        "inventory resolved"
    );

    let mut dispatcher = Dispatcher::new();
    dispatcher
        .register(ansible.clone())
        .register(Arc::new(DockerServer::new(ctx.clone())))
        .register(Arc::new(OllamaServer::new(ctx.clone(), cfg.litellm.clone())))
        .register(Arc::new(PiholeServer::new(ctx.clone())))
        .register(Arc::new(PingServer::new(ctx.clone())))
        .register(Arc::new(UpsServer::new(ctx)))
        .register(Arc::new(UnifiServer::new(&cfg.unifi, &env)));
    let dispatcher = Arc::new(dispatcher);
    info!(tools = dispatcher.tool_count(), "dispatcher ready");

    let app_state = AppState {
        dispatcher,
        ansible,
        health_tracker: HealthTracker::new(),
        api_key: env.get("HOMELAB_API_KEY").map(str::to_string),
    };
    let app = build_router(app_state);

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("cannot bind {}", cfg.listen))?;
    info!(addr = %cfg.listen, "status API listening");
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}

// [[AVIARY]]/apps/control-plane/src/main.rs
// Purpose: Entry point. Rehydrates state, starts the worker pool and the
//          reconciler, then serves the orchestration API.
// Architecture: Application Boot
// Dependencies: Axum, Tokio, Tracing

mod auth;
mod config;
mod controller;
mod error;
mod fabric;
mod models;
mod server;
mod store;
mod tasks;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use crate::config::Settings;
use crate::controller::{ControllerApi, HttpController};
use crate::fabric::{AwsFabric, CloudFabric};
use crate::store::StateStore;
use crate::tasks::engine::TaskEngine;
use crate::tasks::TaskContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("aviary_control=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    tracing::info!("Initializing Aviary control plane...");

    let settings = Arc::new(Settings::from_env());
    let store = Arc::new(StateStore::new(settings.redis_url.as_deref()));

    // === PERSISTENCE RECOVERY ===
    // Load entity rows and task bookkeeping back into memory; tasks that
    // were in flight when the process died are demoted to FAILURE.
    store.rehydrate().await;

    let fabric: Arc<dyn CloudFabric> =
        Arc::new(AwsFabric::from_env(settings.redeploy_poll).await);
    let controller: Arc<dyn ControllerApi> = Arc::new(HttpController::new());

    let engine = TaskEngine::new(store.clone());
    let ctx = TaskContext {
        store,
        fabric,
        controller,
        settings: settings.clone(),
        engine: engine.clone(),
    };
    engine.start(ctx.clone()).await;
    let _reconciler = tasks::health::spawn_reconciler(ctx.clone());

    let app = server::router(ctx);

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to port");
    tracing::info!("Aviary control plane listening on http://{}", addr);

    axum::serve(listener, app).await.expect("Server error");
    Ok(())
}

// [[AVIARY]]/apps/control-plane/src/server/mod.rs
// Purpose: Router assembly and CORS policy.
// Architecture: API Layer
// Dependencies: Axum, Tower

pub mod handlers;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Env, Settings};
use crate::tasks::TaskContext;

pub fn router(ctx: TaskContext) -> Router {
    let cors = cors_layer(&ctx.settings);

    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/agents", post(handlers::create_agent).get(handlers::list_agents))
        .route(
            "/agents/:agent_id",
            get(handlers::get_agent)
                .patch(handlers::patch_agent)
                .delete(handlers::delete_agent),
        )
        .route("/agents/:agent_id/start", post(handlers::start_agent_anywhere))
        .route(
            "/agents/:agent_id/start/:runtime_id",
            post(handlers::start_agent_on_runtime),
        )
        .route("/agents/:agent_id/stop", post(handlers::stop_agent))
        .route(
            "/runtimes",
            post(handlers::create_runtime).get(handlers::list_runtimes),
        )
        .route(
            "/runtimes/:runtime_id",
            get(handlers::get_runtime)
                .patch(handlers::update_runtime)
                .delete(handlers::delete_runtime),
        )
        .route("/tasks/start-agent", get(handlers::latest_agent_start_task))
        .route("/tasks/:task_id", get(handlers::get_task_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    match settings.env {
        Env::Dev | Env::Test => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        Env::Staging | Env::Prod => {
            let origins: Vec<HeaderValue> = settings
                .cors_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}

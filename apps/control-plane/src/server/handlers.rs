// [[AVIARY]]/apps/control-plane/src/server/handlers.rs
// Purpose: API handlers for agent/runtime lifecycle and task status queries.
// Architecture: API Layer
// Dependencies: Axum, Task Layer

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthSession;
use crate::error::ControlError;
use crate::models::{
    Agent, AgentBase, AgentPublic, AgentUpdate, RuntimePublic, TaskRecord, TaskStatus,
};
use crate::tasks::{agent_ops, runtime_ops, TaskContext};

pub async fn ping() -> &'static str {
    "pong"
}

fn public_view(ctx: &TaskContext, agent: &Agent) -> AgentPublic {
    let runtime = agent
        .runtime_id
        .and_then(|id| ctx.store.get_runtime(id).ok());
    AgentPublic::from_parts(agent, runtime.as_ref())
}

// === AGENT CRUD ===

pub async fn create_agent(
    State(ctx): State<TaskContext>,
    auth: AuthSession,
    Json(base): Json<AgentBase>,
) -> Result<Json<AgentPublic>, ControlError> {
    agent_ops::ensure_owner_capacity(&ctx, auth.user_id, auth.admin)?;
    let agent = ctx.store.insert_agent(auth.user_id, base).await;
    tracing::info!("Created agent {} for owner {}", agent.id, agent.owner_id);
    Ok(Json(public_view(&ctx, &agent)))
}

#[derive(Debug, Deserialize)]
pub struct AgentListQuery {
    pub user_id: Option<Uuid>,
}

pub async fn list_agents(
    State(ctx): State<TaskContext>,
    auth: AuthSession,
    Query(query): Query<AgentListQuery>,
) -> Result<Json<Vec<AgentPublic>>, ControlError> {
    // Non-admins only ever see their own agents.
    let owner_filter = if auth.admin {
        query.user_id
    } else {
        Some(auth.user_id)
    };
    let agents = match owner_filter {
        Some(owner) => ctx.store.agents_by_owner(owner),
        None => ctx.store.list_agents(),
    };
    Ok(Json(agents.iter().map(|a| public_view(&ctx, a)).collect()))
}

pub async fn get_agent(
    State(ctx): State<TaskContext>,
    auth: AuthSession,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<AgentPublic>, ControlError> {
    let agent = ctx.store.get_agent(agent_id)?;
    auth.require_owner(agent.owner_id)?;
    Ok(Json(public_view(&ctx, &agent)))
}

pub async fn patch_agent(
    State(ctx): State<TaskContext>,
    auth: AuthSession,
    Path(agent_id): Path<Uuid>,
    Json(update): Json<AgentUpdate>,
) -> Result<Json<AgentPublic>, ControlError> {
    let agent = ctx.store.get_agent(agent_id)?;
    auth.require_owner(agent.owner_id)?;
    let updated = ctx
        .store
        .update_agent(agent_id, |a| {
            if let Some(character_json) = update.character_json {
                a.character_json = character_json;
            }
            if let Some(env_bundle) = update.env_bundle {
                a.env_bundle = env_bundle;
            }
        })
        .await?;
    Ok(Json(public_view(&ctx, &updated)))
}

pub async fn delete_agent(
    State(ctx): State<TaskContext>,
    auth: AuthSession,
    Path(agent_id): Path<Uuid>,
) -> Result<StatusCode, ControlError> {
    let agent = ctx.store.get_agent(agent_id)?;
    auth.require_owner(agent.owner_id)?;
    if agent.runtime_id.is_some() {
        // Best effort: never leave an orphaned character running.
        if let Err(e) = agent_ops::stop_agent(&ctx, agent_id).await {
            tracing::warn!("Stop before delete of agent {} failed: {}", agent_id, e);
        }
    }
    ctx.store.delete_agent_row(agent_id).await;
    tracing::info!("Deleted agent {}", agent_id);
    Ok(StatusCode::NO_CONTENT)
}

// === AGENT LIFECYCLE ===

pub async fn start_agent_anywhere(
    State(ctx): State<TaskContext>,
    auth: AuthSession,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<TaskRecord>, ControlError> {
    let agent = ctx.store.get_agent(agent_id)?;
    auth.require_owner(agent.owner_id)?;
    let record = agent_ops::start_without_runtime(&ctx, agent_id).await?;
    Ok(Json(record))
}

pub async fn start_agent_on_runtime(
    State(ctx): State<TaskContext>,
    auth: AuthSession,
    Path((agent_id, runtime_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TaskRecord>, ControlError> {
    let agent = ctx.store.get_agent(agent_id)?;
    auth.require_owner(agent.owner_id)?;
    let record = agent_ops::submit_start_agent(&ctx, agent_id, runtime_id).await?;
    Ok(Json(record))
}

pub async fn stop_agent(
    State(ctx): State<TaskContext>,
    auth: AuthSession,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<AgentPublic>, ControlError> {
    let agent = ctx.store.get_agent(agent_id)?;
    auth.require_owner(agent.owner_id)?;
    let updated = agent_ops::stop_agent(&ctx, agent_id).await?;
    Ok(Json(public_view(&ctx, &updated)))
}

// === RUNTIME LIFECYCLE (admin) ===

pub async fn create_runtime(
    State(ctx): State<TaskContext>,
    auth: AuthSession,
) -> Result<Json<TaskRecord>, ControlError> {
    auth.require_admin()?;
    let (record, runtime) = runtime_ops::submit_create_runtime(&ctx).await?;
    tracing::info!(
        "Provisioning runtime {} (service number {})",
        runtime.id,
        runtime.service_no
    );
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct RuntimeListQuery {
    pub unused: Option<bool>,
}

pub async fn list_runtimes(
    State(ctx): State<TaskContext>,
    Query(query): Query<RuntimeListQuery>,
) -> Result<Json<Vec<RuntimePublic>>, ControlError> {
    let runtimes = if query.unused.unwrap_or(false) {
        ctx.store.unattached_runtimes()
    } else {
        ctx.store.list_runtimes()
    };
    Ok(Json(runtimes.iter().map(RuntimePublic::from).collect()))
}

pub async fn get_runtime(
    State(ctx): State<TaskContext>,
    Path(runtime_id): Path<Uuid>,
) -> Result<Json<RuntimePublic>, ControlError> {
    let runtime = ctx.store.get_runtime(runtime_id)?;
    Ok(Json(RuntimePublic::from(&runtime)))
}

pub async fn update_runtime(
    State(ctx): State<TaskContext>,
    auth: AuthSession,
    Path(runtime_id): Path<Uuid>,
) -> Result<Json<TaskRecord>, ControlError> {
    auth.require_admin()?;
    let record = runtime_ops::submit_update_runtime(&ctx, runtime_id).await?;
    Ok(Json(record))
}

pub async fn delete_runtime(
    State(ctx): State<TaskContext>,
    auth: AuthSession,
    Path(runtime_id): Path<Uuid>,
) -> Result<Json<TaskRecord>, ControlError> {
    auth.require_admin()?;
    let record = runtime_ops::submit_delete_runtime(&ctx, runtime_id).await?;
    Ok(Json(record))
}

// === TASK STATUS ===

pub async fn get_task_status(
    State(ctx): State<TaskContext>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskStatus>, ControlError> {
    Ok(Json(ctx.engine.status(task_id)))
}

#[derive(Debug, Deserialize)]
pub struct AgentStartTaskQuery {
    pub agent_id: Option<Uuid>,
    pub runtime_id: Option<Uuid>,
}

pub async fn latest_agent_start_task(
    State(ctx): State<TaskContext>,
    Query(query): Query<AgentStartTaskQuery>,
) -> Result<Json<TaskStatus>, ControlError> {
    if query.agent_id.is_none() && query.runtime_id.is_none() {
        return Err(ControlError::Validation(
            "must provide at least one of agent_id or runtime_id".into(),
        ));
    }
    let record = ctx
        .store
        .latest_agent_start(query.agent_id, query.runtime_id)
        .ok_or_else(|| ControlError::not_found("agent start task", "latest"))?;
    Ok(Json(ctx.engine.status(record.task_id)))
}

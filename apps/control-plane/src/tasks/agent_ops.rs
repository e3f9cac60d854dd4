// [[AVIARY]]/apps/control-plane/src/tasks/agent_ops.rs
// Purpose: Agent start/stop flows, single-flight admission, and pool growth.
// Architecture: Task Layer (agent lifecycle)
// Dependencies: Tokio, Tracing

use uuid::Uuid;

use crate::error::ControlError;
use crate::models::{Agent, CharacterPayload, TaskKind, TaskRecord};

use super::{runtime_ops, TaskContext, TaskSpec};

/// Worker body. Stops whatever the runtime is running, starts this agent's
/// character, then polls until the controller reports it running and hands
/// out its external id. Safe to re-execute: every step re-reads the rows
/// and the controller stop is idempotent.
pub(crate) async fn start_agent(
    ctx: &TaskContext,
    agent_id: Uuid,
    runtime_id: Uuid,
) -> Result<(), ControlError> {
    let runtime = ctx.store.get_runtime(runtime_id)?;
    let agent = ctx.store.get_agent(agent_id)?;

    // Unconditional stop; also clears a stale binding left by a previous
    // occupant of this runtime.
    ctx.controller.stop_character(&runtime.url).await?;
    if let Some(old) = ctx.store.clear_runtime_binding(runtime_id).await {
        if old.id != agent_id {
            tracing::info!(
                "Cleared stale binding of agent {} to runtime {}",
                old.id,
                runtime_id
            );
        }
    }

    let payload = CharacterPayload {
        character_json: agent.character_json.clone(),
        envs: agent.env_bundle.clone(),
    };
    ctx.controller.start_character(&runtime.url, &payload).await?;

    let budget = ctx.settings.agent_start_poll;
    for attempt in 1..=budget.attempts {
        tracing::info!("{}/{}: Polling for agent {} to start", attempt, budget.attempts, agent_id);
        match ctx.controller.character_status(&runtime.url).await {
            Ok(status) if status.running => {
                let external_agent_id = status.agent_id.clone();
                ctx.store
                    .update_agent(agent_id, |a| {
                        a.runtime_id = Some(runtime_id);
                        a.external_agent_id = external_agent_id.clone();
                    })
                    .await?;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => tracing::info!("Status probe failed while starting: {}", e),
        }
        tokio::time::sleep(budget.interval).await;
    }

    Err(ControlError::Timeout {
        phase: "agent start",
        budget: budget.attempts,
    })
}

/// Synchronous stop, run in the request path rather than enqueued. Clears
/// the binding on success and shrinks the idle pool if it overflowed.
pub async fn stop_agent(ctx: &TaskContext, agent_id: Uuid) -> Result<Agent, ControlError> {
    let agent = ctx.store.get_agent(agent_id)?;
    let Some(runtime_id) = agent.runtime_id else {
        return Err(ControlError::not_found("running agent", agent_id));
    };
    let runtime = ctx.store.get_runtime(runtime_id)?;

    ctx.controller.stop_character(&runtime.url).await?;
    let updated = ctx
        .store
        .update_agent(agent_id, |a| {
            a.runtime_id = None;
            a.external_agent_id = None;
        })
        .await?;

    cleanup_idle_runtimes(ctx).await;
    Ok(updated)
}

/// Dual single-flight check: one in-flight start per agent AND per runtime.
/// There is no queueing of "next" intents; callers get a conflict and retry.
pub fn ensure_start_single_flight(
    ctx: &TaskContext,
    agent_id: Uuid,
    runtime_id: Uuid,
) -> Result<(), ControlError> {
    let candidates = [
        ctx.store.latest_agent_start(Some(agent_id), None),
        ctx.store.latest_agent_start(None, Some(runtime_id)),
    ];
    for record in candidates.into_iter().flatten() {
        let status = ctx.store.task_status(record.task_id);
        if status.in_flight() {
            return Err(ControlError::conflict(format!(
                "agent start task {} is already {:?}",
                record.task_id, status
            )));
        }
    }
    Ok(())
}

pub async fn submit_start_agent(
    ctx: &TaskContext,
    agent_id: Uuid,
    runtime_id: Uuid,
) -> Result<TaskRecord, ControlError> {
    ctx.store.get_agent(agent_id)?;
    ctx.store.get_runtime(runtime_id)?;
    ensure_start_single_flight(ctx, agent_id, runtime_id)?;

    let task_id = ctx
        .engine
        .submit(TaskSpec::StartAgent {
            agent_id,
            runtime_id,
        })
        .await;
    let record = ctx
        .store
        .record_task(TaskKind::AgentStart, task_id, Some(runtime_id), Some(agent_id))
        .await;
    Ok(record)
}

/// Picks a started, unattached runtime for the agent. When the pool is
/// empty, grows it by `RUNTIME_POOL_INCREMENT` create tasks and reports
/// `PoolEmpty` so the caller retries shortly. Never blocks on provisioning.
pub async fn start_without_runtime(
    ctx: &TaskContext,
    agent_id: Uuid,
) -> Result<TaskRecord, ControlError> {
    ctx.store.get_agent(agent_id)?;

    if let Some(runtime) = ctx
        .store
        .unattached_runtimes()
        .into_iter()
        .find(|r| r.started)
    {
        return submit_start_agent(ctx, agent_id, runtime.id).await;
    }

    tracing::warn!(
        "No started runtime free for agent {}; provisioning {} more",
        agent_id,
        ctx.settings.pool_increment
    );
    for _ in 0..ctx.settings.pool_increment {
        runtime_ops::submit_create_runtime(ctx).await?;
    }
    Err(ControlError::PoolEmpty)
}

/// Keeps at most `RUNTIME_IDLE_POOL_SIZE` unattached runtimes warm; the
/// surplus is torn down, highest service numbers first so low numbers stay
/// stable.
pub async fn cleanup_idle_runtimes(ctx: &TaskContext) {
    let mut idle = ctx.store.unattached_runtimes();
    let bound = ctx.settings.idle_pool_size;
    if idle.len() <= bound {
        return;
    }
    let surplus = idle.len() - bound;
    tracing::info!(
        "Idle pool at {} (bound {}); releasing {} runtime(s)",
        idle.len(),
        bound,
        surplus
    );
    idle.sort_by_key(|r| std::cmp::Reverse(r.service_no));
    for runtime in idle.into_iter().take(surplus) {
        if super::runtime_lifecycle_in_flight(ctx, runtime.id) {
            continue;
        }
        let task_id = ctx
            .engine
            .submit(TaskSpec::DeleteRuntime {
                runtime_id: runtime.id,
            })
            .await;
        ctx.store
            .record_task(TaskKind::RuntimeDelete, task_id, Some(runtime.id), None)
            .await;
    }
}

/// Per-owner admission: one agent per non-admin owner. Admins bypass.
pub fn ensure_owner_capacity(
    ctx: &TaskContext,
    owner_id: Uuid,
    admin: bool,
) -> Result<(), ControlError> {
    if admin {
        return Ok(());
    }
    if !ctx.store.agents_by_owner(owner_id).is_empty() {
        return Err(ControlError::conflict("owner already has an agent"));
    }
    Ok(())
}

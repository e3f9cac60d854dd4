// [[AVIARY]]/apps/control-plane/src/tasks/health.rs
// Purpose: Periodic liveness reconciliation and drift repair.
// Architecture: Task Layer (health reconciler)
// Dependencies: Tokio, Chrono, Tracing

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::controller::ControllerError;
use crate::error::ControlError;
use crate::models::TaskKind;

use super::{agent_ops, TaskContext, TaskSpec};

/// Fires every `HEALTHCHECK_INTERVAL`, fanning one `HealthcheckRuntime`
/// task per runtime onto worker slots. Ticks are not mutually exclusive
/// across runs; the individual checks are idempotent and converge.
pub fn spawn_reconciler(ctx: TaskContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.settings.healthcheck_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            fan_out(&ctx).await;
        }
    })
}

async fn fan_out(ctx: &TaskContext) {
    let runtimes = ctx.store.list_runtimes();
    tracing::info!("Reconciler tick: scheduling {} runtime check(s)", runtimes.len());
    for runtime in runtimes {
        ctx.engine
            .submit(TaskSpec::HealthcheckRuntime {
                runtime_id: runtime.id,
            })
            .await;
    }
}

/// One runtime's check: skip while a lifecycle task owns it, probe both
/// liveness endpoints, reset or escalate the failure counter, then chase
/// agent drift on healthy runtimes.
pub(crate) async fn healthcheck_runtime(
    ctx: &TaskContext,
    runtime_id: Uuid,
) -> Result<(), ControlError> {
    // Skip iff the latest create/update/delete is PENDING or STARTED; a
    // probe would race the lifecycle body's own polling.
    if super::runtime_lifecycle_in_flight(ctx, runtime_id) {
        tracing::info!(
            "Skipping healthcheck for runtime {}: lifecycle task in flight",
            runtime_id
        );
        return Ok(());
    }
    let Ok(runtime) = ctx.store.get_runtime(runtime_id) else {
        // Deleted between fan-out and pickup.
        return Ok(());
    };

    match probe_liveness(ctx, &runtime.url).await {
        Ok(()) => {
            ctx.store
                .update_runtime(runtime_id, |r| {
                    r.failed_healthchecks = 0;
                    r.last_healthcheck = Some(Utc::now());
                })
                .await?;
            if let Some(agent) = ctx.store.agent_bound_to(runtime_id) {
                ctx.engine
                    .submit(TaskSpec::HealthcheckAgent { agent_id: agent.id })
                    .await;
            }
        }
        Err(e) => {
            let updated = ctx
                .store
                .update_runtime(runtime_id, |r| r.failed_healthchecks += 1)
                .await?;
            let failures = updated.failed_healthchecks;
            if failures > ctx.settings.delete_threshold {
                tracing::error!(
                    "Runtime {} failed {} consecutive healthchecks ({}); deleting",
                    runtime_id,
                    failures,
                    e
                );
                let task_id = ctx.engine.submit(TaskSpec::DeleteRuntime { runtime_id }).await;
                ctx.store
                    .record_task(TaskKind::RuntimeDelete, task_id, Some(runtime_id), None)
                    .await;
            } else if failures > ctx.settings.update_threshold {
                // Past the repair threshold an operator may intervene; the
                // loop only keeps counting toward deletion.
                tracing::warn!(
                    "Runtime {} failed {} consecutive healthchecks ({}); awaiting repair",
                    runtime_id,
                    failures,
                    e
                );
            } else {
                tracing::warn!(
                    "Runtime {} failed healthcheck {} ({})",
                    runtime_id,
                    failures,
                    e
                );
            }
        }
    }
    Ok(())
}

async fn probe_liveness(ctx: &TaskContext, url: &str) -> Result<(), ControllerError> {
    ctx.controller.ping(url).await?;
    ctx.controller.controller_ping(url).await?;
    Ok(())
}

/// Verifies the runtime is actually running its bound agent's character and
/// re-enqueues a start when it drifted.
pub(crate) async fn healthcheck_agent(ctx: &TaskContext, agent_id: Uuid) -> Result<(), ControlError> {
    let Ok(agent) = ctx.store.get_agent(agent_id) else {
        return Ok(());
    };
    let Some(runtime_id) = agent.runtime_id else {
        return Ok(());
    };
    let runtime = ctx.store.get_runtime(runtime_id)?;

    let status = match ctx.controller.character_status(&runtime.url).await {
        Ok(status) => status,
        Err(e) => {
            // The runtime check owns connectivity escalation; drift repair
            // only acts on an answer.
            tracing::warn!("Status probe for agent {} failed: {}", agent_id, e);
            return Ok(());
        }
    };

    let drifted = if !status.running {
        tracing::warn!("Agent {} is not running on runtime {}", agent_id, runtime_id);
        true
    } else if status.agent_id != agent.external_agent_id {
        if let Some(found) = &status.agent_id {
            let mismatch = ControllerError::CharacterMismatch {
                url: runtime.url.clone(),
                found: found.clone(),
            };
            tracing::warn!("Agent {}: {}", agent_id, mismatch);
        }
        true
    } else {
        false
    };

    if drifted {
        match agent_ops::submit_start_agent(ctx, agent_id, runtime_id).await {
            Ok(record) => {
                tracing::info!(
                    "Restarting drifted agent {} on runtime {} (task {})",
                    agent_id,
                    runtime_id,
                    record.task_id
                );
            }
            Err(ControlError::Conflict { .. }) => {
                tracing::info!("Restart already in flight for agent {}", agent_id);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

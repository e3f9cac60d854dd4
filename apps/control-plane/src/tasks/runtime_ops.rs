// [[AVIARY]]/apps/control-plane/src/tasks/runtime_ops.rs
// Purpose: Runtime provisioning saga, teardown, and the zero-downtime roll.
// Architecture: Task Layer (runtime lifecycle)
// Dependencies: Tokio, Tracing

use uuid::Uuid;

use crate::error::ControlError;
use crate::models::{Runtime, TaskKind, TaskRecord};

use super::{TaskContext, TaskSpec};

/// Allocates a service number, inserts the row, and enqueues the
/// provisioning saga. Runs in the request path, not the worker, so the
/// caller observes the row (with its number and URL) immediately.
///
/// Allocation races are settled by the store's uniqueness index: the loser
/// sees a conflict and retries from the next free number.
pub async fn submit_create_runtime(
    ctx: &TaskContext,
) -> Result<(TaskRecord, Runtime), ControlError> {
    let runtime = loop {
        let service_no = ctx.store.next_free_service_no();
        match ctx.store.insert_runtime(service_no, &ctx.settings.fabric).await {
            Ok(runtime) => break runtime,
            Err(ControlError::Conflict { .. }) => {
                tracing::warn!("Service number {} was taken; retrying allocation", service_no);
                continue;
            }
            Err(e) => return Err(e),
        }
    };

    let task_id = ctx
        .engine
        .submit(TaskSpec::CreateRuntime {
            runtime_id: runtime.id,
        })
        .await;
    let record = ctx
        .store
        .record_task(TaskKind::RuntimeCreate, task_id, Some(runtime.id), None)
        .await;
    Ok((record, runtime))
}

pub async fn submit_update_runtime(
    ctx: &TaskContext,
    runtime_id: Uuid,
) -> Result<TaskRecord, ControlError> {
    ctx.store.get_runtime(runtime_id)?;
    ensure_no_lifecycle_in_flight(ctx, runtime_id)?;
    let task_id = ctx.engine.submit(TaskSpec::UpdateRuntime { runtime_id }).await;
    let record = ctx
        .store
        .record_task(TaskKind::RuntimeUpdate, task_id, Some(runtime_id), None)
        .await;
    Ok(record)
}

pub async fn submit_delete_runtime(
    ctx: &TaskContext,
    runtime_id: Uuid,
) -> Result<TaskRecord, ControlError> {
    ctx.store.get_runtime(runtime_id)?;
    ensure_no_lifecycle_in_flight(ctx, runtime_id)?;
    let task_id = ctx.engine.submit(TaskSpec::DeleteRuntime { runtime_id }).await;
    let record = ctx
        .store
        .record_task(TaskKind::RuntimeDelete, task_id, Some(runtime_id), None)
        .await;
    Ok(record)
}

fn ensure_no_lifecycle_in_flight(ctx: &TaskContext, runtime_id: Uuid) -> Result<(), ControlError> {
    if super::runtime_lifecycle_in_flight(ctx, runtime_id) {
        return Err(ControlError::conflict(format!(
            "a lifecycle task for runtime {runtime_id} is already in flight"
        )));
    }
    Ok(())
}

/// Provisioning saga. Each step persists its handle to the runtime row
/// before the next step begins, so teardown can release exactly what was
/// created. Any failure, including an exhausted poll budget, tears the
/// partial runtime down and re-raises.
pub(crate) async fn create_runtime(ctx: &TaskContext, runtime_id: Uuid) -> Result<(), ControlError> {
    match provision(ctx, runtime_id).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!("Provisioning runtime {} failed: {}. Rolling back.", runtime_id, e);
            delete_runtime(ctx, runtime_id).await?;
            Err(e)
        }
    }
}

async fn provision(ctx: &TaskContext, runtime_id: Uuid) -> Result<(), ControlError> {
    let fabric_cfg = &ctx.settings.fabric;
    let runtime = ctx.store.get_runtime(runtime_id)?;
    let service_no = runtime.service_no;
    let name = fabric_cfg.service_name(service_no);
    let host = format!("{}.{}", fabric_cfg.subdomain(service_no), fabric_cfg.host);

    tracing::info!("Creating target group \"{}\"", name);
    let target_group = ctx
        .fabric
        .create_target_group(&name, &fabric_cfg.vpc_id, "/ping")
        .await?;
    ctx.store
        .update_runtime(runtime_id, |r| {
            r.target_group_handle = Some(target_group.clone())
        })
        .await?;

    tracing::info!("Creating listener rules for {}", host);
    let (http_rule, https_rule) = ctx
        .fabric
        .create_listener_rules(
            &fabric_cfg.http_listener_arn,
            &fabric_cfg.https_listener_arn,
            &host,
            &target_group,
            fabric_cfg.rule_priority(service_no),
        )
        .await?;
    ctx.store
        .update_runtime(runtime_id, |r| {
            r.http_rule_handle = Some(http_rule.clone());
            r.https_rule_handle = Some(https_rule.clone());
        })
        .await?;

    tracing::info!("Creating service {}", name);
    let service = ctx
        .fabric
        .create_service(
            &fabric_cfg.cluster,
            &name,
            &fabric_cfg.task_definition_family,
            &fabric_cfg.security_groups,
            &fabric_cfg.subnets,
            &target_group,
        )
        .await?;
    ctx.store
        .update_runtime(runtime_id, |r| r.service_handle = Some(service.clone()))
        .await?;

    // The service routes as soon as its first target turns healthy; from
    // here convergence is a matter of polling the controller.
    let budget = ctx.settings.create_poll;
    tracing::info!("Polling runtime {} at {} for readiness", runtime_id, runtime.url);
    for attempt in 1..=budget.attempts {
        tokio::time::sleep(budget.interval).await;
        match ctx.controller.controller_ping(&runtime.url).await {
            Ok(()) => {
                tracing::info!("Runtime {} has started", runtime_id);
                ctx.store.update_runtime(runtime_id, |r| r.started = true).await?;
                return Ok(());
            }
            Err(e) => {
                tracing::info!(
                    "{}/{}: runtime not online yet. {}",
                    attempt,
                    budget.attempts,
                    e
                );
            }
        }
    }
    Err(ControlError::Timeout {
        phase: "runtime provisioning",
        budget: budget.attempts,
    })
}

/// Teardown. Reads the handles persisted by the saga and releases exactly
/// those that are set, in the reverse routing order: service first, then
/// listener rules, then the target group. Per-step failures are logged and
/// swallowed so a partially-provisioned runtime can always be reclaimed.
pub(crate) async fn delete_runtime(ctx: &TaskContext, runtime_id: Uuid) -> Result<(), ControlError> {
    let Ok(runtime) = ctx.store.get_runtime(runtime_id) else {
        tracing::warn!("Runtime {} already gone; nothing to tear down", runtime_id);
        return Ok(());
    };
    let fabric_cfg = &ctx.settings.fabric;
    let name = fabric_cfg.service_name(runtime.service_no);

    if runtime.service_handle.is_some() {
        tracing::info!("Deleting service {}", name);
        match ctx.fabric.delete_service(&fabric_cfg.cluster, &name).await {
            Ok(()) => {
                if let Err(e) = ctx.fabric.wait_services_inactive(&fabric_cfg.cluster, &name).await
                {
                    tracing::error!("Service {} did not drain cleanly: {}", name, e);
                }
            }
            Err(e) => tracing::error!("Failed to delete service {}: {}", name, e),
        }
    }
    if let Some(rule) = &runtime.http_rule_handle {
        tracing::info!("Deleting HTTP rule {}", rule);
        if let Err(e) = ctx.fabric.delete_rule(rule).await {
            tracing::error!("Failed to delete HTTP rule {}: {}", rule, e);
        }
    }
    if let Some(rule) = &runtime.https_rule_handle {
        tracing::info!("Deleting HTTPS rule {}", rule);
        if let Err(e) = ctx.fabric.delete_rule(rule).await {
            tracing::error!("Failed to delete HTTPS rule {}: {}", rule, e);
        }
    }
    if let Some(target_group) = &runtime.target_group_handle {
        tracing::info!("Deleting target group {}", target_group);
        if let Err(e) = ctx.fabric.delete_target_group(target_group).await {
            tracing::error!("Failed to delete target group {}: {}", target_group, e);
        }
    }

    // An agent must never keep pointing at a dead runtime.
    if let Some(agent) = ctx.store.clear_runtime_binding(runtime_id).await {
        tracing::info!("Detached agent {} from deleted runtime {}", agent.id, runtime_id);
    }
    tracing::info!("Deleting runtime {}", runtime_id);
    ctx.store.delete_runtime_row(runtime_id).await;
    Ok(())
}

/// Zero-downtime task-definition roll. Detaches the bound agent for the
/// duration, drains the old deployment, waits for the runtime to answer
/// again, then restarts the agent. Any failure schedules a teardown.
pub(crate) async fn update_runtime(ctx: &TaskContext, runtime_id: Uuid) -> Result<(), ControlError> {
    match roll(ctx, runtime_id).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!(
                "Update of runtime {} failed: {}. Scheduling teardown.",
                runtime_id,
                e
            );
            let task_id = ctx.engine.submit(TaskSpec::DeleteRuntime { runtime_id }).await;
            ctx.store
                .record_task(TaskKind::RuntimeDelete, task_id, Some(runtime_id), None)
                .await;
            Err(e)
        }
    }
}

async fn roll(ctx: &TaskContext, runtime_id: Uuid) -> Result<(), ControlError> {
    let runtime = ctx.store.get_runtime(runtime_id)?;
    let fabric_cfg = &ctx.settings.fabric;
    let family = &fabric_cfg.task_definition_family;
    let name = fabric_cfg.service_name(runtime.service_no);

    let revision = ctx.fabric.latest_task_definition_revision(family).await?;

    // Detach whoever is running here; it is restarted once the roll lands.
    let detached = ctx.store.clear_runtime_binding(runtime_id).await;
    ctx.store.update_runtime(runtime_id, |r| r.started = false).await?;

    tracing::info!("Redeploying {} onto {}:{}", name, family, revision);
    ctx.fabric
        .force_redeploy(&fabric_cfg.cluster, &name, &format!("{family}:{revision}"))
        .await?;

    let budget = ctx.settings.redeploy_poll;
    let mut stable = false;
    for attempt in 1..=budget.attempts {
        match ctx
            .fabric
            .describe_service_active_deployment(&fabric_cfg.cluster, &name)
            .await?
        {
            None => {
                tracing::info!("{} is stable", name);
                stable = true;
                break;
            }
            Some(deployment) => {
                tracing::info!(
                    "{}/{}: deployment {} still active on {}",
                    attempt,
                    budget.attempts,
                    deployment,
                    name
                );
            }
        }
        tokio::time::sleep(budget.interval).await;
    }
    if !stable {
        return Err(ControlError::Timeout {
            phase: "redeploy stabilization",
            budget: budget.attempts,
        });
    }

    let mut online = false;
    for attempt in 1..=budget.attempts {
        match ctx.controller.ping(&runtime.url).await {
            Ok(()) => {
                tracing::info!("Runtime {} is online", runtime_id);
                ctx.store.update_runtime(runtime_id, |r| r.started = true).await?;
                online = true;
                break;
            }
            Err(e) => {
                tracing::info!(
                    "{}/{}: runtime {} is not online yet. {}",
                    attempt,
                    budget.attempts,
                    runtime_id,
                    e
                );
                tokio::time::sleep(budget.interval).await;
            }
        }
    }
    if !online {
        return Err(ControlError::Timeout {
            phase: "post-redeploy ping",
            budget: budget.attempts,
        });
    }

    if let Some(agent) = detached {
        tracing::info!("Restarting agent {} on runtime {}", agent.id, runtime_id);
        let task_id = ctx
            .engine
            .submit(TaskSpec::StartAgent {
                agent_id: agent.id,
                runtime_id,
            })
            .await;
        ctx.store
            .record_task(TaskKind::AgentStart, task_id, Some(runtime_id), Some(agent.id))
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use crate::testutil::{harness, wait_for_task};

    #[tokio::test]
    async fn happy_create_provisions_and_marks_started() {
        let h = harness().await;
        // The controller answers on the third poll.
        h.controller
            .script_for(&h.ctx.settings.fabric.runtime_url(1))
            .lock()
            .unwrap()
            .controller_ping_failures_left = 2;

        let (record, runtime) = submit_create_runtime(&h.ctx).await.unwrap();
        assert_eq!(runtime.service_no, 1);
        assert!(!runtime.started);

        assert_eq!(wait_for_task(&h.ctx, record.task_id).await, TaskStatus::Success);

        let runtime = h.ctx.store.get_runtime(runtime.id).unwrap();
        assert!(runtime.started);
        assert!(runtime.target_group_handle.is_some());
        assert!(runtime.http_rule_handle.is_some());
        assert!(runtime.https_rule_handle.is_some());
        assert!(runtime.service_handle.is_some());

        let calls = h.fabric.call_names();
        assert_eq!(
            calls,
            vec!["create_target_group", "create_listener_rules", "create_service"]
        );
    }

    #[tokio::test]
    async fn create_rolls_back_when_the_runtime_never_answers() {
        let h = harness().await;
        h.controller
            .script_for(&h.ctx.settings.fabric.runtime_url(1))
            .lock()
            .unwrap()
            .controller_ping_fail = true;

        let (record, runtime) = submit_create_runtime(&h.ctx).await.unwrap();
        assert_eq!(wait_for_task(&h.ctx, record.task_id).await, TaskStatus::Failure);

        // Row is gone and the number is free again.
        assert!(h.ctx.store.get_runtime(runtime.id).is_err());
        assert_eq!(h.ctx.store.next_free_service_no(), 1);

        // Every delete ran exactly once, releasing in routing order.
        let calls = h.fabric.call_names();
        assert_eq!(
            calls,
            vec![
                "create_target_group",
                "create_listener_rules",
                "create_service",
                "delete_service",
                "wait_services_inactive",
                "delete_rule",
                "delete_rule",
                "delete_target_group",
            ]
        );
    }

    #[tokio::test]
    async fn teardown_skips_handles_that_were_never_created() {
        let h = harness().await;
        // A bare row: allocation succeeded but no fabric step ran.
        let runtime = h
            .ctx
            .store
            .insert_runtime(1, &h.ctx.settings.fabric)
            .await
            .unwrap();

        delete_runtime(&h.ctx, runtime.id).await.unwrap();

        assert!(h.fabric.call_names().is_empty());
        assert!(h.ctx.store.get_runtime(runtime.id).is_err());
    }

    #[tokio::test]
    async fn teardown_twice_is_idempotent() {
        let h = harness().await;
        let runtime = h
            .ctx
            .store
            .insert_runtime(1, &h.ctx.settings.fabric)
            .await
            .unwrap();
        delete_runtime(&h.ctx, runtime.id).await.unwrap();
        delete_runtime(&h.ctx, runtime.id).await.unwrap();
        assert!(h.ctx.store.get_runtime(runtime.id).is_err());
    }

    #[tokio::test]
    async fn update_rolls_the_service_and_restarts_the_agent() {
        let h = harness().await;
        let runtime = h.provisioned_runtime(1).await;
        let agent = h.bound_agent(runtime.id, "ext-old").await;

        // One drain poll before the old deployment disappears.
        h.fabric.set_active_deployment_polls(1);

        let record = submit_update_runtime(&h.ctx, runtime.id).await.unwrap();
        assert_eq!(wait_for_task(&h.ctx, record.task_id).await, TaskStatus::Success);

        let rolled = h.ctx.store.get_runtime(runtime.id).unwrap();
        assert!(rolled.started);

        // The displaced agent was re-bound by the follow-up start task.
        let restart = h
            .ctx
            .store
            .latest_agent_start(Some(agent.id), Some(runtime.id))
            .expect("restart task recorded");
        assert_eq!(wait_for_task(&h.ctx, restart.task_id).await, TaskStatus::Success);

        let agent = h.ctx.store.get_agent(agent.id).unwrap();
        assert_eq!(agent.runtime_id, Some(runtime.id));
        assert_ne!(agent.external_agent_id.as_deref(), Some("ext-old"));
        assert!(agent.external_agent_id.is_some());

        assert!(h.fabric.call_names().contains(&"force_redeploy".to_string()));
    }

    #[tokio::test]
    async fn failed_update_schedules_teardown() {
        let h = harness().await;
        let runtime = h.provisioned_runtime(1).await;
        h.fabric.fail_op("force_redeploy");

        let record = submit_update_runtime(&h.ctx, runtime.id).await.unwrap();
        assert_eq!(wait_for_task(&h.ctx, record.task_id).await, TaskStatus::Failure);

        let teardown = h
            .ctx
            .store
            .latest_task_for_runtime(TaskKind::RuntimeDelete, runtime.id)
            .expect("teardown scheduled");
        assert_eq!(wait_for_task(&h.ctx, teardown.task_id).await, TaskStatus::Success);
        assert!(h.ctx.store.get_runtime(runtime.id).is_err());
    }

    #[tokio::test]
    async fn lifecycle_verbs_share_one_single_flight_guard() {
        let h = harness().await;
        let runtime = h.provisioned_runtime(1).await;
        // Park a delete in PENDING without letting a worker near it.
        let task_id = Uuid::new_v4();
        h.ctx.store.set_task_status(task_id, TaskStatus::Pending).await;
        h.ctx
            .store
            .record_task(TaskKind::RuntimeDelete, task_id, Some(runtime.id), None)
            .await;

        let err = submit_update_runtime(&h.ctx, runtime.id).await.unwrap_err();
        assert!(matches!(err, ControlError::Conflict { .. }));
        let err = submit_delete_runtime(&h.ctx, runtime.id).await.unwrap_err();
        assert!(matches!(err, ControlError::Conflict { .. }));
    }
}

// [[AVIARY]]/apps/control-plane/src/tasks/mod.rs
// Purpose: Named task specs, the shared task context, and worker dispatch.
// Architecture: Task Layer
// Dependencies: Serde, Uuid

pub mod agent_ops;
pub mod engine;
pub mod health;
pub mod runtime_ops;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Settings;
use crate::controller::ControllerApi;
use crate::error::ControlError;
use crate::fabric::CloudFabric;
use crate::models::TaskKind;
use crate::store::StateStore;
use engine::TaskEngine;

/// Every background job is a named spec carrying ids only. Bodies re-fetch
/// their entities from the store, which keeps re-execution safe under the
/// engine's at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskSpec {
    CreateRuntime { runtime_id: Uuid },
    UpdateRuntime { runtime_id: Uuid },
    DeleteRuntime { runtime_id: Uuid },
    StartAgent { agent_id: Uuid, runtime_id: Uuid },
    HealthcheckRuntime { runtime_id: Uuid },
    HealthcheckAgent { agent_id: Uuid },
}

/// Everything a task body or handler needs. Cheap to clone; the two tiers
/// (request handlers and workers) share only the store and the engine queue.
#[derive(Clone)]
pub struct TaskContext {
    pub store: Arc<StateStore>,
    pub fabric: Arc<dyn CloudFabric>,
    pub controller: Arc<dyn ControllerApi>,
    pub settings: Arc<Settings>,
    pub engine: TaskEngine,
}

pub(crate) async fn dispatch(ctx: &TaskContext, spec: TaskSpec) -> Result<(), ControlError> {
    match spec {
        TaskSpec::CreateRuntime { runtime_id } => runtime_ops::create_runtime(ctx, runtime_id).await,
        TaskSpec::UpdateRuntime { runtime_id } => runtime_ops::update_runtime(ctx, runtime_id).await,
        TaskSpec::DeleteRuntime { runtime_id } => runtime_ops::delete_runtime(ctx, runtime_id).await,
        TaskSpec::StartAgent {
            agent_id,
            runtime_id,
        } => agent_ops::start_agent(ctx, agent_id, runtime_id).await,
        TaskSpec::HealthcheckRuntime { runtime_id } => {
            health::healthcheck_runtime(ctx, runtime_id).await
        }
        TaskSpec::HealthcheckAgent { agent_id } => health::healthcheck_agent(ctx, agent_id).await,
    }
}

/// Shared guard for all runtime lifecycle kinds: true while the most recent
/// create, update, or delete task for this runtime is still in flight.
pub(crate) fn runtime_lifecycle_in_flight(ctx: &TaskContext, runtime_id: Uuid) -> bool {
    [
        TaskKind::RuntimeCreate,
        TaskKind::RuntimeUpdate,
        TaskKind::RuntimeDelete,
    ]
    .iter()
    .any(|kind| {
        ctx.store
            .latest_task_for_runtime(*kind, runtime_id)
            .map(|record| ctx.store.task_status(record.task_id).in_flight())
            .unwrap_or(false)
    })
}

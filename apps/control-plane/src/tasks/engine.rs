// [[AVIARY]]/apps/control-plane/src/tasks/engine.rs
// Purpose: Asynchronous task queue with a fixed worker pool and status records.
// Architecture: Task Layer
// Dependencies: Tokio, Uuid

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::models::TaskStatus;
use crate::store::StateStore;

use super::{dispatch, TaskContext, TaskSpec};

struct Queued {
    task_id: Uuid,
    spec: TaskSpec,
}

struct EngineInner {
    store: Arc<StateStore>,
    tx: mpsc::UnboundedSender<Queued>,
    // Taken exactly once by start(); workers share it behind a lock.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Queued>>>,
}

/// Queue handle. Submitting records PENDING synchronously, so a task is
/// observable before any worker touches it; workers drive it through
/// STARTED to SUCCESS or FAILURE. Delivery is at-least-once from the
/// caller's point of view — bodies must be idempotent by identity.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    pub fn new(store: Arc<StateStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        TaskEngine {
            inner: Arc::new(EngineInner {
                store,
                tx,
                rx: Mutex::new(Some(rx)),
            }),
        }
    }

    /// Spawns the worker pool. Idempotent; a second call is a no-op.
    pub async fn start(&self, ctx: TaskContext) {
        let receiver = self.inner.rx.lock().await.take();
        let Some(receiver) = receiver else {
            tracing::warn!("Task engine already started");
            return;
        };
        let receiver = Arc::new(Mutex::new(receiver));
        let concurrency = ctx.settings.worker_concurrency.max(1);
        tracing::info!("Starting {} task worker(s)", concurrency);
        for worker_no in 0..concurrency {
            tokio::spawn(worker_loop(worker_no, ctx.clone(), receiver.clone()));
        }
    }

    pub async fn submit(&self, spec: TaskSpec) -> Uuid {
        let task_id = Uuid::new_v4();
        self.inner
            .store
            .set_task_status(task_id, TaskStatus::Pending)
            .await;
        if self.inner.tx.send(Queued { task_id, spec }).is_err() {
            // Can only happen while shutting down; the status row stays
            // PENDING and is demoted to FAILURE on the next rehydrate.
            tracing::error!("Task queue closed; task {} will not run", task_id);
        }
        task_id
    }

    pub fn status(&self, task_id: Uuid) -> TaskStatus {
        self.inner.store.task_status(task_id)
    }
}

async fn worker_loop(
    worker_no: usize,
    ctx: TaskContext,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Queued>>>,
) {
    loop {
        // Hold the queue lock only for the pop itself.
        let queued = { receiver.lock().await.recv().await };
        let Some(Queued { task_id, spec }) = queued else {
            tracing::info!("Worker {} shutting down: queue closed", worker_no);
            break;
        };

        tracing::info!("Worker {} picked up {:?} ({})", worker_no, spec, task_id);
        ctx.store.set_task_status(task_id, TaskStatus::Started).await;

        match dispatch(&ctx, spec).await {
            Ok(()) => {
                ctx.store.set_task_status(task_id, TaskStatus::Success).await;
            }
            Err(e) => {
                tracing::error!("Task {} failed: {}", task_id, e);
                ctx.store.set_task_status(task_id, TaskStatus::Failure).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{harness, wait_for_task};

    #[tokio::test]
    async fn submit_is_immediately_observable_as_pending() {
        let h = harness().await;
        // A healthcheck for a runtime that does not exist is a no-op body;
        // what matters here is the status lifecycle around it.
        let task_id = h
            .ctx
            .engine
            .submit(TaskSpec::HealthcheckRuntime {
                runtime_id: Uuid::new_v4(),
            })
            .await;
        // PENDING was recorded synchronously on submit; by now the worker
        // may already have finished, so in_flight or terminal are both fine.
        let status = h.ctx.engine.status(task_id);
        assert!(matches!(
            status,
            TaskStatus::Pending | TaskStatus::Started | TaskStatus::Success
        ));
        assert_eq!(wait_for_task(&h.ctx, task_id).await, TaskStatus::Success);
    }

    #[tokio::test]
    async fn unknown_task_reads_as_pending() {
        let h = harness().await;
        assert_eq!(h.ctx.engine.status(Uuid::new_v4()), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn failed_bodies_mark_failure() {
        let h = harness().await;
        // StartAgent with a missing agent and runtime fails in step 1.
        let task_id = h
            .ctx
            .engine
            .submit(TaskSpec::StartAgent {
                agent_id: Uuid::new_v4(),
                runtime_id: Uuid::new_v4(),
            })
            .await;
        assert_eq!(wait_for_task(&h.ctx, task_id).await, TaskStatus::Failure);
    }
}

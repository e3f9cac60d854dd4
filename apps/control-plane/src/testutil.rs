// [[AVIARY]]/apps/control-plane/src/testutil.rs
// Purpose: Scripted in-process doubles for the cloud fabric and runtime controller.
// Architecture: Test Support
// Dependencies: DashMap, async-trait

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::config::Settings;
use crate::controller::{ControllerApi, ControllerError};
use crate::fabric::{CloudFabric, FabricError};
use crate::models::{Agent, AgentBase, CharacterPayload, CharacterStatus, Runtime, TaskStatus};
use crate::store::StateStore;
use crate::tasks::engine::TaskEngine;
use crate::tasks::TaskContext;

/// Records every call in order, hands out deterministic handles, and fails
/// a single named operation on demand.
#[derive(Default)]
pub struct ScriptedFabric {
    calls: Mutex<Vec<String>>,
    fail: Mutex<Option<&'static str>>,
    counter: AtomicUsize,
    active_deployment_polls: Mutex<usize>,
}

impl ScriptedFabric {
    pub fn call_names(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_op(&self, op: &'static str) {
        *self.fail.lock().unwrap() = Some(op);
    }

    /// How many describe polls report an ACTIVE deployment before the roll
    /// counts as stable.
    pub fn set_active_deployment_polls(&self, polls: usize) {
        *self.active_deployment_polls.lock().unwrap() = polls;
    }

    fn record(&self, op: &'static str) -> Result<(), FabricError> {
        self.calls.lock().unwrap().push(op.to_string());
        if *self.fail.lock().unwrap() == Some(op) {
            return Err(FabricError::new(op, "scripted failure"));
        }
        Ok(())
    }

    fn next_handle(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl CloudFabric for ScriptedFabric {
    async fn create_target_group(
        &self,
        _name: &str,
        _vpc_id: &str,
        _health_path: &str,
    ) -> Result<String, FabricError> {
        self.record("create_target_group")?;
        Ok(self.next_handle("tg"))
    }

    async fn create_listener_rules(
        &self,
        _http_listener: &str,
        _https_listener: &str,
        _host_pattern: &str,
        _target_group: &str,
        _priority: i32,
    ) -> Result<(String, String), FabricError> {
        self.record("create_listener_rules")?;
        Ok((self.next_handle("http-rule"), self.next_handle("https-rule")))
    }

    async fn create_service(
        &self,
        _cluster: &str,
        _name: &str,
        _family: &str,
        _security_groups: &[String],
        _subnets: &[String],
        _target_group: &str,
    ) -> Result<String, FabricError> {
        self.record("create_service")?;
        Ok(self.next_handle("svc"))
    }

    async fn latest_task_definition_revision(&self, _family: &str) -> Result<i32, FabricError> {
        self.record("latest_task_definition_revision")?;
        Ok(7)
    }

    async fn force_redeploy(
        &self,
        _cluster: &str,
        _service_name: &str,
        _task_definition: &str,
    ) -> Result<String, FabricError> {
        self.record("force_redeploy")?;
        Ok(self.next_handle("deploy"))
    }

    async fn describe_service_active_deployment(
        &self,
        _cluster: &str,
        _name: &str,
    ) -> Result<Option<String>, FabricError> {
        self.record("describe_service_active_deployment")?;
        let mut polls = self.active_deployment_polls.lock().unwrap();
        if *polls > 0 {
            *polls -= 1;
            Ok(Some("deploy-active".to_string()))
        } else {
            Ok(None)
        }
    }

    async fn delete_rule(&self, _rule: &str) -> Result<(), FabricError> {
        self.record("delete_rule")
    }

    async fn delete_target_group(&self, _target_group: &str) -> Result<(), FabricError> {
        self.record("delete_target_group")
    }

    async fn delete_service(&self, _cluster: &str, _name: &str) -> Result<(), FabricError> {
        self.record("delete_service")
    }

    async fn wait_services_inactive(&self, _cluster: &str, _name: &str) -> Result<(), FabricError> {
        self.record("wait_services_inactive")
    }
}

/// Per-URL scripted controller behavior.
#[derive(Default)]
pub struct ScriptState {
    pub ping_fail: bool,
    pub ping_failures_left: usize,
    pub controller_ping_fail: bool,
    pub controller_ping_failures_left: usize,
    pub status_fail: bool,
    pub running: bool,
    pub external_id: Option<String>,
    /// Status polls reporting `running: false` before a started character
    /// turns healthy.
    pub polls_until_running: usize,
    /// Stalls `start_character` so a start task verifiably stays in flight.
    pub start_delay_ms: u64,
    pub next_external_ids: VecDeque<String>,
    pub started: Vec<CharacterPayload>,
    pub stops: usize,
}

#[derive(Default)]
pub struct ScriptedController {
    scripts: DashMap<String, Arc<Mutex<ScriptState>>>,
}

impl ScriptedController {
    pub fn script_for(&self, base_url: &str) -> Arc<Mutex<ScriptState>> {
        self.scripts
            .entry(base_url.to_string())
            .or_insert_with(Default::default)
            .value()
            .clone()
    }
}

#[async_trait]
impl ControllerApi for ScriptedController {
    async fn ping(&self, base_url: &str) -> Result<(), ControllerError> {
        let script = self.script_for(base_url);
        let mut s = script.lock().unwrap();
        if s.ping_fail {
            return Err(ControllerError::Unreachable {
                url: base_url.to_string(),
                cause: "scripted outage".into(),
            });
        }
        if s.ping_failures_left > 0 {
            s.ping_failures_left -= 1;
            return Err(ControllerError::Unreachable {
                url: base_url.to_string(),
                cause: "scripted cold start".into(),
            });
        }
        Ok(())
    }

    async fn controller_ping(&self, base_url: &str) -> Result<(), ControllerError> {
        let script = self.script_for(base_url);
        let mut s = script.lock().unwrap();
        if s.ping_fail || s.controller_ping_fail {
            return Err(ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: "scripted outage".into(),
            });
        }
        if s.controller_ping_failures_left > 0 {
            s.controller_ping_failures_left -= 1;
            return Err(ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: "scripted cold start".into(),
            });
        }
        Ok(())
    }

    async fn character_status(
        &self,
        base_url: &str,
    ) -> Result<CharacterStatus, ControllerError> {
        let script = self.script_for(base_url);
        let mut s = script.lock().unwrap();
        if s.status_fail {
            return Err(ControllerError::ControllerDown {
                url: base_url.to_string(),
                cause: "scripted outage".into(),
            });
        }
        if !s.running {
            return Ok(CharacterStatus::default());
        }
        if s.polls_until_running > 0 {
            s.polls_until_running -= 1;
            return Ok(CharacterStatus::default());
        }
        Ok(CharacterStatus {
            running: true,
            agent_id: s.external_id.clone(),
            msg: None,
        })
    }

    async fn start_character(
        &self,
        base_url: &str,
        payload: &CharacterPayload,
    ) -> Result<(), ControllerError> {
        let script = self.script_for(base_url);
        let delay_ms = {
            let mut s = script.lock().unwrap();
            s.started.push(payload.clone());
            s.running = true;
            let generated = format!("ext-{}", s.started.len());
            let next = s.next_external_ids.pop_front().unwrap_or(generated);
            s.external_id = Some(next);
            s.start_delay_ms
        };
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Ok(())
    }

    async fn stop_character(&self, base_url: &str) -> Result<(), ControllerError> {
        let script = self.script_for(base_url);
        let mut s = script.lock().unwrap();
        s.stops += 1;
        s.running = false;
        s.external_id = None;
        Ok(())
    }

    async fn read_character(
        &self,
        base_url: &str,
    ) -> Result<CharacterPayload, ControllerError> {
        let script = self.script_for(base_url);
        let s = script.lock().unwrap();
        Ok(s.started.last().cloned().unwrap_or_default())
    }
}

pub struct TestHarness {
    pub ctx: TaskContext,
    pub fabric: Arc<ScriptedFabric>,
    pub controller: Arc<ScriptedController>,
}

impl TestHarness {
    /// A runtime row as the create saga leaves it: handles filled, started.
    pub async fn provisioned_runtime(&self, service_no: u16) -> Runtime {
        let runtime = self
            .ctx
            .store
            .insert_runtime(service_no, &self.ctx.settings.fabric)
            .await
            .unwrap();
        self.ctx
            .store
            .update_runtime(runtime.id, |r| {
                r.started = true;
                r.target_group_handle = Some(format!("tg-seed-{service_no}"));
                r.http_rule_handle = Some(format!("http-rule-seed-{service_no}"));
                r.https_rule_handle = Some(format!("https-rule-seed-{service_no}"));
                r.service_handle = Some(format!("svc-seed-{service_no}"));
            })
            .await
            .unwrap()
    }

    pub async fn agent_for_owner(&self, owner_id: Uuid) -> Agent {
        self.ctx
            .store
            .insert_agent(
                owner_id,
                AgentBase {
                    character_json: serde_json::json!({"name": "finch"}),
                    env_bundle: "MODEL_KEY=secret".into(),
                },
            )
            .await
    }

    pub async fn unbound_agent(&self) -> Agent {
        self.agent_for_owner(Uuid::new_v4()).await
    }

    pub async fn bound_agent(&self, runtime_id: Uuid, external_id: &str) -> Agent {
        let agent = self.unbound_agent().await;
        self.ctx
            .store
            .update_agent(agent.id, |a| {
                a.runtime_id = Some(runtime_id);
                a.external_agent_id = Some(external_id.to_string());
            })
            .await
            .unwrap()
    }
}

pub async fn harness() -> TestHarness {
    let settings = Arc::new(Settings::for_tests());
    let store = Arc::new(StateStore::new(None));
    let fabric = Arc::new(ScriptedFabric::default());
    let controller = Arc::new(ScriptedController::default());
    let engine = TaskEngine::new(store.clone());
    let ctx = TaskContext {
        store,
        fabric: fabric.clone(),
        controller: controller.clone(),
        settings,
        engine: engine.clone(),
    };
    engine.start(ctx.clone()).await;
    TestHarness {
        ctx,
        fabric,
        controller,
    }
}

pub async fn wait_for_task(ctx: &TaskContext, task_id: Uuid) -> TaskStatus {
    for _ in 0..2000 {
        let status = ctx.store.task_status(task_id);
        if !status.in_flight() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("task {task_id} did not reach a terminal status");
}

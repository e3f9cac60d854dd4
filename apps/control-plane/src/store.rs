// [[AVIARY]]/apps/control-plane/src/store.rs
// Purpose: Authoritative entity store with Redis persistence and boot-time rehydration.
// Architecture: State Layer
// Dependencies: DashMap, Redis, Serde

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::config::FabricConfig;
use crate::error::ControlError;
use crate::models::{Agent, AgentBase, Runtime, TaskKind, TaskRecord, TaskStatus};

/// Single authority on runtimes, agents, task records, and task statuses.
///
/// Mutations are short read-then-write critical sections on map entries; no
/// entry guard is ever held across an await point. Every mutation snapshots
/// the touched row to Redis (when configured) so a restart rehydrates the
/// same state.
pub struct StateStore {
    runtimes: DashMap<Uuid, Runtime>,
    agents: DashMap<Uuid, Agent>,
    /// Uniqueness index for service numbers. Allocation races are settled
    /// here: the loser observes an occupied entry and retries.
    service_nos: DashMap<u16, Uuid>,
    /// One logical table per task kind, append-ordered by creation time.
    task_records: DashMap<TaskKind, Vec<TaskRecord>>,
    task_statuses: DashMap<Uuid, TaskStatus>,
    redis_client: Option<redis::Client>,
}

impl StateStore {
    pub fn new(redis_url: Option<&str>) -> Self {
        let redis_client = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => {
                    tracing::info!("Redis client initialized: {}", url);
                    Some(client)
                }
                Err(e) => {
                    tracing::warn!("Failed to create Redis client: {}. Persistence disabled.", e);
                    None
                }
            },
            None => {
                tracing::warn!("No broker URL set. Running without persistence.");
                None
            }
        };

        StateStore {
            runtimes: DashMap::new(),
            agents: DashMap::new(),
            service_nos: DashMap::new(),
            task_records: DashMap::new(),
            task_statuses: DashMap::new(),
            redis_client,
        }
    }

    // === RUNTIMES ===

    /// Smallest positive integer not currently allocated to a live runtime.
    pub fn next_free_service_no(&self) -> u16 {
        let mut candidate = 1u16;
        while self.service_nos.contains_key(&candidate) {
            candidate += 1;
        }
        candidate
    }

    /// Inserts a fresh runtime row under `service_no`. Fails with `Conflict`
    /// when another allocator won the number first; the caller retries from
    /// `next_free_service_no`.
    pub async fn insert_runtime(
        &self,
        service_no: u16,
        fabric: &FabricConfig,
    ) -> Result<Runtime, ControlError> {
        let runtime = Runtime {
            id: Uuid::new_v4(),
            service_no,
            url: fabric.runtime_url(service_no),
            started: false,
            last_healthcheck: None,
            failed_healthchecks: 0,
            service_handle: None,
            target_group_handle: None,
            http_rule_handle: None,
            https_rule_handle: None,
            created_at: Utc::now(),
        };

        match self.service_nos.entry(service_no) {
            Entry::Occupied(_) => {
                return Err(ControlError::conflict(format!(
                    "service number {service_no} is already allocated"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(runtime.id);
            }
        }
        self.runtimes.insert(runtime.id, runtime.clone());
        self.persist_runtime(runtime.id).await;
        Ok(runtime)
    }

    pub fn get_runtime(&self, id: Uuid) -> Result<Runtime, ControlError> {
        self.runtimes
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| ControlError::not_found("runtime", id))
    }

    pub fn list_runtimes(&self) -> Vec<Runtime> {
        let mut runtimes: Vec<Runtime> = self.runtimes.iter().map(|r| r.clone()).collect();
        runtimes.sort_by_key(|r| r.service_no);
        runtimes
    }

    pub async fn update_runtime<F>(&self, id: Uuid, mutate: F) -> Result<Runtime, ControlError>
    where
        F: FnOnce(&mut Runtime),
    {
        let updated = {
            let mut entry = self
                .runtimes
                .get_mut(&id)
                .ok_or_else(|| ControlError::not_found("runtime", id))?;
            mutate(entry.value_mut());
            entry.clone()
        };
        self.persist_runtime(id).await;
        Ok(updated)
    }

    pub async fn delete_runtime_row(&self, id: Uuid) {
        if let Some((_, runtime)) = self.runtimes.remove(&id) {
            self.service_nos
                .remove_if(&runtime.service_no, |_, owner| *owner == id);
        }
        self.persist_runtime(id).await;
    }

    /// Runtimes with no agent bound to them, lowest service number first.
    pub fn unattached_runtimes(&self) -> Vec<Runtime> {
        let bound: HashSet<Uuid> = self.agents.iter().filter_map(|a| a.runtime_id).collect();
        let mut free: Vec<Runtime> = self
            .runtimes
            .iter()
            .filter(|r| !bound.contains(&r.id))
            .map(|r| r.clone())
            .collect();
        free.sort_by_key(|r| r.service_no);
        free
    }

    // === AGENTS ===

    pub async fn insert_agent(&self, owner_id: Uuid, base: AgentBase) -> Agent {
        let agent = Agent {
            id: Uuid::new_v4(),
            owner_id,
            character_json: base.character_json,
            env_bundle: base.env_bundle,
            runtime_id: None,
            external_agent_id: None,
            created_at: Utc::now(),
        };
        self.agents.insert(agent.id, agent.clone());
        self.persist_agent(agent.id).await;
        agent
    }

    pub fn get_agent(&self, id: Uuid) -> Result<Agent, ControlError> {
        self.agents
            .get(&id)
            .map(|a| a.clone())
            .ok_or_else(|| ControlError::not_found("agent", id))
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        self.agents.iter().map(|a| a.clone()).collect()
    }

    pub fn agents_by_owner(&self, owner_id: Uuid) -> Vec<Agent> {
        self.agents
            .iter()
            .filter(|a| a.owner_id == owner_id)
            .map(|a| a.clone())
            .collect()
    }

    pub async fn update_agent<F>(&self, id: Uuid, mutate: F) -> Result<Agent, ControlError>
    where
        F: FnOnce(&mut Agent),
    {
        let updated = {
            let mut entry = self
                .agents
                .get_mut(&id)
                .ok_or_else(|| ControlError::not_found("agent", id))?;
            mutate(entry.value_mut());
            entry.clone()
        };
        self.persist_agent(id).await;
        Ok(updated)
    }

    pub async fn delete_agent_row(&self, id: Uuid) {
        self.agents.remove(&id);
        self.persist_agent(id).await;
    }

    /// Derived reverse lookup of the one-sided Agent -> Runtime relation.
    pub fn agent_bound_to(&self, runtime_id: Uuid) -> Option<Agent> {
        self.agents
            .iter()
            .find(|a| a.runtime_id == Some(runtime_id))
            .map(|a| a.clone())
    }

    /// Detaches whichever agent points at `runtime_id`, returning it.
    pub async fn clear_runtime_binding(&self, runtime_id: Uuid) -> Option<Agent> {
        let stale = self
            .agents
            .iter()
            .find(|a| a.runtime_id == Some(runtime_id))
            .map(|a| a.id)?;
        self.update_agent(stale, |a| {
            a.runtime_id = None;
            a.external_agent_id = None;
        })
        .await
        .ok()
    }

    // === TASK RECORDS & STATUSES ===

    pub async fn record_task(
        &self,
        kind: TaskKind,
        task_id: Uuid,
        runtime_id: Option<Uuid>,
        agent_id: Option<Uuid>,
    ) -> TaskRecord {
        let record = TaskRecord {
            task_id,
            kind,
            runtime_id,
            agent_id,
            created_at: Utc::now(),
        };
        self.task_records
            .entry(kind)
            .or_insert_with(Vec::new)
            .push(record.clone());
        self.persist_task_table(kind).await;
        record
    }

    pub fn latest_task_for_runtime(&self, kind: TaskKind, runtime_id: Uuid) -> Option<TaskRecord> {
        self.task_records.get(&kind).and_then(|records| {
            records
                .iter()
                .rev()
                .find(|r| r.runtime_id == Some(runtime_id))
                .cloned()
        })
    }

    /// Most recent agent-start record matching the given filters. At least
    /// one filter must be supplied.
    pub fn latest_agent_start(
        &self,
        agent_id: Option<Uuid>,
        runtime_id: Option<Uuid>,
    ) -> Option<TaskRecord> {
        if agent_id.is_none() && runtime_id.is_none() {
            return None;
        }
        self.task_records.get(&TaskKind::AgentStart).and_then(|records| {
            records
                .iter()
                .rev()
                .find(|r| {
                    agent_id.map_or(true, |a| r.agent_id == Some(a))
                        && runtime_id.map_or(true, |rt| r.runtime_id == Some(rt))
                })
                .cloned()
        })
    }

    pub async fn set_task_status(&self, task_id: Uuid, status: TaskStatus) {
        self.task_statuses.insert(task_id, status);
        self.persist_task_status(task_id, status).await;
    }

    /// Absence means the worker has not picked the task up yet.
    pub fn task_status(&self, task_id: Uuid) -> TaskStatus {
        self.task_statuses
            .get(&task_id)
            .map(|s| *s)
            .unwrap_or(TaskStatus::Pending)
    }

    // === PERSISTENCE LAYER ===

    async fn redis_conn(&self) -> Option<redis::aio::Connection> {
        let client = self.redis_client.as_ref()?;
        match client.get_async_connection().await {
            Ok(con) => Some(con),
            Err(e) => {
                tracing::error!("Redis connection failed during persist: {}", e);
                None
            }
        }
    }

    async fn persist_runtime(&self, id: Uuid) {
        let Some(mut con) = self.redis_conn().await else {
            return;
        };
        let key = format!("aviary:runtime:{id}");
        match self.runtimes.get(&id).map(|r| r.clone()) {
            Some(runtime) => match serde_json::to_string(&runtime) {
                Ok(json) => {
                    let _: redis::RedisResult<()> = con.set(&key, json).await;
                    let _: redis::RedisResult<()> =
                        con.sadd("aviary:runtimes", id.to_string()).await;
                }
                Err(e) => tracing::error!("Failed to serialize runtime {}: {}", id, e),
            },
            None => {
                let _: redis::RedisResult<()> = con.del(&key).await;
                let _: redis::RedisResult<()> = con.srem("aviary:runtimes", id.to_string()).await;
            }
        }
    }

    async fn persist_agent(&self, id: Uuid) {
        let Some(mut con) = self.redis_conn().await else {
            return;
        };
        let key = format!("aviary:agent:{id}");
        match self.agents.get(&id).map(|a| a.clone()) {
            Some(agent) => match serde_json::to_string(&agent) {
                Ok(json) => {
                    let _: redis::RedisResult<()> = con.set(&key, json).await;
                    let _: redis::RedisResult<()> = con.sadd("aviary:agents", id.to_string()).await;
                }
                Err(e) => tracing::error!("Failed to serialize agent {}: {}", id, e),
            },
            None => {
                let _: redis::RedisResult<()> = con.del(&key).await;
                let _: redis::RedisResult<()> = con.srem("aviary:agents", id.to_string()).await;
            }
        }
    }

    async fn persist_task_table(&self, kind: TaskKind) {
        let Some(mut con) = self.redis_conn().await else {
            return;
        };
        let records = self
            .task_records
            .get(&kind)
            .map(|r| r.clone())
            .unwrap_or_default();
        match serde_json::to_string(&records) {
            Ok(json) => {
                let key = format!("aviary:tasks:{}", kind.table_key());
                let _: redis::RedisResult<()> = con.set(&key, json).await;
            }
            Err(e) => tracing::error!("Failed to serialize {} task table: {}", kind.table_key(), e),
        }
    }

    async fn persist_task_status(&self, task_id: Uuid, status: TaskStatus) {
        let Some(mut con) = self.redis_conn().await else {
            return;
        };
        match serde_json::to_string(&status) {
            Ok(raw) => {
                let _: redis::RedisResult<()> =
                    con.hset("aviary:task_status", task_id.to_string(), raw).await;
            }
            Err(e) => tracing::error!("Failed to serialize status for {}: {}", task_id, e),
        }
    }

    /// Rebuild the in-memory state from Redis on boot. Tasks that were still
    /// in flight when the process died lost their queue entries, so they are
    /// demoted to FAILURE rather than left dangling.
    pub async fn rehydrate(&self) {
        if self.redis_client.is_none() {
            return;
        }
        tracing::info!("Attempting to rehydrate state from Redis...");
        let Some(mut con) = self.redis_conn().await else {
            return;
        };

        let runtime_ids: Vec<String> = con.smembers("aviary:runtimes").await.unwrap_or_default();
        for id in runtime_ids {
            let json: Option<String> = con
                .get(format!("aviary:runtime:{id}"))
                .await
                .unwrap_or(None);
            let Some(json) = json else { continue };
            match serde_json::from_str::<Runtime>(&json) {
                Ok(runtime) => {
                    self.service_nos.insert(runtime.service_no, runtime.id);
                    self.runtimes.insert(runtime.id, runtime);
                }
                Err(e) => tracing::error!("Failed to deserialize runtime {}: {}", id, e),
            }
        }

        let agent_ids: Vec<String> = con.smembers("aviary:agents").await.unwrap_or_default();
        for id in agent_ids {
            let json: Option<String> =
                con.get(format!("aviary:agent:{id}")).await.unwrap_or(None);
            let Some(json) = json else { continue };
            match serde_json::from_str::<Agent>(&json) {
                Ok(agent) => {
                    self.agents.insert(agent.id, agent);
                }
                Err(e) => tracing::error!("Failed to deserialize agent {}: {}", id, e),
            }
        }

        for kind in TaskKind::all() {
            let json: Option<String> = con
                .get(format!("aviary:tasks:{}", kind.table_key()))
                .await
                .unwrap_or(None);
            let Some(json) = json else { continue };
            match serde_json::from_str::<Vec<TaskRecord>>(&json) {
                Ok(records) => {
                    self.task_records.insert(kind, records);
                }
                Err(e) => {
                    tracing::error!("Failed to deserialize {} task table: {}", kind.table_key(), e)
                }
            }
        }

        let statuses: HashMap<String, String> =
            con.hgetall("aviary:task_status").await.unwrap_or_default();
        for (id, raw) in statuses {
            let (Ok(task_id), Ok(status)) =
                (Uuid::parse_str(&id), serde_json::from_str::<TaskStatus>(&raw))
            else {
                continue;
            };
            let status = if status.in_flight() {
                tracing::warn!(
                    "Task {} was {:?} at shutdown; marking FAILURE",
                    task_id,
                    status
                );
                let demoted = TaskStatus::Failure;
                if let Ok(raw) = serde_json::to_string(&demoted) {
                    let _: redis::RedisResult<()> =
                        con.hset("aviary:task_status", id, raw).await;
                }
                demoted
            } else {
                status
            };
            self.task_statuses.insert(task_id, status);
        }

        tracing::info!(
            "Rehydrated {} runtime(s) and {} agent(s) from persistence layer.",
            self.runtimes.len(),
            self.agents.len()
        );
    }
}

// [[AVIARY]]/apps/control-plane/src/models.rs
// Purpose: Core data models shared by the store, task engine, and API layer.
// Architecture: Shared Data Layer
// Dependencies: Serde, Chrono, Uuid

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A reservation for one remote container behind the shared load balancer.
///
/// Cloud handles are filled in monotonically while provisioning runs; a
/// partially-filled row is always truthful so teardown can release exactly
/// what was allocated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runtime {
    pub id: Uuid,
    /// Small positive integer, unique among live runtimes. Drives the
    /// service name, subdomain, and listener-rule priority.
    pub service_no: u16,
    pub url: String,
    /// Has this runtime answered its controller ping at least once since the
    /// last create/update?
    pub started: bool,
    pub last_healthcheck: Option<DateTime<Utc>>,
    pub failed_healthchecks: u32,
    pub service_handle: Option<String>,
    pub target_group_handle: Option<String>,
    pub http_rule_handle: Option<String>,
    pub https_rule_handle: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A persisted character definition owned by a user. Bound to at most one
/// runtime at a time; the relation lives on this side only and the reverse
/// direction is derived by query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub character_json: Value,
    /// Env-file-style bundle handed verbatim to the runtime controller.
    pub env_bundle: String,
    pub runtime_id: Option<Uuid>,
    /// Id the in-container controller assigned to the running character.
    /// Opaque to the control plane.
    pub external_agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentBase {
    pub character_json: Value,
    #[serde(default)]
    pub env_bundle: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentUpdate {
    pub character_json: Option<Value>,
    pub env_bundle: Option<String>,
}

/// Public mirror of an agent with its runtime resolved and the env bundle
/// withheld.
#[derive(Debug, Clone, Serialize)]
pub struct AgentPublic {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub character_json: Value,
    pub external_agent_id: Option<String>,
    pub runtime: Option<RuntimePublic>,
}

impl AgentPublic {
    pub fn from_parts(agent: &Agent, runtime: Option<&Runtime>) -> Self {
        AgentPublic {
            id: agent.id,
            owner_id: agent.owner_id,
            character_json: agent.character_json.clone(),
            external_agent_id: agent.external_agent_id.clone(),
            runtime: runtime.map(RuntimePublic::from),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimePublic {
    pub id: Uuid,
    pub service_no: u16,
    pub url: String,
    pub started: bool,
    pub last_healthcheck: Option<DateTime<Utc>>,
    pub failed_healthchecks: u32,
}

impl From<&Runtime> for RuntimePublic {
    fn from(runtime: &Runtime) -> Self {
        RuntimePublic {
            id: runtime.id,
            service_no: runtime.service_no,
            url: runtime.url.clone(),
            started: runtime.started,
            last_healthcheck: runtime.last_healthcheck,
            failed_healthchecks: runtime.failed_healthchecks,
        }
    }
}

// === TASK BOOKKEEPING ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    RuntimeCreate,
    RuntimeUpdate,
    RuntimeDelete,
    AgentStart,
}

impl TaskKind {
    /// Stable key fragment for the per-kind persistence tables.
    pub fn table_key(self) -> &'static str {
        match self {
            TaskKind::RuntimeCreate => "runtime_create",
            TaskKind::RuntimeUpdate => "runtime_update",
            TaskKind::RuntimeDelete => "runtime_delete",
            TaskKind::AgentStart => "agent_start",
        }
    }

    pub fn all() -> [TaskKind; 4] {
        [
            TaskKind::RuntimeCreate,
            TaskKind::RuntimeUpdate,
            TaskKind::RuntimeDelete,
            TaskKind::AgentStart,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn in_flight(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Started)
    }
}

/// One row per lifecycle invocation. The most recent record for a
/// `(kind, key)` pair is authoritative; the engine stores statuses
/// separately, keyed by `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub runtime_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// === RUNTIME CONTROLLER CONTRACT ===

/// Body of `POST /controller/character/start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterPayload {
    pub character_json: Value,
    pub envs: String,
}

/// Response shape of `GET /controller/character/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterStatus {
    pub running: bool,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
}

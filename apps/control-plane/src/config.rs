// [[AVIARY]]/apps/control-plane/src/config.rs
// Purpose: Environment selection, fabric coordinates, and tunables.
// Architecture: Configuration Layer
// Dependencies: Serde, std::env

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Env {
    Dev,
    Test,
    Staging,
    Prod,
}

impl Env {
    pub fn from_env() -> Self {
        match env::var("ENV").as_deref() {
            Ok("prod") => Env::Prod,
            Ok("staging") => Env::Staging,
            Ok("test") => Env::Test,
            _ => Env::Dev,
        }
    }
}

/// Per-environment fabric coordinates. The VPC, listeners, cluster, and task
/// definition family are provisioned out-of-band; runtimes attach to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    pub vpc_id: String,
    pub http_listener_arn: String,
    pub https_listener_arn: String,
    pub cluster: String,
    pub task_definition_family: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub host: String,
    pub subdomain_prefix: String,
}

impl FabricConfig {
    pub fn for_env(env: Env) -> Self {
        match env {
            Env::Prod => FabricConfig {
                vpc_id: "vpc-0b51c2e7d9aa41f38".into(),
                http_listener_arn: "arn:aws:elasticloadbalancing:us-east-1:000000000000:listener/app/aviary/7c1e38614d895a63/0418e5a3323e20fc".into(),
                https_listener_arn: "arn:aws:elasticloadbalancing:us-east-1:000000000000:listener/app/aviary/7c1e38614d895a63/5ccef0a9112d870c".into(),
                cluster: "Aviary".into(),
                task_definition_family: "aviary-agent-runtime".into(),
                subnets: vec![
                    "subnet-03609df324958be8e".into(),
                    "subnet-0643691ae2f5f1e32".into(),
                ],
                security_groups: vec!["sg-08dd9f6f9ecc9bfe9".into()],
                host: "aviary.chat".into(),
                subdomain_prefix: "aviary-runtime".into(),
            },
            Env::Staging => FabricConfig {
                vpc_id: "vpc-028f84ceaa7ceffdf".into(),
                http_listener_arn: "arn:aws:elasticloadbalancing:us-east-1:000000000000:listener/app/aviary-staging/cca8548986966f89/681e2c72542f3c11".into(),
                https_listener_arn: "arn:aws:elasticloadbalancing:us-east-1:000000000000:listener/app/aviary-staging/cca8548986966f89/0e71c1863b9f0654".into(),
                cluster: "AviaryStaging".into(),
                task_definition_family: "aviary-agent-runtime-staging".into(),
                subnets: vec![
                    "subnet-0c145d71e9bc921ce".into(),
                    "subnet-08a79f79b7375c569".into(),
                ],
                security_groups: vec!["sg-0475538bebfc71f2e".into()],
                host: "staging.aviary.chat".into(),
                subdomain_prefix: "aviary-runtime-staging".into(),
            },
            // Dev and test point at local stand-ins; the fabric is scripted
            // in tests and unused on a laptop.
            Env::Dev | Env::Test => FabricConfig {
                vpc_id: "vpc-local".into(),
                http_listener_arn: "listener-http-local".into(),
                https_listener_arn: "listener-https-local".into(),
                cluster: "AviaryDev".into(),
                task_definition_family: "aviary-agent-runtime-dev".into(),
                subnets: vec!["subnet-local".into()],
                security_groups: vec!["sg-local".into()],
                host: "localhost".into(),
                subdomain_prefix: "aviary-runtime-dev".into(),
            },
        }
    }

    /// ECS service name and target group name share this shape.
    pub fn service_name(&self, service_no: u16) -> String {
        format!("{}-{}", self.subdomain_prefix, service_no)
    }

    pub fn subdomain(&self, service_no: u16) -> String {
        format!("{}-{}", self.subdomain_prefix, service_no)
    }

    pub fn runtime_url(&self, service_no: u16) -> String {
        format!("https://{}.{}", self.subdomain(service_no), self.host)
    }

    /// Listener-rule priority. Spaced by ten so neighbouring runtimes never
    /// collide even when rules are edited by hand.
    pub fn rule_priority(&self, service_no: u16) -> i32 {
        100 + 10 * i32::from(service_no)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    pub attempts: u32,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Env,
    pub port: u16,
    pub fabric: FabricConfig,
    /// Broker/persistence coordinates. `CELERY_BROKER_URL` wins over
    /// `REDIS_URL`; absent means memory-only state.
    pub redis_url: Option<String>,
    /// Upper bound on unattached runtimes kept warm.
    pub idle_pool_size: usize,
    /// Runtimes provisioned per pool-empty trigger.
    pub pool_increment: usize,
    pub worker_concurrency: usize,
    pub healthcheck_interval: Duration,
    pub update_threshold: u32,
    pub delete_threshold: u32,
    pub create_poll: PollBudget,
    pub agent_start_poll: PollBudget,
    pub redeploy_poll: PollBudget,
    pub cors_origins: Vec<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        let env = Env::from_env();
        Settings {
            env,
            port: env_parse("PORT", 3000),
            fabric: FabricConfig::for_env(env),
            redis_url: std::env::var("CELERY_BROKER_URL")
                .or_else(|_| std::env::var("REDIS_URL"))
                .ok(),
            idle_pool_size: env_parse("RUNTIME_IDLE_POOL_SIZE", 2),
            pool_increment: env_parse("RUNTIME_POOL_INCREMENT", 2),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 4),
            healthcheck_interval: Duration::from_secs(env_parse(
                "HEALTHCHECK_INTERVAL_SECS",
                300,
            )),
            update_threshold: 3,
            delete_threshold: 5,
            create_poll: PollBudget {
                attempts: 40,
                interval: Duration::from_secs(15),
            },
            agent_start_poll: PollBudget {
                attempts: 60,
                interval: Duration::from_secs(10),
            },
            redeploy_poll: PollBudget {
                attempts: 40,
                interval: Duration::from_secs(15),
            },
            cors_origins: match env {
                Env::Prod => vec!["https://aviary.chat".into()],
                Env::Staging => vec!["https://staging.aviary.chat".into()],
                Env::Dev | Env::Test => Vec::new(),
            },
        }
    }

    /// Shrunk budgets so poll loops finish in milliseconds.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        let mut settings = Settings::from_env();
        settings.env = Env::Test;
        settings.fabric = FabricConfig::for_env(Env::Test);
        settings.redis_url = None;
        settings.worker_concurrency = 4;
        settings.healthcheck_interval = Duration::from_secs(300);
        settings.create_poll = PollBudget {
            attempts: 5,
            interval: Duration::from_millis(5),
        };
        settings.agent_start_poll = PollBudget {
            attempts: 5,
            interval: Duration::from_millis(5),
        };
        settings.redeploy_poll = PollBudget {
            attempts: 5,
            interval: Duration::from_millis(5),
        };
        settings
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

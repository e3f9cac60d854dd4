// [[AVIARY]]/apps/control-plane/src/fabric.rs
// Purpose: Thin typed adapter over the container service and load balancer APIs.
// Architecture: Infrastructure Adapter Layer
// Dependencies: aws-sdk-ecs, aws-sdk-elasticloadbalancingv2, async-trait

use async_trait::async_trait;
use aws_sdk_ecs::error::DisplayErrorContext;
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, LaunchType, LoadBalancer, NetworkConfiguration,
};
use aws_sdk_elasticloadbalancingv2::types::{
    Action, ActionTypeEnum, ProtocolEnum, RedirectActionConfig, RedirectActionStatusCodeEnum,
    RuleCondition, TargetTypeEnum,
};
use thiserror::Error;

use crate::config::PollBudget;

/// Every fabric operation fails with one kind, naming the operation and
/// wrapping the provider error. Inside a saga this triggers compensation.
#[derive(Debug, Error)]
#[error("fabric operation {op} failed: {cause}")]
pub struct FabricError {
    pub op: &'static str,
    pub cause: String,
}

impl FabricError {
    pub fn new(op: &'static str, cause: impl ToString) -> Self {
        FabricError {
            op,
            cause: cause.to_string(),
        }
    }
}

/// The verbs the lifecycle sagas need from the cloud. One method per named
/// operation, explicit inputs, no hidden retries.
#[async_trait]
pub trait CloudFabric: Send + Sync {
    /// Creates a target group with an HTTPS health check on `health_path`.
    /// Returns its handle (ARN).
    async fn create_target_group(
        &self,
        name: &str,
        vpc_id: &str,
        health_path: &str,
    ) -> Result<String, FabricError>;

    /// Creates one rule per listener for `host_pattern` at `priority`. The
    /// HTTP rule issues a 301 to HTTPS; the HTTPS rule forwards to the
    /// target group. Returns `(http_rule, https_rule)` handles.
    async fn create_listener_rules(
        &self,
        http_listener: &str,
        https_listener: &str,
        host_pattern: &str,
        target_group: &str,
        priority: i32,
    ) -> Result<(String, String), FabricError>;

    /// Creates the container service bound to `target_group`, pinned to the
    /// latest revision of `family`. Returns the service handle.
    async fn create_service(
        &self,
        cluster: &str,
        name: &str,
        family: &str,
        security_groups: &[String],
        subnets: &[String],
        target_group: &str,
    ) -> Result<String, FabricError>;

    async fn latest_task_definition_revision(&self, family: &str) -> Result<i32, FabricError>;

    /// Forces a fresh deployment of `service_name` onto `task_definition`
    /// (a `family:revision` reference).
    async fn force_redeploy(
        &self,
        cluster: &str,
        service_name: &str,
        task_definition: &str,
    ) -> Result<String, FabricError>;

    /// Id of the deployment still in `ACTIVE` state (the one being drained
    /// during a roll), if any.
    async fn describe_service_active_deployment(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<String>, FabricError>;

    async fn delete_rule(&self, rule: &str) -> Result<(), FabricError>;

    async fn delete_target_group(&self, target_group: &str) -> Result<(), FabricError>;

    async fn delete_service(&self, cluster: &str, name: &str) -> Result<(), FabricError>;

    /// Blocks until the named service no longer reports ACTIVE or DRAINING.
    async fn wait_services_inactive(&self, cluster: &str, name: &str) -> Result<(), FabricError>;
}

/// Production fabric speaking to ECS and ELBv2.
pub struct AwsFabric {
    ecs: aws_sdk_ecs::Client,
    elbv2: aws_sdk_elasticloadbalancingv2::Client,
    drain_poll: PollBudget,
}

impl AwsFabric {
    pub async fn from_env(drain_poll: PollBudget) -> Self {
        let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        AwsFabric {
            ecs: aws_sdk_ecs::Client::new(&shared),
            elbv2: aws_sdk_elasticloadbalancingv2::Client::new(&shared),
            drain_poll,
        }
    }
}

#[async_trait]
impl CloudFabric for AwsFabric {
    async fn create_target_group(
        &self,
        name: &str,
        vpc_id: &str,
        health_path: &str,
    ) -> Result<String, FabricError> {
        let out = self
            .elbv2
            .create_target_group()
            .name(name)
            .vpc_id(vpc_id)
            .protocol(ProtocolEnum::Http)
            .port(80)
            .target_type(TargetTypeEnum::Ip)
            .health_check_protocol(ProtocolEnum::Https)
            .health_check_port("traffic-port")
            .health_check_path(health_path)
            .send()
            .await
            .map_err(|e| FabricError::new("create_target_group", DisplayErrorContext(e)))?;
        out.target_groups()
            .first()
            .and_then(|tg| tg.target_group_arn())
            .map(str::to_string)
            .ok_or_else(|| FabricError::new("create_target_group", "no target group in response"))
    }

    async fn create_listener_rules(
        &self,
        http_listener: &str,
        https_listener: &str,
        host_pattern: &str,
        target_group: &str,
        priority: i32,
    ) -> Result<(String, String), FabricError> {
        let condition = RuleCondition::builder()
            .field("host-header")
            .values(host_pattern)
            .build();

        let redirect = Action::builder()
            .r#type(ActionTypeEnum::Redirect)
            .redirect_config(
                RedirectActionConfig::builder()
                    .protocol("HTTPS")
                    .port("443")
                    .status_code(RedirectActionStatusCodeEnum::Http301)
                    .build(),
            )
            .build();

        let forward = Action::builder()
            .r#type(ActionTypeEnum::Forward)
            .target_group_arn(target_group)
            .build();

        let http_rule = self
            .elbv2
            .create_rule()
            .listener_arn(http_listener)
            .conditions(condition.clone())
            .priority(priority)
            .actions(redirect)
            .send()
            .await
            .map_err(|e| FabricError::new("create_listener_rules", DisplayErrorContext(e)))?;

        let https_rule = self
            .elbv2
            .create_rule()
            .listener_arn(https_listener)
            .conditions(condition)
            .priority(priority)
            .actions(forward)
            .send()
            .await
            .map_err(|e| FabricError::new("create_listener_rules", DisplayErrorContext(e)))?;

        let http_rule_arn = http_rule
            .rules()
            .first()
            .and_then(|r| r.rule_arn())
            .map(str::to_string)
            .ok_or_else(|| FabricError::new("create_listener_rules", "no HTTP rule in response"))?;
        let https_rule_arn = https_rule
            .rules()
            .first()
            .and_then(|r| r.rule_arn())
            .map(str::to_string)
            .ok_or_else(|| {
                FabricError::new("create_listener_rules", "no HTTPS rule in response")
            })?;

        Ok((http_rule_arn, https_rule_arn))
    }

    async fn create_service(
        &self,
        cluster: &str,
        name: &str,
        family: &str,
        security_groups: &[String],
        subnets: &[String],
        target_group: &str,
    ) -> Result<String, FabricError> {
        let revision = self.latest_task_definition_revision(family).await?;
        let task_definition = format!("{family}:{revision}");

        let vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(subnets.to_vec()))
            .set_security_groups(Some(security_groups.to_vec()))
            .assign_public_ip(AssignPublicIp::Enabled)
            .build()
            .map_err(|e| FabricError::new("create_service", DisplayErrorContext(e)))?;

        let out = self
            .ecs
            .create_service()
            .cluster(cluster)
            .service_name(name)
            .task_definition(&task_definition)
            .desired_count(1)
            .launch_type(LaunchType::Fargate)
            .network_configuration(
                NetworkConfiguration::builder().awsvpc_configuration(vpc).build(),
            )
            .load_balancers(
                LoadBalancer::builder()
                    .target_group_arn(target_group)
                    .container_name("runtime")
                    .container_port(80)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| FabricError::new("create_service", DisplayErrorContext(e)))?;

        out.service()
            .and_then(|s| s.service_arn())
            .map(str::to_string)
            .ok_or_else(|| FabricError::new("create_service", "no service in response"))
    }

    async fn latest_task_definition_revision(&self, family: &str) -> Result<i32, FabricError> {
        let out = self
            .ecs
            .describe_task_definition()
            .task_definition(family)
            .send()
            .await
            .map_err(|e| {
                FabricError::new("latest_task_definition_revision", DisplayErrorContext(e))
            })?;
        out.task_definition()
            .map(|td| td.revision())
            .ok_or_else(|| {
                FabricError::new("latest_task_definition_revision", "no task definition found")
            })
    }

    async fn force_redeploy(
        &self,
        cluster: &str,
        service_name: &str,
        task_definition: &str,
    ) -> Result<String, FabricError> {
        let out = self
            .ecs
            .update_service()
            .cluster(cluster)
            .service(service_name)
            .task_definition(task_definition)
            .force_new_deployment(true)
            .send()
            .await
            .map_err(|e| FabricError::new("force_redeploy", DisplayErrorContext(e)))?;
        out.service()
            .and_then(|s| s.service_arn())
            .map(str::to_string)
            .ok_or_else(|| FabricError::new("force_redeploy", "no service in response"))
    }

    async fn describe_service_active_deployment(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<String>, FabricError> {
        let out = self
            .ecs
            .describe_services()
            .cluster(cluster)
            .services(name)
            .send()
            .await
            .map_err(|e| {
                FabricError::new("describe_service_active_deployment", DisplayErrorContext(e))
            })?;
        let active = out.services().first().and_then(|service| {
            service
                .deployments()
                .iter()
                .find(|d| d.status() == Some("ACTIVE"))
                .and_then(|d| d.id())
                .map(str::to_string)
        });
        Ok(active)
    }

    async fn delete_rule(&self, rule: &str) -> Result<(), FabricError> {
        self.elbv2
            .delete_rule()
            .rule_arn(rule)
            .send()
            .await
            .map_err(|e| FabricError::new("delete_rule", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn delete_target_group(&self, target_group: &str) -> Result<(), FabricError> {
        self.elbv2
            .delete_target_group()
            .target_group_arn(target_group)
            .send()
            .await
            .map_err(|e| FabricError::new("delete_target_group", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn delete_service(&self, cluster: &str, name: &str) -> Result<(), FabricError> {
        self.ecs
            .delete_service()
            .cluster(cluster)
            .service(name)
            .force(true)
            .send()
            .await
            .map_err(|e| FabricError::new("delete_service", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn wait_services_inactive(&self, cluster: &str, name: &str) -> Result<(), FabricError> {
        // Explicit describe/sleep loop rather than the SDK waiter so the
        // retry cadence stays visible and bounded.
        for attempt in 1..=self.drain_poll.attempts {
            let out = self
                .ecs
                .describe_services()
                .cluster(cluster)
                .services(name)
                .send()
                .await
                .map_err(|e| FabricError::new("wait_services_inactive", DisplayErrorContext(e)))?;
            let still_live = out
                .services()
                .iter()
                .any(|s| matches!(s.status(), Some("ACTIVE") | Some("DRAINING")));
            if !still_live {
                return Ok(());
            }
            tracing::info!(
                "{}/{}: service {} still draining",
                attempt,
                self.drain_poll.attempts,
                name
            );
            tokio::time::sleep(self.drain_poll.interval).await;
        }
        Err(FabricError::new(
            "wait_services_inactive",
            format!("service {name} did not drain in time"),
        ))
    }
}

//! Standalone single project suite.
//!
//! Applies the standalone example into the project created by the setup
//! stack and verifies each fleet membership's cluster. With teardown
//! enabled, leftover multi-cluster service discovery firewall rules are
//! removed before the stack itself is destroyed.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use stackverify_core::{
    fan_out, query_list, run_unit, CommandSpec, Node, QueryCommand, QueryOptions, StackHandle,
    UnitBody, Verifier, VerifyContext, VerifyError, VerifyResult,
};

use crate::checks::{self, command, fetch, path_segment, NODE_POOL};

pub const SUITE: &str = "standalone";

const MEMBERSHIP_PREFIX: &str = "//gkehub.googleapis.com/";
const SERVICE_ACCOUNT_PATTERN: &str = r"^[a-zA-Z0-9_+-]+@[a-zA-Z0-9-]+.iam.gserviceaccount.com$";
const BINARY_AUTHORIZATION_MODE: &str = "PROJECT_SINGLETON_POLICY_ENFORCE";
/// Firewall rules created by multi-cluster service discovery outside the stack.
const LEFTOVER_FIREWALL_FILTER: &str = "mcsd";

/// Value of the `cluster_type` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    Standard,
    /// Standard cluster with node auto-provisioning.
    StandardNap,
    Autopilot,
}

impl FromStr for ClusterType {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STANDARD" => Ok(ClusterType::Standard),
            "STANDARD-NAP" => Ok(ClusterType::StandardNap),
            "AUTOPILOT" => Ok(ClusterType::Autopilot),
            other => Err(VerifyError::Fatal(format!("unknown cluster type: {other}"))),
        }
    }
}

pub async fn run(ctx: &VerifyContext) -> VerifyResult<UnitBody> {
    let setup = ctx.attach(&ctx.config.stages.standalone_setup).await?;
    let project = setup.string_output(&ctx.config.standalone.project_output)?;

    let definition = ctx
        .definition(&ctx.config.stages.standalone)
        .var("project_id", project.clone());
    let mut stack = ctx.handle(definition)?;
    if let Err(err) = stack.apply().await {
        if ctx.config.teardown {
            teardown(ctx, &mut stack, &project).await;
        }
        return Err(err.into());
    }

    let verified = run_unit("verify", verify(ctx, &stack, &project)).await;
    if ctx.config.teardown {
        teardown(ctx, &mut stack, &project).await;
    }

    let mut body = UnitBody::new();
    body.add_children(vec![verified]);
    Ok(body)
}

async fn verify(ctx: &VerifyContext, stack: &StackHandle, project: &str) -> VerifyResult<UnitBody> {
    let memberships = stack.list_output("cluster_membership_ids")?;
    let cluster_type: ClusterType = stack.string_output("cluster_type")?.parse()?;
    let service_accounts: Vec<String> = stack
        .json_output("cluster_service_accounts")?
        .items()
        .iter()
        .map(Node::text)
        .collect();

    let pattern = Regex::new(SERVICE_ACCOUNT_PATTERN)
        .map_err(|e| VerifyError::Fatal(format!("service account pattern: {e}")))?;

    let shared = ctx.clone();
    let cluster_project = Arc::new(project.to_string());
    let units = memberships
        .into_iter()
        .map(|id| (format!("membership {id}"), id));
    let children = fan_out("standalone/verify", units, move |id| {
        let ctx = shared.clone();
        let project = Arc::clone(&cluster_project);
        async move { verify_membership(&ctx, &project, &id, cluster_type).await }
    })
    .await;

    let mut checks = Verifier::new();
    let cross_project = ctx.config.standalone.fleet_project.is_cross_project(project);
    checks::hub_agent_roles(ctx, &mut checks, project, cross_project).await;
    checks::cloud_armor(ctx, &mut checks, project).await;

    let subject = "output cluster_service_accounts";
    checks.non_empty(
        subject,
        &service_accounts,
        "the output must contain more than 0 service accounts",
    );
    for sa in &service_accounts {
        checks.matches(
            subject,
            &pattern,
            sa,
            "the cluster SA value must be a Google service account",
        );
    }

    let mut body = UnitBody::with_checks(checks);
    body.add_children(children);
    Ok(body)
}

async fn verify_membership(
    ctx: &VerifyContext,
    project: &str,
    id: &str,
    cluster_type: ClusterType,
) -> VerifyResult<UnitBody> {
    let subject = format!("membership {id}");
    let mut checks = Verifier::new();

    let name = id.strip_prefix(MEMBERSHIP_PREFIX).unwrap_or(id);
    let describe = command("container fleet memberships describe").arg(name);
    let Some(membership) = fetch(ctx, &mut checks, &subject, describe).await else {
        return Ok(UnitBody::with_checks(checks));
    };
    let link = membership.get("endpoint.gkeCluster.resourceLink").text();
    let (Some(location), Some(cluster_name)) =
        (path_segment(&link, "locations"), path_segment(&link, "clusters"))
    else {
        return Err(VerifyError::Fatal(format!(
            "membership {id} does not resolve to a cluster (resource link '{link}')"
        ))
        .with_checks(checks));
    };

    let cluster_subject = format!("cluster {cluster_name}");
    let describe = command("container clusters describe")
        .arg(cluster_name)
        .arg("--location")
        .arg(location)
        .arg("--project")
        .arg(project);
    let Some(cluster) = fetch(ctx, &mut checks, &cluster_subject, describe).await else {
        return Ok(UnitBody::with_checks(checks));
    };

    checks.is_true(
        &cluster_subject,
        cluster.get("privateClusterConfig.enablePrivateEndpoint").as_bool(),
        "the cluster external endpoint must be private",
    );
    verify_no_external_ips(ctx, &mut checks, project, &cluster.get("nodePools.0.name").text()).await;
    if let Err(err) = verify_node_pools(&mut checks, &cluster_subject, &cluster, cluster_type) {
        return Err(err.with_checks(checks));
    }
    checks::cluster_fleet_settings(
        &mut checks,
        &cluster_subject,
        &cluster,
        &membership,
        project,
        cluster_type != ClusterType::Autopilot,
    );
    checks.equal(
        &cluster_subject,
        BINARY_AUTHORIZATION_MODE,
        cluster.get("binaryAuthorization.evaluationMode").text(),
        format!("binary authorization evaluation mode should be {BINARY_AUTHORIZATION_MODE}"),
    );

    Ok(UnitBody::with_checks(checks))
}

/// No network interface of a node in `pool` carries a NAT IP.
async fn verify_no_external_ips(ctx: &VerifyContext, checks: &mut Verifier, project: &str, pool: &str) {
    let subject = format!("node pool {pool}");
    let list = command("compute instances list").arg(format!("--project={project}"));
    let options = QueryOptions::default().filter(format!("labels.goog-k8s-node-pool-name={pool}"));
    let Some(nodes) = checks::fetch_with(ctx, checks, &subject, list, options).await else {
        return;
    };
    for node in nodes.items() {
        for nic in node.get("networkInterfaces").items() {
            let nat_ip = nic.get("accessConfigs.0.natIP").text();
            checks.is_false(
                &subject,
                nat_ip.parse::<IpAddr>().is_ok(),
                format!("node {} should not have an external ip address", node.get("name").text()),
            );
        }
    }
}

fn verify_node_pools(
    checks: &mut Verifier,
    subject: &str,
    cluster: &Node,
    cluster_type: ClusterType,
) -> VerifyResult<()> {
    match cluster_type {
        ClusterType::Standard => checks::standard_node_pool(checks, subject, &cluster.get("nodePools.0")),
        ClusterType::StandardNap => {
            for pool in cluster.get("nodePools").items() {
                let name = pool.get("name").text();
                let autoprovisioned = pool.get("autoscaling.autoprovisioned").as_bool();
                if name == NODE_POOL {
                    checks.is_false(subject, autoprovisioned, "NodePool autoscaling autoprovisioned should be disabled");
                } else if name.starts_with("nap-") {
                    checks.is_true(subject, autoprovisioned, "NodePool autoscaling autoprovisioned should be enabled");
                } else {
                    return Err(VerifyError::Fatal(format!("unknown node pool: {name}")));
                }
                checks::surge_and_autoscaling(checks, subject, &pool);
            }
        }
        ClusterType::Autopilot => {}
    }
    Ok(())
}

/// Remove leftover firewall rules, then destroy the stack. Failures are
/// logged and never change the verification result.
async fn teardown(ctx: &VerifyContext, stack: &mut StackHandle, project: &str) {
    let list = QueryCommand::parse("compute firewall-rules list")
        .arg("--project")
        .arg(project);
    let options = QueryOptions::default().filter(LEFTOVER_FIREWALL_FILTER);
    match query_list(ctx.query.as_ref(), &list, &options).await {
        Ok(rules) => {
            for rule in rules {
                let name = rule.get("name").text();
                let spec = CommandSpec::new(&ctx.config.tools.gcloud)
                    .args(["compute", "firewall-rules", "delete"])
                    .arg(&name)
                    .arg("--project")
                    .arg(project)
                    .arg("-q")
                    .timeout(ctx.config.tools.command_timeout());
                match ctx.runner.run(&spec).await {
                    Ok(output) if output.passed() => {
                        tracing::info!(rule = %name, project = %project, "firewall rule deleted");
                    }
                    Ok(output) => {
                        tracing::warn!(rule = %name, stderr = %output.diagnostic(), "firewall rule delete failed");
                    }
                    Err(err) => tracing::warn!(rule = %name, error = %err, "firewall rule delete failed"),
                }
            }
        }
        Err(err) => tracing::warn!(project = %project, error = %err, "listing leftover firewall rules failed"),
    }
    stack.teardown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cluster_type_parse() {
        assert_eq!("STANDARD".parse::<ClusterType>().unwrap(), ClusterType::Standard);
        assert_eq!("STANDARD-NAP".parse::<ClusterType>().unwrap(), ClusterType::StandardNap);
        assert_eq!("AUTOPILOT".parse::<ClusterType>().unwrap(), ClusterType::Autopilot);
        let err = "ENTERPRISE".parse::<ClusterType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown cluster type: ENTERPRISE");
    }

    fn pool(name: &str, autoprovisioned: bool) -> serde_json::Value {
        json!({
            "name": name,
            "upgradeSettings": { "strategy": "SURGE", "maxSurge": 1 },
            "autoscaling": {
                "locationPolicy": "BALANCED",
                "enabled": true,
                "autoprovisioned": autoprovisioned
            }
        })
    }

    #[test]
    fn test_nap_pools_checked_by_name() {
        let cluster = Node::from(json!({
            "nodePools": [pool("node-pool-1", false), pool("nap-e2-standard-4", true)]
        }));
        let mut checks = Verifier::new();
        verify_node_pools(&mut checks, "cluster c", &cluster, ClusterType::StandardNap).unwrap();
        assert_eq!(checks.len(), 10);
        assert!(checks.passed());
    }

    #[test]
    fn test_unknown_nap_pool_is_fatal() {
        let cluster = Node::from(json!({ "nodePools": [pool("spot-pool", true)] }));
        let mut checks = Verifier::new();
        let err = verify_node_pools(&mut checks, "cluster c", &cluster, ClusterType::StandardNap)
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown node pool: spot-pool");
    }

    #[test]
    fn test_autopilot_pools_are_not_checked() {
        let cluster = Node::from(json!({ "nodePools": [pool("whatever", true)] }));
        let mut checks = Verifier::new();
        verify_node_pools(&mut checks, "cluster c", &cluster, ClusterType::Autopilot).unwrap();
        assert!(checks.is_empty());
    }
}

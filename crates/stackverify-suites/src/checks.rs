//! Building blocks shared by several suites.
//!
//! Query failures are recorded as failed checks against the subject being
//! verified and the helper returns `None`; the caller moves on to the next
//! check.

use stackverify_core::{
    field_texts, LiveStateQuery, Node, QueryCommand, QueryOptions, Verifier, VerifyContext,
};

pub const MONITORING_COMPONENTS: [&str; 2] = ["SYSTEM_COMPONENTS", "DEPLOYMENT"];
pub const HUB_AGENT_ROLE: &str = "roles/gkehub.serviceAgent";
pub const HUB_CROSS_PROJECT_ROLE: &str = "roles/gkehub.crossProjectServiceAgent";
pub const CLOUD_ARMOR_POLICY: &str = "eab-cloud-armor";
pub const CLOUD_ARMOR_DESCRIPTION: &str = "EAB Cloud Armor policy";
pub const NODE_POOL: &str = "node-pool-1";

pub fn command(text: &str) -> QueryCommand {
    QueryCommand::parse(text)
}

/// Query with default options, recording a failure against `subject`.
pub async fn fetch(
    ctx: &VerifyContext,
    checks: &mut Verifier,
    subject: &str,
    command: QueryCommand,
) -> Option<Node> {
    fetch_with(ctx, checks, subject, command, QueryOptions::default()).await
}

pub async fn fetch_with(
    ctx: &VerifyContext,
    checks: &mut Verifier,
    subject: &str,
    command: QueryCommand,
    options: QueryOptions,
) -> Option<Node> {
    match ctx.query.query(&command, &options).await {
        Ok(node) => Some(node),
        Err(err) => {
            checks.record_error(subject, &err);
            None
        }
    }
}

/// `lifecycleState` is ACTIVE and every API in `apis` is enabled.
pub async fn project_active_with_apis(
    ctx: &VerifyContext,
    checks: &mut Verifier,
    project: &str,
    apis: &[&str],
) {
    let subject = format!("project {project}");
    if let Some(prj) = fetch(ctx, checks, &subject, command("projects describe").arg(project)).await {
        checks.equal(
            &subject,
            "ACTIVE",
            prj.get("lifecycleState").text(),
            format!("project {project} should be ACTIVE"),
        );
    }
    let services = command("services list --project").arg(project);
    if let Some(enabled) = fetch(ctx, checks, &subject, services).await {
        let enabled = field_texts(&enabled.items(), "config.name");
        checks.subset(&subject, apis, &enabled, "APIs should have been enabled");
    }
}

/// Roles `member` holds on `project`, from the flattened IAM policy.
pub async fn project_roles(
    ctx: &VerifyContext,
    checks: &mut Verifier,
    subject: &str,
    project: &str,
    member: &str,
) -> Option<Vec<String>> {
    let options = QueryOptions::bindings(format!("bindings.members:'{member}'"));
    let policy = fetch_with(
        ctx,
        checks,
        subject,
        command("projects get-iam-policy").arg(project),
        options,
    )
    .await?;
    Some(field_texts(&policy.items(), "bindings.role"))
}

/// Members of the first binding matching `filter` in a flattened policy.
pub async fn binding_members(
    ctx: &VerifyContext,
    checks: &mut Verifier,
    subject: &str,
    policy_command: QueryCommand,
    filter: &str,
) -> Option<Vec<String>> {
    let policy = fetch_with(
        ctx,
        checks,
        subject,
        policy_command,
        QueryOptions::bindings(filter),
    )
    .await?;
    Some(
        policy
            .items()
            .first()
            .map(|binding| binding.texts("bindings.members"))
            .unwrap_or_default(),
    )
}

/// Hub service agent of `project` holds the service agent role, plus the
/// cross-project role when the fleet lives elsewhere.
pub async fn hub_agent_roles(
    ctx: &VerifyContext,
    checks: &mut Verifier,
    project: &str,
    cross_project: bool,
) {
    let subject = format!("project {project}");
    let Some(prj) = fetch(ctx, checks, &subject, command("projects describe").arg(project)).await
    else {
        return;
    };
    let number = prj.get("projectNumber").text();
    let agent = format!("service-{number}@gcp-sa-gkehub.iam.gserviceaccount.com");
    let mut expected = vec![HUB_AGENT_ROLE];
    if cross_project {
        expected.push(HUB_CROSS_PROJECT_ROLE);
    }
    let agent_subject = format!("service account {agent}");
    let member = format!("serviceAccount:{agent}");
    if let Some(roles) = project_roles(ctx, checks, &agent_subject, project, &member).await {
        checks.subset(
            &agent_subject,
            &expected,
            &roles,
            format!("service account {agent} should have project level roles"),
        );
    }
}

pub async fn cloud_armor(ctx: &VerifyContext, checks: &mut Verifier, project: &str) {
    let subject = format!("security policy {CLOUD_ARMOR_POLICY}");
    let describe = command("compute security-policies describe")
        .arg(CLOUD_ARMOR_POLICY)
        .arg("--project")
        .arg(project);
    if let Some(policy) = fetch(ctx, checks, &subject, describe).await {
        let description = policy.items().first().map(|p| p.get("description").text());
        checks.equal(
            &subject,
            Some(CLOUD_ARMOR_DESCRIPTION.to_string()),
            description,
            format!("Cloud Armor description should be {CLOUD_ARMOR_DESCRIPTION}"),
        );
    }
}

/// The `first` node pool: surge upgrades with max surge 1, balanced
/// autoscaling, autoscaling on.
pub fn standard_node_pool(checks: &mut Verifier, subject: &str, pool: &Node) {
    checks.equal(subject, NODE_POOL, pool.get("name").text(), "NodePool name should be node-pool-1");
    surge_and_autoscaling(checks, subject, pool);
}

/// Settings every managed node pool shares.
pub fn surge_and_autoscaling(checks: &mut Verifier, subject: &str, pool: &Node) {
    checks.equal(
        subject,
        "SURGE",
        pool.get("upgradeSettings.strategy").text(),
        "NodePool strategy should be SURGE",
    );
    checks.equal(
        subject,
        "1",
        pool.get("upgradeSettings.maxSurge").text(),
        "NodePool max surge should be 1",
    );
    checks.equal(
        subject,
        "BALANCED",
        pool.get("autoscaling.locationPolicy").text(),
        "NodePool autoscaling location policy should be BALANCED",
    );
    checks.is_true(
        subject,
        pool.get("autoscaling.enabled").as_bool(),
        "NodePool autoscaling should be enabled",
    );
}

/// Fleet, monitoring and workload identity settings of a cluster and its
/// fleet membership.
pub fn cluster_fleet_settings(
    checks: &mut Verifier,
    subject: &str,
    cluster: &Node,
    membership: &Node,
    project: &str,
    check_components: bool,
) {
    checks.equal(
        subject,
        project,
        cluster.get("fleet.project").text(),
        format!("fleet project should be {project}"),
    );
    if check_components {
        let components = cluster.texts("monitoringConfig.componentConfig.enableComponents");
        checks.equal(
            subject,
            MONITORING_COMPONENTS.map(String::from).to_vec(),
            components,
            "monitoring components should be SYSTEM_COMPONENTS and DEPLOYMENT",
        );
    }
    checks.is_true(
        subject,
        cluster.get("monitoringConfig.managedPrometheusConfig.enabled").as_bool(),
        "managed Prometheus should be enabled",
    );
    let pool = format!("{project}.svc.id.goog");
    checks.equal(
        subject,
        pool.as_str(),
        cluster.get("workloadIdentityConfig.workloadPool").text(),
        format!("cluster workload pool should be {pool}"),
    );
    checks.equal(
        subject,
        pool.as_str(),
        membership.get("authority.workloadIdentityPool").text(),
        format!("membership workload identity pool should be {pool}"),
    );
}

/// Segment following `/<key>/` in a resource path, e.g. the location in
/// `projects/p/locations/us-central1/clusters/c`.
pub fn path_segment<'a>(resource: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("/{key}/");
    let start = resource.find(&marker)? + marker.len();
    let rest = &resource[start..];
    let segment = rest.split('/').next().unwrap_or_default();
    (!segment.is_empty()).then_some(segment)
}

/// Last `/`-separated part of a resource name.
pub fn last_segment(resource: &str) -> &str {
    resource.rsplit('/').next().unwrap_or(resource)
}

//! Multitenant suite: one unit per environment.
//!
//! Each environment stack is applied with retry against the bootstrap
//! backend, then its cluster project, clusters, databases, application
//! service account and ingress resources are checked against live state.

use std::collections::BTreeMap;
use std::sync::Arc;

use stackverify_core::{fan_out, QueryCommand, UnitBody, Verifier, VerifyContext, VerifyResult};

use crate::bootstrap;
use crate::checks::{self, command, fetch, path_segment};

pub const SUITE: &str = "multitenant";

pub const CLUSTER_PROJECT_APIS: [&str; 15] = [
    "cloudresourcemanager.googleapis.com",
    "compute.googleapis.com",
    "iam.googleapis.com",
    "serviceusage.googleapis.com",
    "container.googleapis.com",
    "gkehub.googleapis.com",
    "anthos.googleapis.com",
    "compute.googleapis.com",
    "mesh.googleapis.com",
    "multiclusteringress.googleapis.com",
    "multiclusterservicediscovery.googleapis.com",
    "sqladmin.googleapis.com",
    "trafficdirector.googleapis.com",
    "anthosconfigmanagement.googleapis.com",
    "sourcerepo.googleapis.com",
];

pub const APP_SERVICE_ACCOUNT: &str = "bank-of-anthos";
pub const APP_SA_ROLES: [&str; 2] = ["roles/cloudsql.client", "roles/cloudsql.instanceUser"];
const WORKLOAD_IDENTITY_USER_FILTER: &str = "bindings.role:'roles/iam.workloadIdentityUser'";

const CERTIFICATE: &str = "mcg-cert";
const CERTIFICATE_MAP: &str = "mcg-cert-map";
const CERTIFICATE_MAP_DESCRIPTION: &str = "gateway certificate map";
const CERTIFICATE_MAP_ENTRY: &str = "mcg-cert-map-entry";
const FRONTEND_ADDRESS: &str = "frontend-ip";

/// Fan out over every configured environment.
pub async fn run(ctx: &VerifyContext) -> VerifyResult<UnitBody> {
    let backend = Arc::new(bootstrap::backend_config(ctx).await?);
    let shared = ctx.clone();
    let envs = ctx.config.env_names.clone();
    let children = fan_out(SUITE, envs.into_iter().map(|env| (env.clone(), env)), move |env| {
        let ctx = shared.clone();
        let backend = Arc::clone(&backend);
        async move { verify_environment(&ctx, &env, &backend).await }
    })
    .await;

    let mut body = UnitBody::new();
    body.add_children(children);
    Ok(body)
}

async fn verify_environment(
    ctx: &VerifyContext,
    env: &str,
    backend: &BTreeMap<String, String>,
) -> VerifyResult<UnitBody> {
    let definition = bootstrap::multitenant_definition(ctx, env, backend);
    let mut stack = ctx.handle(definition)?;
    stack.apply().await?;

    let project = stack.string_output("cluster_project_id")?;
    let regions = stack.list_output("cluster_regions")?;
    let cluster_ids = stack.list_output("clusters_ids")?;

    let mut checks = Verifier::new();
    checks::project_active_with_apis(ctx, &mut checks, &project, &CLUSTER_PROJECT_APIS).await;
    for id in &cluster_ids {
        verify_cluster(ctx, &mut checks, &project, id).await;
    }
    for region in &regions {
        verify_database(ctx, &mut checks, &project, region, env).await;
    }
    verify_app_service_account(ctx, &mut checks, &project, env).await;
    checks::hub_agent_roles(ctx, &mut checks, &project, false).await;
    verify_ingress(ctx, &mut checks, &project).await;
    checks::cloud_armor(ctx, &mut checks, &project).await;
    verify_frontend_address(ctx, &mut checks, &project).await;

    Ok(UnitBody::with_checks(checks))
}

async fn verify_cluster(ctx: &VerifyContext, checks: &mut Verifier, project: &str, id: &str) {
    let subject = format!("cluster {id}");
    let Some(location) = path_segment(id, "locations") else {
        checks.is_true(&subject, false, "cluster id should name its location");
        return;
    };
    let describe = command("container clusters describe")
        .arg(id)
        .arg("--location")
        .arg(location)
        .arg("--project")
        .arg(project);
    let Some(cluster) = fetch(ctx, checks, &subject, describe).await else {
        return;
    };
    let membership = command("container fleet memberships describe")
        .arg(cluster.get("name").text())
        .arg("--location")
        .arg(location)
        .arg("--project")
        .arg(project);
    let Some(membership) = fetch(ctx, checks, &subject, membership).await else {
        return;
    };

    checks::standard_node_pool(checks, &subject, &cluster.get("nodePools.0"));
    checks::cluster_fleet_settings(checks, &subject, &cluster, &membership, project, true);
}

async fn verify_database(
    ctx: &VerifyContext,
    checks: &mut Verifier,
    project: &str,
    region: &str,
    env: &str,
) {
    let name = format!("db-{region}-{env}");
    let subject = format!("sql instance {name}");
    let describe = command("sql instances describe").arg(&name).arg("--project").arg(project);
    let Some(db) = fetch(ctx, checks, &subject, describe).await else {
        return;
    };
    checks.equal(
        &subject,
        "POSTGRES_14",
        db.get("databaseVersion").text(),
        "database version should be POSTGRES_14",
    );
    checks.equal(
        &subject,
        "db-custom-1-3840",
        db.get("settings.tier").text(),
        "tier should be db-custom-1-3840",
    );
    checks.equal(
        &subject,
        "REGIONAL",
        db.get("settings.availabilityType").text(),
        "availability type should be REGIONAL",
    );
}

/// Workload identity members the application service account must grant.
pub fn workload_identity_users(project: &str, env: &str) -> Vec<String> {
    ["accounts", "ledger"]
        .iter()
        .map(|ns| format!("serviceAccount:{project}.svc.id.goog[{ns}-{env}/{APP_SERVICE_ACCOUNT}]"))
        .collect()
}

async fn verify_app_service_account(
    ctx: &VerifyContext,
    checks: &mut Verifier,
    project: &str,
    env: &str,
) {
    let email = format!("{APP_SERVICE_ACCOUNT}@{project}.iam.gserviceaccount.com");
    let subject = format!("service account {email}");

    let describe = command("iam service-accounts describe")
        .arg(&email)
        .arg("--project")
        .arg(project);
    if let Some(sa) = fetch(ctx, checks, &subject, describe).await {
        checks.is_false(&subject, sa.get("disabled").as_bool(), "service account should not be disabled");
    }

    let member = format!("serviceAccount:{email}");
    if let Some(roles) = checks::project_roles(ctx, checks, &subject, project, &member).await {
        checks.subset(
            &subject,
            &APP_SA_ROLES,
            &roles,
            format!("service account {email} should have project level roles"),
        );
    }

    let expected = workload_identity_users(project, env);
    let policy = QueryCommand::parse("iam service-accounts get-iam-policy").arg(&email);
    if let Some(members) =
        checks::binding_members(ctx, checks, &subject, policy, WORKLOAD_IDENTITY_USER_FILTER).await
    {
        checks.subset(
            &subject,
            &expected,
            &members,
            format!("service account {email} should have workload identity users"),
        );
        checks.count(
            &subject,
            expected.len(),
            &members,
            format!("service account {email} should have {} workload identity users", expected.len()),
        );
    }
}

async fn verify_ingress(ctx: &VerifyContext, checks: &mut Verifier, project: &str) {
    let endpoint = format!("frontend.endpoints.{project}.cloud.goog");

    let subject = format!("endpoint {endpoint}");
    let describe = command("endpoints services describe").arg(&endpoint).arg("--project").arg(project);
    if let Some(service) = fetch(ctx, checks, &subject, describe).await {
        checks.equal(
            &subject,
            project,
            service.get("producerProjectId").text(),
            format!("producer project should be {project}"),
        );
    }

    let subject = format!("certificate {CERTIFICATE}");
    let describe = command("certificate-manager certificates describe")
        .arg(CERTIFICATE)
        .arg("--project")
        .arg(project);
    if let Some(cert) = fetch(ctx, checks, &subject, describe).await {
        checks.subset(
            &subject,
            &[endpoint.as_str()],
            &cert.texts("managed.domains"),
            format!("managed domains should contain {endpoint}"),
        );
    }

    let subject = format!("certificate map {CERTIFICATE_MAP}");
    let describe = command("certificate-manager maps describe")
        .arg(CERTIFICATE_MAP)
        .arg("--project")
        .arg(project);
    if let Some(map) = fetch(ctx, checks, &subject, describe).await {
        checks.equal(
            &subject,
            CERTIFICATE_MAP_DESCRIPTION,
            map.get("description").text(),
            format!("certificate map description should be '{CERTIFICATE_MAP_DESCRIPTION}'"),
        );
    }

    let subject = format!("certificate map entry {CERTIFICATE_MAP_ENTRY}");
    let describe = command("certificate-manager maps entries describe")
        .arg(CERTIFICATE_MAP_ENTRY)
        .arg("--map")
        .arg(CERTIFICATE_MAP)
        .arg("--project")
        .arg(project);
    if let Some(entry) = fetch(ctx, checks, &subject, describe).await {
        checks.equal(
            &subject,
            endpoint.as_str(),
            entry.get("hostname").text(),
            format!("certificate map entry hostname should be {endpoint}"),
        );
    }
}

async fn verify_frontend_address(ctx: &VerifyContext, checks: &mut Verifier, project: &str) {
    let subject = format!("address {FRONTEND_ADDRESS}");
    let describe = command("compute addresses describe")
        .arg(FRONTEND_ADDRESS)
        .arg("--project")
        .arg(project)
        .arg("--global");
    if let Some(address) = fetch(ctx, checks, &subject, describe).await {
        checks.equal(
            &subject,
            "EXTERNAL",
            address.get("addressType").text(),
            "external IP type should be EXTERNAL",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_identity_users() {
        assert_eq!(
            workload_identity_users("eab-gke-dev", "development"),
            vec![
                "serviceAccount:eab-gke-dev.svc.id.goog[accounts-development/bank-of-anthos]",
                "serviceAccount:eab-gke-dev.svc.id.goog[ledger-development/bank-of-anthos]",
            ]
        );
    }

    #[test]
    fn test_required_apis_cover_sql_and_fleet() {
        for api in ["sqladmin.googleapis.com", "gkehub.googleapis.com", "mesh.googleapis.com"] {
            assert!(CLUSTER_PROJECT_APIS.contains(&api), "{api}");
        }
    }
}

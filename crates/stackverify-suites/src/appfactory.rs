//! App factory suite: one unit per application group.
//!
//! Each unit applies the group's stack, then fans out twice: once per
//! application folder (cluster identities may pull images from it) and once
//! per `app.service` entry of the `app-group` output (admin project, infra
//! repository, build workspace and environment projects).

use std::collections::BTreeMap;
use std::sync::Arc;

use stackverify_core::{
    fan_out, FactAggregator, FactTable, Facts, KeyShape, Node, QueryCommand, UnitBody, Verifier,
    VerifyContext, VerifyError, VerifyResult,
};

use crate::bootstrap;
use crate::checks::{self, command, fetch, last_segment};

pub const SUITE: &str = "appfactory";

/// Multitenant output listing each environment's cluster service accounts.
pub const CLUSTER_SA_OUTPUT: &str = "cluster_service_accounts";
pub const READER_ROLE: &str = "roles/artifactregistry.reader";

pub const ADMIN_PROJECT_APIS: [&str; 9] = [
    "iam.googleapis.com",
    "cloudresourcemanager.googleapis.com",
    "cloudbuild.googleapis.com",
    "secretmanager.googleapis.com",
    "serviceusage.googleapis.com",
    "cloudbilling.googleapis.com",
    "cloudfunctions.googleapis.com",
    "apikeys.googleapis.com",
    "sourcerepo.googleapis.com",
];

pub const ENV_PROJECT_APIS: [&str; 4] = [
    "iam.googleapis.com",
    "cloudresourcemanager.googleapis.com",
    "serviceusage.googleapis.com",
    "cloudbilling.googleapis.com",
];

/// Workspace buckets: (`app-group` fact, bucket name suffix).
const WORKSPACE_BUCKETS: [(&str, &str); 3] = [
    ("app_cloudbuild_workspace_state_bucket_name", "state"),
    ("app_cloudbuild_workspace_logs_bucket_name", "logs"),
    ("app_cloudbuild_workspace_artifacts_bucket_name", "build"),
];

/// Workspace triggers: (`app-group` fact, build config file).
const WORKSPACE_TRIGGERS: [(&str, &str); 2] = [
    ("app_cloudbuild_workspace_apply_trigger_id", "cloudbuild-tf-apply.yaml"),
    ("app_cloudbuild_workspace_plan_trigger_id", "cloudbuild-tf-plan.yaml"),
];

pub async fn run(ctx: &VerifyContext) -> VerifyResult<UnitBody> {
    let backend = Arc::new(bootstrap::backend_config(ctx).await?);
    let shared = ctx.clone();
    let apps = ctx.config.app_names.clone();
    let children = fan_out(SUITE, apps.into_iter().map(|app| (app.clone(), app)), move |app| {
        let ctx = shared.clone();
        let backend = Arc::clone(&backend);
        async move { verify_app_group(&ctx, &app, &backend).await }
    })
    .await;

    let mut body = UnitBody::new();
    body.add_children(children);
    Ok(body)
}

/// Cluster service accounts of every environment, as IAM members.
///
/// Empty is a fatal error: nothing could be checked against it.
pub async fn cluster_service_accounts(
    ctx: &VerifyContext,
    backend: &BTreeMap<String, String>,
) -> VerifyResult<Vec<String>> {
    let envs = &ctx.config.env_names;
    let source = Arc::new(bootstrap::multitenant_stacks(ctx, backend));
    let table = FactAggregator::new(source)
        .aggregate(envs, &[CLUSTER_SA_OUTPUT])
        .await?;

    let members: Vec<String> = table
        .collect(CLUSTER_SA_OUTPUT)
        .iter()
        .map(|sa| format!("serviceAccount:{}", sa.text()))
        .collect();
    if members.is_empty() {
        return Err(VerifyError::Cardinality {
            what: "cluster service accounts".to_string(),
            expected: "at least 1".to_string(),
            found: 0,
        });
    }
    Ok(members)
}

async fn verify_app_group(
    ctx: &VerifyContext,
    app: &str,
    backend: &BTreeMap<String, String>,
) -> VerifyResult<UnitBody> {
    let state_bucket = backend.get("bucket").cloned().unwrap_or_default();
    let definition = ctx
        .definition(&ctx.config.stages.appfactory_dir(app))
        .backend(backend)
        .var("remote_state_bucket", state_bucket)
        .var("bucket_force_destroy", "true");
    let mut stack = ctx.handle(definition)?;
    stack.apply().await?;

    let members = Arc::new(cluster_service_accounts(ctx, backend).await?);
    let folders: Vec<String> = stack
        .json_output("app-folders-ids")?
        .entries()
        .values()
        .map(Node::text)
        .collect();
    let groups = FactTable::from_object(&stack.json_output("app-group")?, KeyShape::Dotted(2))?;

    let parent = format!("{SUITE}/{app}");
    let mut body = UnitBody::new();

    let shared = ctx.clone();
    let folder_units = folders
        .into_iter()
        .map(|folder| (format!("folder {folder}"), folder));
    body.add_children(
        fan_out(&parent, folder_units, move |folder| {
            let ctx = shared.clone();
            let members = Arc::clone(&members);
            async move { verify_folder_reader(&ctx, &folder, &members).await }
        })
        .await,
    );

    let shared = ctx.clone();
    let service_units: Vec<(String, (String, Facts))> = groups
        .iter()
        .map(|(key, facts)| (key.to_string(), (key.to_string(), facts.clone())))
        .collect();
    body.add_children(
        fan_out(&parent, service_units, move |(key, facts)| {
            let ctx = shared.clone();
            async move { verify_app_service(&ctx, &key, &facts).await }
        })
        .await,
    );

    Ok(body)
}

/// Every cluster identity is a member of the folder's reader bindings.
///
/// Members are pooled across all bindings carrying the reader role, and a
/// folder with no such binding fails once per identity.
pub async fn verify_folder_reader(
    ctx: &VerifyContext,
    folder: &str,
    members: &[String],
) -> VerifyResult<UnitBody> {
    let subject = format!("folder {folder}");
    let mut checks = Verifier::new();
    let policy = command("resource-manager folders get-iam-policy").arg(folder);
    if let Some(policy) = fetch(ctx, &mut checks, &subject, policy).await {
        let readers: Vec<String> = policy
            .get("bindings")
            .items()
            .iter()
            .filter(|binding| binding.get("role").text() == READER_ROLE)
            .flat_map(|binding| binding.texts("members"))
            .collect();
        for member in members {
            checks.contains(
                &subject,
                &readers,
                member,
                format!("the cluster service account {member} must exist in the folder {folder} {READER_ROLE} iam policy"),
            );
        }
    }
    Ok(UnitBody::with_checks(checks))
}

async fn verify_app_service(ctx: &VerifyContext, key: &str, facts: &Facts) -> VerifyResult<UnitBody> {
    let fact = |name: &str| facts.get(name).cloned().unwrap_or_default();
    let service = key.split_once('.').map(|(_, service)| service).unwrap_or(key);
    let admin = fact("app_admin_project_id").text();
    if admin.is_empty() {
        return Err(VerifyError::Fatal(format!("{key}: app_admin_project_id is empty")));
    }

    let mut checks = Verifier::new();
    checks::project_active_with_apis(ctx, &mut checks, &admin, &ADMIN_PROJECT_APIS).await;

    let repo = fact("app_infra_repository_name").text();
    let repo_subject = format!("source repo {repo}");
    let repo_url = format!("https://source.developers.google.com/p/{admin}/r/{repo}");
    let describe = command("source repos describe").arg(&repo).arg("--project").arg(&admin);
    if let Some(found) = fetch(ctx, &mut checks, &repo_subject, describe).await {
        checks.equal(
            &repo_subject,
            repo_url.as_str(),
            found.get("url").text(),
            format!("source repo {repo} should have url {repo_url}"),
        );
    }

    let repo_sa = format!("serviceAccount:tf-cb-{repo}@{admin}.iam.gserviceaccount.com");
    let policy = QueryCommand::parse("source repos get-iam-policy")
        .arg(&repo)
        .arg("--project")
        .arg(&admin);
    if let Some(viewers) =
        checks::binding_members(ctx, &mut checks, &repo_subject, policy, "bindings.role:roles/viewer").await
    {
        checks.contains(
            &repo_subject,
            &viewers,
            &repo_sa,
            format!("service account {repo_sa} should have role roles/viewer on repo {repo}"),
        );
    }

    for (output, suffix) in WORKSPACE_BUCKETS {
        let bucket = format!("bkt-{admin}-{service}-{suffix}");
        let subject = format!("bucket {bucket}");
        let ls = command("storage ls --buckets")
            .arg(format!("gs://{bucket}"))
            .arg("--project")
            .arg(&admin)
            .arg("--json");
        if let Some(listing) = fetch(ctx, &mut checks, &subject, ls).await {
            let self_link = fact(output).text();
            let found = listing.items().first().map(|b| b.get("metadata.selfLink").text());
            checks.equal(
                &subject,
                Some(self_link.clone()),
                found,
                format!("the bucket self link should be {self_link}"),
            );
        }
    }

    for (output, file) in WORKSPACE_TRIGGERS {
        let trigger_name = fact(output).text();
        let trigger = last_segment(&trigger_name);
        let subject = format!("build trigger {trigger}");
        let describe = command("builds triggers describe")
            .arg(trigger)
            .arg("--project")
            .arg(&admin)
            .arg("--region")
            .arg("global");
        if let Some(found) = fetch(ctx, &mut checks, &subject, describe).await {
            checks.equal(
                &subject,
                file,
                found.get("filename").text(),
                format!("the filename for the trigger should be {file}"),
            );
            checks.equal(
                &subject,
                repo.as_str(),
                found.get("triggerTemplate.repoName").text(),
                format!("the trigger should use the repo {repo}"),
            );
        }
    }

    let env_projects = fact("app_env_project_ids");
    for env in &ctx.config.env_names {
        let project = env_projects.get(env).text();
        checks::project_active_with_apis(ctx, &mut checks, &project, &ENV_PROJECT_APIS).await;

        let subject = format!("project {project}");
        let policy = QueryCommand::parse("projects get-iam-policy").arg(&project);
        if let Some(owners) =
            checks::binding_members(ctx, &mut checks, &subject, policy, "bindings.role:roles/owner").await
        {
            checks.contains(
                &subject,
                &owners,
                &repo_sa,
                format!("service account {repo_sa} should have role roles/owner on project {project}"),
            );
        }
    }

    Ok(UnitBody::with_checks(checks))
}

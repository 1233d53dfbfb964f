//! App source suite: deliver the sample application end to end.
//!
//! The app source stack is applied with the admin project and the fleet
//! memberships of every environment, application source is pushed to the
//! service repository, and the resulting build and rollouts are polled to a
//! terminal state.

use std::sync::Arc;

use serde_json::{Map, Value};
use stackverify_core::{
    fan_out, query_list, run_unit, AsyncOperation, CommitId, FactAggregator, LogDiagnostics,
    PushRequest, QueryCommand, QueryOptions, StateVocabulary, UnitBody, VerifyContext,
    VerifyError, VerifyResult,
};

use crate::bootstrap;

pub const SUITE: &str = "appsource";
pub const MEMBERSHIP_OUTPUT: &str = "cluster_membership_ids";

/// Fleet membership ids per environment, shaped as the stack variable
/// `env_cluster_membership_ids` expects:
/// `{ "<env>": { "cluster_membership_ids": [..] } }`.
pub async fn membership_ids_by_env(ctx: &VerifyContext) -> VerifyResult<Value> {
    let envs = &ctx.config.env_names;
    let backend = bootstrap::backend_config(ctx).await?;
    let source = Arc::new(bootstrap::multitenant_stacks(ctx, &backend));
    let table = FactAggregator::new(source)
        .aggregate(envs, &[MEMBERSHIP_OUTPUT])
        .await?;

    let mut by_env = Map::new();
    for (env, facts) in table.iter() {
        let ids = facts
            .get(MEMBERSHIP_OUTPUT)
            .map(|ids| ids.to_value())
            .unwrap_or(Value::Array(Vec::new()));
        let mut entry = Map::new();
        entry.insert(MEMBERSHIP_OUTPUT.to_string(), ids);
        by_env.insert(env.to_string(), Value::Object(entry));
    }
    Ok(Value::Object(by_env))
}

/// Admin project of the configured `app.service`, from the shared app
/// factory stack.
pub async fn admin_project(ctx: &VerifyContext) -> VerifyResult<String> {
    let cfg = &ctx.config.appsource;
    let shared = ctx.attach(&ctx.config.stages.appfactory_shared).await?;
    let path = format!("{}\\.{}.app_admin_project_id", cfg.app, cfg.service);
    let project = shared.json_output("app-group")?.get(&path).text();
    if project.is_empty() {
        return Err(VerifyError::Fatal(format!(
            "app-group has no admin project for {}.{}",
            cfg.app, cfg.service
        )));
    }
    Ok(project)
}

pub fn push_request(ctx: &VerifyContext, project: &str) -> PushRequest {
    let cfg = &ctx.config.appsource;
    PushRequest {
        upstream_url: cfg.upstream_url.clone(),
        upstream_ref: cfg.upstream_ref.clone(),
        target_url: format!(
            "https://source.developers.google.com/p/{project}/r/eab-{}-{}",
            cfg.app, cfg.service
        ),
        remote_name: cfg.remote_name.clone(),
        content_dir: ctx.config.stage_path(&ctx.config.stages.appsource_dir(&cfg.app)),
        commit_message: cfg.commit_message.clone(),
        author_email: cfg.author_email.clone(),
        author_name: cfg.author_name.clone(),
        credential_helper: Some((cfg.credential_url.clone(), cfg.credential_helper.clone())),
        post_buffer: cfg.post_buffer,
    }
}

pub async fn run(ctx: &VerifyContext) -> VerifyResult<UnitBody> {
    let memberships = membership_ids_by_env(ctx).await?;
    let project = admin_project(ctx).await?;
    let cfg = &ctx.config.appsource;

    let definition = ctx
        .definition(&ctx.config.stages.appsource_dir(&cfg.app))
        .var("project_id", project.clone())
        .var("region", cfg.region.clone())
        .var("env_cluster_membership_ids", memberships)
        .var("buckets_force_destroy", "true");
    let mut stack = ctx.handle(definition)?;
    if let Err(err) = stack.apply().await {
        if ctx.config.teardown {
            stack.teardown().await;
        }
        return Err(err.into());
    }

    let delivery = run_unit("deliver", deliver(ctx, &project)).await;
    if ctx.config.teardown {
        stack.teardown().await;
    }

    let mut body = UnitBody::new();
    body.add_children(vec![delivery]);
    Ok(body)
}

/// Where a release lives in the delivery pipeline.
#[derive(Debug, Clone)]
struct Release {
    project: String,
    pipeline: String,
    region: String,
    name: String,
}

async fn deliver(ctx: &VerifyContext, project: &str) -> VerifyResult<UnitBody> {
    let cfg = &ctx.config.appsource;
    let commit = ctx.pusher.push(&push_request(ctx, project)).await?;

    let build = AsyncOperation::new(
        format!("build {}", commit.short()),
        QueryCommand::parse("builds list")
            .arg(format!("--region={}", cfg.region))
            .arg("--project")
            .arg(project),
        "status",
        StateVocabulary::build(),
    )
    .with_options(QueryOptions::default().filter(format!("substitutions.COMMIT_SHA='{commit}'")));
    let built = ctx.poller().poll(&build, ctx.config.poll.build.settings(), None).await?;
    tracing::info!(build = %build.name, state = %built.state, attempts = built.attempts, "build finished");

    let release = Arc::new(find_release(ctx, project, &commit).await?);
    let targets: Vec<(String, String)> = cfg
        .rollout_envs
        .iter()
        .map(|env| {
            let target = format!("{}-{env}", cfg.region);
            (format!("rollout {target}"), target)
        })
        .collect();
    let shared = ctx.clone();
    let rollouts = fan_out("appsource/deliver", targets, move |target| {
        let ctx = shared.clone();
        let release = Arc::clone(&release);
        async move { await_rollout(&ctx, &release, &target).await }
    })
    .await;

    let mut body = UnitBody::new();
    body.add_children(rollouts);
    Ok(body)
}

/// Release created for `commit`, matched on the commit's short prefix.
async fn find_release(ctx: &VerifyContext, project: &str, commit: &CommitId) -> VerifyResult<Release> {
    let cfg = &ctx.config.appsource;
    let command = QueryCommand::parse("deploy releases list")
        .arg(format!("--project={project}"))
        .arg(format!("--delivery-pipeline={}", cfg.service))
        .arg(format!("--region={}", cfg.region));
    let options = QueryOptions::default().filter(format!("name:{}", commit.short()));
    let releases = query_list(ctx.query.as_ref(), &command, &options).await?;
    let Some(latest) = releases.first() else {
        return Err(VerifyError::Cardinality {
            what: format!("releases for commit {}", commit.short()),
            expected: "at least 1".to_string(),
            found: 0,
        });
    };
    Ok(Release {
        project: project.to_string(),
        pipeline: cfg.service.clone(),
        region: cfg.region.clone(),
        name: latest.get("name").text(),
    })
}

async fn await_rollout(ctx: &VerifyContext, release: &Release, target: &str) -> VerifyResult<UnitBody> {
    let rollout = AsyncOperation::new(
        format!("rollout of {} to {target}", release.name),
        QueryCommand::parse("deploy rollouts list")
            .arg(format!("--project={}", release.project))
            .arg(format!("--delivery-pipeline={}", release.pipeline))
            .arg(format!("--region={}", release.region))
            .arg(format!("--release={}", release.name)),
        "state",
        StateVocabulary::rollout(),
    )
    .with_options(QueryOptions::default().filter(format!("targetId={target}")));
    let logs = LogDiagnostics::for_project(Arc::clone(&ctx.query), &release.project);

    let outcome = ctx
        .poller()
        .poll(&rollout, ctx.config.poll.rollout.settings(), Some(&logs))
        .await?;
    tracing::info!(rollout = %rollout.name, state = %outcome.state, attempts = outcome.attempts, "rollout finished");
    Ok(UnitBody::new())
}

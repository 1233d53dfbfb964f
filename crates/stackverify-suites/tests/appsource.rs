//! App source suite: push, build polling and rollout polling.

mod common;

use std::time::Duration;

use serde_json::json;
use stackverify_core::fakes::RecordingPusher;
use stackverify_core::{Node, OutputValue, UnitReport};
use stackverify_suites::{run_suite, Suite};

use common::{config, Harness};

const ADMIN: &str = "eab-admin-cymbalshop";
const COMMIT: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b";
const RELEASE: &str =
    "projects/eab-admin-cymbalshop/locations/us-central1/deliveryPipelines/cymbalshop/releases/cymbalshop-9f86d08";
const APPSOURCE_STACK: &str = "examples/cymbal-shop/6-appsource/cymbal-shop";

fn builds_prefix() -> String {
    format!("builds list --region=us-central1 --project {ADMIN} --filter substitutions.COMMIT_SHA='{COMMIT}'")
}

fn rollouts_prefix() -> String {
    format!("deploy rollouts list --project={ADMIN} --delivery-pipeline=cymbalshop --region=us-central1 --release={RELEASE} --filter targetId=us-central1-development")
}

fn harness(envs: &[&str], teardown: bool) -> Harness {
    let mut cfg = config(envs);
    cfg.teardown = teardown;
    let h = Harness::new(cfg);
    for env in envs {
        common::seed_multitenant_env(&h.provisioner, env);
    }
    h.provisioner.set_outputs(
        "4-appfactory/envs/shared",
        [(
            "app-group",
            OutputValue::from(json!({
                "cymbal-shop.cymbalshop": { "app_admin_project_id": ADMIN }
            })),
        )],
    );
    h.query.respond(
        &format!("logging read --project={ADMIN}"),
        json!([{ "textPayload": "deploy: skaffold apply failed" }, { "jsonPayload": {} }]),
    );
    h
}

fn script_builds(h: &Harness, statuses: &[&str]) {
    let polls = statuses.iter().map(|status| match *status {
        "" => Node::from(json!([])),
        status => Node::from(json!([{ "status": status }])),
    });
    h.query.sequence(&builds_prefix(), polls);
}

fn script_release(h: &Harness, releases: serde_json::Value) {
    h.query.respond(
        &format!("deploy releases list --project={ADMIN} --delivery-pipeline=cymbalshop --region=us-central1 --filter name:9f86d08"),
        releases,
    );
}

fn deliver(report: &UnitReport) -> &UnitReport {
    report.child("deliver").expect("deliver unit")
}

#[tokio::test(start_paused = true)]
async fn push_build_and_rollout_succeed() {
    let h = harness(&["development", "production"], false);
    script_builds(&h, &["", "WORKING", "SUCCESS"]);
    script_release(&h, json!([{ "name": RELEASE }]));
    h.query.sequence(
        &rollouts_prefix(),
        [
            Node::from(json!([{ "state": "PENDING_RELEASE" }])),
            Node::from(json!([{ "state": "SUCCEEDED" }])),
        ],
    );

    let started = tokio::time::Instant::now();
    let report = run_suite(&h.ctx, Suite::Appsource).await;
    assert!(report.passed(), "{:#?}", report.findings());
    // Two build sleeps of 30s and one rollout sleep of 60s.
    assert_eq!(started.elapsed(), Duration::from_secs(120));
    assert_eq!(h.query.calls("builds list"), 3);
    assert_eq!(h.query.calls("deploy rollouts list"), 2);
    assert_eq!(h.query.calls("logging read"), 0);

    let requests = h.pusher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].target_url,
        format!("https://source.developers.google.com/p/{ADMIN}/r/eab-cymbal-shop-cymbalshop")
    );
    assert!(requests[0].content_dir.ends_with(APPSOURCE_STACK));

    let applied = h.provisioner.last_definition(APPSOURCE_STACK).unwrap();
    assert_eq!(applied.vars["project_id"], json!(ADMIN));
    assert_eq!(
        applied.vars["env_cluster_membership_ids"]["production"]["cluster_membership_ids"],
        json!(["projects/eab-gke-production/locations/global/memberships/cluster-us-central1-production"])
    );
    let env_stack = h
        .provisioner
        .last_definition("2-multitenant/envs/production")
        .unwrap();
    assert_eq!(
        env_stack.backend_config.get("bucket").map(String::as_str),
        Some(common::STATE_BUCKET)
    );
    let rollout = deliver(&report).child("rollout us-central1-development").unwrap();
    assert!(rollout.fatal.is_none());
    assert_eq!(report.check_count(), 0);
    assert_eq!(h.provisioner.teardown_count(APPSOURCE_STACK), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_release_is_fatal() {
    let h = harness(&["development"], false);
    script_builds(&h, &["", "WORKING", "SUCCESS"]);
    script_release(&h, json!([]));

    let report = run_suite(&h.ctx, Suite::Appsource).await;
    let fatal = deliver(&report).fatal.clone().unwrap();
    assert!(fatal.contains("releases for commit 9f86d08"), "{fatal}");
    assert_eq!(h.query.calls("deploy rollouts list"), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_rollout_attaches_logs() {
    let h = harness(&["development"], true);
    script_builds(&h, &["", "WORKING", "SUCCESS"]);
    script_release(&h, json!([{ "name": RELEASE }]));
    h.query.sequence(
        &rollouts_prefix(),
        [
            Node::from(json!([{ "state": "IN_PROGRESS" }])),
            Node::from(json!([{ "state": "FAILED" }])),
        ],
    );

    let report = run_suite(&h.ctx, Suite::Appsource).await;
    let rollout = deliver(&report)
        .child("rollout us-central1-development")
        .unwrap();
    assert!(rollout.fatal.as_deref().unwrap().contains("terminal state FAILED"));
    assert_eq!(h.query.calls("logging read"), 1);
    assert_eq!(h.provisioner.teardown_count(APPSOURCE_STACK), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_build_is_fatal_before_release_lookup() {
    let h = harness(&["development"], false);
    script_builds(&h, &["WORKING", "FAILURE"]);
    script_release(&h, json!([{ "name": RELEASE }]));

    let report = run_suite(&h.ctx, Suite::Appsource).await;
    let delivery = deliver(&report);
    let fatal = delivery.fatal.clone().unwrap();
    assert!(fatal.contains("terminal state FAILURE"), "{fatal}");
    assert_eq!(delivery.check_count(), 0);
    assert!(delivery.children.is_empty());
    assert_eq!(h.query.calls("builds list"), 2);
    assert_eq!(h.query.calls("deploy releases list"), 0);
}

#[tokio::test]
async fn push_failure_skips_polling() {
    let mut cfg = config(&["development"]);
    cfg.app_names = vec!["cymbal-shop".to_string()];
    let h = Harness::with_pusher(cfg, RecordingPusher::failing("remote: Permission denied"));
    common::seed_multitenant_env(&h.provisioner, "development");
    h.provisioner.set_outputs(
        "4-appfactory/envs/shared",
        [(
            "app-group",
            OutputValue::from(json!({ "cymbal-shop.cymbalshop": { "app_admin_project_id": ADMIN } })),
        )],
    );

    let report = run_suite(&h.ctx, Suite::Appsource).await;
    assert!(deliver(&report).fatal.as_deref().unwrap().contains("Permission denied"));
    assert_eq!(h.query.calls("builds list"), 0);
}

#[tokio::test]
async fn missing_admin_project_is_fatal_before_apply() {
    let h = Harness::new(config(&["development"]));
    common::seed_multitenant_env(&h.provisioner, "development");
    h.provisioner.set_outputs(
        "4-appfactory/envs/shared",
        [("app-group", OutputValue::from(json!({ "cymbal-bank.userservice": {} })))],
    );

    let report = run_suite(&h.ctx, Suite::Appsource).await;
    assert!(report.fatal.as_deref().unwrap().contains("no admin project"));
    assert_eq!(h.provisioner.apply_count(APPSOURCE_STACK), 0);
}

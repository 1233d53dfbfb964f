//! Fact aggregation across independently applied stacks.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use stackverify_core::fakes::{MemoryProvisioner, RecordingPusher, ScriptedQuery};
use stackverify_core::{
    AggregateError, FactAggregator, OutputValue, StackError, VerifyConfig, VerifyContext,
};

const ENVS: [&str; 3] = ["development", "non-production", "production"];

fn env_dir(env: &str) -> String {
    format!("2-multitenant/envs/{env}")
}

fn seeded() -> (Arc<MemoryProvisioner>, VerifyContext) {
    let provisioner = Arc::new(MemoryProvisioner::new());
    for (i, env) in ENVS.iter().enumerate() {
        provisioner.set_outputs(
            env_dir(env).as_str(),
            [
                ("cluster_project_id", OutputValue::from(format!("eab-gke-{env}").as_str())),
                (
                    "cluster_service_accounts",
                    OutputValue::from(json!([format!("sa-{i}a@eab.iam.gserviceaccount.com")])),
                ),
            ],
        );
    }
    let ctx = VerifyContext::new(
        VerifyConfig::default(),
        Arc::new(ScriptedQuery::new()),
        provisioner.clone(),
        Arc::new(RecordingPusher::new("0000000")),
    );
    (provisioner, ctx)
}

fn aggregator(ctx: &VerifyContext) -> FactAggregator {
    let definitions: BTreeMap<String, _> = ENVS
        .iter()
        .map(|env| (env.to_string(), ctx.definition(&env_dir(env))))
        .collect();
    FactAggregator::new(Arc::new(ctx.stacks.keyed(definitions)))
}

#[tokio::test]
async fn every_key_yields_exactly_one_entry() {
    let (_, ctx) = seeded();
    let table = aggregator(&ctx)
        .aggregate(&ENVS, &["cluster_project_id", "cluster_service_accounts"])
        .await
        .expect("aggregate");

    assert_eq!(table.len(), ENVS.len());
    table.require_keys(&ENVS).expect("all keys present");
    assert_eq!(
        table.fact("production", "cluster_project_id").text(),
        "eab-gke-production"
    );
    assert_eq!(table.collect("cluster_service_accounts").len(), 3);
}

#[tokio::test]
async fn one_failing_stack_aborts_the_aggregation() {
    let (provisioner, ctx) = seeded();
    provisioner.fail_outputs(env_dir("non-production").as_str(), "state lock held");

    let err = aggregator(&ctx)
        .aggregate(&ENVS, &["cluster_project_id"])
        .await
        .expect_err("must abort");
    match err {
        AggregateError::Stack { key, source } => {
            assert_eq!(key, "non-production");
            assert!(matches!(source, StackError::Attach { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_output_aborts_rather_than_omitting() {
    let (_, ctx) = seeded();
    let err = aggregator(&ctx)
        .aggregate(&ENVS, &["cluster_membership_ids"])
        .await
        .expect_err("must abort");
    assert!(matches!(
        err,
        AggregateError::Stack { source: StackError::OutputNotFound { .. }, .. }
    ));
}

#[tokio::test]
async fn repeated_aggregation_is_idempotent() {
    let (provisioner, ctx) = seeded();
    let outputs = ["cluster_project_id", "cluster_service_accounts"];
    let first = aggregator(&ctx).aggregate(&ENVS, &outputs).await.expect("first");
    let second = aggregator(&ctx).aggregate(&ENVS, &outputs).await.expect("second");
    assert_eq!(first, second);
    // Cached handles: each stack attached once.
    assert_eq!(provisioner.output_reads(env_dir("development").as_str()), 1);

    let (_, fresh) = seeded();
    let third = aggregator(&fresh).aggregate(&ENVS, &outputs).await.expect("third");
    assert_eq!(first, third);
}

#[tokio::test]
async fn duplicate_keys_are_a_cardinality_error() {
    let (_, ctx) = seeded();
    let err = aggregator(&ctx)
        .aggregate(&["development", "development"], &["cluster_project_id"])
        .await
        .expect_err("duplicate");
    assert!(matches!(err, AggregateError::Cardinality { found: 2, .. }));
}

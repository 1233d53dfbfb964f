//! Poller termination and failure-path behaviour.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stackverify_core::fakes::{RecordingDiagnostics, ScriptedQuery};
use stackverify_core::{
    AsyncOperation, LogDiagnostics, Node, PollError, PollSettings, Poller, QueryCommand,
    QueryOptions, StateVocabulary,
};

const ROLLOUTS: &str = "deploy rollouts list --project=eab-admin --delivery-pipeline=cymbalshop";
const LOGS: &str = "logging read --project=eab-admin";

fn state(s: &str) -> Node {
    Node::from(json!([{ "name": "rollout-0001", "state": s }]))
}

fn rollout_op() -> AsyncOperation {
    AsyncOperation::new(
        "rollout us-central1-development",
        QueryCommand::parse(ROLLOUTS),
        "state",
        StateVocabulary::rollout(),
    )
    .with_options(QueryOptions::default().filter("targetId=us-central1-development"))
}

fn script_continue_then_success(query: &ScriptedQuery, k: usize) {
    let mut nodes: Vec<Node> = (0..k).map(|_| state("IN_PROGRESS")).collect();
    nodes.push(state("SUCCEEDED"));
    query.sequence(ROLLOUTS, nodes);
}

#[tokio::test(start_paused = true)]
async fn succeeds_after_exactly_k_plus_one_calls() {
    for k in [0usize, 1, 5] {
        let query = Arc::new(ScriptedQuery::new());
        script_continue_then_success(&query, k);
        let poller = Poller::new(query.clone());

        let outcome = poller
            .poll(&rollout_op(), PollSettings::new(k as u32 + 1, Duration::from_secs(60)), None)
            .await
            .expect("success");
        assert_eq!(outcome.attempts as usize, k + 1);
        assert_eq!(query.calls(ROLLOUTS), k + 1);
    }
}

#[tokio::test(start_paused = true)]
async fn times_out_when_attempts_do_not_exceed_k() {
    let k = 4;
    for max in 1..=k as u32 {
        let query = Arc::new(ScriptedQuery::new());
        script_continue_then_success(&query, k);
        let poller = Poller::new(query.clone());

        let err = poller
            .poll(&rollout_op(), PollSettings::new(max, Duration::from_secs(60)), None)
            .await
            .expect_err("must time out");
        assert!(matches!(err, PollError::TimedOut { attempts, .. } if attempts == max));
        assert_eq!(query.calls(ROLLOUTS), max as usize);
    }
}

#[tokio::test(start_paused = true)]
async fn rollout_in_progress_three_times_then_succeeded() {
    let query = Arc::new(ScriptedQuery::new());
    script_continue_then_success(&query, 3);
    query.respond(LOGS, Node::array(Vec::<Node>::new()));
    let diagnostics = LogDiagnostics::for_project(query.clone(), "eab-admin");
    let poller = Poller::new(query.clone());

    let start = tokio::time::Instant::now();
    let outcome = poller
        .poll(&rollout_op(), PollSettings::new(40, Duration::from_secs(60)), Some(&diagnostics))
        .await
        .expect("success");
    assert_eq!(outcome.attempts, 4);
    assert_eq!(outcome.state, "SUCCEEDED");
    assert_eq!(start.elapsed(), Duration::from_secs(180));
    assert_eq!(query.calls(LOGS), 0, "no diagnostics on the success path");
}

#[tokio::test(start_paused = true)]
async fn cancelled_rollout_fails_at_once_with_one_log_fetch() {
    let query = Arc::new(ScriptedQuery::new());
    query.respond(ROLLOUTS, state("CANCELLED"));
    query.respond(
        LOGS,
        Node::from(json!([{ "textPayload": "Rollout cancelled by operator" }])),
    );
    let diagnostics = LogDiagnostics::for_project(query.clone(), "eab-admin");
    let poller = Poller::new(query.clone());

    let start = tokio::time::Instant::now();
    let err = poller
        .poll(&rollout_op(), PollSettings::new(40, Duration::from_secs(60)), Some(&diagnostics))
        .await
        .expect_err("cancelled");
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(query.calls(ROLLOUTS), 1);
    assert_eq!(query.calls(LOGS), 1);
    match err {
        PollError::OperationFailed { state, diagnostics, .. } => {
            assert_eq!(state, "CANCELLED");
            assert_eq!(diagnostics, vec!["Rollout cancelled by operator"]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn continue_states_never_fetch_diagnostics() {
    let query = Arc::new(ScriptedQuery::new());
    query.sequence(
        ROLLOUTS,
        [state("PENDING_RELEASE"), state("IN_PROGRESS"), state("IN_PROGRESS")],
    );
    let diagnostics = RecordingDiagnostics::new(["unused"]);
    let poller = Poller::new(query.clone());

    let err = poller
        .poll(&rollout_op(), PollSettings::new(3, Duration::from_secs(60)), Some(&diagnostics))
        .await
        .expect_err("timeout");
    assert!(matches!(err, PollError::TimedOut { .. }));
    assert_eq!(diagnostics.fetches(), 0);
}

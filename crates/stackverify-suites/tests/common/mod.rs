//! Shared fixtures for suite tests: scripted live state for healthy
//! resources, seeded stack outputs and a context wired to the fakes.
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use stackverify_core::fakes::{MemoryProvisioner, RecordingPusher, ScriptedQuery, ScriptedRunner};
use stackverify_core::{OutputValue, VerifyConfig, VerifyContext};

pub const STATE_BUCKET: &str = "bkt-eab-state";
pub const PROJECT_NUMBER: &str = "424242";

pub struct Harness {
    pub query: Arc<ScriptedQuery>,
    pub provisioner: Arc<MemoryProvisioner>,
    pub pusher: Arc<RecordingPusher>,
    pub runner: Arc<ScriptedRunner>,
    pub ctx: VerifyContext,
}

impl Harness {
    pub fn new(config: VerifyConfig) -> Self {
        Self::with_pusher(config, RecordingPusher::new("9f86d081884c7d659a2feaa0c55ad015a3bf4f1b"))
    }

    pub fn with_pusher(config: VerifyConfig, pusher: RecordingPusher) -> Self {
        let query = Arc::new(ScriptedQuery::new());
        let provisioner = Arc::new(MemoryProvisioner::new());
        let pusher = Arc::new(pusher);
        let runner = Arc::new(ScriptedRunner::new());
        provisioner.set_outputs("1-bootstrap", [("state_bucket", OutputValue::from(STATE_BUCKET))]);
        let ctx = VerifyContext::new(config, query.clone(), provisioner.clone(), pusher.clone())
            .with_runner(runner.clone());
        Self {
            query,
            provisioner,
            pusher,
            runner,
            ctx,
        }
    }
}

pub fn config(envs: &[&str]) -> VerifyConfig {
    VerifyConfig {
        env_names: envs.iter().map(|e| e.to_string()).collect(),
        ..VerifyConfig::default()
    }
}

pub fn env_project(env: &str) -> String {
    format!("eab-gke-{env}")
}

pub fn cluster_name(env: &str) -> String {
    format!("cluster-us-central1-{env}")
}

pub fn cluster_id(env: &str) -> String {
    format!(
        "projects/{}/locations/us-central1/clusters/{}",
        env_project(env),
        cluster_name(env)
    )
}

/// `projects describe` and `services list` for an ACTIVE project with
/// `apis` enabled.
pub fn active_project(query: &ScriptedQuery, project: &str, apis: &[&str]) {
    query.respond(
        &format!("projects describe {project} "),
        json!({ "lifecycleState": "ACTIVE", "projectNumber": PROJECT_NUMBER }),
    );
    let services: Vec<Value> = apis
        .iter()
        .map(|api| json!({ "config": { "name": api } }))
        .collect();
    query.respond(&format!("services list --project {project} "), Value::Array(services));
}

pub fn hub_agent_member() -> String {
    format!("serviceAccount:service-{PROJECT_NUMBER}@gcp-sa-gkehub.iam.gserviceaccount.com")
}

pub fn hub_agent_roles(query: &ScriptedQuery, project: &str, roles: &[&str]) {
    let bindings: Vec<Value> = roles
        .iter()
        .map(|role| json!({ "bindings": { "role": role, "members": [hub_agent_member()] } }))
        .collect();
    query.respond(
        &format!(
            "projects get-iam-policy {project} --flatten bindings --filter bindings.members:'{}'",
            hub_agent_member()
        ),
        Value::Array(bindings),
    );
}

pub fn cloud_armor(query: &ScriptedQuery, project: &str) {
    query.respond(
        &format!("compute security-policies describe eab-cloud-armor --project {project} "),
        json!([{ "description": "EAB Cloud Armor policy" }]),
    );
}

pub fn node_pool(name: &str) -> Value {
    json!({
        "name": name,
        "upgradeSettings": { "strategy": "SURGE", "maxSurge": 1 },
        "autoscaling": { "locationPolicy": "BALANCED", "enabled": true, "autoprovisioned": name != "node-pool-1" }
    })
}

pub fn cluster(project: &str, name: &str, pools: Vec<Value>) -> Value {
    json!({
        "name": name,
        "nodePools": pools,
        "fleet": { "project": project },
        "monitoringConfig": {
            "componentConfig": { "enableComponents": ["SYSTEM_COMPONENTS", "DEPLOYMENT"] },
            "managedPrometheusConfig": { "enabled": true }
        },
        "workloadIdentityConfig": { "workloadPool": format!("{project}.svc.id.goog") },
        "privateClusterConfig": { "enablePrivateEndpoint": true },
        "binaryAuthorization": { "evaluationMode": "PROJECT_SINGLETON_POLICY_ENFORCE" }
    })
}

pub fn membership(project: &str, resource_link: &str) -> Value {
    json!({
        "authority": { "workloadIdentityPool": format!("{project}.svc.id.goog") },
        "endpoint": { "gkeCluster": { "resourceLink": resource_link } }
    })
}

/// Outputs of an applied multitenant environment stack.
pub fn seed_multitenant_env(provisioner: &MemoryProvisioner, env: &str) {
    provisioner.set_outputs(
        format!("2-multitenant/envs/{env}"),
        [
            ("cluster_project_id", OutputValue::from(env_project(env).as_str())),
            ("cluster_regions", OutputValue::from(json!(["us-central1"]))),
            ("clusters_ids", OutputValue::from(json!([cluster_id(env)]))),
            (
                "cluster_service_accounts",
                OutputValue::from(json!([format!("gke-{env}@{}.iam.gserviceaccount.com", env_project(env))])),
            ),
            (
                "cluster_membership_ids",
                OutputValue::from(json!([format!(
                    "projects/{}/locations/global/memberships/{}",
                    env_project(env),
                    cluster_name(env)
                )])),
            ),
        ],
    );
}

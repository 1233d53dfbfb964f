//! Verification configuration, loaded from `stackverify.toml`.
//!
//! Every section is optional; missing fields take the defaults used by the
//! enterprise application blueprint layout.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::poll::PollSettings;
use crate::retry::{Backoff, ExponentialBackoff, FixedBackoff, RetryClassifier, RetryPolicy};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "stackverify.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Root that stage directories are resolved against.
    pub repo_root: PathBuf,
    pub env_names: Vec<String>,
    pub app_names: Vec<String>,
    pub tools: ToolsConfig,
    pub retry: RetryConfig,
    pub poll: PollConfig,
    pub stages: StagesConfig,
    pub appsource: AppSourceConfig,
    pub standalone: StandaloneConfig,
    /// Tear down stacks a suite applied once its checks finish.
    pub teardown: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            env_names: vec![
                "development".to_string(),
                "non-production".to_string(),
                "production".to_string(),
            ],
            app_names: vec!["cymbal-bank".to_string(), "cymbal-shop".to_string()],
            tools: ToolsConfig::default(),
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            stages: StagesConfig::default(),
            appsource: AppSourceConfig::default(),
            standalone: StandaloneConfig::default(),
            teardown: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    pub gcloud: String,
    pub terraform: String,
    pub git: String,
    /// Per-command wall-clock limit in seconds; 0 disables it.
    pub command_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            gcloud: "gcloud".to_string(),
            terraform: "terraform".to_string(),
            git: "git".to_string(),
            command_timeout_secs: 60 * 60,
        }
    }
}

impl ToolsConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total apply attempts, including the first.
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub interval_secs: u64,
    /// Upper bound for exponential backoff.
    pub max_interval_secs: u64,
    /// Extra transient-error regexes on top of the built-in set.
    pub extra_patterns: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Fixed,
            interval_secs: 120,
            max_interval_secs: 600,
            extra_patterns: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let classifier = RetryClassifier::transient_defaults()
            .with_patterns(self.extra_patterns.iter())
            .map_err(|e| ConfigError::Invalid(format!("retry.extra_patterns: {e}")))?;
        let interval = Duration::from_secs(self.interval_secs);
        let backoff: Arc<dyn Backoff> = match self.backoff {
            BackoffKind::Fixed => Arc::new(FixedBackoff(interval)),
            BackoffKind::Exponential => Arc::new(ExponentialBackoff {
                initial: interval,
                max: Duration::from_secs(self.max_interval_secs),
            }),
        };
        Ok(RetryPolicy {
            classifier,
            max_attempts: self.max_attempts,
            backoff,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollWindow {
    pub max_attempts: u32,
    pub interval_secs: u64,
}

impl Default for PollWindow {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval_secs: 30,
        }
    }
}

impl PollWindow {
    pub fn settings(&self) -> PollSettings {
        PollSettings::new(self.max_attempts, Duration::from_secs(self.interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollConfig {
    pub build: PollWindow,
    pub rollout: PollWindow,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            build: PollWindow {
                max_attempts: 60,
                interval_secs: 30,
            },
            rollout: PollWindow {
                max_attempts: 40,
                interval_secs: 60,
            },
        }
    }
}

/// Stage directories relative to `repo_root`. `{env}` and `{app}` are
/// substituted per unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StagesConfig {
    pub bootstrap: String,
    pub multitenant: String,
    pub appfactory: String,
    pub appfactory_shared: String,
    pub appsource: String,
    pub standalone: String,
    pub standalone_setup: String,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            bootstrap: "1-bootstrap".to_string(),
            multitenant: "2-multitenant/envs/{env}".to_string(),
            appfactory: "4-appfactory/apps/{app}".to_string(),
            appfactory_shared: "4-appfactory/envs/shared".to_string(),
            appsource: "examples/{app}/6-appsource/{app}".to_string(),
            standalone: "examples/standalone_single_project".to_string(),
            standalone_setup: "test/setup".to_string(),
        }
    }
}

impl StagesConfig {
    pub fn multitenant_dir(&self, env: &str) -> String {
        self.multitenant.replace("{env}", env)
    }

    pub fn appfactory_dir(&self, app: &str) -> String {
        self.appfactory.replace("{app}", app)
    }

    pub fn appsource_dir(&self, app: &str) -> String {
        self.appsource.replace("{app}", app)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppSourceConfig {
    pub region: String,
    pub app: String,
    pub service: String,
    pub upstream_url: String,
    pub upstream_ref: String,
    pub remote_name: String,
    pub commit_message: String,
    pub author_email: String,
    pub author_name: String,
    pub credential_url: String,
    pub credential_helper: String,
    pub post_buffer: u64,
    /// Environments whose rollouts are awaited, as `<region>-<env>` targets.
    pub rollout_envs: Vec<String>,
}

impl Default for AppSourceConfig {
    fn default() -> Self {
        Self {
            region: "us-central1".to_string(),
            app: "cymbal-shop".to_string(),
            service: "cymbalshop".to_string(),
            upstream_url: "https://github.com/GoogleCloudPlatform/microservices-demo.git".to_string(),
            upstream_ref: "v0.10.1".to_string(),
            remote_name: "google".to_string(),
            commit_message: "initial commit".to_string(),
            author_email: "eab-robot@example.com".to_string(),
            author_name: "EAB Robot".to_string(),
            credential_url: "https://source.developers.google.com".to_string(),
            credential_helper: "gcloud.sh".to_string(),
            post_buffer: 157_286_400,
            rollout_envs: vec!["development".to_string()],
        }
    }
}

/// Where the fleet host project lives relative to the cluster project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FleetProject {
    #[default]
    Same,
    Separate { project_id: String },
}

impl FleetProject {
    /// Whether the hub service agent also needs the cross-project role.
    pub fn is_cross_project(&self, cluster_project: &str) -> bool {
        match self {
            FleetProject::Same => false,
            FleetProject::Separate { project_id } => project_id != cluster_project,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StandaloneConfig {
    pub fleet_project: FleetProject,
    /// Setup stack output holding the target project id.
    pub project_output: String,
}

impl Default for StandaloneConfig {
    fn default() -> Self {
        Self {
            fleet_project: FleetProject::Same,
            project_output: "project_id_standalone".to_string(),
        }
    }
}

impl VerifyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.env_names.is_empty() {
            return invalid("env_names must not be empty");
        }
        if self.env_names.iter().any(|e| e.trim().is_empty()) {
            return invalid("env_names must not contain blank names");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be > 0");
        }
        if self.poll.build.max_attempts == 0 || self.poll.rollout.max_attempts == 0 {
            return invalid("poll max_attempts must be > 0");
        }
        if self.poll.build.interval_secs == 0 || self.poll.rollout.interval_secs == 0 {
            return invalid("poll interval_secs must be > 0");
        }
        for (name, binary) in [
            ("tools.gcloud", &self.tools.gcloud),
            ("tools.terraform", &self.tools.terraform),
            ("tools.git", &self.tools.git),
        ] {
            if binary.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} must not be blank")));
            }
        }
        if let FleetProject::Separate { project_id } = &self.standalone.fleet_project {
            if project_id.trim().is_empty() {
                return invalid("standalone.fleet_project.project_id must not be blank");
            }
        }
        self.retry.to_policy()?;
        Ok(())
    }

    /// `repo_root` joined with a stage directory.
    pub fn stage_path(&self, dir: &str) -> PathBuf {
        self.repo_root.join(dir)
    }
}

/// Load config from a TOML file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<VerifyConfig, ConfigError> {
    if !path.exists() {
        let cfg = VerifyConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: VerifyConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, VerifyConfig::default());
        assert_eq!(cfg.poll.rollout.max_attempts, 40);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stackverify.toml");
        fs::write(
            &path,
            r#"
env_names = ["development"]

[poll.build]
max_attempts = 5

[standalone.fleet_project]
mode = "separate"
project_id = "eab-fleet-host"
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.env_names, vec!["development"]);
        assert_eq!(cfg.poll.build.max_attempts, 5);
        assert_eq!(cfg.poll.build.interval_secs, 30);
        assert_eq!(cfg.tools.gcloud, "gcloud");
        assert!(cfg.standalone.fleet_project.is_cross_project("eab-cluster"));
        assert!(!cfg.standalone.fleet_project.is_cross_project("eab-fleet-host"));
    }

    #[test]
    fn validate_rejects_zero_attempts_and_blank_tools() {
        let mut cfg = VerifyConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = VerifyConfig::default();
        cfg.tools.terraform = "  ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = VerifyConfig::default();
        cfg.env_names.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_retry_pattern_is_invalid() {
        let mut cfg = VerifyConfig::default();
        cfg.retry.extra_patterns.push("(unclosed".to_string());
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn parse_error_names_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stackverify.toml");
        fs::write(&path, "env_names = 3").expect("write");
        let err = load_config(&path).expect_err("parse error");
        assert!(err.to_string().contains("stackverify.toml"));
    }

    #[test]
    fn stage_dirs_substitute_names() {
        let stages = StagesConfig::default();
        assert_eq!(stages.multitenant_dir("production"), "2-multitenant/envs/production");
        assert_eq!(stages.appfactory_dir("cymbal-bank"), "4-appfactory/apps/cymbal-bank");
        assert_eq!(
            stages.appsource_dir("cymbal-shop"),
            "examples/cymbal-shop/6-appsource/cymbal-shop"
        );
    }

    #[test]
    fn exponential_backoff_policy() {
        let retry = RetryConfig {
            backoff: BackoffKind::Exponential,
            interval_secs: 10,
            max_interval_secs: 25,
            ..RetryConfig::default()
        };
        let policy = retry.to_policy().expect("policy");
        assert_eq!(policy.backoff.delay(1), Duration::from_secs(10));
        assert_eq!(policy.backoff.delay(3), Duration::from_secs(25));
    }
}

//! Shared collaborators handed to every unit of work.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};

use crate::config::VerifyConfig;
use crate::error::{ConfigError, StackError};
use crate::exec::{CommandRunner, TokioCommandRunner};
use crate::facts::StackSource;
use crate::poll::Poller;
use crate::query::{GcloudQuery, LiveStateQuery};
use crate::retry::RetryPolicy;
use crate::source::{GitSourcePusher, SourcePusher};
use crate::stack::{Provisioner, StackDefinition, StackHandle, StackId, TerraformProvisioner};

/// Attached stacks, one per [`StackId`] for the lifetime of the process.
///
/// The first caller for an id attaches it; concurrent callers wait for that
/// attach. A failed attach is not cached, so a later caller tries again.
pub struct StackCache {
    provisioner: Arc<dyn Provisioner>,
    cells: Mutex<HashMap<StackId, Arc<OnceCell<Arc<StackHandle>>>>>,
}

impl StackCache {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Attached handle for `definition`, attaching on first use.
    pub async fn attach(&self, definition: &StackDefinition) -> Result<Arc<StackHandle>, StackError> {
        let cell = {
            let mut cells = self.cells.lock().await;
            Arc::clone(cells.entry(definition.id.clone()).or_default())
        };
        let handle = cell
            .get_or_try_init(|| async {
                let mut handle = StackHandle::new(definition.clone(), Arc::clone(&self.provisioner));
                handle.attach().await?;
                tracing::debug!(stack = %definition.id, "stack attached");
                Ok::<_, StackError>(Arc::new(handle))
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    /// Number of stacks attached so far.
    pub async fn attached(&self) -> usize {
        let cells = self.cells.lock().await;
        cells.values().filter(|cell| cell.initialized()).count()
    }

    /// A [`StackSource`] resolving logical keys through this cache.
    pub fn keyed(self: &Arc<Self>, definitions: BTreeMap<String, StackDefinition>) -> KeyedStacks {
        KeyedStacks {
            cache: Arc::clone(self),
            definitions,
        }
    }
}

/// Logical key to stack definition, backed by a [`StackCache`].
pub struct KeyedStacks {
    cache: Arc<StackCache>,
    definitions: BTreeMap<String, StackDefinition>,
}

#[async_trait]
impl StackSource for KeyedStacks {
    async fn open(&self, key: &str) -> Result<Arc<StackHandle>, StackError> {
        let definition = self
            .definitions
            .get(key)
            .ok_or_else(|| StackError::UnknownKey(key.to_string()))?;
        self.cache.attach(definition).await
    }
}

/// Everything a unit needs, passed explicitly; there is no global state.
#[derive(Clone)]
pub struct VerifyContext {
    pub config: Arc<VerifyConfig>,
    pub query: Arc<dyn LiveStateQuery>,
    pub provisioner: Arc<dyn Provisioner>,
    pub pusher: Arc<dyn SourcePusher>,
    /// For the few mutating commands outside the provisioner (cleanup).
    pub runner: Arc<dyn CommandRunner>,
    pub stacks: Arc<StackCache>,
}

impl VerifyContext {
    pub fn new(
        config: VerifyConfig,
        query: Arc<dyn LiveStateQuery>,
        provisioner: Arc<dyn Provisioner>,
        pusher: Arc<dyn SourcePusher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            query,
            stacks: Arc::new(StackCache::new(Arc::clone(&provisioner))),
            provisioner,
            pusher,
            runner: Arc::new(TokioCommandRunner),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Context driving the real `gcloud`, `terraform` and `git` binaries.
    pub fn from_config(config: VerifyConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
        let timeout = config.tools.command_timeout();
        let query = Arc::new(
            GcloudQuery::new(Arc::clone(&runner), config.tools.gcloud.clone()).with_timeout(timeout),
        );
        let provisioner = Arc::new(
            TerraformProvisioner::new(Arc::clone(&runner), config.tools.terraform.clone())
                .with_timeout(timeout),
        );
        let pusher = Arc::new(
            GitSourcePusher::new(Arc::clone(&runner), config.tools.git.clone()).with_timeout(timeout),
        );
        Self::new(config, query, provisioner, pusher).with_runner(runner)
    }

    /// Definition for the stage directory `dir` (relative to `repo_root`).
    /// The relative directory doubles as the stack id.
    pub fn definition(&self, dir: &str) -> StackDefinition {
        StackDefinition::new(dir, self.config.stage_path(dir))
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        self.config.retry.to_policy()
    }

    /// Fresh handle for a stack this unit applies itself.
    pub fn handle(&self, definition: StackDefinition) -> Result<StackHandle, ConfigError> {
        Ok(StackHandle::new(definition, Arc::clone(&self.provisioner)).with_retry(self.retry_policy()?))
    }

    /// Attached handle for a stack applied by an earlier stage.
    pub async fn attach(&self, dir: &str) -> Result<Arc<StackHandle>, StackError> {
        self.stacks.attach(&self.definition(dir)).await
    }

    pub fn poller(&self) -> Poller {
        Poller::new(Arc::clone(&self.query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryProvisioner, RecordingPusher, ScriptedQuery};
    use crate::stack::OutputValue;

    fn context(provisioner: Arc<MemoryProvisioner>) -> VerifyContext {
        VerifyContext::new(
            VerifyConfig::default(),
            Arc::new(ScriptedQuery::new()),
            provisioner,
            Arc::new(RecordingPusher::new("abc1234")),
        )
    }

    #[tokio::test]
    async fn test_concurrent_opens_attach_once() {
        let provisioner = Arc::new(MemoryProvisioner::new());
        provisioner.set_outputs("1-bootstrap", [("state_bucket", OutputValue::from("bkt-state"))]);
        let ctx = context(provisioner.clone());

        let (a, b) = tokio::join!(ctx.attach("1-bootstrap"), ctx.attach("1-bootstrap"));
        assert_eq!(a.unwrap().string_output("state_bucket").unwrap(), "bkt-state");
        assert!(b.is_ok());
        assert_eq!(provisioner.output_reads("1-bootstrap"), 1);
        assert_eq!(ctx.stacks.attached().await, 1);
    }

    #[tokio::test]
    async fn test_keyed_source_rejects_unknown_key() {
        let provisioner = Arc::new(MemoryProvisioner::new());
        provisioner.set_outputs("2-multitenant/envs/development", [("cluster_project_id", OutputValue::from("eab-gke-dev"))]);
        let ctx = context(provisioner);
        let mut defs = BTreeMap::new();
        defs.insert(
            "development".to_string(),
            ctx.definition("2-multitenant/envs/development"),
        );
        let source = ctx.stacks.keyed(defs);

        let handle = source.open("development").await.expect("open");
        assert_eq!(handle.string_output("cluster_project_id").unwrap(), "eab-gke-dev");
        let err = source.open("production").await.expect_err("unknown");
        assert!(matches!(err, StackError::UnknownKey(ref k) if k == "production"));
    }

    #[tokio::test]
    async fn test_failed_attach_is_retried() {
        let provisioner = Arc::new(MemoryProvisioner::new());
        let ctx = context(provisioner.clone());
        assert!(ctx.attach("1-bootstrap").await.is_err());
        provisioner.set_outputs("1-bootstrap", [("state_bucket", OutputValue::from("bkt-state"))]);
        assert!(ctx.attach("1-bootstrap").await.is_ok());
    }
}

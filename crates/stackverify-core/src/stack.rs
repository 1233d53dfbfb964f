//! Handles over independently applied infrastructure stacks.
//!
//! A [`StackHandle`] walks `Uninitialized -> Applying -> {Applied, Failed}`
//! and `Applied -> TornDown`. Outputs are readable only once `Applied`.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProvisionError, StackError};
use crate::exec::{CommandRunner, CommandSpec};
use crate::node::Node;
use crate::obs;
use crate::retry::{RetryDecision, RetryPolicy};

/// Identity of a stack, usually its directory relative to the repo root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackId(String);

impl StackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StackId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StackId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Value of one stack output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum OutputValue {
    Scalar(String),
    Sequence(Vec<Node>),
    Structured(Node),
}

impl OutputValue {
    /// Strings, numbers and bools become scalars, arrays sequences,
    /// everything else a structured tree.
    pub fn from_node(node: Node) -> Self {
        match node {
            Node::String(s) => OutputValue::Scalar(s),
            Node::Bool(_) | Node::Number(_) => OutputValue::Scalar(node.text()),
            Node::Array(items) => OutputValue::Sequence(items),
            other => OutputValue::Structured(other),
        }
    }

    pub fn to_node(&self) -> Node {
        match self {
            OutputValue::Scalar(s) => Node::String(s.clone()),
            OutputValue::Sequence(items) => Node::Array(items.clone()),
            OutputValue::Structured(node) => node.clone(),
        }
    }
}

impl From<&str> for OutputValue {
    fn from(s: &str) -> Self {
        OutputValue::Scalar(s.to_string())
    }
}

impl From<Value> for OutputValue {
    fn from(value: Value) -> Self {
        OutputValue::from_node(Node::from(value))
    }
}

/// Outputs keyed by name, as returned by a [`Provisioner`].
pub type Outputs = BTreeMap<String, OutputValue>;

/// One named output of one stack. Immutable once read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackOutput {
    pub stack: StackId,
    pub name: String,
    pub value: OutputValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackState {
    Uninitialized,
    Applying,
    Applied,
    Failed,
    TornDown,
}

impl fmt::Display for StackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackState::Uninitialized => "uninitialized",
            StackState::Applying => "applying",
            StackState::Applied => "applied",
            StackState::Failed => "failed",
            StackState::TornDown => "torn down",
        };
        f.write_str(s)
    }
}

/// Where a stack lives and what it is applied with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackDefinition {
    pub id: StackId,
    pub dir: PathBuf,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub backend_config: BTreeMap<String, String>,
}

impl StackDefinition {
    pub fn new(id: impl Into<StackId>, dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            dir: dir.into(),
            vars: BTreeMap::new(),
            backend_config: BTreeMap::new(),
        }
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn backend(mut self, config: &BTreeMap<String, String>) -> Self {
        self.backend_config
            .extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// The infrastructure-provisioning tool, treated as opaque.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Apply the stack and return its outputs.
    async fn apply(&self, definition: &StackDefinition) -> Result<Outputs, ProvisionError>;

    /// Read outputs of a stack that was applied earlier.
    async fn outputs(&self, definition: &StackDefinition) -> Result<Outputs, ProvisionError>;

    async fn teardown(&self, definition: &StackDefinition) -> Result<(), ProvisionError>;
}

/// One stack plus its lifecycle state and the outputs it produced.
pub struct StackHandle {
    definition: StackDefinition,
    provisioner: Arc<dyn Provisioner>,
    retry: RetryPolicy,
    state: StackState,
    outputs: BTreeMap<String, StackOutput>,
    attempts: u32,
}

impl fmt::Debug for StackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackHandle")
            .field("id", &self.definition.id)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StackHandle {
    pub fn new(definition: StackDefinition, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            definition,
            provisioner,
            retry: RetryPolicy::none(),
            state: StackState::Uninitialized,
            outputs: BTreeMap::new(),
            attempts: 0,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn id(&self) -> &StackId {
        &self.definition.id
    }

    pub fn definition(&self) -> &StackDefinition {
        &self.definition
    }

    pub fn state(&self) -> StackState {
        self.state
    }

    /// Apply attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Apply the stack, retrying transient failures per the retry policy.
    pub async fn apply(&mut self) -> Result<(), StackError> {
        if self.state != StackState::Uninitialized {
            return Err(StackError::InvalidTransition {
                stack: self.id().clone(),
                state: self.state,
                action: "apply",
            });
        }
        self.state = StackState::Applying;

        loop {
            self.attempts += 1;
            let result = self.provisioner.apply(&self.definition).await;
            let err = match result {
                Ok(outputs) => {
                    self.store(outputs);
                    self.state = StackState::Applied;
                    tracing::info!(stack = %self.id(), attempts = self.attempts, "stack applied");
                    return Ok(());
                }
                Err(err) => err,
            };

            let message = err.to_string();
            match self.retry.should_retry(&message, self.attempts) {
                RetryDecision::Retry(delay) => {
                    obs::emit_apply_retry(self.id().as_str(), self.attempts, delay, &message);
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp { retryable } => {
                    self.state = StackState::Failed;
                    return Err(StackError::ApplyFailed {
                        stack: self.id().clone(),
                        attempts: self.attempts,
                        retryable,
                        message,
                    });
                }
            }
        }
    }

    /// Read outputs of an already-applied stack without applying it.
    pub async fn attach(&mut self) -> Result<(), StackError> {
        if self.state != StackState::Uninitialized {
            return Err(StackError::InvalidTransition {
                stack: self.id().clone(),
                state: self.state,
                action: "attach",
            });
        }
        let result = self.provisioner.outputs(&self.definition).await;
        match result {
            Ok(outputs) => {
                self.store(outputs);
                self.state = StackState::Applied;
                Ok(())
            }
            Err(source) => {
                self.state = StackState::Failed;
                Err(StackError::Attach {
                    stack: self.id().clone(),
                    source,
                })
            }
        }
    }

    fn store(&mut self, outputs: Outputs) {
        let stack = self.id().clone();
        self.outputs = outputs
            .into_iter()
            .map(|(name, value)| {
                let output = StackOutput {
                    stack: stack.clone(),
                    name: name.clone(),
                    value,
                };
                (name, output)
            })
            .collect();
    }

    pub fn output(&self, name: &str) -> Result<&StackOutput, StackError> {
        if self.state != StackState::Applied {
            return Err(StackError::NotApplied {
                stack: self.id().clone(),
                state: self.state,
            });
        }
        self.outputs
            .get(name)
            .ok_or_else(|| StackError::OutputNotFound {
                stack: self.id().clone(),
                name: name.to_string(),
            })
    }

    pub fn string_output(&self, name: &str) -> Result<String, StackError> {
        match &self.output(name)?.value {
            OutputValue::Scalar(s) => Ok(s.clone()),
            _ => Err(self.type_error(name, "string")),
        }
    }

    pub fn list_output(&self, name: &str) -> Result<Vec<String>, StackError> {
        match &self.output(name)?.value {
            OutputValue::Sequence(items) => Ok(items.iter().map(Node::text).collect()),
            _ => Err(self.type_error(name, "list")),
        }
    }

    /// Any output as a [`Node`] tree.
    pub fn json_output(&self, name: &str) -> Result<Node, StackError> {
        Ok(self.output(name)?.value.to_node())
    }

    fn type_error(&self, name: &str, expected: &'static str) -> StackError {
        StackError::OutputType {
            stack: self.id().clone(),
            name: name.to_string(),
            expected,
        }
    }

    /// Best-effort teardown. Failures are logged and never returned.
    pub async fn teardown(&mut self) {
        if matches!(self.state, StackState::Applied | StackState::Failed) {
            if let Err(err) = self.provisioner.teardown(&self.definition).await {
                obs::emit_stack_teardown_error(self.id().as_str(), &err);
            }
        }
        self.state = StackState::TornDown;
    }
}

/// [`Provisioner`] driving the `terraform` CLI.
pub struct TerraformProvisioner {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Option<Duration>,
}

impl TerraformProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, dir: &Path, args: Vec<String>) -> CommandSpec {
        CommandSpec::new(&self.binary)
            .args(args)
            .cwd(dir)
            .env("TF_IN_AUTOMATION", "1")
            .timeout(self.timeout)
    }

    async fn run(
        &self,
        definition: &StackDefinition,
        operation: &str,
        args: Vec<String>,
    ) -> Result<String, ProvisionError> {
        let spec = self.command(&definition.dir, args);
        let output = self.runner.run(&spec).await?;
        if !output.passed() {
            return Err(ProvisionError::CommandFailed {
                operation: operation.to_string(),
                dir: definition.dir.clone(),
                message: output.diagnostic().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn init(&self, definition: &StackDefinition) -> Result<(), ProvisionError> {
        let mut args = vec!["init".to_string(), "-input=false".to_string(), "-no-color".to_string()];
        args.extend(
            definition
                .backend_config
                .iter()
                .map(|(k, v)| format!("-backend-config={k}={v}")),
        );
        self.run(definition, "init", args).await.map(|_| ())
    }

    fn write_vars(definition: &StackDefinition) -> Result<tempfile::NamedTempFile, ProvisionError> {
        let mut file = tempfile::Builder::new()
            .prefix("stackverify-")
            .suffix(".tfvars.json")
            .tempfile()?;
        let body = serde_json::to_vec_pretty(&definition.vars).map_err(std::io::Error::from)?;
        file.write_all(&body)?;
        file.flush()?;
        Ok(file)
    }

    async fn read_outputs(&self, definition: &StackDefinition) -> Result<Outputs, ProvisionError> {
        let stdout = self
            .run(
                definition,
                "output",
                vec!["output".to_string(), "-json".to_string(), "-no-color".to_string()],
            )
            .await?;
        parse_terraform_outputs(&stdout).map_err(|detail| ProvisionError::MalformedOutputs {
            dir: definition.dir.clone(),
            detail,
        })
    }
}

/// Parse `terraform output -json`: `{name: {"value": ..., "type": ...}}`.
pub fn parse_terraform_outputs(stdout: &str) -> Result<Outputs, String> {
    if stdout.trim().is_empty() {
        return Ok(Outputs::new());
    }
    let node = Node::parse(stdout).map_err(|e| e.to_string())?;
    let Node::Object(map) = node else {
        return Err("expected a JSON object of outputs".to_string());
    };
    Ok(map
        .into_iter()
        .map(|(name, entry)| (name, OutputValue::from_node(entry.get("value"))))
        .collect())
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    async fn apply(&self, definition: &StackDefinition) -> Result<Outputs, ProvisionError> {
        self.init(definition).await?;
        let vars = Self::write_vars(definition)?;
        let args = vec![
            "apply".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            format!("-var-file={}", vars.path().display()),
        ];
        self.run(definition, "apply", args).await?;
        self.read_outputs(definition).await
    }

    async fn outputs(&self, definition: &StackDefinition) -> Result<Outputs, ProvisionError> {
        self.init(definition).await?;
        self.read_outputs(definition).await
    }

    async fn teardown(&self, definition: &StackDefinition) -> Result<(), ProvisionError> {
        let vars = Self::write_vars(definition)?;
        let args = vec![
            "destroy".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            format!("-var-file={}", vars.path().display()),
        ];
        self.run(definition, "destroy", args).await.map(|_| ())
    }
}

//! Read-only live-state queries against the resource-management CLI.
//!
//! Results are never cached: each call reflects the state at call time.
//! Options (`--flatten`, `--filter`, `--format`) are passed through to the
//! CLI without interpretation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueryError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::node::Node;

/// Command words of a query, e.g. `projects describe my-project`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryCommand {
    words: Vec<String>,
}

impl QueryCommand {
    /// Split `text` on whitespace. Values containing spaces or quotes go
    /// through [`QueryOptions`] or [`QueryCommand::arg`] instead.
    pub fn parse(text: &str) -> Self {
        Self {
            words: text.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Append a single word verbatim.
    pub fn arg(mut self, word: impl Into<String>) -> Self {
        self.words.push(word.into());
        self
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Command words followed by the option arguments, space separated.
    pub fn render(&self, options: &QueryOptions) -> String {
        self.words
            .iter()
            .cloned()
            .chain(options.to_args())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for QueryCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.words.join(" "))
    }
}

impl From<&str> for QueryCommand {
    fn from(text: &str) -> Self {
        QueryCommand::parse(text)
    }
}

impl From<String> for QueryCommand {
    fn from(text: String) -> Self {
        QueryCommand::parse(&text)
    }
}

/// Pass-through query options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// `--flatten` projection.
    pub flatten: Option<String>,
    /// `--filter` expression.
    pub filter: Option<String>,
    /// `--format` selection; `json` unless overridden.
    pub format: String,
    /// Extra arguments appended before `--format`.
    pub extra_args: Vec<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            flatten: None,
            filter: None,
            format: "json".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl QueryOptions {
    pub fn flatten(mut self, path: impl Into<String>) -> Self {
        self.flatten = Some(path.into());
        self
    }

    pub fn filter(mut self, expr: impl Into<String>) -> Self {
        self.filter = Some(expr.into());
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// IAM policy bindings flattened and filtered, the common shape for
    /// "which roles does this member hold" queries.
    pub fn bindings(filter: impl Into<String>) -> Self {
        Self::default().flatten("bindings").filter(filter)
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(flatten) = &self.flatten {
            args.push("--flatten".to_string());
            args.push(flatten.clone());
        }
        if let Some(filter) = &self.filter {
            args.push("--filter".to_string());
            args.push(filter.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push("--format".to_string());
        args.push(self.format.clone());
        args
    }

    fn is_json(&self) -> bool {
        self.format.starts_with("json")
    }
}

/// Narrow contract over the live resource API.
#[async_trait]
pub trait LiveStateQuery: Send + Sync {
    /// Run a read-only query and return its structured result.
    async fn query(&self, command: &QueryCommand, options: &QueryOptions)
        -> Result<Node, QueryError>;
}

/// Run a query and coerce the result to a list of nodes.
pub async fn query_list(
    engine: &dyn LiveStateQuery,
    command: &QueryCommand,
    options: &QueryOptions,
) -> Result<Vec<Node>, QueryError> {
    engine.query(command, options).await.map(|node| node.items())
}

/// [`LiveStateQuery`] that shells out to `gcloud`.
pub struct GcloudQuery {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Option<Duration>,
}

impl GcloudQuery {
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
}

#[async_trait]
impl LiveStateQuery for GcloudQuery {
    async fn query(
        &self,
        command: &QueryCommand,
        options: &QueryOptions,
    ) -> Result<Node, QueryError> {
        let literal = format!("{} {}", self.binary, command.render(options));
        let spec = CommandSpec::new(&self.binary)
            .args(command.words().iter().cloned())
            .args(options.to_args())
            .timeout(self.timeout);

        tracing::debug!(query = %literal, "live-state query");
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|source| QueryError::Exec {
                query: literal.clone(),
                source,
            })?;

        if !output.passed() {
            return Err(QueryError::Failed {
                query: literal,
                exit_code: output.exit_code,
                stderr: output.diagnostic().to_string(),
            });
        }

        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            return Ok(Node::Array(Vec::new()));
        }
        if !options.is_json() {
            return Ok(Node::String(stdout.to_string()));
        }
        Node::parse(stdout).map_err(|e| QueryError::Malformed {
            query: literal,
            detail: e.to_string(),
        })
    }
}

//! Error taxonomy for the verification engine.
//!
//! Assertion mismatches are never errors: they are recorded as failed
//! [`crate::expect::CheckOutcome`]s. Everything in this module is either
//! fatal for the enclosing unit of work or surfaced as a check failure by
//! the caller.

use std::path::PathBuf;

use thiserror::Error;

use crate::expect::Verifier;
use crate::stack::{StackId, StackState};
use crate::unit::UnitBody;

/// Errors from running an external process.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command has no program")]
    EmptyCommand,

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout_secs} seconds")]
    TimedOut { command: String, timeout_secs: u64 },

    #[error("io error while waiting for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reported by the stack provisioning tool.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{operation} failed in {}: {message}", dir.display())]
    CommandFailed {
        operation: String,
        dir: PathBuf,
        message: String,
    },

    #[error("malformed outputs in {}: {detail}", dir.display())]
    MalformedOutputs { dir: PathBuf, detail: String },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a [`crate::stack::StackHandle`].
#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack {stack} is {state}, outputs are only readable once applied")]
    NotApplied { stack: StackId, state: StackState },

    #[error("stack {stack} cannot {action} from state {state}")]
    InvalidTransition {
        stack: StackId,
        state: StackState,
        action: &'static str,
    },

    #[error("stack {stack} has no output named '{name}'")]
    OutputNotFound { stack: StackId, name: String },

    #[error("output '{name}' of stack {stack} is not a {expected}")]
    OutputType {
        stack: StackId,
        name: String,
        expected: &'static str,
    },

    #[error("apply of stack {stack} failed after {attempts} attempt(s) (retryable: {retryable}): {message}")]
    ApplyFailed {
        stack: StackId,
        attempts: u32,
        retryable: bool,
        message: String,
    },

    #[error("reading outputs of stack {stack} failed: {source}")]
    Attach {
        stack: StackId,
        #[source]
        source: ProvisionError,
    },

    #[error("no stack definition registered for key '{0}'")]
    UnknownKey(String),
}

/// Errors from the live-state query engine. Each carries the literal query.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query `{query}` exited with code {exit_code}: {stderr}")]
    Failed {
        query: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("query `{query}` returned malformed output: {detail}")]
    Malformed { query: String, detail: String },

    #[error("query `{query}` could not run: {source}")]
    Exec {
        query: String,
        #[source]
        source: ExecError,
    },
}

impl QueryError {
    /// The literal query that was issued.
    pub fn query(&self) -> &str {
        match self {
            QueryError::Failed { query, .. }
            | QueryError::Malformed { query, .. }
            | QueryError::Exec { query, .. } => query,
        }
    }
}

/// Errors from the asynchronous operation poller.
#[derive(Debug, Error)]
pub enum PollError {
    /// The operation reached one of its failure states.
    #[error("{operation} reached terminal state {state}")]
    OperationFailed {
        operation: String,
        state: String,
        diagnostics: Vec<String>,
    },

    /// We stopped waiting; the operation itself may still finish.
    #[error("{operation} did not reach a terminal state after {attempts} attempt(s) (last state: {})", last_state.as_deref().unwrap_or("<none observed>"))]
    TimedOut {
        operation: String,
        attempts: u32,
        last_state: Option<String>,
    },

    #[error("poll settings invalid: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Errors from building a [`crate::facts::FactTable`].
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("stack for key '{key}' could not be resolved: {source}")]
    Stack {
        key: String,
        #[source]
        source: StackError,
    },

    #[error("expected exactly one fact entry for '{key}', found {found}")]
    Cardinality { key: String, found: usize },

    #[error("malformed fact key '{key}': {detail}")]
    Shape { key: String, detail: String },

    #[error("aggregation task failed: {0}")]
    Join(String),
}

/// Errors from pushing source content to a remote repository.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("git {step} failed: {stderr}")]
    Git { step: String, stderr: String },

    #[error("push produced an empty commit id")]
    EmptyCommit,

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fatal error for one unit of work. Aborts that unit and its descendants
/// only; siblings keep running.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("expected {expected} {what}, found {found}")]
    Cardinality {
        what: String,
        expected: String,
        found: usize,
    },

    #[error("{0}")]
    Fatal(String),

    /// Fatal error raised after the unit already recorded checks or ran
    /// children; the report keeps both.
    #[error("{source}")]
    Partial {
        body: Box<UnitBody>,
        source: Box<VerifyError>,
    },
}

impl VerifyError {
    /// Attach the checks recorded before this error.
    pub fn with_checks(self, checks: Verifier) -> Self {
        self.with_body(UnitBody::with_checks(checks))
    }

    /// Attach the partial body built before this error. Outcomes already
    /// carried by `self` come after the ones in `body`.
    pub fn with_body(self, mut body: UnitBody) -> Self {
        match self {
            VerifyError::Partial { body: inner, source } => {
                let inner = *inner;
                body.checks.absorb(inner.checks);
                body.add_children(inner.children);
                VerifyError::Partial {
                    body: Box::new(body),
                    source,
                }
            }
            other => VerifyError::Partial {
                body: Box::new(body),
                source: Box::new(other),
            },
        }
    }
}

/// Result type for a unit of work.
pub type VerifyResult<T> = std::result::Result<T, VerifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_keeps_literal_query() {
        let err = QueryError::Failed {
            query: "gcloud projects describe p-1 --format json".to_string(),
            exit_code: 1,
            stderr: "NOT_FOUND".to_string(),
        };
        assert_eq!(err.query(), "gcloud projects describe p-1 --format json");
        assert!(err.to_string().contains("projects describe p-1"));
        assert!(err.to_string().contains("NOT_FOUND"));
    }

    #[test]
    fn test_timeout_and_failure_are_distinct() {
        let timed_out = PollError::TimedOut {
            operation: "build".to_string(),
            attempts: 3,
            last_state: Some("WORKING".to_string()),
        };
        let failed = PollError::OperationFailed {
            operation: "build".to_string(),
            state: "FAILURE".to_string(),
            diagnostics: Vec::new(),
        };
        assert!(timed_out.to_string().contains("did not reach a terminal state"));
        assert!(timed_out.to_string().contains("WORKING"));
        assert!(failed.to_string().contains("FAILURE"));
    }

    #[test]
    fn test_partial_error_keeps_message_and_checks() {
        let mut checks = Verifier::new();
        checks.is_true("cluster c", false, "private endpoint");
        let err = VerifyError::Fatal("unknown node pool: spot".to_string()).with_checks(checks);
        assert_eq!(err.to_string(), "unknown node pool: spot");

        let mut earlier = Verifier::new();
        earlier.is_true("project p", true, "active");
        let VerifyError::Partial { body, source } = err.with_checks(earlier) else {
            panic!("expected a partial error");
        };
        assert!(matches!(*source, VerifyError::Fatal(_)));
        let subjects: Vec<_> = body.checks.outcomes().iter().map(|o| o.subject.as_str()).collect();
        assert_eq!(subjects, vec!["project p", "cluster c"]);
    }

    #[test]
    fn test_cardinality_error_names_subject() {
        let err = VerifyError::Cardinality {
            what: "releases for commit abc1234".to_string(),
            expected: "at least 1".to_string(),
            found: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc1234"));
        assert!(msg.contains("at least 1"));
    }
}

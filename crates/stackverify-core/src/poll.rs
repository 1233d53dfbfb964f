//! Bounded polling of asynchronous operations.
//!
//! Each attempt runs the operation's status query and classifies the state
//! of the first result as continue, success or failure. Diagnostics are
//! fetched only on the failure path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PollError;
use crate::node::field_texts;
use crate::obs;
use crate::query::{query_list, LiveStateQuery, QueryCommand, QueryOptions};

/// Classification of one observed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateClass {
    Continue,
    Success,
    Failure,
}

/// How to treat a state outside every listed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownState {
    Continue,
    Fail,
}

/// Terminal-state vocabulary of one kind of operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVocabulary {
    pub success: Vec<String>,
    pub failure: Vec<String>,
    pub continuing: Vec<String>,
    pub unknown: UnknownState,
}

impl StateVocabulary {
    /// Build pipelines: `SUCCESS` or `FAILURE`, anything else keeps polling.
    pub fn build() -> Self {
        Self {
            success: vec!["SUCCESS".to_string()],
            failure: vec!["FAILURE".to_string()],
            continuing: vec![
                "STATUS_UNKNOWN".to_string(),
                "PENDING".to_string(),
                "QUEUED".to_string(),
                "WORKING".to_string(),
            ],
            unknown: UnknownState::Continue,
        }
    }

    /// Progressive rollouts: `SUCCEEDED`, with `IN_PROGRESS` and
    /// `PENDING_RELEASE` still moving. Any other state is a failure.
    pub fn rollout() -> Self {
        Self {
            success: vec!["SUCCEEDED".to_string()],
            failure: Vec::new(),
            continuing: vec!["IN_PROGRESS".to_string(), "PENDING_RELEASE".to_string()],
            unknown: UnknownState::Fail,
        }
    }

    pub fn classify(&self, state: &str) -> StateClass {
        let listed = |set: &[String]| set.iter().any(|s| s == state);
        if listed(&self.success) {
            StateClass::Success
        } else if listed(&self.failure) {
            StateClass::Failure
        } else if listed(&self.continuing) {
            StateClass::Continue
        } else {
            match self.unknown {
                UnknownState::Continue => StateClass::Continue,
                UnknownState::Fail => StateClass::Failure,
            }
        }
    }
}

/// A pending operation, identified by the query that lists or describes it.
#[derive(Debug, Clone)]
pub struct AsyncOperation {
    /// Human name used in errors and logs, e.g. `rollout us-central1-development`.
    pub name: String,
    pub command: QueryCommand,
    pub options: QueryOptions,
    /// Path of the state field inside one result element.
    pub state_field: String,
    pub vocabulary: StateVocabulary,
}

impl AsyncOperation {
    pub fn new(
        name: impl Into<String>,
        command: QueryCommand,
        state_field: impl Into<String>,
        vocabulary: StateVocabulary,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            options: QueryOptions::default(),
            state_field: state_field.into(),
            vocabulary,
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl PollSettings {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

/// Successful termination of a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Queries issued, including the one that saw the success state.
    pub attempts: u32,
    pub state: String,
}

/// Source of diagnostic lines attached to a failed operation.
#[async_trait]
pub trait DiagnosticSource: Send + Sync {
    async fn fetch(&self, operation: &AsyncOperation, state: &str) -> Vec<String>;
}

/// Reads log entries and returns their text payloads.
pub struct LogDiagnostics {
    query: Arc<dyn LiveStateQuery>,
    command: QueryCommand,
    options: QueryOptions,
    payload_field: String,
}

impl LogDiagnostics {
    /// `logging read --project=<project>`.
    pub fn for_project(query: Arc<dyn LiveStateQuery>, project: &str) -> Self {
        Self {
            query,
            command: QueryCommand::parse("logging read").arg(format!("--project={project}")),
            options: QueryOptions::default(),
            payload_field: "textPayload".to_string(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl DiagnosticSource for LogDiagnostics {
    async fn fetch(&self, operation: &AsyncOperation, state: &str) -> Vec<String> {
        match query_list(self.query.as_ref(), &self.command, &self.options).await {
            Ok(entries) => {
                let lines: Vec<String> = field_texts(&entries, &self.payload_field)
                    .into_iter()
                    .filter(|line| !line.is_empty())
                    .collect();
                for line in &lines {
                    tracing::info!(operation = %operation.name, state = %state, "log: {line}");
                }
                lines
            }
            Err(err) => {
                tracing::warn!(operation = %operation.name, error = %err, "diagnostic fetch failed");
                vec![format!("diagnostics unavailable: {err}")]
            }
        }
    }
}

/// Drives asynchronous operations to a terminal state.
#[derive(Clone)]
pub struct Poller {
    query: Arc<dyn LiveStateQuery>,
}

impl Poller {
    pub fn new(query: Arc<dyn LiveStateQuery>) -> Self {
        Self { query }
    }

    /// Poll `operation` until it succeeds, fails, or attempts run out.
    ///
    /// An empty result counts as "not observable yet". There is no sleep
    /// after a terminal state or after the final attempt.
    pub async fn poll(
        &self,
        operation: &AsyncOperation,
        settings: PollSettings,
        diagnostics: Option<&dyn DiagnosticSource>,
    ) -> Result<PollOutcome, PollError> {
        if settings.max_attempts == 0 {
            return Err(PollError::InvalidSettings(format!(
                "{}: max_attempts must be at least 1",
                operation.name
            )));
        }

        let mut last_state: Option<String> = None;
        for attempt in 1..=settings.max_attempts {
            let results =
                query_list(self.query.as_ref(), &operation.command, &operation.options).await?;
            let state = results
                .first()
                .map(|latest| latest.get(&operation.state_field).text());
            obs::emit_poll_attempt(&operation.name, attempt, state.as_deref());

            if let Some(state) = state {
                match operation.vocabulary.classify(&state) {
                    StateClass::Success => {
                        obs::emit_poll_finished(&operation.name, attempt, "success");
                        return Ok(PollOutcome {
                            attempts: attempt,
                            state,
                        });
                    }
                    StateClass::Failure => {
                        obs::emit_poll_finished(&operation.name, attempt, "failure");
                        let diagnostics = match diagnostics {
                            Some(source) => source.fetch(operation, &state).await,
                            None => Vec::new(),
                        };
                        return Err(PollError::OperationFailed {
                            operation: operation.name.clone(),
                            state,
                            diagnostics,
                        });
                    }
                    StateClass::Continue => last_state = Some(state),
                }
            }

            if attempt < settings.max_attempts {
                tokio::time::sleep(settings.interval).await;
            }
        }

        obs::emit_poll_finished(&operation.name, settings.max_attempts, "timed_out");
        Err(PollError::TimedOut {
            operation: operation.name.clone(),
            attempts: settings.max_attempts,
            last_state,
        })
    }
}

//! In-memory fakes for the engine's external collaborators (testing only).
//!
//! Provides `ScriptedQuery`, `ScriptedRunner`, `MemoryProvisioner`,
//! `RecordingPusher` and `RecordingDiagnostics`. Scripted responses are
//! matched by the longest registered prefix of the rendered command line;
//! when a script holds several responses they are handed out in order and
//! the last one repeats.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ExecError, ProvisionError, PushError, QueryError};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::node::Node;
use crate::poll::{AsyncOperation, DiagnosticSource};
use crate::query::{LiveStateQuery, QueryCommand, QueryOptions};
use crate::source::{CommitId, PushRequest, SourcePusher};
use crate::stack::{OutputValue, Outputs, Provisioner, StackDefinition, StackId};

struct Script<T> {
    prefix: String,
    responses: VecDeque<T>,
}

fn next_response<T: Clone>(scripts: &mut [Script<T>], line: &str) -> Option<T> {
    let script = scripts
        .iter_mut()
        .filter(|s| line.starts_with(&s.prefix))
        .max_by_key(|s| s.prefix.len())?;
    if script.responses.len() > 1 {
        script.responses.pop_front()
    } else {
        script.responses.front().cloned()
    }
}

fn push_response<T>(scripts: &mut Vec<Script<T>>, prefix: &str, response: T) {
    match scripts.iter_mut().find(|s| s.prefix == prefix) {
        Some(script) => script.responses.push_back(response),
        None => scripts.push(Script {
            prefix: prefix.to_string(),
            responses: VecDeque::from([response]),
        }),
    }
}

// ---------------------------------------------------------------------------
// ScriptedQuery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum QueryResponse {
    Node(Node),
    Fail { exit_code: i32, stderr: String },
}

/// [`LiveStateQuery`] answering from per-command scripts.
///
/// Lines are matched as `command words + option args`, e.g.
/// `projects get-iam-policy p --flatten bindings --filter ... --format json`.
#[derive(Default)]
pub struct ScriptedQuery {
    scripts: Mutex<Vec<Script<QueryResponse>>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response for queries starting with `prefix`.
    pub fn respond(&self, prefix: &str, node: impl Into<Node>) -> &Self {
        let mut scripts = self.scripts.lock().unwrap();
        push_response(&mut scripts, prefix, QueryResponse::Node(node.into()));
        self
    }

    /// Queue a series of responses, handed out one per call.
    pub fn sequence<I>(&self, prefix: &str, nodes: I) -> &Self
    where
        I: IntoIterator<Item = Node>,
    {
        for node in nodes {
            self.respond(prefix, node);
        }
        self
    }

    /// Queue a failed response (non-zero exit).
    pub fn fail(&self, prefix: &str, exit_code: i32, stderr: &str) -> &Self {
        let mut scripts = self.scripts.lock().unwrap();
        push_response(
            &mut scripts,
            prefix,
            QueryResponse::Fail {
                exit_code,
                stderr: stderr.to_string(),
            },
        );
        self
    }

    /// Number of issued queries starting with `prefix`.
    pub fn calls(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    /// Every issued query line, in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveStateQuery for ScriptedQuery {
    async fn query(
        &self,
        command: &QueryCommand,
        options: &QueryOptions,
    ) -> Result<Node, QueryError> {
        let line = command.render(options);
        self.log.lock().unwrap().push(line.clone());
        let response = {
            let mut scripts = self.scripts.lock().unwrap();
            next_response(&mut scripts, &line)
        };
        match response {
            Some(QueryResponse::Node(node)) => Ok(node),
            Some(QueryResponse::Fail { exit_code, stderr }) => Err(QueryError::Failed {
                query: line,
                exit_code,
                stderr,
            }),
            None => Err(QueryError::Failed {
                query: line,
                exit_code: 1,
                stderr: "no scripted response".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// [`CommandRunner`] answering from scripts keyed by command-line prefix.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<Vec<Script<CommandOutput>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, prefix: &str, output: CommandOutput) -> &Self {
        let mut scripts = self.scripts.lock().unwrap();
        push_response(&mut scripts, prefix, output);
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        if spec.program.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        let line = spec.to_string();
        self.calls.lock().unwrap().push(spec.clone());
        let mut scripts = self.scripts.lock().unwrap();
        Ok(next_response(&mut scripts, &line)
            .unwrap_or_else(|| CommandOutput::failed(127, format!("no scripted response for `{line}`"))))
    }
}

// ---------------------------------------------------------------------------
// MemoryProvisioner
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StackScript {
    outputs: Outputs,
    apply_failures: VecDeque<String>,
    output_failure: Option<String>,
    teardown_failure: Option<String>,
    applies: usize,
    reads: usize,
    teardowns: usize,
    last_definition: Option<StackDefinition>,
}

/// In-memory [`Provisioner`] with scripted outputs and failures.
#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    stacks: Mutex<HashMap<StackId, StackScript>>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stack<R>(&self, id: impl Into<StackId>, f: impl FnOnce(&mut StackScript) -> R) -> R {
        let mut stacks = self.stacks.lock().unwrap();
        f(stacks.entry(id.into()).or_default())
    }

    /// Set the outputs the stack reports after apply or attach.
    pub fn set_outputs<'a, I>(&self, id: impl Into<StackId>, outputs: I)
    where
        I: IntoIterator<Item = (&'a str, OutputValue)>,
    {
        self.with_stack(id, |s| {
            s.outputs
                .extend(outputs.into_iter().map(|(k, v)| (k.to_string(), v)));
        });
    }

    /// Fail the next applies with these messages, in order.
    pub fn fail_apply<I, S>(&self, id: impl Into<StackId>, messages: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_stack(id, |s| {
            s.apply_failures.extend(messages.into_iter().map(Into::into));
        });
    }

    /// Fail every output read of the stack.
    pub fn fail_outputs(&self, id: impl Into<StackId>, message: &str) {
        self.with_stack(id, |s| s.output_failure = Some(message.to_string()));
    }

    pub fn fail_teardown(&self, id: impl Into<StackId>, message: &str) {
        self.with_stack(id, |s| s.teardown_failure = Some(message.to_string()));
    }

    pub fn apply_count(&self, id: impl Into<StackId>) -> usize {
        self.with_stack(id, |s| s.applies)
    }

    pub fn output_reads(&self, id: impl Into<StackId>) -> usize {
        self.with_stack(id, |s| s.reads)
    }

    pub fn teardown_count(&self, id: impl Into<StackId>) -> usize {
        self.with_stack(id, |s| s.teardowns)
    }

    /// Definition passed to the most recent call for this stack.
    pub fn last_definition(&self, id: impl Into<StackId>) -> Option<StackDefinition> {
        self.with_stack(id, |s| s.last_definition.clone())
    }
}

fn failed(operation: &str, definition: &StackDefinition, message: String) -> ProvisionError {
    ProvisionError::CommandFailed {
        operation: operation.to_string(),
        dir: definition.dir.clone(),
        message,
    }
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    async fn apply(&self, definition: &StackDefinition) -> Result<Outputs, ProvisionError> {
        self.with_stack(definition.id.clone(), |s| {
            s.applies += 1;
            s.last_definition = Some(definition.clone());
            match s.apply_failures.pop_front() {
                Some(message) => Err(failed("apply", definition, message)),
                None => Ok(s.outputs.clone()),
            }
        })
    }

    async fn outputs(&self, definition: &StackDefinition) -> Result<Outputs, ProvisionError> {
        let mut stacks = self.stacks.lock().unwrap();
        let Some(s) = stacks.get_mut(&definition.id) else {
            return Err(failed("output", definition, "no state recorded".to_string()));
        };
        s.reads += 1;
        s.last_definition = Some(definition.clone());
        match &s.output_failure {
            Some(message) => Err(failed("output", definition, message.clone())),
            None => Ok(s.outputs.clone()),
        }
    }

    async fn teardown(&self, definition: &StackDefinition) -> Result<(), ProvisionError> {
        self.with_stack(definition.id.clone(), |s| {
            s.teardowns += 1;
            match &s.teardown_failure {
                Some(message) => Err(failed("destroy", definition, message.clone())),
                None => Ok(()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingPusher
// ---------------------------------------------------------------------------

/// [`SourcePusher`] that records requests and returns a fixed commit.
#[derive(Debug)]
pub struct RecordingPusher {
    result: Result<CommitId, String>,
    requests: Mutex<Vec<PushRequest>>,
}

impl RecordingPusher {
    pub fn new(commit: &str) -> Self {
        Self {
            result: Ok(CommitId::new(commit)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(stderr: &str) -> Self {
        Self {
            result: Err(stderr.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<PushRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourcePusher for RecordingPusher {
    async fn push(&self, request: &PushRequest) -> Result<CommitId, PushError> {
        self.requests.lock().unwrap().push(request.clone());
        self.result.clone().map_err(|stderr| PushError::Git {
            step: "push".to_string(),
            stderr,
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingDiagnostics
// ---------------------------------------------------------------------------

/// [`DiagnosticSource`] returning fixed lines and counting fetches.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    lines: Vec<String>,
    fetches: Mutex<Vec<(String, String)>>,
}

impl RecordingDiagnostics {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    /// `(operation name, state)` of every fetch.
    pub fn fetched(&self) -> Vec<(String, String)> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiagnosticSource for RecordingDiagnostics {
    async fn fetch(&self, operation: &AsyncOperation, state: &str) -> Vec<String> {
        self.fetches
            .lock()
            .unwrap()
            .push((operation.name.clone(), state.to_string()));
        self.lines.clone()
    }
}

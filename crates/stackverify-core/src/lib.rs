//! stackverify core library
//!
//! Verification and polling engine for independently applied
//! infrastructure stacks: output access, live-state queries, expectation
//! checks, async operation polling, transient-error retry and concurrent
//! fan-out with per-unit failure isolation.

pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod exit_codes;
pub mod expect;
pub mod facts;
pub mod fakes;
pub mod node;
pub mod obs;
pub mod poll;
pub mod query;
pub mod report;
pub mod retry;
pub mod source;
pub mod stack;
pub mod telemetry;
pub mod unit;

pub use config::{load_config, FleetProject, VerifyConfig, DEFAULT_CONFIG_FILE};
pub use context::{KeyedStacks, StackCache, VerifyContext};
pub use error::{
    AggregateError, ConfigError, ExecError, PollError, ProvisionError, PushError, QueryError,
    StackError, VerifyError, VerifyResult,
};
pub use exec::{CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner};
pub use expect::{CheckOutcome, Predicate, Verifier};
pub use facts::{FactAggregator, FactTable, Facts, KeyShape, StackSource};
pub use node::{field_texts, Node};
pub use poll::{
    AsyncOperation, DiagnosticSource, LogDiagnostics, PollOutcome, PollSettings, Poller,
    StateClass, StateVocabulary, UnknownState,
};
pub use query::{query_list, GcloudQuery, LiveStateQuery, QueryCommand, QueryOptions};
pub use report::{RunReport, RunTotals};
pub use retry::{
    Backoff, ExponentialBackoff, FixedBackoff, RetryClassifier, RetryDecision, RetryPolicy,
    RetryRule,
};
pub use source::{CommitId, GitSourcePusher, PushRequest, SourcePusher};
pub use stack::{
    OutputValue, Outputs, Provisioner, StackDefinition, StackHandle, StackId, StackOutput,
    StackState, TerraformProvisioner,
};
pub use unit::{fan_out, run_unit, Finding, UnitBody, UnitReport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Structured lifecycle events for verification runs.
//!
//! Events are emitted at `info!` level with an `event` field so they can be
//! filtered out of JSON logs. Set `RUST_LOG=stackverify_core=debug` for the
//! per-command detail.

use std::time::Duration;

use tracing::{info, warn};

/// Tracing span for a unit, for attaching to a future with `.instrument()`.
pub fn unit_span(unit: &str) -> tracing::Span {
    tracing::info_span!("stackverify.unit", unit = %unit)
}

pub fn emit_run_started(run_id: &str, suites: &[String]) {
    info!(event = "run.started", run_id = %run_id, suites = ?suites);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, failures: usize, exit_code: i32) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        failures = failures,
        exit_code = exit_code,
    );
}

pub fn emit_unit_started(unit: &str) {
    info!(event = "unit.started", unit = %unit);
}

pub fn emit_unit_finished(unit: &str, checks: usize, failures: usize, fatal: bool) {
    info!(
        event = "unit.finished",
        unit = %unit,
        checks = checks,
        failures = failures,
        fatal = fatal,
    );
}

pub fn emit_check_failed(subject: &str, message: &str) {
    info!(event = "check.failed", subject = %subject, message = %message);
}

pub fn emit_poll_attempt(operation: &str, attempt: u32, state: Option<&str>) {
    info!(
        event = "poll.attempt",
        operation = %operation,
        attempt = attempt,
        state = state.unwrap_or("<empty>"),
    );
}

pub fn emit_poll_finished(operation: &str, attempts: u32, outcome: &str) {
    info!(
        event = "poll.finished",
        operation = %operation,
        attempts = attempts,
        outcome = %outcome,
    );
}

pub fn emit_apply_retry(stack: &str, attempt: u32, delay: Duration, error: &str) {
    info!(
        event = "apply.retry",
        stack = %stack,
        attempt = attempt,
        delay_secs = delay.as_secs(),
        error = %error,
    );
}

/// Teardown runs after assertions, so its errors are only warnings.
pub fn emit_stack_teardown_error(stack: &str, error: &dyn std::fmt::Display) {
    warn!(event = "stack.teardown_error", stack = %stack, error = %error);
}

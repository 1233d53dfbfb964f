//! Run-level reporting.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exit_codes;
use crate::obs;
use crate::unit::{Finding, UnitReport};

/// Outcome of one `stackverify run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub suites: Vec<UnitReport>,
}

/// Totals across every suite of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub checks: usize,
    pub failures: usize,
    pub fatal: usize,
}

impl RunReport {
    /// Start a run: fresh id, `started_at` now.
    pub fn start(suites: &[String]) -> Self {
        let run_id = Uuid::new_v4();
        obs::emit_run_started(&run_id.to_string(), suites);
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            suites: Vec::new(),
        }
    }

    /// Record the suite reports and stamp `finished_at`.
    pub fn finish(mut self, suites: Vec<UnitReport>) -> Self {
        self.suites = suites;
        self.finished_at = Utc::now();
        let totals = self.totals();
        let duration_ms = (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        obs::emit_run_finished(
            &self.run_id.to_string(),
            duration_ms,
            totals.failures + totals.fatal,
            self.exit_code(),
        );
        self
    }

    pub fn totals(&self) -> RunTotals {
        self.suites.iter().fold(RunTotals::default(), |acc, suite| RunTotals {
            checks: acc.checks + suite.check_count(),
            failures: acc.failures + suite.failure_count(),
            fatal: acc.fatal + suite.fatal_count(),
        })
    }

    pub fn passed(&self) -> bool {
        self.suites.iter().all(UnitReport::passed)
    }

    /// Fatal errors outrank check failures.
    pub fn exit_code(&self) -> i32 {
        let totals = self.totals();
        if totals.fatal > 0 {
            exit_codes::FATAL
        } else if totals.failures > 0 {
            exit_codes::CHECK_FAILURES
        } else {
            exit_codes::SUCCESS
        }
    }

    /// Human-readable summary listing every failure with its unit path.
    pub fn render_text(&self) -> String {
        let totals = self.totals();
        let mut out = String::new();
        let _ = writeln!(out, "run {}", self.run_id);
        for suite in &self.suites {
            let status = if suite.passed() { "PASS" } else { "FAIL" };
            let _ = writeln!(
                out,
                "  {status} {} ({} checks, {} failed, {} fatal)",
                suite.name,
                suite.check_count(),
                suite.failure_count(),
                suite.fatal_count()
            );
            for finding in suite.findings() {
                match finding {
                    Finding::Fatal { path, message } => {
                        let _ = writeln!(out, "    [fatal] {path}: {message}");
                    }
                    Finding::Failed { path, outcome } => {
                        let _ = writeln!(out, "    [check] {path}: {}", outcome.describe());
                    }
                }
            }
        }
        let _ = writeln!(
            out,
            "{} checks, {} failed, {} fatal",
            totals.checks, totals.failures, totals.fatal
        );
        out
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

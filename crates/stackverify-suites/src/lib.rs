//! stackverify suites
//!
//! Verification suites for the enterprise application blueprint stages,
//! built on `stackverify-core`. Each suite is one top-level unit whose
//! children are the per-environment, per-application or per-cluster units
//! it fans out to.

pub mod appfactory;
pub mod appsource;
pub mod bootstrap;
pub mod checks;
pub mod multitenant;
pub mod standalone;

use std::fmt;
use std::str::FromStr;

use stackverify_core::{run_unit, UnitReport, VerifyContext};

#[derive(Debug, thiserror::Error)]
#[error("unknown suite '{0}' (expected one of: multitenant, appfactory, appsource, standalone)")]
pub struct UnknownSuite(pub String);

/// A verification suite, in stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Suite {
    Multitenant,
    Appfactory,
    Appsource,
    Standalone,
}

impl Suite {
    pub const ALL: [Suite; 4] = [
        Suite::Multitenant,
        Suite::Appfactory,
        Suite::Appsource,
        Suite::Standalone,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Suite::Multitenant => multitenant::SUITE,
            Suite::Appfactory => appfactory::SUITE,
            Suite::Appsource => appsource::SUITE,
            Suite::Standalone => standalone::SUITE,
        }
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Suite {
    type Err = UnknownSuite;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Suite::ALL
            .into_iter()
            .find(|suite| suite.name() == s)
            .ok_or_else(|| UnknownSuite(s.to_string()))
    }
}

/// Run one suite. Errors and panics end up in the returned report.
pub async fn run_suite(ctx: &VerifyContext, suite: Suite) -> UnitReport {
    match suite {
        Suite::Multitenant => run_unit(suite.name(), multitenant::run(ctx)).await,
        Suite::Appfactory => run_unit(suite.name(), appfactory::run(ctx)).await,
        Suite::Appsource => run_unit(suite.name(), appsource::run(ctx)).await,
        Suite::Standalone => run_unit(suite.name(), standalone::run(ctx)).await,
    }
}

/// Run suites one after another; later stages read what earlier ones
/// applied. A failed suite does not stop the ones after it.
pub async fn run_suites(ctx: &VerifyContext, suites: &[Suite]) -> Vec<UnitReport> {
    let mut reports = Vec::with_capacity(suites.len());
    for suite in suites {
        let report = run_suite(ctx, *suite).await;
        tracing::info!(suite = %suite, passed = report.passed(), "suite finished");
        reports.push(report);
    }
    reports
}

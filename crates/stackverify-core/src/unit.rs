//! Units of work and fan-out.
//!
//! Every logical unit (one environment, one folder, one app service) runs
//! as its own task. A unit's fatal error or panic marks only that unit;
//! siblings keep running and the parent waits for all of them.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::error::{VerifyError, VerifyResult};
use crate::expect::{CheckOutcome, Verifier};
use crate::obs;

/// What a unit body produces: its own checks plus child reports.
#[derive(Debug, Default)]
pub struct UnitBody {
    pub checks: Verifier,
    pub children: Vec<UnitReport>,
}

impl UnitBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checks(checks: Verifier) -> Self {
        Self {
            checks,
            children: Vec::new(),
        }
    }

    pub fn add_children(&mut self, children: Vec<UnitReport>) {
        self.children.extend(children);
    }
}

/// Outcome tree of one unit and its descendants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub name: String,
    pub outcomes: Vec<CheckOutcome>,
    /// Set when the unit aborted; its checks may be incomplete.
    pub fatal: Option<String>,
    pub children: Vec<UnitReport>,
}

/// One problem found while walking a report tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Finding<'a> {
    Failed {
        path: String,
        outcome: &'a CheckOutcome,
    },
    Fatal {
        path: String,
        message: &'a str,
    },
}

impl UnitReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn fatal(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fatal: Some(message.into()),
            ..Self::default()
        }
    }

    fn from_body(name: String, body: UnitBody) -> Self {
        Self {
            name,
            outcomes: body.checks.into_outcomes(),
            fatal: None,
            children: body.children,
        }
    }

    /// No fatal error and no failed check anywhere in the tree.
    pub fn passed(&self) -> bool {
        self.fatal.is_none()
            && self.outcomes.iter().all(|o| o.passed)
            && self.children.iter().all(UnitReport::passed)
    }

    pub fn check_count(&self) -> usize {
        self.outcomes.len() + self.children.iter().map(UnitReport::check_count).sum::<usize>()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.passed).count()
            + self.children.iter().map(UnitReport::failure_count).sum::<usize>()
    }

    pub fn fatal_count(&self) -> usize {
        usize::from(self.fatal.is_some())
            + self.children.iter().map(UnitReport::fatal_count).sum::<usize>()
    }

    pub fn child(&self, name: &str) -> Option<&UnitReport> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Failed checks and fatal errors, depth first, with `/`-joined paths.
    pub fn findings(&self) -> Vec<Finding<'_>> {
        let mut out = Vec::new();
        self.collect_findings("", &mut out);
        out
    }

    fn collect_findings<'a>(&'a self, prefix: &str, out: &mut Vec<Finding<'a>>) {
        let path = if prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{prefix}/{}", self.name)
        };
        if let Some(message) = &self.fatal {
            out.push(Finding::Fatal {
                path: path.clone(),
                message,
            });
        }
        for outcome in self.outcomes.iter().filter(|o| !o.passed) {
            out.push(Finding::Failed {
                path: path.clone(),
                outcome,
            });
        }
        for child in &self.children {
            child.collect_findings(&path, out);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn execute<Fut>(path: String, name: String, body: Fut) -> UnitReport
where
    Fut: Future<Output = VerifyResult<UnitBody>>,
{
    obs::emit_unit_started(&path);
    let result = AssertUnwindSafe(body)
        .catch_unwind()
        .instrument(obs::unit_span(&path))
        .await;
    let report = match result {
        Ok(Ok(body)) => UnitReport::from_body(name, body),
        Ok(Err(VerifyError::Partial { body, source })) => {
            let mut report = UnitReport::from_body(name, *body);
            report.fatal = Some(source.to_string());
            report
        }
        Ok(Err(err)) => UnitReport::fatal(name, err.to_string()),
        Err(payload) => UnitReport::fatal(
            name,
            format!("unit panicked: {}", panic_message(payload.as_ref())),
        ),
    };
    obs::emit_unit_finished(
        &path,
        report.check_count(),
        report.failure_count(),
        report.fatal.is_some(),
    );
    report
}

/// Run a single unit, converting its error or panic into a fatal report.
pub async fn run_unit<Fut>(name: impl Into<String>, body: Fut) -> UnitReport
where
    Fut: Future<Output = VerifyResult<UnitBody>>,
{
    let name = name.into();
    execute(name.clone(), name, body).await
}

/// Spawn one task per `(name, item)` and wait for all of them.
///
/// Reports come back in item order. A child that errors or panics is
/// reported fatal; it never cancels its siblings.
pub async fn fan_out<I, N, T, F, Fut>(parent: &str, items: I, f: F) -> Vec<UnitReport>
where
    I: IntoIterator<Item = (N, T)>,
    N: Into<String>,
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = VerifyResult<UnitBody>> + Send + 'static,
{
    let f = Arc::new(f);
    let mut join_set = JoinSet::new();
    let mut names = Vec::new();
    for (idx, (name, item)) in items.into_iter().enumerate() {
        let name: String = name.into();
        names.push(name.clone());
        let path = format!("{parent}/{name}");
        let f = Arc::clone(&f);
        join_set.spawn(async move { (idx, execute(path, name, (*f)(item)).await) });
    }

    let mut slots: Vec<Option<UnitReport>> = vec![None; names.len()];
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((idx, report)) => slots[idx] = Some(report),
            Err(err) => tracing::error!(parent = %parent, error = %err, "unit task failed to join"),
        }
    }

    slots
        .into_iter()
        .zip(names)
        .map(|(slot, name)| slot.unwrap_or_else(|| UnitReport::fatal(name, "unit task was cancelled")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fan_out_isolates_fatal_and_panicking_children() {
        let items = vec![
            ("development", 0u8),
            ("non-production", 1),
            ("production", 2),
        ];
        let reports = fan_out("multitenant", items, |kind| async move {
            match kind {
                0 => {
                    let mut checks = Verifier::new();
                    checks.is_true("project", true, "active");
                    Ok(UnitBody::with_checks(checks))
                }
                1 => Err(VerifyError::Fatal("apply failed".to_string())),
                _ => panic!("boom"),
            }
        })
        .await;

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].name, "development");
        assert!(reports[0].passed());
        assert_eq!(reports[1].fatal.as_deref(), Some("apply failed"));
        assert!(reports[2].fatal.as_deref().unwrap_or_default().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_keeps_item_order_regardless_of_finish_order() {
        let items = (0..4u64).map(|i| (format!("folder-{i}"), i));
        let reports = fan_out("folders", items, |i| async move {
            tokio::time::sleep(Duration::from_secs(10 - i)).await;
            Ok(UnitBody::new())
        })
        .await;
        let names: Vec<_> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["folder-0", "folder-1", "folder-2", "folder-3"]);
    }

    #[tokio::test]
    async fn test_findings_carry_paths() {
        let mut checks = Verifier::new();
        checks.equal("folder 123", "a", "b", "reader binding");
        let child = UnitReport::from_body(
            "123".to_string(),
            UnitBody::with_checks(checks),
        );
        let mut parent = UnitReport::new("appfactory");
        parent.children.push(child);
        parent.children.push(UnitReport::fatal("456", "query failed"));

        assert!(!parent.passed());
        assert_eq!(parent.failure_count(), 1);
        assert_eq!(parent.fatal_count(), 1);
        let findings = parent.findings();
        assert_eq!(findings.len(), 2);
        assert!(matches!(&findings[0], Finding::Failed { path, .. } if path == "appfactory/123"));
        assert!(matches!(&findings[1], Finding::Fatal { path, message } if path == "appfactory/456" && *message == "query failed"));
    }

    #[tokio::test]
    async fn test_fatal_unit_keeps_checks_recorded_before_the_error() {
        let report = run_unit("membership m", async {
            let mut checks = Verifier::new();
            checks.is_false("node pool p", true, "no external ip");
            checks.is_true("cluster c", true, "private endpoint");
            let mut body = UnitBody::with_checks(Verifier::new());
            body.add_children(vec![UnitReport::new("nested")]);
            Err::<UnitBody, _>(
                VerifyError::Fatal("unknown node pool: spot".to_string())
                    .with_checks(checks)
                    .with_body(body),
            )
        })
        .await;
        assert_eq!(report.fatal.as_deref(), Some("unknown node pool: spot"));
        assert_eq!(report.check_count(), 2);
        assert_eq!(report.failure_count(), 1);
        assert_eq!(report.fatal_count(), 1);
        assert!(report.child("nested").is_some());
        assert_eq!(report.findings().len(), 2);
    }

    #[tokio::test]
    async fn test_run_unit_converts_error() {
        let report = run_unit("bootstrap", async {
            Err::<UnitBody, _>(VerifyError::Fatal("state bucket missing".to_string()))
        })
        .await;
        assert_eq!(report.name, "bootstrap");
        assert_eq!(report.fatal_count(), 1);
    }
}

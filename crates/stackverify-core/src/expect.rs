//! Expectation evaluation.
//!
//! Checks compute an actual value, compare it to an expected value or
//! predicate, and record a [`CheckOutcome`]. Nothing here panics or returns
//! early: a unit surfaces every violated expectation, not just the first.

use std::fmt::{self, Debug, Display};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::obs;

/// Predicate kind a check was evaluated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Equal,
    Subset,
    Contains,
    NonEmpty,
    Matches,
    Count,
    IsTrue,
    IsFalse,
    /// The query feeding the check failed outright.
    QueryError,
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Predicate::Equal => "equal",
            Predicate::Subset => "subset",
            Predicate::Contains => "contains",
            Predicate::NonEmpty => "non_empty",
            Predicate::Matches => "matches",
            Predicate::Count => "count",
            Predicate::IsTrue => "is_true",
            Predicate::IsFalse => "is_false",
            Predicate::QueryError => "query_error",
        };
        f.write_str(s)
    }
}

/// Result of one expectation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    /// Resource identifier the check is about.
    pub subject: String,
    pub predicate: Predicate,
    pub expected: String,
    pub actual: String,
    pub message: String,
}

impl CheckOutcome {
    /// One-line human description naming subject, expected and actual.
    pub fn describe(&self) -> String {
        format!(
            "{}: {} [{}: expected {}, actual {}]",
            self.subject, self.message, self.predicate, self.expected, self.actual
        )
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Accumulates check outcomes for one unit of work.
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    outcomes: Vec<CheckOutcome>,
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(
        &mut self,
        passed: bool,
        subject: String,
        predicate: Predicate,
        expected: String,
        actual: String,
        message: String,
    ) -> bool {
        let outcome = CheckOutcome {
            passed,
            subject,
            predicate,
            expected,
            actual,
            message,
        };
        if !passed {
            obs::emit_check_failed(&outcome.subject, &outcome.describe());
        }
        self.outcomes.push(outcome);
        passed
    }

    /// `actual == expected`.
    pub fn equal<E, A>(
        &mut self,
        subject: impl Into<String>,
        expected: E,
        actual: A,
        message: impl Into<String>,
    ) -> bool
    where
        E: PartialEq<A> + Debug,
        A: Debug,
    {
        let passed = expected == actual;
        self.record(
            passed,
            subject.into(),
            Predicate::Equal,
            format!("{expected:?}"),
            format!("{actual:?}"),
            message.into(),
        )
    }

    /// Every item of `expected` appears in `actual`. Failures list each
    /// missing item.
    pub fn subset<E, A>(
        &mut self,
        subject: impl Into<String>,
        expected: &[E],
        actual: &[A],
        message: impl Into<String>,
    ) -> bool
    where
        E: AsRef<str>,
        A: AsRef<str>,
    {
        let missing: Vec<&str> = expected
            .iter()
            .map(|item| item.as_ref())
            .filter(|want| !actual.iter().any(|have| have.as_ref() == *want))
            .collect();
        let mut message = message.into();
        if !missing.is_empty() {
            message = format!("{message} (missing: {missing:?})");
        }
        self.record(
            missing.is_empty(),
            subject.into(),
            Predicate::Subset,
            format!("{:?}", as_strs(expected)),
            format!("{:?}", as_strs(actual)),
            message,
        )
    }

    /// `items` contains `item`.
    pub fn contains<A: AsRef<str>>(
        &mut self,
        subject: impl Into<String>,
        items: &[A],
        item: &str,
        message: impl Into<String>,
    ) -> bool {
        let passed = items.iter().any(|i| i.as_ref() == item);
        self.record(
            passed,
            subject.into(),
            Predicate::Contains,
            format!("{item:?}"),
            format!("{:?}", as_strs(items)),
            message.into(),
        )
    }

    pub fn non_empty<T: Debug>(
        &mut self,
        subject: impl Into<String>,
        items: &[T],
        message: impl Into<String>,
    ) -> bool {
        self.record(
            !items.is_empty(),
            subject.into(),
            Predicate::NonEmpty,
            "at least 1 item".to_string(),
            format!("{} item(s)", items.len()),
            message.into(),
        )
    }

    /// `pattern` matches `actual`.
    pub fn matches(
        &mut self,
        subject: impl Into<String>,
        pattern: &Regex,
        actual: &str,
        message: impl Into<String>,
    ) -> bool {
        self.record(
            pattern.is_match(actual),
            subject.into(),
            Predicate::Matches,
            format!("/{}/", pattern.as_str()),
            format!("{actual:?}"),
            message.into(),
        )
    }

    /// `items` holds exactly `n` elements.
    pub fn count<T: Debug>(
        &mut self,
        subject: impl Into<String>,
        n: usize,
        items: &[T],
        message: impl Into<String>,
    ) -> bool {
        self.record(
            items.len() == n,
            subject.into(),
            Predicate::Count,
            format!("{n} item(s)"),
            format!("{} item(s): {items:?}", items.len()),
            message.into(),
        )
    }

    pub fn is_true(
        &mut self,
        subject: impl Into<String>,
        actual: bool,
        message: impl Into<String>,
    ) -> bool {
        self.record(
            actual,
            subject.into(),
            Predicate::IsTrue,
            "true".to_string(),
            actual.to_string(),
            message.into(),
        )
    }

    pub fn is_false(
        &mut self,
        subject: impl Into<String>,
        actual: bool,
        message: impl Into<String>,
    ) -> bool {
        self.record(
            !actual,
            subject.into(),
            Predicate::IsFalse,
            "false".to_string(),
            actual.to_string(),
            message.into(),
        )
    }

    /// Record a query failure as a failed check tied to `subject`.
    pub fn record_error(&mut self, subject: impl Into<String>, error: &dyn Display) -> bool {
        self.record(
            false,
            subject.into(),
            Predicate::QueryError,
            "query to succeed".to_string(),
            error.to_string(),
            "query failed".to_string(),
        )
    }

    /// Take another verifier's outcomes, keeping order.
    pub fn absorb(&mut self, other: Verifier) {
        self.outcomes.extend(other.outcomes);
    }

    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failures(&self) -> Vec<&CheckOutcome> {
        self.outcomes.iter().filter(|o| !o.passed).collect()
    }

    pub fn outcomes(&self) -> &[CheckOutcome] {
        &self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn into_outcomes(self) -> Vec<CheckOutcome> {
        self.outcomes
    }
}

fn as_strs<S: AsRef<str>>(items: &[S]) -> Vec<&str> {
    items.iter().map(|item| item.as_ref()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subset_passes_when_all_present() {
        let mut v = Verifier::new();
        assert!(v.subset("project p-1", &["a", "b"], &["a", "b", "c"], "APIs should be enabled"));
        assert!(v.passed());
    }

    #[test]
    fn test_subset_names_missing_item() {
        let mut v = Verifier::new();
        assert!(!v.subset("project p-1", &["a", "d"], &["a", "b", "c"], "APIs should be enabled"));
        let failures = v.failures();
        assert_eq!(failures.len(), 1);
        let text = failures[0].describe();
        assert!(text.contains("missing: [\"d\"]"), "{text}");
        assert!(!text.contains("missing: [\"a\""), "{text}");
        assert!(text.contains("project p-1"));
    }

    #[test]
    fn test_failures_accumulate_without_stopping() {
        let mut v = Verifier::new();
        v.equal("cluster c-1", "SURGE", "BLUE_GREEN".to_string(), "strategy should be SURGE");
        v.equal("cluster c-1", "1", "1".to_string(), "max surge should be 1");
        v.is_true("cluster c-1", false, "autoscaling should be enabled");
        v.is_false("sa bank-of-anthos", false, "should not be disabled");
        assert_eq!(v.len(), 4);
        assert_eq!(v.failures().len(), 2);
        assert!(!v.passed());
        let failures = v.failures();
        let first = failures[0];
        assert_eq!(first.expected, "\"SURGE\"");
        assert_eq!(first.actual, "\"BLUE_GREEN\"");
    }

    #[test]
    fn test_equal_on_lists_is_order_sensitive() {
        let mut v = Verifier::new();
        let actual = vec!["DEPLOYMENT".to_string(), "SYSTEM_COMPONENTS".to_string()];
        assert!(!v.equal(
            "cluster c-1",
            vec!["SYSTEM_COMPONENTS", "DEPLOYMENT"],
            actual,
            "monitoring components"
        ));
    }

    #[test]
    fn test_matches_count_and_non_empty() {
        let mut v = Verifier::new();
        let sa = Regex::new(r"^[a-zA-Z0-9_+-]+@[a-zA-Z0-9-]+.iam.gserviceaccount.com$").unwrap();
        assert!(v.matches("cluster sa", &sa, "gke-sa@eab-gke-dev.iam.gserviceaccount.com", "email"));
        assert!(!v.matches("cluster sa", &sa, "not-an-email", "email"));
        assert!(v.count("sa bank-of-anthos", 2, &["a", "b"], "two users"));
        assert!(!v.count("sa bank-of-anthos", 2, &["a", "b", "c"], "two users"));
        let empty: Vec<String> = Vec::new();
        assert!(!v.non_empty("cluster service accounts", &empty, "must not be empty"));
        assert_eq!(v.failures().len(), 3);
    }

    #[test]
    fn test_contains_and_record_error() {
        let mut v = Verifier::new();
        let members = vec!["serviceAccount:tf-cb@p.iam.gserviceaccount.com".to_string()];
        assert!(v.contains(
            "repo eab-app",
            &members,
            "serviceAccount:tf-cb@p.iam.gserviceaccount.com",
            "viewer"
        ));
        v.record_error("repo eab-app", &"query `gcloud source repos describe` exited with code 1");
        let failures = v.failures();
        let failure = failures[0];
        assert_eq!(failure.predicate, Predicate::QueryError);
        assert!(failure.actual.contains("source repos describe"));
    }

    #[test]
    fn test_absorb_keeps_order() {
        let mut a = Verifier::new();
        a.is_true("x", true, "first");
        let mut b = Verifier::new();
        b.is_true("y", false, "second");
        a.absorb(b);
        let subjects: Vec<_> = a.outcomes().iter().map(|o| o.subject.as_str()).collect();
        assert_eq!(subjects, vec!["x", "y"]);
    }
}

//! Transient-failure classification for stack applies.
//!
//! A failed apply is retried only when its message matches one of the
//! classifier's rules; everything else is permanent and escalates at once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

/// Transient conditions commonly reported by the cloud provider while
/// resources, IAM bindings or org policies are still propagating.
const TRANSIENT_PATTERNS: &[(&str, &str)] = &[
    (r".*rateLimitExceeded.*", "API rate limit exceeded"),
    (
        r".*Error 403.*Request is prohibited by organization's policy.*",
        "org policy not yet propagated",
    ),
    (
        r".*Error 400.*Service account service-.*@gs-project-accounts.iam.gserviceaccount.com does not exist.*",
        "storage service agent not yet created",
    ),
    (r".*Error code 16.*", "unauthenticated, credentials still propagating"),
    (
        r".*FOLDER_TO_DELETE_NON_EMPTY_VIOLATION.*",
        "folder deletion raced its children",
    ),
    (r".*Error 400.*Invalid service account.*", "service account not yet visible"),
    (
        r".*Error 409.*Failed to create cloud build trigger.*",
        "build trigger creation conflict",
    ),
    (
        r".*Error 403.*Permission 'iam.serviceAccounts.actAs' denied.*",
        "actAs permission still propagating",
    ),
    (
        r".*Error waiting for Create .*: Error code 13.*",
        "internal error while waiting for create",
    ),
    (r".*Error 429.*", "too many requests"),
    (
        r".*does not have serviceusage.services.use access.*",
        "service usage permission still propagating",
    ),
];

/// One transient-error pattern.
#[derive(Debug, Clone)]
pub struct RetryRule {
    pub pattern: Regex,
    pub description: String,
}

impl RetryRule {
    pub fn new(pattern: &str, description: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            description: description.into(),
        })
    }
}

/// Decides whether a failure message describes a transient condition.
#[derive(Debug, Clone, Default)]
pub struct RetryClassifier {
    rules: Vec<RetryRule>,
}

impl RetryClassifier {
    pub fn new(rules: Vec<RetryRule>) -> Self {
        Self { rules }
    }

    /// Classifier with the built-in transient provider patterns.
    pub fn transient_defaults() -> Self {
        let rules = TRANSIENT_PATTERNS
            .iter()
            .filter_map(|(pattern, description)| RetryRule::new(pattern, *description).ok())
            .collect();
        Self { rules }
    }

    /// Add user-supplied patterns on top of the current rules.
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref();
            self.rules.push(RetryRule::new(pattern, format!("configured: {pattern}"))?);
        }
        Ok(self)
    }

    pub fn rules(&self) -> &[RetryRule] {
        &self.rules
    }

    /// First rule matching `message`, if any.
    pub fn matching_rule(&self, message: &str) -> Option<&RetryRule> {
        self.rules.iter().find(|rule| rule.pattern.is_match(message))
    }

    pub fn is_retryable(&self, message: &str) -> bool {
        self.matching_rule(message).is_some()
    }
}

/// Delay before retry number `attempt` (1 = after the first failure).
pub trait Backoff: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

/// The same delay between every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Doubling delay, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << shift)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }
}

/// Outcome of consulting a [`RetryPolicy`] after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    Retry(Duration),
    /// Stop. `retryable` tells whether the error was transient (and the
    /// budget ran out) or permanent.
    GiveUp { retryable: bool },
}

/// Attempt cap plus backoff for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub classifier: RetryClassifier,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Arc<dyn Backoff>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            classifier: RetryClassifier::transient_defaults(),
            max_attempts: 3,
            backoff: Arc::new(FixedBackoff(Duration::from_secs(120))),
        }
    }
}

impl RetryPolicy {
    /// Single attempt; nothing is ever retried.
    pub fn none() -> Self {
        Self {
            classifier: RetryClassifier::default(),
            max_attempts: 1,
            backoff: Arc::new(FixedBackoff(Duration::ZERO)),
        }
    }

    /// Decide what to do after `attempt` (1-based) failed with `message`.
    pub fn should_retry(&self, message: &str, attempt: u32) -> RetryDecision {
        let Some(rule) = self.classifier.matching_rule(message) else {
            return RetryDecision::GiveUp { retryable: false };
        };
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp { retryable: true };
        }
        tracing::debug!(rule = %rule.description, attempt, "transient failure");
        RetryDecision::Retry(self.backoff.delay(attempt))
    }
}

//! Test outcomes and run summaries.
//!
//! Every test case receives exactly one [`ExecutionOutcome`]. Outcomes are
//! wrapped into [`CaseResult`]s for the result sink and folded into an
//! [`AggregateSummary`], whose one-line rendering is also the terminal
//! summary line a parallel worker leaves behind.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Terminal status of one test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Aborted,
    Skipped,
}

impl Outcome {
    /// Pass and Skipped leave the environment fit for reuse.
    pub fn is_pass_like(&self) -> bool {
        matches!(self, Outcome::Pass | Outcome::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
            Outcome::Aborted => "ABORTED",
            Outcome::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of running one test case.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExecutionOutcome {
    pub outcome: Outcome,

    /// Free-text summary (error message, skip reason, ...).
    pub summary: String,

    /// Structured payload reported by the test script.
    pub telemetry: Option<serde_json::Value>,
}

impl ExecutionOutcome {
    pub fn new(outcome: Outcome, summary: impl Into<String>) -> Self {
        Self {
            outcome,
            summary: summary.into(),
            telemetry: None,
        }
    }

    pub fn pass(summary: impl Into<String>) -> Self {
        Self::new(Outcome::Pass, summary)
    }

    pub fn fail(summary: impl Into<String>) -> Self {
        Self::new(Outcome::Fail, summary)
    }

    pub fn aborted(summary: impl Into<String>) -> Self {
        Self::new(Outcome::Aborted, summary)
    }

    pub fn skipped(summary: impl Into<String>) -> Self {
        Self::new(Outcome::Skipped, summary)
    }

    pub fn with_telemetry(mut self, telemetry: serde_json::Value) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// What the result sink receives for each test case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseResult {
    /// Test case name.
    pub name: String,

    /// Iteration index when the run repeats tests.
    pub iteration: Option<u32>,

    /// Label of the setup group the test ran in.
    pub group: String,

    /// Environment the test ran against, if one was provisioned.
    pub environment: Option<String>,

    pub outcome: Outcome,

    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,

    pub summary: String,

    pub telemetry: Option<serde_json::Value>,
}

fn serialize_secs<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(duration.as_secs_f64())
}

impl CaseResult {
    /// Name including the iteration index, if any.
    pub fn display_name(&self) -> String {
        match self.iteration {
            Some(iteration) => format!("{}#{}", self.name, iteration),
            None => self.name.clone(),
        }
    }
}

/// An environment that could not be destroyed.
///
/// Surfaced in the final summary so orphaned resources can be found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub resource: String,
    pub reason: String,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.reason)
    }
}

/// Outcome counters plus elapsed time.
///
/// The [`Display`](fmt::Display) form is a single terminal summary line that
/// [`FromStr`] parses back:
///
/// ```
/// use fleetrun::outcome::AggregateSummary;
///
/// let line = "Summary: passed=3 failed=1 aborted=0 skipped=2 elapsed=12.5s";
/// let summary: AggregateSummary = line.parse().unwrap();
/// assert_eq!(summary.passed, 3);
/// assert_eq!(summary.total(), 6);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AggregateSummary {
    pub passed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub skipped: usize,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl AggregateSummary {
    /// Counts one outcome.
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Pass => self.passed += 1,
            Outcome::Fail => self.failed += 1,
            Outcome::Aborted => self.aborted += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }

    /// Adds another summary's counters. Elapsed time keeps the longer of the two,
    /// since merged workers run side by side.
    pub fn merge(&mut self, other: &AggregateSummary) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.aborted += other.aborted;
        self.skipped += other.skipped;
        self.elapsed = self.elapsed.max(other.elapsed);
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.aborted + self.skipped
    }

    /// No test failed or aborted.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.aborted == 0
    }

    /// Conventional process exit code for this summary.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

impl fmt::Display for AggregateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Summary: passed={} failed={} aborted={} skipped={} elapsed={:.1}s",
            self.passed,
            self.failed,
            self.aborted,
            self.skipped,
            self.elapsed.as_secs_f64()
        )
    }
}

static SUMMARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Summary: passed=(\d+) failed=(\d+) aborted=(\d+) skipped=(\d+)(?: elapsed=([0-9.]+)s)?",
    )
    .expect("summary line pattern is valid")
});

/// A string that does not contain a summary line.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("no summary line found in {0:?}")]
pub struct SummaryParseError(pub String);

impl FromStr for AggregateSummary {
    type Err = SummaryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = SUMMARY_LINE
            .captures(s)
            .ok_or_else(|| SummaryParseError(s.to_string()))?;

        let count = |idx: usize| -> Result<usize, SummaryParseError> {
            caps[idx]
                .parse()
                .map_err(|_| SummaryParseError(s.to_string()))
        };

        let elapsed = caps
            .get(5)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or_default();

        Ok(Self {
            passed: count(1)?,
            failed: count(2)?,
            aborted: count(3)?,
            skipped: count(4)?,
            elapsed,
        })
    }
}

/// Finds the last summary line in a worker's output.
pub fn find_summary_line(text: &str) -> Option<AggregateSummary> {
    text.lines().rev().find_map(|line| line.parse().ok())
}

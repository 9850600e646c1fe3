//! Verdicts and the run report.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::TestKind;

/// How a test ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Passed,
    Failed,
    /// Not run: dependency outcome, run-mode filter, or cancellation.
    Skipped,
    /// A setup step did not behave as needed.
    SetupFailed,
    /// Transport failure; nothing can be said about the cache.
    Inconclusive,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::SetupFailed => "setup_failed",
            Self::Inconclusive => "inconclusive",
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub id: String,
    pub name: String,
    pub kind: TestKind,
    /// `None` when the test yielded no pass/fail.
    pub passed: Option<bool>,
    pub status: VerdictStatus,
    pub detail: String,
    /// Kind a failure counts as; differs from `kind` under the `required`
    /// setup_tests policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<TestKind>,
}

impl Verdict {
    fn new(id: &str, name: &str, kind: TestKind, status: VerdictStatus, detail: impl Into<String>) -> Self {
        let passed = match status {
            VerdictStatus::Passed => Some(true),
            VerdictStatus::Failed => Some(false),
            _ => None,
        };
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            passed,
            status,
            detail: detail.into(),
            failure_kind: None,
        }
    }

    pub fn passed(id: &str, name: &str, kind: TestKind) -> Self {
        Self::new(id, name, kind, VerdictStatus::Passed, "")
    }

    pub fn failed(id: &str, name: &str, kind: TestKind, counts_as: TestKind, detail: impl Into<String>) -> Self {
        let mut verdict = Self::new(id, name, kind, VerdictStatus::Failed, detail);
        verdict.failure_kind = Some(counts_as);
        verdict
    }

    pub fn skipped(id: &str, name: &str, kind: TestKind, detail: impl Into<String>) -> Self {
        Self::new(id, name, kind, VerdictStatus::Skipped, detail)
    }

    pub fn setup_failed(id: &str, name: &str, kind: TestKind, detail: impl Into<String>) -> Self {
        Self::new(id, name, kind, VerdictStatus::SetupFailed, detail)
    }

    pub fn inconclusive(id: &str, name: &str, kind: TestKind, detail: impl Into<String>) -> Self {
        Self::new(id, name, kind, VerdictStatus::Inconclusive, detail)
    }

    /// Kind a failure is reported under.
    pub fn counts_as(&self) -> TestKind {
        self.failure_kind.unwrap_or(self.kind)
    }
}

/// Aggregated counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub required_failures: usize,
    pub optimal_misses: usize,
    /// `check` tests whose behavior was observed.
    pub checks_observed: usize,
    /// `check` tests whose behavior was not observed.
    pub checks_not_observed: usize,
    /// Dependency skips, mode-filtered tests and cancellations.
    pub skipped: usize,
    pub setup_failures: usize,
    pub inconclusive: usize,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub target: String,
    pub verdicts: Vec<Verdict>,
    pub summary: Summary,
}

impl RunReport {
    /// Build the report; every verdict lands in exactly one bucket.
    pub fn new(run_id: impl Into<String>, target: impl Into<String>, verdicts: Vec<Verdict>) -> Self {
        let mut summary = Summary {
            total: verdicts.len(),
            ..Summary::default()
        };
        for verdict in &verdicts {
            match (verdict.status, verdict.kind) {
                (VerdictStatus::Passed, TestKind::Check) => summary.checks_observed += 1,
                (VerdictStatus::Passed, _) => summary.passed += 1,
                (VerdictStatus::Failed, _) => match verdict.counts_as() {
                    TestKind::Required => summary.required_failures += 1,
                    TestKind::Optimal => summary.optimal_misses += 1,
                    TestKind::Check => summary.checks_not_observed += 1,
                },
                (VerdictStatus::Skipped, _) => summary.skipped += 1,
                (VerdictStatus::SetupFailed, _) => summary.setup_failures += 1,
                (VerdictStatus::Inconclusive, _) => summary.inconclusive += 1,
            }
        }
        Self {
            run_id: run_id.into(),
            target: target.into(),
            verdicts,
            summary,
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn verdict(&self, id: &str) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| v.id == id)
    }

    /// Whether the run found a conformance violation.
    pub fn has_required_failures(&self) -> bool {
        self.summary.required_failures > 0
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cache-tests run {} against {}", self.run_id, self.target)?;
        for verdict in &self.verdicts {
            let mark = match verdict.status {
                VerdictStatus::Passed => "ok",
                VerdictStatus::Failed => "FAIL",
                VerdictStatus::Skipped => "skip",
                VerdictStatus::SetupFailed => "setup",
                VerdictStatus::Inconclusive => "??",
            };
            write!(f, "  [{:>5}] {:<8} {}", mark, verdict.kind.as_str(), verdict.id)?;
            if !verdict.detail.is_empty() {
                write!(f, " - {}", verdict.detail)?;
            }
            writeln!(f)?;
        }
        let s = &self.summary;
        writeln!(
            f,
            "{} tests: {} passed, {} required failures, {} optimal misses, checks {}/{} observed",
            s.total,
            s.passed,
            s.required_failures,
            s.optimal_misses,
            s.checks_observed,
            s.checks_observed + s.checks_not_observed
        )?;
        write!(
            f,
            "{} skipped, {} setup failures, {} inconclusive",
            s.skipped, s.setup_failures, s.inconclusive
        )
    }
}

//! Execution run record
//!
//! A `TestRun` is what the UI reads while and after tests execute: which
//! entities were started, the first terminal result per entity, subtest
//! results, per-file coverage, and runner output. Results never change tree
//! shape.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::process::OutputSink;
use crate::tree::SourceLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestState {
    Passed,
    Failed,
    Errored,
    Skipped,
}

impl std::fmt::Display for TestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestState::Passed => write!(f, "passed"),
            TestState::Failed => write!(f, "failed"),
            TestState::Errored => write!(f, "errored"),
            TestState::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestMessage {
    pub text: String,
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    pub state: TestState,
    pub message: Option<TestMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtestResult {
    pub parent: String,
    pub name: String,
    pub passed: bool,
    pub message: Option<TestMessage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubtestStats {
    pub passed: usize,
    pub failed: usize,
}

/// Covered out of total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoverageCount {
    pub covered: u64,
    pub total: u64,
}

/// One executable line; `line` is zero-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatementCoverage {
    pub line: u32,
    pub covered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCoverage {
    pub path: String,
    pub lines: CoverageCount,
    /// Absent when the runner did not collect branch coverage
    pub branches: Option<CoverageCount>,
    pub statements: Vec<StatementCoverage>,
}

impl FileCoverage {
    /// A line is covered if either report covered it. Branch counts cannot
    /// be combined exactly, so the better-covered report is kept.
    pub fn merge(&mut self, other: FileCoverage) {
        let mut lines: BTreeMap<u32, bool> = BTreeMap::new();
        for statement in self.statements.drain(..).chain(other.statements) {
            *lines.entry(statement.line).or_default() |= statement.covered;
        }
        self.statements = lines
            .into_iter()
            .map(|(line, covered)| StatementCoverage { line, covered })
            .collect();
        self.lines = CoverageCount {
            covered: self.statements.iter().filter(|s| s.covered).count() as u64,
            total: self.statements.len() as u64,
        };
        self.branches = match (self.branches, other.branches) {
            (Some(a), Some(b)) => Some(if b.covered > a.covered { b } else { a }),
            (a, b) => a.or(b),
        };
    }
}

/// Observable transitions, in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunEvent {
    Started(String),
    Result { entity: String, state: TestState },
    Subtest { parent: String, name: String, passed: bool },
    Coverage(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    pub not_run: usize,
}

#[derive(Debug, Default)]
struct RunState {
    started: HashSet<String>,
    results: HashMap<String, TestResult>,
    subtests: Vec<SubtestResult>,
    subtest_stats: HashMap<String, SubtestStats>,
    events: Vec<RunEvent>,
    coverage: BTreeMap<String, FileCoverage>,
    output: String,
    ended_at: Option<DateTime<Utc>>,
}

/// One execution run over a set of run ids
#[derive(Debug)]
pub struct TestRun {
    id: String,
    requested: HashSet<String>,
    started_at: DateTime<Utc>,
    state: Mutex<RunState>,
}

impl TestRun {
    /// New run over `run_ids`; results for other run ids are refused
    pub fn new<I, S>(run_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            requested: run_ids.into_iter().map(Into::into).collect(),
            started_at: Utc::now(),
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_requested(&self, run_id: &str) -> bool {
        self.requested.contains(run_id)
    }

    /// Mark an entity as started. Repeated marks are no-ops.
    pub fn started(&self, entity: &str) -> bool {
        let mut state = self.state.lock();
        if state.started.insert(entity.to_string()) {
            state.events.push(RunEvent::Started(entity.to_string()));
            true
        } else {
            false
        }
    }

    /// Record a terminal result. The first result per entity wins.
    pub fn record(&self, entity: &str, result: TestResult) -> bool {
        let mut state = self.state.lock();
        if state.results.contains_key(entity) {
            trace!("Ignoring second result for {}", entity);
            return false;
        }
        state.events.push(RunEvent::Result {
            entity: entity.to_string(),
            state: result.state,
        });
        state.results.insert(entity.to_string(), result);
        true
    }

    pub fn record_subtest(&self, result: SubtestResult) {
        let mut state = self.state.lock();
        let stats = state.subtest_stats.entry(result.parent.clone()).or_default();
        if result.passed {
            stats.passed += 1;
        } else {
            stats.failed += 1;
        }
        state.events.push(RunEvent::Subtest {
            parent: result.parent.clone(),
            name: result.name.clone(),
            passed: result.passed,
        });
        state.subtests.push(result);
    }

    /// Store coverage for a file. Parallel batches can each report the same
    /// file; those reports are merged.
    pub fn add_coverage(&self, file: FileCoverage) {
        let mut state = self.state.lock();
        state.events.push(RunEvent::Coverage(file.path.clone()));
        match state.coverage.get_mut(&file.path) {
            Some(existing) => {
                trace!("Merging coverage for {}", file.path);
                existing.merge(file);
            }
            None => {
                state.coverage.insert(file.path.clone(), file);
            }
        }
    }

    pub fn coverage(&self) -> Vec<FileCoverage> {
        self.state.lock().coverage.values().cloned().collect()
    }

    pub fn file_coverage(&self, path: &str) -> Option<FileCoverage> {
        self.state.lock().coverage.get(path).cloned()
    }

    pub fn append_output(&self, text: &str) {
        self.state.lock().output.push_str(text);
    }

    /// Close the run
    pub fn end(&self) {
        let mut state = self.state.lock();
        if state.ended_at.is_none() {
            state.ended_at = Some(Utc::now());
            debug!("Run {} ended with {} results", self.id, state.results.len());
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().ended_at.is_some()
    }

    pub fn result(&self, entity: &str) -> Option<TestResult> {
        self.state.lock().results.get(entity).cloned()
    }

    pub fn is_started(&self, entity: &str) -> bool {
        self.state.lock().started.contains(entity)
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.state.lock().events.clone()
    }

    pub fn subtests(&self) -> Vec<SubtestResult> {
        self.state.lock().subtests.clone()
    }

    pub fn subtest_stats(&self, parent: &str) -> Option<SubtestStats> {
        self.state.lock().subtest_stats.get(parent).copied()
    }

    pub fn output(&self) -> String {
        self.state.lock().output.clone()
    }

    /// Tally of results; started entities without one count as not run
    pub fn summary(&self) -> RunSummary {
        let state = self.state.lock();
        let mut summary = RunSummary::default();
        for result in state.results.values() {
            match result.state {
                TestState::Passed => summary.passed += 1,
                TestState::Failed => summary.failed += 1,
                TestState::Errored => summary.errored += 1,
                TestState::Skipped => summary.skipped += 1,
            }
        }
        summary.not_run = state
            .started
            .iter()
            .filter(|id| !state.results.contains_key(*id))
            .count();
        summary
    }
}

impl OutputSink for TestRun {
    fn append(&self, text: &str) {
        self.append_output(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed() -> TestResult {
        TestResult {
            state: TestState::Passed,
            message: None,
        }
    }

    #[test]
    fn test_first_result_wins() {
        let run = TestRun::new(["t1"]);
        assert!(run.record("t1", passed()));
        assert!(!run.record(
            "t1",
            TestResult {
                state: TestState::Errored,
                message: None,
            }
        ));
        assert_eq!(run.result("t1").unwrap().state, TestState::Passed);
        assert_eq!(run.events().len(), 1);
    }

    #[test]
    fn test_started_is_idempotent() {
        let run = TestRun::new(["t1"]);
        assert!(run.started("t1"));
        assert!(!run.started("t1"));
        assert_eq!(run.summary().not_run, 1);
    }

    #[test]
    fn test_subtest_stats() {
        let run = TestRun::new(["p"]);
        for (name, passed) in [("(i=1)", true), ("(i=2)", false), ("(i=3)", true)] {
            run.record_subtest(SubtestResult {
                parent: "p".to_string(),
                name: name.to_string(),
                passed,
                message: None,
            });
        }
        assert_eq!(
            run.subtest_stats("p"),
            Some(SubtestStats {
                passed: 2,
                failed: 1
            })
        );
        assert_eq!(run.subtests().len(), 3);
    }

    #[test]
    fn test_output_sink() {
        let run = TestRun::new(Vec::<String>::new());
        OutputSink::append(&run, "line\r\n");
        assert_eq!(run.output(), "line\r\n");
    }

    fn covered(path: &str, hit: &[u32], missed: &[u32]) -> FileCoverage {
        let statements: Vec<_> = hit
            .iter()
            .map(|&line| StatementCoverage { line, covered: true })
            .chain(missed.iter().map(|&line| StatementCoverage {
                line,
                covered: false,
            }))
            .collect();
        FileCoverage {
            path: path.to_string(),
            lines: CoverageCount {
                covered: hit.len() as u64,
                total: statements.len() as u64,
            },
            branches: None,
            statements,
        }
    }

    #[test]
    fn test_coverage_from_two_batches_is_merged() {
        let run = TestRun::new(["t1", "t2"]);
        run.add_coverage(covered("/w/lib.py", &[0, 1], &[2, 3]));
        run.add_coverage(covered("/w/lib.py", &[2], &[0, 1, 3]));
        run.add_coverage(covered("/w/other.py", &[], &[0]));

        let lib = run.file_coverage("/w/lib.py").unwrap();
        assert_eq!(lib.lines, CoverageCount { covered: 3, total: 4 });
        assert!(!lib.statements.iter().find(|s| s.line == 3).unwrap().covered);
        assert_eq!(run.coverage().len(), 2);
        assert_eq!(
            run.events()
                .iter()
                .filter(|e| matches!(e, RunEvent::Coverage(_)))
                .count(),
            3
        );
    }
}

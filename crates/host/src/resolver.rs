//! Result resolution
//!
//! The resolver is the only writer of a workspace's test tree. Discovery
//! payloads are reconciled into the tree; execution and coverage payloads are
//! turned into results and file coverage on a [`TestRun`].

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use testbridge_common::protocol::{
    CoveragePayload, DiscoveryPayload, ExecutionPayload, FileCoverageMetrics, Outcome,
    PayloadStatus, RawCollection, RawTestNode, TestOutcomeRecord,
};
use testbridge_common::{fix_log_lines, TestProvider};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::reconciler::{self, ReconcileStats};
use crate::run::{
    CoverageCount, FileCoverage, StatementCoverage, SubtestResult, TestMessage, TestResult,
    TestRun, TestState,
};
use crate::tree::SharedTestTree;

static SUBTEST_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*?) ([\[(].*[\])])$").expect("valid regex"));

/// Split a subtest result key into `(parent run id, subtest name)`
pub fn split_subtest_key(key: &str) -> Option<(&str, &str)> {
    let caps = SUBTEST_KEY.captures(key)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

/// What happened to a discovery payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryResolution {
    Reconciled(ReconcileStats),
    ErrorRecorded,
    Ignored,
}

/// Applies runner payloads for one workspace
#[derive(Clone)]
pub struct ResultResolver {
    workspace: PathBuf,
    provider: TestProvider,
    tree: SharedTestTree,
}

impl ResultResolver {
    pub fn new(workspace: impl Into<PathBuf>, provider: TestProvider, tree: SharedTestTree) -> Self {
        Self {
            workspace: workspace.into(),
            provider,
            tree,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn provider(&self) -> TestProvider {
        self.provider
    }

    pub fn tree(&self) -> &SharedTestTree {
        &self.tree
    }

    /// Reconcile a discovery payload. Error payloads only touch the error
    /// node; payloads arriving after cancellation are dropped.
    pub fn resolve_discovery(
        &self,
        payload: &DiscoveryPayload,
        cancel: &CancellationToken,
    ) -> DiscoveryResolution {
        if cancel.is_cancelled() {
            debug!("Discovery cancelled; dropping payload for {}", self.workspace.display());
            return DiscoveryResolution::Ignored;
        }

        let mut tree = self.tree.lock();
        match &payload.status {
            PayloadStatus::Error => {
                let errors = match &payload.errors {
                    Some(errors) if !errors.is_empty() => errors.clone(),
                    _ => vec!["Unknown discovery error".to_string()],
                };
                error!(
                    "{} discovery failed for {}: {}",
                    self.provider,
                    self.workspace.display(),
                    errors.join("\n")
                );
                if payload.tests.is_some() {
                    warn!("Ignoring tests sent alongside a discovery error");
                }
                reconciler::record_discovery_error(&mut tree, &self.workspace, self.provider, &errors);
                DiscoveryResolution::ErrorRecorded
            }
            PayloadStatus::Success => {
                let empty;
                let root = match &payload.tests {
                    Some(root) => root,
                    None => {
                        empty = RawTestNode::Folder(RawCollection {
                            name: String::new(),
                            path: self.workspace.display().to_string(),
                            id: None,
                            lineno: None,
                            children: Vec::new(),
                        });
                        &empty
                    }
                };
                let stats = reconciler::reconcile_discovery(&mut tree, &self.workspace, root);
                tree.remove(&reconciler::discovery_error_id(&self.workspace));
                DiscoveryResolution::Reconciled(stats)
            }
            other => {
                warn!("Unexpected discovery status {}", other);
                DiscoveryResolution::Ignored
            }
        }
    }

    /// Apply an execution payload to `run`. Returns how many results were
    /// recorded.
    pub fn resolve_execution(
        &self,
        payload: &ExecutionPayload,
        run: &TestRun,
        cancel: &CancellationToken,
    ) -> usize {
        if cancel.is_cancelled() {
            debug!("Run {} cancelled; dropping execution payload", run.id());
            return 0;
        }
        if let Some(message) = &payload.error {
            warn!("Runner reported an execution error: {}", message);
            run.append_output(&format!("{}\r\n", fix_log_lines(message)));
        }
        let Some(result) = &payload.result else {
            return 0;
        };

        let mut recorded = 0;
        for (key, record) in result {
            match &record.outcome {
                Outcome::SubtestSuccess | Outcome::SubtestFailure => {
                    if self.record_subtest(key, record, run) {
                        recorded += 1;
                    }
                }
                Outcome::Unknown(outcome) => {
                    warn!("Unknown outcome {:?} for {}", outcome, key);
                }
                _ => {
                    if self.record_outcome(key, record, run) {
                        recorded += 1;
                    }
                }
            }
        }
        recorded
    }

    /// Attach a coverage payload to `run`. Returns how many files were
    /// recorded.
    pub fn resolve_coverage(
        &self,
        payload: &CoveragePayload,
        run: &TestRun,
        cancel: &CancellationToken,
    ) -> usize {
        if cancel.is_cancelled() {
            debug!("Run {} cancelled; dropping coverage payload", run.id());
            return 0;
        }
        if let Some(message) = &payload.error {
            warn!("Runner reported a coverage error: {}", message);
        }
        let Some(files) = &payload.result else {
            return 0;
        };
        for (path, metrics) in files {
            run.add_coverage(file_coverage(path, metrics));
        }
        debug!("Coverage received for {} files", files.len());
        files.len()
    }

    fn record_outcome(&self, run_id: &str, record: &TestOutcomeRecord, run: &TestRun) -> bool {
        if !run.is_requested(run_id) {
            warn!("Ignoring result for {} which was not part of this run", run_id);
            return false;
        }
        let tree = self.tree.lock();
        let Some(entity) = tree.entity_for_run_id(run_id) else {
            warn!("No test with run id {}", run_id);
            return false;
        };

        let label = record.test.as_deref().unwrap_or(run_id);
        let detail = record
            .message
            .clone()
            .unwrap_or_else(|| record.outcome.to_string());
        let traceback = fix_log_lines(record.traceback.as_deref().unwrap_or_default());
        let message = |text: String| {
            Some(TestMessage {
                text,
                location: entity.location.clone(),
            })
        };

        let result = match record.outcome {
            Outcome::Error => TestResult {
                state: TestState::Errored,
                message: message(format!("{} failed with error: {}\r\n{}", label, detail, traceback)),
            },
            Outcome::Failure | Outcome::PassedUnexpected => TestResult {
                state: TestState::Failed,
                message: message(format!("{} failed: {}\r\n{}", label, detail, traceback)),
            },
            Outcome::Success | Outcome::ExpectedFailure => TestResult {
                state: TestState::Passed,
                message: None,
            },
            Outcome::Skipped => TestResult {
                state: TestState::Skipped,
                message: None,
            },
            Outcome::SubtestSuccess | Outcome::SubtestFailure | Outcome::Unknown(_) => return false,
        };
        run.record(&entity.id, result)
    }

    fn record_subtest(&self, key: &str, record: &TestOutcomeRecord, run: &TestRun) -> bool {
        let Some((parent_run_id, name)) = split_subtest_key(key) else {
            warn!("Malformed subtest key {}", key);
            return false;
        };
        if !run.is_requested(parent_run_id) {
            warn!("Ignoring subtest of {} which was not part of this run", parent_run_id);
            return false;
        }
        let tree = self.tree.lock();
        let Some(parent) = tree.entity_for_run_id(parent_run_id) else {
            warn!("No test with run id {} for subtest {}", parent_run_id, name);
            return false;
        };

        let passed = record.outcome == Outcome::SubtestSuccess;
        let message = (!passed).then(|| TestMessage {
            text: format!(
                "{} failed: {}\r\n{}",
                name,
                record
                    .message
                    .clone()
                    .unwrap_or_else(|| record.outcome.to_string()),
                fix_log_lines(record.traceback.as_deref().unwrap_or_default())
            ),
            location: parent.location.clone(),
        });
        run.record_subtest(SubtestResult {
            parent: parent.id.clone(),
            name: name.to_string(),
            passed,
            message,
        });
        true
    }
}

/// Runner lines are one-based; statements are zero-based
fn file_coverage(path: &str, metrics: &FileCoverageMetrics) -> FileCoverage {
    let covered = metrics.lines_covered.as_deref().unwrap_or_default();
    let missed = metrics.lines_missed.as_deref().unwrap_or_default();
    let statements = covered
        .iter()
        .map(|line| (line, true))
        .chain(missed.iter().map(|line| (line, false)))
        .filter(|(line, _)| **line > 0)
        .map(|(line, covered)| StatementCoverage {
            line: line - 1,
            covered,
        })
        .collect();
    let branches = metrics.branches_collected().then(|| CoverageCount {
        covered: metrics.executed_branches.max(0) as u64,
        total: metrics.total_branches as u64,
    });
    FileCoverage {
        path: path.to_string(),
        lines: CoverageCount {
            covered: covered.len() as u64,
            total: (covered.len() + missed.len()) as u64,
        },
        branches,
        statements,
    }
}

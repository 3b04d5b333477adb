//! Payloads exchanged with runner subprocesses
//!
//! Runners send a discovery payload carrying a raw node tree, execution
//! payloads carrying per-test outcome records keyed by run id, and, on
//! coverage runs, one coverage payload per connection keyed by file path.
//! All of them travel inside a JSON-RPC envelope.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// JSON-RPC envelope around every pipe body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub params: serde_json::Value,
}

impl RpcEnvelope {
    pub fn new(params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: None,
            params,
        }
    }
}

/// Payload status. Unrecognized values are preserved rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PayloadStatus {
    Success,
    Error,
    SubtestSuccess,
    SubtestFailure,
    Other(String),
}

impl PayloadStatus {
    /// `success` and `error` are the only statuses that end a request
    pub fn is_terminal(&self) -> bool {
        matches!(self, PayloadStatus::Success | PayloadStatus::Error)
    }
}

impl From<String> for PayloadStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => Self::Success,
            "error" => Self::Error,
            "subtest-success" => Self::SubtestSuccess,
            "subtest-failure" => Self::SubtestFailure,
            _ => Self::Other(s),
        }
    }
}

impl From<PayloadStatus> for String {
    fn from(status: PayloadStatus) -> Self {
        status.to_string()
    }
}

impl std::fmt::Display for PayloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadStatus::Success => write!(f, "success"),
            PayloadStatus::Error => write!(f, "error"),
            PayloadStatus::SubtestSuccess => write!(f, "subtest-success"),
            PayloadStatus::SubtestFailure => write!(f, "subtest-failure"),
            PayloadStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Line number as sent by runners: an integer, or a string such as `"12"`
/// or `"*"` when the runner could not determine one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LineNo {
    Number(i64),
    Text(String),
}

impl LineNo {
    /// One-based line, if the runner sent a usable one
    pub fn line(&self) -> Option<u32> {
        let n = match self {
            LineNo::Number(n) => *n,
            LineNo::Text(s) => s.trim().parse().ok()?,
        };
        u32::try_from(n).ok().filter(|n| *n > 0)
    }
}

/// Collection node: folder, file, class or parametrized function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCollection {
    pub name: String,
    pub path: String,
    #[serde(rename = "id_", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<LineNo>,
    #[serde(default)]
    pub children: Vec<RawTestNode>,
}

/// Leaf node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTestCase {
    pub name: String,
    pub path: String,
    #[serde(rename = "id_")]
    pub id: String,
    #[serde(rename = "runID", default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<LineNo>,
    /// Older runners send `path/to/file.py:12` instead of `lineno`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl RawTestCase {
    /// Run id, falling back to the node id for runners that omit it
    pub fn run_id(&self) -> &str {
        self.run_id.as_deref().unwrap_or(&self.id)
    }
}

/// Raw discovery node, tagged by the runner's `type_` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type_", rename_all = "lowercase")]
pub enum RawTestNode {
    Folder(RawCollection),
    File(RawCollection),
    #[serde(alias = "suite")]
    Class(RawCollection),
    Function(RawCollection),
    #[serde(alias = "case")]
    Test(RawTestCase),
}

impl RawTestNode {
    /// Framework-native id. Collections without an id are keyed by path.
    pub fn id(&self) -> &str {
        match self {
            RawTestNode::Folder(c)
            | RawTestNode::File(c)
            | RawTestNode::Class(c)
            | RawTestNode::Function(c) => c.id.as_deref().unwrap_or(&c.path),
            RawTestNode::Test(t) => &t.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RawTestNode::Folder(c)
            | RawTestNode::File(c)
            | RawTestNode::Class(c)
            | RawTestNode::Function(c) => &c.name,
            RawTestNode::Test(t) => &t.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            RawTestNode::Folder(c)
            | RawTestNode::File(c)
            | RawTestNode::Class(c)
            | RawTestNode::Function(c) => &c.path,
            RawTestNode::Test(t) => &t.path,
        }
    }

    pub fn children(&self) -> &[RawTestNode] {
        match self {
            RawTestNode::Folder(c)
            | RawTestNode::File(c)
            | RawTestNode::Class(c)
            | RawTestNode::Function(c) => &c.children,
            RawTestNode::Test(_) => &[],
        }
    }

    /// Number of case nodes in this subtree
    pub fn case_count(&self) -> usize {
        match self {
            RawTestNode::Test(_) => 1,
            _ => self.children().iter().map(RawTestNode::case_count).sum(),
        }
    }
}

/// Discovery result sent once per discovery run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    #[serde(default)]
    pub cwd: String,
    pub status: PayloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<RawTestNode>,
    #[serde(
        rename = "error",
        alias = "errors",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub errors: Option<Vec<String>>,
}

impl DiscoveryPayload {
    pub fn success(cwd: impl Into<String>, tests: RawTestNode) -> Self {
        Self {
            cwd: cwd.into(),
            status: PayloadStatus::Success,
            tests: Some(tests),
            errors: None,
        }
    }

    pub fn error(cwd: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            cwd: cwd.into(),
            status: PayloadStatus::Error,
            tests: None,
            errors: Some(errors),
        }
    }
}

/// Per-test outcome reported by a runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Outcome {
    Success,
    Failure,
    Skipped,
    Error,
    ExpectedFailure,
    SubtestSuccess,
    SubtestFailure,
    PassedUnexpected,
    Unknown(String),
}

impl From<String> for Outcome {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => Self::Success,
            "failure" => Self::Failure,
            "skipped" => Self::Skipped,
            "error" => Self::Error,
            "expected-failure" => Self::ExpectedFailure,
            "subtest-success" => Self::SubtestSuccess,
            "subtest-failure" => Self::SubtestFailure,
            "passed-unexpected" => Self::PassedUnexpected,
            _ => Self::Unknown(s),
        }
    }
}

impl From<Outcome> for String {
    fn from(outcome: Outcome) -> Self {
        outcome.to_string()
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
            Outcome::Skipped => write!(f, "skipped"),
            Outcome::Error => write!(f, "error"),
            Outcome::ExpectedFailure => write!(f, "expected-failure"),
            Outcome::SubtestSuccess => write!(f, "subtest-success"),
            Outcome::SubtestFailure => write!(f, "subtest-failure"),
            Outcome::PassedUnexpected => write!(f, "passed-unexpected"),
            Outcome::Unknown(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcomeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtest: Option<String>,
}

impl TestOutcomeRecord {
    pub fn new(test: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            test: Some(test.into()),
            outcome,
            message: None,
            traceback: None,
            subtest: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Execution result; runners may send many per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPayload {
    #[serde(default)]
    pub cwd: String,
    pub status: PayloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BTreeMap<String, TestOutcomeRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionPayload {
    pub fn success(cwd: impl Into<String>, result: BTreeMap<String, TestOutcomeRecord>) -> Self {
        Self {
            cwd: cwd.into(),
            status: PayloadStatus::Success,
            result: Some(result),
            error: None,
        }
    }
}

/// Line and branch counts a coverage run reports for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCoverageMetrics {
    /// One-based; `null` when no line was hit
    #[serde(default)]
    pub lines_covered: Option<Vec<u32>>,
    #[serde(default)]
    pub lines_missed: Option<Vec<u32>>,
    #[serde(default)]
    pub executed_branches: i64,
    /// `-1` when branch coverage was not collected
    #[serde(default = "branches_not_collected")]
    pub total_branches: i64,
}

fn branches_not_collected() -> i64 {
    -1
}

impl FileCoverageMetrics {
    pub fn branches_collected(&self) -> bool {
        self.total_branches >= 0
    }
}

/// Coverage result, sent once per connection on coverage runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoveragePayload {
    pub coverage: bool,
    #[serde(default)]
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BTreeMap<String, FileCoverageMetrics>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Anything a runner may send while executing tests
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionMessage {
    Results(ExecutionPayload),
    Coverage(CoveragePayload),
}

impl ExecutionMessage {
    /// Coverage payloads are told apart by their `coverage` key
    pub fn from_value(value: serde_json::Value) -> serde_json::Result<Self> {
        if value.get("coverage").is_some() {
            serde_json::from_value(value).map(Self::Coverage)
        } else {
            serde_json::from_value(value).map(Self::Results)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_discovery_payload_parsing() {
        let value = json!({
            "cwd": "/w",
            "status": "success",
            "tests": {
                "path": "/w", "name": "w", "type_": "folder", "id_": "/w",
                "children": [{
                    "path": "/w/test_a.py::test_one", "name": "test_one",
                    "type_": "test", "id_": "t1", "runID": "t1", "lineno": 3
                }]
            }
        });
        let payload: DiscoveryPayload = serde_json::from_value(value).unwrap();
        assert_eq!(payload.status, PayloadStatus::Success);
        let root = payload.tests.unwrap();
        assert!(matches!(root, RawTestNode::Folder(_)));
        assert_eq!(root.id(), "/w");
        match &root.children()[0] {
            RawTestNode::Test(case) => {
                assert_eq!(case.run_id(), "t1");
                assert_eq!(case.lineno.as_ref().and_then(LineNo::line), Some(3));
            }
            other => panic!("expected a test node, got {:?}", other),
        }
    }

    #[test]
    fn test_error_key_accepts_both_spellings() {
        let a: DiscoveryPayload =
            serde_json::from_value(json!({"status": "error", "error": ["boom"]})).unwrap();
        let b: DiscoveryPayload =
            serde_json::from_value(json!({"status": "error", "errors": ["boom"]})).unwrap();
        assert_eq!(a.errors, Some(vec!["boom".to_string()]));
        assert_eq!(a.errors, b.errors);
    }

    #[test]
    fn test_unittest_star_lineno() {
        let node: RawTestNode = serde_json::from_value(json!({
            "type_": "test", "name": "test_x", "path": "/w/t.py",
            "id_": "t.T.test_x", "runID": "t.T.test_x", "lineno": "*"
        }))
        .unwrap();
        match node {
            RawTestNode::Test(case) => assert_eq!(case.lineno.unwrap().line(), None),
            _ => panic!("expected a test node"),
        }
    }

    #[test]
    fn test_suite_alias_and_missing_id() {
        let node: RawTestNode = serde_json::from_value(json!({
            "type_": "suite", "name": "TestThing", "path": "/w/t.py", "children": []
        }))
        .unwrap();
        assert!(matches!(node, RawTestNode::Class(_)));
        assert_eq!(node.id(), "/w/t.py");
    }

    #[test]
    fn test_execution_payload_outcomes() {
        let payload: ExecutionPayload = serde_json::from_value(json!({
            "cwd": "/w",
            "status": "success",
            "result": {
                "t1": {"test": "t1", "outcome": "success", "message": null},
                "t2": {"test": "t2", "outcome": "passed-unexpected"},
                "t3": {"test": "t3", "outcome": "flaky"}
            }
        }))
        .unwrap();
        let result = payload.result.unwrap();
        assert_eq!(result["t1"].outcome, Outcome::Success);
        assert_eq!(result["t2"].outcome, Outcome::PassedUnexpected);
        assert_eq!(result["t3"].outcome, Outcome::Unknown("flaky".to_string()));
    }

    #[test]
    fn test_unknown_status_is_not_terminal() {
        let status = PayloadStatus::from("pending".to_string());
        assert_eq!(status, PayloadStatus::Other("pending".to_string()));
        assert!(!status.is_terminal());
        assert!(PayloadStatus::Error.is_terminal());
    }

    #[test]
    fn test_coverage_payload_is_told_apart() {
        let value = json!({
            "coverage": true,
            "cwd": "/w",
            "result": {
                "/w/lib.py": {"lines_covered": [1, 2], "lines_missed": null, "executed_branches": 1, "total_branches": 2},
                "/w/other.py": {"lines_covered": [3], "lines_missed": [4], "executed_branches": 0, "total_branches": -1}
            }
        });
        let ExecutionMessage::Coverage(payload) = ExecutionMessage::from_value(value).unwrap() else {
            panic!("expected coverage");
        };
        let result = payload.result.unwrap();
        assert!(result["/w/lib.py"].lines_missed.is_none());
        assert!(result["/w/lib.py"].branches_collected());
        assert!(!result["/w/other.py"].branches_collected());

        let results = ExecutionMessage::from_value(json!({
            "status": "success",
            "result": {"t1": {"test": "t1", "outcome": "success"}}
        }))
        .unwrap();
        assert!(matches!(results, ExecutionMessage::Results(_)));
    }
}

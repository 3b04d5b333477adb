//! Core types for testbridge

use serde::{Deserialize, Serialize};

/// Environment variable carrying the result pipe path to the runner
pub const TEST_RUN_PIPE_ENV: &str = "TEST_RUN_PIPE";

/// Environment variable carrying the path of the test-id file
pub const RUN_TEST_IDS_PIPE_ENV: &str = "RUN_TEST_IDS_PIPE";

/// Set to `True` to ask the runner for a coverage payload
pub const COVERAGE_ENABLED_ENV: &str = "COVERAGE_ENABLED";

/// Test framework driving a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestProvider {
    Pytest,
    Unittest,
}

impl Default for TestProvider {
    fn default() -> Self {
        Self::Pytest
    }
}

impl TestProvider {
    /// Name used in user-facing labels
    pub fn display_name(&self) -> &'static str {
        match self {
            TestProvider::Pytest => "pytest",
            TestProvider::Unittest => "Unittest",
        }
    }
}

impl std::fmt::Display for TestProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestProvider::Pytest => write!(f, "pytest"),
            TestProvider::Unittest => write!(f, "unittest"),
        }
    }
}

impl std::str::FromStr for TestProvider {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pytest" => Ok(Self::Pytest),
            "unittest" => Ok(Self::Unittest),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown test provider: {}",
                other
            ))),
        }
    }
}

/// Split runner output into lines and rejoin with `\r\n`
pub fn fix_log_lines(text: &str) -> String {
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\r\n")
}

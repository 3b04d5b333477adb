//! Host configuration

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use testbridge_common::TestProvider;

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Python interpreter used to launch runners
    pub python: String,

    /// Directory holding the runner-side plugins
    /// (`vscode_pytest/`, `unittestadapter/`)
    pub plugin_dir: PathBuf,

    /// Directory for pipe sockets
    pub pipe_dir: Option<PathBuf>,

    /// Test settings
    pub testing: TestingSettings,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            plugin_dir: PathBuf::from("python_files"),
            pipe_dir: None,
            testing: TestingSettings::default(),
        }
    }
}

/// Test settings resolved for one workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingSettings {
    /// Framework used for the workspace
    pub framework: TestProvider,

    /// Extra pytest arguments
    pub pytest_args: Vec<String>,

    /// Extra unittest arguments
    pub unittest_args: Vec<String>,

    /// Working directory override (defaults to the workspace root)
    pub cwd: Option<PathBuf>,

    /// Extra environment for runner processes
    pub env: HashMap<String, String>,

    /// Upper bound on concurrent execution subprocesses per run
    pub max_parallel_instances: usize,
}

impl Default for TestingSettings {
    fn default() -> Self {
        Self {
            framework: TestProvider::Pytest,
            pytest_args: Vec::new(),
            unittest_args: vec![
                "-v".to_string(),
                "-s".to_string(),
                ".".to_string(),
                "-p".to_string(),
                "test*.py".to_string(),
            ],
            cwd: None,
            env: HashMap::new(),
            max_parallel_instances: 1,
        }
    }
}

impl TestingSettings {
    /// Arguments for the configured framework
    pub fn args(&self) -> &[String] {
        match self.framework {
            TestProvider::Pytest => &self.pytest_args,
            TestProvider::Unittest => &self.unittest_args,
        }
    }

    /// Working directory for runners launched for `workspace`
    pub fn cwd_for(&self, workspace: &Path) -> PathBuf {
        match &self.cwd {
            Some(cwd) if cwd.is_absolute() => cwd.clone(),
            Some(cwd) => workspace.join(cwd),
            None => workspace.to_path_buf(),
        }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the pipe socket directory
    pub fn pipe_dir(&self) -> PathBuf {
        self.pipe_dir
            .clone()
            .unwrap_or_else(testbridge_common::default_runtime_dir)
    }
}

/// Resolves per-workspace settings. Read-only.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn settings(&self, workspace: &Path) -> testbridge_common::Result<TestingSettings>;
}

/// Settings provider backed by a fixed `HostConfig`
#[derive(Debug, Clone)]
pub struct StaticSettings {
    settings: TestingSettings,
}

impl StaticSettings {
    pub fn new(settings: TestingSettings) -> Self {
        Self { settings }
    }
}

impl From<&HostConfig> for StaticSettings {
    fn from(config: &HostConfig) -> Self {
        Self::new(config.testing.clone())
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn settings(&self, _workspace: &Path) -> testbridge_common::Result<TestingSettings> {
        Ok(self.settings.clone())
    }
}

//! Runner invocations per framework

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use testbridge_common::{
    TestProvider, COVERAGE_ENABLED_ENV, RUN_TEST_IDS_PIPE_ENV, TEST_RUN_PIPE_ENV,
};
use tracing::warn;

use crate::config::TestingSettings;
use crate::process::{
    ExitCodePolicy, RunnerCommand, PYTEST_DISCOVERY, PYTEST_EXECUTION, UNITTEST_DISCOVERY,
    UNITTEST_EXECUTION,
};

/// How an execution was requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunProfile {
    #[default]
    Run,
    /// Debug session; pytest output is not captured
    Debug,
    /// Ask the runner for a coverage payload
    Coverage,
}

/// Interpreter and plugin location shared by every runner launch
#[derive(Debug, Clone)]
pub struct RunnerSetup {
    pub python: String,
    pub plugin_dir: PathBuf,
}

impl RunnerSetup {
    pub fn new(python: impl Into<String>, plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            plugin_dir: plugin_dir.into(),
        }
    }

    fn script(&self, parts: &[&str]) -> String {
        let mut path = self.plugin_dir.clone();
        for part in parts {
            path.push(part);
        }
        path.display().to_string()
    }

    /// Environment for a runner: configured env, the plugin dir prepended
    /// to `PYTHONPATH`, and the result pipe.
    pub fn environment(&self, settings: &TestingSettings, pipe: &Path) -> HashMap<String, String> {
        let mut env = settings.env.clone();
        let existing = env
            .get("PYTHONPATH")
            .cloned()
            .or_else(|| std::env::var("PYTHONPATH").ok())
            .filter(|p| !p.is_empty());
        let plugin = self.plugin_dir.display().to_string();
        let python_path = match existing {
            Some(existing) => format!("{}:{}", plugin, existing),
            None => plugin,
        };
        env.insert("PYTHONPATH".to_string(), python_path);
        env.insert(TEST_RUN_PIPE_ENV.to_string(), pipe.display().to_string());
        env
    }

    /// Discovery invocation for `provider`
    pub fn discovery_command(
        &self,
        provider: TestProvider,
        settings: &TestingSettings,
        cwd: &Path,
        pipe: &Path,
    ) -> RunnerCommand {
        let args = match provider {
            TestProvider::Pytest => {
                let mut args = vec![
                    "-m".to_string(),
                    "pytest".to_string(),
                    "-p".to_string(),
                    "vscode_pytest".to_string(),
                    "--collect-only".to_string(),
                ];
                args.extend(handle_symlink_and_root_dir(cwd, settings.pytest_args.clone()));
                args
            }
            TestProvider::Unittest => {
                let mut args = vec![
                    self.script(&["unittestadapter", "discovery.py"]),
                    "--udiscovery".to_string(),
                ];
                args.extend(settings.unittest_args.iter().cloned());
                args
            }
        };
        RunnerCommand {
            program: self.python.clone(),
            args,
            cwd: cwd.to_path_buf(),
            env: self.environment(settings, pipe),
        }
    }

    /// Execution invocation for `provider`; run ids travel in `ids_file`
    pub fn execution_command(
        &self,
        provider: TestProvider,
        settings: &TestingSettings,
        cwd: &Path,
        pipe: &Path,
        ids_file: &Path,
        profile: RunProfile,
    ) -> RunnerCommand {
        let args = match provider {
            TestProvider::Pytest => {
                let mut user = handle_symlink_and_root_dir(cwd, settings.pytest_args.clone());
                user = add_value_if_key_not_exist(user, "--rootdir", &cwd.display().to_string());
                if profile == RunProfile::Debug
                    && !arg_key_exists(&user, "-s") && !arg_key_exists(&user, "--capture") {
                    user.push("--capture=no".to_string());
                }
                let mut args = vec![self.script(&["vscode_pytest", "run_pytest_script.py"])];
                args.extend(user);
                args
            }
            TestProvider::Unittest => {
                let mut args = vec![
                    self.script(&["unittestadapter", "execution.py"]),
                    "--udiscovery".to_string(),
                ];
                args.extend(settings.unittest_args.iter().cloned());
                args
            }
        };
        let mut env = self.environment(settings, pipe);
        env.insert(
            RUN_TEST_IDS_PIPE_ENV.to_string(),
            ids_file.display().to_string(),
        );
        if profile == RunProfile::Coverage {
            match provider {
                TestProvider::Pytest => {
                    env.insert(COVERAGE_ENABLED_ENV.to_string(), "True".to_string());
                }
                TestProvider::Unittest => {
                    warn!("Coverage is only collected for pytest; running unittest without it")
                }
            }
        }
        RunnerCommand {
            program: self.python.clone(),
            args,
            cwd: cwd.to_path_buf(),
            env,
        }
    }
}

pub fn discovery_policy(provider: TestProvider) -> ExitCodePolicy {
    match provider {
        TestProvider::Pytest => PYTEST_DISCOVERY,
        TestProvider::Unittest => UNITTEST_DISCOVERY,
    }
}

pub fn execution_policy(provider: TestProvider) -> ExitCodePolicy {
    match provider {
        TestProvider::Pytest => PYTEST_EXECUTION,
        TestProvider::Unittest => UNITTEST_EXECUTION,
    }
}

/// Whether `key` appears as `key` or `key=value`
pub fn arg_key_exists(args: &[String], key: &str) -> bool {
    args.iter().any(|arg| {
        arg == key
            || arg
                .split_once('=')
                .map(|(k, _)| k == key)
                .unwrap_or(false)
    })
}

/// Append `key=value` unless `key` is already present
pub fn add_value_if_key_not_exist(mut args: Vec<String>, key: &str, value: &str) -> Vec<String> {
    if !arg_key_exists(&args, key) {
        args.push(format!("{}={}", key, value));
    }
    args
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// pytest resolves symlinked working directories to their target, which
/// breaks node ids. Pin `--rootdir` to the path the user opened.
pub fn handle_symlink_and_root_dir(cwd: &Path, args: Vec<String>) -> Vec<String> {
    let symlinked = if is_symlink(cwd) {
        warn!(
            "The cwd {} is a symlink; pytest will run with --rootdir set to it",
            cwd.display()
        );
        true
    } else if cwd.ancestors().skip(1).any(is_symlink) {
        warn!(
            "The cwd {} resolves through a symlinked parent; pytest will run with --rootdir set to it",
            cwd.display()
        );
        true
    } else {
        false
    };

    if symlinked {
        add_value_if_key_not_exist(args, "--rootdir", &cwd.display().to_string())
    } else {
        args
    }
}

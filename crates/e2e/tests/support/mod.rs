//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use testbridge_common::TestProvider;
use testbridge_e2e::{FakeSpawner, RunnerScript};
use testbridge_host::telemetry::RecordingTelemetry;
use testbridge_host::{
    DiscoveryAdapter, ExecutionAdapter, PipeNamer, RunnerSetup, StaticSettings, TestTree,
    TestingSettings, TracingOutput, WorkspaceTestAdapter,
};

pub const FAKE_RUNNER: &str = env!("CARGO_BIN_EXE_fake-runner");

pub struct Harness {
    _dir: TempDir,
    pub workspace: PathBuf,
    pub pipes: PathBuf,
    pub plugins: PathBuf,
    pub spawner: Arc<FakeSpawner>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub adapter: WorkspaceTestAdapter,
}

impl Harness {
    pub fn new(provider: TestProvider, script: RunnerScript) -> Self {
        Self::with_settings(provider, script, |_| {})
    }

    pub fn with_settings(
        provider: TestProvider,
        script: RunnerScript,
        configure: impl FnOnce(&mut TestingSettings),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("proj");
        let pipes = dir.path().join("pipes");
        let plugins = dir.path().join("plugins");
        for d in [&workspace, &pipes, &plugins] {
            std::fs::create_dir_all(d).unwrap();
        }

        let mut settings = TestingSettings {
            framework: provider,
            ..Default::default()
        };
        configure(&mut settings);
        let settings = Arc::new(StaticSettings::new(settings));

        let spawner = Arc::new(FakeSpawner::new(FAKE_RUNNER, script));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let setup = RunnerSetup::new("python3", &plugins);
        let namer = PipeNamer::new(&pipes, "tb");

        let discovery = Arc::new(DiscoveryAdapter::new(
            provider,
            setup.clone(),
            settings.clone(),
            spawner.clone(),
            namer.clone(),
            Arc::new(TracingOutput),
        ));
        let execution = Arc::new(ExecutionAdapter::new(
            provider,
            setup,
            settings,
            spawner.clone(),
            namer,
            Arc::new(TracingOutput),
        ));
        let adapter = WorkspaceTestAdapter::new(
            &workspace,
            provider,
            TestTree::new().shared(),
            discovery,
            execution,
            telemetry.clone(),
        );

        Self {
            _dir: dir,
            workspace,
            pipes,
            plugins,
            spawner,
            telemetry,
            adapter,
        }
    }

    pub fn ws(&self) -> String {
        self.workspace.display().to_string()
    }

    /// Socket files still present in the pipe directory
    pub fn pipes_left(&self) -> usize {
        std::fs::read_dir(&self.pipes).unwrap().count()
    }

    pub fn file_id(&self) -> String {
        format!("{}/test_a.py", self.ws())
    }
}

/// Discovery payload: one file with the given test names
pub fn discovery_payload(workspace: &Path, tests: &[&str]) -> serde_json::Value {
    let ws = workspace.display().to_string();
    let file = format!("{}/test_a.py", ws);
    let cases: Vec<serde_json::Value> = tests
        .iter()
        .enumerate()
        .map(|(i, name)| {
            json!({
                "name": name,
                "path": file,
                "type_": "test",
                "id_": format!("test_a.py::{}", name),
                "runID": format!("test_a.py::{}", name),
                "lineno": 3 + i * 4,
            })
        })
        .collect();
    json!({
        "cwd": ws,
        "status": "success",
        "tests": {
            "name": "proj",
            "path": ws,
            "type_": "folder",
            "id_": ws,
            "children": [{
                "name": "test_a.py",
                "path": file,
                "type_": "file",
                "id_": file,
                "children": cases,
            }],
        },
    })
}

pub fn discovery_script(workspace: &Path, tests: &[&str]) -> RunnerScript {
    RunnerScript {
        payloads: vec![discovery_payload(workspace, tests)],
        ..Default::default()
    }
}

/// Bound every end-to-end wait
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(30), future)
        .await
        .expect("operation timed out")
}

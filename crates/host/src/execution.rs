//! Execution adapter
//!
//! Runs one runner subprocess per batch of run ids. Each batch gets its own
//! [`ExecutionInstance`], pipe and child cancellation token. Runners may send
//! many payloads (typically one per test); every payload is applied to the
//! run, and the instance keeps the first terminal one as its result. Coverage
//! payloads go straight to the run.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use testbridge_common::{
    ExecutionMessage, ExecutionPayload, Outcome, PayloadStatus, Result, TestOutcomeRecord,
    TestProvider,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{SettingsProvider, TestingSettings};
use crate::deferred::Deferred;
use crate::framework::{execution_policy, RunProfile, RunnerSetup};
use crate::instance::ExecutionInstance;
use crate::pipe::{drain_pipe, start_pipe, PipeNamer, PipeOptions};
use crate::process::{
    supervise, OutputSink, ProcessHandle, ProcessHandlers, ProcessSpawner, Supervision,
    TeeOutput,
};
use crate::resolver::ResultResolver;
use crate::run::TestRun;

/// Executes run ids for one workspace, writing results into `run`
#[async_trait]
pub trait TestExecutionAdapter: Send + Sync {
    async fn run_tests(
        &self,
        workspace: &Path,
        run_ids: Vec<String>,
        run: Arc<TestRun>,
        resolver: &ResultResolver,
        cancel: &CancellationToken,
        profile: RunProfile,
    ) -> Result<()>;

    /// Batch count ceiling for one run
    async fn max_parallel_instances(&self, _workspace: &Path) -> usize {
        1
    }
}

/// Error payload giving every run id of a failed runner an `error` outcome
pub fn exit_error_payload(cwd: &str, run_ids: &[String], message: &str) -> ExecutionPayload {
    let result: BTreeMap<String, TestOutcomeRecord> = run_ids
        .iter()
        .map(|id| {
            (
                id.clone(),
                TestOutcomeRecord::new(id.clone(), Outcome::Error).with_message(message),
            )
        })
        .collect();
    ExecutionPayload {
        cwd: cwd.to_string(),
        status: PayloadStatus::Error,
        result: Some(result),
        error: Some(message.to_string()),
    }
}

/// Execution through runner subprocesses
pub struct ExecutionAdapter {
    provider: TestProvider,
    setup: RunnerSetup,
    settings: Arc<dyn SettingsProvider>,
    spawner: Arc<dyn ProcessSpawner>,
    namer: PipeNamer,
    output: Arc<dyn OutputSink>,
}

impl ExecutionAdapter {
    pub fn new(
        provider: TestProvider,
        setup: RunnerSetup,
        settings: Arc<dyn SettingsProvider>,
        spawner: Arc<dyn ProcessSpawner>,
        namer: PipeNamer,
        output: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            provider,
            setup,
            settings,
            spawner,
            namer,
            output,
        }
    }

    pub fn provider(&self) -> TestProvider {
        self.provider
    }

    async fn run_instance(
        &self,
        instance: &Arc<ExecutionInstance>,
        settings: &TestingSettings,
        run: Arc<TestRun>,
        resolver: &ResultResolver,
        token: CancellationToken,
        profile: RunProfile,
    ) -> Result<()> {
        let cwd = settings.cwd_for(instance.workspace());
        let cwd_text = cwd.display().to_string();
        let ids_file = instance.initialize().await?;

        let scope = CancellationToken::new();
        let (pipe, rx) = start_pipe(
            self.namer.next("results"),
            PipeOptions::multi_client(),
            &scope,
        )
        .await?;
        instance.set_pipe_name(pipe.name());

        let command = self.setup.execution_command(
            self.provider,
            settings,
            &cwd,
            pipe.name(),
            &ids_file,
            profile,
        );
        info!(
            "Running {} {} tests in {}: {}",
            instance.run_ids().len(),
            self.provider,
            cwd_text,
            command
        );

        let child = match self.spawner.spawn(&command).await {
            Ok(child) => child,
            Err(e) => {
                pipe.dispose();
                return Err(e);
            }
        };
        if let Some(handle) = ProcessHandle::from_child(&child) {
            instance.set_process(handle);
        }

        let forwarder = tokio::spawn(forward_payloads(
            rx,
            Arc::clone(instance),
            resolver.clone(),
            Arc::clone(&run),
            token.clone(),
        ));

        let handlers = {
            let instance = Arc::clone(instance);
            let resolver = resolver.clone();
            let run = Arc::clone(&run);
            let token = token.clone();
            let cwd = cwd_text.clone();
            let output: Arc<dyn OutputSink> = Arc::new(TeeOutput::new(vec![
                Arc::clone(&self.output),
                Arc::clone(&run) as Arc<dyn OutputSink>,
            ]));
            Arc::new(ProcessHandlers::new(
                format!("{} execution", self.provider.display_name()),
                cwd_text.clone(),
                execution_policy(self.provider),
                Deferred::new(),
                output,
                move |failure| {
                    if token.is_cancelled() {
                        return;
                    }
                    let message = failure.termination_message(&cwd);
                    let payload = exit_error_payload(&cwd, instance.run_ids(), &message);
                    instance.handle_data_received(&payload);
                    let recorded = resolver.resolve_execution(&payload, &run, &token);
                    debug!("Runner failure recorded as error for {} tests", recorded);
                },
            ))
        };

        match supervise(child, Arc::clone(&handlers), &token).await {
            Supervision::Exited(status) => {
                pipe.close();
                if drain_pipe(&pipe, forwarder, &token).await {
                    handlers.on_close(status);
                } else {
                    info!("Execution cancelled for {} while draining results", cwd_text);
                    handlers.on_cancelled();
                }
            }
            Supervision::Cancelled => {
                info!("Execution cancelled for {}", cwd_text);
                pipe.dispose();
                if let Err(e) = forwarder.await {
                    warn!("Execution forwarder failed: {}", e);
                }
            }
        }

        handlers.completion().wait().await;
        pipe.dispose();
        Ok(())
    }
}

#[async_trait]
impl TestExecutionAdapter for ExecutionAdapter {
    async fn run_tests(
        &self,
        workspace: &Path,
        run_ids: Vec<String>,
        run: Arc<TestRun>,
        resolver: &ResultResolver,
        cancel: &CancellationToken,
        profile: RunProfile,
    ) -> Result<()> {
        let settings = self.settings.settings(workspace).await?;
        let instance = Arc::new(ExecutionInstance::new(workspace, run_ids));
        let token = cancel.child_token();
        instance.set_cancellation_token(token.clone());

        let result = self
            .run_instance(&instance, &settings, run, resolver, token, profile)
            .await;
        instance.dispose();
        result
    }

    async fn max_parallel_instances(&self, workspace: &Path) -> usize {
        match self.settings.settings(workspace).await {
            Ok(settings) => settings.max_parallel_instances.max(1),
            Err(e) => {
                warn!("Could not read settings for {}: {}", workspace.display(), e);
                1
            }
        }
    }
}

/// Hand result payloads to the instance and the run, coverage to the run
async fn forward_payloads(
    mut rx: mpsc::Receiver<serde_json::Value>,
    instance: Arc<ExecutionInstance>,
    resolver: ResultResolver,
    run: Arc<TestRun>,
    cancel: CancellationToken,
) {
    while let Some(params) = rx.recv().await {
        if cancel.is_cancelled() {
            debug!("Execution cancelled; discarding payload");
            continue;
        }
        match ExecutionMessage::from_value(params) {
            Ok(ExecutionMessage::Results(payload)) => {
                instance.handle_data_received(&payload);
                resolver.resolve_execution(&payload, &run, &cancel);
            }
            Ok(ExecutionMessage::Coverage(payload)) => {
                resolver.resolve_coverage(&payload, &run, &cancel);
            }
            Err(e) => warn!("Discarding malformed execution payload: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TestTree;
    use serde_json::json;

    #[test]
    fn test_exit_error_payload_covers_every_id() {
        let ids = vec!["a::t1".to_string(), "a::t2".to_string()];
        let payload = exit_error_payload("/w", &ids, "boom");
        assert_eq!(payload.status, PayloadStatus::Error);
        let result = payload.result.unwrap();
        assert_eq!(result.len(), 2);
        assert!(result
            .values()
            .all(|r| r.outcome == Outcome::Error && r.message.as_deref() == Some("boom")));
    }

    #[tokio::test]
    async fn test_forwarder_routes_coverage_to_the_run() {
        let (tx, rx) = mpsc::channel(8);
        let instance = Arc::new(ExecutionInstance::new("/w", vec!["t1".to_string()]));
        let resolver = ResultResolver::new("/w", TestProvider::Pytest, TestTree::new().shared());
        let run = Arc::new(TestRun::new(["t1"]));

        tx.send(json!({
            "coverage": true,
            "cwd": "/w",
            "result": {"/w/lib.py": {"lines_covered": [1], "lines_missed": [2], "executed_branches": 0, "total_branches": -1}}
        }))
        .await
        .unwrap();
        tx.send(json!({"cwd": "/w", "status": "success", "result": {}}))
            .await
            .unwrap();
        drop(tx);

        forward_payloads(
            rx,
            Arc::clone(&instance),
            resolver,
            Arc::clone(&run),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(run.file_coverage("/w/lib.py").unwrap().lines.total, 2);
        // Coverage is not a terminal result for the instance
        assert_eq!(
            instance.execution_result().unwrap().status,
            PayloadStatus::Success
        );
    }
}

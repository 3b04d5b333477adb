//! Discovery adapter
//!
//! One runner process per request. The runner connects back to a fresh pipe
//! and sends a single discovery payload; that payload and the error
//! synthesized from a failed exit race through a first-writer-wins guard, so
//! the tree is reconciled at most once per request.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use testbridge_common::{DiscoveryPayload, Result, TestProvider};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SettingsProvider;
use crate::deferred::Deferred;
use crate::framework::{discovery_policy, RunnerSetup};
use crate::pipe::{drain_pipe, start_pipe, PipeNamer, PipeOptions};
use crate::process::{supervise, OutputSink, ProcessHandlers, ProcessSpawner, Supervision};
use crate::resolver::{DiscoveryResolution, ResultResolver};

/// Runs discovery for one workspace and hands the payload to `resolver`.
///
/// Returns what this request did to the tree once the runner is done and the
/// pipe is disposed. Cancellation is not an error: the runner is killed,
/// nothing is reconciled and the resolution is `Ignored`.
#[async_trait]
pub trait TestDiscoveryAdapter: Send + Sync {
    async fn discover_tests(
        &self,
        workspace: &Path,
        resolver: &ResultResolver,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryResolution>;
}

/// Discovery through a runner subprocess
pub struct DiscoveryAdapter {
    provider: TestProvider,
    setup: RunnerSetup,
    settings: Arc<dyn SettingsProvider>,
    spawner: Arc<dyn ProcessSpawner>,
    namer: PipeNamer,
    output: Arc<dyn OutputSink>,
}

impl DiscoveryAdapter {
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
}

#[async_trait]
impl TestDiscoveryAdapter for DiscoveryAdapter {
    async fn discover_tests(
        &self,
        workspace: &Path,
        resolver: &ResultResolver,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryResolution> {
        let settings = self.settings.settings(workspace).await?;
        let cwd = settings.cwd_for(workspace);
        let cwd_text = cwd.display().to_string();

        // Disposal is driven explicitly so the runner dies before the pipe does
        let scope = CancellationToken::new();
        let (pipe, rx) = start_pipe(
            self.namer.next("discovery"),
            PipeOptions::single_client(),
            &scope,
        )
        .await?;

        let command = self
            .setup
            .discovery_command(self.provider, &settings, &cwd, pipe.name());
        info!("Discovering {} tests in {}: {}", self.provider, cwd_text, command);

        let child = match self.spawner.spawn(&command).await {
            Ok(child) => child,
            Err(e) => {
                pipe.dispose();
                return Err(e);
            }
        };

        let settled = Deferred::new();
        let outcome = Deferred::new();
        let forwarder = tokio::spawn(forward_payloads(
            rx,
            resolver.clone(),
            cancel.clone(),
            settled.clone(),
            outcome.clone(),
        ));

        let handlers = {
            let outcome = outcome.clone();
            let resolver = resolver.clone();
            let cancel = cancel.clone();
            let cwd = cwd_text.clone();
            Arc::new(ProcessHandlers::new(
                format!("{} discovery", self.provider.display_name()),
                cwd_text.clone(),
                discovery_policy(self.provider),
                Deferred::new(),
                Arc::clone(&self.output),
                move |failure| {
                    if cancel.is_cancelled() {
                        return;
                    }
                    if settled.resolve(()) {
                        let payload = DiscoveryPayload::error(
                            cwd.clone(),
                            vec![failure.termination_message(&cwd)],
                        );
                        outcome.resolve(resolver.resolve_discovery(&payload, &cancel));
                    } else {
                        debug!("Discovery payload already received; not reporting exit failure");
                    }
                },
            ))
        };

        match supervise(child, Arc::clone(&handlers), cancel).await {
            Supervision::Exited(status) => {
                pipe.close();
                if drain_pipe(&pipe, forwarder, cancel).await {
                    handlers.on_close(status);
                } else {
                    info!("Discovery cancelled for {} while draining results", cwd_text);
                    handlers.on_cancelled();
                }
            }
            Supervision::Cancelled => {
                info!("Discovery cancelled for {}", cwd_text);
                pipe.dispose();
                if let Err(e) = forwarder.await {
                    warn!("Discovery forwarder failed: {}", e);
                }
            }
        }

        handlers.completion().wait().await;
        pipe.dispose();
        Ok(outcome.peek().unwrap_or(DiscoveryResolution::Ignored))
    }
}

async fn forward_payloads(
    mut rx: mpsc::Receiver<serde_json::Value>,
    resolver: ResultResolver,
    cancel: CancellationToken,
    settled: Deferred<()>,
    outcome: Deferred<DiscoveryResolution>,
) {
    while let Some(params) = rx.recv().await {
        if cancel.is_cancelled() {
            debug!("Discovery cancelled; discarding payload");
            continue;
        }
        let payload: DiscoveryPayload = match serde_json::from_value(params) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Discarding malformed discovery payload: {}", e);
                continue;
            }
        };
        if !payload.status.is_terminal() {
            debug!("Ignoring discovery payload with status {}", payload.status);
            continue;
        }
        if !settled.resolve(()) {
            warn!("Ignoring additional discovery payload from {}", payload.cwd);
            continue;
        }
        outcome.resolve(resolver.resolve_discovery(&payload, &cancel));
    }
}

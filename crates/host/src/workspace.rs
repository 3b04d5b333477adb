//! Workspace test adapter
//!
//! Owns the tree for one workspace and runs the discovery and execution
//! state machines. Each machine is `Idle -> Busy -> Idle`; a request that
//! arrives while the machine is busy joins the in-flight operation instead of
//! starting another one. The two machines are independent, so a run can
//! start while discovery is still going.

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use testbridge_common::{Error, TestProvider};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{HostConfig, StaticSettings};
use crate::discovery::{DiscoveryAdapter, TestDiscoveryAdapter};
use crate::execution::{ExecutionAdapter, TestExecutionAdapter};
use crate::framework::{RunProfile, RunnerSetup};
use crate::pipe::PipeNamer;
use crate::process::{OutputSink, ProcessSpawner};
use crate::reconciler::{
    discovery_error_base, discovery_error_id, error_label, execution_error_base,
    execution_error_id, upsert_error_node,
};
use crate::resolver::{DiscoveryResolution, ResultResolver};
use crate::run::TestRun;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::tree::{SharedTestTree, TestTree};

/// Outcome shared by every caller of one in-flight operation
pub type SharedResult<T> = std::result::Result<T, Arc<Error>>;

type InFlightFuture<T> = Shared<BoxFuture<'static, SharedResult<T>>>;

type Slot<T> = Arc<Mutex<Option<(u64, InFlightFuture<T>)>>>;

/// At most one running operation; later callers join it
struct InFlight<T: Clone> {
    slot: Slot<T>,
    next: AtomicU64,
}

/// Empties the slot when the operation that owns `id` finishes or unwinds
struct SlotRelease<T: Clone> {
    slot: Slot<T>,
    id: u64,
}

impl<T: Clone> Drop for SlotRelease<T> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if matches!(slot.as_ref(), Some((current, _)) if *current == self.id) {
            *slot = None;
        }
    }
}

impl<T: Clone + Send + Sync + 'static> InFlight<T> {
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next: AtomicU64::new(0),
        }
    }

    fn is_busy(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Join the running operation, or start one from `start`. The operation
    /// runs on its own task and releases the slot itself, so callers that
    /// give up waiting do not keep the machine busy.
    async fn run_or_join<F>(&self, what: &str, start: F) -> SharedResult<T>
    where
        F: FnOnce() -> BoxFuture<'static, SharedResult<T>>,
    {
        let future = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some((_, future)) => {
                    debug!("{} already in progress; joining it", what);
                    future.clone()
                }
                None => {
                    let id = self.next.fetch_add(1, Ordering::Relaxed);
                    let release = SlotRelease {
                        slot: Arc::clone(&self.slot),
                        id,
                    };
                    let operation = start();
                    // The slot lock is held until the entry is in place, so
                    // the release cannot run first
                    let task = tokio::spawn(async move {
                        let _release = release;
                        operation.await
                    });
                    let future = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(Arc::new(Error::Internal(e.to_string()))),
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some((id, future.clone()));
                    future
                }
            }
        };

        future.await
    }
}

pub struct WorkspaceTestAdapter {
    workspace: PathBuf,
    provider: TestProvider,
    resolver: ResultResolver,
    discovery: Arc<dyn TestDiscoveryAdapter>,
    execution: Arc<dyn TestExecutionAdapter>,
    telemetry: Arc<dyn TelemetrySink>,
    discovering: InFlight<()>,
    executing: InFlight<Arc<TestRun>>,
}

impl WorkspaceTestAdapter {
    pub fn new(
        workspace: impl Into<PathBuf>,
        provider: TestProvider,
        tree: SharedTestTree,
        discovery: Arc<dyn TestDiscoveryAdapter>,
        execution: Arc<dyn TestExecutionAdapter>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let workspace = workspace.into();
        Self {
            resolver: ResultResolver::new(workspace.clone(), provider, tree),
            workspace,
            provider,
            discovery,
            execution,
            telemetry,
            discovering: InFlight::new(),
            executing: InFlight::new(),
        }
    }

    /// Adapter wired to real runner subprocesses for the framework in `config`
    pub fn for_runner(
        workspace: impl Into<PathBuf>,
        config: &HostConfig,
        spawner: Arc<dyn ProcessSpawner>,
        output: Arc<dyn OutputSink>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let provider = config.testing.framework;
        let setup = RunnerSetup::new(config.python.clone(), config.plugin_dir.clone());
        let settings = Arc::new(StaticSettings::from(config));
        let namer = PipeNamer::new(config.pipe_dir(), "testbridge");

        let discovery = Arc::new(DiscoveryAdapter::new(
            provider,
            setup.clone(),
            settings.clone(),
            Arc::clone(&spawner),
            namer.clone(),
            Arc::clone(&output),
        ));
        let execution = Arc::new(ExecutionAdapter::new(
            provider, setup, settings, spawner, namer, output,
        ));
        Self::new(
            workspace,
            provider,
            TestTree::new().shared(),
            discovery,
            execution,
            telemetry,
        )
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn provider(&self) -> TestProvider {
        self.provider
    }

    pub fn tree(&self) -> &SharedTestTree {
        self.resolver.tree()
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering.is_busy()
    }

    pub fn is_executing(&self) -> bool {
        self.executing.is_busy()
    }

    /// Discover tests, or join the discovery already in flight.
    ///
    /// Host-side failures get an error node and telemetry and are returned.
    pub async fn discover_tests(&self, cancel: &CancellationToken) -> SharedResult<()> {
        let workspace = self.workspace.clone();
        let provider = self.provider;
        let resolver = self.resolver.clone();
        let discovery = Arc::clone(&self.discovery);
        let telemetry = Arc::clone(&self.telemetry);
        let cancel = cancel.clone();

        self.discovering
            .run_or_join("Test discovery", move || {
                async move {
                    telemetry.send(TelemetryEvent::discovery_start(provider));
                    let result = discovery
                        .discover_tests(&workspace, &resolver, &cancel)
                        .await;

                    let error_id = discovery_error_id(&workspace);
                    let failed = match &result {
                        Ok(resolution) => *resolution == DiscoveryResolution::ErrorRecorded,
                        Err(e) => {
                            error!(
                                "Test discovery failed for {}: {}",
                                workspace.display(),
                                e
                            );
                            let cancelled = cancel.is_cancelled() || e.is_cancelled();
                            let text = e.to_string();
                            let label = error_label(
                                &discovery_error_base(provider, cancelled),
                                &workspace,
                                &text,
                            );
                            upsert_error_node(&mut resolver.tree().lock(), &error_id, label, text);
                            true
                        }
                    };
                    telemetry.send(TelemetryEvent::discovery_done(provider, failed));
                    result.map(|_| ()).map_err(Arc::new)
                }
                .boxed()
            })
            .await
    }

    /// Run the leaf cases beneath `includes`, or join the run in flight.
    ///
    /// Every case is marked started before any runner is launched. Run ids
    /// are split into at most `max_parallel_instances` batches that run
    /// concurrently.
    pub async fn execute_tests(
        &self,
        includes: &[String],
        cancel: &CancellationToken,
        profile: RunProfile,
    ) -> SharedResult<Arc<TestRun>> {
        let workspace = self.workspace.clone();
        let provider = self.provider;
        let resolver = self.resolver.clone();
        let execution = Arc::clone(&self.execution);
        let telemetry = Arc::clone(&self.telemetry);
        let cancel = cancel.clone();
        let includes = includes.to_vec();

        self.executing
            .run_or_join("Test execution", move || {
                async move {
                    let error_id = execution_error_id(&workspace);
                    let cases: Vec<(String, String)> = {
                        let mut tree = resolver.tree().lock();
                        tree.remove(&error_id);
                        tree.leaves_under(&includes)
                            .into_iter()
                            .filter_map(|leaf| {
                                tree.run_id_for(&leaf.id)
                                    .map(|run_id| (leaf.id.clone(), run_id.to_string()))
                            })
                            .collect()
                    };

                    let run = Arc::new(TestRun::new(cases.iter().map(|(_, run_id)| run_id.clone())));
                    for (entity, _) in &cases {
                        run.started(entity);
                    }
                    if cases.is_empty() {
                        info!("No tests to run in {}", workspace.display());
                        run.end();
                        return Ok(run);
                    }

                    let run_ids: Vec<String> = cases.into_iter().map(|(_, run_id)| run_id).collect();
                    let parallel = execution.max_parallel_instances(&workspace).await;
                    let batches = split_batches(run_ids, parallel);
                    debug!(
                        "Running {} batches for {}",
                        batches.len(),
                        workspace.display()
                    );

                    let results = join_all(batches.into_iter().map(|batch| {
                        execution.run_tests(
                            &workspace,
                            batch,
                            Arc::clone(&run),
                            &resolver,
                            &cancel,
                            profile,
                        )
                    }))
                    .await;
                    run.end();

                    match results.into_iter().find_map(Result::err) {
                        None => Ok(run),
                        Some(e) => {
                            error!("Test execution failed for {}: {}", workspace.display(), e);
                            let cancelled = cancel.is_cancelled() || e.is_cancelled();
                            telemetry.send(TelemetryEvent::execution_failed(provider, cancelled));
                            let text = e.to_string();
                            let label = error_label(
                                &execution_error_base(provider, cancelled),
                                &workspace,
                                &text,
                            );
                            upsert_error_node(&mut resolver.tree().lock(), &error_id, label, text);
                            Err(Arc::new(e))
                        }
                    }
                }
                .boxed()
            })
            .await
    }
}

/// Split `ids` into at most `parallel` contiguous batches of near-equal size
pub fn split_batches(ids: Vec<String>, parallel: usize) -> Vec<Vec<String>> {
    if ids.is_empty() {
        return Vec::new();
    }
    let parallel = parallel.clamp(1, ids.len());
    let size = ids.len().div_ceil(parallel);
    ids.chunks(size).map(<[String]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{RecordingTelemetry, DISCOVERY_DONE, EXECUTION_FAILED};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use testbridge_common::{DiscoveryPayload, ExecutionPayload, Outcome, TestOutcomeRecord};

    /// Discovery double that reconciles a fixed payload after a delay
    struct FakeDiscovery {
        calls: AtomicUsize,
        payload: Option<DiscoveryPayload>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl TestDiscoveryAdapter for FakeDiscovery {
        async fn discover_tests(
            &self,
            _workspace: &Path,
            resolver: &ResultResolver,
            cancel: &CancellationToken,
        ) -> testbridge_common::Result<DiscoveryResolution> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Spawn {
                    program: "python".into(),
                    reason: "No module named 'pytest'".into(),
                });
            }
            Ok(match &self.payload {
                Some(payload) => resolver.resolve_discovery(payload, cancel),
                None => DiscoveryResolution::Ignored,
            })
        }
    }

    /// Execution double that passes every run id it is given
    #[derive(Default)]
    struct FakeExecution {
        batches: Mutex<Vec<Vec<String>>>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl TestExecutionAdapter for FakeExecution {
        async fn run_tests(
            &self,
            _workspace: &Path,
            run_ids: Vec<String>,
            run: Arc<TestRun>,
            resolver: &ResultResolver,
            cancel: &CancellationToken,
            _profile: RunProfile,
        ) -> testbridge_common::Result<()> {
            self.batches.lock().push(run_ids.clone());
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Process("runner crashed".into()));
            }
            let result: BTreeMap<String, TestOutcomeRecord> = run_ids
                .iter()
                .map(|id| (id.clone(), TestOutcomeRecord::new(id.clone(), Outcome::Success)))
                .collect();
            resolver.resolve_execution(&ExecutionPayload::success("/w", result), &run, cancel);
            Ok(())
        }

        async fn max_parallel_instances(&self, _workspace: &Path) -> usize {
            2
        }
    }

    fn scenario() -> DiscoveryPayload {
        serde_json::from_value(json!({
            "cwd": "/w",
            "status": "success",
            "tests": {
                "name": "w", "path": "/w", "type_": "folder", "id_": "/w",
                "children": [{
                    "name": "test_a.py", "path": "/w/test_a.py", "type_": "file", "id_": "/w/test_a.py",
                    "children": [
                        {"name": "t1", "path": "/w/test_a.py", "type_": "test", "id_": "a::t1", "runID": "a::t1", "lineno": 3},
                        {"name": "t2", "path": "/w/test_a.py", "type_": "test", "id_": "a::t2", "runID": "a::t2", "lineno": 7},
                        {"name": "t3", "path": "/w/test_a.py", "type_": "test", "id_": "a::t3", "runID": "a::t3", "lineno": 9}
                    ]
                }]
            }
        }))
        .unwrap()
    }

    fn adapter(
        discovery: Arc<FakeDiscovery>,
        execution: Arc<FakeExecution>,
        telemetry: Arc<RecordingTelemetry>,
    ) -> WorkspaceTestAdapter {
        WorkspaceTestAdapter::new(
            "/w",
            TestProvider::Pytest,
            TestTree::new().shared(),
            discovery,
            execution,
            telemetry,
        )
    }

    fn fake_discovery(fail: bool) -> Arc<FakeDiscovery> {
        Arc::new(FakeDiscovery {
            calls: AtomicUsize::new(0),
            payload: Some(scenario()),
            fail,
            delay: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn test_concurrent_discovery_spawns_once() {
        let discovery = fake_discovery(false);
        let adapter = adapter(
            Arc::clone(&discovery),
            Arc::default(),
            Arc::default(),
        );
        let token = CancellationToken::new();

        let (a, b) = tokio::join!(adapter.discover_tests(&token), adapter.discover_tests(&token));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);
        assert!(!adapter.is_discovering());

        // Back to idle: the next request starts a fresh discovery
        adapter.discover_tests(&token).await.unwrap();
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_discovery_failure_creates_error_node() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let adapter = adapter(fake_discovery(true), Arc::default(), Arc::clone(&telemetry));

        let err = adapter
            .discover_tests(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(*err, Error::Spawn { .. }));

        let tree = adapter.tree().lock();
        let node = tree.get("DiscoveryError:/w").unwrap();
        assert_eq!(node.label, "pytest Discovery Error [w]: missing module 'pytest'");
        let done = telemetry.named(DISCOVERY_DONE);
        assert_eq!(done[0].properties["failed"], true);
    }

    #[tokio::test]
    async fn test_execute_marks_started_and_batches() {
        let execution = Arc::new(FakeExecution::default());
        let adapter = adapter(fake_discovery(false), Arc::clone(&execution), Arc::default());
        let token = CancellationToken::new();
        adapter.discover_tests(&token).await.unwrap();

        let run = adapter
            .execute_tests(&["/w/test_a.py".to_string(), "a::t1".to_string()], &token, RunProfile::Run)
            .await
            .unwrap();
        assert!(run.is_ended());
        for id in ["a::t1", "a::t2", "a::t3"] {
            assert!(run.is_started(id));
            assert_eq!(run.result(id).unwrap().state, crate::run::TestState::Passed);
        }
        let batches = execution.batches.lock().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 3);
    }

    #[tokio::test]
    async fn test_execution_failure_error_node_cleared_next_run() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let failing = Arc::new(FakeExecution {
            fail: true,
            ..Default::default()
        });
        let tree = TestTree::new().shared();
        let discovery = fake_discovery(false);
        let broken = WorkspaceTestAdapter::new(
            "/w",
            TestProvider::Unittest,
            Arc::clone(&tree),
            discovery.clone(),
            failing,
            telemetry.clone(),
        );
        let token = CancellationToken::new();
        broken.discover_tests(&token).await.unwrap();
        assert!(broken
            .execute_tests(&["/w".to_string()], &token, RunProfile::Run)
            .await
            .is_err());
        assert_eq!(
            tree.lock().get("ExecutionError:/w").unwrap().label,
            "Unittest Execution Error [w]"
        );
        assert_eq!(telemetry.named(EXECUTION_FAILED)[0].properties["cancelled"], false);

        let working = WorkspaceTestAdapter::new(
            "/w",
            TestProvider::Unittest,
            Arc::clone(&tree),
            discovery,
            Arc::new(FakeExecution::default()),
            telemetry,
        );
        working
            .execute_tests(&["/w".to_string()], &token, RunProfile::Run)
            .await
            .unwrap();
        assert!(!tree.lock().contains("ExecutionError:/w"));
    }

    #[tokio::test]
    async fn test_execute_with_unknown_ids_runs_nothing() {
        let execution = Arc::new(FakeExecution::default());
        let adapter = adapter(fake_discovery(false), Arc::clone(&execution), Arc::default());
        let run = adapter
            .execute_tests(&["missing".to_string()], &CancellationToken::new(), RunProfile::Run)
            .await
            .unwrap();
        assert!(run.is_ended());
        assert!(execution.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_discovery_returns_to_idle() {
        let discovery = fake_discovery(false);
        let adapter = adapter(Arc::clone(&discovery), Arc::default(), Arc::default());
        let token = CancellationToken::new();

        // The only caller stops waiting long before the discovery finishes
        let gave_up =
            tokio::time::timeout(Duration::from_millis(5), adapter.discover_tests(&token)).await;
        assert!(gave_up.is_err());
        assert!(adapter.is_discovering());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!adapter.is_discovering());
        assert!(adapter.tree().lock().contains("a::t1"));

        // A fresh discovery runs instead of replaying the finished one
        adapter.discover_tests(&token).await.unwrap();
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_runs_share_one_run() {
        let execution = Arc::new(FakeExecution {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let adapter = adapter(fake_discovery(false), Arc::clone(&execution), Arc::default());
        let token = CancellationToken::new();
        adapter.discover_tests(&token).await.unwrap();

        let everything = ["/w".to_string()];
        let one = ["a::t1".to_string()];
        let (a, b) = tokio::join!(
            adapter.execute_tests(&everything, &token, RunProfile::Run),
            adapter.execute_tests(&one, &token, RunProfile::Run)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.summary().passed, 3);
        // One set of batches for three ids over two instances
        assert_eq!(execution.batches.lock().len(), 2);
        assert!(!adapter.is_executing());
    }

    #[tokio::test]
    async fn test_execution_not_blocked_by_discovery() {
        let discovery = Arc::new(FakeDiscovery {
            calls: AtomicUsize::new(0),
            payload: Some(scenario()),
            fail: false,
            delay: Duration::from_secs(30),
        });
        let adapter = adapter(discovery, Arc::default(), Arc::default());
        let token = CancellationToken::new();
        adapter.resolver.resolve_discovery(&scenario(), &token);

        let run = tokio::select! {
            biased;
            _ = adapter.discover_tests(&token) => panic!("slow discovery finished first"),
            run = tokio::time::timeout(Duration::from_secs(5), async {
                assert!(adapter.is_discovering());
                adapter.execute_tests(&["/w".to_string()], &token, RunProfile::Run).await
            }) => run.unwrap().unwrap(),
        };
        assert_eq!(run.summary().passed, 3);
        assert!(adapter.is_discovering());
    }

    #[tokio::test]
    async fn test_discovery_done_reports_this_run_only() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let discovery = Arc::new(FakeDiscovery {
            calls: AtomicUsize::new(0),
            payload: None,
            fail: false,
            delay: Duration::ZERO,
        });
        let adapter = adapter(discovery, Arc::default(), Arc::clone(&telemetry));
        // Left over from an earlier failed discovery
        upsert_error_node(
            &mut adapter.tree().lock(),
            &discovery_error_id(Path::new("/w")),
            "pytest Discovery Error [w]".to_string(),
            "boom".to_string(),
        );

        adapter.discover_tests(&CancellationToken::new()).await.unwrap();
        assert_eq!(telemetry.named(DISCOVERY_DONE)[0].properties["failed"], false);
    }

    #[test]
    fn test_split_batches() {
        let ids: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let batches = split_batches(ids.clone(), 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(split_batches(ids.clone(), 0).len(), 1);
        assert_eq!(split_batches(ids, 10).len(), 5);
        assert!(split_batches(Vec::new(), 3).is_empty());
    }
}

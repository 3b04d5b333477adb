//! Execution through the fake runner over a real pipe

mod support;

use serde_json::json;
use std::path::PathBuf;
use support::{discovery_script, within, Harness};
use testbridge_common::{TestProvider, COVERAGE_ENABLED_ENV, RUN_TEST_IDS_PIPE_ENV};
use testbridge_e2e::RunnerScript;
use testbridge_host::run::RunEvent;
use testbridge_host::{RunProfile, TestState};
use tokio_util::sync::CancellationToken;

async fn discovered(provider: TestProvider, tests: &[&str]) -> Harness {
    let h = Harness::new(provider, RunnerScript::default());
    h.spawner.set_script(discovery_script(&h.workspace, tests));
    within(h.adapter.discover_tests(&CancellationToken::new()))
        .await
        .unwrap();
    h
}

fn result_events(events: &[RunEvent], entity: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RunEvent::Result { entity: id, .. } if id == entity))
        .count()
}

#[tokio::test]
async fn passing_test_is_reported_exactly_once() {
    let h = discovered(TestProvider::Pytest, &["t1"]).await;
    // The runner repeats itself
    h.spawner.set_script(RunnerScript {
        payloads: vec![json!({
            "cwd": h.ws(),
            "status": "success",
            "result": {"test_a.py::t1": {"test": "test_a.py::t1", "outcome": "success"}},
        })],
        echo_ids: Some("success".to_string()),
        ..Default::default()
    });

    let run = within(h.adapter.execute_tests(&["test_a.py::t1".to_string()], &CancellationToken::new(), RunProfile::Run))
        .await
        .unwrap();

    assert!(run.is_ended());
    assert!(run.is_started("test_a.py::t1"));
    assert_eq!(run.result("test_a.py::t1").unwrap().state, TestState::Passed);
    assert_eq!(result_events(&run.events(), "test_a.py::t1"), 1);
    assert_eq!(h.pipes_left(), 0);
}

#[tokio::test]
async fn duplicate_outcomes_keep_the_first() {
    let h = discovered(TestProvider::Pytest, &["t1"]).await;
    let failure = json!({
        "cwd": h.ws(),
        "status": "success",
        "result": {"test_a.py::t1": {
            "test": "test_a.py::t1",
            "outcome": "failure",
            "message": "assert 1 == 2",
            "traceback": "test_a.py:3\nAssertionError",
        }},
    });
    h.spawner.set_script(RunnerScript {
        payloads: vec![failure],
        echo_ids: Some("success".to_string()),
        ..Default::default()
    });

    let run = within(h.adapter.execute_tests(&[h.file_id()], &CancellationToken::new(), RunProfile::Run))
        .await
        .unwrap();

    let result = run.result("test_a.py::t1").unwrap();
    assert_eq!(result.state, TestState::Failed);
    let message = result.message.unwrap();
    assert_eq!(
        message.text,
        "test_a.py::t1 failed: assert 1 == 2\r\ntest_a.py:3\r\nAssertionError"
    );
    assert_eq!(message.location.unwrap().range.unwrap().start, 2);
    assert_eq!(result_events(&run.events(), "test_a.py::t1"), 1);
}

#[tokio::test]
async fn crashed_runner_errors_every_requested_test() {
    let h = discovered(TestProvider::Pytest, &["t1", "t2"]).await;
    h.spawner.set_script(RunnerScript {
        exit_code: 3,
        ..Default::default()
    });

    let run = within(h.adapter.execute_tests(&[h.ws()], &CancellationToken::new(), RunProfile::Run))
        .await
        .unwrap();

    for id in ["test_a.py::t1", "test_a.py::t2"] {
        let result = run.result(id).unwrap();
        assert_eq!(result.state, TestState::Errored);
        assert!(result.message.unwrap().text.contains("Code: 3, Signal: null"));
    }
    // Process failures are reported per test, not as a host error
    assert!(!h
        .adapter
        .tree()
        .lock()
        .contains(&format!("ExecutionError:{}", h.ws())));
}

#[tokio::test]
async fn reported_results_survive_a_crash() {
    let h = discovered(TestProvider::Pytest, &["t1", "t2"]).await;
    h.spawner.set_script(RunnerScript {
        payloads: vec![json!({
            "cwd": h.ws(),
            "status": "success",
            "result": {"test_a.py::t1": {"test": "test_a.py::t1", "outcome": "success"}},
        })],
        exit_code: 3,
        ..Default::default()
    });

    let run = within(h.adapter.execute_tests(&[h.file_id()], &CancellationToken::new(), RunProfile::Run))
        .await
        .unwrap();

    assert_eq!(run.result("test_a.py::t1").unwrap().state, TestState::Passed);
    assert_eq!(run.result("test_a.py::t2").unwrap().state, TestState::Errored);
}

#[tokio::test]
async fn exit_code_one_is_tests_failed_for_pytest() {
    let h = discovered(TestProvider::Pytest, &["t1"]).await;
    h.spawner.set_script(RunnerScript {
        echo_ids: Some("failure".to_string()),
        exit_code: 1,
        ..Default::default()
    });

    let run = within(h.adapter.execute_tests(&[h.file_id()], &CancellationToken::new(), RunProfile::Run))
        .await
        .unwrap();

    let result = run.result("test_a.py::t1").unwrap();
    assert_eq!(result.state, TestState::Failed);
    assert!(!result.message.unwrap().text.contains("terminated"));
}

#[tokio::test]
async fn malformed_connection_does_not_break_the_run() {
    let h = discovered(TestProvider::Pytest, &["t1"]).await;
    h.spawner.set_script(RunnerScript {
        raw: Some("Content-Length: nope\n\n{}".to_string()),
        echo_ids: Some("success".to_string()),
        ..Default::default()
    });

    let run = within(h.adapter.execute_tests(&[h.file_id()], &CancellationToken::new(), RunProfile::Run))
        .await
        .unwrap();
    assert_eq!(run.result("test_a.py::t1").unwrap().state, TestState::Passed);
}

#[tokio::test]
async fn test_ids_file_is_written_and_removed() {
    let h = discovered(TestProvider::Unittest, &["t1", "t2"]).await;
    h.spawner.set_script(RunnerScript {
        echo_ids: Some("success".to_string()),
        ..Default::default()
    });

    let run = within(h.adapter.execute_tests(&[h.ws()], &CancellationToken::new(), RunProfile::Run))
        .await
        .unwrap();
    assert_eq!(run.summary().passed, 2);

    let command = h.spawner.spawned().pop().unwrap();
    assert!(command.args[0].ends_with("unittestadapter/execution.py"));
    let ids_file = PathBuf::from(&command.env[RUN_TEST_IDS_PIPE_ENV]);
    let name = ids_file.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("test-ids-") && name.ends_with(".txt"));
    assert!(!ids_file.exists());
}

#[tokio::test]
async fn parallel_instances_split_the_run() {
    let h = Harness::with_settings(TestProvider::Pytest, RunnerScript::default(), |s| {
        s.max_parallel_instances = 2;
    });
    h.spawner.set_script(discovery_script(&h.workspace, &["t1", "t2", "t3"]));
    within(h.adapter.discover_tests(&CancellationToken::new()))
        .await
        .unwrap();

    h.spawner.set_script(RunnerScript {
        echo_ids: Some("success".to_string()),
        delay_ms: 50,
        ..Default::default()
    });
    let run = within(h.adapter.execute_tests(&[h.ws()], &CancellationToken::new(), RunProfile::Debug))
        .await
        .unwrap();

    assert_eq!(run.summary().passed, 3);
    let executions: Vec<_> = h
        .spawner
        .spawned()
        .into_iter()
        .filter(|c| c.env.contains_key(RUN_TEST_IDS_PIPE_ENV))
        .collect();
    assert_eq!(executions.len(), 2);
    assert!(executions
        .iter()
        .all(|c| c.args.iter().any(|a| a == "--capture=no")));
    assert_ne!(
        executions[0].env[RUN_TEST_IDS_PIPE_ENV],
        executions[1].env[RUN_TEST_IDS_PIPE_ENV]
    );
}

#[tokio::test]
async fn cancelled_run_records_nothing() {
    let h = discovered(TestProvider::Pytest, &["t1"]).await;
    h.spawner.set_script(RunnerScript {
        delay_ms: 10_000,
        echo_ids: Some("success".to_string()),
        ..Default::default()
    });
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let run = within(h.adapter.execute_tests(&[h.file_id()], &token, RunProfile::Run))
        .await
        .unwrap();

    assert!(run.is_started("test_a.py::t1"));
    assert!(run.result("test_a.py::t1").is_none());
    assert_eq!(run.summary().not_run, 1);
    assert_eq!(h.pipes_left(), 0);
}

#[tokio::test]
async fn coverage_run_records_file_coverage() {
    let h = discovered(TestProvider::Pytest, &["t1"]).await;
    let lib = h.workspace.join("lib.py").display().to_string();
    h.spawner.set_script(RunnerScript {
        payloads: vec![json!({
            "coverage": true,
            "cwd": h.ws(),
            "result": {lib.clone(): {
                "lines_covered": [1, 2, 3],
                "lines_missed": [5],
                "executed_branches": 1,
                "total_branches": 2,
            }},
        })],
        echo_ids: Some("success".to_string()),
        ..Default::default()
    });

    let run = within(h.adapter.execute_tests(&[h.file_id()], &CancellationToken::new(), RunProfile::Coverage))
        .await
        .unwrap();

    assert_eq!(run.result("test_a.py::t1").unwrap().state, TestState::Passed);
    let file = run.file_coverage(&lib).unwrap();
    assert_eq!((file.lines.covered, file.lines.total), (3, 4));
    assert_eq!(file.branches.map(|b| (b.covered, b.total)), Some((1, 2)));

    let command = h.spawner.spawned().pop().unwrap();
    assert_eq!(command.env[COVERAGE_ENABLED_ENV], "True");
}

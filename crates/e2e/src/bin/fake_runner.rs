//! Stand-in for the Python runner plugins
//!
//! Reads a `RunnerScript` from the environment, connects back to the host
//! over `TEST_RUN_PIPE` and replays it.

use futures::SinkExt;
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::time::Duration;
use testbridge_common::{
    ExecutionPayload, Frame, FrameCodec, Outcome, TestOutcomeRecord, RUN_TEST_IDS_PIPE_ENV,
    TEST_RUN_PIPE_ENV,
};
use testbridge_e2e::{E2eError, E2eResult, RunnerScript};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::codec::FramedWrite;
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("fake runner failed: {}", e);
            ExitCode::from(70)
        }
    }
}

async fn run() -> E2eResult<u8> {
    let script = RunnerScript::from_env()?;

    if let Some(pid_file) = &script.pid_file {
        tokio::fs::write(pid_file, std::process::id().to_string()).await?;
    }
    for line in &script.stdout {
        println!("{}", line);
    }
    for line in &script.stderr {
        eprintln!("{}", line);
    }

    if script.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(script.delay_ms)).await;
    }

    if script.connects() {
        let pipe = std::env::var(TEST_RUN_PIPE_ENV).map_err(|_| E2eError::MissingEnv(TEST_RUN_PIPE_ENV))?;
        send(&script, &pipe).await?;
    }

    if script.linger_ms > 0 {
        tokio::time::sleep(Duration::from_millis(script.linger_ms)).await;
    }

    u8::try_from(script.exit_code)
        .map_err(|_| E2eError::Script(format!("exit code {} out of range", script.exit_code)))
}

async fn send(script: &RunnerScript, pipe: &str) -> E2eResult<()> {
    if let Some(raw) = &script.raw {
        let mut stream = UnixStream::connect(pipe)
            .await
            .map_err(|e| E2eError::Pipe(format!("connect {}: {}", pipe, e)))?;
        stream.write_all(raw.as_bytes()).await?;
        stream.shutdown().await?;
    }

    let stream = UnixStream::connect(pipe)
        .await
        .map_err(|e| E2eError::Pipe(format!("connect {}: {}", pipe, e)))?;
    let mut sink = FramedWrite::new(stream, FrameCodec::new());

    for payload in &script.payloads {
        sink.send(Frame::json(payload)?).await?;
    }

    if let Some(outcome) = &script.echo_ids {
        let ids_file = std::env::var(RUN_TEST_IDS_PIPE_ENV)
            .map_err(|_| E2eError::MissingEnv(RUN_TEST_IDS_PIPE_ENV))?;
        let contents = tokio::fs::read_to_string(&ids_file).await?;
        let cwd = std::env::current_dir()?.display().to_string();
        let result: BTreeMap<String, TestOutcomeRecord> = contents
            .lines()
            .filter(|id| !id.is_empty())
            .map(|id| {
                (
                    id.to_string(),
                    TestOutcomeRecord::new(id, Outcome::from(outcome.clone())),
                )
            })
            .collect();
        debug!("Reporting {} results", result.len());
        sink.send(Frame::json(&ExecutionPayload::success(cwd, result))?)
            .await?;
    }

    sink.close().await?;
    Ok(())
}

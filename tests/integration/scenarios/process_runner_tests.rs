use anyhow::Result;
use std::time::{Duration, Instant};
use testbed::runner::{CommandError, CommandRunner, Invocation, ProcessRunner, RunnerConfig};
use testbed::Environment;
use tokio_util::sync::CancellationToken;

fn runner() -> ProcessRunner {
    ProcessRunner::new(RunnerConfig {
        debug: false,
        interrupt_grace: Duration::from_secs(2),
    })
}

fn sh(script: &str) -> Invocation {
    Invocation::new("sh").args(["-c", script])
}

/// Captured stdout reflects the environment overlay on top of the inherited one
#[tokio::test]
async fn test_environment_overlay_and_capture() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let env = Environment::new().with("TEST_RUN_ID", "0123456789ab");
    let output = runner()
        .run(
            sh(r#"echo "$TEST_RUN_ID"; test -n "$PATH" && echo inherited"#)
                .env(env)
                .capture_stdout(),
            &CancellationToken::new(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e:#}"))?;

    assert_eq!(output.stdout_lossy(), "0123456789ab\ninherited\n");
    Ok(())
}

/// Stdin payloads reach the child, as used by `kubectl apply -f -`
#[tokio::test]
async fn test_stdin_payload() -> Result<()> {
    let output = runner()
        .run(
            Invocation::new("cat").stdin(b"kind: ConfigMap\n".to_vec()).capture_stdout(),
            &CancellationToken::new(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e:#}"))?;

    assert_eq!(output.stdout, b"kind: ConfigMap\n");
    Ok(())
}

/// Daemon errors are reduced to their message
#[tokio::test]
async fn test_failure_reports_daemon_message() -> Result<()> {
    let err = runner()
        .run(
            sh("echo 'Error response from daemon: network testbed-stack_default not found' >&2; exit 1"),
            &CancellationToken::new(),
        )
        .await
        .expect_err("command should fail");

    match err.downcast_ref::<CommandError>() {
        Some(CommandError::Failed { code, stderr, .. }) => {
            assert_eq!(*code, Some(1));
            assert_eq!(stderr, "network testbed-stack_default not found");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

/// Cancelling interrupts the running process instead of waiting for it
#[tokio::test]
async fn test_cancel_interrupts_process() -> Result<()> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = runner()
        .run(Invocation::new("sleep").arg("30"), &cancel)
        .await
        .expect_err("cancelled command should fail");

    assert!(started.elapsed() < Duration::from_secs(10), "process was not interrupted");
    assert!(matches!(
        err.downcast_ref::<CommandError>(),
        Some(CommandError::Cancelled { .. })
    ));
    Ok(())
}

/// A missing program is a spawn error naming the command
#[tokio::test]
async fn test_missing_program() -> Result<()> {
    let err = runner()
        .run(Invocation::new("testbed-no-such-binary").arg("--version"), &CancellationToken::new())
        .await
        .expect_err("spawn should fail");

    assert!(matches!(err.downcast_ref::<CommandError>(), Some(CommandError::Spawn { .. })));
    assert!(err.to_string().contains("testbed-no-such-binary --version"));
    Ok(())
}

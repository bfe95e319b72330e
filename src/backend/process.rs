//! Spawn-and-wait with a hard deadline.
//!
//! Every exit path reaps the child: normal completion waits on it, timeout
//! kills and waits, and dropping the future (caller cancellation) kills it
//! through `kill_on_drop`.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{ExecError, ProcessOutput};

/// Run `cmd`, write `stdin` to it, and collect its output within `timeout`.
#[instrument(skip(cmd, stdin), fields(stdin_len = stdin.len()))]
pub async fn run_with_timeout(
    mut cmd: Command,
    stdin: &str,
    timeout: Duration,
) -> Result<ProcessOutput, ExecError> {
    let program = format!("{:?}", cmd.as_std().get_program());

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: program.clone(),
        source,
    })?;

    let mut child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| ExecError::Transport("failed to open stdin".into()))?;
    // Take pipe handles out so `child` stays in scope for kill-on-timeout
    let mut child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::Transport("failed to open stdout".into()))?;
    let mut child_stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::Transport("failed to open stderr".into()))?;

    let input = stdin.as_bytes().to_vec();
    let io = async {
        let feed = async move {
            // A child that exits without reading stdin closes the pipe early
            if let Err(e) = child_stdin.write_all(&input).await {
                debug!(error = %e, "Child closed stdin before all input was written");
            }
            drop(child_stdin);
        };
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let ((), r1, r2) = tokio::join!(
            feed,
            child_stdout.read_to_end(&mut stdout_buf),
            child_stderr.read_to_end(&mut stderr_buf),
        );
        r1.map_err(|e| ExecError::Transport(format!("failed to read stdout: {e}")))?;
        r2.map_err(|e| ExecError::Transport(format!("failed to read stderr: {e}")))?;
        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::Transport(format!("failed to wait for process: {e}")))?;
        Ok::<_, ExecError>((status, stdout_buf, stderr_buf))
    };

    let outcome = tokio::time::timeout(timeout, io).await;
    let (status, stdout_buf, stderr_buf) = if let Ok(result) = outcome {
        result?
    } else {
        if let Err(e) = child.kill().await {
            warn!(program = %program, error = %e, "Failed to kill timed-out process");
        }
        return Err(ExecError::Timeout(timeout));
    };

    let output = ProcessOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
    };

    debug!(exit_code = output.exit_code, "Process completed");
    Ok(output)
}

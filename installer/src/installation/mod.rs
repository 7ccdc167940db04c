// Installation logic
//
// The install pipeline (orchestrator), the filesystem permission gate, and the shared runner for
// external commands (fetch tool, extract tool, application installer) with timeouts.
//
// IMPORTANT:
// - Never log secret parameter values (database password, admin password, encryption key).
// - Commands are run as argument vectors; nothing goes through a shell.

pub mod error;
pub mod guard;
pub mod host_fs;
pub mod installer_output;
pub mod lock;
pub mod orchestrator;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub timeout: Duration,
    /// Short label used in logs (`fetch`, `extract`, `installer`).
    pub operation: &'a str,
    /// Flag names whose following value is masked in logs.
    pub secret_flags: &'a [&'a str],
}

impl CommandSpec<'_> {
    fn args_for_log(&self) -> String {
        crate::utils::logging::mask_flag_values(self.args, self.secret_flags).join(", ")
    }
}

/// Failures worth another attempt: the process never started because the system was briefly
/// out of something. A started process is never re-run.
fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_ascii_lowercase();
    if msg.contains("timed out") {
        return false;
    }
    msg.contains("failed to spawn")
        && (msg.contains("temporarily")
            || msg.contains("text file busy")
            || msg.contains("resource")
            || msg.contains("try again"))
}

async fn run_cmd_with_timeout_once(spec: &CommandSpec<'_>) -> Result<CommandOutput> {
    let started = Instant::now();
    let program = spec.program;
    let operation = spec.operation;

    debug!(
        "[PHASE: install] [STEP: cmd] run_cmd_with_timeout_once entered (operation={}, program={}, args=[{}], cwd={:?}, timeout_ms={})",
        operation,
        program,
        spec.args_for_log(),
        spec.cwd,
        spec.timeout.as_millis()
    );

    let mut cmd = Command::new(program);
    cmd.args(spec.args)
        .current_dir(spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            program, operation
        )
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", operation))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(spec.timeout, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e)).with_context(|| {
                format!(
                    "Command wait failed (operation={}, program={})",
                    operation, program
                )
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: install] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); attempting to kill process",
                operation,
                program,
                spec.timeout.as_millis()
            );

            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: install] [STEP: cmd] Failed to kill timed-out process (operation={}, program={}): {}",
                    operation, program, e
                );
            }

            // Reap so the child does not linger as a zombie.
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            return Err(anyhow::anyhow!(
                "Command timed out after {}ms (operation={}, program={})",
                spec.timeout.as_millis(),
                operation,
                program
            ));
        }
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: install] [STEP: cmd] run_cmd_with_timeout_once exit (operation={}, program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        operation,
        program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}

/// Run an external command with a timeout. Spawn failures caused by transient resource
/// exhaustion are retried up to 3 times; nothing is retried once the process has started.
///
/// Returns captured stdout/stderr even when exit code is non-zero (caller decides success).
pub async fn run_cmd_with_timeout(spec: &CommandSpec<'_>) -> Result<CommandOutput> {
    let started = Instant::now();
    info!(
        "[PHASE: install] [STEP: cmd] run_cmd_with_timeout entered (operation={}, program={}, args_count={}, timeout_ms={})",
        spec.operation,
        spec.program,
        spec.args.len(),
        spec.timeout.as_millis()
    );

    let retry_strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(3)
        .map(jitter);

    let result = RetryIf::spawn(
        retry_strategy,
        || run_cmd_with_timeout_once(spec),
        |e: &anyhow::Error| {
            let transient = is_transient_exec_error(e);
            if transient {
                warn!(
                    "[PHASE: install] [STEP: cmd] Transient spawn failure; will retry (operation={}, program={}, err={:#})",
                    spec.operation, spec.program, e
                );
            }
            transient
        },
    )
    .await;

    match &result {
        Ok(out) => {
            info!(
                "[PHASE: install] [STEP: cmd] run_cmd_with_timeout exit (operation={}, program={}, exit_code={:?}, duration_ms={})",
                spec.operation,
                spec.program,
                out.exit_code,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!(
                "[PHASE: install] [STEP: cmd] run_cmd_with_timeout error (operation={}, program={}, duration_ms={}, err={:#})",
                spec.operation,
                spec.program,
                started.elapsed().as_millis(),
                e
            );
        }
    }

    result
}

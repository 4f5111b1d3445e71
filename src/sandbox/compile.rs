use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::time::timeout;

/// Fixed ceiling for any compiler, independent of the problem's time limit
pub(super) const COMPILE_TIMEOUT: Duration = Duration::from_secs(30);

pub(super) enum CompileOutcome {
    Success,
    /// The compiler rejected the program; carries its diagnostics
    Failed(String),
    /// The compiler itself could not be started
    Unavailable(String),
}

/// Runs `command` inside `work_dir` and reports whether it succeeded
pub(super) async fn compile(work_dir: &Path, command: &[String]) -> CompileOutcome {
    let Some((program, args)) = command.split_first() else {
        return CompileOutcome::Success;
    };

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match timeout(COMPILE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return CompileOutcome::Unavailable(format!(
                "failed to start compiler `{program}`: {e}"
            ));
        }
        Err(_) => {
            return CompileOutcome::Failed(format!(
                "compilation timed out after {} seconds",
                COMPILE_TIMEOUT.as_secs()
            ));
        }
    };

    if output.status.success() {
        return CompileOutcome::Success;
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let diagnostic = if !stderr.trim().is_empty() {
        stderr.into_owned()
    } else if !output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stdout).into_owned()
    } else {
        format!("compiler exited with {}", output.status)
    };

    CompileOutcome::Failed(diagnostic)
}

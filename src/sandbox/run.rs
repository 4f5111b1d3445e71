use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use super::monitor::max_rss_kb;
use super::monitor::{looks_like_memory_error, spawn_memory_monitor};
use super::{ABORTED_MESSAGE, ExecutionResult, ExecutionStatus, Sandbox};

/// Added to the time limit for the wall-clock cutoff, so that startup and
/// teardown of the process are not charged to the program
pub(super) const RUN_OVERHEAD_MS: u64 = 1000;

/// How long to wait for pipes to drain once the process is gone
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(super) struct RunSpec<'a> {
    pub work_dir: &'a Path,
    pub command: &'a [String],
    pub stdin: &'a str,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
    pub submission_id: u64,
}

/// Observations about a finished run, before classification
#[derive(Debug, Default)]
pub(super) struct RunOutcome {
    pub timed_out: bool,
    pub aborted: bool,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed_ms: u64,
    pub memory_exceeded: bool,
    pub stderr: String,
}

impl Sandbox {
    /// Runs an already built program once under the time and memory limits
    pub(super) async fn run_program(&self, spec: RunSpec<'_>) -> ExecutionResult {
        let Some((program, args)) = spec.command.split_first() else {
            return ExecutionResult::system_error("empty run command");
        };

        let mut cmd = tokio::process::Command::new(resolve_program(spec.work_dir, program));
        cmd.args(args)
            .current_dir(spec.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.limiter.cap_memory(&mut cmd, spec.memory_limit_kb);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("Failed to start `{program}`: {e}");
                return ExecutionResult::system_error(format!("failed to start program: {e}"));
            }
        };
        let started = Instant::now();

        let kill = CancellationToken::new();
        let guard = self.registry.register(spec.submission_id, kill.clone());
        if self.registry.is_abort_requested(spec.submission_id) {
            kill.cancel();
        }

        let stop_monitor = CancellationToken::new();
        let monitor = spawn_memory_monitor(
            self.limiter.clone(),
            child.id(),
            spec.memory_limit_kb,
            kill.clone(),
            stop_monitor.clone(),
        );

        let stdin_task = child.stdin.take().map(|mut stdin| {
            let input = spec.stdin.to_owned();
            tokio::spawn(async move {
                // A program may exit without reading its input; a broken pipe is fine
                let _ = stdin.write_all(input.as_bytes()).await;
                let _ = stdin.shutdown().await;
            })
        });
        let stdout_task = child.stdout.take().map(|pipe| tokio::spawn(read_pipe(pipe)));
        let stderr_task = child.stderr.take().map(|pipe| tokio::spawn(read_pipe(pipe)));

        let cutoff = Duration::from_millis(spec.time_limit_ms.saturating_add(RUN_OVERHEAD_MS));
        // cancelled along with `kill`, so aborts and the monitor stop the wait too
        let terminate = kill.child_token();
        let waiter = wait_child(child, terminate.clone());
        tokio::pin!(waiter);
        let (waited, timed_out) = tokio::select! {
            waited = &mut waiter => (waited, false),
            _ = tokio::time::sleep(cutoff) => {
                terminate.cancel();
                (waiter.await, true)
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        drop(guard);

        stop_monitor.cancel();
        let sample = monitor.await.unwrap_or_default();
        if let Some(task) = stdin_task {
            task.abort();
        }
        let stdout = drain(stdout_task).await;
        let stderr = drain(stderr_task).await;

        let Reaped { status, max_rss_kb } = match waited {
            Ok(reaped) => reaped,
            Err(e) => {
                log::error!("Failed to wait for `{program}`: {e}");
                return ExecutionResult::system_error(format!("failed to wait for program: {e}"));
            }
        };

        let mut memory_kb = sample.usage_kb();
        if memory_kb == 0 {
            memory_kb = max_rss_kb.unwrap_or(0);
        }
        let memory_exceeded =
            sample.exceeded || (spec.memory_limit_kb > 0 && memory_kb > spec.memory_limit_kb);

        let outcome = RunOutcome {
            timed_out,
            aborted: self.registry.is_abort_requested(spec.submission_id),
            success: status.success(),
            exit_code: status.code(),
            signal: exit_signal(&status),
            elapsed_ms,
            memory_exceeded,
            stderr,
        };
        let (status, error) = classify(&outcome, spec.time_limit_ms);
        log::debug!(
            "Run of submission {} finished: {status:?} in {elapsed_ms} ms, {memory_kb} KB",
            spec.submission_id
        );

        ExecutionResult {
            status,
            time_ms: elapsed_ms,
            memory_kb,
            output: if status == ExecutionStatus::Ok {
                stdout
            } else {
                String::new()
            },
            error,
            exit_code: outcome.exit_code,
        }
    }
}

/// Decides the status of a finished run. The order of the checks matters.
pub(super) fn classify(outcome: &RunOutcome, time_limit_ms: u64) -> (ExecutionStatus, String) {
    if outcome.timed_out {
        return (ExecutionStatus::TimeLimitExceeded, String::new());
    }
    if outcome.aborted {
        return (ExecutionStatus::SystemError, ABORTED_MESSAGE.to_string());
    }
    if !outcome.success {
        if outcome.memory_exceeded || looks_like_memory_error(&outcome.stderr) {
            return (ExecutionStatus::MemoryLimitExceeded, String::new());
        }
        let error = if outcome.stderr.trim().is_empty() {
            describe_exit(outcome)
        } else {
            outcome.stderr.clone()
        };
        return (ExecutionStatus::RuntimeError, error);
    }
    if outcome.elapsed_ms > time_limit_ms {
        return (ExecutionStatus::TimeLimitExceeded, String::new());
    }
    if outcome.memory_exceeded {
        return (ExecutionStatus::MemoryLimitExceeded, String::new());
    }
    (ExecutionStatus::Ok, String::new())
}

fn describe_exit(outcome: &RunOutcome) -> String {
    match (outcome.exit_code, outcome.signal) {
        (Some(code), _) => format!("process exited with code {code}"),
        (None, Some(signal)) => format!("process killed by signal {signal}"),
        (None, None) => "process terminated abnormally".to_string(),
    }
}

/// Relative paths such as `./main` refer to the work directory
fn resolve_program(work_dir: &Path, program: &str) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        work_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Exit status of a reaped program and the peak memory recorded for it
struct Reaped {
    status: ExitStatus,
    max_rss_kb: Option<u64>,
}

/// Waits for `child` to exit, killing it once `terminate` fires.
///
/// The child is reaped with `wait4`, which reports its own peak memory even
/// when it exited before the monitor took a single sample. `child` is kept
/// alive until then so that tokio does not reap it first.
#[cfg(unix)]
async fn wait_child(child: Child, terminate: CancellationToken) -> std::io::Result<Reaped> {
    let Some(pid) = child.id() else {
        return Err(std::io::Error::other("program was already reaped"));
    };
    let mut guard = KillUnreaped {
        pid: pid as libc::pid_t,
        reaped: false,
    };
    let mut reaper = tokio::task::spawn_blocking(move || wait4_blocking(pid as libc::pid_t));

    let joined = tokio::select! {
        joined = &mut reaper => joined,
        _ = terminate.cancelled() => {
            if !reaper.is_finished() {
                guard.kill();
            }
            reaper.await
        }
    };
    let reaped = joined.map_err(std::io::Error::other)??;
    guard.reaped = true;
    drop(child);
    Ok(reaped)
}

#[cfg(not(unix))]
async fn wait_child(mut child: Child, terminate: CancellationToken) -> std::io::Result<Reaped> {
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = terminate.cancelled() => {
            if let Err(e) = child.start_kill() {
                log::debug!("Kill request failed, the process has probably exited: {e}");
            }
            child.wait().await?
        }
    };
    Ok(Reaped {
        status,
        max_rss_kb: None,
    })
}

/// Kills a process that was never reaped, e.g. when its run is abandoned
#[cfg(unix)]
struct KillUnreaped {
    pid: libc::pid_t,
    reaped: bool,
}

#[cfg(unix)]
impl KillUnreaped {
    fn kill(&self) {
        // SAFETY: plain syscall on a pid that is still ours, since it was not reaped yet
        if unsafe { libc::kill(self.pid, libc::SIGKILL) } != 0 {
            log::debug!(
                "Kill request failed, the process has probably exited: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(unix)]
impl Drop for KillUnreaped {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill();
        }
    }
}

#[cfg(unix)]
fn wait4_blocking(pid: libc::pid_t) -> std::io::Result<Reaped> {
    use std::os::unix::process::ExitStatusExt;

    let mut status: libc::c_int = 0;
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    loop {
        // SAFETY: both out-pointers stay valid for the whole call
        let ret = unsafe { libc::wait4(pid, &mut status, 0, usage.as_mut_ptr()) };
        if ret == pid {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    // SAFETY: wait4 returned the pid, so it filled in the usage
    let usage = unsafe { usage.assume_init() };

    Ok(Reaped {
        status: ExitStatus::from_raw(status),
        max_rss_kb: Some(max_rss_kb(&usage)),
    })
}

async fn read_pipe(mut pipe: impl AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Collects what a reader task captured, giving up if a leftover grandchild
/// keeps the pipe open
async fn drain(task: Option<JoinHandle<String>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            log::warn!("Pipe reader failed: {e}");
            String::new()
        }
        Err(_) => {
            task.abort();
            log::warn!("Pipe still open {PIPE_DRAIN_TIMEOUT:?} after process exit, output dropped");
            String::new()
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_exit(elapsed_ms: u64) -> RunOutcome {
        RunOutcome {
            success: true,
            exit_code: Some(0),
            elapsed_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_run_within_limits_is_ok() {
        let (status, error) = classify(&clean_exit(900), 1000);
        assert_eq!(status, ExecutionStatus::Ok);
        assert!(error.is_empty());
    }

    #[test]
    fn test_cutoff_wins_over_everything() {
        let outcome = RunOutcome {
            timed_out: true,
            aborted: true,
            memory_exceeded: true,
            ..Default::default()
        };
        assert_eq!(classify(&outcome, 1000).0, ExecutionStatus::TimeLimitExceeded);
    }

    #[test]
    fn test_abort_wins_over_exit_status() {
        let outcome = RunOutcome {
            aborted: true,
            signal: Some(9),
            memory_exceeded: true,
            ..Default::default()
        };
        let (status, error) = classify(&outcome, 1000);
        assert_eq!(status, ExecutionStatus::SystemError);
        assert_eq!(error, ABORTED_MESSAGE);

        let finished_then_aborted = RunOutcome {
            aborted: true,
            ..clean_exit(10)
        };
        assert_eq!(
            classify(&finished_then_aborted, 1000).0,
            ExecutionStatus::SystemError
        );
    }

    #[test]
    fn test_failed_exit_with_memory_is_mle() {
        let monitored = RunOutcome {
            signal: Some(9),
            memory_exceeded: true,
            ..Default::default()
        };
        assert_eq!(classify(&monitored, 1000).0, ExecutionStatus::MemoryLimitExceeded);

        let from_stderr = RunOutcome {
            exit_code: Some(134),
            stderr: "terminate called after throwing an instance of 'std::bad_alloc'".into(),
            ..Default::default()
        };
        assert_eq!(classify(&from_stderr, 1000).0, ExecutionStatus::MemoryLimitExceeded);
    }

    #[test]
    fn test_failed_exit_is_runtime_error_with_diagnostic() {
        let with_stderr = RunOutcome {
            exit_code: Some(1),
            stderr: "IndexError: list index out of range".into(),
            ..Default::default()
        };
        let (status, error) = classify(&with_stderr, 1000);
        assert_eq!(status, ExecutionStatus::RuntimeError);
        assert!(error.contains("IndexError"));

        let silent = RunOutcome {
            signal: Some(11),
            ..Default::default()
        };
        let (status, error) = classify(&silent, 1000);
        assert_eq!(status, ExecutionStatus::RuntimeError);
        assert_eq!(error, "process killed by signal 11");
    }

    #[test]
    fn test_clean_exit_over_limit_is_tle_before_mle() {
        let slow = RunOutcome {
            memory_exceeded: true,
            ..clean_exit(1001)
        };
        assert_eq!(classify(&slow, 1000).0, ExecutionStatus::TimeLimitExceeded);

        let fat = RunOutcome {
            memory_exceeded: true,
            ..clean_exit(10)
        };
        assert_eq!(classify(&fat, 1000).0, ExecutionStatus::MemoryLimitExceeded);
    }

    #[test]
    fn test_clean_exit_ignores_memory_phrases_on_stderr() {
        let outcome = RunOutcome {
            stderr: "warning: out of memory cache disabled".into(),
            ..clean_exit(10)
        };
        assert_eq!(classify(&outcome, 1000).0, ExecutionStatus::Ok);
    }

    #[test]
    fn test_resolve_program() {
        let work_dir = Path::new("/tmp/sandbox/1");
        assert_eq!(resolve_program(work_dir, "./main"), work_dir.join("./main"));
        assert_eq!(resolve_program(work_dir, "python3"), PathBuf::from("python3"));
        assert_eq!(resolve_program(work_dir, "/usr/bin/java"), PathBuf::from("/usr/bin/java"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reaped_child_reports_its_own_memory() {
        let child = tokio::process::Command::new("true").spawn().unwrap();
        let reaped = wait_child(child, CancellationToken::new()).await.unwrap();

        assert!(reaped.status.success());
        assert!(reaped.max_rss_kb.unwrap() > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_waiting_child() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let terminate = CancellationToken::new();
        let waiter = tokio::spawn(wait_child(child, terminate.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        terminate.cancel();
        let reaped = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(!reaped.status.success());
        assert_eq!(exit_signal(&reaped.status), Some(libc::SIGKILL));
    }
}

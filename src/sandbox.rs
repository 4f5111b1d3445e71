mod compare;
mod compile;
mod language;
mod monitor;
mod registry;
mod run;

pub use compare::{compare_output, normalize_output};
pub use language::{LanguageConfig, LanguageProfile, LanguageTable};
pub use monitor::{
    MONITOR_INTERVAL, MemorySample, NoopLimiter, ProcfsLimiter, ResourceLimiter,
    default_limiter,
};
pub use registry::{AbortRegistry, ProcessGuard};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::model::Verdict;
use compile::CompileOutcome;
use run::RunSpec;

/// Message attached to runs stopped through the abort registry
pub const ABORTED_MESSAGE: &str = "terminated by administrator";

/// Classification of a single sandboxed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Clean exit within limits; the output still has to be checked
    Ok,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    SystemError,
}

impl ExecutionStatus {
    /// Verdict of a failed run, `None` for a run whose output must be compared
    pub fn failure_verdict(&self) -> Option<Verdict> {
        match self {
            Self::Ok => None,
            Self::CompileError => Some(Verdict::CompileError),
            Self::RuntimeError => Some(Verdict::RuntimeError),
            Self::TimeLimitExceeded => Some(Verdict::TimeLimitExceeded),
            Self::MemoryLimitExceeded => Some(Verdict::MemoryLimitExceeded),
            Self::SystemError => Some(Verdict::SystemError),
        }
    }
}

/// Result of compiling and running a program once
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub output: String,
    pub error: String,
    pub exit_code: Option<i32>,
}

impl ExecutionResult {
    fn failed(status: ExecutionStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            time_ms: 0,
            memory_kb: 0,
            output: String::new(),
            error: error.into(),
            exit_code: None,
        }
    }

    pub fn system_error(error: impl Into<String>) -> Self {
        Self::failed(ExecutionStatus::SystemError, error)
    }

    pub fn compile_error(error: impl Into<String>) -> Self {
        Self::failed(ExecutionStatus::CompileError, error)
    }
}

/// Everything needed to judge one program against one input
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub work_dir: &'a Path,
    pub language: &'a str,
    pub code: &'a str,
    pub stdin: &'a str,
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    pub submission_id: u64,
}

/// Compiles and runs untrusted programs with best-effort limits.
///
/// Limits are an rlimit cap (where the platform has one) plus a polling
/// memory monitor and a wall-clock cutoff. This is not an isolation
/// boundary: the program runs with the judge's own privileges.
pub struct Sandbox {
    root: PathBuf,
    languages: Arc<LanguageTable>,
    registry: Arc<AbortRegistry>,
    limiter: Arc<dyn ResourceLimiter>,
}

impl Sandbox {
    pub fn new(
        root: impl Into<PathBuf>,
        languages: Arc<LanguageTable>,
        registry: Arc<AbortRegistry>,
        limiter: Arc<dyn ResourceLimiter>,
    ) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        log::info!(
            "Sandbox rooted at {} using the {} limiter",
            root.display(),
            limiter.name()
        );

        Self {
            root,
            languages,
            registry,
            limiter,
        }
    }

    pub fn languages(&self) -> &LanguageTable {
        &self.languages
    }

    pub fn registry(&self) -> &Arc<AbortRegistry> {
        &self.registry
    }

    /// Work directory owned by one submission
    pub fn work_dir(&self, submission_id: u64) -> PathBuf {
        self.root.join(submission_id.to_string())
    }

    /// Removes a submission's work directory and everything in it
    pub fn clean_work_dir(&self, submission_id: u64) {
        let dir = self.work_dir(submission_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => log::debug!("Removed work directory {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove work directory {}: {e}", dir.display()),
        }
    }

    /// Writes the source, compiles it if the language needs it, then runs it once
    pub async fn execute(&self, request: ExecutionRequest<'_>) -> ExecutionResult {
        let Some(profile) = self.languages.get(request.language) else {
            return ExecutionResult::system_error(format!(
                "unsupported language: {}",
                request.language
            ));
        };

        if let Err(e) = tokio::fs::create_dir_all(request.work_dir).await {
            log::error!(
                "Failed to create work directory {}: {e}",
                request.work_dir.display()
            );
            return ExecutionResult::system_error(format!("failed to create work directory: {e}"));
        }

        let source_path = request.work_dir.join(&profile.source_file);
        if let Err(e) = tokio::fs::write(&source_path, request.code).await {
            log::error!("Failed to write source {}: {e}", source_path.display());
            return ExecutionResult::system_error(format!("failed to write source code: {e}"));
        }

        if let Some(compile_command) = profile.compile_step() {
            match compile::compile(request.work_dir, compile_command).await {
                CompileOutcome::Success => {}
                CompileOutcome::Failed(diagnostic) => {
                    log::debug!("Submission {} failed to compile", request.submission_id);
                    return ExecutionResult::compile_error(diagnostic);
                }
                CompileOutcome::Unavailable(reason) => {
                    log::error!(
                        "Compiler for {} could not be started: {reason}",
                        request.language
                    );
                    return ExecutionResult::system_error(reason);
                }
            }
        }

        self.run_program(RunSpec {
            work_dir: request.work_dir,
            command: &profile.run_command,
            stdin: request.stdin,
            time_limit_ms: request.time_limit_ms,
            memory_limit_kb: request.memory_limit_mb.saturating_mul(1024),
            submission_id: request.submission_id,
        })
        .await
    }
}

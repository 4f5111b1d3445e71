use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often a running program's memory is sampled
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(10);

/// Peak values observed while a program ran, all in KB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub vm_peak_kb: u64,
    pub vm_size_kb: u64,
    pub resident_peak_kb: u64,
    pub exceeded: bool,
}

impl MemorySample {
    fn absorb(&mut self, other: MemorySample) {
        self.vm_peak_kb = self.vm_peak_kb.max(other.vm_peak_kb);
        self.vm_size_kb = self.vm_size_kb.max(other.vm_size_kb);
        self.resident_peak_kb = self.resident_peak_kb.max(other.resident_peak_kb);
    }

    /// Best available usage figure: peak virtual size, then current size
    pub fn usage_kb(&self) -> u64 {
        if self.vm_peak_kb > 0 {
            self.vm_peak_kb
        } else {
            self.vm_size_kb
        }
    }
}

/// Platform strategy for capping and observing a child's memory
pub trait ResourceLimiter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Applies a cap to the child before it execs. `limit_kb == 0` means no cap.
    fn cap_memory(&self, command: &mut tokio::process::Command, limit_kb: u64);

    /// Whether `sample` can return anything at all
    fn can_sample(&self) -> bool;

    fn sample(&self, pid: u32) -> Option<MemorySample>;
}

/// Linux: rlimit caps before exec plus `/proc/<pid>/status` sampling
pub struct ProcfsLimiter;

impl ResourceLimiter for ProcfsLimiter {
    fn name(&self) -> &'static str {
        "procfs"
    }

    #[cfg(target_os = "linux")]
    fn cap_memory(&self, command: &mut tokio::process::Command, limit_kb: u64) {
        if limit_kb == 0 {
            return;
        }
        let bytes = limit_kb.saturating_mul(1024) as libc::rlim_t;

        // SAFETY: the closure only calls getrlimit/setrlimit, which are
        // async-signal-safe, and allocates nothing.
        unsafe {
            command.pre_exec(move || {
                for resource in [libc::RLIMIT_AS, libc::RLIMIT_STACK] {
                    let mut current = libc::rlimit {
                        rlim_cur: 0,
                        rlim_max: 0,
                    };
                    if libc::getrlimit(resource, &mut current) != 0 {
                        continue;
                    }
                    let cap = bytes.min(current.rlim_max);
                    let wanted = libc::rlimit {
                        rlim_cur: cap,
                        rlim_max: cap,
                    };
                    // Best-effort: a refused cap leaves the monitor in charge
                    let _ = libc::setrlimit(resource, &wanted);
                }
                Ok(())
            });
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn cap_memory(&self, _command: &mut tokio::process::Command, _limit_kb: u64) {}

    fn can_sample(&self) -> bool {
        cfg!(target_os = "linux")
    }

    fn sample(&self, pid: u32) -> Option<MemorySample> {
        let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        Some(parse_proc_status(&status))
    }
}

/// Platforms without a usable mechanism: no cap, no sampling
pub struct NoopLimiter;

impl ResourceLimiter for NoopLimiter {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn cap_memory(&self, _command: &mut tokio::process::Command, _limit_kb: u64) {}

    fn can_sample(&self) -> bool {
        false
    }

    fn sample(&self, _pid: u32) -> Option<MemorySample> {
        None
    }
}

/// Picks the strongest limiter this host supports
pub fn default_limiter() -> Arc<dyn ResourceLimiter> {
    if cfg!(target_os = "linux") && std::path::Path::new("/proc/self/status").exists() {
        log::info!("Using procfs resource limiter");
        Arc::new(ProcfsLimiter)
    } else {
        log::warn!("No memory sampling on this platform, falling back to post-exit accounting");
        Arc::new(NoopLimiter)
    }
}

fn parse_proc_status(status: &str) -> MemorySample {
    let field = |key: &str| -> u64 {
        status
            .lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    };

    MemorySample {
        vm_peak_kb: field("VmPeak:"),
        vm_size_kb: field("VmSize:"),
        resident_peak_kb: field("VmRSS:"),
        exceeded: false,
    }
}

/// Samples `pid` until `stop` fires, cancelling `kill` once the peak passes `limit_kb`
pub fn spawn_memory_monitor(
    limiter: Arc<dyn ResourceLimiter>,
    pid: Option<u32>,
    limit_kb: u64,
    kill: CancellationToken,
    stop: CancellationToken,
) -> JoinHandle<MemorySample> {
    tokio::spawn(async move {
        let mut sample = MemorySample::default();
        let Some(pid) = pid.filter(|_| limiter.can_sample()) else {
            return sample;
        };

        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        loop {
            if let Some(now) = limiter.sample(pid) {
                sample.absorb(now);
            }
            if limit_kb > 0 && sample.vm_peak_kb > limit_kb && !sample.exceeded {
                log::debug!(
                    "Process {pid} peaked at {} KB over the {limit_kb} KB limit, killing",
                    sample.vm_peak_kb
                );
                sample.exceeded = true;
                kill.cancel();
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }

        sample
    })
}

/// Peak resident set of a reaped process, in KB
#[cfg(unix)]
pub fn max_rss_kb(usage: &libc::rusage) -> u64 {
    let max_rss = usage.ru_maxrss.max(0) as u64;
    if cfg!(target_os = "macos") {
        max_rss / 1024 // bytes on macOS
    } else {
        max_rss
    }
}

/// Recognizes allocation failures reported by common runtimes on stderr
pub fn looks_like_memory_error(stderr: &str) -> bool {
    if stderr.is_empty() {
        return false;
    }
    let lower = stderr.to_lowercase();
    [
        "bad_alloc",
        "cannot allocate memory",
        "memoryerror",
        "out of memory",
        "killed",
    ]
    .iter()
    .any(|kw| lower.contains(kw))
}

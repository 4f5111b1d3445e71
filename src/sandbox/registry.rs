use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Submission id 0 is never assigned, so it means "not tied to a submission"
const NO_SUBMISSION: u64 = 0;

struct RunningProcess {
    generation: u64,
    kill: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    processes: HashMap<u64, RunningProcess>,
    aborts: HashSet<u64>,
    next_generation: u64,
}

/// Tracks live runs and abort requests per submission.
///
/// Both maps live behind one lock. A live run is represented by the
/// cancellation token its run loop watches; cancelling it makes the loop
/// kill the child process.
#[derive(Default)]
pub struct AbortRegistry {
    state: Mutex<RegistryState>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `kill` as the live run of `submission_id` until the guard drops
    pub fn register(self: &Arc<Self>, submission_id: u64, kill: CancellationToken) -> ProcessGuard {
        if submission_id == NO_SUBMISSION {
            return ProcessGuard {
                registry: None,
                submission_id,
                generation: 0,
            };
        }

        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state
            .processes
            .insert(submission_id, RunningProcess { generation, kill });

        ProcessGuard {
            registry: Some(Arc::clone(self)),
            submission_id,
            generation,
        }
    }

    /// Marks the submission as aborted and kills its live run, if any.
    ///
    /// Returns whether a live run was found.
    pub fn request_abort(&self, submission_id: u64) -> bool {
        if submission_id == NO_SUBMISSION {
            return false;
        }

        let kill = {
            let mut state = self.state.lock();
            state.aborts.insert(submission_id);
            state.processes.get(&submission_id).map(|p| p.kill.clone())
        };

        match kill {
            Some(token) => {
                log::info!("Abort requested for submission {submission_id}, killing live process");
                token.cancel();
                true
            }
            None => {
                log::info!("Abort requested for submission {submission_id}, no live process");
                false
            }
        }
    }

    pub fn is_abort_requested(&self, submission_id: u64) -> bool {
        submission_id != NO_SUBMISSION && self.state.lock().aborts.contains(&submission_id)
    }

    pub fn is_running(&self, submission_id: u64) -> bool {
        self.state.lock().processes.contains_key(&submission_id)
    }

    /// Forgets both the abort marker and any live run of the submission
    pub fn clear(&self, submission_id: u64) {
        let mut state = self.state.lock();
        state.aborts.remove(&submission_id);
        state.processes.remove(&submission_id);
    }

    fn unregister(&self, submission_id: u64, generation: u64) {
        let mut state = self.state.lock();
        if state
            .processes
            .get(&submission_id)
            .is_some_and(|p| p.generation == generation)
        {
            state.processes.remove(&submission_id);
        }
    }
}

/// Removes its run from the registry when dropped
pub struct ProcessGuard {
    registry: Option<Arc<AbortRegistry>>,
    submission_id: u64,
    generation: u64,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.unregister(self.submission_id, self.generation);
        }
    }
}

//! Boundary between the judging core and the rest of the system.
//!
//! Persistence, problem storage and the semantic reviewer are implemented
//! elsewhere; the core only sees these traits. The free functions are the
//! operations outside callers use to feed the queue and to intervene in
//! running judgements.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;

use crate::model::{Problem, ReviewJudgment, Submission, Testcase, Verdict};
use crate::queue::{JudgeQueue, JudgeTask};
use crate::sandbox::{AbortRegistry, Sandbox};

/// Durable storage of submissions
pub trait SubmissionStore: Send + Sync + 'static {
    /// Stores the full submission as it is now
    fn update_result(
        &self,
        submission: &Submission,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Read-only access to problems and their fixtures
pub trait ProblemSource: Send + Sync {
    fn problem(&self, problem_id: u64) -> impl Future<Output = anyhow::Result<Problem>> + Send;

    /// Test cases of a problem, in the order they must be judged
    fn testcases(
        &self,
        problem_id: u64,
    ) -> impl Future<Output = anyhow::Result<Vec<Testcase>>> + Send;
}

/// Secondary check of a submission beyond its output
pub trait SemanticReviewer: Send + Sync + 'static {
    /// `Ok(None)` means the review does not apply to this problem
    fn analyze(
        &self,
        problem: &Problem,
        code: &str,
        language: &str,
    ) -> impl Future<Output = anyhow::Result<Option<ReviewJudgment>>> + Send;
}

/// Reviewer for deployments without one
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledReviewer;

impl SemanticReviewer for DisabledReviewer {
    async fn analyze(
        &self,
        _problem: &Problem,
        _code: &str,
        _language: &str,
    ) -> anyhow::Result<Option<ReviewJudgment>> {
        Ok(None)
    }
}

/// Loads what is needed to judge `submission` and queues it.
///
/// Fails if the problem or its test cases cannot be loaded. `Ok(false)`
/// means the queue was full and the task was dropped.
pub async fn submit_to_queue<P: ProblemSource>(
    queue: &JudgeQueue,
    problems: &P,
    submission: Submission,
) -> anyhow::Result<bool> {
    let problem_id = submission.problem_id;
    let problem = problems
        .problem(problem_id)
        .await
        .with_context(|| format!("failed to load problem {problem_id}"))?;
    let testcases = problems
        .testcases(problem_id)
        .await
        .with_context(|| format!("failed to load test cases of problem {problem_id}"))?;

    Ok(queue.push(JudgeTask {
        submission,
        problem: Arc::new(problem),
        testcases: Arc::new(testcases),
    }))
}

/// Like [`submit_to_queue`], but a failure is also recorded on the
/// submission as a system error before being returned
pub async fn enqueue_or_fail<P: ProblemSource, S: SubmissionStore>(
    queue: &JudgeQueue,
    problems: &P,
    store: &S,
    mut submission: Submission,
) -> anyhow::Result<bool> {
    match submit_to_queue(queue, problems, submission.clone()).await {
        Ok(admitted) => Ok(admitted),
        Err(e) => {
            log::error!("Failed to enqueue submission {}: {e:#}", submission.id);
            submission.status = Verdict::SystemError;
            submission.final_message = Some(format!("failed to submit to the judge queue: {e:#}"));
            if let Err(store_err) = store.update_result(&submission).await {
                log::error!(
                    "Failed to record enqueue failure of submission {}: {store_err:#}",
                    submission.id
                );
            }
            Err(e)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejudgeSummary {
    pub total: usize,
    pub queued: usize,
    pub failed: usize,
}

/// Resets finished submissions and sends them through the queue again.
///
/// Submissions that are still pending or being judged are left alone.
pub async fn rejudge<P: ProblemSource, S: SubmissionStore>(
    queue: &JudgeQueue,
    problems: &P,
    store: &S,
    registry: &AbortRegistry,
    submissions: Vec<Submission>,
) -> RejudgeSummary {
    let mut summary = RejudgeSummary::default();

    for mut submission in submissions.into_iter().filter(|s| s.status.is_final()) {
        summary.total += 1;
        submission.reset_for_rejudge();
        registry.clear(submission.id);

        if let Err(e) = store.update_result(&submission).await {
            log::error!("Failed to reset submission {} for rejudge: {e:#}", submission.id);
            summary.failed += 1;
            continue;
        }

        match submit_to_queue(queue, problems, submission).await {
            Ok(true) => summary.queued += 1,
            Ok(false) => summary.failed += 1,
            Err(e) => {
                log::error!("Failed to queue rejudge: {e:#}");
                summary.failed += 1;
            }
        }
    }

    log::info!(
        "Rejudge: {} total, {} queued, {} failed",
        summary.total,
        summary.queued,
        summary.failed
    );
    summary
}

/// Stops the judgement of a submission on an administrator's request.
///
/// Returns `false` without touching the submission if it already has a
/// final status; its abort state is cleared in that case.
pub async fn abort_by_admin<S: SubmissionStore>(
    registry: &AbortRegistry,
    store: &S,
    submission: &mut Submission,
) -> anyhow::Result<bool> {
    if submission.status.is_final() {
        registry.clear(submission.id);
        return Ok(false);
    }

    registry.request_abort(submission.id);
    submission.status = Verdict::SystemError;
    submission.score = 0;
    submission.final_message =
        Some("judging of this submission was stopped by an administrator".into());

    store
        .update_result(submission)
        .await
        .with_context(|| format!("failed to record abort of submission {}", submission.id))?;
    Ok(true)
}

/// Stops anything still running for a deleted submission and removes its files.
///
/// A pending or judging submission keeps its abort marker so the judgement
/// in flight ends as a system error; the judger clears it once that
/// judgement is over. A finished submission has its abort state dropped.
pub fn delete_by_admin(sandbox: &Sandbox, submission: &Submission) {
    if submission.status.is_final() {
        sandbox.registry().clear(submission.id);
    } else {
        sandbox.registry().request_abort(submission.id);
    }
    sandbox.clean_work_dir(submission.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct NoProblems;

    impl ProblemSource for NoProblems {
        async fn problem(&self, problem_id: u64) -> anyhow::Result<Problem> {
            anyhow::bail!("problem {problem_id} does not exist")
        }

        async fn testcases(&self, _problem_id: u64) -> anyhow::Result<Vec<Testcase>> {
            Ok(Vec::new())
        }
    }

    struct OneProblem;

    impl ProblemSource for OneProblem {
        async fn problem(&self, problem_id: u64) -> anyhow::Result<Problem> {
            Ok(serde_json::from_value(serde_json::json!({ "id": problem_id }))?)
        }

        async fn testcases(&self, _problem_id: u64) -> anyhow::Result<Vec<Testcase>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_enqueue_failure_marks_system_error() {
        let queue = JudgeQueue::new(4);
        let store = MemoryStore::new();
        let submission = Submission::new(1, 99, 1, "cpp", "");

        let err = enqueue_or_fail(&queue, &NoProblems, &store, submission)
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("problem 99 does not exist"));
        let stored = store.get(1).unwrap();
        assert_eq!(stored.status, Verdict::SystemError);
        assert!(stored.final_message.unwrap().contains("problem 99"));
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_submit_reports_dropped_task() {
        let queue = JudgeQueue::new(1);
        let first = submit_to_queue(&queue, &OneProblem, Submission::new(1, 1, 1, "cpp", ""));
        assert!(first.await.unwrap());
        let second = submit_to_queue(&queue, &OneProblem, Submission::new(2, 1, 1, "cpp", ""));
        assert!(!second.await.unwrap());
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn test_rejudge_skips_unfinished_and_resets_the_rest() {
        let queue = JudgeQueue::new(1);
        let store = MemoryStore::new();
        let registry = AbortRegistry::new();
        registry.request_abort(1);

        let mut finished = Submission::new(1, 1, 1, "cpp", "");
        finished.status = Verdict::WrongAnswer;
        finished.score = 40;
        let mut also_finished = Submission::new(2, 1, 1, "cpp", "");
        also_finished.status = Verdict::Accepted;
        let mut judging = Submission::new(3, 1, 1, "cpp", "");
        judging.status = Verdict::Judging;

        let summary = rejudge(
            &queue,
            &OneProblem,
            &store,
            &registry,
            vec![finished, also_finished, judging],
        )
        .await;

        assert_eq!(
            summary,
            RejudgeSummary {
                total: 2,
                queued: 1,
                failed: 1
            }
        );
        let reset = store.get(1).unwrap();
        assert_eq!(reset.status, Verdict::Pending);
        assert_eq!(reset.score, 0);
        assert!(!registry.is_abort_requested(1));
        assert!(store.get(3).is_none());
    }

    #[tokio::test]
    async fn test_abort_by_admin() {
        let registry = AbortRegistry::new();
        let store = MemoryStore::new();

        let mut running = Submission::new(5, 1, 1, "cpp", "");
        running.status = Verdict::Judging;
        assert!(abort_by_admin(&registry, &store, &mut running).await.unwrap());
        assert_eq!(running.status, Verdict::SystemError);
        assert!(running.final_message.is_some());
        assert!(registry.is_abort_requested(5));
        assert_eq!(store.get(5).unwrap().status, Verdict::SystemError);

        let mut done = Submission::new(6, 1, 1, "cpp", "");
        done.status = Verdict::Accepted;
        registry.request_abort(6);
        assert!(!abort_by_admin(&registry, &store, &mut done).await.unwrap());
        assert_eq!(done.status, Verdict::Accepted);
        assert!(!registry.is_abort_requested(6));
    }

    #[test]
    fn test_delete_by_admin() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(
            root.path(),
            Arc::new(crate::sandbox::LanguageTable::builtin()),
            Arc::new(AbortRegistry::new()),
            Arc::new(crate::sandbox::NoopLimiter),
        );
        std::fs::create_dir_all(sandbox.work_dir(8)).unwrap();
        std::fs::write(sandbox.work_dir(8).join("main.cpp"), "int main() {}").unwrap();

        let mut judging = Submission::new(8, 1, 1, "cpp", "");
        judging.status = Verdict::Judging;
        delete_by_admin(&sandbox, &judging);
        assert!(!sandbox.work_dir(8).exists());
        assert!(sandbox.registry().is_abort_requested(8));

        // a finished submission leaves nothing behind in the registry
        let mut finished = Submission::new(9, 1, 1, "cpp", "");
        finished.status = Verdict::Accepted;
        sandbox.registry().request_abort(9);
        delete_by_admin(&sandbox, &finished);
        assert!(!sandbox.registry().is_abort_requested(9));
    }
}

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::create_timestamp;
use crate::model::{Problem, ReviewJudgment, Submission, Testcase, TestcaseResult, Verdict};
use crate::queue::{HandlerFuture, JudgeHandler, JudgeTask};
use crate::sandbox::{ABORTED_MESSAGE, ExecutionRequest, ExecutionStatus, Sandbox, compare_output};
use crate::service::{SemanticReviewer, SubmissionStore};

/// Longest diagnostic kept on a single test case result
const MAX_MESSAGE_LEN: usize = 1024;
/// Score ceiling for a submission the reviewer did not pass
const REVIEW_SCORE_CAP: u32 = 50;

const STRICT_REVIEW_MESSAGE: &str = "all test cases passed, but the submission does not meet the \
     algorithm or language requirements of the problem, judged as Wrong Answer";

/// Runs a submission against every test case of its problem and records the outcome
pub struct Judger<S, R> {
    sandbox: Arc<Sandbox>,
    store: Arc<S>,
    reviewer: Arc<R>,
}

impl<S: SubmissionStore, R: SemanticReviewer> Judger<S, R> {
    pub fn new(sandbox: Arc<Sandbox>, store: Arc<S>, reviewer: Arc<R>) -> Self {
        Self {
            sandbox,
            store,
            reviewer,
        }
    }

    /// Judges one task to completion.
    ///
    /// Nothing here fails: every problem met along the way ends up in the
    /// verdict of a test case or of the whole submission.
    pub async fn judge(&self, task: &mut JudgeTask) {
        let problem = Arc::clone(&task.problem);
        let testcases = Arc::clone(&task.testcases);
        let submission = &mut task.submission;
        let started = Instant::now();
        log::info!(
            "Judging submission {} for problem {}",
            submission.id,
            problem.id
        );

        submission.status = Verdict::Judging;
        self.persist(submission).await;

        let results = self.run_testcases(submission, &problem, &testcases).await;
        let mechanical = derive_verdict(&results);
        submission.time_used = results.iter().map(|r| r.time).max().unwrap_or(0);
        submission.memory_used = results.iter().map(|r| r.memory).max().unwrap_or(0);
        submission.testcase_results = results;
        submission.status = mechanical;

        let registry = self.sandbox.registry();
        if registry.is_abort_requested(submission.id) {
            log::warn!("Judging of submission {} was aborted", submission.id);
            submission.status = Verdict::SystemError;
            submission.score = 0;
            submission.final_message = Some("judging terminated by administrator".into());
        } else {
            if let Some(policy) = problem.review_policy() {
                if let Some(judgment) = self.review(&problem, submission).await {
                    if mechanical == Verdict::Accepted && !judgment.passed {
                        if policy.strict_mode {
                            submission.status = Verdict::WrongAnswer;
                            submission.final_message = Some(STRICT_REVIEW_MESSAGE.into());
                        } else {
                            submission.final_message = Some(format!(
                                "all test cases passed; review note: {}",
                                judgment.reason
                            ));
                        }
                    }
                    submission.ai_judge_result = Some(judgment);
                }
            }

            let mut score = compute_score(
                &submission.testcase_results,
                submission.status == Verdict::Accepted,
            );
            if submission
                .ai_judge_result
                .as_ref()
                .is_some_and(|j| !j.passed)
            {
                score = score.min(REVIEW_SCORE_CAP);
            }
            submission.score = score;
        }

        if submission.status == Verdict::SystemError && submission.final_message.is_none() {
            submission.final_message = Some(system_error_reason(&submission.testcase_results));
        }

        self.persist(submission).await;
        self.sandbox.clean_work_dir(submission.id);
        // nothing of this submission runs any more
        registry.clear(submission.id);

        log::info!(
            "Finished submission {}: {} (score {}) in {:?}",
            submission.id,
            submission.status,
            submission.score,
            started.elapsed()
        );
    }

    async fn run_testcases(
        &self,
        submission: &mut Submission,
        problem: &Problem,
        testcases: &[Testcase],
    ) -> Vec<TestcaseResult> {
        let registry = self.sandbox.registry();
        let work_dir = self.sandbox.work_dir(submission.id);
        let file_io = problem.file_io();
        let mut results = Vec::with_capacity(testcases.len());

        for (index, testcase) in testcases.iter().enumerate() {
            let case_id = index + 1;

            if registry.is_abort_requested(submission.id) {
                results.extend(
                    (case_id..=testcases.len()).map(|id| {
                        TestcaseResult::new(id, Verdict::SystemError).with_message(ABORTED_MESSAGE)
                    }),
                );
                break;
            }

            let input = match read_fixture(&testcase.input_file).await {
                Ok(input) => input,
                Err(e) => {
                    log::error!("Submission {}: {e}", submission.id);
                    results.push(
                        TestcaseResult::new(case_id, Verdict::SystemError)
                            .with_message("failed to read test input"),
                    );
                    continue;
                }
            };
            let expected = match read_fixture(&testcase.output_file).await {
                Ok(expected) => expected,
                Err(e) => {
                    log::error!("Submission {}: {e}", submission.id);
                    results.push(
                        TestcaseResult::new(case_id, Verdict::SystemError)
                            .with_message("failed to read expected output"),
                    );
                    continue;
                }
            };

            if let Some((input_name, output_name)) = &file_io {
                if let Err(e) = prepare_file_io(&work_dir, input_name, output_name, &input).await {
                    log::error!(
                        "Submission {}: failed to prepare input file: {e}",
                        submission.id
                    );
                    results.push(
                        TestcaseResult::new(case_id, Verdict::SystemError)
                            .with_message("failed to write input file"),
                    );
                    continue;
                }
            }

            let execution = self
                .sandbox
                .execute(ExecutionRequest {
                    work_dir: &work_dir,
                    language: &submission.language,
                    code: &submission.code,
                    stdin: if file_io.is_some() { "" } else { input.as_str() },
                    time_limit_ms: problem.time_limit,
                    memory_limit_mb: problem.memory_limit,
                    submission_id: submission.id,
                })
                .await;

            if execution.status == ExecutionStatus::CompileError {
                submission.compile_error = Some(execution.error);
                results.push(
                    TestcaseResult::new(case_id, Verdict::CompileError)
                        .with_message("compile error"),
                );
                results.extend(
                    (case_id + 1..=testcases.len())
                        .map(|id| TestcaseResult::new(id, Verdict::CompileError)),
                );
                break;
            }

            let mut result = TestcaseResult {
                time: execution.time_ms,
                memory: execution.memory_kb,
                ..TestcaseResult::new(case_id, Verdict::SystemError)
            };

            match execution.status.failure_verdict() {
                Some(verdict) => {
                    result.status = verdict;
                    let message = if execution.error.is_empty() {
                        verdict.to_string()
                    } else {
                        truncate(&execution.error, MAX_MESSAGE_LEN)
                    };
                    result.message = Some(message);
                }
                None => {
                    let actual = match &file_io {
                        Some((_, output_name)) => {
                            match tokio::fs::read(work_dir.join(output_name)).await {
                                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                                Err(_) => {
                                    result.status = Verdict::WrongAnswer;
                                    result.message = Some("output file was not produced".into());
                                    results.push(result);
                                    continue;
                                }
                            }
                        }
                        None => execution.output,
                    };
                    result.status = if compare_output(&expected, &actual) {
                        Verdict::Accepted
                    } else {
                        Verdict::WrongAnswer
                    };
                }
            }

            log::debug!(
                "Submission {} case {case_id}: {} ({} ms, {} KB)",
                submission.id,
                result.status,
                result.time,
                result.memory
            );
            results.push(result);
        }

        results
    }

    /// `None` when the reviewer has nothing to say about this problem
    async fn review(&self, problem: &Problem, submission: &Submission) -> Option<ReviewJudgment> {
        log::info!("Running semantic review of submission {}", submission.id);
        match self
            .reviewer
            .analyze(problem, &submission.code, &submission.language)
            .await
        {
            Ok(judgment) => judgment,
            Err(e) => {
                log::warn!("Review of submission {} failed: {e:#}", submission.id);
                Some(ReviewJudgment {
                    passed: true,
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    async fn persist(&self, submission: &mut Submission) {
        submission.updated_time = Some(create_timestamp());
        if let Err(e) = self.store.update_result(submission).await {
            log::error!("Failed to save submission {}: {e:#}", submission.id);
        }
    }
}

impl<S: SubmissionStore, R: SemanticReviewer> JudgeHandler for Judger<S, R> {
    fn handle<'a>(&'a self, task: &'a mut JudgeTask) -> HandlerFuture<'a> {
        Box::pin(self.judge(task))
    }
}

/// Overall verdict of a list of test case results.
///
/// All accepted is `Accepted`, no results at all is `SystemError`, anything
/// else is the most severe failure present.
pub fn derive_verdict(results: &[TestcaseResult]) -> Verdict {
    if results.is_empty() {
        return Verdict::SystemError;
    }
    results
        .iter()
        .filter_map(|r| r.status.severity().map(|rank| (rank, r.status)))
        .min_by_key(|(rank, _)| *rank)
        .map_or(Verdict::Accepted, |(_, status)| status)
}

/// Score out of 100: full marks when accepted, else the accepted share rounded down
pub fn compute_score(results: &[TestcaseResult], accepted: bool) -> u32 {
    if accepted {
        return 100;
    }
    if results.is_empty() {
        return 0;
    }
    let passed = results
        .iter()
        .filter(|r| r.status == Verdict::Accepted)
        .count();
    (passed * 100 / results.len()) as u32
}

/// Diagnostic for a submission that ended as a system error
fn system_error_reason(results: &[TestcaseResult]) -> String {
    if results.is_empty() {
        return "problem has no test cases".to_string();
    }
    match results.iter().find(|r| r.status == Verdict::SystemError) {
        Some(TestcaseResult {
            id,
            message: Some(message),
            ..
        }) => format!("system error on test case {id}: {message}"),
        Some(result) => format!("system error on test case {}", result.id),
        None => "system error while judging".to_string(),
    }
}

async fn read_fixture(path: &Path) -> Result<String, String> {
    tokio::fs::read(path)
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| format!("failed to read {}: {e}", path.display()))
}

async fn prepare_file_io(
    work_dir: &Path,
    input_name: &str,
    output_name: &str,
    input: &str,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(work_dir).await?;
    tokio::fs::write(work_dir.join(input_name), input).await?;
    match tokio::fs::remove_file(work_dir.join(output_name)).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

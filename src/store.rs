use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;

use crate::model::{Problem, Submission, Testcase, Verdict};
use crate::service::{ProblemSource, SubmissionStore};

const PROBLEM_MANIFEST: &str = "problem.json";

#[derive(Default)]
struct Record {
    latest: Submission,
    history: Vec<Verdict>,
}

/// Keeps submissions in memory, along with every status they were stored with
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<u64, Record>>,
    updated: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, submission_id: u64) -> Option<Submission> {
        self.records
            .lock()
            .get(&submission_id)
            .map(|r| r.latest.clone())
    }

    /// Statuses the submission was stored with, oldest first
    pub fn history(&self, submission_id: u64) -> Vec<Verdict> {
        self.records
            .lock()
            .get(&submission_id)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    /// Waits until the submission has been stored with a final status
    pub async fn wait_for_final(&self, submission_id: u64) -> Submission {
        loop {
            let notified = self.updated.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(submission) = self.get(submission_id) {
                if submission.status.is_final() {
                    return submission;
                }
            }
            notified.await;
        }
    }
}

impl SubmissionStore for MemoryStore {
    async fn update_result(&self, submission: &Submission) -> anyhow::Result<()> {
        {
            let mut records = self.records.lock();
            let record = records.entry(submission.id).or_default();
            record.latest = submission.clone();
            record.history.push(submission.status);
        }
        self.updated.notify_waiters();
        Ok(())
    }
}

#[derive(Deserialize)]
struct ProblemManifest {
    #[serde(flatten)]
    problem: Problem,
    #[serde(default)]
    testcases: Vec<Testcase>,
}

/// Reads problems from `<root>/<problem id>/problem.json`.
///
/// Test case paths in the manifest are relative to the problem's directory
/// unless they are absolute.
pub struct FsProblemSource {
    root: PathBuf,
}

impl FsProblemSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn problem_dir(&self, problem_id: u64) -> PathBuf {
        self.root.join(problem_id.to_string())
    }

    async fn load(&self, problem_id: u64) -> anyhow::Result<ProblemManifest> {
        let path = self.problem_dir(problem_id).join(PROBLEM_MANIFEST);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("invalid {}", path.display()))
    }
}

impl ProblemSource for FsProblemSource {
    async fn problem(&self, problem_id: u64) -> anyhow::Result<Problem> {
        let mut problem = self.load(problem_id).await?.problem;
        problem.id = problem_id;
        Ok(problem)
    }

    async fn testcases(&self, problem_id: u64) -> anyhow::Result<Vec<Testcase>> {
        let dir = self.problem_dir(problem_id);
        let mut testcases = self.load(problem_id).await?.testcases;
        for testcase in &mut testcases {
            testcase.input_file = resolve(&dir, &testcase.input_file);
            testcase.output_file = resolve(&dir, &testcase.output_file);
        }
        testcases.sort_by_key(|t| t.order_num);
        Ok(testcases)
    }
}

fn resolve(dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

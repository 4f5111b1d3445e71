use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Status of a submission or of a single test case
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Verdict {
    #[default]
    Pending,
    Judging,
    Accepted,
    #[serde(rename = "Wrong Answer")]
    WrongAnswer,
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "Memory Limit Exceeded")]
    MemoryLimitExceeded,
    #[serde(rename = "Runtime Error")]
    RuntimeError,
    #[serde(rename = "Compile Error")]
    CompileError,
    #[serde(rename = "System Error")]
    SystemError,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Judging => "Judging",
            Self::Accepted => "Accepted",
            Self::WrongAnswer => "Wrong Answer",
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::MemoryLimitExceeded => "Memory Limit Exceeded",
            Self::RuntimeError => "Runtime Error",
            Self::CompileError => "Compile Error",
            Self::SystemError => "System Error",
        }
    }

    /// Whether judging has finished with this status
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending | Self::Judging)
    }

    /// Rank of a failing status when several test cases disagree.
    ///
    /// Lower is more severe. `Accepted` and the in-progress states have no
    /// rank and never win over a failure.
    pub fn severity(&self) -> Option<u8> {
        match self {
            Self::CompileError => Some(1),
            Self::RuntimeError => Some(2),
            Self::TimeLimitExceeded => Some(3),
            Self::MemoryLimitExceeded => Some(4),
            Self::WrongAnswer => Some(5),
            Self::SystemError => Some(6),
            Self::Pending | Self::Judging | Self::Accepted => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Submission {
    pub id: u64,
    pub problem_id: u64,
    pub user_id: u64,
    pub language: String,
    pub code: String,
    pub status: Verdict,
    pub time_used: u64,   // ms
    pub memory_used: u64, // KB
    pub score: u32,
    #[serde(default)]
    pub testcase_results: Vec<TestcaseResult>,
    pub ai_judge_result: Option<ReviewJudgment>,
    pub compile_error: Option<String>,
    pub final_message: Option<String>,
    pub updated_time: Option<String>,
}

impl Submission {
    pub fn new(id: u64, problem_id: u64, user_id: u64, language: &str, code: &str) -> Self {
        Self {
            id,
            problem_id,
            user_id,
            language: language.to_string(),
            code: code.to_string(),
            ..Default::default()
        }
    }

    /// Drops every judged field so the submission can go through the queue again
    pub fn reset_for_rejudge(&mut self) {
        self.status = Verdict::Pending;
        self.time_used = 0;
        self.memory_used = 0;
        self.score = 0;
        self.testcase_results.clear();
        self.ai_judge_result = None;
        self.compile_error = None;
        self.final_message = None;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestcaseResult {
    pub id: usize, // 1-based index of the case
    pub status: Verdict,
    pub time: u64,   // ms
    pub memory: u64, // KB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestcaseResult {
    pub fn new(id: usize, status: Verdict) -> Self {
        Self {
            id,
            status,
            time: 0,
            memory: 0,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Problem {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_time_limit")]
    pub time_limit: u64, // ms
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64, // MB
    #[serde(default)]
    pub file_io_enabled: bool,
    #[serde(default)]
    pub file_input_name: String,
    #[serde(default)]
    pub file_output_name: String,
    #[serde(default)]
    pub ai_judge_config: Option<ReviewPolicy>,
}

fn default_time_limit() -> u64 {
    1000
}

fn default_memory_limit() -> u64 {
    256
}

impl Problem {
    /// File names for file-based I/O, if the problem uses it.
    ///
    /// Only the final path component of each configured name is kept, so a
    /// problem cannot make the program read or write outside its work directory.
    pub fn file_io(&self) -> Option<(String, String)> {
        if !self.file_io_enabled {
            return None;
        }
        let base = |name: &str| {
            std::path::Path::new(name)
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
        };
        match (base(&self.file_input_name), base(&self.file_output_name)) {
            (Some(input), Some(output)) => Some((input, output)),
            _ => None,
        }
    }

    pub fn review_policy(&self) -> Option<&ReviewPolicy> {
        self.ai_judge_config.as_ref().filter(|p| p.enabled)
    }
}

/// Per-problem settings for the secondary semantic review
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReviewPolicy {
    pub enabled: bool,
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default)]
    pub required_algorithm: Option<String>,
    #[serde(default)]
    pub required_language: Option<String>,
    #[serde(default)]
    pub forbidden_features: Vec<String>,
    #[serde(default)]
    pub custom_prompt: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReviewJudgment {
    pub passed: bool,
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Testcase {
    pub id: u64,
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    #[serde(default)]
    pub score: u32,
    #[serde(default)]
    pub is_sample: bool,
    #[serde(default)]
    pub order_num: i32,
}

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use serde::Deserialize;

use crate::sandbox::LanguageConfig;

#[derive(Parser, Debug)]
#[command(name = "ojudge", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    /// Id of the problem to judge against
    #[arg(long, short = 'p')]
    pub problem: u64,

    /// Language of the source file
    #[arg(long, short = 'l')]
    pub language: String,

    /// Source file to judge
    #[arg(long, short = 's')]
    pub source: PathBuf,

    /// Id given to the submission
    #[arg(long, default_value_t = 1)]
    pub submission_id: u64,

    /// Number of judge workers, overriding the configuration file
    #[arg(long, short = 't')]
    pub threads: Option<usize>,
}

impl CliArgs {
    /// Loads the configuration file if one was given and applies the overrides
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(threads) = self.threads {
            config.judge.workers = threads;
        }
        if config.judge.workers == 0 {
            bail!("The number of worker threads must not be 0");
        }
        if config.judge.queue_capacity == 0 {
            bail!("The judge queue capacity must not be 0");
        }
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub judge: JudgeSettings,
    /// Added to the builtin languages, replacing any with the same name
    #[serde(default)]
    pub languages: Vec<LanguageConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open config {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[derive(Deserialize, Debug)]
pub struct JudgeSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: PathBuf,
    #[serde(default = "default_problems_root")]
    pub problems_root: PathBuf,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            sandbox_root: default_sandbox_root(),
            problems_root: default_problems_root(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    100
}

fn default_sandbox_root() -> PathBuf {
    use directories::ProjectDirs;

    match ProjectDirs::from("", "", "ojudge") {
        Some(proj_dirs) => proj_dirs.cache_dir().join("sandbox"),
        None => PathBuf::from("./data/sandbox"),
    }
}

fn default_problems_root() -> PathBuf {
    PathBuf::from("./data/problems")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let config = Config::from_file("data/example.json".as_ref()).unwrap();
        assert_eq!(config.judge.workers, 2);
        assert_eq!(config.judge.queue_capacity, 100);
        assert_eq!(config.judge.problems_root, PathBuf::from("./data/problems"));
        assert_eq!(config.languages[0].name, "sh");
        assert!(config.languages[0].profile.needs_compile);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: Config = serde_json::from_str(r#"{"judge": {"workers": 4}}"#).unwrap();
        assert_eq!(config.judge.workers, 4);
        assert_eq!(config.judge.queue_capacity, 100);
        assert!(config.judge.sandbox_root.ends_with("sandbox"));
        assert!(config.languages.is_empty());
    }

    #[test]
    fn test_threads_override_and_validation() {
        let args = CliArgs::try_parse_from([
            "ojudge", "-p", "1", "-l", "cpp", "-s", "main.cpp", "--threads", "6",
        ])
        .unwrap();
        assert_eq!(args.submission_id, 1);
        assert_eq!(args.to_config().unwrap().judge.workers, 6);

        let zero = CliArgs::try_parse_from([
            "ojudge", "-p", "1", "-l", "cpp", "-s", "main.cpp", "-t", "0",
        ])
        .unwrap();
        assert!(zero.to_config().is_err());
    }
}

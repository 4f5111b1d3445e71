use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use ojudge::config::{CliArgs, Config};
use ojudge::judger::Judger;
use ojudge::model::Submission;
use ojudge::queue::JudgeQueue;
use ojudge::sandbox::{AbortRegistry, LanguageTable, Sandbox, default_limiter};
use ojudge::service::{DisabledReviewer, enqueue_or_fail};
use ojudge::store::{FsProblemSource, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        judge: settings,
        languages: language_config,
    } = cli.to_config().context("Failed to load configuration")?;

    let mut languages = LanguageTable::builtin();
    languages.extend(language_config);
    if !languages.contains(&cli.language) {
        anyhow::bail!(
            "Unsupported language {}, expected one of: {}",
            cli.language,
            languages.names().join(", ")
        );
    }

    let code = std::fs::read_to_string(&cli.source)
        .with_context(|| format!("Failed to read {}", cli.source.display()))?;

    let registry = Arc::new(AbortRegistry::new());
    let sandbox = Arc::new(Sandbox::new(
        &settings.sandbox_root,
        Arc::new(languages),
        registry,
        default_limiter(),
    ));
    let store = Arc::new(MemoryStore::new());
    let problems = FsProblemSource::new(&settings.problems_root);
    let judger = Judger::new(sandbox, Arc::clone(&store), Arc::new(DisabledReviewer));

    let queue = Arc::new(JudgeQueue::new(settings.queue_capacity));
    queue.register_handler(Arc::new(judger));

    // ======= PREPARATION END, EXECUTION START =======

    queue.start(settings.workers);

    let submission = Submission::new(cli.submission_id, cli.problem, 0, &cli.language, &code);
    if !enqueue_or_fail(&queue, &problems, store.as_ref(), submission).await? {
        queue.shutdown().await;
        anyhow::bail!("Judge queue is full");
    }

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
            None
        }
        submission = store.wait_for_final(cli.submission_id) => Some(submission),
    };

    queue.shutdown().await;
    log::info!("Shutdown complete");

    if let Some(submission) = finished {
        println!("{}", serde_json::to_string_pretty(&submission)?);
    }
    Ok(())
}

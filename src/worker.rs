use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::queue::JudgeQueue;

/// Pulls tasks off the queue until `token` is cancelled.
///
/// Each task is handled in its own spawned task so that a panicking handler
/// costs one submission, not the worker.
pub async fn worker(id: usize, queue: Arc<JudgeQueue>, token: CancellationToken) {
    log::info!("Worker {id} started");

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            mut task = queue.pop() => {
                let submission_id = task.submission.id;
                log::info!("Worker {id} got submission {submission_id} from queue");

                let started = Instant::now();
                let handlers = queue.handlers();
                let handling = tokio::spawn(async move {
                    for handler in &handlers {
                        handler.handle(&mut task).await;
                    }
                });

                match handling.await {
                    Ok(()) => log::info!(
                        "Worker {id} finished submission {submission_id} in {:?}",
                        started.elapsed()
                    ),
                    Err(e) if e.is_panic() => {
                        log::error!(
                            "Handler panicked on submission {submission_id} in worker {id}: {e:?}"
                        );
                    }
                    Err(e) => {
                        log::error!(
                            "Handling submission {submission_id} failed on worker {id}: {e:?}"
                        );
                    }
                }
            }
        }
    }

    log::info!("Worker {id} has shut down gracefully");
}

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::{Problem, Submission, Testcase};
use crate::worker::worker;

/// One submission waiting to be judged
#[derive(Debug, Clone)]
pub struct JudgeTask {
    pub submission: Submission,
    pub problem: Arc<Problem>,
    pub testcases: Arc<Vec<Testcase>>,
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Something every dequeued task is passed through
pub trait JudgeHandler: Send + Sync {
    fn handle<'a>(&'a self, task: &'a mut JudgeTask) -> HandlerFuture<'a>;
}

struct Workers {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Bounded in-memory queue drained by a pool of workers
pub struct JudgeQueue {
    capacity: usize,
    tasks: Mutex<VecDeque<JudgeTask>>,
    notify: Notify,
    handlers: RwLock<Vec<Arc<dyn JudgeHandler>>>,
    workers: Mutex<Option<Workers>>,
}

impl JudgeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tasks: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            handlers: RwLock::new(Vec::new()),
            workers: Mutex::new(None),
        }
    }

    /// Adds a task without waiting. A full queue drops the task.
    ///
    /// Returns whether the task was admitted.
    pub fn push(&self, task: JudgeTask) -> bool {
        let submission_id = task.submission.id;
        {
            let mut tasks = self.tasks.lock();
            if tasks.len() >= self.capacity {
                log::warn!(
                    "Judge queue full ({} tasks), dropping submission {submission_id}",
                    self.capacity
                );
                return false;
            }
            tasks.push_back(task);
        }

        self.notify.notify_one();
        log::info!("Queued submission {submission_id}");
        true
    }

    /// Takes the next task, waiting while the queue is empty
    pub async fn pop(&self) -> JudgeTask {
        loop {
            {
                let mut tasks = self.tasks.lock();
                if let Some(task) = tasks.pop_front() {
                    if !tasks.is_empty() {
                        self.notify.notify_one();
                    }
                    return task;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Handlers run in registration order for every task
    pub fn register_handler(&self, handler: Arc<dyn JudgeHandler>) {
        self.handlers.write().push(handler);
    }

    pub(crate) fn handlers(&self) -> Vec<Arc<dyn JudgeHandler>> {
        self.handlers.read().clone()
    }

    /// Spawns `n_workers` workers. Does nothing if workers are already running.
    pub fn start(self: &Arc<Self>, n_workers: usize) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            log::debug!("Judge queue already running");
            return;
        }

        log::info!("Starting judge queue with {n_workers} workers");
        let token = CancellationToken::new();
        let handles = (1..=n_workers)
            .map(|id| tokio::spawn(worker(id, Arc::clone(self), token.clone())))
            .collect();
        *workers = Some(Workers { token, handles });
    }

    /// Stops pulling new tasks. Tasks already being judged run to completion.
    pub fn stop(&self) {
        if let Some(workers) = self.workers.lock().take() {
            workers.token.cancel();
            log::info!("Judge queue stopped");
        }
    }

    /// Stops the queue and waits until every worker has exited
    pub async fn shutdown(&self) {
        let Some(workers) = self.workers.lock().take() else {
            return;
        };
        workers.token.cancel();
        log::info!("Shutdown signal sent to workers, waiting for them to finish...");

        for handle in workers.handles {
            if let Err(e) = handle.await {
                log::error!("Worker handle finished with error: {e:?}");
            }
        }
        log::info!("Judge queue shut down");
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    /// Number of waiting tasks; may be stale as soon as it returns
    pub fn size(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn task(id: u64) -> JudgeTask {
        JudgeTask {
            submission: Submission::new(id, 1, 1, "cpp", ""),
            problem: Arc::new(serde_json::from_str(r#"{"id": 1}"#).unwrap()),
            testcases: Arc::new(Vec::new()),
        }
    }

    struct Recorder {
        label: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, u64)>>>,
    }

    impl JudgeHandler for Recorder {
        fn handle<'a>(&'a self, task: &'a mut JudgeTask) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.seen.lock().push((self.label, task.submission.id));
            })
        }
    }

    struct Panicker;

    impl JudgeHandler for Panicker {
        fn handle<'a>(&'a self, task: &'a mut JudgeTask) -> HandlerFuture<'a> {
            Box::pin(async move {
                if task.submission.id == 1 {
                    panic!("handler blew up");
                }
            })
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_overflow_drops_without_blocking() {
        let queue = JudgeQueue::new(2);
        assert!(queue.push(task(1)));
        assert!(queue.push(task(2)));
        assert!(!queue.push(task(3)));
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.capacity(), 2);
    }

    #[tokio::test]
    async fn test_pop_is_fifo_and_waits_for_push() {
        let queue = Arc::new(JudgeQueue::new(4));
        queue.push(task(1));
        queue.push(task(2));
        assert_eq!(queue.pop().await.submission.id, 1);
        assert_eq!(queue.pop().await.submission.id, 2);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await.submission.id })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        queue.push(task(3));
        assert_eq!(waiter.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_workers_run_handlers_in_registration_order() {
        let queue = Arc::new(JudgeQueue::new(8));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second"] {
            queue.register_handler(Arc::new(Recorder {
                label,
                seen: Arc::clone(&seen),
            }));
        }

        queue.start(1);
        queue.push(task(10));
        queue.push(task(11));
        wait_for(|| seen.lock().len() == 4).await;
        queue.shutdown().await;

        assert_eq!(
            *seen.lock(),
            vec![("first", 10), ("second", 10), ("first", 11), ("second", 11)]
        );
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let queue = Arc::new(JudgeQueue::new(8));
        queue.start(2);
        queue.start(5);
        assert!(queue.is_running());

        queue.stop();
        queue.stop();
        assert!(!queue.is_running());

        // nothing is pulled after a stop
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(task(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_pushes_are_judged_twice() {
        let queue = Arc::new(JudgeQueue::new(8));
        let seen = Arc::new(Mutex::new(Vec::new()));
        queue.register_handler(Arc::new(Recorder {
            label: "only",
            seen: Arc::clone(&seen),
        }));

        queue.start(3);
        queue.push(task(4));
        queue.push(task(4));
        wait_for(|| seen.lock().len() == 2).await;
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_worker() {
        let queue = Arc::new(JudgeQueue::new(8));
        let seen = Arc::new(Mutex::new(Vec::new()));
        queue.register_handler(Arc::new(Panicker));
        queue.register_handler(Arc::new(Recorder {
            label: "after",
            seen: Arc::clone(&seen),
        }));

        queue.start(1);
        queue.push(task(1));
        queue.push(task(2));
        wait_for(|| !seen.lock().is_empty()).await;
        queue.shutdown().await;

        assert_eq!(*seen.lock(), vec![("after", 2)]);
    }
}

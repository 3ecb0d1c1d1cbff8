use std::{future::Future, pin::Pin, time::Duration};

use anyhow::{anyhow, Result};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};

type QueuedTask<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

struct QueueEntry<T> {
    task: QueuedTask<T>,
    reply: oneshot::Sender<Result<T>>,
}

/// Serializes operations against a rate-limited backend: at most one in
/// flight, strict FIFO, idle whenever empty. Each entry runs under a bounded
/// deadline so a hung operation is rejected to its own caller instead of
/// stalling everything behind it; a failure never aborts or skips later
/// entries.
pub struct SerializedTaskQueue<T: Send + 'static> {
    submissions: mpsc::UnboundedSender<QueueEntry<T>>,
}

impl<T: Send + 'static> SerializedTaskQueue<T> {
    pub fn new(deadline: Duration) -> Self {
        let (submissions, mut queue) = mpsc::unbounded_channel::<QueueEntry<T>>();
        // worker exits once every queue handle is dropped and the backlog
        // is drained
        tokio::spawn(async move {
            while let Some(entry) = queue.recv().await {
                let result = match timeout(deadline, entry.task).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!(
                        "queued operation exceeded its {}ms deadline",
                        deadline.as_millis()
                    )),
                };
                // the caller may have gone away; keep draining either way
                let _ = entry.reply.send(result);
            }
        });
        Self { submissions }
    }

    /// Enqueues an operation and resolves with its result once every
    /// earlier submission has settled.
    pub async fn submit<F>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.submissions
            .send(QueueEntry {
                task: Box::pin(task),
                reply,
            })
            .map_err(|_| anyhow!("task queue worker is gone"))?;
        response
            .await
            .map_err(|_| anyhow!("task queue dropped the operation"))?
    }
}

#[cfg(test)]
#[path = "tests/task_queue_tests.rs"]
mod tests;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::source::RemoteTreeSource;
use super::transfer::{DownloadTask, Downloader, TaskReport};

pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool dispatcher is gone")]
    DispatcherGone,
    #[error("worker pool dispatcher panicked: {0}")]
    Dispatcher(#[from] tokio::task::JoinError),
}

/// Runs at most `capacity` downloads at once, starting them in submission order.
pub struct WorkerPool {
    queue: mpsc::UnboundedSender<DownloadTask>,
    cancel: CancellationToken,
    dispatcher: JoinHandle<Vec<TaskReport>>,
}

impl WorkerPool {
    pub fn new<S: RemoteTreeSource>(downloader: Downloader<S>, capacity: usize) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let limit = Arc::new(Semaphore::new(capacity.max(1)));
        let dispatcher = tokio::spawn(dispatch(downloader, limit, pending, cancel.clone()));
        Self {
            queue,
            cancel,
            dispatcher,
        }
    }

    /// Queues a task without waiting for it to start.
    pub fn submit(&self, task: DownloadTask) -> Result<(), PoolError> {
        self.queue
            .send(task)
            .map_err(|_| PoolError::DispatcherGone)
    }

    /// Waits until every submitted task has reached a terminal state.
    pub async fn drain(self) -> Result<Vec<TaskReport>, PoolError> {
        drop(self.queue);
        Ok(self.dispatcher.await?)
    }

    /// Drops tasks that have not started yet and waits for the running ones.
    pub async fn abandon(self) -> Result<Vec<TaskReport>, PoolError> {
        self.cancel.cancel();
        drop(self.queue);
        Ok(self.dispatcher.await?)
    }
}

async fn dispatch<S: RemoteTreeSource>(
    downloader: Downloader<S>,
    limit: Arc<Semaphore>,
    mut pending: mpsc::UnboundedReceiver<DownloadTask>,
    cancel: CancellationToken,
) -> Vec<TaskReport> {
    let mut workers = JoinSet::new();
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = pending.recv() => task,
        };
        let Some(task) = task else { break };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(remote_id = %task.node.id, "download skipped: mirror aborted");
                break;
            }
            permit = Arc::clone(&limit).acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            error!("download limiter closed unexpectedly");
            break;
        };

        let worker = downloader.fork();
        debug!(remote_id = %task.node.id, running = workers.len() + 1, "starting download");
        workers.spawn(async move {
            let _permit = permit;
            worker.run(task).await
        });
    }

    pending.close();
    while let Ok(task) = pending.try_recv() {
        warn!(remote_id = %task.node.id, "download skipped: mirror aborted");
    }

    let mut reports = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(err) => error!("download worker panicked: {err}"),
        }
    }
    reports
}

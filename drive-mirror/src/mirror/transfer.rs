use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, trace, warn};

use super::paths::PathAllocator;
use super::source::{RemoteNode, RemoteTreeSource, SourceError};
use super::verify::{IntegrityVerifier, VerificationResult};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("remote error: {0}")]
    Source(#[from] SourceError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Verified,
    ChecksumMismatch,
    SizeMismatch,
    NotVerifiable,
    Failed(String),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Running)
    }

    pub fn from_verification(result: VerificationResult) -> Self {
        match (result.checksum_match, result.size_match) {
            (Some(false), _) => TaskState::ChecksumMismatch,
            (_, Some(false)) => TaskState::SizeMismatch,
            _ if result.is_verifiable() => TaskState::Verified,
            _ => TaskState::NotVerifiable,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Queued => f.write_str("queued"),
            TaskState::Running => f.write_str("running"),
            TaskState::Verified => f.write_str("verified"),
            TaskState::ChecksumMismatch => f.write_str("checksum-mismatch"),
            TaskState::SizeMismatch => f.write_str("size-mismatch"),
            TaskState::NotVerifiable => f.write_str("not-verifiable"),
            TaskState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub node: RemoteNode,
    /// Preferred location; the final path may carry a disambiguation suffix.
    pub target_path: PathBuf,
    pub state: TaskState,
}

impl DownloadTask {
    pub fn new(node: RemoteNode, target_path: PathBuf) -> Self {
        Self {
            node,
            target_path,
            state: TaskState::Queued,
        }
    }
}

/// Terminal record of one task, kept after the task itself is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub remote_id: String,
    pub path: PathBuf,
    pub state: TaskState,
}

impl TaskReport {
    /// `path` is where the bytes went, which may differ from the task's target.
    fn settle(task: DownloadTask, path: PathBuf) -> Self {
        debug_assert!(task.state.is_terminal(), "task reported while {}", task.state);
        Self {
            remote_id: task.node.id,
            path,
            state: task.state,
        }
    }
}

pub struct Downloader<S> {
    source: S,
    allocator: PathAllocator,
    verifier: IntegrityVerifier,
}

impl<S: RemoteTreeSource> Downloader<S> {
    pub fn new(source: S, verifier: IntegrityVerifier) -> Self {
        Self::with_allocator(source, PathAllocator::default(), verifier)
    }

    /// Shares `allocator` with the traversal so directory and file claims
    /// see each other.
    pub fn with_allocator(source: S, allocator: PathAllocator, verifier: IntegrityVerifier) -> Self {
        Self {
            source,
            allocator,
            verifier,
        }
    }

    /// A downloader with its own remote handle, for one worker.
    pub fn fork(&self) -> Self {
        Self {
            source: self.source.fork(),
            allocator: self.allocator.clone(),
            verifier: self.verifier,
        }
    }

    pub async fn run(&self, mut task: DownloadTask) -> TaskReport {
        task.state = TaskState::Running;
        let remote_id = task.node.id.clone();

        let (path, file) = match self.allocator.allocate(&task.target_path).await {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(remote_id = %remote_id, path = %task.target_path.display(), "cannot claim local path: {err}");
                task.state = TaskState::Failed(err.to_string());
                let path = task.target_path.clone();
                return TaskReport::settle(task, path);
            }
        };
        if path != task.target_path {
            debug!(
                remote_id = %remote_id,
                wanted = %task.target_path.display(),
                path = %path.display(),
                "local name taken, using suffixed path"
            );
        }

        info!(remote_id = %remote_id, path = %path.display(), "copying file");
        task.state = match self.transfer(&remote_id, file).await {
            Ok(written) => {
                info!(remote_id = %remote_id, path = %path.display(), bytes = written, "copy finished");
                match self.verifier.verify(&self.source, &remote_id, &path).await {
                    Ok(result) => TaskState::from_verification(result),
                    Err(err) => {
                        error!(remote_id = %remote_id, path = %path.display(), "verification failed: {err}");
                        TaskState::Failed(err.to_string())
                    }
                }
            }
            Err(err) => {
                error!(remote_id = %remote_id, path = %path.display(), "copy failed: {err}");
                discard_partial(&path).await;
                TaskState::Failed(err.to_string())
            }
        };

        let state = &task.state;
        match state {
            TaskState::ChecksumMismatch | TaskState::SizeMismatch => {
                error!(remote_id = %remote_id, path = %path.display(), %state, "file kept for inspection")
            }
            _ => debug!(remote_id = %remote_id, path = %path.display(), %state, "task finished"),
        }
        TaskReport::settle(task, path)
    }

    async fn transfer(&self, remote_id: &str, mut file: File) -> Result<u64, TransferError> {
        let mut stream = self.source.open_content(remote_id).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            trace!(remote_id = %remote_id, written, "chunk written");
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to remove partial file: {err}"),
    }
}

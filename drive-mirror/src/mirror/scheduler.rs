use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info};

use super::paths::{PathAllocator, PathError, sanitize_name};
use super::pool::{DEFAULT_CONCURRENCY, PoolError, WorkerPool};
use super::source::{NodeKind, RemoteTreeSource, list_children};
use super::transfer::{DownloadTask, Downloader, TaskReport, TaskState};
use super::verify::{DEFAULT_CHUNK_SIZE, IntegrityVerifier};

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("a file already occupies directory path {0}")]
    DirectoryConflict(PathBuf),
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("cannot place directory: {0}")]
    Path(PathError),
    #[error("download pool error: {0}")]
    Pool(#[from] PoolError),
}

impl From<PathError> for MirrorError {
    fn from(err: PathError) -> Self {
        match err {
            PathError::Occupied(path) => MirrorError::DirectoryConflict(path),
            PathError::Create { path, source } => MirrorError::CreateDir { path, source },
            other => MirrorError::Path(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MirrorOptions {
    pub concurrency: usize,
    pub verify_chunk_size: usize,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            verify_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// One folder still waiting to have its children listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalQueueItem {
    pub remote_folder_id: String,
    pub local_dir_path: PathBuf,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TraversalStats {
    pub folders_expanded: usize,
    pub files_submitted: usize,
    pub listing_failures: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub verified: usize,
    pub checksum_mismatch: usize,
    pub size_mismatch: usize,
    pub not_verifiable: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct MirrorReport {
    pub stats: TraversalStats,
    pub tasks: Vec<TaskReport>,
}

impl MirrorReport {
    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for task in &self.tasks {
            match task.state {
                TaskState::Verified => counts.verified += 1,
                TaskState::ChecksumMismatch => counts.checksum_mismatch += 1,
                TaskState::SizeMismatch => counts.size_mismatch += 1,
                TaskState::NotVerifiable => counts.not_verifiable += 1,
                TaskState::Failed(_) | TaskState::Queued | TaskState::Running => {
                    counts.failed += 1
                }
            }
        }
        counts
    }

    pub fn task_for(&self, remote_id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|task| task.remote_id == remote_id)
    }
}

/// Breadth-first walk of the remote tree. Directories are created here, on the
/// traversal path, before any file inside them is handed to the pool.
pub struct TraversalScheduler<S> {
    source: S,
    allocator: PathAllocator,
    queue: VecDeque<TraversalQueueItem>,
}

impl<S: RemoteTreeSource> TraversalScheduler<S> {
    /// `allocator` must be the one the pool's downloader claims files with.
    pub fn new(source: S, allocator: PathAllocator) -> Self {
        Self {
            source,
            allocator,
            queue: VecDeque::new(),
        }
    }

    pub async fn mirror(
        &mut self,
        root_remote_id: &str,
        root_local_path: &Path,
        pool: &WorkerPool,
    ) -> Result<TraversalStats, MirrorError> {
        let mut stats = TraversalStats::default();
        ensure_root(root_local_path).await?;
        self.queue.clear();
        self.queue.push_back(TraversalQueueItem {
            remote_folder_id: root_remote_id.to_string(),
            local_dir_path: root_local_path.to_path_buf(),
        });

        while let Some(item) = self.queue.pop_front() {
            stats.folders_expanded += 1;
            debug!(
                remote_id = %item.remote_folder_id,
                path = %item.local_dir_path.display(),
                "expanding folder"
            );
            let mut children = list_children(&self.source, &item.remote_folder_id);
            loop {
                let child = match children.next().await {
                    Ok(Some(child)) => child,
                    Ok(None) => break,
                    Err(err) => {
                        error!(
                            remote_id = %item.remote_folder_id,
                            path = %item.local_dir_path.display(),
                            "listing failed, skipping rest of folder: {err}"
                        );
                        stats.listing_failures += 1;
                        break;
                    }
                };
                let item_path = item.local_dir_path.join(sanitize_name(&child.name));
                match child.kind {
                    NodeKind::Folder => {
                        debug!(path = %item_path.display(), "making directory");
                        let item_path = self.allocator.allocate_dir(&item_path).await?;
                        self.queue.push_back(TraversalQueueItem {
                            remote_folder_id: child.id,
                            local_dir_path: item_path,
                        });
                    }
                    NodeKind::File => {
                        debug!(
                            remote_id = %child.id,
                            name = %child.name,
                            path = %item_path.display(),
                            "queueing download"
                        );
                        pool.submit(DownloadTask::new(child, item_path))?;
                        stats.files_submitted += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}

/// Mirrors the tree under `root_remote_id` into `root_local_path` and waits
/// for every download to finish.
pub async fn mirror_tree<S: RemoteTreeSource>(
    source: S,
    root_remote_id: &str,
    root_local_path: &Path,
    options: MirrorOptions,
) -> Result<MirrorReport, MirrorError> {
    info!(
        remote_id = root_remote_id,
        path = %root_local_path.display(),
        concurrency = options.concurrency,
        "mirror started"
    );
    let allocator = PathAllocator::default();
    let downloader = Downloader::with_allocator(
        source.fork(),
        allocator.clone(),
        IntegrityVerifier::new(options.verify_chunk_size),
    );
    let pool = WorkerPool::new(downloader, options.concurrency);
    let mut scheduler = TraversalScheduler::new(source, allocator);

    let stats = match scheduler.mirror(root_remote_id, root_local_path, &pool).await {
        Ok(stats) => stats,
        Err(err) => {
            error!("mirror aborted: {err}");
            let finished = pool.abandon().await?;
            info!(finished = finished.len(), "in-flight downloads settled after abort");
            return Err(err);
        }
    };
    let tasks = pool.drain().await?;
    let report = MirrorReport { stats, tasks };
    let counts = report.counts();
    info!(
        folders = stats.folders_expanded,
        files = stats.files_submitted,
        listing_failures = stats.listing_failures,
        verified = counts.verified,
        checksum_mismatch = counts.checksum_mismatch,
        size_mismatch = counts.size_mismatch,
        not_verifiable = counts.not_verifiable,
        failed = counts.failed,
        "mirror finished"
    );
    Ok(report)
}

async fn ensure_root(path: &Path) -> Result<(), MirrorError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| MirrorError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    ensure_dir(path).await
}

/// Creates `path` as a directory; an existing directory is fine, an existing
/// file is a conflict.
async fn ensure_dir(path: &Path) -> Result<(), MirrorError> {
    match tokio::fs::create_dir(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|source| MirrorError::CreateDir {
                    path: path.to_path_buf(),
                    source,
                })?;
            if metadata.is_dir() {
                Ok(())
            } else {
                Err(MirrorError::DirectoryConflict(path.to_path_buf()))
            }
        }
        Err(source) => Err(MirrorError::CreateDir {
            path: path.to_path_buf(),
            source,
        }),
    }
}

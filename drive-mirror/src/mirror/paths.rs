use std::collections::HashSet;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::fs::{File, OpenOptions};

const SEPARATOR_SUBSTITUTE: char = '.';
const MAX_SUFFIX: u32 = 9999;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("target path has no file name: {0}")]
    NoFileName(PathBuf),
    #[error("no free name left for {0}")]
    Exhausted(PathBuf),
    #[error("a file that predates this run occupies directory path {0}")]
    Occupied(PathBuf),
    #[error("failed to create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
}

/// Turns a remote display name into a single local path component.
///
/// Separators are replaced, so distinct remote names may map to the same
/// local name; the allocator resolves that later.
pub fn sanitize_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c == '/' || std::path::is_separator(c) || c == '\0' {
                SEPARATOR_SUBSTITUTE
            } else {
                c
            }
        })
        .collect();
    match replaced.as_str() {
        "" => "_".to_string(),
        "." | ".." => replaced.replace('.', "_"),
        _ => replaced,
    }
}

/// Claims local paths that nobody else holds.
///
/// File claims are exclusive creates, so two concurrent callers can never
/// receive the same path. On conflict the next numeric suffix is tried:
/// `x`, `x.1`, `x.2`, ...
///
/// Clones share one ledger of the paths claimed during the run, which lets a
/// directory claim tell a file written by this run from one that was already
/// on disk.
#[derive(Debug, Clone, Default)]
pub struct PathAllocator {
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PathAllocator {
    pub async fn allocate(&self, base: &Path) -> Result<(PathBuf, File), PathError> {
        let file_name = file_name_of(base)?;
        for attempt in 0..=MAX_SUFFIX {
            let candidate = candidate_path(base, &file_name, attempt);
            // Recorded before the create so a concurrent directory claim
            // never sees our file without also seeing the ledger entry.
            if !self.record(&candidate) {
                continue;
            }
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await
            {
                Ok(file) => return Ok((candidate, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    self.forget(&candidate);
                }
                Err(source) => {
                    self.forget(&candidate);
                    return Err(PathError::Create {
                        path: candidate,
                        source,
                    });
                }
            }
        }
        Err(PathError::Exhausted(base.to_path_buf()))
    }

    /// Creates or reuses a directory at `base`.
    ///
    /// An existing directory is reused. A file claimed earlier in this run
    /// pushes the directory to the next free suffix. A file that was already
    /// there before the run is reported as [`PathError::Occupied`].
    pub async fn allocate_dir(&self, base: &Path) -> Result<PathBuf, PathError> {
        let file_name = file_name_of(base)?;
        for attempt in 0..=MAX_SUFFIX {
            let candidate = candidate_path(base, &file_name, attempt);
            match tokio::fs::create_dir(&candidate).await {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let metadata = tokio::fs::metadata(&candidate).await.map_err(|source| {
                        PathError::Create {
                            path: candidate.clone(),
                            source,
                        }
                    })?;
                    if metadata.is_dir() {
                        return Ok(candidate);
                    }
                    if attempt == 0 && !self.claimed_this_run(&candidate) {
                        return Err(PathError::Occupied(candidate));
                    }
                }
                Err(source) => {
                    return Err(PathError::Create {
                        path: candidate,
                        source,
                    });
                }
            }
        }
        Err(PathError::Exhausted(base.to_path_buf()))
    }

    pub fn claimed_this_run(&self, path: &Path) -> bool {
        self.ledger().contains(path)
    }

    /// Returns false when this run already holds `path`.
    fn record(&self, path: &Path) -> bool {
        self.ledger().insert(path.to_path_buf())
    }

    fn forget(&self, path: &Path) {
        self.ledger().remove(path);
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn file_name_of(base: &Path) -> Result<OsString, PathError> {
    base.file_name()
        .map(|name| name.to_os_string())
        .ok_or_else(|| PathError::NoFileName(base.to_path_buf()))
}

fn candidate_path(base: &Path, file_name: &OsString, attempt: u32) -> PathBuf {
    if attempt == 0 {
        base.to_path_buf()
    } else {
        base.with_file_name(suffixed(file_name, attempt))
    }
}

fn suffixed(file_name: &OsString, attempt: u32) -> OsString {
    let mut name = file_name.clone();
    name.push(format!(".{attempt}"));
    name
}

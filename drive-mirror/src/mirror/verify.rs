use std::io;
use std::path::Path;

use md5::Context as Md5Context;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use super::source::{RemoteMetadata, RemoteTreeSource, SourceError};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to fetch remote metadata: {0}")]
    Remote(#[from] SourceError),
    #[error("failed to read local file: {0}")]
    Io(#[from] io::Error),
}

/// Per-field comparison outcome. `None` means the check was not applicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationResult {
    pub checksum_match: Option<bool>,
    pub size_match: Option<bool>,
}

impl VerificationResult {
    pub const NOT_VERIFIABLE: Self = Self {
        checksum_match: None,
        size_match: None,
    };

    pub fn is_verifiable(&self) -> bool {
        self.checksum_match.is_some() && self.size_match.is_some()
    }

    /// Compares a remote copy against its source. Only a source that reports
    /// both size and checksum can be checked.
    pub fn compare_remote(source: &RemoteMetadata, copy: &RemoteMetadata) -> Self {
        let (Some(size), Some(md5)) = (source.size, source.checksum.as_deref()) else {
            return Self::NOT_VERIFIABLE;
        };
        Self {
            checksum_match: Some(copy.checksum.as_deref() == Some(md5)),
            size_match: Some(copy.size == Some(size)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDigest {
    pub md5: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct IntegrityVerifier {
    chunk_size: usize,
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl IntegrityVerifier {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn verify<S: RemoteTreeSource>(
        &self,
        source: &S,
        remote_id: &str,
        local_path: &Path,
    ) -> Result<VerificationResult, VerifyError> {
        let remote = source.get_metadata(remote_id).await?;
        let RemoteMetadata {
            size: Some(remote_size),
            checksum: Some(remote_md5),
        } = remote
        else {
            info!(
                remote_id,
                path = %local_path.display(),
                "skipping checksum/size checks: remote reports no checksum"
            );
            return Ok(VerificationResult::NOT_VERIFIABLE);
        };

        let local = self.local_digest(local_path).await?;
        let checksum_match = local.md5 == remote_md5.to_ascii_lowercase();
        let size_match = local.size == remote_size;

        if checksum_match {
            info!(remote_id, path = %local_path.display(), md5 = %local.md5, "checksums match");
        } else {
            error!(
                remote_id,
                path = %local_path.display(),
                local = %local.md5,
                remote = %remote_md5,
                "checksums do not match"
            );
        }
        if size_match {
            info!(remote_id, path = %local_path.display(), size = local.size, "sizes match");
        } else {
            error!(
                remote_id,
                path = %local_path.display(),
                local = local.size,
                remote = remote_size,
                "sizes do not match"
            );
        }

        Ok(VerificationResult {
            checksum_match: Some(checksum_match),
            size_match: Some(size_match),
        })
    }

    /// Hashes the file in fixed-size chunks so memory stays bounded.
    pub async fn local_digest(&self, path: &Path) -> io::Result<LocalDigest> {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let mut ctx = Md5Context::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            ctx.consume(&buf[..read]);
        }
        Ok(LocalDigest {
            md5: format!("{:x}", ctx.compute()),
            size,
        })
    }
}

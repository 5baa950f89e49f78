pub mod paths;
pub mod pool;
pub mod scheduler;
pub mod source;
#[cfg(test)]
mod testing;
pub mod transfer;
pub mod verify;

pub use paths::{PathAllocator, sanitize_name};
pub use pool::WorkerPool;
pub use scheduler::{
    MirrorError, MirrorOptions, MirrorReport, OutcomeCounts, TraversalScheduler, mirror_tree,
};
pub use source::{Credentials, DriveSource, NodeKind, RemoteNode, RemoteTreeSource};
pub use transfer::{DownloadTask, Downloader, TaskReport, TaskState};
pub use verify::{IntegrityVerifier, VerificationResult};

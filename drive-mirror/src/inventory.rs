use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use drive_core::{DriveClient, DriveError, DriveFile};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::mirror::source::RemoteMetadata;
use crate::mirror::{TaskState, VerificationResult};

const LIST_PAGE_SIZE: u32 = 1000;

/// Pages through every file matching `query`, stopping at `max_results`.
pub async fn collect_files(
    client: &DriveClient,
    query: Option<&str>,
    max_results: Option<usize>,
) -> Result<Vec<DriveFile>, DriveError> {
    let page_size = max_results
        .map(|max| max.clamp(1, LIST_PAGE_SIZE as usize) as u32)
        .unwrap_or(LIST_PAGE_SIZE);
    let mut found = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = client
            .list_files(query, Some(page_size), page_token.as_deref())
            .await?;
        for file in page.files {
            found.push(file);
            if max_results.is_some_and(|max| found.len() >= max) {
                return Ok(found);
            }
        }
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => return Ok(found),
        }
    }
}

pub fn describe(file: &DriveFile) -> String {
    match (file.size, file.md5_checksum.as_deref()) {
        (Some(size), Some(md5)) => format!(
            "{} {} {} {} {}",
            file.name, file.mime_type, size, file.id, md5
        ),
        _ => format!("{} {} {}", file.name, file.mime_type, file.id),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeleteSummary {
    pub deleted: usize,
    pub failed: usize,
}

/// Deletes each file in turn; one failure does not stop the rest.
pub async fn delete_files(client: &DriveClient, files: &[DriveFile]) -> DeleteSummary {
    let mut summary = DeleteSummary::default();
    for file in files {
        match client.delete_file(&file.id).await {
            Ok(()) => {
                info!(remote_id = %file.id, name = %file.name, "deleted");
                summary.deleted += 1;
            }
            Err(err) => {
                warn!(remote_id = %file.id, status = ?err.status(), "delete failed: {err}");
                summary.failed += 1;
            }
        }
    }
    summary
}

/// The two-step confirmation the list command asks for before deleting.
pub fn confirms_delete(first: &str, second: &str) -> bool {
    first.trim() == "yes" && second.trim() == "Y"
}

/// Groups files by content checksum in a single pass.
#[derive(Debug, Default, Serialize)]
pub struct DuplicateIndex {
    #[serde(flatten)]
    by_md5: BTreeMap<String, Vec<DriveFile>>,
    #[serde(skip)]
    files_seen: usize,
    #[serde(skip)]
    files_with_md5: usize,
}

impl DuplicateIndex {
    /// Records `file`; returns the id of the first file already seen with the same checksum.
    pub fn observe(&mut self, file: DriveFile) -> Option<String> {
        self.files_seen += 1;
        let md5 = file.md5_checksum.clone()?;
        self.files_with_md5 += 1;
        let group = self.by_md5.entry(md5).or_default();
        let first = group.first().map(|existing| existing.id.clone());
        group.push(file);
        first
    }

    pub fn files_seen(&self) -> usize {
        self.files_seen
    }

    pub fn files_with_md5(&self) -> usize {
        self.files_with_md5
    }

    pub fn duplicate_groups(&self) -> impl Iterator<Item = (&str, &[DriveFile])> {
        self.by_md5
            .iter()
            .filter(|(_, files)| files.len() > 1)
            .map(|(md5, files)| (md5.as_str(), files.as_slice()))
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

pub fn conflict_line(id: &str, first: &str) -> String {
    format!("{id} conflicts with {first}")
}

/// Lists every file visible to the account and indexes it by checksum.
pub async fn scan_duplicates(client: &DriveClient) -> Result<DuplicateIndex, DriveError> {
    let mut index = DuplicateIndex::default();
    let mut page_token: Option<String> = None;
    loop {
        let page = client
            .list_files(None, Some(LIST_PAGE_SIZE), page_token.as_deref())
            .await?;
        for file in page.files {
            let id = file.id.clone();
            let md5 = file.md5_checksum.clone();
            if let Some(first) = index.observe(file) {
                info!(
                    remote_id = %id,
                    first = %first,
                    md5 = md5.as_deref().unwrap_or_default(),
                    "{}",
                    conflict_line(&id, &first)
                );
            }
        }
        debug!(files = index.files_seen(), "files analyzed");
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => return Ok(index),
        }
    }
}

/// Copies already made, keyed by source id. On disk each save appends one
/// JSON document on a new line and only the last line is read back.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CopyStatus {
    copies: BTreeMap<String, DriveFile>,
}

impl CopyStatus {
    /// A missing file is an empty status.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "no status file found, starting from scratch");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let Some(last) = text.lines().rev().find(|line| !line.trim().is_empty()) else {
            return Ok(Self::default());
        };
        let status: Self = serde_json::from_str(last)
            .with_context(|| format!("unable to decode status file {}", path.display()))?;
        info!(copied = status.len(), "files already copied in a previous attempt");
        Ok(status)
    }

    pub fn append_to(&self, path: &Path) -> anyhow::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let line = serde_json::to_string(self)?;
        writeln!(file)
            .and_then(|()| file.write_all(line.as_bytes()))
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn copy_of(&self, source_id: &str) -> Option<&DriveFile> {
        self.copies.get(source_id)
    }

    pub fn len(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }
}

pub fn read_copy_list(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("unable to decode {}", path.display()))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopySummary {
    pub copied: usize,
    pub reused: usize,
    pub verified: usize,
    pub mismatched: usize,
    pub not_verifiable: usize,
    pub failed: usize,
}

/// Copies each id into `parent_id` unless `status` already records a copy,
/// then checks the copy's size and checksum against the source. One failure
/// does not stop the rest.
pub async fn copy_files(
    client: &DriveClient,
    ids: &[String],
    parent_id: &str,
    status: &mut CopyStatus,
) -> CopySummary {
    let mut summary = CopySummary::default();
    for id in ids {
        let state = match copy_one(client, id, parent_id, status, &mut summary).await {
            Ok(state) => state,
            Err(err) => {
                error!(remote_id = %id, status = ?err.status(), "copying and verifying failed: {err}");
                TaskState::Failed(err.to_string())
            }
        };
        match state {
            TaskState::Verified => summary.verified += 1,
            TaskState::ChecksumMismatch | TaskState::SizeMismatch => summary.mismatched += 1,
            TaskState::NotVerifiable => summary.not_verifiable += 1,
            _ => summary.failed += 1,
        }
    }
    summary
}

async fn copy_one(
    client: &DriveClient,
    id: &str,
    parent_id: &str,
    status: &mut CopyStatus,
    summary: &mut CopySummary,
) -> Result<TaskState, DriveError> {
    let copy_id = match status.copy_of(id) {
        Some(copy) => {
            info!(remote_id = %id, copy_id = %copy.id, "already copied in the past, skipping");
            summary.reused += 1;
            copy.id.clone()
        }
        None => {
            debug!(remote_id = %id, parent = %parent_id, "copying file");
            let copy = client.copy_file(id, parent_id).await?;
            info!(remote_id = %id, copy_id = %copy.id, "copied file");
            summary.copied += 1;
            let copy_id = copy.id.clone();
            status.copies.insert(id.to_string(), copy);
            copy_id
        }
    };

    let source = RemoteMetadata::from(client.get_file_metadata(id).await?);
    if source.size.is_none() || source.checksum.is_none() {
        info!(remote_id = %id, "skipping checksum/size checks: not a binary file");
        return Ok(TaskState::NotVerifiable);
    }
    let copy = RemoteMetadata::from(client.get_file_metadata(&copy_id).await?);
    let result = VerificationResult::compare_remote(&source, &copy);
    if result.checksum_match == Some(true) {
        info!(remote_id = %id, copy_id = %copy_id, md5 = ?copy.checksum, "checksums match");
    } else {
        warn!(
            remote_id = %id,
            copy_id = %copy_id,
            copy = ?copy.checksum,
            source = ?source.checksum,
            "checksums do not match"
        );
    }
    if result.size_match == Some(true) {
        info!(remote_id = %id, copy_id = %copy_id, size = ?copy.size, "sizes match");
    } else {
        warn!(
            remote_id = %id,
            copy_id = %copy_id,
            copy = ?copy.size,
            source = ?source.size,
            "sizes do not match"
        );
    }
    Ok(TaskState::from_verification(result))
}

//! In-memory remote tree used by the engine tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use drive_core::{DriveError, StatusCode};
use futures_util::StreamExt;

use super::source::{
    ChildPage, ContentStream, NodeKind, RemoteMetadata, RemoteNode, RemoteTreeSource, SourceError,
};

#[derive(Default)]
struct State {
    children: HashMap<String, Vec<RemoteNode>>,
    contents: HashMap<String, Vec<u8>>,
    metadata: HashMap<String, RemoteMetadata>,
    fail_after: HashMap<String, usize>,
    fail_listing: HashMap<String, usize>,
    listing_delay: Option<Duration>,
    expansion_order: Vec<String>,
    page_requests: HashMap<String, usize>,
    chunk_delay: Option<Duration>,
    active_streams: usize,
    peak_streams: usize,
    forks: usize,
}

#[derive(Clone, Default)]
pub struct FakeTree {
    state: Arc<Mutex<State>>,
    page_size: usize,
}

impl FakeTree {
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    pub fn add_folder(&self, parent: &str, id: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.children.entry(id.to_string()).or_default();
        state
            .children
            .entry(parent.to_string())
            .or_default()
            .push(RemoteNode {
                id: id.to_string(),
                name: name.to_string(),
                kind: NodeKind::Folder,
                size: None,
                checksum: None,
            });
    }

    /// Adds a file; with `checksummed` the remote reports its real size and md5.
    pub fn add_file(&self, parent: &str, id: &str, name: &str, content: &[u8], checksummed: bool) {
        let metadata = if checksummed {
            RemoteMetadata {
                size: Some(content.len() as u64),
                checksum: Some(format!("{:x}", md5::compute(content))),
            }
        } else {
            RemoteMetadata::default()
        };
        let mut state = self.state.lock().unwrap();
        state
            .children
            .entry(parent.to_string())
            .or_default()
            .push(RemoteNode {
                id: id.to_string(),
                name: name.to_string(),
                kind: NodeKind::File,
                size: metadata.size,
                checksum: metadata.checksum.clone(),
            });
        state.contents.insert(id.to_string(), content.to_vec());
        state.metadata.insert(id.to_string(), metadata);
    }

    pub fn set_metadata(&self, id: &str, metadata: RemoteMetadata) {
        self.state
            .lock()
            .unwrap()
            .metadata
            .insert(id.to_string(), metadata);
    }

    pub fn fail_stream_after(&self, id: &str, bytes: usize) {
        self.state
            .lock()
            .unwrap()
            .fail_after
            .insert(id.to_string(), bytes);
    }

    /// Serves `after_pages` pages of `folder_id`, then fails every further page request.
    pub fn fail_listing(&self, folder_id: &str, after_pages: usize) {
        self.state
            .lock()
            .unwrap()
            .fail_listing
            .insert(folder_id.to_string(), after_pages);
    }

    /// Delays every continuation page, leaving first pages immediate.
    pub fn set_listing_delay(&self, delay: Duration) {
        self.state.lock().unwrap().listing_delay = Some(delay);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        self.state.lock().unwrap().chunk_delay = Some(delay);
    }

    pub fn expansion_order(&self) -> Vec<String> {
        self.state.lock().unwrap().expansion_order.clone()
    }

    pub fn page_requests(&self, folder_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .page_requests
            .get(folder_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn peak_streams(&self) -> usize {
        self.state.lock().unwrap().peak_streams
    }

    pub fn forks(&self) -> usize {
        self.state.lock().unwrap().forks
    }
}

struct StreamGuard(Arc<Mutex<State>>);

impl StreamGuard {
    fn open(state: &Arc<Mutex<State>>) -> Self {
        let mut guard = state.lock().unwrap();
        guard.active_streams += 1;
        guard.peak_streams = guard.peak_streams.max(guard.active_streams);
        Self(Arc::clone(state))
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.lock().unwrap().active_streams -= 1;
    }
}

impl RemoteTreeSource for FakeTree {
    async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, SourceError> {
        let delay = self.state.lock().unwrap().listing_delay;
        if let (Some(delay), Some(_)) = (delay, page_token) {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if page_token.is_none() {
            state.expansion_order.push(folder_id.to_string());
        }
        let served = state.page_requests.get(folder_id).copied().unwrap_or(0);
        *state.page_requests.entry(folder_id.to_string()).or_default() += 1;
        if state
            .fail_listing
            .get(folder_id)
            .is_some_and(|after| served >= *after)
        {
            return Err(SourceError::Api(DriveError::Api {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: format!("listing {folder_id} failed"),
            }));
        }
        let all = state.children.get(folder_id).cloned().unwrap_or_default();
        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = if self.page_size == 0 {
            all.len()
        } else {
            (offset + self.page_size).min(all.len())
        };
        Ok(ChildPage {
            nodes: all[offset.min(end)..end].to_vec(),
            next_page_token: (end < all.len()).then(|| end.to_string()),
        })
    }

    async fn open_content(&self, file_id: &str) -> Result<ContentStream, SourceError> {
        let (content, fail_after, delay) = {
            let state = self.state.lock().unwrap();
            let content = state
                .contents
                .get(file_id)
                .cloned()
                .ok_or_else(|| SourceError::Stream {
                    id: file_id.to_string(),
                    reason: "no such file".to_string(),
                })?;
            (content, state.fail_after.get(file_id).copied(), state.chunk_delay)
        };

        let mut items: Vec<Result<Bytes, SourceError>> = Vec::new();
        let mut sent = 0usize;
        for chunk in content.chunks(2) {
            if fail_after.is_some_and(|limit| sent >= limit) {
                break;
            }
            sent += chunk.len();
            items.push(Ok(Bytes::copy_from_slice(chunk)));
        }
        if fail_after.is_some() {
            items.push(Err(SourceError::Stream {
                id: file_id.to_string(),
                reason: "connection reset".to_string(),
            }));
        }

        let guard = StreamGuard::open(&self.state);
        Ok(futures_util::stream::iter(items)
            .then(move |item| {
                let _held = &guard;
                async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    item
                }
            })
            .boxed())
    }

    async fn get_metadata(&self, file_id: &str) -> Result<RemoteMetadata, SourceError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .metadata
            .get(file_id)
            .cloned()
            .unwrap_or_default())
    }

    fn fork(&self) -> Self {
        self.state.lock().unwrap().forks += 1;
        self.clone()
    }
}

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use drive_core::{DriveClient, DriveError, DriveFile, FileMetadata};
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use thiserror::Error;
use url::Url;

pub type ContentStream = BoxStream<'static, Result<Bytes, SourceError>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("remote api error: {0}")]
    Api(#[from] DriveError),
    #[error("content stream for {id} broke: {reason}")]
    Stream { id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
}

/// Snapshot of one remote entry as seen when its parent was listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub size: Option<u64>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub size: Option<u64>,
    pub checksum: Option<String>,
}

#[derive(Debug, Default)]
pub struct ChildPage {
    pub nodes: Vec<RemoteNode>,
    pub next_page_token: Option<String>,
}

pub trait RemoteTreeSource: Send + Sync + Sized + 'static {
    fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> impl Future<Output = Result<ChildPage, SourceError>> + Send;

    fn open_content(
        &self,
        file_id: &str,
    ) -> impl Future<Output = Result<ContentStream, SourceError>> + Send;

    /// Current size and checksum, fetched independently of any earlier listing.
    fn get_metadata(
        &self,
        file_id: &str,
    ) -> impl Future<Output = Result<RemoteMetadata, SourceError>> + Send;

    /// An independent handle for use by a single worker.
    fn fork(&self) -> Self;
}

/// Lazily paginated children of one folder.
pub struct Children<'a, S> {
    source: &'a S,
    folder_id: &'a str,
    buffered: VecDeque<RemoteNode>,
    next_page: Option<String>,
    exhausted: bool,
}

pub fn list_children<'a, S: RemoteTreeSource>(source: &'a S, folder_id: &'a str) -> Children<'a, S> {
    Children {
        source,
        folder_id,
        buffered: VecDeque::new(),
        next_page: None,
        exhausted: false,
    }
}

impl<S: RemoteTreeSource> Children<'_, S> {
    pub async fn next(&mut self) -> Result<Option<RemoteNode>, SourceError> {
        loop {
            if let Some(node) = self.buffered.pop_front() {
                return Ok(Some(node));
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self
                .source
                .list_page(self.folder_id, self.next_page.as_deref())
                .await?;
            self.next_page = page.next_page_token;
            self.exhausted = self.next_page.is_none();
            self.buffered.extend(page.nodes);
        }
    }
}

/// Read-only material a worker needs to open its own session.
pub struct Credentials {
    pub base_url: Url,
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("base_url", &self.base_url.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

pub struct DriveSource {
    credentials: Arc<Credentials>,
    client: DriveClient,
}

impl DriveSource {
    pub fn new(credentials: Credentials) -> Self {
        let credentials = Arc::new(credentials);
        let client = client_for(&credentials);
        Self {
            credentials,
            client,
        }
    }

    pub fn client(&self) -> &DriveClient {
        &self.client
    }
}

fn client_for(credentials: &Credentials) -> DriveClient {
    DriveClient::from_parts(credentials.base_url.clone(), credentials.token.clone())
}

impl From<DriveFile> for RemoteNode {
    fn from(file: DriveFile) -> Self {
        let kind = if file.is_folder() {
            NodeKind::Folder
        } else {
            NodeKind::File
        };
        Self {
            id: file.id,
            name: file.name,
            kind,
            size: file.size,
            checksum: file.md5_checksum,
        }
    }
}

impl From<FileMetadata> for RemoteMetadata {
    fn from(meta: FileMetadata) -> Self {
        Self {
            size: meta.size,
            checksum: meta.md5_checksum,
        }
    }
}

impl RemoteTreeSource for DriveSource {
    async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, SourceError> {
        let list = self.client.list_children(folder_id, page_token).await?;
        Ok(ChildPage {
            nodes: list.files.into_iter().map(RemoteNode::from).collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn open_content(&self, file_id: &str) -> Result<ContentStream, SourceError> {
        let response = self.client.download(file_id).await?;
        Ok(response
            .bytes_stream()
            .map_err(|err| SourceError::Api(DriveError::Request(err)))
            .boxed())
    }

    async fn get_metadata(&self, file_id: &str) -> Result<RemoteMetadata, SourceError> {
        Ok(self.client.get_file_metadata(file_id).await?.into())
    }

    fn fork(&self) -> Self {
        Self {
            credentials: Arc::clone(&self.credentials),
            client: client_for(&self.credentials),
        }
    }
}

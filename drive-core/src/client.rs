use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const FILES_ENDPOINT: &str = "/drive/v3/files";
const LIST_FIELDS: &str = "nextPageToken, files(id, name, mimeType, size, md5Checksum)";
const METADATA_FIELDS: &str = "id,md5Checksum,size";
const FILE_FIELDS: &str = "id,name,mimeType,size,md5Checksum";
const CHILDREN_PAGE_SIZE: u32 = 1000;

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments: {0}")]
    InvalidBaseUrl(String),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self::from_parts(Url::parse(base_url)?, token))
    }

    /// Builds a client with its own connection pool from an already validated base url.
    pub fn from_parts(base_url: Url, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url,
            token: token.into(),
        }
    }

    pub async fn list_files(
        &self,
        query: Option<&str>,
        page_size: Option<u32>,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError> {
        let mut url = self.endpoint(FILES_ENDPOINT)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("fields", LIST_FIELDS);
            if let Some(query) = query.filter(|q| !q.is_empty()) {
                pairs.append_pair("q", query);
            }
            if let Some(page_size) = page_size {
                pairs.append_pair("pageSize", &page_size.to_string());
            }
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError> {
        let query = children_query(folder_id);
        self.list_files(Some(&query), Some(CHILDREN_PAGE_SIZE), page_token)
            .await
    }

    pub async fn get_file_metadata(&self, file_id: &str) -> Result<FileMetadata, DriveError> {
        let mut url = self.file_endpoint(file_id)?;
        url.query_pairs_mut().append_pair("fields", METADATA_FIELDS);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Starts a content download. The body is left unread so callers can stream it.
    pub async fn download(&self, file_id: &str) -> Result<Response, DriveError> {
        let mut url = self.file_endpoint(file_id)?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Copies `file_id` into the folder `parent_id` and returns the new file.
    pub async fn copy_file(&self, file_id: &str, parent_id: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.file_endpoint(file_id)?;
        url.path_segments_mut()
            .map_err(|_| DriveError::InvalidBaseUrl(self.base_url.to_string()))?
            .push("copy");
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let body = CopyRequest {
            parents: vec![parent_id],
        };
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<(), DriveError> {
        let url = self.file_endpoint(file_id)?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    fn file_endpoint(&self, file_id: &str) -> Result<Url, DriveError> {
        let mut url = self.endpoint(FILES_ENDPOINT)?;
        url.path_segments_mut()
            .map_err(|_| DriveError::InvalidBaseUrl(self.base_url.to_string()))?
            .push(file_id);
        Ok(url)
    }

    async fn check_status(response: Response) -> Result<Response, DriveError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, DriveError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

impl DriveError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DriveError::Api { status, .. } => Some(*status),
            DriveError::Request(err) => err.status(),
            _ => None,
        }
    }
}

fn children_query(folder_id: &str) -> String {
    let escaped = folder_id.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}' in parents")
}

#[derive(Serialize)]
struct CopyRequest<'a> {
    parents: Vec<&'a str>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
}

// Drive encodes int64 fields as decimal strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireSize {
    Text(String),
    Number(u64),
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<WireSize>::deserialize(deserializer)? {
        None => Ok(None),
        Some(WireSize::Number(value)) => Ok(Some(value)),
        Some(WireSize::Text(text)) => text
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

mod client;

pub use client::{
    DriveClient, DriveError, DriveFile, FOLDER_MIME_TYPE, FileList, FileMetadata,
};
pub use reqwest::StatusCode;

use std::fmt;
use std::path::PathBuf;

use anyhow::Context;
use url::Url;

use crate::mirror::MirrorOptions;
use crate::mirror::pool::DEFAULT_CONCURRENCY;
use crate::mirror::source::Credentials;
use crate::mirror::verify::DEFAULT_CHUNK_SIZE;

const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com";
const DEFAULT_DEST_DIR: &str = "root";
const DEFAULT_LOG_FILE: &str = "drive_mirror.log";

#[derive(Clone)]
pub struct MirrorConfig {
    pub access_token: String,
    pub api_base_url: Url,
    pub concurrency: usize,
    pub dest: PathBuf,
    pub log_file: Option<PathBuf>,
    pub verify_chunk_size: usize,
}

impl MirrorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let access_token = lookup("DRIVE_ACCESS_TOKEN")
            .filter(|value| !value.trim().is_empty())
            .context("DRIVE_ACCESS_TOKEN is not set")?;
        let base = lookup("DRIVE_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let api_base_url =
            Url::parse(&base).with_context(|| format!("invalid DRIVE_API_BASE_URL {base:?}"))?;
        let concurrency = read_positive(&lookup, "DRIVE_MIRROR_CONCURRENCY", DEFAULT_CONCURRENCY);
        let dest = lookup("DRIVE_MIRROR_DEST")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEST_DIR));
        let log_file = match lookup("DRIVE_MIRROR_LOG_FILE") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(PathBuf::from(value)),
            None => Some(PathBuf::from(DEFAULT_LOG_FILE)),
        };
        let verify_chunk_size = read_positive(&lookup, "DRIVE_VERIFY_CHUNK_BYTES", DEFAULT_CHUNK_SIZE);

        Ok(Self {
            access_token,
            api_base_url,
            concurrency,
            dest,
            log_file,
            verify_chunk_size,
        })
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            base_url: self.api_base_url.clone(),
            token: self.access_token.clone(),
        }
    }

    pub fn mirror_options(&self) -> MirrorOptions {
        MirrorOptions {
            concurrency: self.concurrency,
            verify_chunk_size: self.verify_chunk_size,
        }
    }
}

impl fmt::Debug for MirrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorConfig")
            .field("access_token", &"<redacted>")
            .field("api_base_url", &self.api_base_url.as_str())
            .field("concurrency", &self.concurrency)
            .field("dest", &self.dest)
            .field("log_file", &self.log_file)
            .field("verify_chunk_size", &self.verify_chunk_size)
            .finish()
    }
}

fn read_positive<F>(lookup: &F, name: &str, default: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

//! Build context acquisition.

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const ARCHIVE_FILE: &str = "archive";
const CONTENTS_DIR: &str = "contents";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to download context from {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("context download from {url} failed with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to read context archive {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write context archive: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to extract context archive: {0}")]
    Extract(#[source] std::io::Error),

    #[error("context fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful fetch: the downloaded archive and the directory it was unpacked into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub archive: PathBuf,
    pub contents_dir: PathBuf,
}

#[async_trait]
pub trait ContextFetcher: Send + Sync {
    /// Retrieves `source` and unpacks it below `dest_dir`, giving up after `timeout`.
    async fn fetch_and_extract(
        &self,
        source: &str,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<Extraction, FetchError>;
}

/// Fetches tar or tar.gz archives over HTTP(S) or from the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct ArchiveContextFetcher {
    client: reqwest::Client,
}

impl ArchiveContextFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn read_source(&self, source: &str) -> Result<Vec<u8>, FetchError> {
        if source.starts_with("http://") || source.starts_with("https://") {
            return self.download(source).await;
        }

        let path = PathBuf::from(source.strip_prefix("file://").unwrap_or(source));
        debug!("Reading local context archive {}", path.display());
        tokio::fs::read(&path)
            .await
            .map_err(|source| FetchError::Read { path, source })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        info!("Downloading build context from {}", url);

        let download_error = |source| FetchError::Download {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(download_error)?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(download_error)?;
        debug!("Downloaded {} bytes of build context", bytes.len());
        Ok(bytes.to_vec())
    }

    async fn fetch(&self, source: &str, dest_dir: &Path) -> Result<Extraction, FetchError> {
        let archive = dest_dir.join(ARCHIVE_FILE);
        let contents_dir = dest_dir.join(CONTENTS_DIR);

        let bytes = self.read_source(source).await?;
        tokio::fs::write(&archive, &bytes)
            .await
            .map_err(FetchError::Write)?;
        tokio::fs::create_dir_all(&contents_dir)
            .await
            .map_err(FetchError::Write)?;

        let (src, dst) = (archive.clone(), contents_dir.clone());
        tokio::task::spawn_blocking(move || unpack(&src, &dst))
            .await
            .map_err(|e| FetchError::Extract(std::io::Error::other(e)))?
            .map_err(FetchError::Extract)?;

        info!("Extracted build context into {}", contents_dir.display());
        Ok(Extraction {
            archive,
            contents_dir,
        })
    }
}

#[async_trait]
impl ContextFetcher for ArchiveContextFetcher {
    async fn fetch_and_extract(
        &self,
        source: &str,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<Extraction, FetchError> {
        tokio::time::timeout(timeout, self.fetch(source, dest_dir))
            .await
            .map_err(|_| FetchError::Timeout(timeout))?
    }
}

/// Unpacks a plain or gzip-compressed tar. Entries escaping `dest` are skipped by `tar`.
fn unpack(archive: &Path, dest: &Path) -> std::io::Result<()> {
    let mut reader = BufReader::new(File::open(archive)?);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);

    if is_gzip {
        tar::Archive::new(MultiGzDecoder::new(reader)).unpack(dest)
    } else {
        tar::Archive::new(reader).unpack(dest)
    }
}

//! Message broker contract and the file-backed outbox broker.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const OUTBOX_SCHEME: &str = "file://";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unsupported broker url {0:?}")]
    UnsupportedUrl(String),

    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("close failed: {0}")]
    Close(String),

    #[error("broker io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Routing and payload of one outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions<'a> {
    pub exchange_name: &'a str,
    pub queue_name: &'a str,
    pub content_type: &'a str,
    pub body: &'a [u8],
}

/// An open broker connection.
#[async_trait]
pub trait Publisher: Send {
    async fn publish(&mut self, options: PublishOptions<'_>) -> Result<(), BrokerError>;

    async fn close(self: Box<Self>) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Publisher>, BrokerError>;
}

/// Broker for `file://<path>` URLs: every message becomes one JSON line appended to `<path>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxBroker;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboxRecord<'a> {
    exchange: &'a str,
    queue: &'a str,
    content_type: &'a str,
    body: serde_json::Value,
}

struct OutboxPublisher {
    path: PathBuf,
    file: tokio::fs::File,
}

#[async_trait]
impl MessageBroker for OutboxBroker {
    async fn connect(&self, url: &str) -> Result<Box<dyn Publisher>, BrokerError> {
        let path = url
            .strip_prefix(OUTBOX_SCHEME)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| BrokerError::UnsupportedUrl(url.to_string()))?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| BrokerError::Connect(format!("{}: {}", path.display(), e)))?;

        debug!("Opened outbox {}", path.display());
        Ok(Box::new(OutboxPublisher { path, file }))
    }
}

#[async_trait]
impl Publisher for OutboxPublisher {
    async fn publish(&mut self, options: PublishOptions<'_>) -> Result<(), BrokerError> {
        let body = serde_json::from_slice(options.body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(options.body).into_owned())
        });

        let record = OutboxRecord {
            exchange: options.exchange_name,
            queue: options.queue_name,
            content_type: options.content_type,
            body,
        };
        let mut line =
            serde_json::to_vec(&record).map_err(|e| BrokerError::Publish(e.to_string()))?;
        line.push(b'\n');

        self.file.write_all(&line).await?;
        debug!("Appended message to {}", self.path.display());
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), BrokerError> {
        self.file
            .flush()
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))
    }
}

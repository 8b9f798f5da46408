//! # Event Sources
//!
//! Typed clients for the upstream event log. Two lookups are needed:
//! the current event of one key (queue processing) and the current heads
//! of a batch of actors (comparison sweep).
//!
//! - [`HttpEventSource`]: relay query gateway over HTTP
//! - [`FileEventSource`]: a local NDJSON export held in memory

mod file;
mod http;

pub use file::FileEventSource;
pub use http::HttpEventSource;

use crate::config::SourceConfig;
use relsync_core::{ActorKey, Checkpoint, Event, Kind, QueueKey, SyncError};
use std::future::Future;
use std::time::Duration;

/// Upstream lookups used by the consumer and the sweep.
pub trait EventSource: Send + Sync {
    /// The current event of `key`, or `None` if there is none upstream.
    fn latest(
        &self,
        key: &QueueKey,
    ) -> impl Future<Output = Result<Option<Event>, SyncError>> + Send;

    /// `(id, created_at)` of the current event per `(actor, kind)`.
    /// Keys without a current event are absent from the result.
    fn heads(
        &self,
        actors: &[ActorKey],
        kinds: &[Kind],
    ) -> impl Future<Output = Result<Vec<(QueueKey, Checkpoint)>, SyncError>> + Send;
}

/// The source selected by configuration.
#[derive(Debug)]
pub enum Source {
    Http(HttpEventSource),
    File(FileEventSource),
}

impl Source {
    /// Build from `[source]`. A URL wins over a file.
    pub fn from_config(config: &SourceConfig) -> Result<Self, SyncError> {
        if let Some(url) = &config.url {
            let timeout = Duration::from_secs(config.timeout_secs);
            return Ok(Self::Http(HttpEventSource::new(url.clone(), timeout)?));
        }
        if let Some(path) = &config.file {
            return Ok(Self::File(FileEventSource::open(path)?));
        }
        Err(SyncError::Config(
            "no event source: set source.url or source.file".into(),
        ))
    }

    /// Short description for logs and status output.
    pub fn describe(&self) -> String {
        match self {
            Self::Http(s) => format!("http {}", s.base_url()),
            Self::File(s) => format!("file ({} current events)", s.len()),
        }
    }
}

impl EventSource for Source {
    async fn latest(&self, key: &QueueKey) -> Result<Option<Event>, SyncError> {
        match self {
            Self::Http(s) => s.latest(key).await,
            Self::File(s) => s.latest(key).await,
        }
    }

    async fn heads(
        &self,
        actors: &[ActorKey],
        kinds: &[Kind],
    ) -> Result<Vec<(QueueKey, Checkpoint)>, SyncError> {
        match self {
            Self::Http(s) => s.heads(actors, kinds).await,
            Self::File(s) => s.heads(actors, kinds).await,
        }
    }
}

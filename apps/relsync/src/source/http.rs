//! # Relay Gateway Client
//!
//! Wrapper around the relay query gateway: `POST /query` with a filter
//! body, answered with newline-delimited events, most recent first.
//!
//! The response order is not trusted. Both lookups re-apply replaceable
//! semantics to whatever comes back.

use super::EventSource;
use relsync_core::{
    ActorKey, Checkpoint, Event, EventLog, Ingestor, Kind, QueueKey, SyncError, newest,
};
use serde::Serialize;
use std::time::Duration;

/// Events requested per point lookup. Relays may still hold superseded
/// versions of a replaceable event, so more than one is asked for.
const LATEST_LIMIT: usize = 8;

/// Filter body of `POST /query`.
#[derive(Debug, Serialize)]
struct QueryFilter<'a> {
    kinds: Vec<u32>,
    authors: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
}

/// HTTP client for the relay query gateway.
#[derive(Debug, Clone)]
pub struct HttpEventSource {
    http: reqwest::Client,
    base_url: String,
}

impl HttpEventSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run one query and decode the NDJSON body, skipping malformed lines.
    async fn query(&self, filter: &QueryFilter<'_>) -> Result<Vec<Event>, SyncError> {
        let url = format!("{}/query", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(filter)
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("{url}: {e}")))?;

        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SyncError::Transient(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(SyncError::Config(format!("{url} rejected query: {status}")));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| SyncError::Transient(format!("{url}: {e}")))?;
        let mut events = Vec::new();
        let stats = Ingestor::read_events(body.as_ref(), |event| events.push(event))?;
        if stats.malformed > 0 {
            tracing::info!(malformed = stats.malformed, "skipped malformed lines in query response");
        }
        Ok(events)
    }
}

impl EventSource for HttpEventSource {
    async fn latest(&self, key: &QueueKey) -> Result<Option<Event>, SyncError> {
        let filter = QueryFilter {
            kinds: vec![key.kind.0],
            authors: vec![key.actor.as_str()],
            limit: Some(LATEST_LIMIT),
        };
        let events = self.query(&filter).await?;
        Ok(newest(
            events
                .into_iter()
                .filter(|e| e.actor == key.actor && e.kind == key.kind),
        ))
    }

    async fn heads(
        &self,
        actors: &[ActorKey],
        kinds: &[Kind],
    ) -> Result<Vec<(QueueKey, Checkpoint)>, SyncError> {
        if actors.is_empty() || kinds.is_empty() {
            return Ok(Vec::new());
        }
        let filter = QueryFilter {
            kinds: kinds.iter().map(|k| k.0).collect(),
            authors: actors.iter().map(ActorKey::as_str).collect(),
            limit: None,
        };
        let mut log = EventLog::new();
        for event in self.query(&filter).await? {
            log.insert(event);
        }
        Ok(log.heads(actors, kinds))
    }
}

// =============================================================================
// TESTS
// =============================================================================

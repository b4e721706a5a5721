//! Transports: fan-out of updates to subscribers, with optional persistence
//!
//! - `local://`: in-memory broadcast, no history
//! - `bolt://path.db`: embedded append-only log (redb) with history replay
//! - `redis://host:port`: pub/sub bus shared between hub instances, no history

mod bolt;
mod local;
mod redis;

pub use self::bolt::{BoltOptions, BoltTransport, DEFAULT_BUCKET_NAME, DEFAULT_CLEANUP_FREQUENCY};
pub use self::local::LocalTransport;
pub use self::redis::{RedisTransport, DEFAULT_CHANNEL, DEFAULT_DISPATCHER_POOL_SIZE, DEFAULT_LAST_EVENT_ID_KEY};

pub use crate::update::EARLIEST_LAST_EVENT_ID as EARLIEST;

use crate::subscriber::Subscriber;
use crate::update::Update;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("hub: read/write on closed transport")]
    Closed,

    #[error("{dsn:?}: invalid transport: {reason}")]
    InvalidDsn { dsn: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] ::redb::Error),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TransportError {
    pub(crate) fn invalid_dsn(url: &Url, reason: impl Into<String>) -> Self {
        Self::InvalidDsn {
            dsn: redact(url),
            reason: reason.into(),
        }
    }
}

/// Dispatches updates and manages the subscribers of one hub
#[async_trait]
pub trait Transport: Send + Sync {
    /// Assign an id if needed, persist if supported, and fan out to matching subscribers
    async fn dispatch(&self, update: Update) -> Result<Arc<Update>, TransportError>;

    /// Register a subscriber, replay history if requested, then switch it to live mode
    async fn add_subscriber(&self, subscriber: Arc<Subscriber>) -> Result<(), TransportError>;

    async fn remove_subscriber(&self, subscriber: &Subscriber) -> Result<(), TransportError>;

    /// Disconnect every subscriber; later calls fail with [`TransportError::Closed`]
    async fn close(&self) -> Result<(), TransportError>;

    /// Introspection capability, when the transport supports it
    fn as_subscribers(&self) -> Option<&dyn TransportSubscribers> {
        None
    }
}

/// Lists the active subscribers of a transport
pub trait TransportSubscribers: Send + Sync {
    /// The last dispatched event id and the current subscribers
    fn subscribers(&self) -> Result<(String, Vec<Arc<Subscriber>>), TransportError>;
}

/// Build a transport from its DSN
pub async fn from_dsn(dsn: &str) -> Result<Arc<dyn Transport>, TransportError> {
    let url = Url::parse(dsn).map_err(|e| TransportError::InvalidDsn {
        dsn: dsn.to_string(),
        reason: e.to_string(),
    })?;

    let transport: Arc<dyn Transport> = match url.scheme() {
        "local" => Arc::new(LocalTransport::new()),
        "bolt" => Arc::new(BoltTransport::from_url(&url).await?),
        "redis" | "rediss" => Arc::new(RedisTransport::from_url(&url).await?),
        other => return Err(TransportError::invalid_dsn(&url, format!("no transport for scheme {:?}", other))),
    };

    tracing::info!(transport = %redact(&url), "Transport ready");
    Ok(transport)
}

/// DSN with any password masked
pub(crate) fn redact(url: &Url) -> String {
    if url.password().is_none() {
        return url.to_string();
    }

    let mut redacted = url.clone();
    let _ = redacted.set_password(Some("xxxxx"));
    redacted.to_string()
}

/// First value of a query parameter
pub(crate) fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Fan an update out to `subscribers`, dropping the ones that refuse it
pub(crate) fn fan_out(list: &crate::subscriber::SubscriberList, update: &Arc<Update>) {
    for subscriber in list.match_any(update) {
        if !subscriber.dispatch(update.clone(), false) {
            list.remove(&subscriber);
        }
    }
}

//! Append-only update log in an embedded redb database
//!
//! Keys are the big-endian sequence number followed by the update id, so the
//! table iterates in dispatch order. Values are the JSON encoded update.

use super::{fan_out, query_param, Transport, TransportError, TransportSubscribers, EARLIEST};
use crate::subscriber::{Subscriber, SubscriberList};
use crate::update::Update;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

pub const DEFAULT_BUCKET_NAME: &str = "updates";
pub const DEFAULT_CLEANUP_FREQUENCY: f64 = 0.3;

const SEQ_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct BoltOptions {
    pub bucket_name: String,
    /// Retained updates, 0 keeps everything
    pub size: u64,
    /// Probability, per dispatch, of running the retention sweep
    pub cleanup_frequency: f64,
}

impl Default for BoltOptions {
    fn default() -> Self {
        Self {
            bucket_name: DEFAULT_BUCKET_NAME.to_string(),
            size: 0,
            cleanup_frequency: DEFAULT_CLEANUP_FREQUENCY,
        }
    }
}

struct Inner {
    db: Database,
    options: BoltOptions,
    /// Write lock: serializes persistence with fan-out, guards the last sequence
    last_seq: Mutex<u64>,
    last_event_id: RwLock<String>,
    subscribers: SubscriberList,
    closed: AtomicBool,
}

/// Transport persisting updates for history replay
pub struct BoltTransport {
    inner: Arc<Inner>,
    path: PathBuf,
}

impl BoltTransport {
    /// Open (or create) the database at `path`, restoring the last sequence and id
    pub fn open(path: impl AsRef<Path>, options: BoltOptions) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(redb::Error::from)?;

        let (last_seq, last_event_id) = last_entry(&db, &options.bucket_name)?
            .unwrap_or_else(|| (0, EARLIEST.to_string()));

        tracing::debug!(path = %path.display(), last_seq, last_event_id = %last_event_id, "Opened bolt database");

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                options,
                last_seq: Mutex::new(last_seq),
                last_event_id: RwLock::new(last_event_id),
                subscribers: SubscriberList::default(),
                closed: AtomicBool::new(false),
            }),
            path,
        })
    }

    /// `bolt://relative.db` or `bolt:///absolute/path.db`, with
    /// `bucket_name`, `size` and `cleanup_frequency` query parameters
    pub async fn from_url(url: &Url) -> Result<Self, TransportError> {
        let mut options = BoltOptions::default();

        if let Some(bucket_name) = query_param(url, "bucket_name") {
            options.bucket_name = bucket_name;
        }
        if let Some(size) = query_param(url, "size") {
            options.size = size
                .parse()
                .map_err(|_| TransportError::invalid_dsn(url, format!("invalid \"size\" parameter {:?}", size)))?;
        }
        if let Some(frequency) = query_param(url, "cleanup_frequency") {
            options.cleanup_frequency = frequency
                .parse::<f64>()
                .ok()
                .filter(|f| (0.0..=1.0).contains(f))
                .ok_or_else(|| {
                    TransportError::invalid_dsn(url, format!("invalid \"cleanup_frequency\" parameter {:?}", frequency))
                })?;
        }

        let path = match (url.host_str(), url.path()) {
            (Some(host), "") | (Some(host), "/") => host.to_string(),
            (Some(host), path) if !host.is_empty() => format!("{}{}", host, path),
            (_, path) if !path.is_empty() => path.to_string(),
            _ => return Err(TransportError::invalid_dsn(url, "missing path")),
        };

        tokio::task::spawn_blocking(move || Self::open(path, options)).await?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of updates currently retained
    pub fn len(&self) -> Result<u64, TransportError> {
        let inner = &self.inner;
        let txn = inner.db.begin_read().map_err(redb::Error::from)?;
        match txn.open_table(inner.table()) {
            Ok(table) => Ok(table.len().map_err(redb::Error::from)?),
            Err(TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(redb::Error::from(e).into()),
        }
    }

    pub fn is_empty(&self) -> Result<bool, TransportError> {
        Ok(self.len()? == 0)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        self.inner.ensure_open()
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn table(&self) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
        TableDefinition::new(&self.options.bucket_name)
    }

    fn dispatch(&self, update: Arc<Update>, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut last_seq = self.last_seq.lock();
        self.ensure_open()?;
        let seq = *last_seq + 1;

        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        {
            let mut table = txn.open_table(self.table()).map_err(redb::Error::from)?;
            table
                .insert(entry_key(seq, &update.id).as_slice(), payload.as_slice())
                .map_err(redb::Error::from)?;

            // A failed sweep is retried by a later dispatch
            if let Err(e) = self.cleanup(&mut table, seq) {
                tracing::error!(error = %e, "Unable to clean up bolt history");
            }
        }
        txn.commit().map_err(redb::Error::from)?;

        *last_seq = seq;
        *self.last_event_id.write() = update.id.clone();

        fan_out(&self.subscribers, &update);

        Ok(())
    }

    /// Delete entries with a sequence of at most `last_seq - size`
    fn cleanup(&self, table: &mut redb::Table<'_, &'static [u8], &'static [u8]>, last_seq: u64) -> Result<(), redb::Error> {
        let BoltOptions {
            size, cleanup_frequency, ..
        } = self.options;

        if size == 0 || cleanup_frequency == 0.0 || size >= last_seq {
            return Ok(());
        }
        if cleanup_frequency < 1.0 && rand::rng().random::<f64>() >= cleanup_frequency {
            return Ok(());
        }

        let upper = (last_seq - size + 1).to_be_bytes();
        let expired = table
            .range::<&[u8]>(..upper.as_slice())?
            .map(|entry| entry.map(|(k, _)| k.value().to_vec()))
            .collect::<Result<Vec<_>, _>>()?;

        for key in &expired {
            table.remove(key.as_slice())?;
        }

        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "Bolt history cleaned up");
        }

        Ok(())
    }

    /// Register `subscriber`, then replay its history if it asked for one
    fn add_subscriber(&self, subscriber: Arc<Subscriber>) -> Result<(), TransportError> {
        let to_seq = {
            let last_seq = self.last_seq.lock();
            // `close` walks the subscribers under the same lock
            self.ensure_open()?;
            self.subscribers.add(subscriber.clone());
            *last_seq
        };

        if subscriber.request_last_event_id.is_empty() {
            subscriber.ready();
            return Ok(());
        }

        self.dispatch_history(&subscriber, to_seq);
        Ok(())
    }

    fn close(&self) {
        let _last_seq = self.last_seq.lock();
        self.subscribers.walk(0, |s| {
            s.disconnect();
            true
        });
    }

    /// Replay stored updates to `subscriber`, never past `to_seq`
    fn dispatch_history(&self, subscriber: &Subscriber, to_seq: u64) {
        let requested = subscriber.request_last_event_id.as_str();
        let mut response = EARLIEST.to_string();
        let mut found = requested == EARLIEST;

        let result = (|| -> Result<(), TransportError> {
            let txn = self.db.begin_read().map_err(redb::Error::from)?;
            let table = match txn.open_table(self.table()) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(()),
                Err(e) => return Err(redb::Error::from(e).into()),
            };

            for entry in table.iter().map_err(redb::Error::from)? {
                let (key, value) = entry.map_err(redb::Error::from)?;
                let (seq, id) = split_key(key.value());

                if seq > to_seq {
                    break;
                }

                if !found {
                    response = id.to_string();
                    found = id == requested;
                    continue;
                }

                let update: Update = serde_json::from_slice(value.value())?;
                if !subscriber.matches(&update) {
                    continue;
                }
                if !subscriber.dispatch(Arc::new(update), true) {
                    break;
                }
                response = id.to_string();
            }

            Ok(())
        })();

        match result {
            Err(e) => {
                tracing::error!(subscriber_id = %subscriber.id, error = %e, "Unable to replay history from bolt");
            }
            Ok(()) if !found => {
                tracing::info!(
                    subscriber_id = %subscriber.id,
                    last_event_id = %requested,
                    "Requested Last-Event-ID not found in history"
                );
            }
            Ok(()) => {}
        }

        subscriber.history_dispatched(response);
    }
}

#[async_trait]
impl Transport for BoltTransport {
    async fn dispatch(&self, mut update: Update) -> Result<Arc<Update>, TransportError> {
        self.ensure_open()?;

        update.assign_id();
        let payload = serde_json::to_vec(&update)?;
        let update = Arc::new(update);

        let inner = self.inner.clone();
        let dispatched = update.clone();
        tokio::task::spawn_blocking(move || inner.dispatch(dispatched, payload)).await??;

        Ok(update)
    }

    async fn add_subscriber(&self, subscriber: Arc<Subscriber>) -> Result<(), TransportError> {
        self.ensure_open()?;

        // The write lock may be held by a commit in progress
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.add_subscriber(subscriber)).await?
    }

    async fn remove_subscriber(&self, subscriber: &Subscriber) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner.subscribers.remove(subscriber);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.close()).await?;

        Ok(())
    }

    fn as_subscribers(&self) -> Option<&dyn TransportSubscribers> {
        Some(self)
    }
}

impl TransportSubscribers for BoltTransport {
    fn subscribers(&self) -> Result<(String, Vec<Arc<Subscriber>>), TransportError> {
        let last_event_id = self.inner.last_event_id.read().clone();
        Ok((last_event_id, self.inner.subscribers.subscribers()))
    }
}

fn entry_key(seq: u64, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(SEQ_LEN + id.len());
    key.extend_from_slice(&seq.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn split_key(key: &[u8]) -> (u64, &str) {
    let mut seq = [0u8; SEQ_LEN];
    let split = key.len().min(SEQ_LEN);
    seq[..split].copy_from_slice(&key[..split]);

    let id = std::str::from_utf8(&key[split..]).unwrap_or_default();
    (u64::from_be_bytes(seq), id)
}

fn last_entry(db: &Database, bucket_name: &str) -> Result<Option<(u64, String)>, TransportError> {
    let definition: TableDefinition<&[u8], &[u8]> = TableDefinition::new(bucket_name);

    let txn = db.begin_read().map_err(redb::Error::from)?;
    let table = match txn.open_table(definition) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(e) => return Err(redb::Error::from(e).into()),
    };

    let last = table.last().map_err(redb::Error::from)?;
    Ok(last.map(|(key, _)| {
        let (seq, id) = split_key(key.value());
        (seq, id.to_string())
    }))
}

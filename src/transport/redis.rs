//! Redis pub/sub bus shared by several hub instances
//!
//! Dispatch atomically stores the update id under a key and publishes the
//! serialized update on a channel. Every hub instance listens on that channel
//! and fans updates out to its own subscribers through a pool of dispatcher
//! tasks. Each subscriber is pinned to one dispatcher so it sees updates in
//! bus order. There is no history.

use super::{query_param, Transport, TransportError, TransportSubscribers, EARLIEST};
use crate::subscriber::{Subscriber, SubscriberList};
use crate::update::Update;
use ahash::RandomState;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use redis::aio::MultiplexedConnection;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

pub const DEFAULT_CHANNEL: &str = "mercure";
pub const DEFAULT_LAST_EVENT_ID_KEY: &str = "lastEventID";
pub const DEFAULT_DISPATCHER_POOL_SIZE: usize = 4;

const DISPATCHER_QUEUE: usize = 1024;

const PUBLISH_SCRIPT: &str = r"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('PUBLISH', ARGV[2], ARGV[3])
return 1
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisOptions {
    /// Connection URL without the hub specific query parameters
    pub url: String,
    pub channel: String,
    pub last_event_id_key: String,
    pub dispatcher_pool_size: usize,
}

impl RedisOptions {
    pub fn from_url(url: &Url) -> Result<Self, TransportError> {
        let dispatcher_pool_size = match query_param(url, "dispatcher_pool_size") {
            None => DEFAULT_DISPATCHER_POOL_SIZE,
            Some(size) => size.parse().ok().filter(|n| *n > 0).ok_or_else(|| {
                TransportError::invalid_dsn(url, format!("invalid \"dispatcher_pool_size\" parameter {:?}", size))
            })?,
        };

        let mut connection = url.clone();
        connection.set_query(None);

        Ok(Self {
            url: connection.to_string(),
            channel: query_param(url, "channel").unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            last_event_id_key: query_param(url, "last_event_id_key")
                .unwrap_or_else(|| DEFAULT_LAST_EVENT_ID_KEY.to_string()),
            dispatcher_pool_size,
        })
    }
}

struct Inner {
    subscribers: SubscriberList,
    last_event_id: RwLock<String>,
    dispatchers: Vec<mpsc::Sender<(Arc<Subscriber>, Arc<Update>)>>,
    hasher: RandomState,
}

impl Inner {
    /// Route an update received from the bus to the local subscribers
    async fn route(&self, update: Arc<Update>) {
        *self.last_event_id.write() = update.id.clone();

        for subscriber in self.subscribers.match_any(&update) {
            let worker = self.hasher.hash_one(&subscriber.id) as usize % self.dispatchers.len();
            if self.dispatchers[worker].send((subscriber, update.clone())).await.is_err() {
                return;
            }
        }
    }
}

pub struct RedisTransport {
    inner: Arc<Inner>,
    options: RedisOptions,
    connection: MultiplexedConnection,
    script: redis::Script,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    /// Held while registering a subscriber and while closing
    registration: Mutex<()>,
}

impl RedisTransport {
    pub async fn from_url(url: &Url) -> Result<Self, TransportError> {
        Self::connect(RedisOptions::from_url(url)?).await
    }

    pub async fn connect(options: RedisOptions) -> Result<Self, TransportError> {
        let client = redis::Client::open(options.url.as_str())?;
        let mut connection = client.get_multiplexed_async_connection().await?;

        let last_event_id: Option<String> = redis::cmd("GET")
            .arg(&options.last_event_id_key)
            .query_async(&mut connection)
            .await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&options.channel).await?;

        let mut tasks = Vec::with_capacity(options.dispatcher_pool_size + 1);
        let mut dispatchers = Vec::with_capacity(options.dispatcher_pool_size);
        let mut receivers = Vec::with_capacity(options.dispatcher_pool_size);
        for _ in 0..options.dispatcher_pool_size {
            let (tx, rx) = mpsc::channel(DISPATCHER_QUEUE);
            dispatchers.push(tx);
            receivers.push(rx);
        }

        let inner = Arc::new(Inner {
            subscribers: SubscriberList::default(),
            last_event_id: RwLock::new(last_event_id.unwrap_or_else(|| EARLIEST.to_string())),
            dispatchers,
            hasher: RandomState::new(),
        });

        for mut rx in receivers {
            let inner = inner.clone();
            tasks.push(tokio::spawn(async move {
                while let Some((subscriber, update)) = rx.recv().await {
                    if !subscriber.dispatch(update, false) {
                        inner.subscribers.remove(&subscriber);
                    }
                }
            }));
        }

        let listener = inner.clone();
        let channel = options.channel.clone();
        tasks.push(tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let payload: Vec<u8> = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(error = %e, "Unable to read redis message");
                        continue;
                    }
                };

                match serde_json::from_slice::<Update>(&payload) {
                    Ok(update) => listener.route(Arc::new(update)).await,
                    Err(e) => tracing::error!(error = %e, "Unable to decode update from redis"),
                }
            }
            tracing::warn!(channel = %channel, "Redis subscription ended");
        }));

        Ok(Self {
            inner,
            options,
            connection,
            script: redis::Script::new(PUBLISH_SCRIPT),
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
            registration: Mutex::new(()),
        })
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn dispatch(&self, mut update: Update) -> Result<Arc<Update>, TransportError> {
        self.ensure_open()?;

        update.assign_id();
        let payload = serde_json::to_string(&update)?;

        let mut connection = self.connection.clone();
        let _: i64 = self
            .script
            .key(&self.options.last_event_id_key)
            .arg(&update.id)
            .arg(&self.options.channel)
            .arg(payload)
            .invoke_async(&mut connection)
            .await?;

        // Local delivery happens when the update comes back from the bus
        Ok(Arc::new(update))
    }

    async fn add_subscriber(&self, subscriber: Arc<Subscriber>) -> Result<(), TransportError> {
        {
            let _registration = self.registration.lock();
            self.ensure_open()?;
            self.inner.subscribers.add(subscriber.clone());
        }

        if subscriber.request_last_event_id.is_empty() {
            subscriber.ready();
        } else {
            subscriber.history_dispatched(EARLIEST);
        }

        Ok(())
    }

    async fn remove_subscriber(&self, subscriber: &Subscriber) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner.subscribers.remove(subscriber);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let _registration = self.registration.lock();
        self.inner.subscribers.walk(0, |s| {
            s.disconnect();
            true
        });

        Ok(())
    }

    fn as_subscribers(&self) -> Option<&dyn TransportSubscribers> {
        Some(self)
    }
}

impl TransportSubscribers for RedisTransport {
    fn subscribers(&self) -> Result<(String, Vec<Arc<Subscriber>>), TransportError> {
        let last_event_id = self.inner.last_event_id.read().clone();
        Ok((last_event_id, self.inner.subscribers.subscribers()))
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

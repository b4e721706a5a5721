use super::{fan_out, Transport, TransportError, TransportSubscribers, EARLIEST};
use crate::subscriber::{Subscriber, SubscriberList};
use crate::update::Update;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// In-memory broadcast without history
pub struct LocalTransport {
    subscribers: SubscriberList,
    last_event_id: RwLock<String>,
    closed: AtomicBool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            subscribers: SubscriberList::default(),
            last_event_id: RwLock::new(EARLIEST.to_string()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn dispatch(&self, mut update: Update) -> Result<Arc<Update>, TransportError> {
        self.ensure_open()?;

        update.assign_id();
        let update = Arc::new(update);

        // Writers serialize on the id lock so subscribers see one total order
        let mut last_event_id = self.last_event_id.write();
        self.ensure_open()?;
        fan_out(&self.subscribers, &update);
        *last_event_id = update.id.clone();

        Ok(update)
    }

    async fn add_subscriber(&self, subscriber: Arc<Subscriber>) -> Result<(), TransportError> {
        let _guard = self.last_event_id.write();
        // `close` walks the subscribers under the same lock
        self.ensure_open()?;
        self.subscribers.add(subscriber.clone());

        if subscriber.request_last_event_id.is_empty() {
            subscriber.ready();
        } else {
            subscriber.history_dispatched(EARLIEST);
        }

        Ok(())
    }

    async fn remove_subscriber(&self, subscriber: &Subscriber) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.subscribers.remove(subscriber);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _guard = self.last_event_id.write();
        self.subscribers.walk(0, |s| {
            s.disconnect();
            true
        });

        Ok(())
    }

    fn as_subscribers(&self) -> Option<&dyn TransportSubscribers> {
        Some(self)
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportSubscribers for LocalTransport {
    fn subscribers(&self) -> Result<(String, Vec<Arc<Subscriber>>), TransportError> {
        let last_event_id = self.last_event_id.read();
        Ok((last_event_id.clone(), self.subscribers.subscribers()))
    }
}

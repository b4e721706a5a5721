//! Subscriber state: topic filter, outbound buffer and history/live splice
//!
//! A subscriber is created per SSE connection. Updates reach it through
//! [`Subscriber::dispatch`]; live updates arriving while the transport is still
//! replaying history are parked in a live queue and flushed in order once the
//! transport calls [`Subscriber::history_dispatched`] (or [`Subscriber::ready`]).

pub mod bloom;
mod list;

pub use list::SubscriberList;

use crate::auth::Claims;
use crate::topics::TopicSelectorStore;
use crate::update::Update;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Default capacity of a subscriber's outbound buffer
pub const DEFAULT_OUT_BUFFER: usize = 1000;

/// JSON-LD context of subscription documents
pub const JSONLD_CONTEXT: &str = "https://mercure.rocks/";

/// Path prefix of subscription resources
pub const SUBSCRIPTIONS_PATH: &str = "/.well-known/mercure/subscriptions";

/// One topic selector of one subscriber, as exposed by the subscriptions API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub subscriber: String,
    pub topic: String,
    pub active: bool,
    #[serde(rename = "lastEventID", default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

struct Outbound {
    live_queue: Vec<Arc<Update>>,
    out: Option<mpsc::Sender<Arc<Update>>>,
}

/// A client connected to the hub
pub struct Subscriber {
    pub id: String,
    /// `id`, query-escaped for use in subscription IRIs
    pub escaped_id: String,
    /// Empty when the client asked for live updates only
    pub request_last_event_id: String,
    pub remote_addr: Option<String>,
    pub claims: Option<Claims>,

    subscribed: Vec<String>,
    allowed_private: Vec<String>,
    escaped_topics: Vec<String>,
    store: Arc<TopicSelectorStore>,

    disconnected: AtomicBool,
    ready: AtomicBool,
    outbound: Mutex<Outbound>,

    response_tx: Mutex<Option<oneshot::Sender<String>>>,
    response_rx: Mutex<Option<oneshot::Receiver<String>>>,
}

impl Subscriber {
    /// Create a subscriber feeding `out`.
    ///
    /// The caller keeps the receiving half and drains it in the connection loop.
    pub fn new(
        request_last_event_id: impl Into<String>,
        store: Arc<TopicSelectorStore>,
        out: mpsc::Sender<Arc<Update>>,
    ) -> Self {
        let id = crate::update::generate_id();
        let escaped_id = query_escape(&id);
        let (response_tx, response_rx) = oneshot::channel();

        Self {
            id,
            escaped_id,
            request_last_event_id: request_last_event_id.into(),
            remote_addr: None,
            claims: None,
            subscribed: Vec::new(),
            allowed_private: Vec::new(),
            escaped_topics: Vec::new(),
            store,
            disconnected: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            outbound: Mutex::new(Outbound {
                live_queue: Vec::new(),
                out: Some(out),
            }),
            response_tx: Mutex::new(Some(response_tx)),
            response_rx: Mutex::new(Some(response_rx)),
        }
    }

    /// Set the topics the subscriber wants and the selectors it may receive privately
    pub fn set_topics(&mut self, subscribed: Vec<String>, allowed_private: Vec<String>) {
        self.escaped_topics = subscribed.iter().map(|t| query_escape(t)).collect();
        self.subscribed = subscribed;
        self.allowed_private = allowed_private;
    }

    pub fn subscribed_topics(&self) -> &[String] {
        &self.subscribed
    }

    pub fn allowed_private_topics(&self) -> &[String] {
        &self.allowed_private
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Hand an update to the subscriber.
    ///
    /// Returns `false` once the subscriber is disconnected, including when this
    /// call evicts it because its outbound buffer is full.
    pub fn dispatch(&self, update: Arc<Update>, from_history: bool) -> bool {
        if self.is_disconnected() {
            return false;
        }

        let mut outbound = self.outbound.lock();
        if self.is_disconnected() {
            return false;
        }

        if !from_history && !self.is_ready() {
            outbound.live_queue.push(update);
            return true;
        }

        self.push(&mut outbound, update)
    }

    /// Flip to live mode, flushing queued live updates in order.
    ///
    /// Returns the number of updates flushed; later calls are no-ops.
    pub fn ready(&self) -> usize {
        let mut outbound = self.outbound.lock();
        if self.is_ready() {
            return 0;
        }

        let queued = std::mem::take(&mut outbound.live_queue);
        let mut flushed = 0;
        for update in queued {
            if !self.push(&mut outbound, update) {
                break;
            }
            flushed += 1;
        }

        self.ready.store(true, Ordering::Release);
        flushed
    }

    /// Signal the end of history replay, then switch to live mode.
    ///
    /// Only the first call delivers `response_last_event_id`.
    pub fn history_dispatched(&self, response_last_event_id: impl Into<String>) {
        if let Some(tx) = self.response_tx.lock().take() {
            let _ = tx.send(response_last_event_id.into());
        }
        self.ready();
    }

    /// Wait for the transport to finish replaying history.
    ///
    /// Resolves to `None` if the subscriber is disconnected first or the value
    /// was already consumed.
    pub async fn response_last_event_id(&self) -> Option<String> {
        let rx = self.response_rx.lock().take()?;
        rx.await.ok()
    }

    /// Close the outbound channel. Idempotent.
    pub fn disconnect(&self) {
        let mut outbound = self.outbound.lock();
        self.disconnected.store(true, Ordering::Release);

        // Dropping the only sender closes the channel; later calls find `None`
        outbound.out = None;
        outbound.live_queue.clear();
        drop(outbound);

        // Wake anyone waiting for the end of history
        self.response_tx.lock().take();
    }

    fn push(&self, outbound: &mut Outbound, update: Arc<Update>) -> bool {
        let Some(out) = &outbound.out else {
            return false;
        };

        match out.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.disconnected.store(true, Ordering::Release);
                outbound.out = None;
                outbound.live_queue.clear();

                tracing::error!(
                    subscriber_id = %self.id,
                    remote_addr = ?self.remote_addr,
                    "Subscriber unable to receive updates fast enough"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.disconnected.store(true, Ordering::Release);
                outbound.out = None;
                false
            }
        }
    }

    /// Check if the subscriber admits `topics` with the given privacy
    pub fn matches_topics(&self, topics: &[String], private: bool) -> bool {
        let subscribed = self.store.matches_any(topics, &self.subscribed);
        if !subscribed {
            return false;
        }

        !private || self.store.matches_any(topics, &self.allowed_private)
    }

    pub fn matches(&self, update: &Update) -> bool {
        self.matches_topics(&update.topics, update.private)
    }

    /// Subscriptions of this subscriber, optionally restricted to one topic selector
    pub fn subscriptions(&self, topic: Option<&str>, with_context: bool, active: bool) -> Vec<Subscription> {
        let payload = self
            .claims
            .as_ref()
            .and_then(|c| c.mercure.as_ref())
            .and_then(|m| m.payload.clone());

        self.subscribed
            .iter()
            .zip(&self.escaped_topics)
            .filter(|(t, _)| topic.map_or(true, |filter| *t == filter))
            .map(|(t, escaped)| Subscription {
                context: with_context.then(|| JSONLD_CONTEXT.to_string()),
                id: format!("{}/{}/{}", SUBSCRIPTIONS_PATH, escaped, self.escaped_id),
                kind: "Subscription".to_string(),
                subscriber: self.id.clone(),
                topic: t.clone(),
                active,
                last_event_id: None,
                payload: payload.clone(),
            })
            .collect()
    }
}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("request_last_event_id", &self.request_last_event_id)
            .field("remote_addr", &self.remote_addr)
            .field("topics", &self.subscribed)
            .field("topic_selectors", &self.allowed_private)
            .field("ready", &self.is_ready())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

/// `application/x-www-form-urlencoded` escaping, as used in subscription IRIs
pub fn query_escape(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Inverse of [`query_escape`]
pub fn query_unescape(s: &str) -> String {
    // Escaped input has no raw `=` or `&`, so it parses as a single key
    url::form_urlencoded::parse(s.as_bytes())
        .next()
        .map(|(k, _)| k.into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MercureClaim;

    fn subscriber(capacity: usize, last_event_id: &str) -> (Subscriber, mpsc::Receiver<Arc<Update>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let mut s = Subscriber::new(last_event_id, Arc::new(TopicSelectorStore::default()), tx);
        s.set_topics(vec!["https://example.com/{id}".into()], vec!["https://example.com/1".into()]);
        (s, rx)
    }

    fn update(id: &str) -> Arc<Update> {
        Arc::new(Update::new(vec!["https://example.com/1".into()], id).with_id(id))
    }

    #[test]
    fn test_id_is_urn_uuid() {
        let (s, _rx) = subscriber(1, "");
        assert!(s.id.starts_with("urn:uuid:"));
        assert!(s.escaped_id.starts_with("urn%3Auuid%3A"));
        assert_eq!(query_unescape(&s.escaped_id), s.id);
    }

    #[test]
    fn test_query_unescape() {
        for topic in ["https://example.com/books/{id}", "a b+c", "x&y=z", ""] {
            assert_eq!(query_unescape(&query_escape(topic)), topic);
        }
    }

    #[test]
    fn test_live_updates_wait_for_ready() {
        let (s, mut rx) = subscriber(10, "");

        assert!(s.dispatch(update("a"), false));
        assert!(rx.try_recv().is_err());

        assert_eq!(s.ready(), 1);
        assert_eq!(rx.try_recv().unwrap().id, "a");

        assert!(s.dispatch(update("b"), false));
        assert_eq!(rx.try_recv().unwrap().id, "b");

        // Idempotent
        assert_eq!(s.ready(), 0);
    }

    #[test]
    fn test_history_before_live() {
        let (s, mut rx) = subscriber(10, "earliest");

        assert!(s.dispatch(update("h1"), true));
        assert!(s.dispatch(update("live"), false));
        assert!(s.dispatch(update("h2"), true));
        s.history_dispatched("h2");

        let ids: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|u| u.id.clone()).collect();
        assert_eq!(ids, vec!["h1", "h2", "live"]);
    }

    #[tokio::test]
    async fn test_history_dispatched_once() {
        let (s, _rx) = subscriber(10, "x");

        s.history_dispatched("first");
        s.history_dispatched("second");

        assert_eq!(s.response_last_event_id().await.as_deref(), Some("first"));
        assert_eq!(s.response_last_event_id().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_wakes_history_waiter() {
        let (s, _rx) = subscriber(10, "x");
        s.disconnect();
        assert_eq!(s.response_last_event_id().await, None);
    }

    #[test]
    fn test_full_buffer_evicts() {
        let (s, mut rx) = subscriber(1, "");
        s.ready();

        assert!(s.dispatch(update("a"), false));
        assert!(!s.dispatch(update("b"), false));
        assert!(s.is_disconnected());
        assert!(!s.dispatch(update("c"), false));

        assert_eq!(rx.try_recv().unwrap().id, "a");
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (s, mut rx) = subscriber(10, "");
        s.ready();
        assert!(s.dispatch(update("a"), false));

        s.disconnect();
        s.disconnect();
        s.disconnect();

        assert!(!s.dispatch(update("b"), false));
        assert_eq!(rx.try_recv().unwrap().id, "a");
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn test_matches() {
        let (s, _rx) = subscriber(1, "");

        let public = Update::new(vec!["https://example.com/2".into()], "");
        assert!(s.matches(&public));

        let private_allowed = Update::new(vec!["https://example.com/1".into()], "").private();
        assert!(s.matches(&private_allowed));

        let private_denied = Update::new(vec!["https://example.com/2".into()], "").private();
        assert!(!s.matches(&private_denied));

        // Alternate topic grants private access
        let alternate = Update::new(
            vec!["https://example.com/2".into(), "https://example.com/1".into()],
            "",
        )
        .private();
        assert!(s.matches(&alternate));

        let other = Update::new(vec!["https://other.com/1".into()], "");
        assert!(!s.matches(&other));
    }

    #[test]
    fn test_subscriptions() {
        let (tx, _rx) = mpsc::channel(1);
        let mut s = Subscriber::new("", Arc::new(TopicSelectorStore::default()), tx);
        s.set_topics(vec!["https://example.com/a".into(), "*".into()], vec![]);
        s.claims = Some(Claims {
            mercure: Some(MercureClaim {
                payload: Some(serde_json::json!({"user": "kevin"})),
                ..Default::default()
            }),
            ..Default::default()
        });

        let all = s.subscriptions(None, true, true);
        assert_eq!(all.len(), 2);
        assert_eq!(
            all[0].id,
            format!(
                "/.well-known/mercure/subscriptions/https%3A%2F%2Fexample.com%2Fa/{}",
                s.escaped_id
            )
        );
        assert_eq!(all[0].context.as_deref(), Some(JSONLD_CONTEXT));
        assert_eq!(all[0].payload, Some(serde_json::json!({"user": "kevin"})));
        assert_eq!(all[1].topic, "*");

        let filtered = s.subscriptions(Some("*"), false, false);
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].context.is_none());
        assert!(!filtered[0].active);
    }
}

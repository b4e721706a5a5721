//! The Mercure hub: HTTP handlers wired to a transport
//!
//! Publishers POST form-encoded updates to [`HUB_PATH`]; subscribers GET the
//! same path with one or more `topic` selectors and receive a server-sent
//! event stream. When enabled, the subscriptions API lists who is connected.

mod config;
mod publish;
mod router;
mod stream;
mod subscribe;
mod subscriptions;

pub use config::{
    HubConfig, HubError, DEFAULT_DISPATCH_TIMEOUT, DEFAULT_HEARTBEAT, DEFAULT_WRITE_TIMEOUT, PROTOCOL_V7,
};

use crate::auth::{self, AuthError, Claims, Keyfunc};
use crate::subscriber::Subscriber;
use crate::topics::TopicSelectorStore;
use crate::transport::{Transport, TransportError};
use crate::update::Update;
use axum::extract::ConnectInfo;
use axum::http::{Extensions, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;

/// Path of the hub endpoint
pub const HUB_PATH: &str = "/.well-known/mercure";

struct Inner {
    config: HubConfig,
    transport: Arc<dyn Transport>,
    store: Arc<TopicSelectorStore>,
    publisher_keyfunc: Option<Arc<dyn Keyfunc>>,
    subscriber_keyfunc: Option<Arc<dyn Keyfunc>>,
}

/// A hub instance, cheap to clone
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Hub {
    pub fn new(config: HubConfig, transport: Arc<dyn Transport>) -> Result<Self, HubError> {
        config.validate()?;

        let publisher_keyfunc = config.publisher_jwt.as_ref().map(|k| k.keyfunc()).transpose()?;
        let subscriber_keyfunc = config.subscriber_jwt.as_ref().map(|k| k.keyfunc()).transpose()?;
        let store = Arc::new(TopicSelectorStore::new(
            config.cache_max_entries_per_shard,
            config.cache_shard_count,
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                store,
                publisher_keyfunc,
                subscriber_keyfunc,
            }),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn topic_selector_store(&self) -> &Arc<TopicSelectorStore> {
        &self.inner.store
    }

    /// Broadcast an update to the subscribers. The transport assigns its id if empty.
    pub async fn publish(&self, update: Update) -> Result<Arc<Update>, TransportError> {
        let update = self.inner.transport.dispatch(update).await?;
        tracing::debug!(update_id = %update.id, topics = ?update.topics, "Update published");
        Ok(update)
    }

    /// The axum router serving the hub
    pub fn router(&self) -> Router {
        router::build(self.clone())
    }

    /// Close the transport, disconnecting every subscriber
    pub async fn stop(&self) -> Result<(), TransportError> {
        self.inner.transport.close().await
    }

    async fn authorize_publisher(
        &self,
        method: &Method,
        headers: &HeaderMap,
        query: &[(String, String)],
    ) -> Option<Result<Option<Claims>, AuthError>> {
        let keyfunc = self.inner.publisher_keyfunc.as_ref()?;
        Some(self.authorize(keyfunc.as_ref(), method, headers, query).await)
    }

    async fn authorize_subscriber(
        &self,
        method: &Method,
        headers: &HeaderMap,
        query: &[(String, String)],
    ) -> Option<Result<Option<Claims>, AuthError>> {
        let keyfunc = self.inner.subscriber_keyfunc.as_ref()?;
        Some(self.authorize(keyfunc.as_ref(), method, headers, query).await)
    }

    async fn authorize(
        &self,
        keyfunc: &dyn Keyfunc,
        method: &Method,
        headers: &HeaderMap,
        query: &[(String, String)],
    ) -> Result<Option<Claims>, AuthError> {
        let config = &self.inner.config;
        auth::authorize(method, headers, query, &config.cookie_name, &config.publish_origins, keyfunc).await
    }

    /// Dispatch one private update per subscribed topic describing the subscription state
    async fn dispatch_subscription_updates(&self, subscriber: &Subscriber, active: bool) {
        if !self.inner.config.subscriptions {
            return;
        }

        for subscription in subscriber.subscriptions(None, true, active) {
            let data = match serde_json::to_string_pretty(&subscription) {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!(subscription = %subscription.id, error = %e, "Unable to encode subscription");
                    continue;
                }
            };

            let update = Update::new(vec![subscription.id.clone()], data).private();
            if let Err(e) = self.inner.transport.dispatch(update).await {
                tracing::error!(subscription = %subscription.id, error = %e, "Failed to dispatch subscription update");
            }
        }
    }

    /// Release a subscriber whose connection ended
    async fn shutdown(&self, subscriber: &Subscriber) {
        subscriber.disconnect();

        match self.inner.transport.remove_subscriber(subscriber).await {
            Ok(()) | Err(TransportError::Closed) => {}
            Err(e) => {
                tracing::error!(subscriber_id = %subscriber.id, error = %e, "Failed to remove subscriber on shutdown");
            }
        }

        self.dispatch_subscription_updates(subscriber, false).await;
        tracing::info!(subscriber_id = %subscriber.id, remote_addr = ?subscriber.remote_addr, "Subscriber disconnected");
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub").field("config", &self.inner.config).finish()
    }
}

/// Decoded `application/x-www-form-urlencoded` pairs
pub(crate) fn form_pairs(input: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(input).into_owned().collect()
}

/// All values of `name`, in order
pub(crate) fn values<'a>(pairs: &'a [(String, String)], name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    pairs.iter().filter(move |(k, _)| k == name).map(|(_, v)| v.as_str())
}

/// First non-empty value of `name`
pub(crate) fn first_value<'a>(pairs: &'a [(String, String)], name: &'a str) -> Option<&'a str> {
    values(pairs, name).next().filter(|v| !v.is_empty())
}

/// Peer address recorded by `into_make_service_with_connect_info`
pub(crate) fn remote_addr(extensions: &Extensions) -> Option<String> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
}

pub(crate) fn unauthorized(remote_addr: Option<&str>, error: Option<&AuthError>) -> Response {
    match error {
        Some(e) => tracing::info!(remote_addr = ?remote_addr, error = %e, "Unauthorized request"),
        None => tracing::info!(remote_addr = ?remote_addr, "Unauthorized request"),
    }
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;

    #[test]
    fn test_form_pairs() {
        let pairs = form_pairs(b"topic=https%3A%2F%2Fexample.com%2F1&topic=b&data=hello+world&private=on");
        assert_eq!(values(&pairs, "topic").collect::<Vec<_>>(), vec!["https://example.com/1", "b"]);
        assert_eq!(first_value(&pairs, "data"), Some("hello world"));
        assert_eq!(first_value(&pairs, "id"), None);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_unauthorized_logs_remote_addr_at_info() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .finish();

        let response = tracing::subscriber::with_default(subscriber, || {
            unauthorized(Some("192.0.2.1:4242"), Some(&AuthError::InvalidAuthorizationHeader))
        });
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("INFO"), "{}", output);
        assert!(output.contains("192.0.2.1:4242"), "{}", output);
        assert!(output.contains("Unauthorized request"), "{}", output);
    }

    #[test]
    fn test_remote_addr() {
        let mut extensions = Extensions::new();
        assert_eq!(remote_addr(&extensions), None);

        extensions.insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4242))));
        assert_eq!(remote_addr(&extensions).as_deref(), Some("192.0.2.1:4242"));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = HubConfig {
            cors_origins: vec!["not an origin".into()],
            ..Default::default()
        };
        assert!(Hub::new(config, Arc::new(LocalTransport::new())).is_err());
    }

    #[tokio::test]
    async fn test_publish_and_stop() {
        let hub = Hub::new(HubConfig::default(), Arc::new(LocalTransport::new())).unwrap();

        let update = hub.publish(Update::new(vec!["t".into()], "x")).await.unwrap();
        assert!(update.id.starts_with("urn:uuid:"));

        hub.stop().await.unwrap();
        assert!(matches!(
            hub.publish(Update::new(vec!["t".into()], "x")).await,
            Err(TransportError::Closed)
        ));
    }
}

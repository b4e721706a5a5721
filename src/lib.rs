//! Mercure - real-time updates pushed to HTTP clients over server-sent events
//!
//! Publishers POST updates to the hub; subscribers open an event stream
//! filtered by URI template topic selectors. Updates can be persisted by the
//! transport so reconnecting clients resume from their last event id.

pub mod auth;
pub mod hub;
pub mod subscriber;
pub mod topics;
pub mod transport;
pub mod update;

pub use hub::{Hub, HubConfig, HubError};
pub use subscriber::{Subscriber, SubscriberList, Subscription};
pub use topics::TopicSelectorStore;
pub use transport::{Transport, TransportError, TransportSubscribers};
pub use update::Update;

//! Publish and receive checks over topic selectors

use crate::topics::{TopicSelectorStore, WILDCARD_SELECTOR};

/// True when some topic matches some selector
pub fn can_receive(store: &TopicSelectorStore, topics: &[String], selectors: &[String]) -> bool {
    store.matches_any(topics, selectors)
}

/// True when every topic matches at least one selector, or `*` is granted
pub fn can_dispatch(store: &TopicSelectorStore, topics: &[String], selectors: &[String]) -> bool {
    if selectors.iter().any(|s| s == WILDCARD_SELECTOR) {
        return true;
    }

    topics
        .iter()
        .all(|topic| selectors.iter().any(|selector| store.matches(topic, selector)))
}

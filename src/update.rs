//! Updates and their server-sent event framing

use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use uuid::Uuid;

/// Reserved Last-Event-ID asking for every update the transport retains
pub const EARLIEST_LAST_EVENT_ID: &str = "earliest";

/// A message published to one or more topics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Globally unique identifier, assigned by the transport when empty
    #[serde(default)]
    pub id: String,

    /// SSE `event:` field
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    #[serde(default)]
    pub data: String,

    /// SSE reconnection time, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,

    /// The first topic is canonical, the others are alternates
    pub topics: Vec<String>,

    /// Only delivered to subscribers authorized for one of the topics
    #[serde(default)]
    pub private: bool,
}

impl Update {
    pub fn new(topics: Vec<String>, data: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            event_type: None,
            data: data.into(),
            retry: None,
            topics,
            private: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    /// Give the update a `urn:uuid:<v7>` identifier unless it already has one
    pub fn assign_id(&mut self) {
        if self.id.is_empty() {
            self.id = generate_id();
        }
    }

    /// Serialize the update as a `text/event-stream` event
    pub fn to_event(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + self.id.len() + 16);

        if let Some(event_type) = self.event_type.as_deref().filter(|t| !t.is_empty()) {
            let _ = writeln!(out, "event: {}", event_type);
        }
        if let Some(retry) = self.retry.filter(|r| *r != 0) {
            let _ = writeln!(out, "retry: {}", retry);
        }
        let _ = writeln!(out, "id: {}", self.id);

        for line in split_lines(&self.data) {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');

        out
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.topics.join(", "))?;
        if self.private {
            write!(f, " (private)")?;
        }
        Ok(())
    }
}

/// New `urn:uuid:` identifier, time ordered
pub fn generate_id() -> String {
    format!("urn:uuid:{}", Uuid::now_v7())
}

/// Split on `\r\n`, `\r` and `\n`; always yields at least one line
fn split_lines(data: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(data);

    std::iter::from_fn(move || {
        let current = rest?;
        match current.find(['\r', '\n']) {
            Some(i) => {
                let skip = if current[i..].starts_with("\r\n") { 2 } else { 1 };
                rest = Some(&current[i + skip..]);
                Some(&current[..i])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

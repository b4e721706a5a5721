//! Hub configuration

use crate::auth::{AuthError, JwtKey, DEFAULT_COOKIE_NAME};
use crate::subscriber::DEFAULT_OUT_BUFFER;
use crate::topics::{DEFAULT_MAX_ENTRIES_PER_SHARD, DEFAULT_SHARD_COUNT};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(40);

/// Only protocol version older than the current one still supported
pub const PROTOCOL_V7: u8 = 7;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid {option} origin {origin:?}: expected \"*\", \"null\" or scheme://host[:port]")]
    InvalidOrigin { option: &'static str, origin: String },

    #[error("compatibility mode only supports protocol version 7, got {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("subscriber buffer size must be greater than 0")]
    InvalidSubscriberBuffer,

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Key verifying publisher tokens; when unset, anyone can publish
    pub publisher_jwt: Option<JwtKey>,
    /// Key verifying subscriber tokens; when unset, only public updates are delivered
    pub subscriber_jwt: Option<JwtKey>,
    /// Allow subscribers without a token
    pub anonymous: bool,
    /// Expose the subscriptions API and dispatch subscription events
    pub subscriptions: bool,
    /// Origins allowed to publish with cookie authorization
    pub publish_origins: Vec<String>,
    pub cors_origins: Vec<String>,
    pub cookie_name: String,
    /// Maximum lifetime of a subscriber connection; zero disables it
    pub write_timeout: Duration,
    /// Maximum duration of one write to a subscriber; zero disables it
    pub dispatch_timeout: Duration,
    /// Idle time before sending an SSE comment; zero disables heartbeats
    pub heartbeat: Duration,
    /// Outbound buffer of each subscriber
    pub subscriber_buffer: usize,
    pub cache_max_entries_per_shard: usize,
    pub cache_shard_count: usize,
    /// Accept deprecated behaviors of this older protocol version
    pub protocol_version_compatibility: Option<u8>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            publisher_jwt: None,
            subscriber_jwt: None,
            anonymous: false,
            subscriptions: false,
            publish_origins: Vec::new(),
            cors_origins: Vec::new(),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            heartbeat: DEFAULT_HEARTBEAT,
            subscriber_buffer: DEFAULT_OUT_BUFFER,
            cache_max_entries_per_shard: DEFAULT_MAX_ENTRIES_PER_SHARD,
            cache_shard_count: DEFAULT_SHARD_COUNT,
            protocol_version_compatibility: None,
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), HubError> {
        for origin in &self.publish_origins {
            check_origin("publish", origin)?;
        }
        for origin in &self.cors_origins {
            check_origin("CORS", origin)?;
        }

        if let Some(version) = self.protocol_version_compatibility {
            if version != PROTOCOL_V7 {
                return Err(HubError::UnsupportedProtocolVersion(version));
            }
        }

        if self.subscriber_buffer == 0 {
            return Err(HubError::InvalidSubscriberBuffer);
        }

        Ok(())
    }

    pub fn is_backward_compatible_with(&self, version: u8) -> bool {
        self.protocol_version_compatibility.is_some_and(|v| v <= version)
    }
}

fn check_origin(option: &'static str, origin: &str) -> Result<(), HubError> {
    if origin == "*" || origin == "null" {
        return Ok(());
    }

    let valid = Url::parse(origin)
        .ok()
        .filter(|u| u.host().is_some())
        .is_some_and(|u| u.origin().ascii_serialization() == origin);

    if !valid {
        return Err(HubError::InvalidOrigin {
            option,
            origin: origin.to_string(),
        });
    }

    Ok(())
}

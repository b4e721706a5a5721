//! Mercure JWT claims

use serde::{Deserialize, Serialize};

/// Namespaced claim key taking precedence over `mercure`
pub const NAMESPACED_CLAIM: &str = "https://mercure.rocks/";

/// Topic selectors and payload granted by a token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MercureClaim {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<Vec<String>>,

    /// Opaque, exposed in the subscriptions API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mercure: Option<MercureClaim>,

    #[serde(rename = "https://mercure.rocks/", default, skip_serializing_if = "Option::is_none")]
    pub mercure_namespaced: Option<MercureClaim>,

    /// Expiration, seconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

impl Claims {
    /// Fold the namespaced claim into `mercure`
    pub fn normalize(mut self) -> Self {
        if let Some(namespaced) = self.mercure_namespaced.take() {
            self.mercure = Some(namespaced);
        }
        self
    }

    pub fn publish(&self) -> Option<&[String]> {
        self.mercure.as_ref()?.publish.as_deref()
    }

    pub fn subscribe(&self) -> Option<&[String]> {
        self.mercure.as_ref()?.subscribe.as_deref()
    }
}

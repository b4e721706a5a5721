//! Subscriptions API: JSON-LD documents describing the connected subscribers

use super::{form_pairs, remote_addr, unauthorized, Hub};
use crate::auth::can_receive;
use crate::subscriber::{query_unescape, Subscriber, Subscription, JSONLD_CONTEXT, SUBSCRIPTIONS_PATH};
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct SubscriptionCollection {
    #[serde(rename = "@context")]
    context: &'static str,
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "lastEventID")]
    last_event_id: String,
    subscriptions: Vec<Subscription>,
}

/// `GET /.well-known/mercure/subscriptions[/{topic}]`
pub(super) async fn collection(State(hub): State<Hub>, request: Request) -> Response {
    let (parts, _) = request.into_parts();
    let (last_event_id, subscribers) = match init(&hub, &parts).await {
        Ok(state) => state,
        Err(response) => return response,
    };

    let topic = path_segments(&parts).into_iter().next();
    let subscriptions = subscribers
        .iter()
        .flat_map(|s| s.subscriptions(topic.as_deref(), false, true))
        .collect();

    let document = SubscriptionCollection {
        context: JSONLD_CONTEXT,
        id: request_uri(&parts),
        kind: "Subscriptions",
        last_event_id: last_event_id.clone(),
        subscriptions,
    };

    json_ld(&document, &last_event_id)
}

/// `GET /.well-known/mercure/subscriptions/{topic}/{subscriber}`
pub(super) async fn subscription(State(hub): State<Hub>, request: Request) -> Response {
    let (parts, _) = request.into_parts();
    let (last_event_id, subscribers) = match init(&hub, &parts).await {
        Ok(state) => state,
        Err(response) => return response,
    };

    let [topic, subscriber_id] = <[String; 2]>::try_from(path_segments(&parts)).unwrap_or_default();

    let found = subscribers
        .iter()
        .filter(|s| s.id == subscriber_id)
        .flat_map(|s| s.subscriptions(Some(&topic), true, true))
        .next();

    match found {
        Some(mut subscription) => {
            subscription.last_event_id = Some(last_event_id.clone());
            json_ld(&subscription, &last_event_id)
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Authorize the request against its own URL and snapshot the transport
async fn init(hub: &Hub, parts: &Parts) -> Result<(String, Vec<Arc<Subscriber>>), Response> {
    let current = request_uri(parts);
    let query = form_pairs(parts.uri.query().unwrap_or_default().as_bytes());

    match hub.authorize_subscriber(&parts.method, &parts.headers, &query).await {
        None => {}
        Some(Ok(Some(claims)))
            if claims
                .subscribe()
                .is_some_and(|s| can_receive(hub.topic_selector_store(), &[current.clone()], s)) => {}
        Some(Ok(_)) => return Err(unauthorized(remote_addr(&parts.extensions).as_deref(), None)),
        Some(Err(e)) => return Err(unauthorized(remote_addr(&parts.extensions).as_deref(), Some(&e))),
    }

    let Some(transport) = hub.transport().as_subscribers() else {
        tracing::error!("The transport does not expose its subscribers");
        return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
    };

    let (last_event_id, subscribers) = transport.subscribers().map_err(|e| {
        tracing::error!(error = %e, "Error retrieving subscribers");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })?;

    let not_modified = parts
        .headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().trim_matches('"') == last_event_id);
    if not_modified {
        return Err(StatusCode::NOT_MODIFIED.into_response());
    }

    Ok((last_event_id, subscribers))
}

/// Unescaped `{topic}` and `{subscriber}` segments following the subscriptions path
fn path_segments(parts: &Parts) -> Vec<String> {
    parts
        .uri
        .path()
        .strip_prefix(SUBSCRIPTIONS_PATH)
        .unwrap_or_default()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(query_unescape)
        .collect()
}

fn request_uri(parts: &Parts) -> String {
    parts
        .uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string())
}

fn json_ld<T: Serialize>(document: &T, last_event_id: &str) -> Response {
    let body = match serde_json::to_string_pretty(document) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "Unable to encode subscriptions");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/ld+json"));
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", last_event_id)) {
        headers.insert(header::ETAG, etag);
    }

    response
}

use super::{first_value, form_pairs, remote_addr, stream, unauthorized, values, Hub, PROTOCOL_V7};
use crate::subscriber::Subscriber;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tokio::sync::mpsc;

pub(super) const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

/// `GET` on the hub: register a subscriber and stream its updates
pub(super) async fn subscribe(State(hub): State<Hub>, request: Request) -> Response {
    let (parts, _) = request.into_parts();
    let query = form_pairs(parts.uri.query().unwrap_or_default().as_bytes());

    let (tx, rx) = mpsc::channel(hub.config().subscriber_buffer);
    let mut subscriber = Subscriber::new(
        last_event_id(&hub, &parts.headers, &query),
        hub.topic_selector_store().clone(),
        tx,
    );
    subscriber.remote_addr = remote_addr(&parts.extensions);

    let mut private_topics = Vec::new();
    match hub.authorize_subscriber(&parts.method, &parts.headers, &query).await {
        None => {}
        Some(Ok(Some(claims))) => {
            private_topics = claims.subscribe().map(<[String]>::to_vec).unwrap_or_default();
            subscriber.claims = Some(claims);
        }
        Some(Ok(None)) if hub.config().anonymous => {}
        Some(Ok(None)) => return unauthorized(subscriber.remote_addr.as_deref(), None),
        Some(Err(e)) => return unauthorized(subscriber.remote_addr.as_deref(), Some(&e)),
    }

    let topics: Vec<String> = values(&query, "topic").map(str::to_string).collect();
    if topics.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing \"topic\" parameter.").into_response();
    }

    subscriber.set_topics(topics, private_topics);
    let subscriber = Arc::new(subscriber);

    hub.dispatch_subscription_updates(&subscriber, true).await;

    if let Err(e) = hub.transport().add_subscriber(subscriber.clone()).await {
        subscriber.disconnect();
        hub.dispatch_subscription_updates(&subscriber, false).await;
        tracing::error!(subscriber_id = %subscriber.id, error = %e, "Unable to add subscriber");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let headers = sse_headers(&subscriber).await;

    match subscriber.claims.as_ref().and_then(|c| c.mercure.as_ref()) {
        Some(claim) => tracing::info!(
            subscriber_id = %subscriber.id,
            remote_addr = ?subscriber.remote_addr,
            payload = ?claim.payload,
            "New subscriber"
        ),
        None => tracing::info!(subscriber_id = %subscriber.id, remote_addr = ?subscriber.remote_addr, "New subscriber"),
    }

    let body = stream::spawn(hub, subscriber, rx);
    (StatusCode::OK, headers, body).into_response()
}

/// The header wins over the `lastEventID` query parameter, then the legacy `Last-Event-ID` one
fn last_event_id(hub: &Hub, headers: &HeaderMap, query: &[(String, String)]) -> String {
    if let Some(id) = headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return id.to_string();
    }

    if let Some(id) = first_value(query, "lastEventID") {
        return id.to_string();
    }

    let Some(legacy) = first_value(query, "Last-Event-ID") else {
        return String::new();
    };
    if hub.config().is_backward_compatible_with(PROTOCOL_V7) {
        tracing::info!("Deprecated: the \"Last-Event-ID\" query parameter is deprecated, use \"lastEventID\" instead");
    }

    legacy.to_string()
}

/// Event stream headers, including the Last-Event-ID the replay ended on
async fn sse_headers(subscriber: &Subscriber) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, no-cache, no-store, must-revalidate, max-age=0"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(HeaderName::from_static("expire"), HeaderValue::from_static("0"));
    headers.insert(HeaderName::from_static("x-accel-buffering"), HeaderValue::from_static("no"));

    if !subscriber.request_last_event_id.is_empty() {
        let response = subscriber.response_last_event_id().await;
        if let Some(value) = response.and_then(|id| HeaderValue::from_str(&id).ok()) {
            headers.insert(LAST_EVENT_ID, value);
        }
    }

    headers
}

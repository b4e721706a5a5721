use super::{first_value, form_pairs, remote_addr, unauthorized, values, Hub, PROTOCOL_V7};
use crate::auth::can_dispatch;
use crate::update::Update;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Extensions, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

/// `POST` on the hub: validate and broadcast one update, answer with its id
pub(super) async fn publish(
    State(hub): State<Hub>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Response {
    let remote_addr = remote_addr(&extensions);
    let query = form_pairs(uri.query().unwrap_or_default().as_bytes());

    let claims = match hub.authorize_publisher(&method, &headers, &query).await {
        None => None,
        Some(Ok(Some(claims))) if claims.publish().is_some() => Some(claims),
        Some(Ok(_)) => return unauthorized(remote_addr.as_deref(), None),
        Some(Err(e)) => return unauthorized(remote_addr.as_deref(), Some(&e)),
    };

    let form = form_pairs(&body);

    let topics: Vec<String> = values(&form, "topic").map(str::to_string).collect();
    if topics.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing \"topic\" parameter").into_response();
    }

    let retry = match first_value(&form, "retry").map(str::parse::<u64>).transpose() {
        Ok(retry) => retry,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid \"retry\" parameter").into_response(),
    };

    let private = values(&form, "private").next().is_some();

    if let Some(selectors) = claims.as_ref().and_then(|c| c.publish()) {
        if !can_dispatch(hub.topic_selector_store(), &topics, selectors) {
            if private {
                return unauthorized(remote_addr.as_deref(), None);
            }

            if !hub.config().is_backward_compatible_with(PROTOCOL_V7) {
                tracing::info!(
                    topics = ?topics,
                    "Unsupported: posting public updates to topics not listed in the \"mercure.publish\" JWT claim"
                );
                return unauthorized(remote_addr.as_deref(), None);
            }

            tracing::info!(
                topics = ?topics,
                "Deprecated: posting public updates to topics not listed in the \"mercure.publish\" JWT claim"
            );
        }
    }

    let mut update = Update::new(topics, first_value(&form, "data").unwrap_or_default());
    update.id = first_value(&form, "id").unwrap_or_default().to_string();
    update.event_type = first_value(&form, "type").map(str::to_string);
    update.retry = retry;
    update.private = private;

    match hub.publish(update).await {
        Ok(update) => (StatusCode::OK, update.id.clone()).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Unable to publish update");
            (StatusCode::INTERNAL_SERVER_ERROR, "500 internal server error").into_response()
        }
    }
}

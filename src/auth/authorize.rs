//! Token extraction from a request

use super::{validate_jwt, AuthError, Claims, Keyfunc};
use axum::http::{header, HeaderMap, Method};

pub const DEFAULT_COOKIE_NAME: &str = "mercureAuthorization";

const BEARER_PREFIX: &str = "Bearer ";

/// Shortest string that can be a signed JWT
const MIN_TOKEN_LEN: usize = 41;

/// Validate the token carried by a request.
///
/// Returns `Ok(None)` when no token is present (anonymous request), the
/// normalized claims when a token is valid, and an error otherwise.
pub async fn authorize(
    method: &Method,
    headers: &HeaderMap,
    query: &[(String, String)],
    cookie_name: &str,
    publish_origins: &[String],
    keyfunc: &dyn Keyfunc,
) -> Result<Option<Claims>, AuthError> {
    let mut authorization = headers.get_all(header::AUTHORIZATION).iter();
    if let Some(value) = authorization.next() {
        let token = value
            .to_str()
            .ok()
            .filter(|_| authorization.next().is_none())
            .and_then(|v| v.strip_prefix(BEARER_PREFIX))
            .filter(|t| t.len() >= MIN_TOKEN_LEN)
            .ok_or(AuthError::InvalidAuthorizationHeader)?;

        return validate_jwt(token, keyfunc).await.map(Some);
    }

    let mut from_query = query.iter().filter(|(k, _)| k == "authorization").map(|(_, v)| v);
    if let Some(token) = from_query.next() {
        if from_query.next().is_some() || token.len() < MIN_TOKEN_LEN {
            return Err(AuthError::InvalidAuthorizationQuery);
        }

        return validate_jwt(token, keyfunc).await.map(Some);
    }

    let Some(token) = cookie(headers, cookie_name) else {
        return Ok(None);
    };

    // Safe methods cannot be used for CSRF
    if method != Method::POST {
        return validate_jwt(&token, keyfunc).await.map(Some);
    }

    let origin = request_origin(headers)?;
    if publish_origins.iter().any(|allowed| allowed == "*" || *allowed == origin) {
        return validate_jwt(&token, keyfunc).await.map(Some);
    }

    Err(AuthError::OriginNotAllowed(origin))
}

/// `Origin` header, or the origin of the `Referer`
fn request_origin(headers: &HeaderMap) -> Result<String, AuthError> {
    if let Some(origin) = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Ok(origin.to_string());
    }

    let referer = headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(AuthError::NoOrigin)?;

    let url = url::Url::parse(referer).map_err(|e| AuthError::InvalidReferer(e.to_string()))?;
    let host = url.host_str().unwrap_or_default();

    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"').to_string())
}

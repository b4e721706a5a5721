//! Authorization
//!
//! Tokens are JWTs carrying a `mercure` claim with `publish` and `subscribe`
//! topic selectors. They are read, in order, from:
//! - the `Authorization: Bearer` header
//! - the `authorization` query parameter
//! - a cookie (`mercureAuthorization` by default), with an origin check on POST

mod authorize;
mod claims;
mod keys;
mod selectors;

pub use authorize::{authorize, DEFAULT_COOKIE_NAME};
pub use claims::{Claims, MercureClaim, NAMESPACED_CLAIM};
pub use keys::{validate_jwt, JwksKeySet, JwtKey, Keyfunc, StaticKey};
pub use selectors::{can_dispatch, can_receive};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid \"Authorization\" HTTP header")]
    InvalidAuthorizationHeader,

    #[error("invalid \"authorization\" query parameter")]
    InvalidAuthorizationQuery,

    #[error("an \"Origin\" or a \"Referer\" HTTP header must be present to use the cookie-based authorization mechanism")]
    NoOrigin,

    #[error("unable to parse referer: {0}")]
    InvalidReferer(String),

    #[error("{0:?}: origin not allowed to post updates")]
    OriginNotAllowed(String),

    #[error("unexpected signing method: {0}")]
    UnexpectedSigningMethod(String),

    #[error("unable to parse JWT: {0}")]
    InvalidJwt(#[from] jsonwebtoken::errors::Error),

    #[error("public key error: {0}")]
    PublicKey(String),

    #[error("unable to fetch JWKS: {0}")]
    Jwks(String),

    #[error("no key with id {0:?} in JWKS")]
    UnknownKeyId(String),
}

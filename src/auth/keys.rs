//! Key sources for JWT validation
//!
//! A [`JwtKey`] is the configured key material; it produces a [`Keyfunc`],
//! which resolves the decoding key for a given token header.

use super::{AuthError, Claims};
use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
use parking_lot::RwLock;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum delay between two JWKS fetches triggered by unknown key ids
const JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Configured key material
#[derive(Clone)]
pub enum JwtKey {
    /// Shared secret (HS256, HS384, HS512)
    Hmac { secret: Vec<u8>, alg: Algorithm },
    /// PEM encoded RSA public key
    RsaPublicKey { pem: Vec<u8>, alg: Algorithm },
    /// PEM encoded X.509 certificate carrying an RSA key
    RsaCertificate { pem: Vec<u8>, alg: Algorithm },
    /// JSON Web Key Set fetched over HTTP
    Jwks { url: String },
}

impl JwtKey {
    /// Build from a key and algorithm name as found in configuration.
    ///
    /// RSA keys are told apart from certificates by their PEM label.
    pub fn from_config(key: &str, alg: &str) -> Result<Self, AuthError> {
        let alg = Algorithm::from_str(alg).map_err(|_| AuthError::UnexpectedSigningMethod(alg.to_string()))?;

        match alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(Self::Hmac {
                secret: key.as_bytes().to_vec(),
                alg,
            }),
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let pem = key.as_bytes().to_vec();
                if key.contains("BEGIN CERTIFICATE") {
                    Ok(Self::RsaCertificate { pem, alg })
                } else {
                    Ok(Self::RsaPublicKey { pem, alg })
                }
            }
            other => Err(AuthError::UnexpectedSigningMethod(format!("{:?}", other))),
        }
    }

    pub fn jwks(url: impl Into<String>) -> Self {
        Self::Jwks { url: url.into() }
    }

    /// Turn the key material into a keyfunc, parsing PEM data eagerly
    pub fn keyfunc(&self) -> Result<Arc<dyn Keyfunc>, AuthError> {
        let keyfunc: Arc<dyn Keyfunc> = match self {
            Self::Hmac { secret, alg } => Arc::new(StaticKey {
                key: DecodingKey::from_secret(secret),
                alg: *alg,
            }),
            Self::RsaPublicKey { pem, alg } => Arc::new(StaticKey {
                key: DecodingKey::from_rsa_pem(pem).map_err(|e| AuthError::PublicKey(e.to_string()))?,
                alg: *alg,
            }),
            Self::RsaCertificate { pem, alg } => Arc::new(StaticKey {
                key: rsa_key_from_certificate(pem)?,
                alg: *alg,
            }),
            Self::Jwks { url } => Arc::new(JwksKeySet::new(url.clone())),
        };

        Ok(keyfunc)
    }
}

impl std::fmt::Debug for JwtKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hmac { alg, .. } => write!(f, "JwtKey::Hmac({:?}, [REDACTED])", alg),
            Self::RsaPublicKey { alg, .. } => write!(f, "JwtKey::RsaPublicKey({:?})", alg),
            Self::RsaCertificate { alg, .. } => write!(f, "JwtKey::RsaCertificate({:?})", alg),
            Self::Jwks { url } => write!(f, "JwtKey::Jwks({})", url),
        }
    }
}

fn rsa_key_from_certificate(pem: &[u8]) -> Result<DecodingKey, AuthError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem).map_err(|e| AuthError::PublicKey(e.to_string()))?;
    let cert = pem.parse_x509().map_err(|e| AuthError::PublicKey(e.to_string()))?;

    Ok(DecodingKey::from_rsa_der(&cert.public_key().subject_public_key.data))
}

/// Resolves the key used to verify a token
#[async_trait]
pub trait Keyfunc: Send + Sync {
    /// Decoding key and accepted algorithms for a token with this header
    async fn key(&self, header: &Header) -> Result<(DecodingKey, Algorithm), AuthError>;
}

/// A single configured key with a fixed algorithm
pub struct StaticKey {
    key: DecodingKey,
    alg: Algorithm,
}

#[async_trait]
impl Keyfunc for StaticKey {
    async fn key(&self, header: &Header) -> Result<(DecodingKey, Algorithm), AuthError> {
        if header.alg != self.alg {
            return Err(AuthError::UnexpectedSigningMethod(format!("{:?}", header.alg)));
        }
        Ok((self.key.clone(), self.alg))
    }
}

/// Keys looked up by `kid` in a remote JWKS, refreshed when an unknown id shows up
pub struct JwksKeySet {
    url: String,
    client: reqwest::Client,
    cache: RwLock<Option<(JwkSet, Instant)>>,
}

impl JwksKeySet {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
            cache: RwLock::new(None),
        }
    }

    fn lookup(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let cache = self.cache.read();
        let (set, _) = cache.as_ref()?;

        let jwk = match kid {
            Some(kid) => set.find(kid)?,
            None => set.keys.first()?,
        };
        DecodingKey::from_jwk(jwk).ok()
    }

    fn recently_fetched(&self) -> bool {
        matches!(&*self.cache.read(), Some((_, at)) if at.elapsed() < JWKS_REFRESH_INTERVAL)
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let set: JwkSet = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::Jwks(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::Jwks(e.to_string()))?;

        tracing::debug!(url = %self.url, keys = set.keys.len(), "Fetched JWKS");
        *self.cache.write() = Some((set, Instant::now()));

        Ok(())
    }
}

#[async_trait]
impl Keyfunc for JwksKeySet {
    async fn key(&self, header: &Header) -> Result<(DecodingKey, Algorithm), AuthError> {
        let kid = header.kid.as_deref();

        if let Some(key) = self.lookup(kid) {
            return Ok((key, header.alg));
        }

        if !self.recently_fetched() {
            self.refresh().await?;
            if let Some(key) = self.lookup(kid) {
                return Ok((key, header.alg));
            }
        }

        Err(AuthError::UnknownKeyId(kid.unwrap_or_default().to_string()))
    }
}

/// Verify a token and return its normalized claims
pub async fn validate_jwt(token: &str, keyfunc: &dyn Keyfunc) -> Result<Claims, AuthError> {
    let header = jsonwebtoken::decode_header(token).map_err(AuthError::InvalidJwt)?;
    let (key, alg) = keyfunc.key(&header).await?;

    let mut validation = Validation::new(alg);
    // `exp` is optional in Mercure tokens, but checked when present
    validation.required_spec_claims.clear();
    validation.validate_aud = false;

    let data = jsonwebtoken::decode::<Claims>(token, &key, &validation).map_err(AuthError::InvalidJwt)?;

    Ok(data.claims.normalize())
}

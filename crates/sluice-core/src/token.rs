//! Storage token minting and validation.
//!
//! Every dispatch carries an opaque token scoped to one storage backend
//! with a bounded lifetime. Tokens are HMAC-SHA256 based.
//! Format: `sluice_st_<backend>_<expires_unix>_<hmac_hex>`

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify sluice storage tokens.
const TOKEN_PREFIX: &str = "sluice_st_";

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,

    #[error("token expired at {0}")]
    Expired(i64),

    #[error("missing token secret")]
    MissingSecret,
}

/// Configuration for token generation and validation.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// The HMAC secret key bytes.
    pub secret: Vec<u8>,
}

impl TokenConfig {
    /// Create a new TokenConfig with the given secret.
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Create a TokenConfig from the `SLUICE_TOKEN_SECRET` environment
    /// variable. The value must be hex-encoded.
    pub fn from_env() -> Result<Self, TokenError> {
        let secret_hex =
            std::env::var("SLUICE_TOKEN_SECRET").map_err(|_| TokenError::MissingSecret)?;
        let secret = hex::decode(&secret_hex).map_err(|e| {
            TokenError::InvalidFormat(format!("SLUICE_TOKEN_SECRET is not valid hex: {e}"))
        })?;
        Ok(Self::new(secret))
    }
}

/// Claims extracted from a validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// The storage backend this token grants access to.
    pub backend_id: String,
    /// Unix timestamp the token expires at.
    pub expires_at: i64,
}

/// Mint a storage token for a backend with the given lifetime.
pub fn mint_token(config: &TokenConfig, backend_id: &str, ttl: Duration) -> String {
    let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
    let message = format!("{backend_id}:{expires_at}");
    let mac = compute_hmac(&config.secret, message.as_bytes());
    let hmac_hex = hex::encode(mac);
    format!("{TOKEN_PREFIX}{backend_id}_{expires_at}_{hmac_hex}")
}

/// Validate a storage token and extract its claims.
///
/// Recomputes the HMAC, compares in constant time, and rejects expired
/// tokens. The backend id may itself contain underscores, so the token is
/// parsed from the right.
pub fn validate_token(config: &TokenConfig, token: &str) -> Result<TokenClaims, TokenError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        TokenError::InvalidFormat(format!("token must start with {TOKEN_PREFIX:?}"))
    })?;

    let (head, hmac_hex) = rest
        .rsplit_once('_')
        .ok_or_else(|| TokenError::InvalidFormat("missing HMAC segment".to_owned()))?;
    let (backend_id, expires_str) = head
        .rsplit_once('_')
        .ok_or_else(|| TokenError::InvalidFormat("missing expiry segment".to_owned()))?;
    let expires_at: i64 = expires_str
        .parse()
        .map_err(|_| TokenError::InvalidFormat(format!("invalid expiry: {expires_str:?}")))?;

    let message = format!("{backend_id}:{expires_at}");
    let mut mac = HmacSha256::new_from_slice(&config.secret)
        .map_err(|_| TokenError::MissingSecret)?;
    mac.update(message.as_bytes());
    let provided =
        hex::decode(hmac_hex).map_err(|_| TokenError::InvalidFormat("bad hex".to_owned()))?;
    mac.verify_slice(&provided)
        .map_err(|_| TokenError::HmacMismatch)?;

    if expires_at <= Utc::now().timestamp() {
        return Err(TokenError::Expired(expires_at));
    }

    Ok(TokenClaims {
        backend_id: backend_id.to_owned(),
        expires_at,
    })
}

fn compute_hmac(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

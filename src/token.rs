//! Upload tokens.
//!
//! A token proves that a chat user asked for it (via `!gen-token`) and lets
//! the upload path enqueue training for that user without a password.
//!
//! Format: `base64url(nonce) "." base64url(ciphertext)`. The plaintext is the
//! JSON object `{"issued": <unix secs>, "expires": <unix secs>, "user": ".."}`
//! sealed with ChaCha20-Poly1305 under a key derived from the server secret,
//! so the claims can be neither read nor altered without it.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of a freshly generated secret, in bytes.
pub const SECRET_LEN: usize = 32;

const NONCE_LEN: usize = 12;

/// Domain label mixed into the key so the raw secret is never the cipher key.
const KEY_LABEL: &[u8] = b"combine upload token";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("expired token")]
    Expired,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub issued: i64,
    pub expires: i64,
    pub user: String,
}

/// Issues and verifies tokens under a single secret.
pub struct TokenSigner {
    cipher: ChaCha20Poly1305,
    ttl: Duration,
}

impl TokenSigner {
    /// `secret` may be any length; the cipher key is HMAC-SHA256 of a fixed
    /// label under it.
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(secret.as_ref()).expect("HMAC can take key of any size");
        mac.update(KEY_LABEL);
        let key = mac.finalize().into_bytes();
        Self {
            cipher: ChaCha20Poly1305::new(&key),
            ttl,
        }
    }

    /// Read a hex-encoded secret written by [`ensure_secret`].
    pub fn from_file(path: &Path, ttl: Duration) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read token secret: {}", path.display()))?;
        let secret = hex::decode(text.trim())
            .with_context(|| format!("Token secret is not valid hex: {}", path.display()))?;
        if secret.is_empty() {
            anyhow::bail!("Token secret is empty: {}", path.display());
        }
        Ok(Self::new(secret, ttl))
    }

    pub fn issue(&self, user: &str) -> String {
        self.issue_at(user, Utc::now())
    }

    pub fn issue_at(&self, user: &str, now: DateTime<Utc>) -> String {
        let claims = TokenClaims {
            issued: now.timestamp(),
            expires: (now + self.ttl).timestamp(),
            user: user.to_string(),
        };
        let json = serde_json::to_vec(&claims).expect("claims serialize to JSON");

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), json.as_slice())
            .expect("token payload is far below the cipher's length limit");

        format!("{}.{}", URL_SAFE_NO_PAD.encode(nonce), URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        self.verify_at(token, Utc::now())
    }

    /// Decode, then authenticate and decrypt, then check expiry.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<TokenClaims, TokenError> {
        let (nonce, sealed) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        let nonce = URL_SAFE_NO_PAD
            .decode(nonce)
            .map_err(|_| TokenError::Malformed)?;
        if nonce.len() != NONCE_LEN {
            return Err(TokenError::Malformed);
        }
        let sealed = URL_SAFE_NO_PAD
            .decode(sealed)
            .map_err(|_| TokenError::Malformed)?;

        let json = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| TokenError::BadSignature)?;
        let claims: TokenClaims = serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;

        if now.timestamp() >= claims.expires {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

/// Create a random hex secret at `path` unless one is already there.
///
/// Returns `true` if a new secret was written.
pub fn ensure_secret(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create token secret: {}", path.display()))?;
    file.write_all(hex::encode(secret).as_bytes())
        .with_context(|| format!("Failed to write token secret: {}", path.display()))?;
    Ok(true)
}

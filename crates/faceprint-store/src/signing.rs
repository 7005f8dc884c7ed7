//! Time-limited signed URLs.
//!
//! `{public_url}/storage/{key}?expires={unix}&signature={hex}` where the
//! signature is HMAC-SHA256 keyed by the secret over `key || 0x00 || expires`.

use crate::StoreError;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt::Write as _;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const SIGNING_SECRET_LEN: usize = 32;

/// Issues and checks signed URLs for stored objects.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    public_url: String,
    ttl_secs: i64,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("public_url", &self.public_url)
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>, public_url: &str, ttl_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            public_url: public_url.trim_end_matches('/').to_string(),
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        }
    }

    /// Signer with a fresh random secret. URLs it issues stop verifying when
    /// the process restarts.
    pub fn ephemeral(public_url: &str, ttl_secs: u64) -> Self {
        let mut secret = vec![0u8; SIGNING_SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        tracing::warn!("no signing secret configured; signed URLs will not survive a restart");
        Self::new(secret, public_url, ttl_secs)
    }

    /// Signed URL for `key`, valid for the configured TTL from `now` (unix seconds).
    pub fn sign_at(&self, key: &str, now: i64) -> Result<String, StoreError> {
        let expires = now.saturating_add(self.ttl_secs);
        let signature = hex::encode(self.mac(key, expires)?);
        Ok(format!(
            "{}/storage/{}?expires={expires}&signature={signature}",
            self.public_url,
            encode_key(key)
        ))
    }

    pub fn sign(&self, key: &str) -> Result<String, StoreError> {
        self.sign_at(key, chrono::Utc::now().timestamp())
    }

    /// Check a presented `(expires, signature)` pair for `key` at time `now`.
    pub fn verify_at(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let presented = hex::decode(signature).map_err(|_| StoreError::InvalidSignature)?;
        let expected = self.mac(key, expires)?;
        if presented.len() != expected.len() || !bool::from(expected.ct_eq(presented.as_slice())) {
            return Err(StoreError::InvalidSignature);
        }
        if now > expires {
            return Err(StoreError::Expired);
        }
        Ok(())
    }

    pub fn verify(&self, key: &str, expires: i64, signature: &str) -> Result<(), StoreError> {
        self.verify_at(key, expires, signature, chrono::Utc::now().timestamp())
    }

    fn mac(&self, key: &str, expires: i64) -> Result<Vec<u8>, StoreError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| StoreError::SigningKey(e.to_string()))?;
        mac.update(key.as_bytes());
        mac.update(&[0u8]);
        mac.update(expires.to_string().as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Percent-encode each key segment, keeping `/` separators.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

//! Tracking identifiers embedded in callback URLs.
//!
//! Contact and message ids are sealed with AES-256-GCM and encoded as
//! unpadded base64url, so the token can sit in a URL path segment without
//! escaping and a forged or altered token fails authentication on decrypt.
//!
//! The nonce is derived from the plaintext with HMAC-SHA256 keyed by the
//! configured IV material. Encrypting the same id twice therefore yields the
//! same token, and distinct ids never share a nonce.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{
    Engine,
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Nonce size for AES-256-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (256 bits)
const KEY_SIZE: usize = 32;

/// Minimum amount of IV material accepted for nonce derivation
const MIN_IV_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("Invalid tracking key material: {0}")]
    InvalidKey(String),

    #[error("Malformed tracking token: {0}")]
    MalformedToken(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),
}

/// Symmetric codec for tracking identifiers.
///
/// Constructed once at startup from the configured key and IV and shared by
/// reference; there is no global cipher state.
#[derive(Clone)]
pub struct TrackingCodec {
    cipher: Aes256Gcm,
    nonce_mac: HmacSha256,
}

impl TrackingCodec {
    pub fn new(key: [u8; KEY_SIZE], iv: &[u8]) -> Result<Self, TrackingError> {
        if iv.len() < MIN_IV_SIZE {
            return Err(TrackingError::InvalidKey(format!(
                "IV must be at least {MIN_IV_SIZE} bytes, got {}",
                iv.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| TrackingError::InvalidKey(format!("Failed to create cipher: {e}")))?;
        let nonce_mac = <HmacSha256 as Mac>::new_from_slice(iv)
            .map_err(|e| TrackingError::InvalidKey(format!("Failed to create nonce MAC: {e}")))?;

        Ok(Self { cipher, nonce_mac })
    }

    /// Builds a codec from hex or base64 encoded key and IV strings.
    pub fn from_encoded(key: &str, iv: &str) -> Result<Self, TrackingError> {
        let key_bytes = parse_material(key)?;
        if key_bytes.len() != KEY_SIZE {
            return Err(TrackingError::InvalidKey(format!(
                "Key must be {KEY_SIZE} bytes, got {}",
                key_bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&key_bytes);

        Self::new(key, &parse_material(iv)?)
    }

    /// Seals an identifier into a URL-safe token.
    pub fn encrypt(&self, plain_id: &str) -> Result<String, TrackingError> {
        let nonce_bytes = self.derive_nonce(plain_id.as_bytes());
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plain_id.as_bytes())
            .map_err(|e| TrackingError::Encryption(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Opens a token produced by [`TrackingCodec::encrypt`].
    pub fn decrypt(&self, token: &str) -> Result<String, TrackingError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| TrackingError::MalformedToken(format!("Invalid base64: {e}")))?;

        if sealed.len() <= NONCE_SIZE {
            return Err(TrackingError::MalformedToken("Token too short".into()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| TrackingError::MalformedToken("Authentication failed".into()))?;

        String::from_utf8(plaintext)
            .map_err(|e| TrackingError::MalformedToken(format!("Invalid UTF-8: {e}")))
    }

    fn derive_nonce(&self, plaintext: &[u8]) -> [u8; NONCE_SIZE] {
        let mut mac = self.nonce_mac.clone();
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        nonce
    }
}

impl std::fmt::Debug for TrackingCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingCodec")
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Parses key material from a hex or base64 string.
fn parse_material(value: &str) -> Result<Vec<u8>, TrackingError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(TrackingError::InvalidKey("Key material is empty".into()));
    }

    // Try hex first
    if value.len() % 2 == 0
        && let Ok(bytes) = hex::decode(value)
    {
        return Ok(bytes);
    }

    BASE64
        .decode(value)
        .map_err(|e| TrackingError::InvalidKey(format!("Invalid base64 key material: {e}")))
}

/// Callback URLs embedded in one outbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackUrls {
    pub clicked: String,
    pub received: String,
}

/// Builds the click/received callback URLs for a target.
#[derive(Debug, Clone)]
pub struct TrackingUrls {
    base_url: String,
    codec: TrackingCodec,
}

impl TrackingUrls {
    pub fn new(base_url: impl Into<String>, codec: TrackingCodec) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, codec }
    }

    pub fn codec(&self) -> &TrackingCodec {
        &self.codec
    }

    pub fn for_target(
        &self,
        push_contact_id: &str,
        message_id: Uuid,
    ) -> Result<CallbackUrls, TrackingError> {
        let contact = self.codec.encrypt(push_contact_id)?;
        let message = self.codec.encrypt(&message_id.to_string())?;
        let prefix = format!("{}/{contact}/messages/{message}", self.base_url);

        Ok(CallbackUrls {
            clicked: format!("{prefix}/clicked"),
            received: format!("{prefix}/received"),
        })
    }
}

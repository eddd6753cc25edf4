//! Signed session identifiers.
//!
//! A [`SessionId`] is an opaque, URL-safe token that carries no user data.
//! It is minted from 128 bits of OS randomness followed by an HMAC-SHA256
//! tag computed over that randomness with the gateway's secret key:
//!
//! ```text
//! base64url( random[16] || hmac_sha256(key, random)[32] )
//! ```
//!
//! The encoding is unpadded URL-safe base64, so every token is exactly
//! 64 characters and every 48-byte payload round-trips without loss.
//!
//! Tokens never expire on their own. Expiry is a property of the session
//! cache entry the token points at (see [`crate::session`]).
//!
//! # Example
//!
//! ```rust
//! use portico_gateway::sid::{SessionId, SessionKey};
//!
//! let key = SessionKey::new("correct horse battery staple");
//! let sid = SessionId::issue(&key).expect("entropy available");
//!
//! let validated = SessionId::validate(sid.as_str(), &key).unwrap();
//! assert_eq!(validated, sid);
//! ```

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::TryRngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Length of the random component in bytes (128 bits).
pub const RANDOM_LENGTH: usize = 16;

/// Length of the HMAC-SHA256 signature in bytes.
pub const SIGNATURE_LENGTH: usize = 32;

/// Length of a decoded token.
const TOKEN_BYTES: usize = RANDOM_LENGTH + SIGNATURE_LENGTH;

/// Length of an encoded token (48 bytes as unpadded base64).
pub const TOKEN_LENGTH: usize = 64;

/// Errors produced while issuing or validating session identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SidError {
    /// The token is not valid base64 or has the wrong length.
    #[error("malformed session token")]
    Malformed,

    /// The embedded signature does not match the random component.
    #[error("invalid session token signature")]
    InvalidSignature,

    /// The operating system's entropy source failed. Not retryable.
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
}

/// Secret key used to sign and verify session identifiers.
///
/// The key bytes are wiped from memory when the key is dropped.
#[derive(Clone)]
pub struct SessionKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl SessionKey {
    /// Creates a key from raw secret material.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            bytes: Zeroizing::new(secret.as_ref().to_vec()),
        }
    }

    /// Returns `true` if the key has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn sign(&self, random: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        let mut mac = match HmacSha256::new_from_slice(&self.bytes) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac accepts keys of any length"),
        };
        mac.update(random);

        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature.copy_from_slice(&mac.finalize().into_bytes());
        signature
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A signed, opaque session identifier.
///
/// Equality is byte-exact on the encoded token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Mints a new session identifier signed with `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SidError::Entropy`] if the OS random source fails.
    pub fn issue(key: &SessionKey) -> Result<Self, SidError> {
        let mut random = [0u8; RANDOM_LENGTH];
        OsRng
            .try_fill_bytes(&mut random)
            .map_err(|err| SidError::Entropy(err.to_string()))?;

        let signature = key.sign(&random);

        let mut token = [0u8; TOKEN_BYTES];
        token[..RANDOM_LENGTH].copy_from_slice(&random);
        token[RANDOM_LENGTH..].copy_from_slice(&signature);

        Ok(Self(URL_SAFE_NO_PAD.encode(token)))
    }

    /// Validates an encoded token against `key`.
    ///
    /// The signature is recomputed over the embedded random component and
    /// compared in constant time.
    ///
    /// # Errors
    ///
    /// - [`SidError::Malformed`] if the token cannot be decoded
    /// - [`SidError::InvalidSignature`] if the signature does not match
    pub fn validate(token: &str, key: &SessionKey) -> Result<Self, SidError> {
        if token.len() != TOKEN_LENGTH {
            return Err(SidError::Malformed);
        }

        let decoded = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| SidError::Malformed)?;
        if decoded.len() != TOKEN_BYTES {
            return Err(SidError::Malformed);
        }

        let (random, signature) = decoded.split_at(RANDOM_LENGTH);
        let expected = key.sign(random);

        if bool::from(expected[..].ct_eq(signature)) {
            Ok(Self(token.to_string()))
        } else {
            Err(SidError::InvalidSignature)
        }
    }

    /// Returns the encoded token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the 128-bit random component embedded in the token.
    pub fn random_component(&self) -> [u8; RANDOM_LENGTH] {
        let mut random = [0u8; RANDOM_LENGTH];
        if let Ok(decoded) = URL_SAFE_NO_PAD.decode(&self.0) {
            if decoded.len() >= RANDOM_LENGTH {
                random.copy_from_slice(&decoded[..RANDOM_LENGTH]);
            }
        }
        random
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens are credentials; keep them out of debug output.
        f.write_str("SessionId(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_key() -> SessionKey {
        SessionKey::new("test-signing-key")
    }

    fn flip_bit(token: &str, bit: usize) -> String {
        let mut bytes = URL_SAFE_NO_PAD.decode(token).unwrap();
        bytes[bit / 8] ^= 1 << (bit % 8);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    #[test]
    fn issued_token_has_expected_length() {
        let sid = SessionId::issue(&test_key()).unwrap();
        assert_eq!(sid.as_str().len(), TOKEN_LENGTH);
    }

    #[test]
    fn issued_tokens_are_unique() {
        let key = test_key();
        let tokens: std::collections::HashSet<_> = (0..1000)
            .map(|_| SessionId::issue(&key).unwrap())
            .collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn validate_accepts_issued_token() {
        let key = test_key();
        let sid = SessionId::issue(&key).unwrap();

        let validated = SessionId::validate(sid.as_str(), &key).unwrap();
        assert_eq!(validated, sid);
        assert_eq!(validated.random_component(), sid.random_component());
    }

    #[test]
    fn validate_rejects_token_signed_with_other_key() {
        let sid = SessionId::issue(&SessionKey::new("key-a")).unwrap();
        let result = SessionId::validate(sid.as_str(), &SessionKey::new("key-b"));
        assert_eq!(result, Err(SidError::InvalidSignature));
    }

    #[test]
    fn every_single_bit_flip_is_rejected() {
        let key = test_key();
        let sid = SessionId::issue(&key).unwrap();

        for bit in 0..TOKEN_BYTES * 8 {
            let tampered = flip_bit(sid.as_str(), bit);
            assert_eq!(
                SessionId::validate(&tampered, &key),
                Err(SidError::InvalidSignature),
                "bit {bit} flip should invalidate the signature"
            );
        }
    }

    #[test]
    fn validate_rejects_malformed_tokens() {
        let key = test_key();
        assert_eq!(SessionId::validate("", &key), Err(SidError::Malformed));
        assert_eq!(SessionId::validate("short", &key), Err(SidError::Malformed));
        assert_eq!(
            SessionId::validate(&"!".repeat(TOKEN_LENGTH), &key),
            Err(SidError::Malformed)
        );
        assert_eq!(
            SessionId::validate(&"A".repeat(TOKEN_LENGTH + 4), &key),
            Err(SidError::Malformed)
        );
    }

    #[test]
    fn debug_output_redacts_token_and_key() {
        let key = test_key();
        let sid = SessionId::issue(&key).unwrap();

        let sid_debug = format!("{:?}", sid);
        assert!(!sid_debug.contains(sid.as_str()));

        let key_debug = format!("{:?}", key);
        assert!(!key_debug.contains("test-signing-key"));
    }

    #[test]
    fn error_display() {
        assert_eq!(SidError::Malformed.to_string(), "malformed session token");
        assert_eq!(
            SidError::InvalidSignature.to_string(),
            "invalid session token signature"
        );
    }

    proptest! {
        #[test]
        fn round_trip_for_any_non_empty_key(secret in proptest::collection::vec(any::<u8>(), 1..128)) {
            let key = SessionKey::new(&secret);
            let sid = SessionId::issue(&key).unwrap();
            let validated = SessionId::validate(sid.as_str(), &key).unwrap();
            prop_assert_eq!(validated.random_component(), sid.random_component());
        }
    }
}

//! Identity key material.
//!
//! Each installation owns one long-lived X25519 keypair. The secret half
//! exists in plaintext only inside an unlocked session; at rest it is
//! AEAD-sealed under either a keychain-held random key or an Argon2id
//! password-derived key (see kf_store).
//!
//! Recovery secret
//! ---------------
//! The raw 32-byte secret, base64url-encoded behind a short version prefix.
//! It is the only way back in when the keychain entry is lost, so callers
//! must surface it exactly once at creation time and never log it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// Raw length of every key this module handles.
pub const KEY_LEN: usize = 32;

/// Version prefix on recovery strings; bump on any format change.
pub const RECOVERY_PREFIX: &str = "KF1.";

// ── Newtype wrapper ───────────────────────────────────────────────────────────

/// 32-byte X25519 public key, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    /// Decode a base64url public key, rejecting anything that is not exactly
    /// 32 raw bytes before it gets anywhere near a DH computation.
    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "Public key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_array(&self) -> Result<[u8; 32], CryptoError> {
        self.0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
    }

    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 20 bytes (160 bits), hex-encoded in groups of 4 for display.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Long-term identity keypair. Drop clears the secret via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            public: PublicKeyBytes(public.as_bytes().to_vec()),
            secret_bytes: secret.to_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "Identity key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let secret = StaticSecret::from(arr);
        let public = X25519Public::from(&secret);
        Ok(Self {
            public: PublicKeyBytes(public.as_bytes().to_vec()),
            secret_bytes: arr,
        })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    /// X25519 key agreement with a peer public key.
    pub fn diffie_hellman(&self, peer: &PublicKeyBytes) -> Result<[u8; 32], CryptoError> {
        let secret = StaticSecret::from(self.secret_bytes);
        let peer = X25519Public::from(peer.as_array()?);
        Ok(secret.diffie_hellman(&peer).to_bytes())
    }

    /// Export the public key in base64 format for upload/display.
    pub fn public_b64(&self) -> String {
        self.public.to_b64()
    }

    /// Encode the raw secret as a portable recovery string.
    pub fn to_recovery_string(&self) -> String {
        format!("{RECOVERY_PREFIX}{}", URL_SAFE_NO_PAD.encode(self.secret_bytes))
    }

    /// Reconstruct an identity from a recovery string. Malformed input fails
    /// without touching any key state.
    pub fn from_recovery_string(s: &str) -> Result<Self, CryptoError> {
        let encoded = s
            .trim()
            .strip_prefix(RECOVERY_PREFIX)
            .ok_or_else(|| CryptoError::InvalidKey("unrecognised recovery format".into()))?;
        let bytes = URL_SAFE_NO_PAD.decode(encoded)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_string_roundtrip() {
        let pair = IdentityKeyPair::generate();
        let recovery = pair.to_recovery_string();
        assert!(recovery.starts_with(RECOVERY_PREFIX));

        let restored = IdentityKeyPair::from_recovery_string(&recovery).unwrap();
        assert_eq!(restored.public, pair.public);
        assert_eq!(restored.secret_bytes(), pair.secret_bytes());
    }

    #[test]
    fn rejects_malformed_recovery_strings() {
        assert!(IdentityKeyPair::from_recovery_string("not a key").is_err());
        assert!(IdentityKeyPair::from_recovery_string("KF1.!!!!").is_err());
        // Valid base64 but wrong length
        let short = format!("{RECOVERY_PREFIX}{}", URL_SAFE_NO_PAD.encode([1u8; 16]));
        assert!(IdentityKeyPair::from_recovery_string(&short).is_err());
    }

    #[test]
    fn public_key_length_enforced() {
        let short = URL_SAFE_NO_PAD.encode([0u8; 31]);
        assert!(PublicKeyBytes::from_b64(&short).is_err());
        let long = URL_SAFE_NO_PAD.encode([0u8; 33]);
        assert!(PublicKeyBytes::from_b64(&long).is_err());

        let pair = IdentityKeyPair::generate();
        let ok = PublicKeyBytes::from_b64(&pair.public_b64()).unwrap();
        assert_eq!(ok, pair.public);
    }

    #[test]
    fn fingerprint_is_stable_and_grouped() {
        let pair = IdentityKeyPair::generate();
        let fp1 = pair.public.fingerprint();
        let fp2 = pair.public.fingerprint();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.split(' ').count(), 10);
    }

    #[test]
    fn dh_is_commutative() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        let ab = a.diffie_hellman(&b.public).unwrap();
        let ba = b.diffie_hellman(&a.public).unwrap();
        assert_eq!(ab, ba);
    }
}

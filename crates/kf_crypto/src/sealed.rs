//! Anonymous-sender sealed boxes.
//!
//! Seals a payload to a recipient's X25519 public key so that only the
//! matching secret key can open it, with no pre-shared symmetric secret:
//!
//!   1. Generate ONE ephemeral X25519 keypair EK (fresh per seal).
//!   2. shared = DH(EK_secret, recipient_pub)
//!   3. key = HKDF-SHA256(ikm = shared || EK_pub || recipient_pub,
//!                        info = "kf-sealed-v1")
//!   4. ciphertext = XChaCha20-Poly1305(key, payload, aad = info || EK_pub)
//!
//! The ephemeral secret is dropped immediately after step 2; nothing in the
//! envelope identifies the sender. Binding EK_pub and the recipient key into
//! the KDF input (and EK_pub into the AAD) stops an envelope from being
//! re-targeted at a different keypair.
//!
//! This is the construction behind both CEK wrapping for vault members and
//! one-off credential shares.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    aead,
    error::CryptoError,
    keys::{IdentityKeyPair, PublicKeyBytes},
};

const SEALED_INFO: &[u8] = b"kf-sealed-v1";

/// A payload sealed to one recipient. Safe to store or relay anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Ephemeral X25519 public key (base64url).
    pub epk: String,
    /// AEAD ciphertext, nonce-prefixed (base64url).
    pub ciphertext: String,
}

impl SealedEnvelope {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn derive_seal_key(
    shared: &[u8; 32],
    epk: &[u8; 32],
    recipient: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let mut ikm = [0u8; 96];
    ikm[..32].copy_from_slice(shared);
    ikm[32..64].copy_from_slice(epk);
    ikm[64..].copy_from_slice(recipient);

    let mut key = [0u8; 32];
    crate::kdf::hkdf_expand(&ikm, None, SEALED_INFO, &mut key)?;
    ikm.zeroize();
    Ok(key)
}

fn seal_aad(epk: &[u8; 32]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(SEALED_INFO.len() + 32);
    aad.extend_from_slice(SEALED_INFO);
    aad.extend_from_slice(epk);
    aad
}

/// Seal `payload` to the recipient's public key.
pub fn seal(recipient: &PublicKeyBytes, payload: &[u8]) -> Result<SealedEnvelope, CryptoError> {
    let recipient_raw = recipient.as_array()?;
    let recipient_pub = X25519Public::from(recipient_raw);

    let eph_secret = StaticSecret::random_from_rng(OsRng);
    let eph_pub = X25519Public::from(&eph_secret).to_bytes();

    let mut shared = eph_secret.diffie_hellman(&recipient_pub).to_bytes();
    let mut key = derive_seal_key(&shared, &eph_pub, &recipient_raw)?;
    shared.zeroize();

    let ciphertext = aead::encrypt(&key, payload, &seal_aad(&eph_pub));
    key.zeroize();

    Ok(SealedEnvelope {
        epk: URL_SAFE_NO_PAD.encode(eph_pub),
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext?),
    })
}

/// Open a sealed envelope with the recipient's identity keypair.
/// Any other keypair fails with `SealOpen`, never with garbled plaintext.
pub fn open(
    identity: &IdentityKeyPair,
    envelope: &SealedEnvelope,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let epk_bytes = URL_SAFE_NO_PAD.decode(&envelope.epk)?;
    let epk: [u8; 32] = epk_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("ephemeral key must be 32 bytes".into()))?;
    let ct = URL_SAFE_NO_PAD.decode(&envelope.ciphertext)?;

    let mut shared = identity.diffie_hellman(&PublicKeyBytes(epk.to_vec()))?;
    let mut key = derive_seal_key(&shared, &epk, &identity.public.as_array()?)?;
    shared.zeroize();

    let plaintext = aead::decrypt(&key, &ct, &seal_aad(&epk));
    key.zeroize();

    plaintext.map_err(|_| CryptoError::SealOpen)
}

/// Seal exactly 32 bytes of key material (CEK wrapping).
pub fn seal_key32(recipient: &PublicKeyBytes, key: &[u8; 32]) -> Result<SealedEnvelope, CryptoError> {
    seal(recipient, key)
}

/// Open an envelope that must contain exactly 32 bytes of key material.
pub fn open_key32(
    identity: &IdentityKeyPair,
    envelope: &SealedEnvelope,
) -> Result<[u8; 32], CryptoError> {
    let plaintext = open(identity, envelope)?;
    if plaintext.len() != 32 {
        return Err(CryptoError::InvalidKey("Unwrapped key wrong length".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plaintext);
    Ok(out)
}

//! Key derivation functions
//!
//! `unlock_key_from_password` - Argon2id, derives the 32-byte key that seals
//!   the identity secret at rest when no OS keychain is in play.
//!
//! `hkdf_expand` - HKDF-SHA256, used by the sealed-box construction and the
//!   backup codec subkeys.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Unlock key (Argon2id) ─────────────────────────────────────────────────────

/// 32-byte key derived from a user password. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct UnlockKey(pub [u8; 32]);

/// Argon2id parameters, tuned for interactive (desktop) use.
fn argon2_params() -> Params {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost: 3 iterations
        1,         // p_cost: 1 thread
        Some(32),  // output len
    )
    .expect("Static Argon2 params are always valid")
}

/// Derive an unlock key from a user password + 16-byte salt.
/// The salt is stored alongside the sealed identity record (not secret).
pub fn unlock_key_from_password(
    password: &[u8],
    salt: &[u8; 16],
) -> Result<UnlockKey, CryptoError> {
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params());
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(UnlockKey(output))
}

/// Generate a fresh random 16-byte salt (call once per identity; store it).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be None (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_per_salt() {
        let salt = [7u8; 16];
        let k1 = unlock_key_from_password(b"correct horse", &salt).unwrap();
        let k2 = unlock_key_from_password(b"correct horse", &salt).unwrap();
        assert_eq!(k1.0, k2.0);

        let other_salt = [8u8; 16];
        let k3 = unlock_key_from_password(b"correct horse", &other_salt).unwrap();
        assert_ne!(k1.0, k3.0);

        let k4 = unlock_key_from_password(b"battery staple", &salt).unwrap();
        assert_ne!(k1.0, k4.0);
    }

    #[test]
    fn hkdf_domain_separation() {
        let ikm = [42u8; 32];
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf_expand(&ikm, None, b"context-a", &mut a).unwrap();
        hkdf_expand(&ikm, None, b"context-b", &mut b).unwrap();
        assert_ne!(a, b);
    }
}

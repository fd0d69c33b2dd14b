//! kf_crypto - Keyfold cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public APIs take and return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `keys`     - long-term X25519 identity keypair + recovery-secret encoding
//! - `sealed`   - anonymous-sender sealed boxes (ephemeral DH + AEAD)
//! - `aead`     - XChaCha20-Poly1305 encrypt/decrypt helpers + key wrapping
//! - `kdf`      - Argon2id unlock-key derivation, HKDF-SHA256
//! - `keychain` - OS credential-store integration for the identity seal key
//! - `error`    - unified error type

pub mod aead;
pub mod error;
pub mod kdf;
pub mod keychain;
pub mod keys;
pub mod sealed;

pub use error::CryptoError;

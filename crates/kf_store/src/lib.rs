//! kf_store - Encrypted local state and the Keyfold service operations
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt.  We use application-level encryption:
//! - The identity secret is AEAD-sealed under a seal key (OS keychain or
//!   Argon2id of the user's password) and cached in memory only while the
//!   session is unlocked.
//! - Each vault's content-encryption key exists only wrapped (sealed to a
//!   member's public key) or inside the unlocked session cache.
//! - Secret values are XChaCha20-Poly1305 ciphertext bound to their
//!   (vault, secret) slot via associated data.
//! - Non-sensitive metadata (names, timestamps, roles) is stored in
//!   plaintext to allow efficient queries.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on first open.

pub mod backup;
pub mod db;
pub mod error;
pub mod identity;
pub mod models;
pub mod secrets;
pub mod service;
pub mod session;
pub mod sharing;
pub mod sync;
pub mod vaults;

pub use db::Store;
pub use error::StoreError;
pub use service::Keyfold;
pub use session::Session;
pub use sync::{BlobKind, NullSync, SyncBackend};

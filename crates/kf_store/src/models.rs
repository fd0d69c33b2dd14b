//! Database row models, mapped to/from SQL rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdentityRow {
    pub id: String,
    /// Base64 X25519 public key
    pub public_key: String,
    /// AEAD(identity secret) under the seal key, base64
    pub secret_enc: String,
    /// Hex 16-byte Argon2id salt; None when keychain-backed
    pub kdf_salt: Option<String>,
    pub keychain_backed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VaultRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub cek_epoch: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MemberRow {
    pub vault_id: String,
    pub user_uuid: String,
    /// Base64 X25519 public key. MUST NOT change in place; key rotation is
    /// a new member record plus a CEK re-wrap.
    pub public_key: String,
    pub role: String,
    /// Sealed envelope JSON: the vault CEK wrapped to this member's key
    pub wrapped_cek: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SecretRow {
    pub id: String,
    pub vault_id: String,
    pub name: String,
    pub category: String,
    /// Base64 AEAD ciphertext+tag
    pub ciphertext: String,
    /// Base64 24-byte nonce
    pub nonce: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ShareRow {
    pub id: String,
    pub recipient_uuid: String,
    /// Sealed envelope JSON addressed to the recipient
    pub wrapped_payload: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

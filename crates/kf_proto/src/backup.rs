//! Portable encrypted backup bundle.
//!
//! On-disk layout is a JSON wrapper around two independent ciphertexts:
//!
//!   { magic, version, salt, header, payload }
//!
//! Header and payload are AEAD-sealed under subkeys of the export password
//! (Argon2id then HKDF, see kf_store::backup). The header decrypts on its
//! own so a preview can validate the password and show counts without ever
//! materialising a secret value. The payload's AAD binds the header
//! ciphertext, so the two halves cannot be mixed across files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{MemberInfo, SyncConfig, VaultKind};

pub const BACKUP_MAGIC: &str = "KEYFOLD-BACKUP";
pub const BACKUP_VERSION: u32 = 1;

/// The JSON file as written to disk. All fields are public metadata or
/// ciphertext; nothing here is sensitive on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    pub magic: String,
    pub version: u32,
    /// Hex-encoded 16-byte Argon2id salt.
    pub salt: String,
    /// Base64 AEAD ciphertext of the `BackupHeader` JSON.
    pub header: String,
    /// Base64 AEAD ciphertext of the `BackupPayload` JSON.
    pub payload: String,
}

/// Cheap-to-decrypt summary of the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupHeader {
    pub exported_at: DateTime<Utc>,
    pub vault_count: u64,
    pub secret_count: u64,
    pub has_sync_config: bool,
}

/// What `preview_backup` returns; the header without the ability to read on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPreview {
    pub exported_at: DateTime<Utc>,
    pub vault_count: u64,
    pub secret_count: u64,
    pub has_sync_config: bool,
}

impl From<BackupHeader> for BackupPreview {
    fn from(h: BackupHeader) -> Self {
        Self {
            exported_at: h.exported_at,
            vault_count: h.vault_count,
            secret_count: h.secret_count,
            has_sync_config: h.has_sync_config,
        }
    }
}

/// Full bundle contents. Only ever exists decrypted in memory, between the
/// payload AEAD and the importing transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPayload {
    pub identity: IdentityExport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncConfig>,
    pub vaults: Vec<VaultExport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityExport {
    pub uuid: Uuid,
    /// Base64 X25519 public key.
    pub public_key: String,
    /// Base64 raw identity secret. Protected by the payload AEAD only; a
    /// backup IS the recovery path, so it must not depend on the keychain.
    pub secret_key: String,
    pub keychain_backed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultExport {
    pub id: Uuid,
    pub name: String,
    pub kind: VaultKind,
    /// Base64 raw content-encryption key. Importers re-wrap this for the
    /// local identity; the source device's wraps are not reusable.
    pub cek: String,
    pub cek_epoch: u64,
    pub members: Vec<MemberInfo>,
    pub secrets: Vec<SecretExport>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretExport {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    /// Base64 plaintext value (the payload AEAD is the protection layer).
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

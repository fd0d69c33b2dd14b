//! Core domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kf_crypto::sealed::SealedEnvelope;

// ── Vaults ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultKind {
    /// Exactly one implicit member (the owner); never shared.
    Private,
    /// Created with an initial owner member, grows by invite.
    Shared,
}

impl VaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VaultKind::Private => "private",
            VaultKind::Shared => "shared",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(VaultKind::Private),
            "shared" => Some(VaultKind::Shared),
            _ => None,
        }
    }
}

/// Vault metadata returned to callers. The content-encryption key never
/// appears here; it only exists wrapped inside member records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultInfo {
    pub id: Uuid,
    pub name: String,
    pub kind: VaultKind,
    /// Incremented every time the CEK is rotated (member removal).
    pub cek_epoch: u64,
    pub member_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Members & roles ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Member,
    #[serde(rename = "readonly")]
    ReadOnly,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
            Role::ReadOnly => "readonly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "member" => Some(Role::Member),
            "readonly" => Some(Role::ReadOnly),
            _ => None,
        }
    }

    /// Can create/update/delete secrets.
    pub fn can_write(self) -> bool {
        !matches!(self, Role::ReadOnly)
    }

    /// Can invite and remove members, and delete the vault.
    pub fn can_manage_members(self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

/// Membership metadata. The member's wrapped CEK is deliberately absent;
/// `list_members` never hands wrapped keys around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub user_uuid: Uuid,
    /// Base64 X25519 public key. Immutable once recorded; key rotation
    /// means a new member record plus a CEK re-wrap.
    pub public_key: String,
    pub role: Role,
    pub added_at: DateTime<Utc>,
}

// ── Secrets ──────────────────────────────────────────────────────────────────

/// Secret metadata. Values only ever leave the store via `read_secret`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretInfo {
    pub id: Uuid,
    pub vault_id: Uuid,
    pub name: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Identity ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub uuid: Uuid,
    /// Base64 X25519 public key.
    pub public_key: String,
    pub keychain_backed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityStatus {
    pub has_identity: bool,
    pub locked: bool,
    /// Identity data exists but the keychain entry is unreadable. Distinct
    /// from `locked`: recovery needs the recovery secret or a reset.
    pub keychain_error: bool,
}

// ── Sharing ──────────────────────────────────────────────────────────────────

/// A vault-membership grant, handed to the recipient out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub vault_id: Uuid,
    pub recipient_uuid: Uuid,
    /// The vault CEK sealed to the recipient's public key.
    pub wrapped_cek: SealedEnvelope,
    pub role: Role,
    /// Where the recipient's client syncs the vault from.
    pub sync_url: String,
    /// Opaque bearer token for the sync endpoint.
    pub token: String,
}

/// Receipt for an ad-hoc credential share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareReceipt {
    pub share_id: Uuid,
    pub share_url: String,
}

/// A one-off credential handed to a known recipient, independent of any
/// vault membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareGrant {
    pub share_id: Uuid,
    pub recipient_uuid: Uuid,
    pub wrapped_payload: SealedEnvelope,
    pub created_at: DateTime<Utc>,
    /// Advisory; enforced by the retrieval endpoint, not locally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

// ── Sync ─────────────────────────────────────────────────────────────────────

/// Endpoint config for the opaque external blob/sync store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub base_url: String,
    pub token: String,
}

//! Sharing: one-off credential shares and vault membership.
//!
//! Two distinct flows, one sealing construction:
//! - `share_credential` hands a single payload to a known recipient's public
//!   key without granting any vault access.
//! - `invite_member` / `remove_member` manage who holds a wrap of a shared
//!   vault's CEK. Removal rotates the CEK: a new key is generated, every
//!   secret is re-encrypted under it, and fresh wraps go to the remaining
//!   members, all inside one transaction. The removed member's cached wrap
//!   still opens ciphertexts written before the rotation if they kept copies
//!   out-of-band; it is useless against anything written after.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use rand::RngCore;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use kf_crypto::{aead, keys::PublicKeyBytes, sealed, CryptoError};
use kf_proto::{Invite, MemberInfo, Role, ShareGrant, ShareReceipt, VaultKind};

use crate::db::{b64, b64d};
use crate::error::StoreError;
use crate::models::{MemberRow, ShareRow};
use crate::secrets::{secret_aad, split_blob};
use crate::service::Keyfold;
use crate::sync::BlobKind;

/// Decode a recipient key, rejecting anything that is not exactly 32 raw
/// bytes before any cryptographic operation runs.
fn decode_recipient_key(public_key_b64: &str) -> Result<PublicKeyBytes, StoreError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(public_key_b64.trim())
        .map_err(|_| StoreError::InvalidKeyLength { expected: 32, got: 0 })?;
    if bytes.len() != 32 {
        return Err(StoreError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        });
    }
    Ok(PublicKeyBytes(bytes))
}

fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl Keyfold {
    /// Seal a single credential to a recipient, independent of any vault.
    ///
    /// Expiry is advisory metadata for the retrieval endpoint; nothing here
    /// deletes the grant when it passes.
    pub async fn share_credential(
        &self,
        payload: &[u8],
        recipient_uuid: Uuid,
        recipient_public_key: &str,
        expires_in_hours: Option<u32>,
    ) -> Result<ShareReceipt, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let recipient_key = decode_recipient_key(recipient_public_key)?;
        let envelope = sealed::seal(&recipient_key, payload)?;
        let envelope_json = serde_json::to_string(&envelope)?;

        let share_id = Uuid::new_v4();
        let share_id_str = share_id.to_string();
        let now = Utc::now();
        let expires_at = expires_in_hours.map(|h| now + Duration::hours(i64::from(h)));

        sqlx::query(
            "INSERT INTO shares (id, recipient_uuid, wrapped_payload, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&share_id_str)
        .bind(recipient_uuid.to_string())
        .bind(&envelope_json)
        .bind(now)
        .bind(expires_at)
        .execute(&self.store.pool)
        .await?;

        self.mirror(BlobKind::Share, &share_id_str, envelope_json.as_bytes())
            .await;
        let share_url = self.blob_url(BlobKind::Share, &share_id_str).await?;

        info!(share = %share_id_str, recipient = %recipient_uuid, "credential sealed for recipient");

        Ok(ShareReceipt { share_id, share_url })
    }

    /// Outstanding ad-hoc shares, newest last.
    pub async fn list_shares(&self) -> Result<Vec<ShareGrant>, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let rows = sqlx::query_as::<_, ShareRow>("SELECT * FROM shares ORDER BY created_at")
            .fetch_all(&self.store.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(ShareGrant {
                    share_id: Uuid::parse_str(&row.id)
                        .map_err(|_| StoreError::NotFound("share uuid".into()))?,
                    recipient_uuid: Uuid::parse_str(&row.recipient_uuid)
                        .map_err(|_| StoreError::NotFound("share recipient uuid".into()))?,
                    wrapped_payload: serde_json::from_str(&row.wrapped_payload)?,
                    created_at: row.created_at,
                    expires_at: row.expires_at,
                })
            })
            .collect()
    }

    /// Drop a share locally and ask the blob store to forget it. A recipient
    /// who already fetched the blob keeps what they have.
    pub async fn revoke_share(&self, share_id: Uuid) -> Result<(), StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let share_id_str = share_id.to_string();
        let result = sqlx::query("DELETE FROM shares WHERE id = ?")
            .bind(&share_id_str)
            .execute(&self.store.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("share {share_id}")));
        }

        self.mirror_delete(BlobKind::Share, &share_id_str).await;
        info!(share = %share_id_str, "share revoked");
        Ok(())
    }

    /// Grant vault membership: wrap the current CEK to the recipient's key.
    /// Owner/admin only; shared vaults only; one owner per vault.
    pub async fn invite_member(
        &self,
        vault_id: Uuid,
        recipient_uuid: Uuid,
        recipient_public_key: &str,
        role: Role,
    ) -> Result<Invite, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let vault_id_str = vault_id.to_string();
        let vault = self.vault_row(&vault_id_str).await?;
        if vault.kind != VaultKind::Shared.as_str() {
            return Err(StoreError::Forbidden("private vaults cannot be shared".into()));
        }

        let caller_role = self.role_of_local(&vault_id_str).await?;
        if !caller_role.can_manage_members() {
            return Err(StoreError::Forbidden(
                "inviting members requires the owner or admin role".into(),
            ));
        }
        if role == Role::Owner {
            return Err(StoreError::Conflict("a vault has exactly one owner".into()));
        }

        let recipient_key = decode_recipient_key(recipient_public_key)?;
        let recipient_str = recipient_uuid.to_string();

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT user_uuid FROM members WHERE vault_id = ? AND user_uuid = ?")
                .bind(&vault_id_str)
                .bind(&recipient_str)
                .fetch_optional(&self.store.pool)
                .await?;
        if existing.is_some() {
            return Err(StoreError::Conflict(format!(
                "{recipient_uuid} is already a member of this vault"
            )));
        }

        // Adding a wrap races a concurrent rotation, so take the same lock
        // the writers do.
        let rotation = self.vault_locks.for_vault(&vault_id_str);
        let _guard = rotation.try_read().map_err(|_| StoreError::VaultBusy)?;

        let cek = self.vault_cek(&vault_id_str).await?;
        let wrap = sealed::seal_key32(&recipient_key, &cek)?;
        let wrap_json = serde_json::to_string(&wrap)?;

        sqlx::query(
            "INSERT INTO members (vault_id, user_uuid, public_key, role, wrapped_cek, added_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&vault_id_str)
        .bind(&recipient_str)
        .bind(recipient_key.to_b64())
        .bind(role.as_str())
        .bind(&wrap_json)
        .bind(Utc::now())
        .execute(&self.store.pool)
        .await?;

        self.mirror_vault_meta(&vault_id_str).await;

        info!(vault = %vault_id_str, recipient = %recipient_uuid, role = role.as_str(), "member invited");

        Ok(Invite {
            vault_id,
            recipient_uuid,
            wrapped_cek: wrap,
            role,
            sync_url: self.blob_url(BlobKind::VaultMeta, &vault_id_str).await?,
            token: new_token(),
        })
    }

    /// Current membership metadata. Any member may look; wrapped keys are
    /// never part of the answer.
    pub async fn list_members(&self, vault_id: Uuid) -> Result<Vec<MemberInfo>, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let vault_id_str = vault_id.to_string();
        self.vault_row(&vault_id_str).await?;
        self.role_of_local(&vault_id_str).await?;

        let rows = sqlx::query_as::<_, MemberRow>(
            "SELECT * FROM members WHERE vault_id = ? ORDER BY added_at",
        )
        .bind(&vault_id_str)
        .fetch_all(&self.store.pool)
        .await?;

        rows.iter().map(member_to_info).collect()
    }

    /// Remove a member and rotate the vault's CEK.
    ///
    /// Deleting the wrap alone is not enough: the removed member may hold a
    /// cached copy that would keep decrypting future writes. So removal
    /// generates a fresh CEK, re-encrypts every secret, re-wraps for every
    /// remaining member, and only then discards the old key, all in one
    /// transaction under the vault's exclusive rotation lock.
    pub async fn remove_member(&self, vault_id: Uuid, member_uuid: Uuid) -> Result<(), StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let vault_id_str = vault_id.to_string();
        let member_str = member_uuid.to_string();
        self.vault_row(&vault_id_str).await?;

        let caller_role = self.role_of_local(&vault_id_str).await?;
        if !caller_role.can_manage_members() {
            return Err(StoreError::Forbidden(
                "removing members requires the owner or admin role".into(),
            ));
        }

        let identity = self.identity_row().await?;
        if identity.id == member_str {
            return Err(StoreError::Forbidden(
                "leave the vault instead of removing yourself".into(),
            ));
        }

        let target = sqlx::query_as::<_, MemberRow>(
            "SELECT * FROM members WHERE vault_id = ? AND user_uuid = ?",
        )
        .bind(&vault_id_str)
        .bind(&member_str)
        .fetch_optional(&self.store.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("member {member_uuid}")))?;

        if target.role == Role::Owner.as_str() {
            return Err(StoreError::Forbidden("the owner cannot be removed".into()));
        }

        // Exclusive for the whole rotation; waits for in-flight writes to
        // drain, and new writes fail VaultBusy until commit.
        let rotation = self.vault_locks.for_vault(&vault_id_str);
        let _guard = rotation.write().await;

        let old_cek = self.vault_cek(&vault_id_str).await?;
        let mut new_cek = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut *new_cek);

        let mut tx = self.store.pool.begin().await?;

        let secrets: Vec<(String, String, String)> =
            sqlx::query_as("SELECT id, ciphertext, nonce FROM secrets WHERE vault_id = ?")
                .bind(&vault_id_str)
                .fetch_all(&mut *tx)
                .await?;

        for (secret_id, ciphertext, nonce) in &secrets {
            let aad = secret_aad(&vault_id_str, secret_id);
            let mut blob = b64d(nonce)?;
            blob.extend_from_slice(&b64d(ciphertext)?);

            let plaintext = aead::decrypt(&old_cek, &blob, &aad).map_err(|e| match e {
                CryptoError::AeadDecrypt => StoreError::DecryptionFailed,
                other => StoreError::Crypto(other),
            })?;

            let reblob = aead::encrypt(&new_cek, &plaintext, &aad)?;
            let (new_nonce, new_ct) = split_blob(&reblob);

            sqlx::query("UPDATE secrets SET ciphertext = ?, nonce = ? WHERE id = ?")
                .bind(b64(new_ct))
                .bind(b64(new_nonce))
                .bind(secret_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM members WHERE vault_id = ? AND user_uuid = ?")
            .bind(&vault_id_str)
            .bind(&member_str)
            .execute(&mut *tx)
            .await?;

        let remaining = sqlx::query_as::<_, MemberRow>("SELECT * FROM members WHERE vault_id = ?")
            .bind(&vault_id_str)
            .fetch_all(&mut *tx)
            .await?;

        for member in &remaining {
            let key = PublicKeyBytes::from_b64(&member.public_key)?;
            let wrap = sealed::seal_key32(&key, &new_cek)?;
            sqlx::query("UPDATE members SET wrapped_cek = ? WHERE vault_id = ? AND user_uuid = ?")
                .bind(serde_json::to_string(&wrap)?)
                .bind(&vault_id_str)
                .bind(&member.user_uuid)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE vaults SET cek_epoch = cek_epoch + 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(&vault_id_str)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        // Only after commit: a rollback must leave the old CEK live.
        self.session.put_cek(&vault_id_str, *new_cek).await?;
        self.mirror_vault_meta(&vault_id_str).await;

        info!(
            vault = %vault_id_str,
            removed = %member_uuid,
            secrets = secrets.len(),
            remaining = remaining.len(),
            "member removed; CEK rotated"
        );
        Ok(())
    }
}

pub(crate) fn member_info_rows(rows: &[MemberRow]) -> Result<Vec<MemberInfo>, StoreError> {
    rows.iter().map(member_to_info).collect()
}

fn member_to_info(row: &MemberRow) -> Result<MemberInfo, StoreError> {
    Ok(MemberInfo {
        user_uuid: Uuid::parse_str(&row.user_uuid)
            .map_err(|_| StoreError::NotFound("member uuid".into()))?,
        public_key: row.public_key.clone(),
        role: Role::parse(&row.role)
            .ok_or_else(|| StoreError::NotFound(format!("role {} unknown", row.role)))?,
        added_at: row.added_at,
    })
}

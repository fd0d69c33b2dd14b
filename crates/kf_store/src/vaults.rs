//! Vault records, membership lookups, and CEK custody.
//!
//! Every vault owns one symmetric content-encryption key. The CEK is
//! generated at creation, immediately sealed to the creator's public key,
//! and from then on only ever exists either wrapped inside member records
//! or unwrapped inside the session cache.

use std::collections::HashMap;

use chrono::Utc;
use rand::RngCore;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use kf_crypto::{keys::PublicKeyBytes, sealed};
use kf_proto::{Role, VaultInfo, VaultKind};

use crate::error::StoreError;
use crate::models::{MemberRow, VaultRow};
use crate::service::{Keyfold, SETTING_ACTIVE_VAULT};
use crate::sync::BlobKind;

impl Keyfold {
    /// Create a vault with a fresh random CEK, self-wrapped for the creating
    /// identity as the sole initial member (role=owner).
    pub async fn create_vault(&self, name: &str, kind: VaultKind) -> Result<VaultInfo, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let identity = self.identity_row().await?;
        let my_public = PublicKeyBytes::from_b64(&identity.public_key)?;

        let mut cek = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut *cek);

        let wrap = sealed::seal_key32(&my_public, &cek)?;
        let wrap_json = serde_json::to_string(&wrap)?;

        let vault_id = Uuid::new_v4();
        let vault_id_str = vault_id.to_string();
        let now = Utc::now();

        let mut tx = self.store.pool.begin().await?;
        sqlx::query(
            "INSERT INTO vaults (id, name, kind, cek_epoch, created_at, updated_at) VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(&vault_id_str)
        .bind(name)
        .bind(kind.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO members (vault_id, user_uuid, public_key, role, wrapped_cek, added_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&vault_id_str)
        .bind(&identity.id)
        .bind(&identity.public_key)
        .bind(Role::Owner.as_str())
        .bind(&wrap_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.session.put_cek(&vault_id_str, *cek).await?;

        if kind == VaultKind::Shared {
            self.mirror_vault_meta(&vault_id_str).await;
        }

        info!(vault = %vault_id_str, kind = kind.as_str(), "vault created");

        Ok(VaultInfo {
            id: vault_id,
            name: name.to_string(),
            kind,
            cek_epoch: 0,
            member_count: 1,
            created_at: now,
            updated_at: now,
        })
    }

    /// Delete a vault and everything in it. Owner/admin only; irreversible
    /// for the local index.
    pub async fn delete_vault(&self, vault_id: Uuid) -> Result<(), StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let vault_id_str = vault_id.to_string();
        let vault = self.vault_row(&vault_id_str).await?;
        let role = self.role_of_local(&vault_id_str).await?;
        if !role.can_manage_members() {
            return Err(StoreError::Forbidden(
                "deleting a vault requires the owner or admin role".into(),
            ));
        }

        // members and secrets cascade
        sqlx::query("DELETE FROM vaults WHERE id = ?")
            .bind(&vault_id_str)
            .execute(&self.store.pool)
            .await?;

        self.session.drop_cek(&vault_id_str).await;
        self.vault_locks.remove(&vault_id_str);

        if self.active_vault().await? == Some(vault_id) {
            self.delete_setting(SETTING_ACTIVE_VAULT).await?;
        }

        if vault.kind == VaultKind::Shared.as_str() {
            self.mirror_delete(BlobKind::VaultMeta, &vault_id_str).await;
        }

        info!(vault = %vault_id_str, "vault deleted");
        Ok(())
    }

    pub async fn list_vaults(&self) -> Result<Vec<VaultInfo>, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let rows = sqlx::query_as::<_, VaultRow>("SELECT * FROM vaults ORDER BY created_at")
            .fetch_all(&self.store.pool)
            .await?;

        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT vault_id, COUNT(*) FROM members GROUP BY vault_id")
                .fetch_all(&self.store.pool)
                .await?;
        let counts: HashMap<String, i64> = counts.into_iter().collect();

        rows.iter()
            .map(|row| row_to_info(row, *counts.get(&row.id).unwrap_or(&0)))
            .collect()
    }

    pub async fn get_vault(&self, vault_id: Uuid) -> Result<VaultInfo, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let vault_id_str = vault_id.to_string();
        let row = self.vault_row(&vault_id_str).await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM members WHERE vault_id = ?")
            .bind(&vault_id_str)
            .fetch_one(&self.store.pool)
            .await?;
        row_to_info(&row, count)
    }

    /// Remember which vault the UI is working in. `None` clears it.
    pub async fn set_active_vault(&self, vault_id: Option<Uuid>) -> Result<(), StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        match vault_id {
            Some(id) => {
                let id_str = id.to_string();
                self.vault_row(&id_str).await?;
                self.put_setting(SETTING_ACTIVE_VAULT, &id_str).await
            }
            None => self.delete_setting(SETTING_ACTIVE_VAULT).await,
        }
    }

    pub async fn active_vault(&self) -> Result<Option<Uuid>, StoreError> {
        match self.get_setting(SETTING_ACTIVE_VAULT).await? {
            Some(id) => Ok(Uuid::parse_str(&id).ok()),
            None => Ok(None),
        }
    }

    // ── Shared lookups ───────────────────────────────────────────────────────

    pub(crate) async fn vault_row(&self, vault_id: &str) -> Result<VaultRow, StoreError> {
        sqlx::query_as::<_, VaultRow>("SELECT * FROM vaults WHERE id = ?")
            .bind(vault_id)
            .fetch_optional(&self.store.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("vault {vault_id}")))
    }

    /// The local identity's role in a vault. `NotFound` covers both a
    /// missing vault and a missing membership.
    pub(crate) async fn role_of_local(&self, vault_id: &str) -> Result<Role, StoreError> {
        let identity = self.identity_row().await?;
        let row = sqlx::query_as::<_, MemberRow>(
            "SELECT * FROM members WHERE vault_id = ? AND user_uuid = ?",
        )
        .bind(vault_id)
        .bind(&identity.id)
        .fetch_optional(&self.store.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("membership in vault {vault_id}")))?;

        Role::parse(&row.role)
            .ok_or_else(|| StoreError::NotFound(format!("role {} unknown", row.role)))
    }

    /// Unwrap (or fetch from cache) the CEK for a vault. The unwrapped key is
    /// cached in the session until lock, rotation, or vault deletion.
    pub(crate) async fn vault_cek(&self, vault_id: &str) -> Result<Zeroizing<[u8; 32]>, StoreError> {
        self.require_unlocked().await?;

        if let Some(key) = self.session.cek_copy(vault_id).await? {
            return Ok(Zeroizing::new(key));
        }

        self.vault_row(vault_id).await?;
        let identity = self.identity_row().await?;
        let member = sqlx::query_as::<_, MemberRow>(
            "SELECT * FROM members WHERE vault_id = ? AND user_uuid = ?",
        )
        .bind(vault_id)
        .bind(&identity.id)
        .fetch_optional(&self.store.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("membership in vault {vault_id}")))?;

        let envelope =
            kf_crypto::sealed::SealedEnvelope::from_json_bytes(member.wrapped_cek.as_bytes())?;
        let key = self
            .session
            .with_identity(|id| {
                kf_crypto::sealed::open_key32(id, &envelope).map_err(StoreError::Crypto)
            })
            .await?;

        self.session.put_cek(vault_id, key).await?;
        Ok(Zeroizing::new(key))
    }

    /// Push the current member list (with wraps; all sealed) to the blob
    /// store so other members' devices can pick up membership changes.
    pub(crate) async fn mirror_vault_meta(&self, vault_id: &str) {
        let rows = match sqlx::query_as::<_, MemberRow>("SELECT * FROM members WHERE vault_id = ?")
            .bind(vault_id)
            .fetch_all(&self.store.pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(vault = vault_id, error = %e, "cannot mirror member list");
                return;
            }
        };
        match serde_json::to_vec(&rows) {
            Ok(bytes) => self.mirror(BlobKind::VaultMeta, vault_id, &bytes).await,
            Err(e) => tracing::warn!(vault = vault_id, error = %e, "cannot mirror member list"),
        }
    }
}

fn row_to_info(row: &VaultRow, member_count: i64) -> Result<VaultInfo, StoreError> {
    Ok(VaultInfo {
        id: Uuid::parse_str(&row.id).map_err(|_| StoreError::NotFound("vault uuid".into()))?,
        name: row.name.clone(),
        kind: VaultKind::parse(&row.kind)
            .ok_or_else(|| StoreError::NotFound(format!("vault kind {}", row.kind)))?,
        cek_epoch: row.cek_epoch.max(0) as u64,
        member_count: member_count.max(0) as u64,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

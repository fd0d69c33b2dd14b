//! Secret values, AEAD-encrypted under their vault's CEK.
//!
//! The associated data binds (vault id, secret id) into the authentication
//! tag, so a ciphertext moved into another row or another vault fails to
//! authenticate even for a holder of the same CEK. A fresh random nonce is
//! generated on every write; updates replace ciphertext+nonce in place and
//! keep no history.
//!
//! Writes take the vault's rotation lock in read mode: while a member
//! removal is re-encrypting the vault, concurrent writes fail fast with
//! `VaultBusy` instead of racing the rotation.

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

use kf_crypto::{aead, CryptoError};
use kf_proto::SecretInfo;

use crate::db::{b64, b64d};
use crate::error::StoreError;
use crate::models::SecretRow;
use crate::service::Keyfold;

/// AAD for one secret slot: domain tag + vault id + secret id, NUL-separated.
pub(crate) fn secret_aad(vault_id: &str, secret_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(13 + vault_id.len() + 1 + secret_id.len());
    aad.extend_from_slice(b"kf-secret-v1\x00");
    aad.extend_from_slice(vault_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(secret_id.as_bytes());
    aad
}

/// Split the aead wire format (nonce || ct+tag) into storable columns.
pub(crate) fn split_blob(blob: &[u8]) -> (&[u8], &[u8]) {
    blob.split_at(aead::NONCE_LEN)
}

impl Keyfold {
    pub async fn create_secret(
        &self,
        vault_id: Uuid,
        name: &str,
        category: &str,
        value: &[u8],
    ) -> Result<SecretInfo, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let vault_id_str = vault_id.to_string();
        self.vault_row(&vault_id_str).await?;
        let role = self.role_of_local(&vault_id_str).await?;
        if !role.can_write() {
            return Err(StoreError::Forbidden(
                "writing secrets requires more than the readonly role".into(),
            ));
        }

        let rotation = self.vault_locks.for_vault(&vault_id_str);
        let _guard = rotation.try_read().map_err(|_| StoreError::VaultBusy)?;

        let cek = self.vault_cek(&vault_id_str).await?;
        let secret_id = Uuid::new_v4();
        let secret_id_str = secret_id.to_string();

        let blob = aead::encrypt(&cek, value, &secret_aad(&vault_id_str, &secret_id_str))?;
        let (nonce, ct) = split_blob(&blob);
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO secrets (id, vault_id, name, category, ciphertext, nonce, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&secret_id_str)
        .bind(&vault_id_str)
        .bind(name)
        .bind(category)
        .bind(b64(ct))
        .bind(b64(nonce))
        .bind(now)
        .bind(now)
        .execute(&self.store.pool)
        .await?;

        debug!(vault = %vault_id_str, secret = %secret_id_str, "secret created");

        Ok(SecretInfo {
            id: secret_id,
            vault_id,
            name: name.to_string(),
            category: category.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Decrypt one secret value. Fails closed with `DecryptionFailed` on any
    /// tag mismatch; garbled plaintext is never returned.
    pub async fn read_secret(&self, secret_id: Uuid) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let row = self.secret_row(&secret_id.to_string()).await?;
        self.role_of_local(&row.vault_id).await?;

        let rotation = self.vault_locks.for_vault(&row.vault_id);
        let _guard = rotation.try_read().map_err(|_| StoreError::VaultBusy)?;

        let cek = self.vault_cek(&row.vault_id).await?;

        let mut blob = b64d(&row.nonce)?;
        blob.extend_from_slice(&b64d(&row.ciphertext)?);

        aead::decrypt(&cek, &blob, &secret_aad(&row.vault_id, &row.id)).map_err(|e| match e {
            CryptoError::AeadDecrypt => StoreError::DecryptionFailed,
            other => StoreError::Crypto(other),
        })
    }

    pub async fn get_secret(&self, secret_id: Uuid) -> Result<SecretInfo, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let row = self.secret_row(&secret_id.to_string()).await?;
        self.role_of_local(&row.vault_id).await?;
        row_to_info(&row)
    }

    pub async fn list_secrets(&self, vault_id: Uuid) -> Result<Vec<SecretInfo>, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let vault_id_str = vault_id.to_string();
        self.vault_row(&vault_id_str).await?;
        self.role_of_local(&vault_id_str).await?;

        let rows = sqlx::query_as::<_, SecretRow>(
            "SELECT * FROM secrets WHERE vault_id = ? ORDER BY created_at",
        )
        .bind(&vault_id_str)
        .fetch_all(&self.store.pool)
        .await?;

        rows.iter().map(row_to_info).collect()
    }

    /// Replace a secret's value. Ciphertext and nonce swap together in a
    /// single UPDATE; there is no history to keep.
    pub async fn update_secret(&self, secret_id: Uuid, value: &[u8]) -> Result<SecretInfo, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let row = self.secret_row(&secret_id.to_string()).await?;
        let role = self.role_of_local(&row.vault_id).await?;
        if !role.can_write() {
            return Err(StoreError::Forbidden(
                "writing secrets requires more than the readonly role".into(),
            ));
        }

        let rotation = self.vault_locks.for_vault(&row.vault_id);
        let _guard = rotation.try_read().map_err(|_| StoreError::VaultBusy)?;

        let cek = self.vault_cek(&row.vault_id).await?;
        let blob = aead::encrypt(&cek, value, &secret_aad(&row.vault_id, &row.id))?;
        let (nonce, ct) = split_blob(&blob);
        let now = Utc::now();

        sqlx::query("UPDATE secrets SET ciphertext = ?, nonce = ?, updated_at = ? WHERE id = ?")
            .bind(b64(ct))
            .bind(b64(nonce))
            .bind(now)
            .bind(&row.id)
            .execute(&self.store.pool)
            .await?;

        Ok(SecretInfo {
            id: secret_id,
            vault_id: Uuid::parse_str(&row.vault_id)
                .map_err(|_| StoreError::NotFound("vault uuid".into()))?,
            name: row.name,
            category: row.category,
            created_at: row.created_at,
            updated_at: now,
        })
    }

    pub async fn delete_secret(&self, secret_id: Uuid) -> Result<(), StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let row = self.secret_row(&secret_id.to_string()).await?;
        let role = self.role_of_local(&row.vault_id).await?;
        if !role.can_write() {
            return Err(StoreError::Forbidden(
                "deleting secrets requires more than the readonly role".into(),
            ));
        }

        let rotation = self.vault_locks.for_vault(&row.vault_id);
        let _guard = rotation.try_read().map_err(|_| StoreError::VaultBusy)?;

        sqlx::query("DELETE FROM secrets WHERE id = ?")
            .bind(&row.id)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn secret_row(&self, secret_id: &str) -> Result<SecretRow, StoreError> {
        sqlx::query_as::<_, SecretRow>("SELECT * FROM secrets WHERE id = ?")
            .bind(secret_id)
            .fetch_optional(&self.store.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("secret {secret_id}")))
    }
}

fn row_to_info(row: &SecretRow) -> Result<SecretInfo, StoreError> {
    Ok(SecretInfo {
        id: Uuid::parse_str(&row.id).map_err(|_| StoreError::NotFound("secret uuid".into()))?,
        vault_id: Uuid::parse_str(&row.vault_id)
            .map_err(|_| StoreError::NotFound("vault uuid".into()))?,
        name: row.name.clone(),
        category: row.category.clone(),
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

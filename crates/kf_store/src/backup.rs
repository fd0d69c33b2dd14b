//! Portable encrypted backup: export, preview, import.
//!
//! The bundle is a JSON wrapper around two ciphertexts (see
//! kf_proto::backup). Keys are derived per file:
//!
//!   master      = Argon2id(export password, salt)
//!   header key  = HKDF(master, "kf-backup-header")
//!   payload key = HKDF(master, "kf-backup-payload")
//!
//! The header decrypts on its own, so `preview_backup` catches a wrong
//! password cheaply and never materialises a secret value. The payload AAD
//! binds the BLAKE3 hash of the header ciphertext; the two halves of a file
//! cannot be recombined across bundles.
//!
//! Import replaces the whole local vault index and must be all-or-nothing:
//! everything is decrypted and validated up front, the swap happens inside
//! one transaction, and the session cache is touched only after commit.

use std::path::Path;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::RngCore;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use kf_crypto::{aead, kdf, keychain, keys::IdentityKeyPair, sealed, CryptoError};
use kf_proto::backup::{
    BackupFile, BackupHeader, BackupPayload, BackupPreview, IdentityExport, SecretExport,
    VaultExport, BACKUP_MAGIC, BACKUP_VERSION,
};
use kf_proto::VaultKind;

use crate::db::{b64, b64d};
use crate::error::StoreError;
use crate::identity::IDENTITY_AAD;
use crate::models::{MemberRow, SecretRow, VaultRow};
use crate::secrets::{secret_aad, split_blob};
use crate::service::{Keyfold, SETTING_SYNC_CONFIG};
use crate::sharing::member_info_rows;

const HEADER_AAD: &[u8] = b"kf-backup-header-v1";
const PAYLOAD_AAD_PREFIX: &[u8] = b"kf-backup-payload-v1";

struct BundleKeys {
    header: Zeroizing<[u8; 32]>,
    payload: Zeroizing<[u8; 32]>,
}

fn bundle_keys(password: &str, salt: &[u8; 16]) -> Result<BundleKeys, StoreError> {
    let master = kdf::unlock_key_from_password(password.as_bytes(), salt)?;
    let mut header = Zeroizing::new([0u8; 32]);
    let mut payload = Zeroizing::new([0u8; 32]);
    kdf::hkdf_expand(&master.0, None, b"kf-backup-header", &mut *header)?;
    kdf::hkdf_expand(&master.0, None, b"kf-backup-payload", &mut *payload)?;
    Ok(BundleKeys { header, payload })
}

/// Fresh salt + Argon2id seal key for re-protecting a restored identity.
fn password_seal(password: &str) -> Result<(kdf::UnlockKey, String), StoreError> {
    let salt = kdf::generate_salt();
    let derived = kdf::unlock_key_from_password(password.as_bytes(), &salt)?;
    Ok((derived, hex::encode(salt)))
}

/// AAD that chains the payload to its header ciphertext.
fn payload_aad(header_ct: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(PAYLOAD_AAD_PREFIX.len() + 32);
    aad.extend_from_slice(PAYLOAD_AAD_PREFIX);
    aad.extend_from_slice(blake3::hash(header_ct).as_bytes());
    aad
}

fn parse_bundle(bytes: &[u8]) -> Result<(BackupFile, [u8; 16]), StoreError> {
    let file: BackupFile = serde_json::from_slice(bytes)
        .map_err(|_| StoreError::CorruptBackup("not a backup file".into()))?;
    if file.magic != BACKUP_MAGIC {
        return Err(StoreError::CorruptBackup("wrong magic".into()));
    }
    if file.version != BACKUP_VERSION {
        return Err(StoreError::CorruptBackup(format!(
            "unsupported version {}",
            file.version
        )));
    }
    let salt: [u8; 16] = hex::decode(&file.salt)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::CorruptBackup("bad salt".into()))?;
    Ok((file, salt))
}

fn decrypt_header(file: &BackupFile, keys: &BundleKeys) -> Result<BackupHeader, StoreError> {
    let header_ct = b64d(&file.header).map_err(|_| StoreError::CorruptBackup("bad header".into()))?;
    let header_json = aead::decrypt(&keys.header, &header_ct, HEADER_AAD).map_err(|e| match e {
        CryptoError::AeadDecrypt => StoreError::InvalidPassword,
        other => StoreError::Crypto(other),
    })?;
    serde_json::from_slice(&header_json)
        .map_err(|_| StoreError::CorruptBackup("header does not parse".into()))
}

impl Keyfold {
    /// Export the full local state into a password-protected bundle at
    /// `path`. Requires an unlocked session (CEKs and secret values have to
    /// be unwrapped to become portable).
    pub async fn export_backup(
        &self,
        path: &Path,
        export_password: &str,
    ) -> Result<BackupHeader, StoreError> {
        let _state = self.state_lock.read().await;
        self.require_unlocked().await?;

        let identity = self.identity_row().await?;
        let identity_secret = self
            .session
            .with_identity(|id| Ok(*id.secret_bytes()))
            .await?;

        let sync = self.sync_config().await?;

        let vault_rows = sqlx::query_as::<_, VaultRow>("SELECT * FROM vaults ORDER BY created_at")
            .fetch_all(&self.store.pool)
            .await?;

        let mut vaults = Vec::with_capacity(vault_rows.len());
        let mut secret_count: u64 = 0;

        for vault in &vault_rows {
            let cek = self.vault_cek(&vault.id).await?;

            let member_rows =
                sqlx::query_as::<_, MemberRow>("SELECT * FROM members WHERE vault_id = ? ORDER BY added_at")
                    .bind(&vault.id)
                    .fetch_all(&self.store.pool)
                    .await?;
            let members = member_info_rows(&member_rows)?;

            let secret_rows = sqlx::query_as::<_, SecretRow>(
                "SELECT * FROM secrets WHERE vault_id = ? ORDER BY created_at",
            )
            .bind(&vault.id)
            .fetch_all(&self.store.pool)
            .await?;

            let mut secrets = Vec::with_capacity(secret_rows.len());
            for row in &secret_rows {
                let mut blob = b64d(&row.nonce)?;
                blob.extend_from_slice(&b64d(&row.ciphertext)?);
                let value = aead::decrypt(&cek, &blob, &secret_aad(&vault.id, &row.id))
                    .map_err(|e| match e {
                        CryptoError::AeadDecrypt => StoreError::DecryptionFailed,
                        other => StoreError::Crypto(other),
                    })?;
                secrets.push(SecretExport {
                    id: Uuid::parse_str(&row.id)
                        .map_err(|_| StoreError::NotFound("secret uuid".into()))?,
                    name: row.name.clone(),
                    category: row.category.clone(),
                    value: URL_SAFE_NO_PAD.encode(&*value),
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                });
            }
            secret_count += secrets.len() as u64;

            vaults.push(VaultExport {
                id: Uuid::parse_str(&vault.id)
                    .map_err(|_| StoreError::NotFound("vault uuid".into()))?,
                name: vault.name.clone(),
                kind: VaultKind::parse(&vault.kind)
                    .ok_or_else(|| StoreError::NotFound(format!("vault kind {}", vault.kind)))?,
                cek: URL_SAFE_NO_PAD.encode(*cek),
                cek_epoch: vault.cek_epoch.max(0) as u64,
                members,
                secrets,
                created_at: vault.created_at,
            });
        }

        let header = BackupHeader {
            exported_at: Utc::now(),
            vault_count: vaults.len() as u64,
            secret_count,
            has_sync_config: sync.is_some(),
        };
        let payload = BackupPayload {
            identity: IdentityExport {
                uuid: Uuid::parse_str(&identity.id)
                    .map_err(|_| StoreError::NotFound("identity uuid".into()))?,
                public_key: identity.public_key.clone(),
                secret_key: URL_SAFE_NO_PAD.encode(identity_secret),
                keychain_backed: identity.keychain_backed,
            },
            sync,
            vaults,
        };

        let mut salt = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let keys = bundle_keys(export_password, &salt)?;

        let header_ct = aead::encrypt(&keys.header, &serde_json::to_vec(&header)?, HEADER_AAD)?;
        let payload_ct = aead::encrypt(
            &keys.payload,
            &serde_json::to_vec(&payload)?,
            &payload_aad(&header_ct),
        )?;

        let file = BackupFile {
            magic: BACKUP_MAGIC.to_string(),
            version: BACKUP_VERSION,
            salt: hex::encode(salt),
            header: b64(&header_ct),
            payload: b64(&payload_ct),
        };

        // Stage-and-rename so a crash mid-write never leaves a torn bundle.
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&staging, path)?;

        info!(
            path = %path.display(),
            vaults = header.vault_count,
            secrets = header.secret_count,
            "backup exported"
        );
        Ok(header)
    }

    /// Decrypt only the bundle header: counts, timestamp, sync flag. A wrong
    /// password fails here without any per-secret work.
    pub async fn preview_backup(
        &self,
        path: &Path,
        export_password: &str,
    ) -> Result<BackupPreview, StoreError> {
        let _state = self.state_lock.read().await;

        let bytes = std::fs::read(path)?;
        let (file, salt) = parse_bundle(&bytes)?;
        let keys = bundle_keys(export_password, &salt)?;
        let header = decrypt_header(&file, &keys)?;
        Ok(header.into())
    }

    /// Replace the local identity/vault state with the bundle's contents.
    ///
    /// Exclusive over the whole service state. CEKs are re-wrapped for the
    /// local identity's public key; the bundle's own wraps are never reused.
    /// When no local identity exists the bundle's identity is rehydrated,
    /// keychain-sealed or re-derived from `master_password` depending on how
    /// the original was protected.
    pub async fn import_backup(
        &self,
        path: &Path,
        export_password: &str,
        master_password: Option<&str>,
    ) -> Result<(), StoreError> {
        let _state = self.state_lock.write().await;

        let bytes = std::fs::read(path)?;
        let (file, salt) = parse_bundle(&bytes)?;
        let keys = bundle_keys(export_password, &salt)?;
        let header = decrypt_header(&file, &keys)?;

        let header_ct = b64d(&file.header)?;
        let payload_ct =
            b64d(&file.payload).map_err(|_| StoreError::CorruptBackup("bad payload".into()))?;
        let payload_json = aead::decrypt(&keys.payload, &payload_ct, &payload_aad(&header_ct))
            .map_err(|e| match e {
                CryptoError::AeadDecrypt => {
                    StoreError::CorruptBackup("payload does not match header".into())
                }
                other => StoreError::Crypto(other),
            })?;
        let payload: BackupPayload = serde_json::from_slice(&payload_json)
            .map_err(|_| StoreError::CorruptBackup("payload does not parse".into()))?;

        // ── Resolve the local identity (no mutations yet) ────────────────────
        let existing = self.identity_row_opt().await?;
        let bundle_uuid = payload.identity.uuid;

        struct LocalIdentity {
            uuid: String,
            public_key: String,
            secret: [u8; 32],
            /// Row to insert when rehydrating from the bundle.
            insert: Option<(String, Option<String>, bool)>, // (secret_enc, kdf_salt, keychain_backed)
        }

        let local = match existing {
            Some(row) => {
                // An existing identity stays the root of trust; it must be
                // unlocked so the re-wraps are for a key the user can use.
                let secret = self
                    .session
                    .with_identity(|id| Ok(*id.secret_bytes()))
                    .await?;
                LocalIdentity {
                    uuid: row.id,
                    public_key: row.public_key,
                    secret,
                    insert: None,
                }
            }
            None => {
                let secret_bytes = URL_SAFE_NO_PAD
                    .decode(&payload.identity.secret_key)
                    .map_err(|_| StoreError::CorruptBackup("bad identity secret".into()))?;
                let pair = IdentityKeyPair::from_bytes(&secret_bytes)
                    .map_err(|_| StoreError::CorruptBackup("bad identity secret".into()))?;
                if pair.public_b64() != payload.identity.public_key {
                    return Err(StoreError::CorruptBackup(
                        "identity keypair is inconsistent".into(),
                    ));
                }

                let uuid = bundle_uuid.to_string();
                let mut seal_key = Zeroizing::new([0u8; 32]);
                let (kdf_salt, keychain_backed) = if payload.identity.keychain_backed {
                    rand::rngs::OsRng.fill_bytes(&mut *seal_key);
                    match keychain::store_seal_key(&uuid, &seal_key) {
                        Ok(()) => (None, true),
                        // The original convenience mode is unavailable here;
                        // fall back to a master password when one was given.
                        Err(e) => match master_password {
                            Some(password) => {
                                let (derived, salt_hex) = password_seal(password)?;
                                seal_key.copy_from_slice(&derived.0);
                                (Some(salt_hex), false)
                            }
                            None => return Err(StoreError::KeychainUnavailable(e.to_string())),
                        },
                    }
                } else {
                    let password = master_password.ok_or(StoreError::InvalidPassword)?;
                    let (derived, salt_hex) = password_seal(password)?;
                    seal_key.copy_from_slice(&derived.0);
                    (Some(salt_hex), false)
                };

                let secret_enc =
                    b64(&aead::encrypt(&seal_key, pair.secret_bytes(), IDENTITY_AAD)?);
                LocalIdentity {
                    uuid,
                    public_key: pair.public_b64(),
                    secret: *pair.secret_bytes(),
                    insert: Some((secret_enc, kdf_salt, keychain_backed)),
                }
            }
        };

        // ── Pre-compute all rows so nothing can fail mid-transaction ─────────
        struct VaultRows {
            vault: (String, String, String, i64, chrono::DateTime<Utc>),
            members: Vec<(String, String, String, String, chrono::DateTime<Utc>)>,
            secrets: Vec<(String, String, String, String, String, chrono::DateTime<Utc>, chrono::DateTime<Utc>)>,
            cek: Zeroizing<[u8; 32]>,
        }

        let mut staged = Vec::with_capacity(payload.vaults.len());
        for vault in &payload.vaults {
            let cek_bytes = URL_SAFE_NO_PAD
                .decode(&vault.cek)
                .map_err(|_| StoreError::CorruptBackup("bad vault key".into()))?;
            let cek: Zeroizing<[u8; 32]> = Zeroizing::new(
                cek_bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::CorruptBackup("bad vault key".into()))?,
            );

            let vault_id = vault.id.to_string();

            // Map the bundle's identity onto the local one; everyone else
            // keeps their recorded key and gets a locally computed wrap.
            let mut members: Vec<(String, String, String, String, chrono::DateTime<Utc>)> =
                Vec::with_capacity(vault.members.len());
            for m in &vault.members {
                let (user_uuid, public_key) = if m.user_uuid == bundle_uuid {
                    (local.uuid.clone(), local.public_key.clone())
                } else {
                    (m.user_uuid.to_string(), m.public_key.clone())
                };
                if members.iter().any(|(u, ..)| *u == user_uuid) {
                    continue;
                }
                let key = kf_crypto::keys::PublicKeyBytes::from_b64(&public_key)
                    .map_err(|_| StoreError::CorruptBackup("bad member key".into()))?;
                let wrap = sealed::seal_key32(&key, &cek)?;
                members.push((
                    user_uuid,
                    public_key,
                    m.role.as_str().to_string(),
                    serde_json::to_string(&wrap)?,
                    m.added_at,
                ));
            }
            if !members.iter().any(|(u, ..)| *u == local.uuid) {
                // Bundles always carry their own identity as a member; a
                // file violating that would leave an unusable vault.
                return Err(StoreError::CorruptBackup(
                    "bundle identity is not a vault member".into(),
                ));
            }

            let mut secrets = Vec::with_capacity(vault.secrets.len());
            for s in &vault.secrets {
                let value = URL_SAFE_NO_PAD
                    .decode(&s.value)
                    .map_err(|_| StoreError::CorruptBackup("bad secret value".into()))?;
                let secret_id = s.id.to_string();
                let blob = aead::encrypt(&cek, &value, &secret_aad(&vault_id, &secret_id))?;
                let (nonce, ct) = split_blob(&blob);
                secrets.push((
                    secret_id,
                    s.name.clone(),
                    s.category.clone(),
                    b64(ct),
                    b64(nonce),
                    s.created_at,
                    s.updated_at,
                ));
            }

            staged.push(VaultRows {
                vault: (
                    vault_id,
                    vault.name.clone(),
                    vault.kind.as_str().to_string(),
                    vault.cek_epoch as i64,
                    vault.created_at,
                ),
                members,
                secrets,
                cek,
            });
        }

        // ── The destructive swap, all-or-nothing ─────────────────────────────
        let mut tx = self.store.pool.begin().await?;

        sqlx::query("DELETE FROM shares").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM secrets").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM members").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM vaults").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM settings").execute(&mut *tx).await?;

        if let Some((secret_enc, kdf_salt, keychain_backed)) = &local.insert {
            sqlx::query(
                "INSERT INTO identity (id, public_key, secret_enc, kdf_salt, keychain_backed, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&local.uuid)
            .bind(&local.public_key)
            .bind(secret_enc)
            .bind(kdf_salt)
            .bind(keychain_backed)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        let now = Utc::now();
        for rows in &staged {
            let (id, name, kind, cek_epoch, created_at) = &rows.vault;
            sqlx::query(
                "INSERT INTO vaults (id, name, kind, cek_epoch, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(name)
            .bind(kind)
            .bind(cek_epoch)
            .bind(created_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            for (user_uuid, public_key, role, wrapped_cek, added_at) in &rows.members {
                sqlx::query(
                    "INSERT INTO members (vault_id, user_uuid, public_key, role, wrapped_cek, added_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(id)
                .bind(user_uuid)
                .bind(public_key)
                .bind(role)
                .bind(wrapped_cek)
                .bind(added_at)
                .execute(&mut *tx)
                .await?;
            }

            for (sid, name, category, ciphertext, nonce, created_at, updated_at) in &rows.secrets {
                sqlx::query(
                    "INSERT INTO secrets (id, vault_id, name, category, ciphertext, nonce, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(sid)
                .bind(id)
                .bind(name)
                .bind(category)
                .bind(ciphertext)
                .bind(nonce)
                .bind(created_at)
                .bind(updated_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        if let Some(sync) = &payload.sync {
            sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?)")
                .bind(SETTING_SYNC_CONFIG)
                .bind(serde_json::to_string(sync)?)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        // Only after commit: the session reflects the new root of trust.
        self.session.unlock_with(local.secret).await;
        self.session.clear_ceks().await;
        for rows in &staged {
            self.session.put_cek(&rows.vault.0, *rows.cek).await?;
        }

        info!(
            vaults = header.vault_count,
            secrets = header.secret_count,
            "backup imported; vault index replaced"
        );
        Ok(())
    }
}

//! Identity lifecycle: create, import, unlock, lock, state, reset.
//!
//! The identity secret is sealed at rest under one of two seal keys:
//! - keychain path: a random 32-byte key held by the OS credential store;
//!   unlock needs no password entry.
//! - password path: Argon2id of the user's password with a stored salt.
//!
//! State machine: NoIdentity -> (init) -> Unlocked; Unlocked <-> Locked via
//! lock/unlock; a broken keychain entry surfaces as `keychain_error` in
//! `check_state` and is recovered via `import_identity` (recovery secret) or
//! `reset` (destroys local identity and vault index, never remote data).

use chrono::Utc;
use rand::RngCore;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use kf_crypto::{aead, kdf, keychain, keys::IdentityKeyPair, CryptoError};
use kf_proto::{IdentityInfo, IdentityStatus};

use crate::db::{b64, b64d};
use crate::error::StoreError;
use crate::models::IdentityRow;
use crate::service::Keyfold;

/// Binds the sealed identity secret to its purpose.
pub(crate) const IDENTITY_AAD: &[u8] = b"kf-identity-v1";

/// How the seal key is produced for a new or re-imported identity.
enum SealKeySource {
    Keychain,
    Password { salt_hex: String },
}

impl Keyfold {
    /// Create this installation's identity.
    ///
    /// Without a password the seal key goes to the OS keychain and unlock is
    /// automatic; with a password the seal key is derived via Argon2id.
    /// Leaves the session unlocked.
    pub async fn init_identity(&self, password: Option<&str>) -> Result<IdentityInfo, StoreError> {
        let _state = self.state_lock.read().await;

        if self.identity_row_opt().await?.is_some() {
            return Err(StoreError::AlreadyInitialized);
        }

        let identity = IdentityKeyPair::generate();
        let uuid = Uuid::new_v4();

        let info = self
            .persist_identity(&identity, uuid, password, "identity initialised")
            .await?;
        Ok(info)
    }

    /// Reconstruct the identity from a recovery secret. Used when the
    /// keychain entry is gone or the identity is moving to a new install.
    pub async fn import_identity(
        &self,
        recovery_key: &str,
        password: Option<&str>,
    ) -> Result<IdentityInfo, StoreError> {
        let _state = self.state_lock.read().await;

        let identity = IdentityKeyPair::from_recovery_string(recovery_key)
            .map_err(|_| StoreError::InvalidRecoveryKey)?;

        // An existing identity record pins the expected public key: importing
        // a different keypair would orphan every wrapped CEK.
        let uuid = match self.identity_row_opt().await? {
            Some(row) => {
                if row.public_key != identity.public_b64() {
                    return Err(StoreError::InvalidRecoveryKey);
                }
                Uuid::parse_str(&row.id).map_err(|_| StoreError::InvalidRecoveryKey)?
            }
            None => Uuid::new_v4(),
        };

        let info = self
            .persist_identity(&identity, uuid, password, "identity imported from recovery key")
            .await?;
        Ok(info)
    }

    /// Seal and persist an identity record, then unlock the session.
    async fn persist_identity(
        &self,
        identity: &IdentityKeyPair,
        uuid: Uuid,
        password: Option<&str>,
        log_line: &str,
    ) -> Result<IdentityInfo, StoreError> {
        let uuid_str = uuid.to_string();

        let mut seal_key = Zeroizing::new([0u8; 32]);
        let source = match password {
            Some(pw) => {
                let salt = kdf::generate_salt();
                let derived = kdf::unlock_key_from_password(pw.as_bytes(), &salt)?;
                seal_key.copy_from_slice(&derived.0);
                SealKeySource::Password {
                    salt_hex: hex::encode(salt),
                }
            }
            None => {
                rand::rngs::OsRng.fill_bytes(&mut *seal_key);
                keychain::store_seal_key(&uuid_str, &seal_key)
                    .map_err(|e| StoreError::KeychainUnavailable(e.to_string()))?;
                SealKeySource::Keychain
            }
        };

        let secret_enc = b64(&aead::encrypt(&seal_key, identity.secret_bytes(), IDENTITY_AAD)?);
        let (kdf_salt, keychain_backed) = match &source {
            SealKeySource::Keychain => (None, true),
            SealKeySource::Password { salt_hex } => (Some(salt_hex.clone()), false),
        };

        sqlx::query(
            "INSERT INTO identity (id, public_key, secret_enc, kdf_salt, keychain_backed, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET secret_enc = excluded.secret_enc, \
             kdf_salt = excluded.kdf_salt, keychain_backed = excluded.keychain_backed",
        )
        .bind(&uuid_str)
        .bind(identity.public_b64())
        .bind(&secret_enc)
        .bind(&kdf_salt)
        .bind(keychain_backed)
        .bind(Utc::now())
        .execute(&self.store.pool)
        .await?;

        self.session.unlock_with(*identity.secret_bytes()).await;
        self.session.clear_ceks().await;

        info!(uuid = %uuid_str, keychain_backed, "{log_line}");

        Ok(IdentityInfo {
            uuid,
            public_key: identity.public_b64(),
            keychain_backed,
        })
    }

    /// Unseal the identity secret and cache it in the session.
    ///
    /// Returns `false` on a wrong password; a keychain-backed identity whose
    /// keyring entry is unreadable fails with `KeychainUnavailable` instead
    /// (that state is recoverable, not a bad credential).
    pub async fn unlock(&self, password: Option<&str>) -> Result<bool, StoreError> {
        let _state = self.state_lock.read().await;

        let row = self.identity_row_opt().await?.ok_or(StoreError::NoIdentity)?;

        let seal_key: Zeroizing<[u8; 32]> = if row.keychain_backed {
            match keychain::retrieve_seal_key(&row.id) {
                Ok(Some(key)) => Zeroizing::new(key),
                Ok(None) => {
                    return Err(StoreError::KeychainUnavailable(
                        "keychain entry for this identity is missing".into(),
                    ))
                }
                Err(e) => return Err(StoreError::KeychainUnavailable(e.to_string())),
            }
        } else {
            let password = match password {
                Some(p) => p,
                None => return Ok(false),
            };
            let salt_hex = row
                .kdf_salt
                .as_deref()
                .ok_or_else(|| StoreError::NotFound("identity kdf salt".into()))?;
            let salt: [u8; 16] = hex::decode(salt_hex)
                .ok()
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| StoreError::NotFound("identity kdf salt".into()))?;
            let derived = kdf::unlock_key_from_password(password.as_bytes(), &salt)?;
            Zeroizing::new(derived.0)
        };

        match aead::decrypt(&seal_key, &b64d(&row.secret_enc)?, IDENTITY_AAD) {
            Ok(secret) => {
                let arr: [u8; 32] = secret
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::DecryptionFailed)?;
                self.session.unlock_with(arr).await;
                Ok(true)
            }
            Err(CryptoError::AeadDecrypt) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Zeroize all cached key material. Vault and secret operations fail
    /// with `Locked` until the next successful unlock.
    pub async fn lock(&self) {
        self.session.lock().await;
    }

    pub async fn check_state(&self) -> Result<IdentityStatus, StoreError> {
        let row = match self.identity_row_opt().await? {
            Some(row) => row,
            None => {
                return Ok(IdentityStatus {
                    has_identity: false,
                    locked: true,
                    keychain_error: false,
                })
            }
        };

        let locked = self.session.is_locked().await;
        let keychain_error = row.keychain_backed
            && locked
            && !matches!(keychain::retrieve_seal_key(&row.id), Ok(Some(_)));

        Ok(IdentityStatus {
            has_identity: true,
            locked,
            keychain_error,
        })
    }

    /// The portable recovery secret. Show it once; never log it.
    pub async fn recovery_key(&self) -> Result<String, StoreError> {
        let _state = self.state_lock.read().await;
        self.session
            .with_identity(|id| Ok(id.to_recovery_string()))
            .await
    }

    pub async fn identity_info(&self) -> Result<IdentityInfo, StoreError> {
        let row = self.identity_row().await?;
        row_to_info(&row)
    }

    /// Destroy the local identity, vault index, and keychain entry.
    /// Remote shared data is untouched; other members keep their wraps.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let _state = self.state_lock.write().await;

        if let Some(row) = self.identity_row_opt().await? {
            // Best-effort: a broken keychain must not block the reset path.
            let _ = keychain::delete_seal_key(&row.id);
        }

        // Children before parents.
        sqlx::query("DELETE FROM shares").execute(&self.store.pool).await?;
        sqlx::query("DELETE FROM secrets").execute(&self.store.pool).await?;
        sqlx::query("DELETE FROM members").execute(&self.store.pool).await?;
        sqlx::query("DELETE FROM vaults").execute(&self.store.pool).await?;
        sqlx::query("DELETE FROM settings").execute(&self.store.pool).await?;
        sqlx::query("DELETE FROM identity").execute(&self.store.pool).await?;

        self.session.lock().await;
        info!("local identity and vault index destroyed");
        Ok(())
    }
}

pub(crate) fn row_to_info(row: &IdentityRow) -> Result<IdentityInfo, StoreError> {
    Ok(IdentityInfo {
        uuid: Uuid::parse_str(&row.id).map_err(|_| StoreError::NotFound("identity uuid".into()))?,
        public_key: row.public_key.clone(),
        keychain_backed: row.keychain_backed,
    })
}

//! The Keyfold service object.
//!
//! Owns the open store, the unlocked-session key cache, the per-vault
//! rotation locks, and the sync backend. Construct one at startup and pass
//! the handle to callers; there are no ambient globals. Locking or resetting
//! tears the key material down without touching the handle itself.
//!
//! Locking discipline:
//! - `state_lock` read-guards every operation; `import_backup` and `reset`
//!   take it in write mode (they replace the root of trust).
//! - `vault_locks` hands out one rotation lock per vault: secret writes take
//!   it in read mode (fail-fast `VaultBusy`), a member removal holds write
//!   for the whole re-encrypt + re-wrap transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;
use tracing::warn;

use kf_proto::SyncConfig;

use crate::db::Store;
use crate::error::StoreError;
use crate::models::IdentityRow;
use crate::session::Session;
use crate::sync::{BlobKind, NullSync, SyncBackend};

pub(crate) const SETTING_SYNC_CONFIG: &str = "sync.config";
pub(crate) const SETTING_ACTIVE_VAULT: &str = "vault.active";

/// Per-vault rotation locks, created lazily.
#[derive(Clone, Default)]
pub(crate) struct VaultLocks {
    inner: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
}

impl VaultLocks {
    pub(crate) fn for_vault(&self, vault_id: &str) -> Arc<RwLock<()>> {
        let mut map = self.inner.lock().expect("vault lock registry poisoned");
        map.entry(vault_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub(crate) fn remove(&self, vault_id: &str) {
        let mut map = self.inner.lock().expect("vault lock registry poisoned");
        map.remove(vault_id);
    }
}

/// Service handle. Clone to share across tasks.
#[derive(Clone)]
pub struct Keyfold {
    pub(crate) store: Store,
    pub(crate) session: Session,
    pub(crate) vault_locks: VaultLocks,
    pub(crate) state_lock: Arc<RwLock<()>>,
    pub(crate) sync: Arc<dyn SyncBackend>,
}

impl Keyfold {
    /// Open (or create) the local store at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let store = Store::open(db_path).await?;
        Ok(Self {
            store,
            session: Session::new(),
            vault_locks: VaultLocks::default(),
            state_lock: Arc::new(RwLock::new(())),
            sync: Arc::new(NullSync),
        })
    }

    /// Replace the sync backend (the embedding app wires a real transport).
    pub fn with_sync(mut self, sync: Arc<dyn SyncBackend>) -> Self {
        self.sync = sync;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    pub(crate) async fn require_unlocked(&self) -> Result<(), StoreError> {
        if self.session.is_locked().await {
            Err(StoreError::Locked)
        } else {
            Ok(())
        }
    }

    pub(crate) async fn identity_row_opt(&self) -> Result<Option<IdentityRow>, StoreError> {
        let row = sqlx::query_as::<_, IdentityRow>("SELECT * FROM identity LIMIT 1")
            .fetch_optional(&self.store.pool)
            .await?;
        Ok(row)
    }

    pub(crate) async fn identity_row(&self) -> Result<IdentityRow, StoreError> {
        self.identity_row_opt().await?.ok_or(StoreError::NoIdentity)
    }

    pub(crate) async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.store.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub(crate) async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(value)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn delete_setting(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    /// Mirror a blob to the external store. Best-effort: the remote store's
    /// availability is out of our hands, so failures only log.
    pub(crate) async fn mirror(&self, kind: BlobKind, id: &str, bytes: &[u8]) {
        if let Err(e) = self.sync.put_blob(kind, id, bytes).await {
            warn!(kind = kind.as_str(), id, error = %e, "sync mirror failed; continuing locally");
        }
    }

    pub(crate) async fn mirror_delete(&self, kind: BlobKind, id: &str) {
        if let Err(e) = self.sync.delete_blob(kind, id).await {
            warn!(kind = kind.as_str(), id, error = %e, "sync delete failed; continuing locally");
        }
    }

    // ── Sync configuration ───────────────────────────────────────────────────

    pub async fn set_sync_config(&self, config: Option<SyncConfig>) -> Result<(), StoreError> {
        let _state = self.state_lock.read().await;
        match config {
            Some(cfg) => {
                let json = serde_json::to_string(&cfg)?;
                self.put_setting(SETTING_SYNC_CONFIG, &json).await
            }
            None => self.delete_setting(SETTING_SYNC_CONFIG).await,
        }
    }

    pub async fn sync_config(&self) -> Result<Option<SyncConfig>, StoreError> {
        match self.get_setting(SETTING_SYNC_CONFIG).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// URL a recipient uses to fetch a mirrored blob. Falls back to an
    /// app-scheme URL when no sync endpoint is configured.
    pub(crate) async fn blob_url(&self, kind: BlobKind, id: &str) -> Result<String, StoreError> {
        Ok(match self.sync_config().await? {
            Some(cfg) => format!("{}/{}/{}", cfg.base_url.trim_end_matches('/'), kind.as_str(), id),
            None => format!("keyfold://{}/{}", kind.as_str(), id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::VaultLocks;

    #[tokio::test]
    async fn rotation_lock_excludes_writers() {
        let locks = VaultLocks::default();

        let lock = locks.for_vault("v1");
        let exclusive = lock.write().await;

        // Writers fail fast while a rotation holds the vault.
        let same = locks.for_vault("v1");
        assert!(same.try_read().is_err());

        // Other vaults are unaffected.
        let other = locks.for_vault("v2");
        assert!(other.try_read().is_ok());

        drop(exclusive);
        assert!(locks.for_vault("v1").try_read().is_ok());
    }

    #[tokio::test]
    async fn readers_share_the_lock() {
        let locks = VaultLocks::default();
        let lock_a = locks.for_vault("v1");
        let lock_b = locks.for_vault("v1");
        let a = lock_a.try_read().unwrap();
        let b = lock_b.try_read().unwrap();
        drop((a, b));
    }
}

//! In-memory decrypted key material with an explicit lifecycle.
//!
//! A `Session` holds the identity secret and any vault CEKs that have been
//! unwrapped so far. It is populated by a successful unlock, cleared by
//! `lock()` (or process exit), and never written anywhere. Locking drops the
//! inner structure, which wipes every key via ZeroizeOnDrop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use kf_crypto::keys::IdentityKeyPair;

use crate::error::StoreError;

/// An unwrapped content-encryption key. Wiped when evicted or when the
/// session locks.
#[derive(ZeroizeOnDrop)]
struct Cek([u8; 32]);

#[derive(ZeroizeOnDrop)]
struct SessionKeys {
    identity_secret: [u8; 32],
    #[zeroize(skip)]
    ceks: HashMap<String, Cek>,
}

/// Thread-safe session handle. Clone to share across tasks.
#[derive(Clone)]
pub struct Session {
    inner: Arc<RwLock<Option<SessionKeys>>>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Populate the session with a decrypted identity secret.
    /// Replaces (and wipes) any previous key material.
    pub async fn unlock_with(&self, secret: [u8; 32]) {
        let mut guard = self.inner.write().await;
        *guard = Some(SessionKeys {
            identity_secret: secret,
            ceks: HashMap::new(),
        });
    }

    /// Lock the session, zeroizing the identity secret and all cached CEKs.
    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.read().await.is_none()
    }

    /// Run `f` with the identity keypair. Fails with `Locked` when no
    /// session is active; the keypair never escapes the closure.
    pub async fn with_identity<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&IdentityKeyPair) -> Result<R, StoreError>,
    {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(keys) => {
                let pair =
                    IdentityKeyPair::from_bytes(&keys.identity_secret).map_err(StoreError::Crypto)?;
                f(&pair)
            }
            None => Err(StoreError::Locked),
        }
    }

    /// Cached CEK for a vault, if one has been unwrapped this session.
    pub async fn cek_copy(&self, vault_id: &str) -> Result<Option<[u8; 32]>, StoreError> {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(keys) => Ok(keys.ceks.get(vault_id).map(|c| c.0)),
            None => Err(StoreError::Locked),
        }
    }

    pub async fn put_cek(&self, vault_id: &str, key: [u8; 32]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        match guard.as_mut() {
            Some(keys) => {
                keys.ceks.insert(vault_id.to_string(), Cek(key));
                Ok(())
            }
            None => Err(StoreError::Locked),
        }
    }

    /// Evict one vault's CEK (vault deleted, or rotation superseded it).
    /// A locked session is already empty, so this never fails.
    pub async fn drop_cek(&self, vault_id: &str) {
        let mut guard = self.inner.write().await;
        if let Some(keys) = guard.as_mut() {
            keys.ceks.remove(vault_id);
        }
    }

    pub async fn clear_ceks(&self) {
        let mut guard = self.inner.write().await;
        if let Some(keys) = guard.as_mut() {
            keys.ceks.clear();
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_unlock_lifecycle() {
        let session = Session::new();
        assert!(session.is_locked().await);
        assert!(matches!(
            session.with_identity(|_| Ok(())).await,
            Err(StoreError::Locked)
        ));

        let pair = IdentityKeyPair::generate();
        session.unlock_with(*pair.secret_bytes()).await;
        assert!(!session.is_locked().await);

        let public = session
            .with_identity(|id| Ok(id.public_b64()))
            .await
            .unwrap();
        assert_eq!(public, pair.public_b64());

        session.put_cek("vault-1", [7u8; 32]).await.unwrap();
        assert_eq!(session.cek_copy("vault-1").await.unwrap(), Some([7u8; 32]));

        session.lock().await;
        assert!(session.is_locked().await);
        assert!(session.cek_copy("vault-1").await.is_err());
    }

    #[tokio::test]
    async fn cek_cache_eviction() {
        let session = Session::new();
        session.unlock_with([1u8; 32]).await;
        session.put_cek("a", [2u8; 32]).await.unwrap();
        session.put_cek("b", [3u8; 32]).await.unwrap();

        session.drop_cek("a").await;
        assert_eq!(session.cek_copy("a").await.unwrap(), None);
        assert_eq!(session.cek_copy("b").await.unwrap(), Some([3u8; 32]));

        session.clear_ceks().await;
        assert_eq!(session.cek_copy("b").await.unwrap(), None);
    }
}

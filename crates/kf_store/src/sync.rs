//! Seam to the external blob/sync store.
//!
//! Wrapped vault material (member lists, CEK wraps) and sealed share blobs
//! are mirrored to an opaque remote store reachable by id; retrieval and
//! expiry enforcement happen there. Only the trait lives here. Transport,
//! replication, and availability are the embedding application's problem;
//! mirror failures are logged and never fail the local operation.

use async_trait::async_trait;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    /// A sealed one-off credential share.
    Share,
    /// A shared vault's member list and CEK wraps.
    VaultMeta,
}

impl BlobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BlobKind::Share => "shares",
            BlobKind::VaultMeta => "vaults",
        }
    }
}

#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn put_blob(&self, kind: BlobKind, id: &str, bytes: &[u8]) -> Result<(), StoreError>;

    async fn delete_blob(&self, kind: BlobKind, id: &str) -> Result<(), StoreError>;
}

/// Default backend: keeps everything local. Stand-in until the embedding
/// app wires a real transport.
pub struct NullSync;

#[async_trait]
impl SyncBackend for NullSync {
    async fn put_blob(&self, _kind: BlobKind, _id: &str, _bytes: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_blob(&self, _kind: BlobKind, _id: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

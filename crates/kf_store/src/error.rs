use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Identity is locked; unlock first")]
    Locked,

    #[error("An identity already exists on this installation")]
    AlreadyInitialized,

    #[error("No identity on this installation")]
    NoIdentity,

    #[error("Recovery key is malformed or does not match this identity")]
    InvalidRecoveryKey,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("OS keychain unavailable: {0}")]
    KeychainUnavailable(String),

    #[error("Recipient public key must decode to {expected} raw bytes (got {got})")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Corrupt backup: {0}")]
    CorruptBackup(String),

    #[error("Vault is busy with a key rotation; retry shortly")]
    VaultBusy,

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] kf_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

//! OS keychain integration.
//!
//! Keychain-backed identities keep a random 32-byte seal key in the
//! platform credential store (macOS Keychain, Windows Credential Manager,
//! Secret Service on Linux); unlocking then needs no password entry.
//!
//! A missing entry is reported as `Ok(None)`, not an error: the caller
//! distinguishes "no keychain entry" (recoverable via the recovery secret)
//! from "the credential store itself is unreachable".

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use keyring::Entry;

use crate::error::CryptoError;

const SERVICE_NAME: &str = "Keyfold";
const SEAL_KEY_ENTRY: &str = "identity_seal_key";

fn entry(identity_uuid: &str) -> Result<Entry, CryptoError> {
    Entry::new(SERVICE_NAME, &format!("{SEAL_KEY_ENTRY}:{identity_uuid}"))
        .map_err(|e| CryptoError::Keychain(e.to_string()))
}

/// Store the identity seal key for this installation.
pub fn store_seal_key(identity_uuid: &str, key: &[u8; 32]) -> Result<(), CryptoError> {
    let encoded = URL_SAFE_NO_PAD.encode(key);
    entry(identity_uuid)?
        .set_password(&encoded)
        .map_err(|e| CryptoError::Keychain(e.to_string()))
}

/// Retrieve the identity seal key. `Ok(None)` when no entry exists.
pub fn retrieve_seal_key(identity_uuid: &str) -> Result<Option<[u8; 32]>, CryptoError> {
    let encoded = match entry(identity_uuid)?.get_password() {
        Ok(encoded) => encoded,
        Err(keyring::Error::NoEntry) => return Ok(None),
        Err(e) => return Err(CryptoError::Keychain(e.to_string())),
    };
    let bytes = URL_SAFE_NO_PAD.decode(encoded)?;
    let key: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Keychain("stored seal key has wrong length".into()))?;
    Ok(Some(key))
}

/// Delete the identity seal key. Missing entries are not an error.
pub fn delete_seal_key(identity_uuid: &str) -> Result<(), CryptoError> {
    match entry(identity_uuid)?.delete_password() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(CryptoError::Keychain(e.to_string())),
    }
}

/// Whether this platform ships a credential store we know how to talk to.
/// An actual store/retrieve can still fail at runtime (locked keyring,
/// missing Secret Service daemon); callers treat that as recoverable.
pub fn keychain_available() -> bool {
    cfg!(any(target_os = "linux", target_os = "windows", target_os = "macos"))
}

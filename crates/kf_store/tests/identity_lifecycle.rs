mod common;

use common::{open_initialised, open_service, PASSWORD};
use kf_store::StoreError;

#[tokio::test]
async fn init_then_lock_unlock_cycle() {
    let (_dir, service) = open_initialised().await;

    let state = service.check_state().await.unwrap();
    assert!(state.has_identity);
    assert!(!state.locked);
    assert!(!state.keychain_error);

    service.lock().await;
    assert!(service.check_state().await.unwrap().locked);

    // Wrong password is a boolean false, never an error.
    assert!(!service.unlock(Some("nope")).await.unwrap());
    assert!(service.check_state().await.unwrap().locked);

    // Missing password on a password-derived identity is the same.
    assert!(!service.unlock(None).await.unwrap());

    assert!(service.unlock(Some(PASSWORD)).await.unwrap());
    assert!(!service.check_state().await.unwrap().locked);
}

#[tokio::test]
async fn second_init_is_rejected() {
    let (_dir, service) = open_initialised().await;
    assert!(matches!(
        service.init_identity(Some("other")).await,
        Err(StoreError::AlreadyInitialized)
    ));
}

#[tokio::test]
async fn no_identity_state_and_unlock() {
    let (_dir, service) = open_service().await;

    let state = service.check_state().await.unwrap();
    assert!(!state.has_identity);
    assert!(state.locked);

    assert!(matches!(
        service.unlock(Some(PASSWORD)).await,
        Err(StoreError::NoIdentity)
    ));
}

#[tokio::test]
async fn recovery_key_restores_the_same_identity() {
    let (_dir, service) = open_initialised().await;
    let original = service.identity_info().await.unwrap();
    let recovery = service.recovery_key().await.unwrap();

    // A fresh install, fed only the recovery secret.
    let (_dir2, restored) = open_service().await;
    let imported = restored
        .import_identity(&recovery, Some("new password"))
        .await
        .unwrap();
    assert_eq!(imported.public_key, original.public_key);
    assert!(!restored.check_state().await.unwrap().locked);

    // And it unlocks with the new password after a lock.
    restored.lock().await;
    assert!(restored.unlock(Some("new password")).await.unwrap());
}

#[tokio::test]
async fn import_rejects_garbage_and_mismatched_keys() {
    let (_dir, service) = open_initialised().await;

    assert!(matches!(
        service.import_identity("definitely not a key", Some(PASSWORD)).await,
        Err(StoreError::InvalidRecoveryKey)
    ));

    // A valid recovery string for a different keypair cannot replace an
    // existing identity: every wrapped CEK would be orphaned.
    let stranger = kf_crypto::keys::IdentityKeyPair::generate();
    assert!(matches!(
        service
            .import_identity(&stranger.to_recovery_string(), Some(PASSWORD))
            .await,
        Err(StoreError::InvalidRecoveryKey)
    ));
}

#[tokio::test]
async fn recovery_key_requires_unlocked_session() {
    let (_dir, service) = open_initialised().await;
    service.lock().await;
    assert!(matches!(
        service.recovery_key().await,
        Err(StoreError::Locked)
    ));
}

#[tokio::test]
async fn reset_destroys_identity_and_vault_index() {
    let (_dir, service) = open_initialised().await;
    let vault = service
        .create_vault("Work", kf_proto::VaultKind::Private)
        .await
        .unwrap();
    service
        .create_secret(vault.id, "db", "password", b"s3cr3t")
        .await
        .unwrap();

    service.reset().await.unwrap();

    let state = service.check_state().await.unwrap();
    assert!(!state.has_identity);
    assert!(state.locked);

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vaults")
        .fetch_one(&service.store().pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM secrets")
        .fetch_one(&service.store().pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

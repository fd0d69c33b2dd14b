mod common;

use common::open_initialised;
use kf_crypto::keys::IdentityKeyPair;
use kf_crypto::sealed::{self, SealedEnvelope};
use kf_proto::{Role, VaultKind};
use kf_store::{Keyfold, StoreError};
use uuid::Uuid;

/// Rebuild the associated data for one secret slot (mirrors the store's
/// binding of vault id + secret id into the tag).
fn secret_aad(vault_id: &Uuid, secret_id: &Uuid) -> Vec<u8> {
    let mut aad = Vec::new();
    aad.extend_from_slice(b"kf-secret-v1\x00");
    aad.extend_from_slice(vault_id.to_string().as_bytes());
    aad.push(0);
    aad.extend_from_slice(secret_id.to_string().as_bytes());
    aad
}

/// Fetch a secret row and try to decrypt it with a raw CEK.
async fn decrypt_row_with(
    service: &Keyfold,
    vault_id: &Uuid,
    secret_id: &Uuid,
    cek: &[u8; 32],
) -> Result<Vec<u8>, kf_crypto::CryptoError> {
    let (ct, nonce): (String, String) =
        sqlx::query_as("SELECT ciphertext, nonce FROM secrets WHERE id = ?")
            .bind(secret_id.to_string())
            .fetch_one(&service.store().pool)
            .await
            .unwrap();

    let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let mut blob = base64::Engine::decode(engine, &nonce).unwrap();
    blob.extend_from_slice(&base64::Engine::decode(engine, &ct).unwrap());

    kf_crypto::aead::decrypt(cek, &blob, &secret_aad(vault_id, secret_id)).map(|z| z.to_vec())
}

async fn set_local_role(service: &Keyfold, vault_id: &Uuid, role: &str) {
    sqlx::query(
        "UPDATE members SET role = ? WHERE vault_id = ? AND user_uuid = (SELECT id FROM identity)",
    )
    .bind(role)
    .bind(vault_id.to_string())
    .execute(&service.store().pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn shared_credential_opens_only_for_the_recipient() {
    let (_dir, service) = open_initialised().await;

    let recipient = IdentityKeyPair::generate();
    let receipt = service
        .share_credential(b"hunter2", Uuid::new_v4(), &recipient.public_b64(), Some(24))
        .await
        .unwrap();
    assert!(receipt.share_url.contains(&receipt.share_id.to_string()));

    let (wrapped, expires): (String, Option<String>) =
        sqlx::query_as("SELECT wrapped_payload, expires_at FROM shares WHERE id = ?")
            .bind(receipt.share_id.to_string())
            .fetch_one(&service.store().pool)
            .await
            .unwrap();
    assert!(expires.is_some());

    let envelope: SealedEnvelope = serde_json::from_str(&wrapped).unwrap();
    assert_eq!(&*sealed::open(&recipient, &envelope).unwrap(), b"hunter2");

    let stranger = IdentityKeyPair::generate();
    assert!(sealed::open(&stranger, &envelope).is_err());

    // The grant shows up in the listing and can be revoked exactly once.
    let grants = service.list_shares().await.unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].share_id, receipt.share_id);
    assert!(grants[0].expires_at.is_some());

    service.revoke_share(receipt.share_id).await.unwrap();
    assert!(service.list_shares().await.unwrap().is_empty());
    assert!(matches!(
        service.revoke_share(receipt.share_id).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn recipient_keys_are_validated_before_any_crypto() {
    let (_dir, service) = open_initialised().await;

    let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let short = base64::Engine::encode(engine, [0u8; 16]);
    assert!(matches!(
        service
            .share_credential(b"x", Uuid::new_v4(), &short, None)
            .await,
        Err(StoreError::InvalidKeyLength { expected: 32, got: 16 })
    ));

    assert!(matches!(
        service
            .share_credential(b"x", Uuid::new_v4(), "!!not-base64!!", None)
            .await,
        Err(StoreError::InvalidKeyLength { expected: 32, .. })
    ));
}

#[tokio::test]
async fn private_vaults_cannot_be_shared() {
    let (_dir, service) = open_initialised().await;
    let vault = service.create_vault("Personal", VaultKind::Private).await.unwrap();

    let bob = IdentityKeyPair::generate();
    assert!(matches!(
        service
            .invite_member(vault.id, Uuid::new_v4(), &bob.public_b64(), Role::Member)
            .await,
        Err(StoreError::Forbidden(_))
    ));
}

#[tokio::test]
async fn invite_wraps_the_live_cek_for_the_recipient() {
    let (_dir, service) = open_initialised().await;
    let vault = service.create_vault("Team", VaultKind::Shared).await.unwrap();
    let secret = service
        .create_secret(vault.id, "api", "token", b"tok_123")
        .await
        .unwrap();

    let bob = IdentityKeyPair::generate();
    let bob_uuid = Uuid::new_v4();
    let invite = service
        .invite_member(vault.id, bob_uuid, &bob.public_b64(), Role::Member)
        .await
        .unwrap();
    assert_eq!(invite.role, Role::Member);
    assert!(!invite.token.is_empty());

    // Bob's wrap recovers the CEK that decrypts the vault's secrets.
    let cek = sealed::open_key32(&bob, &invite.wrapped_cek).unwrap();
    let value = decrypt_row_with(&service, &vault.id, &secret.id, &cek)
        .await
        .unwrap();
    assert_eq!(value, b"tok_123");

    let members = service.list_members(vault.id).await.unwrap();
    assert_eq!(members.len(), 2);
    let bob_entry = members.iter().find(|m| m.user_uuid == bob_uuid).unwrap();
    assert_eq!(bob_entry.role, Role::Member);
    assert_eq!(bob_entry.public_key, bob.public_b64());
}

#[tokio::test]
async fn duplicate_members_and_second_owners_conflict() {
    let (_dir, service) = open_initialised().await;
    let vault = service.create_vault("Team", VaultKind::Shared).await.unwrap();

    let bob = IdentityKeyPair::generate();
    let bob_uuid = Uuid::new_v4();
    service
        .invite_member(vault.id, bob_uuid, &bob.public_b64(), Role::Member)
        .await
        .unwrap();

    assert!(matches!(
        service
            .invite_member(vault.id, bob_uuid, &bob.public_b64(), Role::Admin)
            .await,
        Err(StoreError::Conflict(_))
    ));

    let carol = IdentityKeyPair::generate();
    assert!(matches!(
        service
            .invite_member(vault.id, Uuid::new_v4(), &carol.public_b64(), Role::Owner)
            .await,
        Err(StoreError::Conflict(_))
    ));
}

#[tokio::test]
async fn member_and_readonly_roles_cannot_manage_membership() {
    let (_dir, service) = open_initialised().await;
    let vault = service.create_vault("Team", VaultKind::Shared).await.unwrap();

    let bob = IdentityKeyPair::generate();
    let bob_uuid = Uuid::new_v4();
    service
        .invite_member(vault.id, bob_uuid, &bob.public_b64(), Role::Member)
        .await
        .unwrap();

    for demoted in ["member", "readonly"] {
        set_local_role(&service, &vault.id, demoted).await;

        let carol = IdentityKeyPair::generate();
        assert!(matches!(
            service
                .invite_member(vault.id, Uuid::new_v4(), &carol.public_b64(), Role::Member)
                .await,
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            service.remove_member(vault.id, bob_uuid).await,
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            service.delete_vault(vault.id).await,
            Err(StoreError::Forbidden(_))
        ));
    }

    // A member can still write secrets; readonly cannot.
    set_local_role(&service, &vault.id, "member").await;
    let secret = service
        .create_secret(vault.id, "note", "password", b"ok")
        .await
        .unwrap();

    set_local_role(&service, &vault.id, "readonly").await;
    assert!(matches!(
        service.create_secret(vault.id, "nope", "password", b"x").await,
        Err(StoreError::Forbidden(_))
    ));
    assert!(matches!(
        service.update_secret(secret.id, b"x").await,
        Err(StoreError::Forbidden(_))
    ));
    assert!(matches!(
        service.delete_secret(secret.id).await,
        Err(StoreError::Forbidden(_))
    ));
    // Reading stays allowed.
    assert_eq!(&*service.read_secret(secret.id).await.unwrap(), b"ok");
}

#[tokio::test]
async fn removal_rotates_the_cek_and_rewraps_for_the_rest() {
    let (_dir, service) = open_initialised().await;
    let vault = service.create_vault("Team", VaultKind::Shared).await.unwrap();
    let before = service
        .create_secret(vault.id, "old", "password", b"written-before")
        .await
        .unwrap();

    let bob = IdentityKeyPair::generate();
    let bob_uuid = Uuid::new_v4();
    let invite = service
        .invite_member(vault.id, bob_uuid, &bob.public_b64(), Role::Member)
        .await
        .unwrap();

    // Bob squirrels his unwrapped CEK away before being removed.
    let exfiltrated_cek = sealed::open_key32(&bob, &invite.wrapped_cek).unwrap();
    assert!(decrypt_row_with(&service, &vault.id, &before.id, &exfiltrated_cek)
        .await
        .is_ok());

    service.remove_member(vault.id, bob_uuid).await.unwrap();

    // Membership record and wrap are gone, epoch is bumped.
    let members = service.list_members(vault.id).await.unwrap();
    assert_eq!(members.len(), 1);
    assert!(members.iter().all(|m| m.user_uuid != bob_uuid));
    assert_eq!(service.get_vault(vault.id).await.unwrap().cek_epoch, 1);

    // The cached old CEK is useless against anything in the vault now:
    // existing secrets were re-encrypted under the new key...
    assert!(decrypt_row_with(&service, &vault.id, &before.id, &exfiltrated_cek)
        .await
        .is_err());

    // ...and newly written secrets never touch the old key.
    let after = service
        .create_secret(vault.id, "new", "password", b"written-after")
        .await
        .unwrap();
    assert!(decrypt_row_with(&service, &vault.id, &after.id, &exfiltrated_cek)
        .await
        .is_err());

    // The remaining member still reads everything through the service.
    assert_eq!(
        &*service.read_secret(before.id).await.unwrap(),
        b"written-before"
    );
    assert_eq!(
        &*service.read_secret(after.id).await.unwrap(),
        b"written-after"
    );
}

#[tokio::test]
async fn owner_and_self_are_protected_from_removal() {
    let (_dir, service) = open_initialised().await;
    let vault = service.create_vault("Team", VaultKind::Shared).await.unwrap();
    let me = service.identity_info().await.unwrap();

    // The sole member is the owner, and also the caller.
    assert!(matches!(
        service.remove_member(vault.id, me.uuid).await,
        Err(StoreError::Forbidden(_))
    ));

    assert!(matches!(
        service.remove_member(vault.id, Uuid::new_v4()).await,
        Err(StoreError::NotFound(_))
    ));

    // An admin cannot take out the owner either.
    let bob = IdentityKeyPair::generate();
    let bob_uuid = Uuid::new_v4();
    service
        .invite_member(vault.id, bob_uuid, &bob.public_b64(), Role::Admin)
        .await
        .unwrap();
    // Swap local roles so the caller is the admin and the owner is someone else.
    sqlx::query("UPDATE members SET role = 'admin' WHERE vault_id = ? AND user_uuid = (SELECT id FROM identity)")
        .bind(vault.id.to_string())
        .execute(&service.store().pool)
        .await
        .unwrap();
    sqlx::query("UPDATE members SET role = 'owner' WHERE vault_id = ? AND user_uuid = ?")
        .bind(vault.id.to_string())
        .bind(bob_uuid.to_string())
        .execute(&service.store().pool)
        .await
        .unwrap();

    assert!(matches!(
        service.remove_member(vault.id, bob_uuid).await,
        Err(StoreError::Forbidden(_))
    ));
}
